mod decode;
mod encode;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::{Error, Result};
use crate::host::LevelHost;
use crate::loader::Loader;

pub use decode::{load, LoadReport};
pub use encode::serialize;

pub(crate) mod tag {
    pub const ENTITY: &str = "entity";
    pub const SCRIPT: &str = "script";
    pub const ENTITY_REF: &str = "entity_ref";
    pub const MAP: &str = "map";
    pub const VEC2: &str = "vec2";
    pub const VEC3: &str = "vec3";
    pub const VEC4: &str = "vec4";
    pub const QUAT: &str = "quat";
    pub const SCRIPT_CLS: &str = "script_cls";
    pub const ENTITY_CLS: &str = "entity_cls";
}

pub const SCRIPTS_FIELD: &str = "scripts";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelDocument {
    #[serde(default)]
    pub entities: JsonMap<String, JsonValue>,
    #[serde(default)]
    pub scripts: Vec<ClassRefRecord>,
    #[serde(default)]
    pub entity_classes: Vec<ClassRefRecord>,
    /// Feature tables (`models`, `audio`, ...): path to display name.
    #[serde(flatten)]
    pub assets: BTreeMap<String, BTreeMap<String, Option<String>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRefRecord {
    pub kind: String,
    pub class_unit: String,
    pub class_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub kind: String,
    pub class_unit: String,
    pub class_name: String,
    #[serde(flatten)]
    pub fields: JsonMap<String, JsonValue>,
}

impl ObjectRecord {
    pub(crate) fn parse(raw: &JsonValue, context: &str) -> Result<Self> {
        let JsonValue::Object(map) = raw else {
            return Err(Error::Malformed(format!("{context}: record must be an object")));
        };
        match map.get("kind") {
            Some(JsonValue::String(kind)) if kind == tag::ENTITY || kind == tag::SCRIPT => {}
            Some(JsonValue::String(kind)) if decode::is_known_tag(kind) => {
                return Err(Error::Malformed(format!("{context}: '{kind}' value where a record was expected")));
            }
            Some(JsonValue::String(kind)) => return Err(Error::UnknownTag { tag: kind.clone() }),
            _ => return Err(Error::Malformed(format!("{context}: record has no string 'kind'"))),
        }
        serde_json::from_value(raw.clone()).map_err(|err| Error::Malformed(format!("{context}: {err}")))
    }
}

impl LevelDocument {
    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json_string(&self, pretty: bool) -> Result<String> {
        Ok(if pretty { serde_json::to_string_pretty(self)? } else { serde_json::to_string(self)? })
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
        Self::from_json_str(&text)
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>, pretty: bool) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| Error::io(parent, err))?;
        }
        let json = self.to_json_string(pretty)?;
        fs::write(path, json.as_bytes()).map_err(|err| Error::io(path, err))
    }

    pub fn entity_ids(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    /// Checks the document without loading any class: record shapes, tags, id uniqueness and
    /// that every entity reference points at an entity earlier in the document.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for (index, class_ref) in self.scripts.iter().chain(&self.entity_classes).enumerate() {
            if class_ref.kind != tag::SCRIPT_CLS && class_ref.kind != tag::ENTITY_CLS {
                problems.push(format!("class table entry {index}: unknown tag '{}'", class_ref.kind));
            }
            if class_ref.class_unit.is_empty() || class_ref.class_name.is_empty() {
                problems.push(format!("class table entry {index}: empty class reference"));
            }
        }

        let mut seen: BTreeSet<String> = BTreeSet::new();
        for (key, raw) in &self.entities {
            let context = format!("entity '{key}'");
            let record = match ObjectRecord::parse(raw, &context) {
                Ok(record) => record,
                Err(err) => {
                    problems.push(err.to_string());
                    continue;
                }
            };
            if record.kind != tag::ENTITY {
                problems.push(format!("{context}: top-level record tagged '{}'", record.kind));
            }
            let id = match record.fields.get("id") {
                Some(JsonValue::String(id)) => {
                    if id != key {
                        problems.push(format!("{context}: stored id '{id}' differs from its key"));
                    }
                    id.clone()
                }
                Some(_) => {
                    problems.push(format!("{context}: 'id' is not a string"));
                    key.clone()
                }
                None => key.clone(),
            };
            for (name, value) in &record.fields {
                if name == SCRIPTS_FIELD {
                    decode::check_scripts(value, &seen, &id, &format!("{context}.{name}"), &mut problems);
                } else {
                    decode::check_value(value, &seen, &format!("{context}.{name}"), &mut problems);
                }
            }
            if !seen.insert(id.clone()) {
                problems.push(format!("{context}: duplicate entity id '{id}'"));
            }
        }
        problems
    }
}

/// Serializes the host's persistent entities and writes them to `path`. Nothing is written on error.
pub fn save_level<H>(path: impl AsRef<Path>, host: &H, pretty: bool) -> Result<LevelDocument>
where
    H: LevelHost + ?Sized,
{
    let path = path.as_ref();
    let document = serialize(&host.persistent_entities(), host.assets())?;
    document.save_to_path(path, pretty)?;
    info!("[level] saved {} entities to {}", document.entities.len(), path.display());
    Ok(document)
}

pub fn load_level<H>(path: impl AsRef<Path>, loader: &mut Loader, host: &mut H) -> Result<LoadReport>
where
    H: LevelHost + ?Sized,
{
    let path = path.as_ref();
    let document = LevelDocument::load_from_path(path)?;
    let report = load(&document, loader, host)?;
    info!(
        "[level] loaded {} entities and {} scripts from {}",
        report.entities,
        report.scripts,
        path.display()
    );
    Ok(report)
}
