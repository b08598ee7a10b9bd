use std::collections::BTreeSet;

use glam::{Quat, Vec2, Vec3, Vec4};
use log::debug;
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::{tag, ClassRefRecord, LevelDocument, ObjectRecord, SCRIPTS_FIELD};
use crate::class::Class;
use crate::error::{Error, Result};
use crate::host::{LevelHost, NamedClass};
use crate::loader::Loader;
use crate::value::{Fields, Value};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    pub entities: usize,
    pub scripts: usize,
    pub classes: usize,
}

pub(crate) fn is_known_tag(kind: &str) -> bool {
    matches!(
        kind,
        tag::ENTITY
            | tag::SCRIPT
            | tag::ENTITY_REF
            | tag::MAP
            | tag::VEC2
            | tag::VEC3
            | tag::VEC4
            | tag::QUAT
            | tag::SCRIPT_CLS
            | tag::ENTITY_CLS
    )
}

/// A script waiting for its owner: the bound class and its raw record.
struct DeferredScript {
    class: Class,
    record: ObjectRecord,
}

/// Rebuilds the document's object graph into `host`.
///
/// Class tables come first so every class resolves through `loader`. Entities are then
/// created in document order, each one registered before the next record is decoded, and
/// nested scripts are constructed right after their owner.
pub fn load<H>(document: &LevelDocument, loader: &mut Loader, host: &mut H) -> Result<LoadReport>
where
    H: LevelHost + ?Sized,
{
    let mut report = LoadReport::default();
    for (feature, table) in &document.assets {
        host.assets_mut().features.insert(feature.clone(), table.clone());
    }
    let scripts = resolve_class_table(&document.scripts, loader)?;
    let entity_classes = resolve_class_table(&document.entity_classes, loader)?;
    report.classes = scripts.len() + entity_classes.len();
    host.assets_mut().scripts = scripts;
    host.assets_mut().entity_classes = entity_classes;

    for (key, raw) in &document.entities {
        let record = ObjectRecord::parse(raw, &format!("entity '{key}'"))?;
        if record.kind != tag::ENTITY {
            return Err(Error::Malformed(format!("entity '{key}' is tagged '{}'", record.kind)));
        }
        let force = loader.force_reload_on_first_load();
        let class = loader.load_class(&record.class_unit, &record.class_name, force)?;
        let mut fields = Fields::new();
        let mut deferred = Vec::new();
        for (name, value) in &record.fields {
            if name == SCRIPTS_FIELD {
                deferred = defer_scripts(value, loader)?;
            } else {
                fields.insert(name.clone(), decode_value(value, &*host)?);
            }
        }
        fields.entry("id".to_string()).or_insert_with(|| Value::Str(key.clone()));

        let entity = host.create_entity(loader, &class, fields)?;
        report.entities += 1;
        for script in deferred {
            let fields = decode_fields(&script.record.fields, &*host)?;
            host.create_script(loader, &entity, &script.class, fields)?;
            report.scripts += 1;
        }
        debug!("[level] created entity '{key}' ({})", class.qualified_name());
    }
    Ok(report)
}

fn resolve_class_table(records: &[ClassRefRecord], loader: &mut Loader) -> Result<Vec<NamedClass>> {
    records
        .iter()
        .map(|record| {
            if record.kind != tag::SCRIPT_CLS && record.kind != tag::ENTITY_CLS {
                return Err(Error::UnknownTag { tag: record.kind.clone() });
            }
            let force = loader.force_reload_on_first_load();
            let class = loader.load_class(&record.class_unit, &record.class_name, force)?;
            Ok(NamedClass { class, display_name: record.display_name.clone() })
        })
        .collect()
}

fn defer_scripts(value: &JsonValue, loader: &mut Loader) -> Result<Vec<DeferredScript>> {
    let JsonValue::Array(items) = value else {
        return Err(Error::Malformed(format!("'{SCRIPTS_FIELD}' must be a list of script records")));
    };
    items
        .iter()
        .map(|raw| {
            let record = ObjectRecord::parse(raw, SCRIPTS_FIELD)?;
            if record.kind != tag::SCRIPT {
                return Err(Error::Malformed(format!("'{}' record inside '{SCRIPTS_FIELD}'", record.kind)));
            }
            let force = loader.force_reload_on_first_load();
            let class = loader.load_class(&record.class_unit, &record.class_name, force)?;
            Ok(DeferredScript { class, record })
        })
        .collect()
}

fn decode_fields<H>(fields: &JsonMap<String, JsonValue>, host: &H) -> Result<Fields>
where
    H: LevelHost + ?Sized,
{
    fields.iter().map(|(name, value)| Ok((name.clone(), decode_value(value, host)?))).collect()
}

pub(crate) fn decode_value<H>(value: &JsonValue, host: &H) -> Result<Value>
where
    H: LevelHost + ?Sized,
{
    Ok(match value {
        JsonValue::Null => Value::Nil,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        JsonValue::String(s) => Value::Str(s.clone()),
        JsonValue::Array(items) => {
            Value::List(items.iter().map(|item| decode_value(item, host)).collect::<Result<_>>()?)
        }
        JsonValue::Object(map) => match map.get("kind") {
            None => Value::Map(decode_fields(map, host)?),
            Some(JsonValue::String(kind)) => decode_tagged(kind, map, host)?,
            Some(_) => return Err(Error::Malformed("'kind' must be a string".to_string())),
        },
    })
}

fn decode_tagged<H>(kind: &str, map: &JsonMap<String, JsonValue>, host: &H) -> Result<Value>
where
    H: LevelHost + ?Sized,
{
    match kind {
        tag::VEC2 => components::<2>(kind, map).map(|[x, y]| Value::Vec2(Vec2::new(x, y))),
        tag::VEC3 => components::<3>(kind, map).map(|[x, y, z]| Value::Vec3(Vec3::new(x, y, z))),
        tag::VEC4 => components::<4>(kind, map).map(|[x, y, z, w]| Value::Vec4(Vec4::new(x, y, z, w))),
        // Scalar part first.
        tag::QUAT => components::<4>(kind, map).map(|[w, x, y, z]| Value::Quat(Quat::from_xyzw(x, y, z, w))),
        tag::ENTITY_REF => {
            let id = reference_id(map)?;
            host.entity_by_id(id).map(Value::Object).ok_or_else(|| Error::UnknownEntityRef { id: id.to_string() })
        }
        tag::MAP => match map.get("entries") {
            Some(JsonValue::Object(entries)) => decode_fields(entries, host).map(Value::Map),
            _ => Err(Error::Malformed("'map' value without an 'entries' object".to_string())),
        },
        other if is_known_tag(other) => {
            Err(Error::Malformed(format!("'{other}' record outside of an entity's '{SCRIPTS_FIELD}'")))
        }
        other => Err(Error::UnknownTag { tag: other.to_string() }),
    }
}

fn reference_id(map: &JsonMap<String, JsonValue>) -> Result<&str> {
    match map.get("id") {
        Some(JsonValue::String(id)) => Ok(id),
        _ => Err(Error::Malformed("'entity_ref' without a string 'id'".to_string())),
    }
}

fn components<const N: usize>(kind: &str, map: &JsonMap<String, JsonValue>) -> Result<[f32; N]> {
    let malformed = || Error::Malformed(format!("'{kind}' needs {N} numeric values"));
    let Some(JsonValue::Array(values)) = map.get("values") else {
        return Err(malformed());
    };
    if values.len() != N {
        return Err(malformed());
    }
    let mut out = [0.0; N];
    for (slot, value) in out.iter_mut().zip(values) {
        *slot = value.as_f64().ok_or_else(malformed)? as f32;
    }
    Ok(out)
}

pub(crate) fn check_value(value: &JsonValue, seen: &BTreeSet<String>, context: &str, problems: &mut Vec<String>) {
    match value {
        JsonValue::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                check_value(item, seen, &format!("{context}[{index}]"), problems);
            }
        }
        JsonValue::Object(map) => match map.get("kind") {
            None => {
                for (name, item) in map {
                    check_value(item, seen, &format!("{context}.{name}"), problems);
                }
            }
            Some(JsonValue::String(kind)) => match kind.as_str() {
                tag::ENTITY_REF => match reference_id(map) {
                    Ok(id) if seen.contains(id) => {}
                    Ok(id) => problems.push(format!("{context}: entity reference to '{id}' is not defined earlier")),
                    Err(err) => problems.push(format!("{context}: {err}")),
                },
                tag::MAP => match map.get("entries") {
                    Some(JsonValue::Object(entries)) => {
                        for (name, item) in entries {
                            check_value(item, seen, &format!("{context}.{name}"), problems);
                        }
                    }
                    _ => problems.push(format!("{context}: 'map' value without an 'entries' object")),
                },
                tag::VEC2 | tag::VEC3 | tag::VEC4 | tag::QUAT => {
                    let result = match kind.as_str() {
                        tag::VEC2 => components::<2>(kind, map).map(drop),
                        tag::VEC3 => components::<3>(kind, map).map(drop),
                        _ => components::<4>(kind, map).map(drop),
                    };
                    if let Err(err) = result {
                        problems.push(format!("{context}: {err}"));
                    }
                }
                other if is_known_tag(other) => {
                    problems.push(format!("{context}: '{other}' record outside of '{SCRIPTS_FIELD}'"))
                }
                other => problems.push(format!("{context}: unknown tag '{other}'")),
            },
            Some(_) => problems.push(format!("{context}: 'kind' must be a string")),
        },
        _ => {}
    }
}

/// Script records may also refer to their owner, which exists by the time they are built.
pub(crate) fn check_scripts(
    value: &JsonValue,
    seen: &BTreeSet<String>,
    owner: &str,
    context: &str,
    problems: &mut Vec<String>,
) {
    let JsonValue::Array(items) = value else {
        problems.push(format!("{context}: must be a list of script records"));
        return;
    };
    let mut visible = seen.clone();
    visible.insert(owner.to_string());
    for (index, raw) in items.iter().enumerate() {
        let context = format!("{context}[{index}]");
        match ObjectRecord::parse(raw, &context) {
            Ok(record) if record.kind == tag::SCRIPT => {
                for (name, item) in &record.fields {
                    check_value(item, &visible, &format!("{context}.{name}"), problems);
                }
            }
            Ok(record) => problems.push(format!("{context}: '{}' record inside '{SCRIPTS_FIELD}'", record.kind)),
            Err(err) => problems.push(err.to_string()),
        }
    }
}
