use std::collections::BTreeMap;
use std::path::Path;

use glam::{Quat, Vec3};
use log::{debug, info};

use crate::class::{BoundMethod, Class, Member, Object, PersistKind};
use crate::error::{Error, Result};
use crate::level::{load_level, LoadReport};
use crate::loader::Loader;
use crate::units::{ClassDecl, UnitDefinition};
use crate::value::{string_map, Fields, Value};

pub const ENGINE_UNIT: &str = "kestrel";
pub const ENTITY_CLASS: &str = "Entity";
pub const SCRIPT_CLASS: &str = "Script";
pub const MODELS: &str = "models";

const SHADER_FIELD: &str = "shader";

pub fn engine_unit() -> UnitDefinition {
    let entity = ClassDecl::new(ENTITY_CLASS)
        .persist(PersistKind::Entity)
        .data(
            "savable_attributes",
            string_map(
                [
                    "id",
                    "position",
                    "orientation",
                    "scalar",
                    "velocity",
                    "do_gravity",
                    "do_collisions",
                    "should_render",
                    "model_path",
                    "overlay",
                    "scripts",
                ]
                .map(|name| (name, name)),
            ),
        )
        .method("on_save", |this, _| {
            if let Some(shader) = this.field(SHADER_FIELD) {
                let mut overrides = match this.field("save_overrides") {
                    Some(Value::Map(map)) => map,
                    _ => BTreeMap::new(),
                };
                overrides.insert(SHADER_FIELD.to_string(), shader);
                this.set("save_overrides", Value::Map(overrides));
            }
            Ok(Value::Nil)
        })
        .method("remove", |_, _| Ok(Value::Nil));
    let script = ClassDecl::new(SCRIPT_CLASS)
        .persist(PersistKind::Script)
        .data("savable_attributes", Value::Map(BTreeMap::new()))
        .method("remove", |_, _| Ok(Value::Nil));
    UnitDefinition::new().class(entity.native()).class(script.native())
}

#[derive(Debug, Clone, PartialEq)]
pub struct NamedClass {
    pub class: Class,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AssetTables {
    pub scripts: Vec<NamedClass>,
    pub entity_classes: Vec<NamedClass>,
    pub features: BTreeMap<String, BTreeMap<String, Option<String>>>,
}

impl AssetTables {
    pub fn record_script(&mut self, class: &Class) {
        record_class(&mut self.scripts, class);
    }

    pub fn record_entity_class(&mut self, class: &Class) {
        record_class(&mut self.entity_classes, class);
    }

    /// Adds `path` to a feature table (`models`, `audio`, ...) unless it is already named there.
    pub fn record_feature(&mut self, feature: &str, path: &str) {
        self.features.entry(feature.to_string()).or_default().entry(path.to_string()).or_insert(None);
    }

    pub fn feature(&self, feature: &str) -> Option<&BTreeMap<String, Option<String>>> {
        self.features.get(feature)
    }

    pub fn clear_classes(&mut self) {
        self.scripts.clear();
        self.entity_classes.clear();
    }
}

fn record_class(table: &mut Vec<NamedClass>, class: &Class) {
    let known = table
        .iter()
        .any(|named| named.class.unit() == class.unit() && named.class.name() == class.name());
    if !known {
        table.push(NamedClass { class: class.clone(), display_name: None });
    }
}

pub trait LevelHost {
    fn create_entity(&mut self, loader: &mut Loader, class: &Class, fields: Fields) -> Result<Object>;

    /// Creates a script attached to `owner`. The owner is fully constructed before this runs.
    fn create_script(&mut self, loader: &mut Loader, owner: &Object, class: &Class, fields: Fields)
        -> Result<Object>;

    fn entity_by_id(&self, id: &str) -> Option<Object>;

    /// Entities to save: the main pass first, then overlay entities.
    fn persistent_entities(&self) -> Vec<Object>;

    fn assets(&self) -> &AssetTables;

    fn assets_mut(&mut self) -> &mut AssetTables;
}

#[derive(Default)]
pub struct EditorHost {
    entities: Vec<Object>,
    overlay_entities: Vec<Object>,
    by_id: BTreeMap<String, Object>,
    callbacks: BTreeMap<String, Vec<BoundMethod>>,
    assets: AssetTables,
}

impl EditorHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entities(&self) -> &[Object] {
        &self.entities
    }

    pub fn overlay_entities(&self) -> &[Object] {
        &self.overlay_entities
    }

    pub fn entity_count(&self) -> usize {
        self.by_id.len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.by_id.keys().cloned().collect()
    }

    pub fn add_callback(&mut self, hook: &str, method: BoundMethod) {
        self.callbacks.entry(hook.to_string()).or_default().push(method);
    }

    pub fn callback_count(&self, hook: &str) -> usize {
        self.callbacks.get(hook).map_or(0, Vec::len)
    }

    /// Calls every callback registered for `hook`, in registration order. Returns how many ran.
    pub fn dispatch(&self, hook: &str, args: &[Value]) -> Result<usize> {
        let Some(callbacks) = self.callbacks.get(hook) else {
            return Ok(0);
        };
        for callback in callbacks.clone() {
            callback.call(args)?;
        }
        Ok(callbacks.len())
    }

    fn remove_callbacks_for(&mut self, receiver: &Object) {
        for methods in self.callbacks.values_mut() {
            methods.retain(|method| method.receiver() != receiver);
        }
        self.callbacks.retain(|_, methods| !methods.is_empty());
    }

    /// Registers hooked methods, or every public method when `everything` is set.
    fn register_hooks(&mut self, object: &Object, everything: bool) {
        for (name, member) in object.class().reachable_members() {
            if name.starts_with('_') {
                continue;
            }
            let Member::Method(function) = member else { continue };
            let hook = match function.hook() {
                Some(hook) => hook.to_string(),
                None if everything => name.clone(),
                None => continue,
            };
            if let Ok(method) = object.method(&name) {
                self.add_callback(&hook, method);
            }
        }
    }

    pub fn remove_entity(&mut self, entity: &Object) -> Result<()> {
        let id = entity.entity_id().ok_or_else(|| Error::MissingId { object: entity.repr() })?;
        if let Some(Value::List(scripts)) = entity.field("scripts") {
            for script in scripts.iter().filter_map(Value::as_object) {
                self.remove_script(script)?;
            }
        }
        self.by_id.remove(&id);
        self.entities.retain(|known| known != entity);
        self.overlay_entities.retain(|known| known != entity);
        self.remove_callbacks_for(entity);
        run_remove_hook(entity)?;
        debug!("[level] removed entity '{id}'");
        Ok(())
    }

    pub fn remove_script(&mut self, script: &Object) -> Result<()> {
        self.remove_callbacks_for(script);
        run_remove_hook(script)?;
        if let Some(Value::Object(owner)) = script.remove_field("parent") {
            if let Some(Value::List(mut scripts)) = owner.field("scripts") {
                scripts.retain(|attached| attached.as_object() != Some(script));
                owner.set("scripts", Value::List(scripts));
            }
        }
        Ok(())
    }

    pub fn rename_entity(&mut self, entity: &Object, new_id: &str) -> Result<()> {
        let old_id = entity.entity_id().ok_or_else(|| Error::MissingId { object: entity.repr() })?;
        if old_id == new_id {
            return Ok(());
        }
        if self.by_id.contains_key(new_id) {
            return Err(Error::DuplicateId { id: new_id.to_string() });
        }
        self.by_id.remove(&old_id);
        entity.set("id", new_id);
        self.by_id.insert(new_id.to_string(), entity.clone());
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        while let Some(entity) = self.entities.first().cloned() {
            self.remove_entity(&entity)?;
        }
        while let Some(entity) = self.overlay_entities.first().cloned() {
            self.remove_entity(&entity)?;
        }
        Ok(())
    }

    /// Removes every entity, reloads code and loads the level at `path` again.
    pub fn reload_level(&mut self, loader: &mut Loader, path: impl AsRef<Path>) -> Result<LoadReport> {
        self.clear()?;
        self.assets.clear_classes();
        loader.reload()?;
        let report = load_level(path.as_ref(), loader, self)?;
        info!("[level] reloaded {} with {} entities", path.as_ref().display(), report.entities);
        Ok(report)
    }
}

fn run_remove_hook(object: &Object) -> Result<()> {
    if object.class().function("remove").is_some() {
        object.call("remove", &[])?;
    }
    Ok(())
}

fn entity_defaults(fields: &mut Fields) {
    let defaults = [
        ("position", Value::Vec3(Vec3::ZERO)),
        ("orientation", Value::Quat(Quat::IDENTITY)),
        ("scalar", Value::Vec3(Vec3::ONE)),
        ("velocity", Value::Vec3(Vec3::ZERO)),
        ("do_gravity", Value::Bool(false)),
        ("do_collisions", Value::Bool(false)),
        ("should_render", Value::Bool(true)),
        ("model_path", Value::Nil),
        ("overlay", Value::Bool(false)),
        ("scripts", Value::List(Vec::new())),
        ("save_overrides", Value::Map(BTreeMap::new())),
    ];
    for (name, value) in defaults {
        fields.entry(name.to_string()).or_insert(value);
    }
}

impl LevelHost for EditorHost {
    fn create_entity(&mut self, loader: &mut Loader, class: &Class, mut fields: Fields) -> Result<Object> {
        let id = match fields.get("id") {
            Some(Value::Str(id)) => id.clone(),
            _ => return Err(Error::MissingId { object: format!("new {}", class.qualified_name()) }),
        };
        if self.by_id.contains_key(&id) {
            return Err(Error::DuplicateId { id });
        }
        entity_defaults(&mut fields);
        let overlay = fields.get("overlay").and_then(Value::as_bool).unwrap_or(false);
        let model = match fields.get("model_path") {
            Some(Value::Str(model)) => Some(model.clone()),
            _ => None,
        };

        let entity = loader.instantiate(class, fields)?;
        if let Some(model) = model {
            self.assets.record_feature(MODELS, &model);
        }
        self.assets.record_entity_class(class);
        self.by_id.insert(id, entity.clone());
        if overlay {
            self.overlay_entities.push(entity.clone());
        } else {
            self.entities.push(entity.clone());
        }
        self.register_hooks(&entity, false);
        Ok(entity)
    }

    fn create_script(
        &mut self,
        loader: &mut Loader,
        owner: &Object,
        class: &Class,
        mut fields: Fields,
    ) -> Result<Object> {
        fields.insert("parent".to_string(), Value::Object(owner.clone()));
        let script = loader.instantiate(class, fields)?;
        let mut scripts = match owner.field("scripts") {
            Some(Value::List(scripts)) => scripts,
            _ => Vec::new(),
        };
        scripts.push(Value::Object(script.clone()));
        owner.set("scripts", Value::List(scripts));
        self.assets.record_script(class);
        self.register_hooks(&script, true);
        Ok(script)
    }

    fn entity_by_id(&self, id: &str) -> Option<Object> {
        self.by_id.get(id).cloned()
    }

    fn persistent_entities(&self) -> Vec<Object> {
        self.entities.iter().chain(&self.overlay_entities).cloned().collect()
    }

    fn assets(&self) -> &AssetTables {
        &self.assets
    }

    fn assets_mut(&mut self) -> &mut AssetTables {
        &mut self.assets
    }
}
