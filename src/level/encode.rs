use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use serde_json::{json, Map as JsonMap, Number, Value as JsonValue};

use super::{tag, ClassRefRecord, LevelDocument, SCRIPTS_FIELD};
use crate::class::{Member, Object, PersistKind};
use crate::error::{Error, Result};
use crate::host::{AssetTables, NamedClass};
use crate::value::Value;

/// Converts the entity graph rooted at `roots` into a document.
///
/// Ids are checked for uniqueness before anything is encoded. Records are ordered so that
/// every entity reference points at an earlier record, keeping host order otherwise.
pub fn serialize(roots: &[Object], assets: &AssetTables) -> Result<LevelDocument> {
    let mut ids = BTreeSet::new();
    for root in roots {
        if root.class().persist_kind() != PersistKind::Entity {
            let type_name = format!("{} as a top-level entity", root.class().qualified_name());
            return Err(Error::HandlerMissing { type_name });
        }
        let id = root.entity_id().ok_or_else(|| Error::MissingId { object: root.repr() })?;
        if !ids.insert(id.clone()) {
            return Err(Error::DuplicateId { id });
        }
    }

    let mut pending = Vec::with_capacity(roots.len());
    for root in roots {
        let mut encoder = Encoder::default();
        let record = encoder.record(root, tag::ENTITY)?;
        let id = root.entity_id().unwrap_or_default();
        pending.push(PendingRecord { id, record, refs: encoder.refs, script_refs: encoder.script_refs });
    }

    let mut entities = JsonMap::new();
    for (id, record) in order_by_references(pending, &ids)? {
        entities.insert(id, record);
    }
    debug!("[level] serialized {} entities", entities.len());
    Ok(LevelDocument {
        entities,
        scripts: class_table(&assets.scripts, tag::SCRIPT_CLS),
        entity_classes: class_table(&assets.entity_classes, tag::ENTITY_CLS),
        assets: assets.features.clone(),
    })
}

fn class_table(classes: &[NamedClass], kind: &str) -> Vec<ClassRefRecord> {
    classes
        .iter()
        .map(|named| ClassRefRecord {
            kind: kind.to_string(),
            class_unit: named.class.unit().to_string(),
            class_name: named.class.name().to_string(),
            display_name: named.display_name.clone(),
        })
        .collect()
}

struct PendingRecord {
    id: String,
    record: JsonValue,
    refs: BTreeSet<String>,
    script_refs: BTreeSet<String>,
}

#[derive(Default)]
struct Encoder {
    refs: BTreeSet<String>,
    script_refs: BTreeSet<String>,
    in_script: bool,
}

impl Encoder {
    fn record(&mut self, object: &Object, kind: &str) -> Result<JsonValue> {
        if object.class().function("on_save").is_some() {
            object.call("on_save", &[])?;
        }
        let mut record = JsonMap::new();
        record.insert("kind".to_string(), JsonValue::from(kind));
        record.insert("class_unit".to_string(), JsonValue::from(object.class().unit()));
        record.insert("class_name".to_string(), JsonValue::from(object.class().name()));
        for (name, value) in savable_fields(object)? {
            let encoded = if name == SCRIPTS_FIELD && kind == tag::ENTITY {
                self.scripts(&value)?
            } else {
                self.value(&value)?
            };
            record.insert(name, encoded);
        }
        Ok(JsonValue::Object(record))
    }

    fn scripts(&mut self, value: &Value) -> Result<JsonValue> {
        let Value::List(items) = value else {
            return Err(value.mismatch(SCRIPTS_FIELD, "list"));
        };
        self.in_script = true;
        let encoded = items
            .iter()
            .map(|item| match item {
                Value::Object(script) if script.class().persist_kind() == PersistKind::Script => {
                    self.record(script, tag::SCRIPT)
                }
                other => {
                    Err(Error::HandlerMissing { type_name: format!("{} in '{SCRIPTS_FIELD}'", other.type_name()) })
                }
            })
            .collect::<Result<Vec<_>>>();
        self.in_script = false;
        encoded.map(JsonValue::Array)
    }

    fn value(&mut self, value: &Value) -> Result<JsonValue> {
        Ok(match value {
            Value::Nil => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => JsonValue::Number(number(*f)?),
            Value::Str(s) => JsonValue::String(s.clone()),
            Value::List(items) => {
                JsonValue::Array(items.iter().map(|item| self.value(item)).collect::<Result<_>>()?)
            }
            Value::Map(map) => {
                let entries = map
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), self.value(item)?)))
                    .collect::<Result<JsonMap<_, _>>>()?;
                if entries.contains_key("kind") {
                    json!({ "kind": tag::MAP, "entries": entries })
                } else {
                    JsonValue::Object(entries)
                }
            }
            Value::Vec2(v) => tagged_floats(tag::VEC2, &v.to_array())?,
            Value::Vec3(v) => tagged_floats(tag::VEC3, &v.to_array())?,
            Value::Vec4(v) => tagged_floats(tag::VEC4, &v.to_array())?,
            Value::Quat(q) => tagged_floats(tag::QUAT, &[q.w, q.x, q.y, q.z])?,
            Value::Object(object) => match object.class().persist_kind() {
                PersistKind::Entity => {
                    let id = object.entity_id().ok_or_else(|| Error::MissingId { object: object.repr() })?;
                    if self.in_script {
                        self.script_refs.insert(id.clone());
                    } else {
                        self.refs.insert(id.clone());
                    }
                    json!({ "kind": tag::ENTITY_REF, "id": id })
                }
                PersistKind::Script => {
                    return Err(Error::MisplacedScript { class: object.class().qualified_name() });
                }
                PersistKind::Transient => {
                    return Err(Error::HandlerMissing { type_name: object.class().qualified_name() });
                }
            },
            Value::Class(class) => {
                return Err(Error::HandlerMissing { type_name: format!("class object {}", class.qualified_name()) });
            }
        })
    }
}

fn number(value: f64) -> Result<Number> {
    Number::from_f64(value).ok_or_else(|| Error::HandlerMissing { type_name: format!("non-finite float {value}") })
}

fn tagged_floats(kind: &str, values: &[f32]) -> Result<JsonValue> {
    // Shortest f32 text, so 0.1 is written as 0.1 and still reads back to the same f32.
    let widen = |v: f32| v.to_string().parse::<f64>().unwrap_or(f64::from(v));
    let values = values.iter().map(|v| number(widen(*v)).map(JsonValue::Number)).collect::<Result<Vec<_>>>()?;
    Ok(json!({ "kind": kind, "values": values }))
}

/// Savable attributes accumulate along the ancestor chain, nearest class winning, and an
/// instance-level `savable_attributes` map extends them. `save_overrides` is merged last.
fn savable_fields(object: &Object) -> Result<BTreeMap<String, Value>> {
    let mut table: BTreeMap<String, String> = BTreeMap::new();
    let mut layers: Vec<Value> = Vec::new();
    for class in object.class().mro().iter().rev() {
        if let Some(Member::Data(value)) = class.own_member("savable_attributes") {
            layers.push(value);
        }
    }
    if let Some(own) = object.field("savable_attributes") {
        layers.push(own);
    }
    for layer in layers {
        let Value::Map(map) = &layer else {
            return Err(layer.mismatch("savable_attributes", "map"));
        };
        for (argument, attribute) in map {
            table.insert(argument.clone(), attribute.expect_str(argument)?.to_string());
        }
    }

    let mut fields = BTreeMap::new();
    for (argument, attribute) in table {
        match object.attr_value(&attribute) {
            Ok(value) => {
                fields.insert(argument, value);
            }
            Err(_) => warn!("[level] {} has no attribute '{attribute}' to save as '{argument}'", object.repr()),
        }
    }
    match object.field("save_overrides") {
        Some(Value::Map(overrides)) => fields.extend(overrides),
        Some(Value::Nil) | None => {}
        Some(other) => return Err(other.mismatch("save_overrides", "map")),
    }
    Ok(fields)
}

/// Stable topological order: a record is emitted once everything it references has been.
fn order_by_references(pending: Vec<PendingRecord>, ids: &BTreeSet<String>) -> Result<Vec<(String, JsonValue)>> {
    let mut deps: Vec<BTreeSet<String>> = Vec::with_capacity(pending.len());
    for record in &pending {
        for id in record.refs.iter().chain(&record.script_refs) {
            if !ids.contains(id) {
                return Err(Error::UnknownEntityRef { id: id.clone() });
            }
        }
        if record.refs.contains(&record.id) {
            return Err(Error::ReferenceCycle { ids: record.id.clone() });
        }
        let mut needed: BTreeSet<String> = record.refs.union(&record.script_refs).cloned().collect();
        needed.remove(&record.id);
        deps.push(needed);
    }

    let mut emitted: BTreeSet<String> = BTreeSet::new();
    let mut slots: Vec<Option<PendingRecord>> = pending.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(slots.len());
    while ordered.len() < slots.len() {
        let ready = slots
            .iter()
            .enumerate()
            .position(|(index, slot)| slot.is_some() && deps[index].is_subset(&emitted));
        let Some(index) = ready else {
            let stuck: Vec<String> = slots.iter().flatten().map(|record| record.id.clone()).collect();
            return Err(Error::ReferenceCycle { ids: stuck.join(", ") });
        };
        if let Some(record) = slots[index].take() {
            emitted.insert(record.id.clone());
            ordered.push((record.id, record.record));
        }
    }
    Ok(ordered)
}
