use glam::{Quat, Vec2, Vec3, Vec4};
use kestrel_live::error::Error;
use kestrel_live::host::{AssetTables, MODELS};
use kestrel_live::level::{load, load_level, save_level, serialize, LevelDocument};
use kestrel_live::units::{ClassDecl, MemorySource, UnitDefinition};
use kestrel_live::value::string_map;
use kestrel_live::{
    engine_unit, Class, EditorHost, Fields, LevelHost, Loader, Object, Value, ENGINE_UNIT, ENTITY_CLASS, SCRIPT_CLASS,
};
use serde_json::json;
use std::collections::BTreeMap;

fn game_unit(crate_marker: i64) -> UnitDefinition {
    let crate_class = ClassDecl::new("Crate")
        .base(ENGINE_UNIT, ENTITY_CLASS)
        .data("marker", crate_marker)
        .data("savable_attributes", string_map([("target", "target"), ("tint", "tint"), ("label", "label")]));
    let spin = ClassDecl::new("Spin")
        .base(ENGINE_UNIT, SCRIPT_CLASS)
        .data("savable_attributes", string_map([("speed", "speed"), ("anchor", "anchor"), ("owner", "parent")]))
        .method("init", |this, _| {
            if let Value::Object(owner) = this.attr_value("parent")? {
                this.set("owner_id", owner.entity_id().unwrap_or_default());
            }
            Ok(Value::Nil)
        });
    UnitDefinition::new().class(crate_class).class(spin).class(ClassDecl::new("Widget"))
}

struct Fixture {
    source: MemorySource,
    loader: Loader,
}

impl Fixture {
    fn new() -> Self {
        let source = MemorySource::new();
        source.define("game", game_unit(1));
        let mut loader = Loader::new(source.clone());
        loader.register_native_unit(ENGINE_UNIT, engine_unit()).expect("engine unit");
        Self { source, loader }
    }

    fn class(&mut self, unit: &str, name: &str) -> Class {
        self.loader.load_class(unit, name, true).expect("class")
    }

    fn spawn(&mut self, host: &mut EditorHost, class: (&str, &str), id: &str, extra: &[(&str, Value)]) -> Object {
        let class = self.class(class.0, class.1);
        let mut fields = Fields::new();
        fields.insert("id".to_string(), Value::from(id));
        for (name, value) in extra {
            fields.insert(name.to_string(), value.clone());
        }
        host.create_entity(&mut self.loader, &class, fields).expect("create entity")
    }
}

const ENTITY: (&str, &str) = (ENGINE_UNIT, ENTITY_CLASS);
const CRATE: (&str, &str) = ("game", "Crate");

fn roundtrip(fixture: &mut Fixture, host: &EditorHost) -> EditorHost {
    let document = serialize(&host.persistent_entities(), host.assets()).expect("serialize");
    let text = document.to_json_string(true).expect("to json");
    let parsed = LevelDocument::from_json_str(&text).expect("parse");
    assert!(parsed.validate().is_empty(), "{:?}", parsed.validate());
    let mut fresh = EditorHost::new();
    load(&parsed, &mut fixture.loader, &mut fresh).expect("load");
    fresh
}

#[test]
fn entities_round_trip_with_their_fields() {
    let mut fixture = Fixture::new();
    let mut host = EditorHost::new();
    let label = Value::Map(BTreeMap::from([
        ("kind".to_string(), Value::from("fancy")),
        ("n".to_string(), Value::Int(3)),
        ("offset".to_string(), Value::Vec2(Vec2::new(0.5, -1.25))),
    ]));
    fixture.spawn(
        &mut host,
        CRATE,
        "crate",
        &[
            ("position", Value::Vec3(Vec3::new(1.0, 2.5, -3.0))),
            ("orientation", Value::Quat(Quat::from_rotation_y(0.5))),
            ("tint", Value::Vec4(Vec4::new(0.1, 0.2, 0.3, 1.0))),
            ("label", label.clone()),
            ("do_gravity", Value::Bool(true)),
            ("model_path", Value::from("models/crate.obj")),
        ],
    );
    fixture.spawn(&mut host, ENTITY, "lamp", &[("velocity", Value::Vec3(Vec3::X))]);

    let loaded = roundtrip(&mut fixture, &host);
    assert_eq!(loaded.ids(), host.ids());
    for original in host.entities() {
        let id = original.entity_id().unwrap();
        let copy = loaded.entity_by_id(&id).expect("loaded entity");
        assert_eq!(copy.class(), original.class());
        for name in ["position", "orientation", "scalar", "velocity", "do_gravity", "model_path", "tint"] {
            assert_eq!(copy.field(name), original.field(name), "{id}.{name}");
        }
    }
    let crate_copy = loaded.entity_by_id("crate").unwrap();
    assert_eq!(crate_copy.field("label"), Some(label));
    assert!(loaded.assets().feature(MODELS).unwrap().contains_key("models/crate.obj"));
    assert_eq!(loaded.assets().entity_classes.len(), 2);
}

#[test]
fn entity_references_resolve_to_the_loaded_object() {
    let mut fixture = Fixture::new();
    let mut host = EditorHost::new();
    let b = fixture.spawn(&mut host, ENTITY, "b", &[]);
    fixture.spawn(&mut host, CRATE, "a", &[("target", Value::Object(b))]);

    let document = serialize(&host.persistent_entities(), host.assets()).unwrap();
    assert_eq!(document.entities["a"]["target"], json!({"kind": "entity_ref", "id": "b"}));

    let loaded = roundtrip(&mut fixture, &host);
    let a = loaded.entity_by_id("a").unwrap();
    let b = loaded.entity_by_id("b").unwrap();
    assert_eq!(a.field("target"), Some(Value::Object(b)));
    assert_eq!(loaded.entity_count(), 2);
}

#[test]
fn forward_references_are_saved_in_dependency_order() {
    let mut fixture = Fixture::new();
    let mut host = EditorHost::new();
    let a = fixture.spawn(&mut host, CRATE, "a", &[]);
    fixture.spawn(&mut host, ENTITY, "c", &[]);
    let b = fixture.spawn(&mut host, ENTITY, "b", &[]);
    a.set("target", b);

    let document = serialize(&host.persistent_entities(), host.assets()).unwrap();
    assert_eq!(document.entity_ids(), ["c", "b", "a"]);

    let loaded = roundtrip(&mut fixture, &host);
    let target = loaded.entity_by_id("a").unwrap().field("target");
    assert_eq!(target, Some(Value::Object(loaded.entity_by_id("b").unwrap())));
}

#[test]
fn reference_cycles_are_rejected() {
    let mut fixture = Fixture::new();
    let mut host = EditorHost::new();
    let a = fixture.spawn(&mut host, CRATE, "a", &[]);
    let b = fixture.spawn(&mut host, CRATE, "b", &[]);
    a.set("target", b.clone());
    b.set("target", a.clone());
    let err = serialize(&host.persistent_entities(), host.assets()).unwrap_err();
    assert!(matches!(err, Error::ReferenceCycle { .. }), "{err}");

    b.set("target", Value::Nil);
    a.set("target", a.clone());
    let err = serialize(&host.persistent_entities(), host.assets()).unwrap_err();
    assert!(matches!(err, Error::ReferenceCycle { ref ids } if ids == "a"), "{err}");
}

#[test]
fn duplicate_ids_fail_before_writing() {
    let mut fixture = Fixture::new();
    let mut host = EditorHost::new();
    fixture.spawn(&mut host, ENTITY, "dot", &[]);
    let other = fixture.spawn(&mut host, ENTITY, "dot2", &[]);
    other.set("id", "dot");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dup.json");
    let err = save_level(&path, &host, true).unwrap_err();
    assert!(matches!(err, Error::DuplicateId { ref id } if id == "dot"), "{err}");
    assert!(!path.exists());
}

#[test]
fn unknown_tags_are_rejected() {
    let mut fixture = Fixture::new();
    let document: LevelDocument = serde_json::from_value(json!({
        "entities": {
            "floor": {"kind": "entity", "class_unit": "kestrel", "class_name": "Entity", "id": "floor",
                      "position": {"kind": "bogus"}}
        }
    }))
    .unwrap();
    let mut host = EditorHost::new();
    let err = load(&document, &mut fixture.loader, &mut host).unwrap_err();
    assert!(matches!(err, Error::UnknownTag { ref tag } if tag == "bogus"), "{err}");
    assert_eq!(host.entity_count(), 0);

    let document: LevelDocument = serde_json::from_value(json!({
        "entities": {"floor": {"kind": "bogus", "class_unit": "kestrel", "class_name": "Entity"}}
    }))
    .unwrap();
    assert!(matches!(load(&document, &mut fixture.loader, &mut host), Err(Error::UnknownTag { .. })));
}

#[test]
fn quaternions_are_stored_scalar_first() {
    let mut fixture = Fixture::new();
    let mut host = EditorHost::new();
    let turn = Quat::from_xyzw(0.0, 0.6, 0.0, 0.8);
    fixture.spawn(&mut host, ENTITY, "door", &[("orientation", Value::Quat(turn))]);
    let document = serialize(&host.persistent_entities(), host.assets()).unwrap();
    assert_eq!(document.entities["door"]["orientation"], json!({"kind": "quat", "values": [0.8, 0.0, 0.6, 0.0]}));

    let written: LevelDocument = serde_json::from_value(json!({
        "entities": {
            "gate": {"kind": "entity", "class_unit": "kestrel", "class_name": "Entity", "id": "gate",
                     "orientation": {"kind": "quat", "values": [0.8, 0.6, 0.0, 0.0]}}
        }
    }))
    .unwrap();
    let mut loaded = EditorHost::new();
    load(&written, &mut fixture.loader, &mut loaded).unwrap();
    let gate = loaded.entity_by_id("gate").unwrap();
    assert_eq!(gate.field("orientation"), Some(Value::Quat(Quat::from_xyzw(0.6, 0.0, 0.0, 0.8))));
}

#[test]
fn floor_scenario_survives_save_and_load() {
    let mut fixture = Fixture::new();
    let mut host = EditorHost::new();
    fixture.spawn(
        &mut host,
        ENTITY,
        "floor",
        &[("position", Value::Vec3(Vec3::new(0.0, -10.0, 0.0))), ("scalar", Value::Vec3(Vec3::new(10.0, 1.0, 10.0)))],
    );
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("levels").join("floor.json");
    save_level(&path, &host, true).expect("save level");

    let mut loader = Loader::new(MemorySource::new());
    loader.register_native_unit(ENGINE_UNIT, engine_unit()).unwrap();
    let mut fresh = EditorHost::new();
    let report = load_level(&path, &mut loader, &mut fresh).expect("load level");
    assert_eq!(report.entities, 1);
    assert_eq!(fresh.ids(), ["floor"]);
    let floor = fresh.entity_by_id("floor").unwrap();
    assert_eq!(floor.field("position"), Some(Value::Vec3(Vec3::new(0.0, -10.0, 0.0))));
    assert_eq!(floor.field("scalar"), Some(Value::Vec3(Vec3::new(10.0, 1.0, 10.0))));
}

#[test]
fn scripts_are_nested_and_built_after_their_owner() {
    let mut fixture = Fixture::new();
    let mut host = EditorHost::new();
    let floor = fixture.spawn(&mut host, ENTITY, "floor", &[]);
    let dot = fixture.spawn(&mut host, ENTITY, "dot", &[]);
    let spin = fixture.class("game", "Spin");
    let mut fields = Fields::new();
    fields.insert("speed".to_string(), Value::Float(2.5));
    fields.insert("anchor".to_string(), Value::Object(floor));
    host.create_script(&mut fixture.loader, &dot, &spin, fields).unwrap();

    let document = serialize(&host.persistent_entities(), host.assets()).unwrap();
    let scripts = document.entities["dot"]["scripts"].as_array().unwrap();
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0]["kind"], "script");
    assert_eq!(scripts[0]["owner"], json!({"kind": "entity_ref", "id": "dot"}));
    assert_eq!(document.scripts.len(), 1);

    let loaded = roundtrip(&mut fixture, &host);
    let dot = loaded.entity_by_id("dot").unwrap();
    let Some(Value::List(attached)) = dot.field("scripts") else { panic!("scripts list") };
    let script = attached[0].as_object().unwrap();
    assert_eq!(script.field("owner_id"), Some(Value::from("dot")));
    assert_eq!(script.field("parent"), Some(Value::Object(dot.clone())));
    assert_eq!(script.field("speed"), Some(Value::Float(2.5)));
    assert_eq!(script.field("anchor"), Some(Value::Object(loaded.entity_by_id("floor").unwrap())));
    assert_eq!(loaded.callback_count("init"), 1);
}

#[test]
fn values_without_a_handler_fail_loudly() {
    let mut fixture = Fixture::new();
    let mut host = EditorHost::new();
    let a = fixture.spawn(&mut host, CRATE, "a", &[]);
    let widget = Object::new(&fixture.class("game", "Widget"), Fields::new());
    a.set("target", widget);
    let err = serialize(&host.persistent_entities(), host.assets()).unwrap_err();
    assert!(matches!(err, Error::HandlerMissing { .. }), "{err}");

    a.set("target", Value::Class(fixture.class("game", "Widget")));
    assert!(matches!(serialize(&host.persistent_entities(), host.assets()), Err(Error::HandlerMissing { .. })));

    let spin = Object::new(&fixture.class("game", "Spin"), Fields::new());
    a.set("target", spin);
    let err = serialize(&host.persistent_entities(), host.assets()).unwrap_err();
    assert!(matches!(err, Error::MisplacedScript { .. }), "{err}");

    let err = serialize(&[Object::new(&fixture.class("game", "Widget"), Fields::new())], &AssetTables::default())
        .unwrap_err();
    assert!(matches!(err, Error::HandlerMissing { .. }), "{err}");
}

#[test]
fn save_overrides_and_overlays_are_kept() {
    let mut fixture = Fixture::new();
    let mut host = EditorHost::new();
    fixture.spawn(&mut host, ENTITY, "statue", &[("shader", Value::from("toon"))]);
    fixture.spawn(&mut host, ENTITY, "gizmo", &[("overlay", Value::Bool(true))]);

    let document = serialize(&host.persistent_entities(), host.assets()).unwrap();
    assert_eq!(document.entities["statue"]["shader"], "toon");

    let loaded = roundtrip(&mut fixture, &host);
    assert_eq!(loaded.entity_by_id("statue").unwrap().field("shader"), Some(Value::from("toon")));
    assert_eq!(loaded.overlay_entities().len(), 1);
    assert_eq!(loaded.entities().len(), 1);
}

#[test]
fn reload_level_picks_up_new_code() {
    let mut fixture = Fixture::new();
    let mut host = EditorHost::new();
    fixture.spawn(&mut host, CRATE, "crate", &[]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("level.json");
    save_level(&path, &host, false).unwrap();
    let old = host.entity_by_id("crate").unwrap();
    assert_eq!(old.attr_value("marker").unwrap(), Value::Int(1));

    fixture.source.define("game", game_unit(2));
    let report = host.reload_level(&mut fixture.loader, &path).unwrap();
    assert_eq!(report.entities, 1);
    let fresh = host.entity_by_id("crate").unwrap();
    assert_ne!(fresh, old);
    assert_eq!(fresh.attr_value("marker").unwrap(), Value::Int(2));
    assert_eq!(host.entity_count(), 1);
}
