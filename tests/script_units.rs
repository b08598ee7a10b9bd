use glam::Vec3;
use kestrel_live::error::Error;
use kestrel_live::level::{load_level, save_level};
use kestrel_live::{engine_unit, EditorHost, Fields, LevelHost, Loader, Object, ScriptDirectory, Value, ENGINE_UNIT};
use std::fs;
use std::path::Path;

const PROPS_V1: &str = r#"
fn bar() { 1 }
fn describe() { "crate " + this.n }

define_class("Crate", ["kestrel:Entity"])
    .data("n", 5)
    .reloadable_method("bar")
    .method("describe");
"#;

const PROPS_V2: &str = r#"
fn bar() { 2 }
fn describe() { "crate " + this.n }
fn baz() { this.n }

define_class("Crate", ["kestrel:Entity"])
    .data("n", 5)
    .reloadable_method("bar")
    .method("describe")
    .method("baz");
"#;

const SPIN: &str = r#"
fn init() {
    this.count = 0;
    this.owner_id = this.parent.id;
}
fn tick(dt) { this.count += dt; }
fn double(x) { x * 2 }
fn area() { this.w * this.h }

define_class("Spin", ["kestrel:Script"])
    .data("w", 3)
    .data("h", 4)
    .method("init")
    .method("tick")
    .hook("tick", "frame")
    .static_method("double")
    .property("area", "area")
    .savable("speed", "speed")
    .savable("count", "count");
"#;

fn write_unit(root: &Path, relative: &str, source: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, source).unwrap();
}

fn loader_for(root: &Path) -> Loader {
    let mut loader = Loader::new(ScriptDirectory::new(root));
    loader.register_native_unit(ENGINE_UNIT, engine_unit()).expect("engine unit");
    loader
}

#[test]
fn editing_a_script_file_patches_live_instances() {
    let dir = tempfile::tempdir().unwrap();
    write_unit(dir.path(), "game/props.rhai", PROPS_V1);
    let mut loader = loader_for(dir.path());
    let class = loader.load_class("game.props", "Crate", true).expect("load Crate");
    let instance = Object::new(&class, Fields::new());
    let bar = instance.method("bar").unwrap();
    assert_eq!(bar.call(&[]).unwrap(), Value::Int(1));
    assert_eq!(instance.call("describe", &[]).unwrap(), Value::from("crate 5"));
    assert!(!instance.has_attr("baz"));

    write_unit(dir.path(), "game/props.rhai", PROPS_V2);
    let report = loader.reload().expect("reload");
    assert_eq!(report.units_reloaded, 1);

    assert_eq!(bar.call(&[]).unwrap(), Value::Int(2));
    assert_eq!(instance.call("baz", &[]).unwrap(), Value::Int(5));
}

#[test]
fn untouched_files_are_not_re_evaluated() {
    let dir = tempfile::tempdir().unwrap();
    write_unit(dir.path(), "game/props.rhai", PROPS_V1);
    let mut loader = loader_for(dir.path());
    let class = loader.load_class("game.props", "Crate", true).unwrap();
    write_unit(dir.path(), "game/props.rhai", PROPS_V1);
    let report = loader.reload().unwrap();
    assert_eq!(report.units_reloaded, 0);
    assert_eq!(loader.get_newer_class(&class, true).unwrap(), class);
}

#[test]
fn syntax_errors_keep_the_running_code() {
    let dir = tempfile::tempdir().unwrap();
    write_unit(dir.path(), "game/props.rhai", PROPS_V1);
    let mut loader = loader_for(dir.path());
    let class = loader.load_class("game.props", "Crate", true).unwrap();
    let instance = Object::new(&class, Fields::new());

    write_unit(dir.path(), "game/props.rhai", "fn bar( { 3 }");
    let err = loader.reload().unwrap_err();
    assert!(matches!(err, Error::UnitReloadFailure { ref unit, .. } if unit == "game.props"), "{err}");
    assert!(matches!(err.root_cause(), Error::UnitLoad { .. }));
    assert_eq!(instance.call("bar", &[]).unwrap(), Value::Int(1));

    write_unit(dir.path(), "game/props.rhai", PROPS_V2);
    loader.reload().unwrap();
    assert_eq!(instance.call("bar", &[]).unwrap(), Value::Int(2));
}

#[test]
fn undefined_script_functions_fail_the_load() {
    let dir = tempfile::tempdir().unwrap();
    write_unit(dir.path(), "broken.rhai", r#"define_class("Broken").method("missing");"#);
    let mut loader = loader_for(dir.path());
    let err = loader.load_class("broken", "Broken", true).unwrap_err();
    assert!(matches!(err, Error::UnitLoad { ref message, .. } if message.contains("missing")), "{err}");
}

#[test]
fn script_members_behave_like_native_ones() {
    let dir = tempfile::tempdir().unwrap();
    write_unit(dir.path(), "game/props.rhai", PROPS_V1);
    write_unit(dir.path(), "game/spin.rhai", SPIN);
    let mut loader = loader_for(dir.path());
    let mut host = EditorHost::new();
    let crate_class = loader.load_class("game.props", "Crate", true).unwrap();
    let spin = loader.load_class("game.spin", "Spin", true).unwrap();

    let mut fields = Fields::new();
    fields.insert("id".to_string(), Value::from("box"));
    let owner = host.create_entity(&mut loader, &crate_class, fields).unwrap();
    let script = host.create_script(&mut loader, &owner, &spin, Fields::new()).unwrap();

    assert_eq!(script.field("owner_id"), Some(Value::from("box")));
    assert_eq!(spin.call_static("double", &[Value::Int(4)]).unwrap(), Value::Int(8));
    assert_eq!(script.attr_value("area").unwrap(), Value::Int(12));

    assert_eq!(host.dispatch("frame", &[Value::Int(3)]).unwrap(), 1);
    assert_eq!(host.dispatch("frame", &[Value::Int(4)]).unwrap(), 1);
    assert_eq!(script.field("count"), Some(Value::Int(7)));
    assert_eq!(script.field("w"), None, "class data is not copied onto the instance");
}

#[test]
fn scripted_level_saves_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let scripts = dir.path().join("scripts");
    write_unit(&scripts, "game/props.rhai", PROPS_V1);
    write_unit(&scripts, "game/spin.rhai", SPIN);
    let level = dir.path().join("level.json");

    let mut loader = loader_for(&scripts);
    let mut host = EditorHost::new();
    let crate_class = loader.load_class("game.props", "Crate", true).unwrap();
    let spin = loader.load_class("game.spin", "Spin", true).unwrap();
    let mut fields = Fields::new();
    fields.insert("id".to_string(), Value::from("box"));
    fields.insert("position".to_string(), Value::Vec3(Vec3::new(1.0, 2.0, 3.0)));
    let owner = host.create_entity(&mut loader, &crate_class, fields).unwrap();
    let mut fields = Fields::new();
    fields.insert("speed".to_string(), Value::Float(1.5));
    host.create_script(&mut loader, &owner, &spin, fields).unwrap();
    host.dispatch("frame", &[Value::Int(2)]).unwrap();
    save_level(&level, &host, true).expect("save level");

    let mut fresh_loader = loader_for(&scripts);
    let mut fresh = EditorHost::new();
    let report = load_level(&level, &mut fresh_loader, &mut fresh).expect("load level");
    assert_eq!((report.entities, report.scripts), (1, 1));
    let owner = fresh.entity_by_id("box").unwrap();
    assert_eq!(owner.field("position"), Some(Value::Vec3(Vec3::new(1.0, 2.0, 3.0))));
    let Some(Value::List(attached)) = owner.field("scripts") else { panic!("scripts list") };
    let script = attached[0].as_object().unwrap();
    assert_eq!(script.field("speed"), Some(Value::Float(1.5)));
    assert_eq!(script.field("owner_id"), Some(Value::from("box")));
    // init runs on load, after the saved fields are set.
    assert_eq!(script.field("count"), Some(Value::Int(0)));

    write_unit(&scripts, "game/props.rhai", PROPS_V2);
    let report = fresh.reload_level(&mut fresh_loader, &level).unwrap();
    assert_eq!(report.entities, 1);
    let owner = fresh.entity_by_id("box").unwrap();
    assert_eq!(owner.call("bar", &[]).unwrap(), Value::Int(2));
}
