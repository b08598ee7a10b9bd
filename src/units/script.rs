use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use glam::{Quat, Vec2, Vec3, Vec4};
use log::info;
use rhai::{Array, CallFnOptions, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Scope, AST, FLOAT};

use super::{BaseRef, ClassDecl, MemberDecl, UnitDefinition, UnitSource};
use crate::class::{Body, Object};
use crate::error::{Error, Result};
use crate::value::{Fields, Value};
use crate::watch::unit_name_for_path;

pub const DEFAULT_EXTENSION: &str = "rhai";

pub(crate) struct ScriptModule {
    engine: Rc<Engine>,
    ast: AST,
}

/// A function defined in a script unit, called with the receiver's state bound to `this`.
#[derive(Clone)]
pub struct ScriptFn {
    module: Rc<ScriptModule>,
    name: String,
}

impl ScriptFn {
    pub(crate) fn invoke(&self, qualname: &str, receiver: Option<&Object>, args: &[Value]) -> Result<Value> {
        let script_error =
            |err: Box<EvalAltResult>| Error::Script { function: qualname.to_string(), message: err.to_string() };
        let arguments: Vec<Dynamic> = args.iter().map(value_to_dynamic).collect();
        let mut scope = Scope::new();
        let Some(receiver) = receiver else {
            let result = self
                .module
                .engine
                .call_fn_with_options::<Dynamic>(
                    CallFnOptions::new().eval_ast(false),
                    &mut scope,
                    &self.module.ast,
                    &self.name,
                    arguments,
                )
                .map_err(script_error)?;
            return dynamic_to_value(result, qualname);
        };

        let before = receiver_view(receiver);
        let mut this = Dynamic::from_map(
            before.iter().map(|(key, value)| (key.as_str().into(), value_to_dynamic(value))).collect(),
        );
        let result = self
            .module
            .engine
            .call_fn_with_options::<Dynamic>(
                CallFnOptions::new().eval_ast(false).rewind_scope(true).bind_this_ptr(&mut this),
                &mut scope,
                &self.module.ast,
                &self.name,
                arguments,
            )
            .map_err(script_error)?;
        write_back(receiver, &before, this, qualname)?;
        dynamic_to_value(result, qualname)
    }
}

/// Class data visible on the receiver, overlaid with its instance fields.
fn receiver_view(receiver: &Object) -> Fields {
    let mut view = Fields::new();
    for class in receiver.class().mro() {
        for (name, member) in class.own_members() {
            if let crate::class::Member::Data(value) = member {
                view.entry(name).or_insert(value);
            }
        }
    }
    view.extend(receiver.fields());
    view
}

fn write_back(receiver: &Object, before: &Fields, this: Dynamic, qualname: &str) -> Result<()> {
    let after = this.try_cast::<Map>().ok_or_else(|| Error::Script {
        function: qualname.to_string(),
        message: "`this` was replaced by a non-map value".to_string(),
    })?;
    for (key, value) in after {
        let value = dynamic_to_value(value, qualname)?;
        if receiver.has_field(&key) || before.get(key.as_str()) != Some(&value) {
            receiver.set(&key, value);
        }
    }
    Ok(())
}

pub(crate) fn value_to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Nil => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Int(i) => Dynamic::from(*i),
        Value::Float(f) => Dynamic::from(*f as FLOAT),
        Value::Str(s) => Dynamic::from(s.clone()),
        Value::List(items) => Dynamic::from_array(items.iter().map(value_to_dynamic).collect()),
        Value::Map(map) => Dynamic::from_map(
            map.iter().map(|(key, value)| (key.as_str().into(), value_to_dynamic(value))).collect(),
        ),
        other => Dynamic::from(other.clone()),
    }
}

pub(crate) fn dynamic_to_value(value: Dynamic, context: &str) -> Result<Value> {
    let type_name = value.type_name();
    let unsupported = || Error::Script {
        function: context.to_string(),
        message: format!("unsupported script value of type {type_name}"),
    };
    if value.is_unit() {
        return Ok(Value::Nil);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::Int(i));
    }
    if let Ok(f) = value.as_float() {
        return Ok(Value::Float(f));
    }
    if let Ok(c) = value.as_char() {
        return Ok(Value::Str(c.to_string()));
    }
    if value.is_string() {
        return value.into_string().map(Value::Str).map_err(|_| unsupported());
    }
    if value.is_array() {
        let items = value.into_array().map_err(|_| unsupported())?;
        return items.into_iter().map(|item| dynamic_to_value(item, context)).collect::<Result<_>>().map(Value::List);
    }
    if value.is_map() {
        let map = value.try_cast::<Map>().ok_or_else(unsupported)?;
        return map
            .into_iter()
            .map(|(key, item)| Ok((key.to_string(), dynamic_to_value(item, context)?)))
            .collect::<Result<_>>()
            .map(Value::Map);
    }
    value.try_cast::<Value>().ok_or_else(unsupported)
}

enum ScriptMember {
    Data(Dynamic),
    Method { function: String, reloadable: bool },
    Static(String),
    Property(String),
    Alias(String),
}

#[derive(Default)]
struct ScriptClass {
    name: String,
    bases: Vec<String>,
    members: Vec<(String, ScriptMember)>,
    hooks: BTreeMap<String, String>,
    savable: Vec<(String, String)>,
}

/// Handle returned by `define_class` inside a script; chained calls declare members.
#[derive(Clone)]
pub struct ClassBuilder(Rc<RefCell<ScriptClass>>);

impl ClassBuilder {
    fn push(&mut self, name: &str, member: ScriptMember) -> Self {
        self.0.borrow_mut().members.push((name.to_string(), member));
        self.clone()
    }

    fn into_decl(self, unit: &str, module: &Rc<ScriptModule>, functions: &BTreeSet<String>) -> Result<ClassDecl> {
        let spec = self.0.borrow();
        let script_fn = |function: &str| -> Result<Body> {
            if !functions.contains(function) {
                return Err(Error::UnitLoad {
                    unit: unit.to_string(),
                    message: format!("class '{}' refers to undefined function '{function}'", spec.name),
                });
            }
            Ok(Body::Script(ScriptFn { module: Rc::clone(module), name: function.to_string() }))
        };

        let mut decl = ClassDecl::new(&spec.name);
        for base in &spec.bases {
            decl.push_base(BaseRef::parse(base, unit));
        }
        for (name, member) in &spec.members {
            let member = match member {
                ScriptMember::Data(value) => MemberDecl::Data(dynamic_to_value(value.clone(), name)?),
                ScriptMember::Method { function, reloadable } => MemberDecl::Method {
                    body: script_fn(function)?,
                    reloadable: *reloadable,
                    hook: spec.hooks.get(name).cloned(),
                },
                ScriptMember::Static(function) => MemberDecl::Static(script_fn(function)?),
                ScriptMember::Property(function) => MemberDecl::Property(script_fn(function)?),
                ScriptMember::Alias(target) => MemberDecl::Alias(target.clone()),
            };
            decl.push_member(name, member);
        }
        if !spec.savable.is_empty() {
            let table = spec.savable.iter().map(|(arg, attr)| (arg.clone(), Value::Str(attr.clone()))).collect();
            decl.push_member("savable_attributes", MemberDecl::Data(Value::Map(table)));
        }
        Ok(decl)
    }
}

fn number(value: Dynamic) -> std::result::Result<f32, Box<EvalAltResult>> {
    if let Ok(f) = value.as_float() {
        return Ok(f as f32);
    }
    value.as_int().map(|i| i as f32).map_err(|found| format!("expected a number, found {found}").into())
}

fn component(value: &mut Value, index: usize) -> std::result::Result<FLOAT, Box<EvalAltResult>> {
    let parts: Vec<f32> = match value {
        Value::Vec2(v) => v.to_array().to_vec(),
        Value::Vec3(v) => v.to_array().to_vec(),
        Value::Vec4(v) => v.to_array().to_vec(),
        Value::Quat(q) => q.to_array().to_vec(),
        other => return Err(format!("{} has no vector components", other.type_name()).into()),
    };
    parts
        .get(index)
        .map(|part| *part as FLOAT)
        .ok_or_else(|| format!("{} has no component {index}", value.type_name()).into())
}

fn build_engine(pending: Rc<RefCell<Vec<ClassBuilder>>>) -> Engine {
    let mut engine = Engine::new();
    engine.set_fast_operators(true);
    engine.on_print(|text| info!("[script] {text}"));
    engine.register_type_with_name::<ClassBuilder>("ClassBuilder");
    engine.register_type_with_name::<Value>("Value");

    let sink = Rc::clone(&pending);
    engine.register_fn("define_class", move |name: &str| -> ClassBuilder {
        let builder = ClassBuilder(Rc::new(RefCell::new(ScriptClass { name: name.to_string(), ..Default::default() })));
        sink.borrow_mut().push(builder.clone());
        builder
    });
    let sink = pending;
    engine.register_fn("define_class", move |name: &str, bases: Array| -> ClassBuilder {
        let bases = bases.iter().map(|base| base.to_string()).collect();
        let builder =
            ClassBuilder(Rc::new(RefCell::new(ScriptClass { name: name.to_string(), bases, ..Default::default() })));
        sink.borrow_mut().push(builder.clone());
        builder
    });

    engine.register_fn("data", |b: &mut ClassBuilder, name: &str, value: Dynamic| {
        b.push(name, ScriptMember::Data(value))
    });
    engine.register_fn("method", |b: &mut ClassBuilder, name: &str| {
        b.push(name, ScriptMember::Method { function: name.to_string(), reloadable: false })
    });
    engine.register_fn("method", |b: &mut ClassBuilder, name: &str, function: &str| {
        b.push(name, ScriptMember::Method { function: function.to_string(), reloadable: false })
    });
    engine.register_fn("reloadable_method", |b: &mut ClassBuilder, name: &str| {
        b.push(name, ScriptMember::Method { function: name.to_string(), reloadable: true })
    });
    engine.register_fn("reloadable_method", |b: &mut ClassBuilder, name: &str, function: &str| {
        b.push(name, ScriptMember::Method { function: function.to_string(), reloadable: true })
    });
    engine.register_fn("static_method", |b: &mut ClassBuilder, name: &str| {
        b.push(name, ScriptMember::Static(name.to_string()))
    });
    engine.register_fn("static_method", |b: &mut ClassBuilder, name: &str, function: &str| {
        b.push(name, ScriptMember::Static(function.to_string()))
    });
    engine.register_fn("property", |b: &mut ClassBuilder, name: &str, function: &str| {
        b.push(name, ScriptMember::Property(function.to_string()))
    });
    engine.register_fn("alias", |b: &mut ClassBuilder, name: &str, target: &str| {
        b.push(name, ScriptMember::Alias(target.to_string()))
    });
    engine.register_fn("hook", |b: &mut ClassBuilder, member: &str, hook: &str| {
        b.0.borrow_mut().hooks.insert(member.to_string(), hook.to_string());
        b.clone()
    });
    engine.register_fn("savable", |b: &mut ClassBuilder, argument: &str, attribute: &str| {
        b.0.borrow_mut().savable.push((argument.to_string(), attribute.to_string()));
        b.clone()
    });

    engine.register_fn("vec2", |x: Dynamic, y: Dynamic| -> std::result::Result<Value, Box<EvalAltResult>> {
        Ok(Value::Vec2(Vec2::new(number(x)?, number(y)?)))
    });
    engine.register_fn(
        "vec3",
        |x: Dynamic, y: Dynamic, z: Dynamic| -> std::result::Result<Value, Box<EvalAltResult>> {
            Ok(Value::Vec3(Vec3::new(number(x)?, number(y)?, number(z)?)))
        },
    );
    engine.register_fn(
        "vec4",
        |x: Dynamic, y: Dynamic, z: Dynamic, w: Dynamic| -> std::result::Result<Value, Box<EvalAltResult>> {
            Ok(Value::Vec4(Vec4::new(number(x)?, number(y)?, number(z)?, number(w)?)))
        },
    );
    engine.register_fn(
        "quat",
        |x: Dynamic, y: Dynamic, z: Dynamic, w: Dynamic| -> std::result::Result<Value, Box<EvalAltResult>> {
            Ok(Value::Quat(Quat::from_xyzw(number(x)?, number(y)?, number(z)?, number(w)?)))
        },
    );
    engine.register_get("x", |v: &mut Value| component(v, 0));
    engine.register_get("y", |v: &mut Value| component(v, 1));
    engine.register_get("z", |v: &mut Value| component(v, 2));
    engine.register_get("w", |v: &mut Value| component(v, 3));
    // Also serves `object.name` property access on host objects.
    engine.register_indexer_get(
        |v: &mut Value, name: ImmutableString| -> std::result::Result<Dynamic, Box<EvalAltResult>> {
            match v {
                Value::Object(object) => object
                    .attr_value(name.as_str())
                    .map(|value| value_to_dynamic(&value))
                    .map_err(|err| err.to_string().into()),
                other => Err(format!("{} has no attribute '{name}'", other.type_name()).into()),
            }
        },
    );
    engine.register_fn("log", |message: &str| info!("[script] {message}"));
    engine
}

/// Loads units from script files under a root directory: unit `game.props` is `game/props.rhai`.
pub struct ScriptDirectory {
    root: PathBuf,
    extension: String,
    engine: Rc<Engine>,
    pending: Rc<RefCell<Vec<ClassBuilder>>>,
}

impl ScriptDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_extension(root, DEFAULT_EXTENSION)
    }

    pub fn with_extension(root: impl Into<PathBuf>, extension: &str) -> Self {
        let pending = Rc::new(RefCell::new(Vec::new()));
        let engine = Rc::new(build_engine(Rc::clone(&pending)));
        Self { root: root.into(), extension: extension.trim_start_matches('.').to_string(), engine, pending }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn path_for(&self, unit: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in unit.split('.') {
            path.push(part);
        }
        path.set_extension(&self.extension);
        path
    }

    pub fn unit_for_path(&self, path: &Path) -> Option<String> {
        unit_name_for_path(&self.root, path, &self.extension)
    }

    fn evaluate(&self, unit: &str, path: &Path, source: &str) -> Result<(AST, Vec<ClassBuilder>)> {
        let failed = |err: &dyn std::fmt::Display| Error::UnitLoad {
            unit: unit.to_string(),
            message: format!("{}: {err}", path.display()),
        };
        let ast = self.engine.compile(source).map_err(|err| failed(&err))?;
        self.pending.borrow_mut().clear();
        let run = self.engine.run_ast(&ast);
        let builders: Vec<ClassBuilder> = self.pending.borrow_mut().drain(..).collect();
        run.map_err(|err| failed(&err))?;
        Ok((ast, builders))
    }
}

impl UnitSource for ScriptDirectory {
    fn load_unit(&self, name: &str) -> Result<UnitDefinition> {
        let path = self.path_for(name);
        let source = fs::read_to_string(&path).map_err(|err| Error::UnitLoad {
            unit: name.to_string(),
            message: format!("reading {}: {err}", path.display()),
        })?;
        let fingerprint = blake3::hash(source.as_bytes()).to_hex().to_string();
        let (ast, builders) = self.evaluate(name, &path, &source)?;
        let functions: BTreeSet<String> = ast.iter_functions().map(|f| f.name.to_string()).collect();
        let module = Rc::new(ScriptModule { engine: Rc::clone(&self.engine), ast });
        let mut definition = UnitDefinition::new().with_fingerprint(fingerprint);
        for builder in builders {
            definition.push_class(builder.into_decl(name, &module, &functions)?);
        }
        Ok(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_unit_names_map_to_nested_files() {
        let dir = ScriptDirectory::new("/levels/scripts");
        assert_eq!(dir.path_for("game.props"), PathBuf::from("/levels/scripts/game/props.rhai"));
        assert_eq!(dir.unit_for_path(Path::new("/levels/scripts/game/props.rhai")).as_deref(), Some("game.props"));
    }

    #[test]
    fn script_values_convert_both_ways() {
        let value = Value::List(vec![Value::Int(2), Value::Str("a".into()), Value::Vec3(Vec3::Y)]);
        let back = dynamic_to_value(value_to_dynamic(&value), "test").unwrap();
        assert_eq!(back, value);
        assert_eq!(dynamic_to_value(Dynamic::UNIT, "test").unwrap(), Value::Nil);
    }
}
