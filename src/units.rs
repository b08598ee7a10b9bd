pub mod memory;
pub mod script;

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use log::debug;

use crate::class::{default_repr, Body, Class, ClassSpec, Function, Member, Object, PersistKind, REPR};
use crate::error::{Error, Result};
use crate::reloadable::reloadable;
use crate::value::Value;

pub use memory::MemorySource;
pub use script::ScriptDirectory;

/// Where unit definitions come from. Called again on every reload.
pub trait UnitSource {
    fn load_unit(&self, name: &str) -> Result<UnitDefinition>;
}

/// The evaluated body of a unit: its class declarations in order.
#[derive(Clone, Default)]
pub struct UnitDefinition {
    classes: Vec<ClassDecl>,
    fingerprint: Option<String>,
}

impl UnitDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(mut self, decl: ClassDecl) -> Self {
        self.classes.push(decl);
        self
    }

    pub fn push_class(&mut self, decl: ClassDecl) {
        self.classes.push(decl);
    }

    /// Reloads with an unchanged fingerprint leave the unit's classes alone.
    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub fn classes(&self) -> &[ClassDecl] {
        &self.classes
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaseRef {
    pub unit: String,
    pub class: String,
}

impl BaseRef {
    pub fn new(unit: &str, class: &str) -> Self {
        Self { unit: unit.to_string(), class: class.to_string() }
    }

    /// `unit:Class`, or a bare `Class` resolved in `current_unit`.
    pub fn parse(text: &str, current_unit: &str) -> Self {
        match text.split_once(':') {
            Some((unit, class)) => Self::new(unit.trim(), class.trim()),
            None => Self::new(current_unit, text.trim()),
        }
    }
}

#[derive(Clone)]
pub enum MemberDecl {
    Data(Value),
    Method { body: Body, reloadable: bool, hook: Option<String> },
    Static(Body),
    Property(Body),
    /// Binds the name to the member already declared under the target name.
    Alias(String),
}

#[derive(Clone)]
pub struct ClassDecl {
    name: String,
    bases: Vec<BaseRef>,
    members: Vec<(String, MemberDecl)>,
    native: bool,
    persist: Option<PersistKind>,
}

fn method_body<F>(qualname: String, f: F) -> Body
where
    F: Fn(&Object, &[Value]) -> Result<Value> + 'static,
{
    Body::native(move |receiver, args| match receiver {
        Some(object) => f(object, args),
        None => Err(Error::MissingReceiver { function: qualname.clone() }),
    })
}

impl ClassDecl {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), bases: Vec::new(), members: Vec::new(), native: false, persist: None }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(mut self, unit: &str, class: &str) -> Self {
        self.bases.push(BaseRef::new(unit, class));
        self
    }

    pub fn push_base(&mut self, base: BaseRef) {
        self.bases.push(base);
    }

    /// Marks the class as compiled into the host; reload never patches it.
    pub fn native(mut self) -> Self {
        self.native = true;
        self
    }

    pub fn persist(mut self, kind: PersistKind) -> Self {
        self.persist = Some(kind);
        self
    }

    pub fn member(mut self, name: &str, decl: MemberDecl) -> Self {
        self.push_member(name, decl);
        self
    }

    pub fn push_member(&mut self, name: &str, decl: MemberDecl) {
        self.members.push((name.to_string(), decl));
    }

    pub fn data(self, name: &str, value: impl Into<Value>) -> Self {
        self.member(name, MemberDecl::Data(value.into()))
    }

    pub fn method<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&Object, &[Value]) -> Result<Value> + 'static,
    {
        let body = method_body(format!("{}.{name}", self.name), f);
        self.member(name, MemberDecl::Method { body, reloadable: false, hook: None })
    }

    pub fn reloadable_method<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&Object, &[Value]) -> Result<Value> + 'static,
    {
        let body = method_body(format!("{}.{name}", self.name), f);
        self.member(name, MemberDecl::Method { body, reloadable: true, hook: None })
    }

    /// A method the host registers as a callback for `hook` when an instance is created.
    pub fn hooked_method<F>(self, name: &str, hook: &str, f: F) -> Self
    where
        F: Fn(&Object, &[Value]) -> Result<Value> + 'static,
    {
        let body = method_body(format!("{}.{name}", self.name), f);
        self.member(name, MemberDecl::Method { body, reloadable: false, hook: Some(hook.to_string()) })
    }

    pub fn static_method<F>(self, name: &str, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + 'static,
    {
        self.member(name, MemberDecl::Static(Body::native(move |_, args| f(args))))
    }

    pub fn property<F>(self, name: &str, getter: F) -> Self
    where
        F: Fn(&Object) -> Result<Value> + 'static,
    {
        let body = method_body(format!("{}.{name}", self.name), move |object, _| getter(object));
        self.member(name, MemberDecl::Property(body))
    }

    pub fn alias(self, name: &str, target: &str) -> Self {
        self.member(name, MemberDecl::Alias(target.to_string()))
    }

    fn materialize(&self, unit: &str, bases: Vec<Class>, force_native: bool) -> Result<Class> {
        let mut members: BTreeMap<String, Member> = BTreeMap::new();
        for (name, decl) in &self.members {
            let qualname = format!("{}.{name}", self.name);
            let member = match decl {
                MemberDecl::Data(value) => Member::Data(value.clone()),
                MemberDecl::Method { body, reloadable: wrap, hook } => {
                    let function = Rc::new(Function::new(qualname, hook.clone(), body.clone()));
                    Member::Method(if *wrap { reloadable(&function, None) } else { function })
                }
                MemberDecl::Static(body) => Member::Static(Rc::new(Function::new(qualname, None, body.clone()))),
                MemberDecl::Property(body) => {
                    Member::Property(Rc::new(Function::new(qualname, None, body.clone())))
                }
                MemberDecl::Alias(target) => members.get(target).cloned().ok_or_else(|| Error::UnitLoad {
                    unit: unit.to_string(),
                    message: format!("'{}.{name}' aliases undeclared member '{target}'", self.name),
                })?,
            };
            members.insert(name.clone(), member);
        }
        members.entry(REPR.to_string()).or_insert_with(|| Member::Builtin(default_repr(&self.name)));
        Class::new(ClassSpec {
            name: self.name.clone(),
            unit: unit.to_string(),
            bases,
            members,
            native: self.native || force_native,
            persist: self.persist,
        })
    }
}

/// A loaded unit. The handle stays the same across reloads; its namespace is swapped.
pub struct SourceUnit {
    name: String,
    native: bool,
    namespace: RefCell<BTreeMap<String, Class>>,
    fingerprint: RefCell<Option<String>>,
    generation: Cell<u32>,
}

impl SourceUnit {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_native(&self) -> bool {
        self.native
    }

    pub fn class(&self, name: &str) -> Option<Class> {
        self.namespace.borrow().get(name).cloned()
    }

    pub fn class_names(&self) -> Vec<String> {
        self.namespace.borrow().keys().cloned().collect()
    }

    /// Number of successful re-evaluations since the first import.
    pub fn generation(&self) -> u32 {
        self.generation.get()
    }

    fn replace(&self, namespace: BTreeMap<String, Class>, fingerprint: Option<String>) {
        *self.namespace.borrow_mut() = namespace;
        *self.fingerprint.borrow_mut() = fingerprint;
        self.generation.set(self.generation.get() + 1);
    }
}

/// Process-wide table of loaded units, keyed by unit name.
pub struct ModuleCache {
    source: Box<dyn UnitSource>,
    units: BTreeMap<String, Rc<SourceUnit>>,
    loading: Vec<String>,
}

impl ModuleCache {
    pub fn new(source: impl UnitSource + 'static) -> Self {
        Self { source: Box::new(source), units: BTreeMap::new(), loading: Vec::new() }
    }

    /// Installs a unit whose classes are compiled into the host. Every class in it is native.
    pub fn register_native_unit(&mut self, name: &str, definition: UnitDefinition) -> Result<Rc<SourceUnit>> {
        let namespace = self.evaluate_guarded(name, &definition, true)?;
        let unit = Rc::new(SourceUnit {
            name: name.to_string(),
            native: true,
            namespace: RefCell::new(namespace),
            fingerprint: RefCell::new(None),
            generation: Cell::new(0),
        });
        self.units.insert(name.to_string(), Rc::clone(&unit));
        Ok(unit)
    }

    pub fn get(&self, name: &str) -> Option<Rc<SourceUnit>> {
        self.units.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.contains_key(name)
    }

    pub fn unit_names(&self) -> Vec<String> {
        self.units.keys().cloned().collect()
    }

    /// Returns the cached unit, or loads it. The flag is true when this call did the loading.
    pub fn import(&mut self, name: &str) -> Result<(Rc<SourceUnit>, bool)> {
        if let Some(unit) = self.units.get(name) {
            return Ok((Rc::clone(unit), false));
        }
        if self.loading.iter().any(|pending| pending == name) {
            let mut chain = self.loading.clone();
            chain.push(name.to_string());
            return Err(Error::ImportCycle { unit: name.to_string(), chain: chain.join(" -> ") });
        }
        let definition = self.source.load_unit(name)?;
        let namespace = self.evaluate_guarded(name, &definition, false)?;
        debug!("[units] imported '{name}' ({} classes)", namespace.len());
        let unit = Rc::new(SourceUnit {
            name: name.to_string(),
            native: false,
            namespace: RefCell::new(namespace),
            fingerprint: RefCell::new(definition.fingerprint().map(str::to_string)),
            generation: Cell::new(0),
        });
        self.units.insert(name.to_string(), Rc::clone(&unit));
        Ok((unit, true))
    }

    /// Re-evaluates the unit from its source. On failure the unit keeps its previous namespace.
    /// Returns whether new class objects were produced.
    pub fn reload(&mut self, unit: &Rc<SourceUnit>) -> Result<bool> {
        if unit.native {
            return Ok(false);
        }
        let failure = |source: Error| Error::UnitReloadFailure { unit: unit.name.clone(), source: Box::new(source) };
        let definition = self.source.load_unit(&unit.name).map_err(failure)?;
        let unchanged = match (definition.fingerprint(), unit.fingerprint.borrow().as_deref()) {
            (Some(new), Some(old)) => new == old,
            _ => false,
        };
        if unchanged {
            debug!("[units] '{}' unchanged, keeping current classes", unit.name);
            return Ok(false);
        }
        let namespace = self.evaluate_guarded(&unit.name, &definition, false).map_err(failure)?;
        unit.replace(namespace, definition.fingerprint().map(str::to_string));
        debug!("[units] re-evaluated '{}' (generation {})", unit.name, unit.generation());
        Ok(true)
    }

    fn evaluate_guarded(
        &mut self,
        name: &str,
        definition: &UnitDefinition,
        force_native: bool,
    ) -> Result<BTreeMap<String, Class>> {
        self.loading.push(name.to_string());
        let result = self.evaluate(name, definition, force_native);
        self.loading.pop();
        result
    }

    fn evaluate(
        &mut self,
        name: &str,
        definition: &UnitDefinition,
        force_native: bool,
    ) -> Result<BTreeMap<String, Class>> {
        let mut namespace: BTreeMap<String, Class> = BTreeMap::new();
        for decl in definition.classes() {
            let mut bases = Vec::with_capacity(decl.bases.len());
            for base in &decl.bases {
                let class = if base.unit == name {
                    namespace.get(&base.class).cloned()
                } else {
                    self.import(&base.unit)?.0.class(&base.class)
                };
                bases.push(class.ok_or_else(|| Error::ClassNotFound {
                    unit: base.unit.clone(),
                    class: base.class.clone(),
                })?);
            }
            let class = decl.materialize(name, bases, force_native)?;
            namespace.insert(decl.name.clone(), class);
        }
        Ok(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Fields;

    #[test]
    fn import_is_cached_and_reports_freshness() {
        let source = MemorySource::new();
        source.define("shapes", UnitDefinition::new().class(ClassDecl::new("Square").data("sides", 4)));
        let mut cache = ModuleCache::new(source);
        let (first, fresh) = cache.import("shapes").unwrap();
        assert!(fresh);
        let (second, fresh) = cache.import("shapes").unwrap();
        assert!(!fresh);
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(first.class("Square").unwrap().data("sides"), Some(Value::Int(4)));
    }

    #[test]
    fn cross_unit_cycle_is_reported() {
        let source = MemorySource::new();
        source.define("a", UnitDefinition::new().class(ClassDecl::new("A").base("b", "B")));
        source.define("b", UnitDefinition::new().class(ClassDecl::new("B").base("a", "A")));
        let mut cache = ModuleCache::new(source);
        match cache.import("a") {
            Err(Error::ImportCycle { chain, .. }) => assert_eq!(chain, "a -> b -> a"),
            other => panic!("expected import cycle, got {:?}", other.map(|(unit, _)| unit.name().to_string())),
        }
        assert!(!cache.contains("a"));
    }

    #[test]
    fn failed_reload_keeps_previous_namespace() {
        let source = MemorySource::new();
        source.define("shapes", UnitDefinition::new().class(ClassDecl::new("Square")));
        let mut cache = ModuleCache::new(source.clone());
        let (unit, _) = cache.import("shapes").unwrap();
        let before = unit.class("Square").unwrap();
        source.break_unit("shapes", "unexpected indent");
        let err = cache.reload(&unit).unwrap_err();
        assert!(matches!(err, Error::UnitReloadFailure { .. }));
        assert_eq!(unit.class("Square"), Some(before));
        assert_eq!(unit.generation(), 0);
    }

    #[test]
    fn alias_shares_the_declared_function() {
        let decl = ClassDecl::new("Foo").method("baz", |_, _| Ok(Value::Int(5))).alias("bar", "baz");
        let source = MemorySource::new();
        source.define("foo", UnitDefinition::new().class(decl));
        let mut cache = ModuleCache::new(source);
        let class = cache.import("foo").unwrap().0.class("Foo").unwrap();
        let object = Object::new(&class, Fields::new());
        assert_eq!(object.call("bar", &[]).unwrap(), Value::Int(5));
        assert_eq!(class.function("bar").unwrap().qualname(), "Foo.baz");
    }

    #[test]
    fn bare_base_names_resolve_in_the_declaring_unit() {
        assert_eq!(BaseRef::parse("Base", "game.props"), BaseRef::new("game.props", "Base"));
        assert_eq!(BaseRef::parse("kestrel:Entity", "game.props"), BaseRef::new("kestrel", "Entity"));
    }
}
