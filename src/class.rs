use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::reloadable::ReloadableFn;
use crate::units::script::ScriptFn;
use crate::value::{Fields, Value};

/// Name of the default special method every class receives unless it declares its own.
pub const REPR: &str = "__repr__";

pub type NativeFn = Rc<dyn Fn(Option<&Object>, &[Value]) -> Result<Value>>;

/// A concrete implementation: a Rust closure or a function compiled from a script unit.
#[derive(Clone)]
pub enum Body {
    Native(NativeFn),
    Script(ScriptFn),
}

impl Body {
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(Option<&Object>, &[Value]) -> Result<Value> + 'static,
    {
        Body::Native(Rc::new(f))
    }

    fn invoke(&self, qualname: &str, receiver: Option<&Object>, args: &[Value]) -> Result<Value> {
        match self {
            Body::Native(f) => f(receiver, args),
            Body::Script(script) => script.invoke(qualname, receiver, args),
        }
    }
}

pub(crate) enum FunctionKind {
    Plain(Body),
    Indirect(ReloadableFn),
}

pub struct Function {
    qualname: String,
    hook: Option<String>,
    kind: FunctionKind,
}

impl Function {
    pub fn new(qualname: impl Into<String>, hook: Option<String>, body: Body) -> Self {
        Self { qualname: qualname.into(), hook, kind: FunctionKind::Plain(body) }
    }

    pub(crate) fn indirect(qualname: String, hook: Option<String>, inner: ReloadableFn) -> Self {
        Self { qualname, hook, kind: FunctionKind::Indirect(inner) }
    }

    /// `Class.member` of the definition this function came from.
    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    pub fn name(&self) -> &str {
        self.qualname.rsplit('.').next().unwrap_or(&self.qualname)
    }

    pub fn hook(&self) -> Option<&str> {
        self.hook.as_deref()
    }

    pub fn is_reloadable(&self) -> bool {
        matches!(self.kind, FunctionKind::Indirect(_))
    }

    pub fn indirection(&self) -> Option<&ReloadableFn> {
        match &self.kind {
            FunctionKind::Indirect(inner) => Some(inner),
            FunctionKind::Plain(_) => None,
        }
    }

    /// The implementation a call would run right now: itself, or the body installed in an indirection.
    pub fn latest(self: &Rc<Self>) -> Rc<Function> {
        match &self.kind {
            FunctionKind::Indirect(inner) => inner.current(),
            FunctionKind::Plain(_) => Rc::clone(self),
        }
    }

    pub fn call(&self, receiver: Option<&Object>, args: &[Value]) -> Result<Value> {
        match &self.kind {
            FunctionKind::Plain(body) => body.invoke(&self.qualname, receiver, args),
            FunctionKind::Indirect(inner) => inner.call(receiver, args),
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_reloadable() { "reloadable function" } else { "function" };
        write!(f, "<{kind} {}>", self.qualname)
    }
}

#[derive(Clone)]
pub enum Member {
    Data(Value),
    Method(Rc<Function>),
    Static(Rc<Function>),
    /// Computed attribute. Reload refuses to patch these.
    Property(Rc<Function>),
    /// Default special method installed by the runtime.
    Builtin(Rc<Function>),
}

impl Member {
    pub fn label(&self) -> &'static str {
        match self {
            Member::Data(_) => "data",
            Member::Method(_) => "method",
            Member::Static(_) => "static method",
            Member::Property(_) => "property",
            Member::Builtin(_) => "builtin",
        }
    }

    pub fn function(&self) -> Option<&Rc<Function>> {
        match self {
            Member::Method(f) | Member::Static(f) | Member::Property(f) | Member::Builtin(f) => Some(f),
            Member::Data(_) => None,
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Member::Data(value) => write!(f, "Data({value:?})"),
            other => write!(f, "{}({:?})", other.label(), other.function()),
        }
    }
}

/// How instances of a class persist. Fixed when the class object is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistKind {
    Entity,
    Script,
    Transient,
}

pub(crate) struct ClassSpec {
    pub name: String,
    pub unit: String,
    pub bases: Vec<Class>,
    pub members: BTreeMap<String, Member>,
    pub native: bool,
    pub persist: Option<PersistKind>,
}

pub struct ClassObject {
    name: String,
    unit: String,
    bases: Vec<Class>,
    ancestors: Vec<Class>,
    members: RefCell<BTreeMap<String, Member>>,
    native: bool,
    persist: PersistKind,
    reloadable: Cell<bool>,
}

/// Handle to a class object. Equality and hashing follow identity, which never changes.
#[derive(Clone)]
pub struct Class(Rc<ClassObject>);

impl Class {
    pub(crate) fn new(spec: ClassSpec) -> Result<Self> {
        let ancestors = linearize(&spec.name, &spec.bases)?;
        let persist = spec
            .persist
            .or_else(|| ancestors.iter().map(Class::persist_kind).find(|kind| *kind != PersistKind::Transient))
            .unwrap_or(PersistKind::Transient);
        Ok(Class(Rc::new(ClassObject {
            name: spec.name,
            unit: spec.unit,
            bases: spec.bases,
            ancestors,
            members: RefCell::new(spec.members),
            native: spec.native,
            persist,
            reloadable: Cell::new(false),
        })))
    }

    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn unit(&self) -> &str {
        &self.0.unit
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.0.unit, self.0.name)
    }

    pub fn bases(&self) -> &[Class] {
        &self.0.bases
    }

    /// The class followed by its ancestors in resolution order.
    pub fn mro(&self) -> Vec<Class> {
        let mut order = Vec::with_capacity(self.0.ancestors.len() + 1);
        order.push(self.clone());
        order.extend(self.0.ancestors.iter().cloned());
        order
    }

    pub fn is_subclass_of(&self, other: &Class) -> bool {
        self == other || self.0.ancestors.contains(other)
    }

    pub fn is_native(&self) -> bool {
        self.0.native
    }

    pub fn persist_kind(&self) -> PersistKind {
        self.0.persist
    }

    pub fn is_reloadable(&self) -> bool {
        self.0.reloadable.get()
    }

    pub(crate) fn mark_reloadable(&self) {
        self.0.reloadable.set(true);
    }

    pub fn own_member(&self, name: &str) -> Option<Member> {
        self.0.members.borrow().get(name).cloned()
    }

    pub fn own_members(&self) -> Vec<(String, Member)> {
        self.0.members.borrow().iter().map(|(name, member)| (name.clone(), member.clone())).collect()
    }

    pub fn set_member(&self, name: &str, member: Member) {
        self.0.members.borrow_mut().insert(name.to_string(), member);
    }

    pub fn lookup(&self, name: &str) -> Option<Member> {
        self.own_member(name).or_else(|| self.0.ancestors.iter().find_map(|class| class.own_member(name)))
    }

    /// Every member visible on the class, the nearest definition winning.
    pub fn reachable_members(&self) -> Vec<(String, Member)> {
        let mut seen = BTreeMap::new();
        for class in self.mro() {
            for (name, member) in class.own_members() {
                seen.entry(name).or_insert(member);
            }
        }
        seen.into_iter().collect()
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn data(&self, name: &str) -> Option<Value> {
        match self.lookup(name)? {
            Member::Data(value) => Some(value),
            _ => None,
        }
    }

    pub fn function(&self, name: &str) -> Option<Rc<Function>> {
        self.lookup(name).and_then(|member| member.function().cloned())
    }

    pub fn call_static(&self, name: &str, args: &[Value]) -> Result<Value> {
        match self.lookup(name) {
            Some(Member::Static(f)) => f.call(None, args),
            Some(Member::Method(f)) | Some(Member::Builtin(f)) => {
                Err(Error::MissingReceiver { function: f.qualname().to_string() })
            }
            Some(_) => Err(Error::NotCallable { class: self.qualified_name(), name: name.to_string() }),
            None => Err(self.missing(name)),
        }
    }

    pub(crate) fn missing(&self, name: &str) -> Error {
        Error::AttributeMissing { class: self.qualified_name(), name: name.to_string() }
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Class {}

impl Hash for Class {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<class {}>", self.qualified_name())
    }
}

/// C3 linearization of `bases`, excluding the class itself.
fn linearize(name: &str, bases: &[Class]) -> Result<Vec<Class>> {
    let mut sequences: Vec<Vec<Class>> = bases.iter().map(Class::mro).collect();
    sequences.push(bases.to_vec());
    let mut order = Vec::new();
    loop {
        sequences.retain(|seq| !seq.is_empty());
        if sequences.is_empty() {
            return Ok(order);
        }
        let next = sequences
            .iter()
            .map(|seq| &seq[0])
            .find(|head| !sequences.iter().any(|seq| seq[1..].contains(head)))
            .cloned()
            .ok_or_else(|| Error::InconsistentHierarchy { class: name.to_string() })?;
        for seq in sequences.iter_mut() {
            if seq[0] == next {
                seq.remove(0);
            }
        }
        order.push(next);
    }
}

pub struct Instance {
    class: Class,
    fields: RefCell<Fields>,
}

/// Handle to a live instance. Equality follows identity.
#[derive(Clone)]
pub struct Object(Rc<Instance>);

pub enum Attr {
    Value(Value),
    Method(BoundMethod),
    Static(Rc<Function>),
}

impl Object {
    /// Raw construction: no `init` runs. Hosts go through `Loader::instantiate`.
    pub fn new(class: &Class, fields: Fields) -> Self {
        Object(Rc::new(Instance { class: class.clone(), fields: RefCell::new(fields) }))
    }

    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn class(&self) -> &Class {
        &self.0.class
    }

    pub fn entity_id(&self) -> Option<String> {
        self.field("id").and_then(|value| value.as_str().map(str::to_string))
    }

    pub fn field(&self, name: &str) -> Option<Value> {
        self.0.fields.borrow().get(name).cloned()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.0.fields.borrow().contains_key(name)
    }

    pub fn fields(&self) -> Fields {
        self.0.fields.borrow().clone()
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) {
        self.0.fields.borrow_mut().insert(name.to_string(), value.into());
    }

    pub fn remove_field(&self, name: &str) -> Option<Value> {
        self.0.fields.borrow_mut().remove(name)
    }

    pub fn get_attr(&self, name: &str) -> Result<Attr> {
        let member = self.class().lookup(name);
        if let Some(Member::Property(getter)) = &member {
            return getter.call(Some(self), &[]).map(Attr::Value);
        }
        if let Some(value) = self.field(name) {
            return Ok(Attr::Value(value));
        }
        match member {
            Some(Member::Data(value)) => Ok(Attr::Value(value)),
            Some(Member::Method(function)) | Some(Member::Builtin(function)) => {
                Ok(Attr::Method(BoundMethod { receiver: self.clone(), function }))
            }
            Some(Member::Static(function)) => Ok(Attr::Static(function)),
            Some(Member::Property(_)) | None => Err(self.class().missing(name)),
        }
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.get_attr(name).is_ok()
    }

    /// Attribute lookup restricted to values (fields, class data, properties).
    pub fn attr_value(&self, name: &str) -> Result<Value> {
        match self.get_attr(name)? {
            Attr::Value(value) => Ok(value),
            Attr::Method(_) | Attr::Static(_) => Err(Error::TypeMismatch {
                name: name.to_string(),
                expected: "value",
                found: "function".to_string(),
            }),
        }
    }

    pub fn get_int(&self, name: &str) -> Result<i64> {
        self.attr_value(name)?.expect_int(name)
    }

    pub fn method(&self, name: &str) -> Result<BoundMethod> {
        match self.get_attr(name)? {
            Attr::Method(method) => Ok(method),
            _ => Err(Error::NotCallable { class: self.class().qualified_name(), name: name.to_string() }),
        }
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        match self.get_attr(name)? {
            Attr::Method(method) => method.call(args),
            Attr::Static(function) => function.call(None, args),
            Attr::Value(_) => {
                Err(Error::NotCallable { class: self.class().qualified_name(), name: name.to_string() })
            }
        }
    }

    pub fn repr(&self) -> String {
        match self.call(REPR, &[]) {
            Ok(Value::Str(text)) => text,
            _ => format!("{self:?}"),
        }
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Object {}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity_id() {
            Some(id) => write!(f, "<{} object id={id:?}>", self.class().qualified_name()),
            None => write!(f, "<{} object at {:#x}>", self.class().qualified_name(), self.identity()),
        }
    }
}

/// A function captured together with its receiver, as `instance.method` would be.
#[derive(Clone)]
pub struct BoundMethod {
    receiver: Object,
    function: Rc<Function>,
}

impl BoundMethod {
    pub fn receiver(&self) -> &Object {
        &self.receiver
    }

    pub fn function(&self) -> &Rc<Function> {
        &self.function
    }

    pub fn call(&self, args: &[Value]) -> Result<Value> {
        self.function.call(Some(&self.receiver), args)
    }
}

impl fmt::Debug for BoundMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<bound {:?} of {:?}>", self.function, self.receiver)
    }
}

/// The runtime's default `__repr__`.
pub(crate) fn default_repr(class_name: &str) -> Rc<Function> {
    Rc::new(Function::new(
        format!("{class_name}.{REPR}"),
        None,
        Body::native(|receiver, _| {
            Ok(Value::Str(match receiver {
                Some(object) => format!("{object:?}"),
                None => "<unbound>".to_string(),
            }))
        }),
    ))
}
