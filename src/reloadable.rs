use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::debug;

use crate::class::{Class, Function, Member, Object};
use crate::error::{Error, Result};
use crate::value::Value;

/// Call-through indirection for a method that must keep working across reloads.
///
/// The authority is the class the wrapper consults on every call; it is fixed by the first
/// call when the wrapper was created without one. The current implementation is the one
/// the authority resolves, provided its qualified name still matches the wrapped function.
pub struct ReloadableFn {
    qualname: String,
    name: String,
    current: RefCell<Rc<Function>>,
    authority: RefCell<Option<Class>>,
    generation: Cell<u64>,
}

impl ReloadableFn {
    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    pub fn current(&self) -> Rc<Function> {
        Rc::clone(&self.current.borrow())
    }

    pub fn authority(&self) -> Option<Class> {
        self.authority.borrow().clone()
    }

    /// Bumped every time a different implementation is installed.
    pub fn generation(&self) -> u64 {
        self.generation.get()
    }

    /// Points the indirection at `implementation` (or at what it currently runs, if it is itself wrapped).
    pub fn install(&self, implementation: &Rc<Function>) {
        let latest = implementation.latest();
        if Rc::ptr_eq(&self.current.borrow(), &latest) {
            return;
        }
        debug!("[reload] {} now runs generation {}", self.qualname, self.generation.get() + 1);
        *self.current.borrow_mut() = latest;
        self.generation.set(self.generation.get() + 1);
    }

    pub(crate) fn call(&self, receiver: Option<&Object>, args: &[Value]) -> Result<Value> {
        let receiver = receiver.ok_or_else(|| Error::MissingReceiver { function: self.qualname.clone() })?;
        let authority = self.authority.borrow_mut().get_or_insert_with(|| receiver.class().clone()).clone();
        let resolved = match authority.lookup(&self.name) {
            Some(Member::Data(_)) => {
                return Err(Error::NotCallable { class: authority.qualified_name(), name: self.name.clone() })
            }
            Some(member) => member.function().map(Function::latest),
            None => None,
        }
        .ok_or_else(|| authority.missing(&self.name))?;
        if resolved.qualname() != self.qualname {
            return Err(Error::StaleAuthorityMismatch {
                class: authority.qualified_name(),
                expected: self.qualname.clone(),
                found: resolved.qualname().to_string(),
            });
        }
        self.install(&resolved);
        let current = self.current();
        current.call(Some(receiver), args)
    }
}

/// Wraps `function` in an indirection. Already wrapped functions are returned unchanged.
pub fn reloadable(function: &Rc<Function>, authority: Option<&Class>) -> Rc<Function> {
    if function.is_reloadable() {
        return Rc::clone(function);
    }
    let inner = ReloadableFn {
        qualname: function.qualname().to_string(),
        name: function.name().to_string(),
        current: RefCell::new(Rc::clone(function)),
        authority: RefCell::new(authority.cloned()),
        generation: Cell::new(0),
    };
    Rc::new(Function::indirect(
        function.qualname().to_string(),
        function.hook().map(str::to_string),
        inner,
    ))
}

/// Wraps every ordinary method reachable on `class` with `class` as authority, and marks it so
/// that later reloads wrap its replacement too. Static methods, properties and builtins stay as they are.
pub fn reloadable_class(class: &Class) {
    for (name, member) in class.reachable_members() {
        if let Member::Method(function) = member {
            class.set_member(&name, Member::Method(reloadable(&function, Some(class))));
        }
    }
    class.mark_reloadable();
}
