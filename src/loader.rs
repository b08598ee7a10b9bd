use std::rc::Rc;

use log::{debug, warn};

use crate::class::{Class, Member, Object};
use crate::error::{Error, Result};
use crate::reloadable::reloadable_class;
use crate::units::{ModuleCache, SourceUnit, UnitDefinition, UnitSource};
use crate::value::Fields;

/// Registry of every class the host has asked for, and the units they come from.
///
/// Classes stay tracked for the lifetime of the loader so that each reload can patch
/// them from their newest counterpart.
pub struct Loader {
    pub(crate) cache: ModuleCache,
    pub(crate) units: Vec<Rc<SourceUnit>>,
    pub(crate) classes: Vec<Class>,
    make_everything_reloadable: bool,
    force_reload_on_first_load: bool,
}

impl Loader {
    pub fn new(source: impl UnitSource + 'static) -> Self {
        Self {
            cache: ModuleCache::new(source),
            units: Vec::new(),
            classes: Vec::new(),
            make_everything_reloadable: false,
            force_reload_on_first_load: true,
        }
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    pub fn register_native_unit(&mut self, name: &str, definition: UnitDefinition) -> Result<()> {
        self.cache.register_native_unit(name, definition)?;
        Ok(())
    }

    /// When set, every class loaded from now on is passed through `reloadable_class`.
    pub fn set_make_everything_reloadable(&mut self, enabled: bool) {
        self.make_everything_reloadable = enabled;
    }

    pub fn make_everything_reloadable(&self) -> bool {
        self.make_everything_reloadable
    }

    /// Whether level loading asks `load_class` to refresh units first seen through this loader.
    pub fn set_force_reload_on_first_load(&mut self, enabled: bool) {
        self.force_reload_on_first_load = enabled;
    }

    pub fn force_reload_on_first_load(&self) -> bool {
        self.force_reload_on_first_load
    }

    pub fn tracked_classes(&self) -> &[Class] {
        &self.classes
    }

    pub fn tracked_units(&self) -> Vec<String> {
        self.units.iter().map(|unit| unit.name().to_string()).collect()
    }

    /// Returns the class currently bound to `class` in `unit`, loading the unit if needed.
    ///
    /// A unit this loader has not seen before is reloaded once when `force_reload` is set,
    /// so code cached by someone else is never handed out stale.
    pub fn load_class(&mut self, unit: &str, class: &str, force_reload: bool) -> Result<Class> {
        let source_unit = self.track_unit(unit, force_reload)?;
        let loaded = source_unit
            .class(class)
            .ok_or_else(|| Error::ClassNotFound { unit: unit.to_string(), class: class.to_string() })?;
        self.track_class(&loaded, force_reload)?;
        Ok(loaded)
    }

    /// Tracks a class obtained some other way (a base class, a value handed over by a script).
    pub fn add_to_reload_cache(&mut self, class: &Class, force_reload: bool) -> Result<()> {
        if class.is_native() {
            return Ok(());
        }
        self.track_unit(class.unit(), force_reload)?;
        self.track_class(class, force_reload)
    }

    /// Resolves any class handle to the class its unit currently binds under the same name.
    pub fn get_newer_class(&self, class: &Class, error: bool) -> Result<Class> {
        let Some(unit) = self.cache.get(class.unit()) else {
            if error {
                return Err(Error::NotInModuleCache { class: class.qualified_name() });
            }
            warn!("[reload] class '{}' was not in module cache -- did you load it manually?", class.qualified_name());
            return Ok(class.clone());
        };
        unit.class(class.name())
            .ok_or_else(|| Error::ClassNotFound { unit: class.unit().to_string(), class: class.name().to_string() })
    }

    /// Builds an instance of the newest generation of `class`, sets `fields` and runs `init`.
    pub fn instantiate(&mut self, class: &Class, fields: Fields) -> Result<Object> {
        let newest = self.get_newer_class(class, false)?;
        if newest != *class && self.classes.contains(class) {
            self.track_class(&newest, false)?;
        }
        let object = Object::new(&newest, fields);
        if let Some(Member::Method(_)) = newest.lookup("init") {
            object.call("init", &[])?;
        }
        Ok(object)
    }

    fn track_unit(&mut self, name: &str, force_reload: bool) -> Result<Rc<SourceUnit>> {
        let (unit, fresh) = self.cache.import(name)?;
        if !self.units.iter().any(|known| Rc::ptr_eq(known, &unit)) {
            if force_reload && !fresh && !unit.is_native() {
                debug!("[reload] first sight of cached unit '{name}', reloading it");
                self.cache.reload(&unit)?;
            }
            if !unit.is_native() {
                self.units.push(Rc::clone(&unit));
            }
        }
        Ok(unit)
    }

    fn track_class(&mut self, class: &Class, force_reload: bool) -> Result<()> {
        // Base classes from other units are tracked too, so edits to them reach subclasses.
        for ancestor in class.mro().iter().skip(1).filter(|ancestor| !ancestor.is_native()) {
            self.track_unit(ancestor.unit(), force_reload)?;
            if !self.classes.contains(ancestor) {
                self.classes.push(ancestor.clone());
            }
        }
        if !self.classes.contains(class) {
            debug!("[reload] tracking class '{}'", class.qualified_name());
            self.classes.push(class.clone());
        }
        if self.make_everything_reloadable && !class.is_reloadable() {
            reloadable_class(class);
        }
        Ok(())
    }
}
