use std::collections::BTreeSet;
use std::rc::Rc;

use log::{debug, info};

use crate::class::{Class, Function, Member};
use crate::error::{Error, Result};
use crate::loader::Loader;
use crate::reloadable::reloadable_class;
use crate::units::SourceUnit;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReloadReport {
    pub units_reloaded: usize,
    pub units_unchanged: usize,
    pub classes_patched: usize,
    pub members_patched: usize,
    pub native_skipped: usize,
}

impl Loader {
    /// Reloads every tracked unit, then patches every tracked class in place from its newest
    /// counterpart. The first failure aborts the pass; work already done stays applied.
    pub fn reload(&mut self) -> Result<ReloadReport> {
        let mut report = ReloadReport::default();
        for unit in self.reload_order() {
            if self.cache.reload(&unit)? {
                report.units_reloaded += 1;
            } else {
                report.units_unchanged += 1;
            }
        }

        for class in self.classes.clone() {
            let newer = self.get_newer_class(&class, false)?;
            if class.is_reloadable() && !newer.is_reloadable() {
                reloadable_class(&newer);
            }
            if class.is_native() {
                debug!("[reload] skipping native class '{}'", class.qualified_name());
                report.native_skipped += 1;
                continue;
            }
            if newer == class {
                continue;
            }
            report.members_patched += patch_class(&class, &newer)?;
            report.classes_patched += 1;
        }

        // A subclass whose unit did not change still holds its own indirections for inherited
        // methods; point them at whatever the ancestors bind now, shallowest classes first.
        let mut reloadable: Vec<Class> =
            self.classes.iter().filter(|class| class.is_reloadable() && !class.is_native()).cloned().collect();
        reloadable.sort_by_key(|class| class.mro().len());
        for class in &reloadable {
            report.members_patched += refresh_inherited(class);
        }

        info!(
            "[reload] {} unit(s) reloaded, {} unchanged; patched {} class(es), {} member(s)",
            report.units_reloaded, report.units_unchanged, report.classes_patched, report.members_patched
        );
        Ok(report)
    }

    /// Tracked units with the units their classes inherit from first.
    fn reload_order(&self) -> Vec<Rc<SourceUnit>> {
        fn visit(
            unit: &Rc<SourceUnit>,
            tracked: &[Rc<SourceUnit>],
            seen: &mut BTreeSet<String>,
            out: &mut Vec<Rc<SourceUnit>>,
        ) {
            if !seen.insert(unit.name().to_string()) {
                return;
            }
            for name in unit.class_names() {
                let Some(class) = unit.class(&name) else { continue };
                for ancestor in class.mro().iter().skip(1) {
                    if let Some(dependency) = tracked.iter().find(|known| known.name() == ancestor.unit()) {
                        visit(dependency, tracked, seen, out);
                    }
                }
            }
            out.push(Rc::clone(unit));
        }

        let mut seen = BTreeSet::new();
        let mut order = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            visit(unit, &self.units, &mut seen, &mut order);
        }
        order
    }
}

/// Copies every member declared directly on `newer` onto `target`. Returns the number patched.
pub fn patch_class(target: &Class, newer: &Class) -> Result<usize> {
    let mut patched = 0;
    for (name, member) in newer.own_members() {
        match member {
            Member::Builtin(_) => continue,
            Member::Property(_) => {
                return Err(Error::UnsupportedDescriptor { class: target.qualified_name(), member: name });
            }
            Member::Static(function) => target.set_member(&name, Member::Static(function)),
            Member::Method(incoming) => install_method(target, &name, incoming),
            Member::Data(value) => target.set_member(&name, Member::Data(value)),
        }
        patched += 1;
    }
    debug!("[reload] patched {patched} member(s) of '{}'", target.qualified_name());
    Ok(patched)
}

/// Re-resolves the indirections `class` holds for methods declared on an ancestor.
fn refresh_inherited(class: &Class) -> usize {
    let mut refreshed = 0;
    for (name, member) in class.own_members() {
        let Member::Method(function) = member else { continue };
        let Some(indirection) = function.indirection() else { continue };
        let shadowed = class.mro().into_iter().skip(1).find_map(|ancestor| ancestor.own_member(&name));
        let Some(Member::Method(inherited)) = shadowed else { continue };
        let declared = inherited.latest();
        if declared.qualname() != indirection.qualname() {
            continue;
        }
        let generation = indirection.generation();
        indirection.install(&declared);
        if indirection.generation() != generation {
            debug!("[reload] '{}' picked up the new {}", class.qualified_name(), indirection.qualname());
            refreshed += 1;
        }
    }
    refreshed
}

fn install_method(target: &Class, name: &str, incoming: Rc<Function>) {
    if let Some(Member::Method(existing)) = target.own_member(name) {
        if let Some(indirection) = existing.indirection() {
            if indirection.qualname() == incoming.qualname() {
                indirection.install(&incoming);
                return;
            }
        }
    }
    target.set_member(name, Member::Method(incoming));
}
