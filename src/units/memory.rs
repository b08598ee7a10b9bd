use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use super::{UnitDefinition, UnitSource};
use crate::error::{Error, Result};

struct Entry {
    revision: u64,
    state: std::result::Result<UnitDefinition, String>,
}

#[derive(Default)]
struct Table {
    entries: BTreeMap<String, Entry>,
    next_revision: u64,
}

/// Unit source held in memory. Clones share the same table, so a host can keep a handle
/// and edit units while a loader owns another.
#[derive(Clone, Default)]
pub struct MemorySource {
    table: Rc<RefCell<Table>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&self, name: &str, definition: UnitDefinition) {
        self.store(name, Ok(definition));
    }

    /// Makes the next load of `name` fail, as a syntax error in an edited file would.
    pub fn break_unit(&self, name: &str, message: &str) {
        self.store(name, Err(message.to_string()));
    }

    pub fn remove(&self, name: &str) {
        self.table.borrow_mut().entries.remove(name);
    }

    pub fn revision(&self, name: &str) -> Option<u64> {
        self.table.borrow().entries.get(name).map(|entry| entry.revision)
    }

    fn store(&self, name: &str, state: std::result::Result<UnitDefinition, String>) {
        let mut table = self.table.borrow_mut();
        table.next_revision += 1;
        let revision = table.next_revision;
        table.entries.insert(name.to_string(), Entry { revision, state });
    }
}

impl UnitSource for MemorySource {
    fn load_unit(&self, name: &str) -> Result<UnitDefinition> {
        let table = self.table.borrow();
        let entry = table
            .entries
            .get(name)
            .ok_or_else(|| Error::UnitLoad { unit: name.to_string(), message: "no such unit".to_string() })?;
        match &entry.state {
            Ok(definition) => Ok(definition.clone().with_fingerprint(format!("rev-{}", entry.revision))),
            Err(message) => Err(Error::UnitLoad { unit: name.to_string(), message: message.clone() }),
        }
    }
}
