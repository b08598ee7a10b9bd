pub mod class;
pub mod cli;
pub mod config;
pub mod error;
pub mod host;
pub mod level;
pub mod loader;
pub mod reload;
pub mod reloadable;
pub mod units;
pub mod value;
pub mod watch;

pub use class::{Attr, BoundMethod, Class, Function, Member, Object, PersistKind};
pub use error::{Error, Result};
pub use host::{engine_unit, EditorHost, LevelHost, ENGINE_UNIT, ENTITY_CLASS, SCRIPT_CLASS};
pub use level::{load_level, save_level, LevelDocument};
pub use loader::Loader;
pub use reload::ReloadReport;
pub use reloadable::{reloadable, reloadable_class};
pub use units::{ClassDecl, MemorySource, ScriptDirectory, UnitDefinition, UnitSource};
pub use value::{Fields, Value};
