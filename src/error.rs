use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unit '{unit}' could not be loaded: {message}")]
    UnitLoad { unit: String, message: String },

    #[error("reloading unit '{unit}' failed: {source}")]
    UnitReloadFailure {
        unit: String,
        #[source]
        source: Box<Error>,
    },

    #[error("import cycle while loading unit '{unit}' ({chain})")]
    ImportCycle { unit: String, chain: String },

    #[error("unit '{unit}' has no class named '{class}'")]
    ClassNotFound { unit: String, class: String },

    #[error("class '{class}' was not in module cache -- did you load it manually?")]
    NotInModuleCache { class: String },

    #[error("cannot build a consistent ancestor order for class '{class}'")]
    InconsistentHierarchy { class: String },

    #[error("'{class}' has no attribute '{name}'")]
    AttributeMissing { class: String, name: String },

    #[error("attribute '{name}' of '{class}' is not callable")]
    NotCallable { class: String, name: String },

    #[error("'{function}' must be called on an instance")]
    MissingReceiver { function: String },

    #[error(
        "cannot patch member '{member}' of class '{class}': custom descriptors are not supported by reload"
    )]
    UnsupportedDescriptor { class: String, member: String },

    #[error(
        "reloadable function '{expected}' now resolves to '{found}' on class '{class}'. \
         The class was reloaded in a way that does not play well with inheritance; \
         give the method a distinct name or restart the editor"
    )]
    StaleAuthorityMismatch { class: String, expected: String, found: String },

    #[error("script function '{function}' failed: {message}")]
    Script { function: String, message: String },

    #[error("expected {expected} for '{name}', found {found}")]
    TypeMismatch { name: String, expected: &'static str, found: String },

    #[error("no save handler for {type_name}")]
    HandlerMissing { type_name: String },

    #[error("duplicate entity id '{id}'")]
    DuplicateId { id: String },

    #[error("entity {object} has no string 'id' attribute")]
    MissingId { object: String },

    #[error("unknown tag '{tag}' in level document")]
    UnknownTag { tag: String },

    #[error("entity reference to '{id}' could not be resolved")]
    UnknownEntityRef { id: String },

    #[error("entity references form a cycle: {ids}")]
    ReferenceCycle { ids: String },

    #[error("script object of class '{class}' can only be saved in its owner's 'scripts' list")]
    MisplacedScript { class: String },

    #[error("malformed level document: {0}")]
    Malformed(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }

    /// The innermost error, looking through reload failures.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::UnitReloadFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
