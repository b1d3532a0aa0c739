//! Load-time errors.
//!
//! Every load error is fatal and is reported before any job is scheduled.

use crate::variables::VariableError;
use std::path::PathBuf;

/// Load result type
pub type LoadResult<T> = Result<T, LoadError>;

/// Errors raised while loading, composing or resolving elements
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// A file could not be read or written
    #[error("{}: {source}", path.display())]
    Io {
        /// The file involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A document was not valid YAML or had the wrong shape
    #[error("{file}: invalid document: {reason}")]
    InvalidDocument {
        /// File or element the document belongs to
        file: String,
        /// Parser message
        reason: String,
    },

    /// Two descriptors share a name
    #[error("element '{element}' is declared twice")]
    Duplicate {
        /// The element name
        element: String,
    },

    /// A dependency or target names an element that does not exist
    #[error("element '{element}' not found (requested by {requested_by})")]
    MissingElement {
        /// The missing element
        element: String,
        /// Who referenced it
        requested_by: String,
    },

    /// A target on the command line could not be parsed
    #[error("invalid target '{target}': {reason}")]
    InvalidTarget {
        /// The target as given
        target: String,
        /// Why it was rejected
        reason: String,
    },

    /// An element declares a kind that is not registered
    #[error("element '{element}' has unknown kind '{kind}'")]
    UnknownKind {
        /// The element
        element: String,
        /// The kind it declares
        kind: String,
    },

    /// A variant was requested that the element does not declare
    #[error("element '{element}' has no variant '{variant}' (requested by {requested_by})")]
    UnknownVariant {
        /// The element
        element: String,
        /// The requested variant
        variant: String,
        /// Who requested it
        requested_by: String,
    },

    /// Two requesters explicitly pinned different variants of one element
    #[error(
        "variant conflict on '{element}': {first_requester} requests '{first_variant}', \
         {second_requester} requests '{second_variant}'"
    )]
    VariantConflict {
        /// The element both requesters depend on
        element: String,
        /// First requester seen
        first_requester: String,
        /// Variant it requested
        first_variant: String,
        /// Second requester seen
        second_requester: String,
        /// Variant it requested
        second_variant: String,
    },

    /// Variant choices kept changing between resolution passes
    #[error("variant resolution did not settle for: {}", elements.join(", "))]
    VariantsUnsettled {
        /// Elements whose variant kept changing
        elements: Vec<String>,
    },

    /// A dependency cycle
    #[error("circular dependency: {}", path.join(" -> "))]
    Cycle {
        /// The cycle, first element repeated at the end
        path: Vec<String>,
    },

    /// An override tried to replace a value with one of a different shape
    #[error("element '{element}': cannot composite '{key}': {reason}")]
    IllegalComposite {
        /// The element being composed
        element: String,
        /// The offending key path
        key: String,
        /// What went wrong
        reason: String,
    },

    /// Variable expansion failed
    #[error("element '{element}': {source}")]
    Variable {
        /// The element being expanded
        element: String,
        /// Underlying error
        #[source]
        source: VariableError,
    },

    /// An element kind rejected the element's configuration
    #[error("element '{element}': invalid config: {reason}")]
    InvalidConfig {
        /// The element
        element: String,
        /// Why the kind rejected it
        reason: String,
    },
}

impl LoadError {
    /// Wrap an I/O error with the path it concerns
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Element names mentioned by this error
    #[must_use]
    pub fn elements(&self) -> Vec<&str> {
        match self {
            Self::Duplicate { element }
            | Self::UnknownKind { element, .. }
            | Self::UnknownVariant { element, .. }
            | Self::IllegalComposite { element, .. }
            | Self::Variable { element, .. }
            | Self::InvalidConfig { element, .. }
            | Self::MissingElement { element, .. } => vec![element.as_str()],
            Self::VariantConflict {
                element,
                first_requester,
                second_requester,
                ..
            } => vec![
                element.as_str(),
                first_requester.as_str(),
                second_requester.as_str(),
            ],
            Self::VariantsUnsettled { elements } => elements.iter().map(String::as_str).collect(),
            Self::Cycle { path } => path.iter().map(String::as_str).collect(),
            Self::Io { .. } | Self::InvalidDocument { .. } | Self::InvalidTarget { .. } => Vec::new(),
        }
    }
}
