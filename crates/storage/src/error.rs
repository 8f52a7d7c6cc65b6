#![forbid(unsafe_code)]

/// Errors surfaced by the storage layer.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Sql(rusqlite::Error),
    InvalidInput(&'static str),
    /// The target collection does not exist. Carries the identifier the
    /// client supplied, verbatim, for the protocol error text.
    UnknownCollection(String),
    /// A non-virtual item operation was aimed at a virtual collection.
    VirtualCollection,
    /// An operation that requires a virtual collection got a physical one.
    NotVirtualCollection,
    NotFound {
        entity: &'static str,
        id: String,
    },
    UniqueViolation {
        entity: &'static str,
        key: String,
    },
    /// A collection move that would create a cycle.
    InvalidMoveTarget,
    /// No transaction is open where one is required.
    NoTransaction,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Sql(err) => write!(f, "database: {err}"),
            Self::InvalidInput(message) => write!(f, "invalid input: {message}"),
            Self::UnknownCollection(id) => write!(f, "Unknown collection for '{id}'."),
            Self::VirtualCollection => {
                write!(f, "Cannot append item into virtual collection")
            }
            Self::NotVirtualCollection => {
                write!(f, "Can't link items to non-virtual collections")
            }
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::UniqueViolation { entity, key } => {
                write!(f, "{entity} already exists: {key}")
            }
            Self::InvalidMoveTarget => {
                write!(f, "Cannot move collection into itself or one of its children")
            }
            Self::NoTransaction => write!(f, "no transaction in progress"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql(value)
    }
}
