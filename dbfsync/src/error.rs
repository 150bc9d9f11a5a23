use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Relation config error: {0}")]
    RelationConfig(String),

    #[error("Unknown engine for source '{0}'")]
    UnknownEngine(String),

    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Value '{value}' is not valid for field '{field}' (expected {expected})")]
    ValueNotValid {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),
}

impl SyncError {
    /// Whether the error concerns a single row's data, so only that row's
    /// write is abandoned.
    pub fn is_row_error(&self) -> bool {
        match self {
            SyncError::FieldNotFound(_) | SyncError::ValueNotValid { .. } => true,
            SyncError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }

    pub(crate) fn value_not_valid(field: &str, value: &str, expected: &str) -> Self {
        SyncError::ValueNotValid {
            field: field.to_string(),
            value: value.to_string(),
            expected: expected.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
