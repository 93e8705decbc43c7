use mezzo_common::FromMessage;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A trigger descriptor is missing a field its kind requires.
    #[error("invalid trigger configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// An execution was requested while one is already in flight.
    #[error("task already running: {name}")]
    AlreadyRunning { name: String },

    /// Cancellation was requested but no execution is in flight.
    #[error("task not running: {name}")]
    NotRunning { name: String },

    /// A persisted record could not be read back.
    #[error("corrupt record at {path}: {detail}")]
    PersistenceCorrupt { path: String, detail: String },

    #[error("task not found: {task_id}")]
    TaskNotFound { task_id: String },

    #[error("{message}")]
    Message { message: String },
}

impl Error {
    #[must_use]
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn already_running(name: impl Into<String>) -> Self {
        Self::AlreadyRunning { name: name.into() }
    }

    #[must_use]
    pub fn not_running(name: impl Into<String>) -> Self {
        Self::NotRunning { name: name.into() }
    }

    #[must_use]
    pub fn persistence_corrupt(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::PersistenceCorrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn task_not_found(task_id: impl Into<String>) -> Self {
        Self::TaskNotFound {
            task_id: task_id.into(),
        }
    }

    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

mezzo_common::impl_context!();
