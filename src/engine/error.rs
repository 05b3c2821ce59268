use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The proposed window overlaps a confirmed meeting of `user_id`.
    Conflict {
        user_id: Ulid,
        meeting_id: Ulid,
    },
    Invalid(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict {
                user_id,
                meeting_id,
            } => write!(
                f,
                "meeting time clashes with confirmed meeting {meeting_id} of user {user_id}"
            ),
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
