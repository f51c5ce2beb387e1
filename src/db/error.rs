use thiserror::Error;

/// Store-level failures.
///
/// The policy variants carry the outcomes that callers branch on: the admin
/// plane maps them to HTTP statuses and the relay path treats them as drops.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database connection error: {0}")]
    Connection(String),
    #[error("database query error: {0}")]
    Query(String),
    #[error("database migration error: {0}")]
    Migration(String),

    #[error("a room with that name already exists")]
    NameTaken,
    #[error("invalid room limit")]
    LimitInvalid,
    #[error("not found")]
    NotFound,
    #[error("channel is already bound to a room")]
    AlreadyBound,
    #[error("room has reached its server limit")]
    RoomFull,
    #[error("room is not active")]
    RoomInactive,
    #[error("guild is banned")]
    GuildBanned,
}

// Lets store code run inside `conn.transaction::<_, DatabaseError, _>`.
impl From<diesel::result::Error> for DatabaseError {
    fn from(err: diesel::result::Error) -> Self {
        DatabaseError::Query(err.to_string())
    }
}

impl DatabaseError {
    /// True for the expected policy outcomes, false for infrastructure faults.
    pub fn is_policy(&self) -> bool {
        !matches!(
            self,
            DatabaseError::Connection(_) | DatabaseError::Query(_) | DatabaseError::Migration(_)
        )
    }
}
