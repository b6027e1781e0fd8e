use ulid::Ulid;

/// Kind of record a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Room,
    User,
    Application,
    Workstation,
    Workgroup,
    Membership,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Entity::Room => "room",
            Entity::User => "user",
            Entity::Application => "application",
            Entity::Workstation => "workstation",
            Entity::Workgroup => "workgroup",
            Entity::Membership => "membership",
        };
        f.write_str(name)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Entity, Ulid),
    AlreadyExists(Ulid),
    /// Workstations already claimed by an in-progress workgroup.
    Conflict(Vec<Ulid>),
    WorkstationUnavailable(Ulid),
    /// The workgroup is scheduled or has ended.
    InvalidState(Ulid),
    Unauthorized(Ulid),
    Invalid(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(entity, id) => write!(f, "{entity} not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(ids) => {
                write!(f, "workstations unavailable:")?;
                for id in ids {
                    write!(f, " {id}")?;
                }
                Ok(())
            }
            EngineError::WorkstationUnavailable(id) => {
                write!(f, "workstation unavailable: {id}")
            }
            EngineError::InvalidState(id) => write!(f, "workgroup not in progress: {id}"),
            EngineError::Unauthorized(id) => write!(f, "not authorized for workgroup {id}"),
            EngineError::Invalid(msg) => write!(f, "invalid request: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Conflict(_) | EngineError::WorkstationUnavailable(_) => "conflict",
            EngineError::InvalidState(_) => "invalid_state",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::Invalid(_) => "invalid",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal",
        }
    }
}
