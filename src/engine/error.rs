use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// A single form field failed validation.
    InvalidInput {
        field: &'static str,
        message: String,
    },
    PastDateTime,
    InsufficientCapacity {
        available: usize,
        needed: usize,
    },
    InvalidPartySize(u32),
    /// An explicitly chosen table is taken for the slot. Carries the table number.
    TableUnavailable(u32),
    NotFound(Ulid),
    TableInUse(Ulid),
    DuplicateTableNumber(u32),
    InvalidCapacity(u32),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Form field the error belongs to, `None` for form-level errors.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            EngineError::InvalidInput { field, .. } => Some(field),
            EngineError::InvalidPartySize(_) => Some("guests"),
            EngineError::TableUnavailable(_) => Some("tables"),
            _ => None,
        }
    }

    /// Short label for rejection metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidInput { .. } => "invalid_input",
            EngineError::PastDateTime => "past_date_time",
            EngineError::InsufficientCapacity { .. } => "insufficient_capacity",
            EngineError::InvalidPartySize(_) => "invalid_party_size",
            EngineError::TableUnavailable(_) => "table_unavailable",
            EngineError::NotFound(_) => "not_found",
            EngineError::TableInUse(_) => "table_in_use",
            EngineError::DuplicateTableNumber(_) => "duplicate_table_number",
            EngineError::InvalidCapacity(_) => "invalid_capacity",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "persistence_failure",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput { message, .. } => write!(f, "{message}"),
            EngineError::PastDateTime => write!(f, "Date and time cannot be in the past!"),
            EngineError::InsufficientCapacity { available, needed } => write!(
                f,
                "Not enough free tables for the selected time ({available} free, {needed} needed)."
            ),
            EngineError::InvalidPartySize(guests) => {
                write!(f, "Number of guests must be between 1 and 40, got {guests}.")
            }
            EngineError::TableUnavailable(number) => write!(
                f,
                "All selected tables must be free at the selected time (table {number} is taken)."
            ),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::TableInUse(id) => {
                write!(f, "table {id} is assigned to a current or upcoming booking")
            }
            EngineError::DuplicateTableNumber(n) => write!(f, "table number {n} already exists"),
            EngineError::InvalidCapacity(c) => {
                write!(f, "table capacity must be between 2 and 6, got {c}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
