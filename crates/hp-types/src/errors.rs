use thiserror::Error;

/// Main error type for the HyperPool system
#[derive(Error, Debug)]
pub enum HpError {
    #[error("Invalid search space: {0}")]
    Space(#[from] SpaceError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("Observation store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Misconfigured parameter space or fixed parameters. Fatal at startup.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpaceError {
    #[error("search space has no parameters")]
    Empty,

    #[error("duplicate parameter name: {name}")]
    DuplicateName { name: String },

    #[error("invalid parameter name {name:?}: {message}")]
    InvalidName { name: String, message: String },

    #[error("invalid range for {name}: low {low}, high {high}")]
    InvalidRange { name: String, low: f64, high: f64 },

    #[error("categorical parameter {name} has no choices")]
    EmptyChoice { name: String },

    #[error("categorical value {value} of {name} contains a reserved character")]
    ReservedCharacter { name: String, value: String },

    #[error("categorical value {value} of {name} is listed more than once")]
    DuplicateChoice { name: String, value: String },

    #[error("unknown parameter: {name}")]
    UnknownParameter { name: String },

    #[error("missing value for parameter: {name}")]
    MissingValue { name: String },

    #[error("value {value} is outside the declared bounds of {name}")]
    OutOfBounds { name: String, value: String },

    #[error("value {value} does not match the kind of {name}")]
    KindMismatch { name: String, value: String },
}

/// Per-trial failures. Contained to the slot that produced them.
#[derive(Error, Debug)]
pub enum TrialError {
    #[error("failed to launch {program}: {message}")]
    Launch { program: String, message: String },

    #[error("failed to interrupt process {pid}: {message}")]
    SignalDelivery { pid: u32, message: String },

    #[error("failed to read trial log {path}: {message}")]
    LogRead { path: String, message: String },

    #[error("slot {slot} already hosts an active trial")]
    SlotBusy { slot: usize },
}

/// Persisted observation file errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("CSV error in {path}: {message}")]
    Csv { path: String, message: String },

    #[error("header mismatch in {path}: expected {expected:?}, found {found:?}")]
    HeaderMismatch {
        path: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("malformed row {line} in {path}: {message}")]
    Malformed {
        path: String,
        line: usize,
        message: String,
    },
}

/// Result type alias for HyperPool operations
pub type HpResult<T> = Result<T, HpError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HpError::Config(format!($($arg)*))
    };
}
