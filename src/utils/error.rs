use thiserror::Error;

#[derive(Error, Debug)]
pub enum StallbookError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Invalid value for '{field}' ({value}): {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Required tool '{program}' was not found")]
    ToolNotFound { program: String },

    #[error("Command '{program}' exited with status {code:?}")]
    CommandFailed { program: String, code: Option<i32> },

    #[error("Environment activation failed for '{path}': {reason}")]
    ActivationFailed { path: String, reason: String },

    #[error("Dependency manifest not found: {path}")]
    ManifestMissing { path: String },

    #[error("Precondition '{check}' failed: {reason}")]
    PreconditionFailed { check: String, reason: String },

    #[error("Bootstrap halted at step '{step}': {source}")]
    Halted {
        step: String,
        #[source]
        source: Box<StallbookError>,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    #[error("Time slot {slot} is fully booked")]
    SlotFull { slot: String },

    #[error("Cart conflict: {message}")]
    CartConflict { message: String },

    #[error("Order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        order_id: i64,
        from: String,
        to: String,
    },

    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Environment,
    Storage,
    Domain,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl StallbookError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        StallbookError::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        StallbookError::ValidationError {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        StallbookError::ConfigError {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            StallbookError::ConfigError { .. }
            | StallbookError::InvalidConfigValueError { .. }
            | StallbookError::MissingConfigError { .. }
            | StallbookError::TomlError(_) => ErrorCategory::Configuration,
            StallbookError::ToolNotFound { .. }
            | StallbookError::CommandFailed { .. }
            | StallbookError::ActivationFailed { .. }
            | StallbookError::ManifestMissing { .. }
            | StallbookError::PreconditionFailed { .. } => ErrorCategory::Environment,
            StallbookError::IoError(_)
            | StallbookError::DatabaseError(_)
            | StallbookError::SerializationError(_) => ErrorCategory::Storage,
            StallbookError::NotFound { .. }
            | StallbookError::SlotFull { .. }
            | StallbookError::CartConflict { .. }
            | StallbookError::InvalidTransition { .. }
            | StallbookError::PermissionDenied { .. } => ErrorCategory::Domain,
            StallbookError::ValidationError { .. } => ErrorCategory::Input,
            StallbookError::Halted { source, .. } => source.category(),
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            StallbookError::PreconditionFailed { .. } | StallbookError::SlotFull { .. } => {
                ErrorSeverity::Medium
            }
            StallbookError::IoError(_) | StallbookError::DatabaseError(_) => {
                ErrorSeverity::Critical
            }
            StallbookError::Halted { source, .. } => source.severity(),
            _ => ErrorSeverity::High,
        }
    }

    pub fn recovery_suggestion(&self) -> String {
        match self {
            StallbookError::ToolNotFound { program } => {
                format!("Install '{}' and make sure it is on PATH", program)
            }
            StallbookError::CommandFailed { program, .. } => {
                format!("Check the output of '{}' above and fix the reported problem", program)
            }
            StallbookError::ActivationFailed { .. } => {
                "Re-run the create-env step or remove the broken environment directory".to_string()
            }
            StallbookError::ManifestMissing { path } => {
                format!("Create '{}' or point the install step at the right manifest", path)
            }
            StallbookError::PreconditionFailed { .. } => {
                "Start the database server, create the database and check [database] in stallbook.toml"
                    .to_string()
            }
            StallbookError::ConfigError { .. }
            | StallbookError::InvalidConfigValueError { .. }
            | StallbookError::MissingConfigError { .. }
            | StallbookError::TomlError(_) => "Review the configuration file".to_string(),
            StallbookError::DatabaseError(_) => {
                "Run `stallbook migrate` and verify the store file is writable".to_string()
            }
            StallbookError::SlotFull { .. } => "Choose another break-time slot".to_string(),
            StallbookError::CartConflict { .. } => {
                "Clear the cart before ordering from another stall".to_string()
            }
            StallbookError::Halted { source, .. } => source.recovery_suggestion(),
            _ => "Check the input and try again".to_string(),
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            StallbookError::Halted { step, source } => {
                format!("Setup stopped at '{}': {}", step, source.user_friendly_message())
            }
            StallbookError::DatabaseError(e) => format!("The store reported an error: {}", e),
            other => other.to_string(),
        }
    }

    /// 依嚴重程度決定行程結束碼
    pub fn exit_code(&self) -> i32 {
        match self.severity() {
            ErrorSeverity::Low => 0,
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, StallbookError>;
