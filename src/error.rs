use thiserror::Error;

/// Stable numeric codes for each error kind. These are part of the wire
/// contract: clients match on the code, the message text is advisory.
pub mod codes {
    pub const INVALID_STATE: u16 = 100;
    pub const NOT_FOUND: u16 = 200;
    pub const INVALID_ARGUMENT: u16 = 300;
    pub const OUT_OF_RANGE: u16 = 310;
    pub const UNKNOWN_COMMAND: u16 = 400;
    pub const ENGINE_FAILURE: u16 = 500;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MixerError {
    #[error("'{operation}' cannot run in the {actual} state (requires {required})")]
    InvalidState {
        operation: &'static str,
        required: &'static str,
        actual: &'static str,
    },
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{field} {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("engine rejected '{operation}'")]
    EngineFailure { operation: &'static str },
}

impl MixerError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn out_of_range(field: &'static str, value: f64, min: f64, max: f64) -> Self {
        Self::OutOfRange {
            field,
            value,
            min,
            max,
        }
    }

    pub fn engine_failure(operation: &'static str) -> Self {
        Self::EngineFailure { operation }
    }

    /// The stable numeric code reported in error responses.
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidState { .. } => codes::INVALID_STATE,
            Self::NotFound { .. } => codes::NOT_FOUND,
            Self::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            Self::OutOfRange { .. } => codes::OUT_OF_RANGE,
            Self::UnknownCommand(_) => codes::UNKNOWN_COMMAND,
            Self::EngineFailure { .. } => codes::ENGINE_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let errors = [
            MixerError::InvalidState {
                operation: "activate",
                required: "PortsCreated",
                actual: "Uninitialized",
            },
            MixerError::not_found("port", "input_9"),
            MixerError::invalid_argument("source and destination are the same port"),
            MixerError::out_of_range("volume", 1.5, 0.0, 1.0),
            MixerError::UnknownCommand("Reticulate".to_string()),
            MixerError::engine_failure("activate"),
        ];
        let mut codes: Vec<u16> = errors.iter().map(MixerError::code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn messages_name_the_subject() {
        let err = MixerError::not_found("connection", "01J3ZK");
        assert_eq!(err.to_string(), "connection '01J3ZK' not found");

        let err = MixerError::out_of_range("pan", 2.0, -1.0, 1.0);
        assert!(err.to_string().contains("pan"));
        assert!(err.to_string().contains("-1..=1"));
    }
}
