use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("incomplete input: missing {}", missing.join(", "))]
    IncompleteInput { missing: Vec<&'static str> },
    #[error("`{field}` is out of range: {value}")]
    InvalidRange { field: &'static str, value: String },
    #[error("`{field}` is malformed: {value}")]
    InvalidFormat { field: &'static str, value: String },
    #[error("generated output rejected: {reason}")]
    InvalidOutput { reason: String },
}

impl DomainError {
    pub fn incomplete(missing: Vec<&'static str>) -> Self {
        Self::IncompleteInput { missing }
    }

    pub fn range(field: &'static str, value: impl ToString) -> Self {
        Self::InvalidRange {
            field,
            value: value.to_string(),
        }
    }

    pub fn format(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidFormat {
            field,
            value: value.into(),
        }
    }

    pub fn output(reason: impl Into<String>) -> Self {
        Self::InvalidOutput {
            reason: reason.into(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            DomainError::IncompleteInput { .. } => "incomplete_input",
            DomainError::InvalidRange { .. } => "invalid_range",
            DomainError::InvalidFormat { .. } => "invalid_format",
            DomainError::InvalidOutput { .. } => "invalid_output",
        }
    }
}
