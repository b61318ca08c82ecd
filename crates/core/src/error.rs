use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CoreError {
    #[error("Unknown verification status: {0}")]
    UnknownStatus(String),

    #[error("Result path conflict at {0}: a status leaf is in the way")]
    PathConflict(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoreError::UnknownStatus("PASSED".to_string());
        assert!(error.to_string().contains("PASSED"));
    }
}
