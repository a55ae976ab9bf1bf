use std::fmt;

use daas_protocol::{CommandResult, SqlError, SqlErrorKind};

/// Why a reconciliation step failed, and whether trying again can help.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProvisioningError {
    /// Transient: network blips, objects not settled yet, proxy hiccups.
    #[error("{0}")]
    Retryable(String),
    /// Needs a person: bad desired state, permanent refusals, exhausted retries.
    #[error("{0}")]
    Fatal(String),
    #[error(transparent)]
    SqlExecution(#[from] SqlExecutionError),
}

impl ProvisioningError {
    pub fn retryable(message: impl Into<String>) -> Self {
        ProvisioningError::Retryable(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ProvisioningError::Fatal(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            ProvisioningError::Retryable(_) => false,
            ProvisioningError::Fatal(_) => true,
            ProvisioningError::SqlExecution(err) => err.is_fatal(),
        }
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            ProvisioningError::Retryable(_) => "retryable",
            ProvisioningError::Fatal(_) => "fatal",
            ProvisioningError::SqlExecution(_) => "sql_execution",
        }
    }

    /// Turns a retryable failure into a fatal one once the retry budget is spent.
    pub fn escalate(self, attempts: u32) -> Self {
        if self.is_fatal() {
            return self;
        }
        ProvisioningError::Fatal(format!("giving up after {attempts} attempts: {self}"))
    }
}

/// A proxy batch that came back with errors.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlExecutionError {
    pub message: String,
    pub server_id: String,
    pub database_id: String,
    pub messages: Vec<String>,
    pub errors: Vec<SqlError>,
}

impl SqlExecutionError {
    pub fn new(
        message: impl Into<String>,
        server_id: impl Into<String>,
        database_id: impl Into<String>,
        messages: Vec<String>,
        errors: Vec<SqlError>,
    ) -> Self {
        Self {
            message: message.into(),
            server_id: server_id.into(),
            database_id: database_id.into(),
            messages,
            errors,
        }
    }

    pub fn from_result(
        message: impl Into<String>,
        server_id: impl Into<String>,
        database_id: impl Into<String>,
        result: &CommandResult,
    ) -> Self {
        Self::new(
            message,
            server_id,
            database_id,
            result.messages.clone(),
            result.errors.clone(),
        )
    }

    /// Any engine-side T-SQL error is permanent; infrastructure-only failures are not.
    pub fn is_fatal(&self) -> bool {
        self.errors
            .iter()
            .any(|error| error.kind == SqlErrorKind::TSql)
    }
}

impl fmt::Display for SqlExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for error in &self.errors {
            write!(f, "\n{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SqlExecutionError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(errors: Vec<SqlError>) -> SqlExecutionError {
        SqlExecutionError::new(
            "Failed to configure server 3.",
            "3",
            "master",
            vec!["Configuration option changed.".into()],
            errors,
        )
    }

    #[test]
    fn renders_one_line_per_error() {
        let err = failed(vec![
            SqlError::tsql(207, 12, "Invalid column name"),
            SqlError::infrastructure("Connection reset by peer"),
        ]);
        let rendered = ProvisioningError::from(err).to_string();
        let lines: Vec<_> = rendered.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Failed to configure server 3.",
                "[TSql] Error on line 12 (207): Invalid column name",
                "[Infrastructure] Connection reset by peer",
            ]
        );
    }

    #[test]
    fn tsql_errors_are_fatal() {
        let err = failed(vec![
            SqlError::infrastructure("timeout"),
            SqlError::tsql(15247, 1, "User does not have permission"),
        ]);
        assert!(err.is_fatal());
        assert!(ProvisioningError::from(err).is_fatal());
    }

    #[test]
    fn infrastructure_only_errors_are_retryable() {
        let err = failed(vec![
            SqlError::infrastructure("timeout"),
            SqlError::infrastructure("connection refused"),
        ]);
        assert!(!err.is_fatal());
        let err = ProvisioningError::from(err);
        assert!(!err.is_fatal());
        assert_eq!(err.kind_label(), "sql_execution");
    }

    #[test]
    fn escalation_only_changes_retryable_errors() {
        let escalated = ProvisioningError::retryable("service has no cluster IP").escalate(5);
        assert!(escalated.is_fatal());
        assert_eq!(
            escalated.to_string(),
            "giving up after 5 attempts: service has no cluster IP"
        );
        let fatal = ProvisioningError::fatal("bad image");
        assert_eq!(fatal.clone().escalate(5), fatal);
    }
}
