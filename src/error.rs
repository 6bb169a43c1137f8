//! Error types for DbRheo.
//!
//! Defines the main error enum used throughout the agent core. Every error
//! carries a short machine-readable kind (exposed via [`DbRheoError::kind`])
//! plus a human message; driver- or provider-specific detail stays in the
//! message string.

use thiserror::Error;

/// Main error type for DbRheo operations.
#[derive(Error, Debug)]
pub enum DbRheoError {
    /// Configuration errors (invalid config file, bad values, missing keys).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database connection errors (host unreachable, driver failure).
    #[error("Connection error: {0}")]
    Connect(String),

    /// Authentication failures against a database or an LLM provider.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// A connection string names a dialect the factory does not know.
    #[error("Unsupported dialect: {0}")]
    UnsupportedDialect(String),

    /// Query execution errors (syntax errors, constraint violations).
    #[error("Query error: {0}")]
    Query(String),

    /// Transaction state violations (nested begin without savepoints,
    /// commit without begin).
    #[error("Transaction state error: {0}")]
    TxState(String),

    /// A mutating operation was attempted on a read-only connection.
    #[error("Read-only violation: {0}")]
    ReadOnly(String),

    /// An operation exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The operation was cancelled by the abort signal.
    #[error("Cancelled")]
    Cancelled,

    /// The model emitted a function call that could not be decoded.
    #[error("Invalid tool call: {0}")]
    InvalidToolCall(String),

    /// A tool failed while executing.
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// The user (or policy) rejected a gated tool call.
    #[error("Rejected: {0}")]
    RiskRejected(String),

    /// Transport-level LLM failures (network, 5xx).
    #[error("LLM transport error: {0}")]
    LlmTransport(String),

    /// The provider returned a payload the service cannot interpret.
    #[error("LLM protocol error: {0}")]
    LlmProtocol(String),

    /// The provider rate-limited the request.
    #[error("Rate limited: {0}")]
    RateLimit(String),

    /// History compression failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// Internal application errors (unexpected states, bugs).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DbRheoError {
    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Creates an authentication error with the given message.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates a transaction state error with the given message.
    pub fn tx_state(msg: impl Into<String>) -> Self {
        Self::TxState(msg.into())
    }

    /// Creates a read-only violation with the given message.
    pub fn read_only(msg: impl Into<String>) -> Self {
        Self::ReadOnly(msg.into())
    }

    /// Creates a timeout error with the given message.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates an invalid tool call error with the given message.
    pub fn invalid_tool_call(msg: impl Into<String>) -> Self {
        Self::InvalidToolCall(msg.into())
    }

    /// Creates a tool execution error with the given message.
    pub fn tool_execution(msg: impl Into<String>) -> Self {
        Self::ToolExecution(msg.into())
    }

    /// Creates a risk rejection with the given message.
    pub fn risk_rejected(msg: impl Into<String>) -> Self {
        Self::RiskRejected(msg.into())
    }

    /// Creates an LLM transport error with the given message.
    pub fn llm_transport(msg: impl Into<String>) -> Self {
        Self::LlmTransport(msg.into())
    }

    /// Creates an LLM protocol error with the given message.
    pub fn llm_protocol(msg: impl Into<String>) -> Self {
        Self::LlmProtocol(msg.into())
    }

    /// Creates a rate limit error with the given message.
    pub fn rate_limit(msg: impl Into<String>) -> Self {
        Self::RateLimit(msg.into())
    }

    /// Creates a compression error with the given message.
    pub fn compression(msg: impl Into<String>) -> Self {
        Self::Compression(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the stable machine-readable kind for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::Connect(_) => "ConnectError",
            Self::Auth(_) => "AuthError",
            Self::UnsupportedDialect(_) => "UnsupportedDialectError",
            Self::Query(_) => "QueryError",
            Self::TxState(_) => "TxStateError",
            Self::ReadOnly(_) => "ReadOnlyError",
            Self::Timeout(_) => "TimeoutError",
            Self::Cancelled => "CancelledError",
            Self::InvalidToolCall(_) => "InvalidToolCallError",
            Self::ToolExecution(_) => "ToolExecutionError",
            Self::RiskRejected(_) => "RiskRejectedError",
            Self::LlmTransport(_) => "LLMTransportError",
            Self::LlmProtocol(_) => "LLMProtocolError",
            Self::RateLimit(_) => "RateLimitError",
            Self::Compression(_) => "CompressionError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Returns true for transient failures worth retrying (network-level
    /// transport errors, rate limits, timeouts).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LlmTransport(_) | Self::RateLimit(_) | Self::Timeout(_)
        )
    }

    /// Serializes this error as the structured payload tools return to the
    /// model: `{"error": {"kind": ..., "message": ...}}`.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
            }
        })
    }
}

/// Result type alias using DbRheoError.
pub type Result<T> = std::result::Result<T, DbRheoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_connect() {
        let err = DbRheoError::connect("Cannot connect to localhost:5432");
        assert_eq!(
            err.to_string(),
            "Connection error: Cannot connect to localhost:5432"
        );
        assert_eq!(err.kind(), "ConnectError");
    }

    #[test]
    fn test_error_display_query() {
        let err = DbRheoError::query("column \"emal\" does not exist");
        assert_eq!(
            err.to_string(),
            "Query error: column \"emal\" does not exist"
        );
        assert_eq!(err.kind(), "QueryError");
    }

    #[test]
    fn test_error_kind_is_machine_readable() {
        assert_eq!(
            DbRheoError::UnsupportedDialect("oracle".into()).kind(),
            "UnsupportedDialectError"
        );
        assert_eq!(DbRheoError::Cancelled.kind(), "CancelledError");
        assert_eq!(
            DbRheoError::rate_limit("slow down").kind(),
            "RateLimitError"
        );
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DbRheoError::llm_transport("connection reset").is_retryable());
        assert!(DbRheoError::rate_limit("429").is_retryable());
        assert!(DbRheoError::timeout("30s elapsed").is_retryable());
        assert!(!DbRheoError::auth("bad key").is_retryable());
        assert!(!DbRheoError::config("bad yaml").is_retryable());
        assert!(!DbRheoError::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_payload_shape() {
        let payload = DbRheoError::risk_rejected("user declined").to_payload();
        assert_eq!(payload["error"]["kind"], "RiskRejectedError");
        assert!(payload["error"]["message"]
            .as_str()
            .unwrap()
            .contains("user declined"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DbRheoError>();
    }
}
