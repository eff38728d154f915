// ─────────────────────────────────────────────────────────────────────────────
// errors.rs — Engine-wide error taxonomy
//
// Every fallible path in the core returns Result<T, EngineError>. Adapter-level
// errors (HTTP, websocket, JSON, decimal parsing) convert in at the boundary via
// #[from] and get folded into Transient/StreamDisconnect/ExchangeRejected —
// nothing upstream of exchange.rs/ingestor.rs sees a raw library error type.
// ─────────────────────────────────────────────────────────────────────────────
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("infeasible plan: {0}")]
    InfeasiblePlan(String),

    #[error("exchange rejected order: {0}")]
    ExchangeRejected(String),

    #[error("transient error: {0}")]
    Transient(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("stream disconnected: {0}")]
    StreamDisconnect(String),

    #[error("risk breach: {0}")]
    RiskBreach(String),
}

impl EngineError {
    /// Whether this error class is worth a bounded local retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_) | EngineError::Timeout(_))
    }

    /// Whether this error class should escalate to the operator and halt the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ConfigError(_)
                | EngineError::InfeasiblePlan(_)
                | EngineError::PreconditionFailed(_)
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EngineError::Timeout(e.to_string())
        } else if e.is_connect() {
            EngineError::Transient(e.to_string())
        } else {
            EngineError::ExchangeRejected(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for EngineError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        EngineError::StreamDisconnect(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Transient(format!("json decode: {e}"))
    }
}

impl From<rust_decimal::Error> for EngineError {
    fn from(e: rust_decimal::Error) -> Self {
        EngineError::ConfigError(format!("decimal parse: {e}"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_timeout_are_retryable() {
        assert!(EngineError::Transient("x".into()).is_retryable());
        assert!(EngineError::Timeout("x".into()).is_retryable());
        assert!(!EngineError::ExchangeRejected("x".into()).is_retryable());
    }

    #[test]
    fn config_and_infeasible_are_fatal() {
        assert!(EngineError::ConfigError("x".into()).is_fatal());
        assert!(EngineError::InfeasiblePlan("x".into()).is_fatal());
        assert!(!EngineError::RiskBreach("x".into()).is_fatal());
    }

    #[test]
    fn display_messages_are_human_readable() {
        let err = EngineError::RiskBreach("channel breakout".into());
        assert_eq!(err.to_string(), "risk breach: channel breakout");
    }
}
