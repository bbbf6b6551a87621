use std::fmt;

/// Errors surfaced by `ExchangeClient` calls. Matched on at call sites that
/// care (rate limiting vs. a logical rejection); everything else propagates
/// as `anyhow::Error` at the orchestration layer.
#[derive(Debug, Clone)]
pub enum ExchangeError {
    /// Timeout, connection reset, 5xx — already exhausted the retry budget.
    Network(String),
    /// HTTP 200 with a non-zero exchange response code.
    Logical { code: i64, msg: String },
    /// Response body was not valid JSON, or didn't match the expected shape.
    Parse(String),
    /// Rate limited past the retry budget.
    RateLimited,
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Network(msg) => write!(f, "network error: {msg}"),
            ExchangeError::Logical { code, msg } => write!(f, "exchange error {code}: {msg}"),
            ExchangeError::Parse(msg) => write!(f, "parse error: {msg}"),
            ExchangeError::RateLimited => write!(f, "rate limited"),
        }
    }
}

impl std::error::Error for ExchangeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_logical_error_with_code() {
        let e = ExchangeError::Logical {
            code: -1000,
            msg: "insufficient margin".into(),
        };
        assert_eq!(e.to_string(), "exchange error -1000: insufficient margin");
    }
}
