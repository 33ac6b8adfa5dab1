//! HTTP/reqwest error mapping onto the workflow's substring
//! classification rules.
//!
//! Reference: <https://docs.anthropic.com/en/api/errors>

use optic_protocol::{WorkflowError, classify_model_failure};

/// Map an HTTP status code to a classified [`WorkflowError`].
///
/// The message is phrased so the substring classifier lands on the
/// intended class: 429 mentions the rate limit, 4xx mention the invalid
/// request, everything else falls through to the server-error class.
pub(crate) fn map_http_status(status: reqwest::StatusCode, body: &str) -> WorkflowError {
    let message = match status.as_u16() {
        429 => format!("rate limit exceeded (HTTP 429): {body}"),
        401 | 403 => format!("invalid credentials (HTTP {status}): {body}"),
        400 => format!("validation failed (HTTP 400): {body}"),
        404 => format!("invalid model (HTTP 404): {body}"),
        408 => format!("request timeout (HTTP 408): {body}"),
        // 529 is Anthropic's overloaded status; treat it like throttling.
        529 => format!("throttling: service overloaded (HTTP 529): {body}"),
        _ => format!("server error (HTTP {status}): {body}"),
    };
    classify_model_failure(&message).with_component("anthropic_model")
}

/// Map a [`reqwest::Error`] to a classified [`WorkflowError`].
pub(crate) fn map_reqwest_error(error: reqwest::Error) -> WorkflowError {
    let message = if error.is_timeout() {
        format!("request timeout: {error}")
    } else {
        format!("request failed: {error}")
    };
    classify_model_failure(&message)
        .with_component("anthropic_model")
        .with_source(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use optic_protocol::{ErrorCategory, RetryStrategy};

    #[test]
    fn http_429_classifies_as_capacity() {
        let err = map_http_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(err.category, ErrorCategory::Capacity);
        assert_eq!(err.retry_strategy, RetryStrategy::Jittered);
        assert_eq!(err.max_retries, 5);
    }

    #[test]
    fn http_529_classifies_as_capacity() {
        let err = map_http_status(reqwest::StatusCode::from_u16(529).unwrap(), "overloaded");
        assert_eq!(err.category, ErrorCategory::Capacity);
    }

    #[test]
    fn http_400_is_terminal() {
        let err = map_http_status(reqwest::StatusCode::BAD_REQUEST, "bad image");
        assert_eq!(err.category, ErrorCategory::Client);
        assert!(!err.retryable());
    }

    #[test]
    fn http_401_is_terminal() {
        let err = map_http_status(reqwest::StatusCode::UNAUTHORIZED, "no key");
        assert_eq!(err.category, ErrorCategory::Client);
    }

    #[test]
    fn http_408_is_a_network_timeout() {
        let err = map_http_status(reqwest::StatusCode::REQUEST_TIMEOUT, "slow");
        assert_eq!(err.category, ErrorCategory::Network);
        assert_eq!(err.max_retries, 2);
    }

    #[test]
    fn http_500_is_a_retryable_server_error() {
        let err = map_http_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(err.category, ErrorCategory::Model);
        assert_eq!(err.retry_strategy, RetryStrategy::Exponential);
        assert_eq!(err.max_retries, 3);
    }
}
