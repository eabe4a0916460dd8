//! Failure classification and retry message formatting.
//!
//! Every collaborator error carries a [`FailureKind`]. The kind decides whether
//! the retry executor may try again, and gives the user-facing description and
//! remediation hint used in retry logs.

use reqwest::{Error as ReqwestError, StatusCode};
use std::fmt;
use std::time::Duration;

/// Classification of collaborator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection refused, DNS failure, reset connection
    Network,
    /// Request or connect timeout
    Timeout,
    /// HTTP 429, with the server's Retry-After hint if it sent one
    RateLimited {
        /// Minimum wait requested by the server
        retry_after: Option<Duration>,
    },
    /// HTTP 5xx
    Server(u16),
    /// HTTP 401/403
    Auth(u16),
    /// Other HTTP 4xx
    Client(u16),
    /// Response could not be parsed or violated the expected contract
    Malformed,
    /// Remote job exists but is not finished yet
    StillProcessing,
    /// Remote job reported a terminal failure
    PermanentlyFailed,
    /// Anything else (local setup problems, missing credentials)
    Other,
    /// Call not made because shutdown was requested
    Cancelled,
}

impl FailureKind {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            429 => Self::RateLimited { retry_after },
            401 | 403 => Self::Auth(status),
            500..=599 => Self::Server(status),
            400..=499 => Self::Client(status),
            _ => Self::Malformed,
        }
    }

    /// Classify a transport-level reqwest error.
    pub fn from_reqwest(err: &ReqwestError) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), None);
        }
        if err.is_timeout() {
            return Self::Timeout;
        }
        if err.is_decode() {
            return Self::Malformed;
        }
        Self::Network
    }

    /// Whether another attempt may succeed.
    ///
    /// Network trouble, 429, 5xx and unfinished jobs are retryable. Other 4xx,
    /// malformed payloads and terminal job failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::RateLimited { .. }
                | Self::Server(_)
                | Self::StillProcessing
        )
    }

    /// Server-requested minimum delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short user-friendly description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Network => "connection failed",
            Self::Timeout => "network timeout",
            Self::RateLimited { .. } => "rate limit exceeded",
            Self::Server(code) => match code {
                500 => "internal server error",
                502 => "bad gateway",
                503 => "service unavailable",
                504 => "gateway timeout",
                _ => "server error",
            },
            Self::Auth(401) => "authentication failed (401)",
            Self::Auth(403) => "authentication failed (403)",
            Self::Auth(_) => "authentication failed",
            Self::Client(code) => match code {
                400 => "invalid request",
                404 => "resource not found",
                413 => "payload too large",
                422 => "request rejected",
                _ => "client error",
            },
            Self::Malformed => "malformed response",
            Self::StillProcessing => "still processing",
            Self::PermanentlyFailed => "job failed",
            Self::Other => "unexpected error",
            Self::Cancelled => "cancelled by shutdown",
        }
    }

    /// Remediation hint shown after final failures.
    pub fn suggestion(&self) -> &'static str {
        match self {
            Self::Network => "Verify internet connectivity and DNS resolution",
            Self::Timeout => "Check your network connection or raise the request timeout",
            Self::RateLimited { .. } => "Lower the configured rate limit for this target",
            Self::Server(_) => "The service may be degraded, try again later",
            Self::Auth(_) => "Verify the credentials environment variable for this endpoint",
            Self::Client(_) => "Review the request payload and endpoint configuration",
            Self::Malformed => "Check that the endpoint speaks the expected JSON contract",
            Self::StillProcessing => "Raise the provider timeout if jobs routinely take longer",
            Self::PermanentlyFailed => "Inspect the provider dashboard for the failed job",
            Self::Other => "Check the configuration and logs for details",
            Self::Cancelled => "Run again to finish the remaining work",
        }
    }

    /// Stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server(_) => "server",
            Self::Auth(_) => "auth",
            Self::Client(_) => "client",
            Self::Malformed => "malformed",
            Self::StillProcessing => "still_processing",
            Self::PermanentlyFailed => "permanently_failed",
            Self::Other => "other",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Parse a `Retry-After` header given in whole seconds.
///
/// HTTP-date values are ignored; the regular backoff applies instead.
pub fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Classify a response status, honouring `Retry-After` on 429.
pub fn classify_response(status: StatusCode, headers: &reqwest::header::HeaderMap) -> FailureKind {
    let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
        parse_retry_after(headers.get(reqwest::header::RETRY_AFTER))
    } else {
        None
    };
    FailureKind::from_status(status.as_u16(), retry_after)
}

/// Context for formatting retry log messages.
#[derive(Debug, Clone)]
pub struct RetryContext<'a> {
    /// Current attempt number (1-based)
    pub attempt: u32,
    /// Maximum number of attempts configured
    pub max_attempts: u32,
    /// Kind of failure that triggered the retry
    pub kind: FailureKind,
    /// Backoff until the next attempt
    pub backoff: Duration,
    /// Operation label (`submit:provider-a`, `post:instagram`, ...)
    pub operation: &'a str,
    /// Original error message
    pub error_message: &'a str,
}

impl RetryContext<'_> {
    /// Standard retry line with attempt counters.
    pub fn format_retry(&self) -> String {
        format!(
            "Retrying {} (attempt {}/{}) after {} - waiting {:.1} seconds...",
            self.operation,
            self.attempt,
            self.max_attempts,
            self.kind.description(),
            self.backoff.as_secs_f64()
        )
    }

    /// Multi-line failure summary with a remediation hint.
    pub fn format_failure(&self) -> String {
        let mut lines = vec![format!(
            "[FAILED] {} failed after {} attempt(s)",
            self.operation, self.attempt
        )];
        lines.push(format!("  Last error: {}", self.error_message));
        lines.push(format!("  Cause: {}", self.kind.description()));
        lines.push(format!("  Suggestion: {}", self.kind.suggestion()));
        if self.kind.is_retryable() && self.attempt >= self.max_attempts {
            lines.push(format!(
                "  Suggestion: raise max_attempts (current: {})",
                self.max_attempts
            ));
        }
        lines.join("\n")
    }
}
