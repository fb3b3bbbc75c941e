//! Retryable-vs-fatal classification of remote errors.
//!
//! Every retry decision in the crate goes through [`classify`]; nothing else inspects
//! error strings to decide whether to wait.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::errors::RemoteError;

/// Network error codes that indicate a transient failure.
pub const TRANSIENT_CODES: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ECONNREFUSED",
    "ECONNABORTED",
    "EPIPE",
    "EAI_AGAIN",
    "ENOTFOUND",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "socket hang up",
];

const RATE_LIMIT_PHRASES: &[&str] = &["rate limit", "rate-limit", "too many requests", "quota"];

/// What to do about a failed remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient; retry with exponential backoff
    Retry,
    /// Rate limited; wait the advertised (or fallback) window, then retry
    RateLimitRetry,
    /// Permanent; do not retry
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorClass::Fatal)
    }
}

/// Classify a remote error. Rate limits win over everything else, then HTTP status,
/// then network codes. Anything unrecognised is fatal.
pub fn classify(err: &RemoteError) -> ErrorClass {
    if err.status == Some(429) || is_rate_limit_message(&err.message) {
        return ErrorClass::RateLimitRetry;
    }

    if let Some(status) = err.status {
        return if (500..600).contains(&status) {
            ErrorClass::Retry
        } else {
            ErrorClass::Fatal
        };
    }

    let transient_code = err
        .code
        .as_deref()
        .is_some_and(|code| TRANSIENT_CODES.iter().any(|t| t.eq_ignore_ascii_case(code)));
    if transient_code || find_transient_code(&err.message).is_some() {
        ErrorClass::Retry
    } else {
        ErrorClass::Fatal
    }
}

fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RATE_LIMIT_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

fn find_transient_code(text: &str) -> Option<&'static str> {
    TRANSIENT_CODES.iter().copied().find(|code| text.contains(code))
}

static STATUS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:http(?:/\d(?:\.\d)?)?|status(?:\s+code)?)\s*[:=]?\s*([1-5]\d\d)\b").unwrap()
});

static RETRY_AFTER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry[-_ ]after\s*[:=]?\s*(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?)?")
        .unwrap()
});

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// An error carrying an HTTP status.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::new(message).with_status(status)
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, wait: Duration) -> Self {
        self.retry_after = Some(wait);
        self
    }

    /// Build an error from free-form collaborator output (stderr of an external command,
    /// an error body), extracting an HTTP status, a network code and a `retry-after` hint.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let status = STATUS_REGEX
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok());
        let retry_after = RETRY_AFTER_REGEX.captures(text).and_then(|caps| {
            let value: f64 = caps.get(1)?.as_str().parse().ok()?;
            let millis = match caps.get(2).map(|m| m.as_str().to_lowercase()) {
                Some(unit) if unit.starts_with("ms") || unit.starts_with("milli") => value,
                _ => value * 1000.0,
            };
            Some(Duration::from_millis(millis as u64))
        });

        Self {
            status,
            code: find_transient_code(text).map(str::to_string),
            message: text.to_string(),
            retry_after,
        }
    }

    pub fn class(&self) -> ErrorClass {
        classify(self)
    }
}
