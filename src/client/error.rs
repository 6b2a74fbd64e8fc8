//! Transport-level failures of a single phone call

/// A call that did not produce a response status
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The call exceeded the per-call timeout.
    #[error("Request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    /// Connection-level failure (refused, unreachable, DNS).
    #[error("Connection to {url} failed: {message}")]
    Connect { url: String, message: String },

    /// The phone answered with something that is not valid HTTP.
    #[error("Protocol error from {url}: {message}")]
    Protocol { url: String, message: String },

    /// The request could not be built or sent.
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },
}

impl ClientError {
    /// Classify a [`reqwest::Error`] into the matching variant.
    pub fn classify_reqwest(err: &reqwest::Error, url: &str, timeout_ms: u64) -> Self {
        let url = url.to_string();
        if err.is_timeout() {
            Self::Timeout { url, timeout_ms }
        } else if err.is_connect() {
            Self::Connect {
                url,
                message: error_chain(err),
            }
        } else if err.is_body() || err.is_decode() {
            Self::Protocol {
                url,
                message: error_chain(err),
            }
        } else {
            Self::Request {
                url,
                message: error_chain(err),
            }
        }
    }

    #[cfg(test)]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

// reqwest's top-level message only names the URL; the cause is in the source chain
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
