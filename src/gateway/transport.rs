//! HTTP transport seam.
//!
//! The executor only needs "POST this JSON with this bearer token and tell me
//! the status and body". Keeping that behind [`Transport`] lets tests script
//! replies without a network.

use std::time::Duration;

use thiserror::Error;

/// A completed HTTP exchange, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
    /// Raw `Retry-After` header, if the server sent one.
    pub retry_after: Option<String>,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }
}

/// The request never produced an HTTP status.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportFailure {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
}

/// Performs one POST of a JSON body with bearer authentication.
pub trait Transport: Send + Sync {
    fn post_json(
        &self,
        url: &str,
        bearer: &str,
        body: &str,
    ) -> Result<HttpReply, TransportFailure>;
}

/// Blocking transport built on a shared `ureq` agent.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self { agent }
    }
}

impl std::fmt::Debug for UreqTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UreqTransport").finish_non_exhaustive()
    }
}

impl Transport for UreqTransport {
    fn post_json(
        &self,
        url: &str,
        bearer: &str,
        body: &str,
    ) -> Result<HttpReply, TransportFailure> {
        let result = self
            .agent
            .post(url)
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {bearer}"))
            .send_string(body);

        // ureq reports 4xx/5xx as `Error::Status`; both arms carry a response.
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => {
                return Err(classify_transport(&transport));
            }
        };

        let status = response.status();
        let retry_after = response.header("retry-after").map(str::to_string);
        let body = response.into_string().map_err(|e| {
            if is_timeout(&e) {
                TransportFailure::Timeout
            } else {
                TransportFailure::Connection(e.to_string())
            }
        })?;

        Ok(HttpReply {
            status,
            body,
            retry_after,
        })
    }
}

fn classify_transport(transport: &ureq::Transport) -> TransportFailure {
    let timed_out = std::error::Error::source(transport)
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .is_some_and(is_timeout);
    if timed_out {
        TransportFailure::Timeout
    } else {
        TransportFailure::Connection(transport.to_string())
    }
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_endpoint_is_a_transport_failure() {
        let transport = UreqTransport::new(Duration::from_secs(2));
        let result = transport.post_json("http://127.0.0.1:1/v1/chat", "k", "{}");
        assert!(result.is_err());
    }

    #[test]
    fn reply_builder_keeps_retry_after() {
        let reply = HttpReply::new(429, "{}").with_retry_after("7");
        assert_eq!(reply.status, 429);
        assert_eq!(reply.retry_after.as_deref(), Some("7"));
    }

    #[test]
    fn failure_display() {
        assert_eq!(TransportFailure::Timeout.to_string(), "request timed out");
        assert!(
            TransportFailure::Connection("refused".into())
                .to_string()
                .contains("refused")
        );
    }
}
