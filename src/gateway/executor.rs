//! One logical completion call with bounded retries and key rotation.
//!
//! Each HTTP outcome is classified into an [`Outcome`] and the retry loop
//! decides from that kind alone whether to rotate, back off, or give up:
//!
//! | outcome            | action                          | terminal error         |
//! |--------------------|---------------------------------|------------------------|
//! | all keys cooling   | sleep to shortest cooldown      | `AllKeysExhausted`     |
//! | 429                | penalize key, rotate at once    | `AllKeysExhausted`     |
//! | 5xx                | backoff, same key               | `UpstreamUnavailable`  |
//! | malformed 200 body | backoff, rotate                 | `MalformedResponse`    |
//! | other 4xx          | none                            | `RequestRejected`      |
//! | timeout/transport  | fixed delay, rotate             | `TransportError`       |

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use miette::Diagnostic;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::{GatewayError, GatewayResult};

use super::cancel::CancelToken;
use super::clock::{Clock, SystemClock};
use super::keypool::{Acquisition, KeyPool, Lease, MAX_COOLDOWN};
use super::transport::{HttpReply, Transport, TransportFailure};

/// Type URL of the RPC detail that carries a structured retry delay.
const RETRY_INFO_TYPE: &str = "type.googleapis.com/google.rpc.RetryInfo";

/// Safety margin added to a server-provided retry delay.
const RETRY_HINT_BUFFER: Duration = Duration::from_secs(1);

/// Longest body excerpt kept in error values and logs.
const BODY_EXCERPT_CHARS: usize = 512;

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A fully formed completion request, supplied by the orchestration layer.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub system: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            max_tokens: 1000,
            temperature: 0.2,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Encode the chat-completions payload.
    pub fn to_payload(&self) -> GatewayResult<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(Message {
                role: "system",
                content: MessageContent::Plain(system),
            });
        }
        messages.push(Message {
            role: "user",
            content: MessageContent::Parts(vec![ContentPart {
                kind: "text",
                text: &self.prompt,
            }]),
        });

        let payload = Payload {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        serde_json::to_string(&payload).map_err(|e| GatewayError::Serialize {
            message: e.to_string(),
        })
    }
}

#[derive(Serialize)]
struct Payload<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Plain(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
struct ContentPart<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

// ---------------------------------------------------------------------------
// Policy and counters
// ---------------------------------------------------------------------------

/// Retry budget and delay shape.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Network attempts per logical call (default: 15).
    pub max_attempts: u32,
    /// Base of the exponential backoff, also the fixed transport retry delay.
    pub base_delay: Duration,
    /// Upper bound on a single backoff sleep.
    pub max_backoff: Duration,
    /// Upper bound of the extra random wait added to cooldown waits.
    pub wait_jitter: Duration,
    /// Backoff jitter as a fraction of the delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 15,
            base_delay: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
            wait_jitter: Duration::from_millis(2500),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Deterministic policy with no jitter, handy in tests.
    pub fn without_jitter(mut self) -> Self {
        self.wait_jitter = Duration::ZERO;
        self.jitter_ratio = 0.0;
        self
    }

    /// `base_delay * 2^attempt`, capped at `max_backoff`, before jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(20);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Live counters for one executor. Read them with [`ExecutorStats::snapshot`].
#[derive(Debug, Default)]
pub struct ExecutorStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    rate_limited: AtomicU64,
    server_errors: AtomicU64,
    malformed: AtomicU64,
    transport_failures: AtomicU64,
    cooldown_waits: AtomicU64,
}

/// Point-in-time copy of [`ExecutorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub rate_limited: u64,
    pub server_errors: u64,
    pub malformed: u64,
    pub transport_failures: u64,
    pub cooldown_waits: u64,
}

impl ExecutorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            cooldown_waits: self.cooldown_waits.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// What one network attempt produced.
#[derive(Debug)]
enum Outcome {
    Success(String),
    RateLimited { retry_after: Option<Duration> },
    ServerError { status: u16, body: String },
    Malformed(EnvelopeError),
    Rejected { status: u16, body: String },
    Transport(TransportFailure),
}

fn classify(result: Result<HttpReply, TransportFailure>) -> Outcome {
    let reply = match result {
        Ok(reply) => reply,
        Err(failure) => return Outcome::Transport(failure),
    };

    match reply.status {
        200..=299 => match extract_message_text(&reply.body) {
            Ok(text) => Outcome::Success(text),
            Err(reason) => Outcome::Malformed(reason),
        },
        429 => Outcome::RateLimited {
            retry_after: retry_after_hint(&reply.body, reply.retry_after.as_deref()),
        },
        status if status >= 500 => Outcome::ServerError {
            status,
            body: excerpt(&reply.body),
        },
        status => Outcome::Rejected {
            status,
            body: excerpt(&reply.body),
        },
    }
}

/// Why a 2xx body is not a usable chat-completions envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum EnvelopeError {
    #[error("response is not JSON: {0}")]
    #[diagnostic(code(loom::gateway::envelope::not_json))]
    NotJson(String),

    #[error("'choices' not found in response")]
    #[diagnostic(code(loom::gateway::envelope::missing_choices))]
    MissingChoices,

    #[error("'choices' array is empty")]
    #[diagnostic(code(loom::gateway::envelope::empty_choices))]
    EmptyChoices,

    #[error("'message' not found in first choice")]
    #[diagnostic(code(loom::gateway::envelope::missing_message))]
    MissingMessage,

    #[error("'content' not found in message")]
    #[diagnostic(code(loom::gateway::envelope::missing_content))]
    MissingContent,
}

/// Pull the model's message text out of a chat-completions envelope.
///
/// Requires a non-empty `choices` list; accepts `message.content` or, failing
/// that, `message.text`.
pub fn extract_message_text(body: &str) -> Result<String, EnvelopeError> {
    let envelope: Value =
        serde_json::from_str(body).map_err(|e| EnvelopeError::NotJson(e.to_string()))?;

    let choices = envelope
        .get("choices")
        .and_then(Value::as_array)
        .ok_or(EnvelopeError::MissingChoices)?;
    let first = choices.first().ok_or(EnvelopeError::EmptyChoices)?;
    let message = first.get("message").ok_or(EnvelopeError::MissingMessage)?;

    if let Some(content) = message.get("content").and_then(Value::as_str) {
        return Ok(content.to_string());
    }
    if let Some(text) = message.get("text").and_then(Value::as_str) {
        tracing::debug!("message had no 'content', using 'text'");
        return Ok(text.to_string());
    }
    Err(EnvelopeError::MissingContent)
}

/// Extract a retry delay from a 429 reply.
///
/// Prefers the structured `RetryInfo` detail in the error body (plus a one
/// second buffer), then a numeric `Retry-After` header.
pub fn retry_after_hint(body: &str, header: Option<&str>) -> Option<Duration> {
    let from_body = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        json.pointer("/error/details")?
            .as_array()?
            .iter()
            .find(|detail| detail.get("@type").and_then(Value::as_str) == Some(RETRY_INFO_TYPE))?
            .get("retryDelay")?
            .as_str()
            .and_then(parse_seconds)
            .map(|delay| delay.saturating_add(RETRY_HINT_BUFFER).min(MAX_COOLDOWN))
    });

    from_body.or_else(|| header.and_then(parse_seconds))
}

/// Parse `"26s"`, `"26.400891299s"` or `"26"` into a duration, capped at
/// [`MAX_COOLDOWN`]. Negative or non-numeric values are ignored.
fn parse_seconds(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().trim_end_matches('s').parse().ok()?;
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    Some(
        Duration::try_from_secs_f64(secs)
            .unwrap_or(MAX_COOLDOWN)
            .min(MAX_COOLDOWN),
    )
}

fn excerpt(body: &str) -> String {
    if body.chars().count() <= BODY_EXCERPT_CHARS {
        body.to_string()
    } else {
        let mut cut: String = body.chars().take(BODY_EXCERPT_CHARS).collect();
        cut.push_str("...");
        cut
    }
}

/// The last retryable failure, used to pick the terminal error.
#[derive(Debug)]
enum LastFailure {
    RateLimited,
    Server { status: u16, body: String },
    Malformed(String),
    Transport(String),
}

impl LastFailure {
    fn into_error(self, attempts: u32) -> GatewayError {
        match self {
            Self::RateLimited => GatewayError::AllKeysExhausted { attempts },
            Self::Server { status, body } => GatewayError::UpstreamUnavailable {
                attempts,
                status,
                body,
            },
            Self::Malformed(message) => GatewayError::MalformedResponse { attempts, message },
            Self::Transport(message) => GatewayError::TransportError { attempts, message },
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Issues completion calls against one endpoint using a shared [`KeyPool`].
pub struct RequestExecutor {
    base_url: String,
    pool: Arc<KeyPool>,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    stats: ExecutorStats,
}

impl RequestExecutor {
    pub fn new(
        base_url: impl Into<String>,
        pool: Arc<KeyPool>,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            pool,
            transport,
            policy,
            clock: Arc::new(SystemClock),
            stats: ExecutorStats::default(),
        }
    }

    /// Use `clock` for backoff and cooldown sleeps. Share it with the pool.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Perform one logical call, returning the model's message text.
    pub fn execute(&self, request: &CompletionRequest) -> GatewayResult<String> {
        self.execute_with_cancel(request, &CancelToken::new())
    }

    /// Like [`RequestExecutor::execute`], abortable through `cancel`.
    pub fn execute_with_cancel(
        &self,
        request: &CompletionRequest,
        cancel: &CancelToken,
    ) -> GatewayResult<String> {
        let payload = request.to_payload()?;
        let max_attempts = self.policy.max_attempts.max(1);

        let mut attempts: u32 = 0;
        let mut waits: u32 = 0;
        let mut sticky: Option<Lease> = None;

        loop {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled { attempts });
            }

            let lease = match sticky.take().filter(|lease| self.pool.reuse(lease)) {
                Some(lease) => lease,
                None => match self.pool.acquire() {
                    Acquisition::Ready(lease) => lease,
                    Acquisition::Wait(wait) => {
                        waits += 1;
                        ExecutorStats::bump(&self.stats.cooldown_waits);
                        if waits > max_attempts {
                            return Err(GatewayError::AllKeysExhausted { attempts });
                        }
                        let total = wait + self.wait_jitter();
                        tracing::info!(
                            wait_secs = total.as_secs_f64(),
                            waits,
                            "all credentials cooling down, waiting"
                        );
                        self.pause(total, cancel, attempts)?;
                        continue;
                    }
                },
            };

            attempts += 1;
            ExecutorStats::bump(&self.stats.attempts);
            tracing::debug!(
                attempt = attempts,
                max_attempts,
                key = lease.number(),
                model = %request.model,
                "sending completion request"
            );

            let outcome = classify(self.transport.post_json(
                &self.base_url,
                lease.secret(),
                &payload,
            ));

            let failure = match outcome {
                Outcome::Success(text) => {
                    ExecutorStats::bump(&self.stats.successes);
                    return Ok(text);
                }
                Outcome::Rejected { status, body } => {
                    tracing::warn!(status, key = lease.number(), "request rejected");
                    return Err(GatewayError::RequestRejected { status, body });
                }
                Outcome::RateLimited { retry_after } => {
                    ExecutorStats::bump(&self.stats.rate_limited);
                    self.pool.penalize(&lease, retry_after);
                    LastFailure::RateLimited
                }
                Outcome::ServerError { status, body } => {
                    ExecutorStats::bump(&self.stats.server_errors);
                    tracing::warn!(status, attempt = attempts, "server error");
                    sticky = Some(lease);
                    LastFailure::Server { status, body }
                }
                Outcome::Malformed(reason) => {
                    ExecutorStats::bump(&self.stats.malformed);
                    self.pool.record_malformed(&lease);
                    tracing::warn!(reason = %reason, attempt = attempts, "malformed response");
                    LastFailure::Malformed(reason.to_string())
                }
                Outcome::Transport(failure) => {
                    ExecutorStats::bump(&self.stats.transport_failures);
                    tracing::warn!(error = %failure, attempt = attempts, "transport failure");
                    LastFailure::Transport(failure.to_string())
                }
            };

            if attempts >= max_attempts {
                let err = failure.into_error(attempts);
                tracing::warn!(kind = err.kind(), attempts, "retry budget exhausted");
                return Err(err);
            }

            let delay = match &failure {
                LastFailure::RateLimited => None,
                LastFailure::Server { .. } | LastFailure::Malformed(_) => {
                    Some(self.jittered_backoff(attempts - 1))
                }
                LastFailure::Transport(_) => Some(self.policy.base_delay),
            };
            if let Some(delay) = delay {
                self.pause(delay, cancel, attempts)?;
            }
        }
    }

    fn pause(&self, delay: Duration, cancel: &CancelToken, attempts: u32) -> GatewayResult<()> {
        if self.clock.sleep(delay, cancel) {
            Ok(())
        } else {
            Err(GatewayError::Cancelled { attempts })
        }
    }

    fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.policy.backoff(attempt);
        if self.policy.jitter_ratio > 0.0 {
            let jitter = rand::thread_rng().gen_range(0.0..=self.policy.jitter_ratio);
            delay.mul_f64(1.0 + jitter)
        } else {
            delay
        }
    }

    fn wait_jitter(&self) -> Duration {
        if self.policy.wait_jitter.is_zero() {
            Duration::ZERO
        } else {
            let secs = rand::thread_rng().gen_range(0.0..=self.policy.wait_jitter.as_secs_f64());
            Duration::from_secs_f64(secs)
        }
    }
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("base_url", &self.base_url)
            .field("pool", &self.pool)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
