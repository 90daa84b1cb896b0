//! Rate-limit-aware gateway to an OpenAI-compatible completion endpoint.
//!
//! A [`KeyPool`] hands out credentials round-robin and cools down the ones
//! that get rate limited; a [`RequestExecutor`] turns one logical request
//! into as many network attempts as its [`RetryPolicy`] allows.

pub mod cancel;
pub mod clock;
pub mod executor;
pub mod keypool;
pub mod transport;

pub use cancel::CancelToken;
pub use clock::{Clock, SystemClock};
/// Simulated clock for tests and dry runs: sleeps return at once and advance
/// its time.
pub use clock::ManualClock;
pub use executor::{
    CompletionRequest, EnvelopeError, RequestExecutor, RetryPolicy, StatsSnapshot,
};
pub use keypool::{Acquisition, CredentialStats, KeyPool, Lease, MAX_COOLDOWN};
pub use transport::{HttpReply, Transport, TransportFailure, UreqTransport};
