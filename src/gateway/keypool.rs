//! Credential pool with round-robin selection and per-key cooldowns.
//!
//! A rate-limited key is cooled down on its own, so the remaining keys keep
//! serving traffic while it recovers. All selection and bookkeeping happens
//! under one mutex, which makes [`KeyPool`] safe to share between worker
//! threads behind an `Arc`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::ConfigError;

use super::clock::{Clock, SystemClock};

/// Default upper bound of the cooldown jitter, as a fraction of the cooldown.
pub const DEFAULT_JITTER_RATIO: f64 = 0.2;

/// Upper bound on any single cooldown, whatever the server asks for.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(3600);

/// One credential and its bookkeeping. Only ever touched under the pool lock.
#[derive(Debug)]
struct Credential {
    secret: Arc<str>,
    cooldown_until: Option<Instant>,
    usage_count: u64,
    error_count: u64,
    malformed_count: u64,
}

impl Credential {
    fn new(secret: &str) -> Self {
        Self {
            secret: Arc::from(secret),
            cooldown_until: None,
            usage_count: 0,
            error_count: 0,
            malformed_count: 0,
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.cooldown_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    fn is_available(&self, now: Instant) -> bool {
        self.cooldown_until.is_none_or(|until| until <= now)
    }
}

/// A credential handed out by [`KeyPool::acquire`].
///
/// The secret is never printed by `Debug`; only the 1-based key number is.
#[derive(Clone)]
pub struct Lease {
    index: usize,
    secret: Arc<str>,
}

impl Lease {
    /// Position of the credential in the pool (0-based).
    pub fn index(&self) -> usize {
        self.index
    }

    /// 1-based key number, used in logs.
    pub fn number(&self) -> usize {
        self.index + 1
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.number())
            .field("secret", &mask(&self.secret))
            .finish()
    }
}

/// Outcome of a selection attempt.
#[derive(Debug, Clone)]
pub enum Acquisition {
    /// A usable credential; its usage counter has already been bumped.
    Ready(Lease),
    /// Every credential is cooling down. The shortest remaining cooldown.
    Wait(Duration),
}

/// Snapshot of one credential's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct CredentialStats {
    /// 1-based key number.
    pub key_number: usize,
    /// First 8 and last 4 characters, or `***` for short secrets.
    pub masked_key: String,
    pub usage_count: u64,
    /// Number of times the key was rate limited.
    pub error_count: u64,
    /// Number of malformed 200 replies received with the key.
    pub malformed_count: u64,
    pub currently_available: bool,
    pub cooldown_remaining: Duration,
}

#[derive(Debug)]
struct PoolState {
    credentials: Vec<Credential>,
    /// Index at which the next round-robin scan starts.
    cursor: usize,
}

/// Thread-safe pool of API credentials.
pub struct KeyPool {
    state: Mutex<PoolState>,
    default_cooldown: Duration,
    jitter_ratio: f64,
    clock: Arc<dyn Clock>,
}

impl KeyPool {
    /// Build a pool from raw credential strings.
    ///
    /// Blank entries are dropped after trimming; an empty result is a
    /// [`ConfigError::EmptyCredentials`]. A single key is a valid pool.
    pub fn new<S: AsRef<str>>(
        credentials: &[S],
        default_cooldown: Duration,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(credentials, default_cooldown, Arc::new(SystemClock))
    }

    /// Like [`KeyPool::new`], but reading time from `clock`.
    pub fn with_clock<S: AsRef<str>>(
        credentials: &[S],
        default_cooldown: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let credentials: Vec<Credential> = credentials
            .iter()
            .map(|c| c.as_ref().trim())
            .filter(|c| !c.is_empty())
            .map(Credential::new)
            .collect();

        if credentials.is_empty() {
            return Err(ConfigError::EmptyCredentials);
        }

        tracing::info!(keys = credentials.len(), "key pool initialized");

        Ok(Self {
            state: Mutex::new(PoolState {
                credentials,
                cursor: 0,
            }),
            default_cooldown,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            clock,
        })
    }

    /// Set the upper bound of the cooldown jitter (fraction of the cooldown,
    /// clamped to `0.0..=1.0`).
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn default_cooldown(&self) -> Duration {
        self.default_cooldown
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Select the next usable credential in round-robin order.
    ///
    /// The scan starts just after the credential returned last. When every
    /// credential is cooling down, nothing is returned and the shortest
    /// remaining cooldown is reported instead.
    pub fn acquire(&self) -> Acquisition {
        let now = self.clock.now();
        let mut state = self.lock();
        let len = state.credentials.len();

        for step in 0..len {
            let index = (state.cursor + step) % len;
            let credential = &mut state.credentials[index];
            if credential.is_available(now) {
                credential.usage_count += 1;
                let lease = Lease {
                    index,
                    secret: Arc::clone(&credential.secret),
                };
                state.cursor = (index + 1) % len;
                return Acquisition::Ready(lease);
            }
        }

        let wait = state
            .credentials
            .iter()
            .map(|c| c.remaining(now))
            .min()
            .unwrap_or_default();
        Acquisition::Wait(wait)
    }

    /// Cool a credential down after it was rate limited.
    ///
    /// The cooldown is `retry_after` (or the pool default) stretched by a
    /// random jitter in `[0, jitter_ratio]`. Calling again while the key is
    /// still cooling simply moves the end of the window. Returns the cooldown
    /// that was applied.
    pub fn penalize(&self, lease: &Lease, retry_after: Option<Duration>) -> Duration {
        let base = retry_after
            .filter(|d| !d.is_zero())
            .unwrap_or(self.default_cooldown)
            .min(MAX_COOLDOWN);
        let jitter = if self.jitter_ratio > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter_ratio)
        } else {
            0.0
        };
        let cooldown = base.mul_f64(1.0 + jitter).min(MAX_COOLDOWN);

        let now = self.clock.now();
        let mut state = self.lock();
        if let Some(credential) = state.credentials.get_mut(lease.index) {
            credential.cooldown_until = now.checked_add(cooldown).or(credential.cooldown_until);
            credential.error_count += 1;
        }
        drop(state);

        tracing::warn!(
            key = lease.number(),
            cooldown_secs = cooldown.as_secs_f64(),
            "credential rate limited, cooling down"
        );
        cooldown
    }

    /// Hand `lease` out again for a retry on the same credential.
    ///
    /// Counts as a use when the credential is still available. Returns
    /// `false` when it has been cooled down since it was leased, in which case
    /// the caller should [`acquire`](Self::acquire) another.
    pub fn reuse(&self, lease: &Lease) -> bool {
        let now = self.clock.now();
        let mut state = self.lock();
        match state.credentials.get_mut(lease.index) {
            Some(credential) if credential.is_available(now) => {
                credential.usage_count += 1;
                true
            }
            _ => false,
        }
    }

    /// Count a malformed reply against a credential. Does not cool it down.
    pub fn record_malformed(&self, lease: &Lease) {
        let mut state = self.lock();
        if let Some(credential) = state.credentials.get_mut(lease.index) {
            credential.malformed_count += 1;
        }
    }

    /// Snapshot of every credential's counters and availability.
    pub fn stats(&self) -> Vec<CredentialStats> {
        let now = self.clock.now();
        let state = self.lock();
        state
            .credentials
            .iter()
            .enumerate()
            .map(|(i, c)| CredentialStats {
                key_number: i + 1,
                masked_key: mask(&c.secret),
                usage_count: c.usage_count,
                error_count: c.error_count,
                malformed_count: c.malformed_count,
                currently_available: c.is_available(now),
                cooldown_remaining: c.remaining(now),
            })
            .collect()
    }
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPool")
            .field("keys", &self.len())
            .field("default_cooldown", &self.default_cooldown)
            .field("jitter_ratio", &self.jitter_ratio)
            .finish()
    }
}

fn mask(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 12 {
        let head: String = chars[..8].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "***".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::clock::ManualClock;

    fn pool(keys: &[&str], clock: &Arc<ManualClock>) -> KeyPool {
        KeyPool::with_clock(keys, Duration::from_secs(60), clock.clone()).unwrap()
    }

    fn ready(acq: Acquisition) -> Lease {
        match acq {
            Acquisition::Ready(lease) => lease,
            Acquisition::Wait(d) => panic!("expected a credential, got wait {d:?}"),
        }
    }

    #[test]
    fn empty_or_blank_list_is_rejected() {
        let none: [&str; 0] = [];
        assert!(matches!(
            KeyPool::new(&none, Duration::from_secs(1)),
            Err(ConfigError::EmptyCredentials)
        ));
        assert!(matches!(
            KeyPool::new(&["  ", ""], Duration::from_secs(1)),
            Err(ConfigError::EmptyCredentials)
        ));
    }

    #[test]
    fn blanks_are_dropped_and_keys_trimmed() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool(&[" alpha ", "", "beta"], &clock);
        assert_eq!(pool.len(), 2);
        assert_eq!(ready(pool.acquire()).secret(), "alpha");
    }

    #[test]
    fn round_robin_returns_each_key_once() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool(&["k0", "k1", "k2"], &clock);
        let order: Vec<usize> = (0..3).map(|_| ready(pool.acquire()).index()).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(ready(pool.acquire()).index(), 0);
        assert!(pool.stats().iter().all(|s| s.usage_count >= 1));
    }

    #[test]
    fn single_key_pool_is_valid() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool(&["solo"], &clock);
        assert_eq!(ready(pool.acquire()).index(), 0);
        assert_eq!(ready(pool.acquire()).index(), 0);
        assert_eq!(pool.stats()[0].usage_count, 2);
    }

    #[test]
    fn penalized_key_is_skipped_until_cooldown_expires() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool(&["k0", "k1"], &clock);
        let first = ready(pool.acquire());
        let applied = pool.penalize(&first, Some(Duration::from_secs(10)));
        assert!(applied >= Duration::from_secs(10));
        assert!(applied <= Duration::from_secs(12));

        // Only k1 is handed out while k0 cools down.
        for _ in 0..4 {
            assert_eq!(ready(pool.acquire()).index(), 1);
        }

        clock.advance(Duration::from_secs(9));
        assert_eq!(ready(pool.acquire()).index(), 1);

        clock.advance(Duration::from_secs(4));
        let indices: Vec<usize> = (0..2).map(|_| ready(pool.acquire()).index()).collect();
        assert!(indices.contains(&0));
    }

    #[test]
    fn all_cooling_reports_shortest_wait() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool(&["k0", "k1"], &clock).with_jitter_ratio(0.0);
        let a = ready(pool.acquire());
        let b = ready(pool.acquire());
        pool.penalize(&a, Some(Duration::from_secs(30)));
        pool.penalize(&b, Some(Duration::from_secs(10)));
        clock.advance(Duration::from_secs(4));

        match pool.acquire() {
            Acquisition::Wait(wait) => assert_eq!(wait, Duration::from_secs(6)),
            Acquisition::Ready(lease) => panic!("unexpected lease {lease:?}"),
        }
    }

    #[test]
    fn penalize_without_hint_uses_default_and_counts_errors() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool(&["k0"], &clock).with_jitter_ratio(0.0);
        let lease = ready(pool.acquire());
        assert_eq!(pool.penalize(&lease, None), Duration::from_secs(60));
        assert_eq!(pool.penalize(&lease, None), Duration::from_secs(60));

        let stats = &pool.stats()[0];
        assert_eq!(stats.error_count, 2);
        assert!(!stats.currently_available);
        assert_eq!(stats.cooldown_remaining, Duration::from_secs(60));
    }

    #[test]
    fn oversized_hint_is_capped() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool(&["k0"], &clock).with_jitter_ratio(0.0);
        let lease = ready(pool.acquire());
        assert_eq!(pool.penalize(&lease, Some(Duration::MAX)), MAX_COOLDOWN);
        assert_eq!(pool.stats()[0].cooldown_remaining, MAX_COOLDOWN);
    }

    #[test]
    fn reuse_counts_usage_and_respects_cooldown() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool(&["k0", "k1"], &clock);
        let lease = ready(pool.acquire());
        assert!(pool.reuse(&lease));
        assert_eq!(pool.stats()[0].usage_count, 2);

        pool.penalize(&lease, None);
        assert!(!pool.reuse(&lease));
        assert_eq!(pool.stats()[0].usage_count, 2);
    }

    #[test]
    fn repeated_penalty_extends_window() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool(&["k0"], &clock).with_jitter_ratio(0.0);
        let lease = ready(pool.acquire());
        pool.penalize(&lease, Some(Duration::from_secs(10)));
        clock.advance(Duration::from_secs(5));
        pool.penalize(&lease, Some(Duration::from_secs(10)));
        clock.advance(Duration::from_secs(6));
        assert!(matches!(pool.acquire(), Acquisition::Wait(_)));
        clock.advance(Duration::from_secs(4));
        assert!(matches!(pool.acquire(), Acquisition::Ready(_)));
    }

    #[test]
    fn stats_mask_secrets() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool(&["sk-abcdefghijklmnop", "short"], &clock);
        let stats = pool.stats();
        assert_eq!(stats[0].masked_key, "sk-abcde...mnop");
        assert_eq!(stats[1].masked_key, "***");
        assert_eq!(stats[1].key_number, 2);
        assert!(!format!("{:?}", ready(pool.acquire())).contains("abcdefgh"));
    }

    #[test]
    fn malformed_replies_do_not_cool_down() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool(&["k0"], &clock);
        let lease = ready(pool.acquire());
        pool.record_malformed(&lease);
        let stats = &pool.stats()[0];
        assert_eq!(stats.malformed_count, 1);
        assert_eq!(stats.error_count, 0);
        assert!(stats.currently_available);
    }

    #[test]
    fn concurrent_acquire_is_balanced() {
        let clock = Arc::new(ManualClock::new());
        let pool = Arc::new(pool(&["k0", "k1", "k2", "k3"], &clock));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        ready(pool.acquire());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let usage: Vec<u64> = pool.stats().iter().map(|s| s.usage_count).collect();
        assert_eq!(usage, vec![100, 100, 100, 100]);
    }
}
