//! Windowed per-user quotas.
//!
//! A [`QuotaLedger`] answers "may `subject` perform one more `class` action
//! now?" and records the action when the answer is yes. Two independent
//! instances run in the server:
//!
//! - the action ledger (`wishlist_create`, `purchase_claim`), consulted by
//!   the wishlist service before the action is performed
//! - the request ledger (`requests_{role}`), consulted by HTTP middleware
//!   for every API request
//!
//! They use disjoint key namespaces, so neither can exhaust the other.
//!
//! # Atomicity
//!
//! Check-then-increment is serialized per `(subject, class)`:
//!
//! 1. callers in this process queue on a per-key async mutex (held in a
//!    `moka` cache so idle keys are dropped), and
//! 2. the counter document is written with compare-and-set against the
//!    version read under that mutex, so processes sharing a store cannot
//!    double-spend either. A lost CAS is re-read and retried; unlike claims,
//!    retrying a quota update cannot change its meaning.
//!
//! There is no global lock.
//!
//! # Window strategies
//!
//! - [`WindowStrategy::Fixed`] - epoch-aligned windows,
//!   `start = floor(now / len) * len`. Up to twice the limit can pass
//!   around a window boundary (end of one window plus start of the next).
//! - [`WindowStrategy::Sliding`] - a log of accepted timestamps inside
//!   `(now - len, now]`; no boundary burst.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use wishlist_core::Role;

use crate::db::{Documents, Precondition, StoreError, keys};

/// Upper bound on CAS attempts for one check before giving up.
const MAX_ATTEMPTS: usize = 8;

/// How long an unused per-key mutex is kept around.
const LOCK_IDLE: Duration = Duration::from_secs(600);

/// What is being counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaClass {
    WishlistCreate,
    PurchaseClaim,
    /// API requests by callers holding the given role.
    Requests(Role),
}

impl QuotaClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WishlistCreate => "wishlist_create",
            Self::PurchaseClaim => "purchase_claim",
            Self::Requests(Role::Anonymous) => "requests_anonymous",
            Self::Requests(Role::User) => "requests_user",
            Self::Requests(Role::StoreOwner) => "requests_store_owner",
            Self::Requests(Role::Admin) => "requests_admin",
        }
    }
}

impl fmt::Display for QuotaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum number of actions per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub max: u32,
    pub window: TimeDelta,
}

impl Limit {
    #[must_use]
    pub const fn new(max: u32, window: TimeDelta) -> Self {
        Self { max, window }
    }

    /// `max` actions per `secs` seconds.
    #[must_use]
    pub fn per_seconds(max: u32, secs: u64) -> Self {
        Self {
            max,
            window: window_secs(secs),
        }
    }
}

/// Longest accepted window: one leap year.
pub const MAX_WINDOW_SECS: u64 = 366 * 86_400;

/// A window of `secs` seconds, clamped to `1..=MAX_WINDOW_SECS`.
#[must_use]
pub fn window_secs(secs: u64) -> TimeDelta {
    i64::try_from(secs.clamp(1, MAX_WINDOW_SECS))
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}

fn later(t: DateTime<Utc>, by: TimeDelta) -> DateTime<Utc> {
    t.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn earlier(t: DateTime<Utc>, by: TimeDelta) -> DateTime<Utc> {
    t.checked_sub_signed(by).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// How windows are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowStrategy {
    #[default]
    Fixed,
    Sliding,
}

impl std::str::FromStr for WindowStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "sliding" => Ok(Self::Sliding),
            _ => Err(format!("invalid window strategy: {s}")),
        }
    }
}

/// Allowance after a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Outcome of [`QuotaLedger::check_and_increment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// The action was counted.
    Accepted(QuotaStatus),
    /// The limit is reached; nothing was counted. `remaining` is 0.
    Rejected(QuotaStatus),
}

impl QuotaDecision {
    #[must_use]
    pub const fn status(&self) -> QuotaStatus {
        match self {
            Self::Accepted(s) | Self::Rejected(s) => *s,
        }
    }

    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Errors from the quota ledger.
#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota store error: {0}")]
    Store(#[from] StoreError),

    /// Every CAS attempt lost to another writer.
    #[error("quota counter for {0} is contended")]
    Contended(QuotaClass),

    #[error("no limit configured for {0} in ledger {1}")]
    NotConfigured(QuotaClass, &'static str),
}

/// Persisted counter state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
enum CounterState {
    Fixed {
        window_start: DateTime<Utc>,
        count: u32,
    },
    Sliding {
        hits: Vec<DateTime<Utc>>,
    },
}

/// A named set of windowed limits over a shared store.
#[derive(Clone)]
pub struct QuotaLedger {
    name: &'static str,
    docs: Documents,
    strategy: WindowStrategy,
    limits: Arc<HashMap<QuotaClass, Limit>>,
    locks: Cache<String, Arc<Mutex<()>>>,
}

impl QuotaLedger {
    /// Create a ledger. `name` namespaces its counters in the store.
    #[must_use]
    pub fn new(
        name: &'static str,
        docs: Documents,
        strategy: WindowStrategy,
        limits: impl IntoIterator<Item = (QuotaClass, Limit)>,
    ) -> Self {
        Self {
            name,
            docs,
            strategy,
            limits: Arc::new(limits.into_iter().collect()),
            locks: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(LOCK_IDLE)
                .build(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// The configured limit for `class`, if any.
    #[must_use]
    pub fn limit(&self, class: QuotaClass) -> Option<Limit> {
        self.limits.get(&class).copied()
    }

    /// Count one `class` action by `subject` at `now`, unless the limit is
    /// already reached.
    ///
    /// # Errors
    ///
    /// Returns `QuotaError::Store` on backend failure, `Contended` if every
    /// CAS attempt lost, or `NotConfigured` for an unknown class.
    #[tracing::instrument(skip(self), fields(ledger = self.name))]
    pub async fn check_and_increment(
        &self,
        subject: &str,
        class: QuotaClass,
        now: DateTime<Utc>,
    ) -> Result<QuotaDecision, QuotaError> {
        let limit = self
            .limit(class)
            .ok_or(QuotaError::NotConfigured(class, self.name))?;
        let key = keys::quota(self.name, class.as_str(), subject);

        let lock = self
            .locks
            .get_with(key.clone(), async { Arc::new(Mutex::new(())) })
            .await;
        let _guard = lock.lock().await;

        for _ in 0..MAX_ATTEMPTS {
            let current = self.docs.load::<CounterState>(&key).await?;
            let (decision, next) = advance(
                self.strategy,
                limit,
                current.as_ref().map(|c| &c.value),
                now,
            );

            let Some(next) = next else {
                tracing::info!(class = %class, "Quota exhausted");
                return Ok(decision);
            };

            match self
                .docs
                .save(&key, Precondition::observed(current.as_ref()), &next)
                .await
            {
                Ok(_) => {
                    tracing::debug!(
                        class = %class,
                        remaining = decision.status().remaining,
                        "Quota accepted"
                    );
                    return Ok(decision);
                }
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!(class = %class, "Quota counter moved underneath us, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::warn!(class = %class, "Quota counter contended");
        Err(QuotaError::Contended(class))
    }

    /// Report the allowance `subject` would have for `class` at `now`,
    /// without counting anything.
    ///
    /// # Errors
    ///
    /// See [`Self::check_and_increment`].
    pub async fn peek(
        &self,
        subject: &str,
        class: QuotaClass,
        now: DateTime<Utc>,
    ) -> Result<QuotaStatus, QuotaError> {
        let limit = self
            .limit(class)
            .ok_or(QuotaError::NotConfigured(class, self.name))?;
        let key = keys::quota(self.name, class.as_str(), subject);
        let current = self.docs.load::<CounterState>(&key).await?;
        let (decision, _) = advance(
            self.strategy,
            limit,
            current.as_ref().map(|c| &c.value),
            now,
        );
        let mut status = decision.status();
        if decision.is_accepted() {
            // `advance` already spent one unit for the hypothetical action.
            status.remaining = status.remaining.saturating_add(1).min(limit.max);
        }
        Ok(status)
    }
}

/// Apply one action to `state`. Returns the decision and, if accepted, the
/// state to persist.
fn advance(
    strategy: WindowStrategy,
    limit: Limit,
    state: Option<&CounterState>,
    now: DateTime<Utc>,
) -> (QuotaDecision, Option<CounterState>) {
    match strategy {
        WindowStrategy::Fixed => advance_fixed(limit, state, now),
        WindowStrategy::Sliding => advance_sliding(limit, state, now),
    }
}

fn advance_fixed(
    limit: Limit,
    state: Option<&CounterState>,
    now: DateTime<Utc>,
) -> (QuotaDecision, Option<CounterState>) {
    let window_start = fixed_window_start(now, limit.window);
    let reset_at = later(window_start, limit.window);

    let count = match state {
        Some(CounterState::Fixed {
            window_start: start,
            count,
        }) if *start == window_start => *count,
        _ => 0,
    };

    if count >= limit.max {
        let status = QuotaStatus {
            limit: limit.max,
            remaining: 0,
            reset_at,
        };
        return (QuotaDecision::Rejected(status), None);
    }

    let count = count + 1;
    let status = QuotaStatus {
        limit: limit.max,
        remaining: limit.max - count,
        reset_at,
    };
    (
        QuotaDecision::Accepted(status),
        Some(CounterState::Fixed {
            window_start,
            count,
        }),
    )
}

fn advance_sliding(
    limit: Limit,
    state: Option<&CounterState>,
    now: DateTime<Utc>,
) -> (QuotaDecision, Option<CounterState>) {
    let horizon = earlier(now, limit.window);
    let mut hits: Vec<DateTime<Utc>> = match state {
        Some(CounterState::Sliding { hits }) => {
            hits.iter().copied().filter(|h| *h > horizon).collect()
        }
        _ => Vec::new(),
    };
    hits.sort_unstable();

    let used = u32::try_from(hits.len()).unwrap_or(u32::MAX);
    if used >= limit.max {
        let oldest = hits.first().copied().unwrap_or(now);
        let status = QuotaStatus {
            limit: limit.max,
            remaining: 0,
            reset_at: later(oldest, limit.window),
        };
        return (QuotaDecision::Rejected(status), None);
    }

    hits.push(now);
    let oldest = hits.first().copied().unwrap_or(now);
    let status = QuotaStatus {
        limit: limit.max,
        remaining: limit.max - (used + 1),
        reset_at: later(oldest, limit.window),
    };
    (
        QuotaDecision::Accepted(status),
        Some(CounterState::Sliding { hits }),
    )
}

/// `floor(now / window) * window`, aligned to the Unix epoch.
fn fixed_window_start(now: DateTime<Utc>, window: TimeDelta) -> DateTime<Utc> {
    let len = window.num_milliseconds().max(1);
    let start = now.timestamp_millis().div_euclid(len) * len;
    DateTime::from_timestamp_millis(start).unwrap_or(now)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::db::MemoryStore;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn ledger(strategy: WindowStrategy, max: u32, window_secs: u64) -> QuotaLedger {
        QuotaLedger::new(
            "action",
            Documents::new(Arc::new(MemoryStore::new())),
            strategy,
            [(QuotaClass::PurchaseClaim, Limit::per_seconds(max, window_secs))],
        )
    }

    /// Start of an hour-aligned window.
    const T0: i64 = 1_700_002_800;

    #[test]
    fn test_fixed_window_start_is_epoch_aligned() {
        let hour = TimeDelta::try_hours(1).unwrap();
        assert_eq!(fixed_window_start(at(T0 + 1799), hour), at(T0));
        assert_eq!(fixed_window_start(at(T0 + 3600), hour), at(T0 + 3600));
    }

    #[test]
    fn test_window_secs_is_clamped() {
        assert_eq!(window_secs(0), TimeDelta::try_seconds(1).unwrap());
        assert_eq!(
            window_secs(u64::MAX),
            TimeDelta::try_seconds(i64::try_from(MAX_WINDOW_SECS).unwrap()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_huge_windows_saturate_instead_of_overflowing() {
        for strategy in [WindowStrategy::Fixed, WindowStrategy::Sliding] {
            let ledger = QuotaLedger::new(
                "action",
                Documents::new(Arc::new(MemoryStore::new())),
                strategy,
                [(QuotaClass::PurchaseClaim, Limit::new(1, TimeDelta::MAX))],
            );
            let first = ledger
                .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0))
                .await
                .unwrap();
            assert!(first.is_accepted());
            assert_eq!(first.status().reset_at, DateTime::<Utc>::MAX_UTC);

            let second = ledger
                .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0 + 1))
                .await
                .unwrap();
            assert!(!second.is_accepted());
        }
    }

    #[tokio::test]
    async fn test_limit_then_reject_then_reset() {
        let ledger = ledger(WindowStrategy::Fixed, 20, 3600);
        for i in 0..20u32 {
            let decision = ledger
                .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0 + i64::from(i)))
                .await
                .unwrap();
            assert!(decision.is_accepted(), "action {i} should be accepted");
            assert_eq!(decision.status().remaining, 19 - i);
        }

        let rejected = ledger
            .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0 + 100))
            .await
            .unwrap();
        assert_eq!(
            rejected,
            QuotaDecision::Rejected(QuotaStatus {
                limit: 20,
                remaining: 0,
                reset_at: at(T0 + 3600),
            })
        );

        let next_window = ledger
            .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0 + 3600))
            .await
            .unwrap();
        assert!(next_window.is_accepted());
        assert_eq!(next_window.status().remaining, 19);
    }

    #[tokio::test]
    async fn test_rejection_does_not_increment() {
        let ledger = ledger(WindowStrategy::Fixed, 1, 3600);
        assert!(ledger
            .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0))
            .await
            .unwrap()
            .is_accepted());
        for _ in 0..5 {
            assert!(!ledger
                .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0 + 1))
                .await
                .unwrap()
                .is_accepted());
        }
        let status = ledger
            .peek("bob", QuotaClass::PurchaseClaim, at(T0 + 2))
            .await
            .unwrap();
        assert_eq!(status.remaining, 0);
    }

    #[tokio::test]
    async fn test_fixed_window_boundary_burst_is_at_most_double() {
        let ledger = ledger(WindowStrategy::Fixed, 10, 3600);
        let mut accepted = 0;
        for t in [T0 + 3590, T0 + 3600] {
            for _ in 0..15 {
                if ledger
                    .check_and_increment("bob", QuotaClass::PurchaseClaim, at(t))
                    .await
                    .unwrap()
                    .is_accepted()
                {
                    accepted += 1;
                }
            }
        }
        assert_eq!(accepted, 20);
    }

    #[tokio::test]
    async fn test_sliding_window_has_no_boundary_burst() {
        let ledger = ledger(WindowStrategy::Sliding, 10, 3600);
        let mut accepted = 0;
        for t in [T0 + 3590, T0 + 3600] {
            for _ in 0..15 {
                if ledger
                    .check_and_increment("bob", QuotaClass::PurchaseClaim, at(t))
                    .await
                    .unwrap()
                    .is_accepted()
                {
                    accepted += 1;
                }
            }
        }
        assert_eq!(accepted, 10);

        let after = ledger
            .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0 + 3590 + 3600))
            .await
            .unwrap();
        assert!(after.is_accepted());
    }

    #[tokio::test]
    async fn test_sliding_reset_at_tracks_oldest_hit() {
        let ledger = ledger(WindowStrategy::Sliding, 2, 60);
        ledger
            .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0))
            .await
            .unwrap();
        ledger
            .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0 + 30))
            .await
            .unwrap();
        let rejected = ledger
            .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0 + 40))
            .await
            .unwrap();
        assert_eq!(rejected.status().reset_at, at(T0 + 60));
        assert!(!rejected.is_accepted());
    }

    #[tokio::test]
    async fn test_subjects_are_independent() {
        let ledger = ledger(WindowStrategy::Fixed, 1, 3600);
        for subject in ["alice", "bob", "carol"] {
            assert!(ledger
                .check_and_increment(subject, QuotaClass::PurchaseClaim, at(T0))
                .await
                .unwrap()
                .is_accepted());
        }
    }

    #[tokio::test]
    async fn test_ledgers_use_disjoint_namespaces() {
        let docs = Documents::new(Arc::new(MemoryStore::new()));
        let limits = [(QuotaClass::PurchaseClaim, Limit::per_seconds(1, 3600))];
        let first = QuotaLedger::new("action", docs.clone(), WindowStrategy::Fixed, limits);
        let second = QuotaLedger::new("request", docs, WindowStrategy::Fixed, limits);

        assert!(first
            .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0))
            .await
            .unwrap()
            .is_accepted());
        assert!(second
            .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0))
            .await
            .unwrap()
            .is_accepted());
    }

    #[tokio::test]
    async fn test_unknown_class_is_an_error() {
        let ledger = ledger(WindowStrategy::Fixed, 1, 60);
        let err = ledger
            .check_and_increment("bob", QuotaClass::WishlistCreate, at(T0))
            .await
            .unwrap_err();
        assert!(matches!(err, QuotaError::NotConfigured(QuotaClass::WishlistCreate, "action")));
    }

    #[tokio::test]
    async fn test_peek_does_not_spend() {
        let ledger = ledger(WindowStrategy::Fixed, 3, 3600);
        for _ in 0..3 {
            let status = ledger
                .peek("bob", QuotaClass::PurchaseClaim, at(T0))
                .await
                .unwrap();
            assert_eq!(status.remaining, 3);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_exceed_limit() {
        let ledger = ledger(WindowStrategy::Fixed, 20, 3600);
        let mut tasks = Vec::new();
        for _ in 0..64 {
            let ledger = ledger.clone();
            tasks.push(tokio::spawn(async move {
                ledger
                    .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0))
                    .await
                    .unwrap()
                    .is_accepted()
            }));
        }
        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_separate_ledgers_on_one_store_cannot_double_spend() {
        // Two ledgers with the same name model two processes sharing a store:
        // their in-process locks are independent, so only CAS protects them.
        let docs = Documents::new(Arc::new(MemoryStore::new()));
        let limits = [(QuotaClass::PurchaseClaim, Limit::per_seconds(10, 3600))];
        let a = QuotaLedger::new("action", docs.clone(), WindowStrategy::Fixed, limits);
        let b = QuotaLedger::new("action", docs, WindowStrategy::Fixed, limits);

        let mut tasks = Vec::new();
        for i in 0..30 {
            let ledger = if i % 2 == 0 { a.clone() } else { b.clone() };
            tasks.push(tokio::spawn(async move {
                ledger
                    .check_and_increment("bob", QuotaClass::PurchaseClaim, at(T0))
                    .await
            }));
        }
        let mut accepted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(decision) if decision.is_accepted() => accepted += 1,
                Ok(_) | Err(QuotaError::Contended(_)) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(accepted <= 10, "accepted {accepted} > limit");
    }
}
