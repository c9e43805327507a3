//! Fixed-window admission control keyed by caller.
//!
//! One counter per key. The first request of a window allocates it with
//! `count = 1`; later requests increment until the ceiling, after which the key
//! is denied until `reset_at`. Bursts straddling a window boundary are
//! accepted in exchange for O(1) state per key and no per-key timers.
//!
//! State lives in memory only, so a restart resets every window.

use crate::error::JobError;
use crate::model::Caller;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default interval between sweeps of expired windows.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Result of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: Instant,
}

impl Admission {
    /// Time until the window resets, zero if it already has.
    pub fn retry_after(&self, now: Instant) -> Duration {
        self.reset_at.saturating_duration_since(now)
    }
}

/// Ceiling and window for one class of caller key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    pub ceiling: u32,
    pub window_secs: u64,
}

impl AdmissionPolicy {
    pub fn new(ceiling: u32, window: Duration) -> Self {
        Self {
            ceiling,
            window_secs: window.as_secs(),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Policies applied to each identifier a caller presents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionPolicies {
    pub user: AdmissionPolicy,
    pub ip: AdmissionPolicy,
    pub installation: AdmissionPolicy,
}

impl Default for AdmissionPolicies {
    fn default() -> Self {
        Self {
            user: AdmissionPolicy::new(10, Duration::from_secs(60 * 60)),
            ip: AdmissionPolicy::new(30, Duration::from_secs(60 * 60)),
            installation: AdmissionPolicy::new(100, Duration::from_secs(60 * 60)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindowEntry {
    count: u32,
    reset_at: Instant,
}

/// In-memory window table. Owned explicitly and shared through `Arc`.
#[derive(Debug, Default)]
pub struct AdmissionGate {
    windows: Mutex<HashMap<String, RateWindowEntry>>,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit one request for `key` using the current time.
    pub fn admit(&self, key: &str, ceiling: u32, window: Duration) -> Admission {
        self.admit_at(key, ceiling, window, Instant::now())
    }

    /// Admit one request for `key` as of `now`.
    pub fn admit_at(&self, key: &str, ceiling: u32, window: Duration, now: Instant) -> Admission {
        let mut windows = self.lock();

        if ceiling == 0 {
            return Admission {
                allowed: false,
                remaining: 0,
                reset_at: now + window,
            };
        }

        match windows.get_mut(key) {
            Some(entry) if now < entry.reset_at => {
                if entry.count < ceiling {
                    entry.count += 1;
                    Admission {
                        allowed: true,
                        remaining: ceiling - entry.count,
                        reset_at: entry.reset_at,
                    }
                } else {
                    Admission {
                        allowed: false,
                        remaining: 0,
                        reset_at: entry.reset_at,
                    }
                }
            }
            _ => {
                let entry = RateWindowEntry {
                    count: 1,
                    reset_at: now + window,
                };
                windows.insert(key.to_string(), entry);
                Admission {
                    allowed: true,
                    remaining: ceiling - 1,
                    reset_at: entry.reset_at,
                }
            }
        }
    }

    /// Admit every identifier the caller presents, user first.
    ///
    /// Stops at the first key over its ceiling. Keys checked before the
    /// denial keep their increment.
    pub fn check(&self, caller: &Caller, policies: &AdmissionPolicies) -> Result<(), JobError> {
        let mut keys = vec![(format!("user:{}", caller.user_id), policies.user)];
        if let Some(ip) = &caller.ip {
            keys.push((format!("ip:{}", ip), policies.ip));
        }
        if let Some(installation) = &caller.installation_id {
            keys.push((format!("installation:{}", installation), policies.installation));
        }

        let now = Instant::now();
        for (key, policy) in keys {
            let decision = self.admit_at(&key, policy.ceiling, policy.window(), now);
            if !decision.allowed {
                tracing::info!(%key, ceiling = policy.ceiling, "admission denied");
                return Err(JobError::AdmissionDenied {
                    retry_after: decision.retry_after(now),
                    key,
                });
            }
            tracing::debug!(%key, remaining = decision.remaining, "admitted");
        }
        Ok(())
    }

    /// Drop windows that have expired as of `now`. Returns how many were removed.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, entry| now < entry.reset_at);
        before - windows.len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Number of tracked keys, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A poisoned map only means another caller panicked mid-admit; the
    // counters themselves are still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, RateWindowEntry>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Periodically sweep expired windows until the returned handle is aborted.
pub fn spawn_sweeper(gate: Arc<AdmissionGate>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = gate.sweep();
            if removed > 0 {
                tracing::debug!(removed, remaining = gate.len(), "swept admission windows");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_first_request_opens_window() {
        let gate = AdmissionGate::new();
        let now = Instant::now();

        let decision = gate.admit_at("user:1", 3, WINDOW, now);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset_at, now + WINDOW);
    }

    #[test]
    fn test_ceiling_then_deny() {
        let gate = AdmissionGate::new();
        let now = Instant::now();

        for expected_remaining in [2, 1, 0] {
            let decision = gate.admit_at("user:1", 3, WINDOW, now);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }

        let denied = gate.admit_at("user:1", 3, WINDOW, now + Duration::from_secs(10));
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after(now + Duration::from_secs(10)), Duration::from_secs(50));
    }

    #[test]
    fn test_keys_are_independent() {
        let gate = AdmissionGate::new();
        let now = Instant::now();

        assert!(gate.admit_at("a", 1, WINDOW, now).allowed);
        assert!(!gate.admit_at("a", 1, WINDOW, now).allowed);
        assert!(gate.admit_at("b", 1, WINDOW, now).allowed);
    }

    #[test]
    fn test_zero_ceiling_denies() {
        let gate = AdmissionGate::new();
        let decision = gate.admit_at("k", 0, WINDOW, Instant::now());
        assert!(!decision.allowed);
        assert!(gate.is_empty());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let gate = AdmissionGate::new();
        let now = Instant::now();

        gate.admit_at("short", 5, Duration::from_secs(1), now);
        gate.admit_at("long", 5, Duration::from_secs(600), now);

        assert_eq!(gate.sweep_at(now + Duration::from_secs(2)), 1);
        assert_eq!(gate.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_advance() {
        let gate = AdmissionGate::new();

        assert!(gate.admit("user:7", 2, WINDOW).allowed);
        assert!(gate.admit("user:7", 2, WINDOW).allowed);
        assert!(!gate.admit("user:7", 2, WINDOW).allowed);

        tokio::time::advance(WINDOW).await;

        let fresh = gate.admit("user:7", 2, WINDOW);
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task() {
        let gate = Arc::new(AdmissionGate::new());
        gate.admit("one-off-ip", 5, Duration::from_secs(30));

        let handle = spawn_sweeper(gate.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert!(gate.is_empty());
        handle.abort();
    }

    #[test]
    fn test_check_reports_denied_key() {
        let gate = AdmissionGate::new();
        let policies = AdmissionPolicies {
            user: AdmissionPolicy::new(5, WINDOW),
            ip: AdmissionPolicy::new(1, WINDOW),
            installation: AdmissionPolicy::new(5, WINDOW),
        };
        let mut caller = Caller::user("42");
        caller.ip = Some("10.0.0.1".into());

        assert!(gate.check(&caller, &policies).is_ok());
        match gate.check(&caller, &policies) {
            Err(JobError::AdmissionDenied { key, .. }) => assert_eq!(key, "ip:10.0.0.1"),
            other => panic!("expected AdmissionDenied, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_admits_never_exceed_ceiling() {
        let gate = Arc::new(AdmissionGate::new());
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|_| gate.admit_at("shared", 100, WINDOW, now).allowed)
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 100);
    }

    proptest! {
        #[test]
        fn prop_exactly_ceiling_admitted_per_window(ceiling in 1u32..50, window_ms in 1u64..10_000) {
            let gate = AdmissionGate::new();
            let window = Duration::from_millis(window_ms);
            let start = Instant::now();

            for _ in 0..ceiling {
                prop_assert!(gate.admit_at("k", ceiling, window, start).allowed);
            }
            let over = gate.admit_at("k", ceiling, window, start);
            prop_assert!(!over.allowed);
            prop_assert_eq!(over.remaining, 0);

            let later = gate.admit_at("k", ceiling, window, start + window);
            prop_assert!(later.allowed);
            prop_assert_eq!(later.remaining, ceiling - 1);
        }
    }
}
