use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ae_core::config::RateLimitingConfig;
use ae_core::types::UserId;
use dashmap::DashMap;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Why a user's request was refused admission.
///
/// Every variant carries enough timing information for the front-end to tell
/// the user when to come back. Denials are synchronous and never create a
/// task.
///
/// # Examples
///
/// ```rust
/// use ae_core::types::UserId;
/// use ae_harness::rate_limiter::{DenyReason, QuotaConfig, QuotaLimiter};
///
/// let limiter = QuotaLimiter::new(QuotaConfig::per_hour(1).with_max_concurrent(5));
/// let user = UserId::from("42");
///
/// limiter.try_admit(&user).unwrap();
/// match limiter.try_admit(&user) {
///     Err(DenyReason::QuotaExceeded { retry_after, .. }) => {
///         assert!(retry_after.as_secs() > 0);
///     }
///     other => panic!("unexpected: {other:?}"),
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DenyReason {
    /// The user already made `limit` requests inside the sliding window.
    ///
    /// `retry_after` is the time until the oldest request in the window ages
    /// out and frees a slot.
    #[error("request quota of {limit} per window reached, retry after {retry_after:?}")]
    QuotaExceeded {
        limit: u32,
        retry_after: Duration,
    },

    /// The user has as many active tasks as they are allowed.
    #[error("{active} task(s) already active, limit is {limit}")]
    ConcurrencyExceeded { active: u32, limit: u32 },

    /// The user is cooling down after repeated denials or an explicit penalty.
    #[error("cooling down, retry after {remaining:?}")]
    Cooldown { remaining: Duration },
}

impl DenyReason {
    /// Short label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            DenyReason::QuotaExceeded { .. } => "quota_exceeded",
            DenyReason::ConcurrencyExceeded { .. } => "concurrency_exceeded",
            DenyReason::Cooldown { .. } => "cooldown",
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Requests allowed inside one window.
    pub max_requests: u32,
    /// Length of the sliding window.
    pub window: Duration,
    /// Tasks one user may have queued, paused or running at once.
    pub max_concurrent: u32,
    /// How long a cooldown lasts once triggered.
    pub cooldown: Duration,
    /// Consecutive denials that trigger a cooldown. `0` disables the streak
    /// rule; explicit penalties still apply.
    pub cooldown_after_denials: u32,
}

impl QuotaConfig {
    /// Allow `count` requests per hour, with the stock concurrency and
    /// cooldown settings.
    pub fn per_hour(count: u32) -> Self {
        Self {
            max_requests: count,
            window: Duration::from_secs(3600),
            max_concurrent: 2,
            cooldown: Duration::from_secs(5 * 60),
            cooldown_after_denials: 3,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration, after_denials: u32) -> Self {
        self.cooldown = cooldown;
        self.cooldown_after_denials = after_denials;
        self
    }
}

impl From<&RateLimitingConfig> for QuotaConfig {
    fn from(cfg: &RateLimitingConfig) -> Self {
        Self {
            max_requests: cfg.max_requests_per_hour,
            window: cfg.window(),
            max_concurrent: cfg.max_concurrent_per_user,
            cooldown: cfg.cooldown(),
            cooldown_after_denials: cfg.cooldown_after_denials,
        }
    }
}

// ---------------------------------------------------------------------------
// UserQuota (per-user state)
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct UserQuota {
    /// Admission instants inside the current window, oldest first.
    requests: VecDeque<Instant>,
    active: u32,
    cooldown_until: Option<Instant>,
    denial_streak: u32,
}

impl UserQuota {
    /// Drop request timestamps that have aged out of the window.
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.requests.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| now < *until)
            .map(|until| until - now)
    }

    fn check(&self, config: &QuotaConfig, now: Instant) -> Result<(), DenyReason> {
        if let Some(remaining) = self.cooldown_remaining(now) {
            return Err(DenyReason::Cooldown { remaining });
        }
        if self.requests.len() as u64 >= u64::from(config.max_requests) {
            let retry_after = self
                .requests
                .front()
                .map(|oldest| (*oldest + config.window).saturating_duration_since(now))
                .unwrap_or(config.window);
            return Err(DenyReason::QuotaExceeded {
                limit: config.max_requests,
                retry_after,
            });
        }
        if self.active >= config.max_concurrent {
            return Err(DenyReason::ConcurrencyExceeded {
                active: self.active,
                limit: config.max_concurrent,
            });
        }
        Ok(())
    }
}

/// Read-only view of one user's quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaSnapshot {
    pub requests_in_window: u32,
    pub active: u32,
    pub cooldown_remaining: Option<Duration>,
}

// ---------------------------------------------------------------------------
// QuotaLimiter
// ---------------------------------------------------------------------------

/// Per-user admission control.
///
/// Each user's check-and-increment runs under that user's map entry lock, so
/// two concurrent submissions from one user can never both pass a check that
/// only one of them should.
#[derive(Debug)]
pub struct QuotaLimiter {
    config: QuotaConfig,
    users: DashMap<UserId, UserQuota>,
}

impl QuotaLimiter {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config,
            users: DashMap::new(),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Admit one request for `user`, or explain why not.
    ///
    /// On success the request is recorded in the window and the user's
    /// active count goes up by one; the caller must pair it with exactly one
    /// [`release`](Self::release).
    pub fn try_admit(&self, user: &UserId) -> Result<(), DenyReason> {
        self.try_admit_at(user, Instant::now())
    }

    pub fn try_admit_at(&self, user: &UserId, now: Instant) -> Result<(), DenyReason> {
        let mut quota = self.users.entry(user.clone()).or_default();
        quota.prune(now, self.config.window);

        match quota.check(&self.config, now) {
            Ok(()) => {
                quota.requests.push_back(now);
                quota.active += 1;
                quota.denial_streak = 0;
                debug!(
                    user = %user,
                    active = quota.active,
                    in_window = quota.requests.len(),
                    "request admitted"
                );
                Ok(())
            }
            Err(reason) => {
                // Denials during a cooldown do not extend it.
                if !matches!(reason, DenyReason::Cooldown { .. }) {
                    quota.denial_streak += 1;
                    let after = self.config.cooldown_after_denials;
                    if after > 0
                        && quota.denial_streak >= after
                        && !self.config.cooldown.is_zero()
                    {
                        quota.cooldown_until = Some(now + self.config.cooldown);
                        quota.denial_streak = 0;
                        info!(
                            user = %user,
                            cooldown = ?self.config.cooldown,
                            "cooldown started after repeated denials"
                        );
                    }
                }
                warn!(user = %user, reason = reason.label(), %reason, "request denied");
                Err(reason)
            }
        }
    }

    /// Give back one active slot for `user`.
    ///
    /// Never goes below zero; unknown users are ignored.
    pub fn release(&self, user: &UserId) {
        match self.users.get_mut(user) {
            Some(mut quota) if quota.active > 0 => {
                quota.active -= 1;
                debug!(user = %user, active = quota.active, "slot released");
            }
            Some(_) => debug!(user = %user, "release with no active slot ignored"),
            None => debug!(user = %user, "release for unknown user ignored"),
        }
    }

    /// Put `user` into cooldown for `duration`, extending any running one.
    pub fn penalize(&self, user: &UserId, duration: Duration) {
        self.penalize_at(user, duration, Instant::now());
    }

    pub fn penalize_at(&self, user: &UserId, duration: Duration, now: Instant) {
        let mut quota = self.users.entry(user.clone()).or_default();
        let until = now + duration;
        quota.cooldown_until = Some(match quota.cooldown_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        info!(user = %user, ?duration, "user penalized");
    }

    pub fn quota(&self, user: &UserId) -> QuotaSnapshot {
        self.quota_at(user, Instant::now())
    }

    pub fn quota_at(&self, user: &UserId, now: Instant) -> QuotaSnapshot {
        match self.users.get(user) {
            Some(quota) => {
                let in_window = quota
                    .requests
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < self.config.window)
                    .count();
                QuotaSnapshot {
                    requests_in_window: u32::try_from(in_window).unwrap_or(u32::MAX),
                    active: quota.active,
                    cooldown_remaining: quota.cooldown_remaining(now),
                }
            }
            None => QuotaSnapshot::default(),
        }
    }

    /// Forget users with nothing left to track. Returns how many were dropped.
    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Instant::now())
    }

    pub fn prune_idle_at(&self, now: Instant) -> usize {
        let before = self.users.len();
        let window = self.config.window;
        self.users.retain(|_, quota| {
            quota.prune(now, window);
            quota.active > 0
                || !quota.requests.is_empty()
                || quota.cooldown_remaining(now).is_some()
        });
        let dropped = before.saturating_sub(self.users.len());
        if dropped > 0 {
            debug!(dropped, "pruned idle quota entries");
        }
        dropped
    }

    /// Number of users currently tracked.
    pub fn tracked_users(&self) -> usize {
        self.users.len()
    }
}

impl Default for QuotaLimiter {
    fn default() -> Self {
        Self::new(QuotaConfig::per_hour(20))
    }
}
