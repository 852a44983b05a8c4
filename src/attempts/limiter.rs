//! Rate limiting and account lockout derived from recorded history.
//!
//! Every check here is fail-open: when the backing store cannot answer, the
//! error is logged and the attempt is allowed, so an outage of the tracker
//! never locks everybody out.

use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};
use uuid::Uuid;

use super::LoginAttemptStore;
use crate::{
    audit::{AuditAction, AuditStore},
    config::SecurityConfig,
    profiles::ProfileStore,
};

/// Outcome of a windowed count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    pub blocked: bool,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub window_minutes: i64,
    /// Minutes until the oldest counted attempt leaves the window.
    pub retry_after_minutes: i64,
}

impl LimitDecision {
    fn allowed(max_attempts: i64, window: Duration) -> Self {
        Self {
            blocked: false,
            attempt_count: 0,
            max_attempts,
            window_minutes: window.whole_minutes(),
            retry_after_minutes: 0,
        }
    }
}

fn retry_after(oldest: Option<OffsetDateTime>, window: Duration, now: OffsetDateTime) -> i64 {
    let remaining = match oldest {
        Some(oldest) => oldest + window - now,
        None => window,
    };
    // round up to whole minutes, never below one
    let secs = remaining.whole_seconds().max(0);
    ((secs + 59) / 60).max(1)
}

/// Failed logins for `email` within the trailing window; the window edge is
/// inclusive.
pub async fn check_failed_login_attempts(
    store: &dyn LoginAttemptStore,
    email: &str,
    window: Duration,
    max_attempts: i64,
    now: OffsetDateTime,
) -> LimitDecision {
    match store.failed_since(email, now - window).await {
        Ok(stats) => {
            let blocked = stats.count >= max_attempts;
            if blocked {
                debug!(email, count = stats.count, "email blocked by failed attempts");
            }
            LimitDecision {
                blocked,
                attempt_count: stats.count,
                max_attempts,
                window_minutes: window.whole_minutes(),
                retry_after_minutes: if blocked {
                    retry_after(stats.oldest, window, now)
                } else {
                    0
                },
            }
        }
        Err(e) => {
            warn!(error = ?e, email, "failed-attempt lookup failed; allowing");
            LimitDecision::allowed(max_attempts, window)
        }
    }
}

/// Audit rows for `ip` + `action` within the trailing window. Requests with no
/// known address are never limited on this channel.
pub async fn check_rate_limit(
    store: &dyn AuditStore,
    ip: Option<&str>,
    action: AuditAction,
    window: Duration,
    max_attempts: i64,
    now: OffsetDateTime,
) -> LimitDecision {
    let Some(ip) = ip else {
        return LimitDecision::allowed(max_attempts, window);
    };

    match store.count_since(ip, action, now - window).await {
        Ok(count) => LimitDecision {
            blocked: count >= max_attempts,
            attempt_count: count,
            max_attempts,
            window_minutes: window.whole_minutes(),
            retry_after_minutes: if count >= max_attempts {
                window.whole_minutes()
            } else {
                0
            },
        },
        Err(e) => {
            warn!(error = ?e, ip, action = action.as_str(), "rate limit lookup failed; allowing");
            LimitDecision::allowed(max_attempts, window)
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    pub threshold: i32,
    pub duration: Duration,
}

impl From<&SecurityConfig> for LockoutPolicy {
    fn from(security: &SecurityConfig) -> Self {
        Self {
            threshold: security.lockout_threshold,
            duration: Duration::minutes(security.lockout_minutes),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockState {
    pub failed_attempts: i32,
    pub lock_until: Option<OffsetDateTime>,
}

/// Counter transition. A failure increments and locks once the threshold is
/// reached; a success clears both.
pub fn next_lock_state(
    current: LockState,
    increment: bool,
    policy: LockoutPolicy,
    now: OffsetDateTime,
) -> LockState {
    if !increment {
        return LockState {
            failed_attempts: 0,
            lock_until: None,
        };
    }
    let failed_attempts = current.failed_attempts.saturating_add(1);
    let lock_until = if failed_attempts >= policy.threshold {
        Some(now + policy.duration)
    } else {
        current.lock_until
    };
    LockState {
        failed_attempts,
        lock_until,
    }
}

/// Read-modify-write of the profile's failure counter. Concurrent failures
/// may under-count; that is tolerated.
pub async fn update_failed_attempts(
    profiles: &dyn ProfileStore,
    user_id: Uuid,
    increment: bool,
    policy: LockoutPolicy,
    now: OffsetDateTime,
) -> Option<LockState> {
    let current = match profiles.find_by_user_id(user_id).await {
        Ok(Some(p)) => LockState {
            failed_attempts: p.failed_attempts,
            lock_until: p.lock_until,
        },
        Ok(None) => {
            debug!(%user_id, "no profile to update failed attempts on");
            return None;
        }
        Err(e) => {
            warn!(error = ?e, %user_id, "failed to read failed attempts");
            return None;
        }
    };

    let next = next_lock_state(current, increment, policy, now);
    if let Err(e) = profiles
        .set_lock_state(user_id, next.failed_attempts, next.lock_until)
        .await
    {
        warn!(error = ?e, %user_id, "failed to update failed attempts");
        return None;
    }
    if next.lock_until != current.lock_until && next.lock_until.is_some() {
        warn!(%user_id, failed_attempts = next.failed_attempts, "account locked");
    }
    Some(next)
}
