use serde::Serialize;
use time::OffsetDateTime;

use crate::profiles::Profile;

pub const MIN_PASSWORD_LEN: usize = 8;

/// Whole days elapsed since the password was last set.
pub fn days_since_change(profile: &Profile, now: OffsetDateTime) -> i64 {
    (now - profile.password_set_at()).whole_days()
}

/// The boundary day already counts as expired.
pub fn is_expired(days_since_change: i64, max_age_days: i64) -> bool {
    days_since_change >= max_age_days
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExpiryStatus {
    pub expired: bool,
    pub days_since_change: i64,
    pub max_age_days: i64,
    pub days_remaining: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub password_changed_at: OffsetDateTime,
}

pub fn expiry_status(profile: &Profile, max_age_days: i64, now: OffsetDateTime) -> ExpiryStatus {
    let days = days_since_change(profile, now);
    ExpiryStatus {
        expired: is_expired(days, max_age_days),
        days_since_change: days,
        max_age_days,
        days_remaining: (max_age_days - days).max(0),
        password_changed_at: profile.password_set_at(),
    }
}
