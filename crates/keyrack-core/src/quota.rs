use crate::credential::Credential;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Length of a quota window. Counters reset once strictly more than this
/// has elapsed since the last reset.
pub const QUOTA_WINDOW: Duration = Duration::hours(24);

/// Check whether `cred` may be used at `now`.
///
/// Unlimited credentials are always available. Otherwise the window is
/// rolled first: if `last_reset` is absent, or strictly more than
/// [`QUOTA_WINDOW`] has elapsed, the counter goes back to zero and
/// `last_reset` becomes `now`. Exactly 24:00:00 elapsed does not reset.
pub fn check_quota(cred: &mut Credential, now: DateTime<Utc>) -> bool {
    let Some(limit) = cred.quota_limit else {
        return true;
    };

    if window_expired(cred.last_reset, now) {
        cred.usage_count = 0;
        cred.last_reset = Some(now);
    }

    cred.usage_count < limit
}

fn window_expired(last_reset: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_reset {
        None => true,
        Some(at) => now - at > QUOTA_WINDOW,
    }
}

/// Read-only view of a credential's quota position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub used: u32,
    pub limit: Option<u32>,
    /// `None` when unlimited.
    pub remaining: Option<u32>,
    /// When the current window becomes eligible for reset, if one is open.
    pub resets_after: Option<DateTime<Utc>>,
}

impl QuotaStatus {
    /// Compute status without rolling the window. A window that has already
    /// expired reports as fully available, matching what the next check
    /// would observe.
    pub fn of(cred: &Credential, now: DateTime<Utc>) -> Self {
        let Some(limit) = cred.quota_limit else {
            return Self {
                used: cred.usage_count,
                limit: None,
                remaining: None,
                resets_after: None,
            };
        };

        if window_expired(cred.last_reset, now) {
            return Self {
                used: 0,
                limit: Some(limit),
                remaining: Some(limit),
                resets_after: None,
            };
        }

        Self {
            used: cred.usage_count,
            limit: Some(limit),
            remaining: Some(limit.saturating_sub(cred.usage_count)),
            resets_after: cred.last_reset.map(|at| at + QUOTA_WINDOW),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }
}
