use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use zeroize::Zeroizing;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A named secret bound to one logical service, with priority and quota
/// metadata. Mutated in place by quota tracking and liveness probing.
pub struct Credential {
    pub(crate) name: String,
    pub(crate) secret: Zeroizing<String>,
    pub(crate) service: String,
    /// Source category the credential was loaded from, e.g. "google".
    pub(crate) group: String,
    /// Lower value = tried first.
    pub(crate) priority: i32,
    /// `None` means unlimited.
    pub(crate) quota_limit: Option<u32>,
    pub(crate) usage_count: u32,
    pub(crate) last_reset: Option<DateTime<Utc>>,
    pub(crate) is_working: bool,
    pub(crate) last_tested: Option<DateTime<Utc>>,
}

impl Credential {
    /// Build a credential with priority 1, no quota, in the "default" group.
    pub fn new(name: &str, service: &str, secret: &str) -> Result<Self> {
        validate_name(name)?;
        validate_service(name, service)?;
        if secret.trim().is_empty() {
            return Err(Error::EmptySecret {
                name: name.to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            secret: Zeroizing::new(secret.trim().to_string()),
            service: service.to_string(),
            group: "default".to_string(),
            priority: 1,
            quota_limit: None,
            usage_count: 0,
            last_reset: None,
            is_working: true,
            last_tested: None,
        })
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_quota(mut self, quota_limit: Option<u32>) -> Self {
        self.quota_limit = quota_limit;
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = group.to_string();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn quota_limit(&self) -> Option<u32> {
        self.quota_limit
    }

    pub fn usage_count(&self) -> u32 {
        self.usage_count
    }

    pub fn is_working(&self) -> bool {
        self.is_working
    }

    pub fn last_tested(&self) -> Option<DateTime<Utc>> {
        self.last_tested
    }

    pub fn last_reset(&self) -> Option<DateTime<Utc>> {
        self.last_reset
    }

    pub(crate) fn secret(&self) -> &Zeroizing<String> {
        &self.secret
    }

    /// Record one accounted use.
    pub(crate) fn record_use(&mut self) {
        self.usage_count = self.usage_count.saturating_add(1);
    }

    pub(crate) fn record_probe(&mut self, working: bool, at: DateTime<Utc>) {
        self.is_working = working;
        self.last_tested = Some(at);
    }

    /// Secret-free snapshot for reporting.
    pub fn view(&self) -> CredentialView {
        CredentialView {
            name: self.name.clone(),
            service: self.service.clone(),
            group: self.group.clone(),
            priority: self.priority,
            quota_limit: self.quota_limit,
            usage_count: self.usage_count,
            last_reset: self.last_reset,
            is_working: self.is_working,
            last_tested: self.last_tested,
            masked_secret: mask_value(&self.secret),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("secret", &mask_value(&self.secret))
            .field("service", &self.service)
            .field("group", &self.group)
            .field("priority", &self.priority)
            .field("quota_limit", &self.quota_limit)
            .field("usage_count", &self.usage_count)
            .field("last_reset", &self.last_reset)
            .field("is_working", &self.is_working)
            .field("last_tested", &self.last_tested)
            .finish()
    }
}

/// Public credential snapshot returned by listings. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialView {
    pub name: String,
    pub service: String,
    pub group: String,
    pub priority: i32,
    pub quota_limit: Option<u32>,
    pub usage_count: u32,
    pub last_reset: Option<DateTime<Utc>>,
    pub is_working: bool,
    pub last_tested: Option<DateTime<Utc>>,
    /// Masked value, e.g. "sk-p...wxyz"
    pub masked_secret: String,
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Names are free-form labels ("Primary Vertex AI (prod)") but must be
/// non-empty and printable.
fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidCredential {
            name: name.to_string(),
            reason: "Name must not be empty".to_string(),
        });
    }
    if name.chars().any(char::is_control) {
        return Err(Error::InvalidCredential {
            name: name.escape_default().to_string(),
            reason: "Name must not contain control characters".to_string(),
        });
    }
    Ok(())
}

/// Service tags: [a-z0-9][a-z0-9_-]*
fn validate_service(name: &str, service: &str) -> Result<()> {
    let valid = service
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && service
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');

    if !valid {
        return Err(Error::InvalidCredential {
            name: name.to_string(),
            reason: format!("Service '{}' must match [a-z0-9][a-z0-9_-]*", service),
        });
    }
    Ok(())
}

/// Mask a secret for display: "sk-proj-abc...xyz" → "sk-p...wxyz"
/// Uses char-based slicing to avoid panics on non-ASCII input.
/// At most a quarter of the characters are shown on each side, capped at 4.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let len = chars.len();
    if len <= 8 {
        return "*".repeat(len);
    }
    let shown = (len / 4).min(4);
    let prefix: String = chars[..shown].iter().collect();
    let suffix: String = chars[len - shown..].iter().collect();
    format!("{}...{}", prefix, suffix)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
