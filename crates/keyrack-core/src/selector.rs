use crate::credential::{Credential, mask_value};
use crate::quota::check_quota;
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use zeroize::Zeroizing;

/// A credential picked for one call.
pub struct Selection {
    pub name: String,
    pub service: String,
    pub priority: i32,
    secret: Zeroizing<String>,
}

impl Selection {
    fn from_credential(c: &Credential) -> Self {
        Self {
            name: c.name.clone(),
            service: c.service.clone(),
            priority: c.priority,
            secret: c.secret().clone(),
        }
    }

    /// The raw secret. Hand it to the vendor client, never to a log line.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn masked_secret(&self) -> String {
        mask_value(&self.secret)
    }

    /// Secret-free summary for JSON output.
    pub fn summary(&self) -> SelectionSummary {
        SelectionSummary {
            name: self.name.clone(),
            service: self.service.clone(),
            priority: self.priority,
            masked_secret: self.masked_secret(),
        }
    }
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("name", &self.name)
            .field("service", &self.service)
            .field("priority", &self.priority)
            .field("secret", &self.masked_secret())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionSummary {
    pub name: String,
    pub service: String,
    pub priority: i32,
    pub masked_secret: String,
}

/// Index of the best usable credential: working ones only, priority
/// ascending with registration order kept on ties, first within quota.
pub(crate) fn pick(creds: &mut [Credential], now: DateTime<Utc>) -> Option<usize> {
    let mut order: Vec<usize> = (0..creds.len()).filter(|&i| creds[i].is_working).collect();
    // sort_by_key is stable
    order.sort_by_key(|&i| creds[i].priority);
    order.into_iter().find(|&i| check_quota(&mut creds[i], now))
}

impl Registry {
    /// Best usable credential for `service`, without recording usage.
    ///
    /// `None` is the normal "no usable credential" outcome: unknown
    /// service, every credential failed, or every quota exhausted.
    pub fn select(&self, service: &str) -> Option<Selection> {
        self.lookup(service, false)
    }

    /// Like [`select`](Self::select), and records one use against the
    /// returned credential's quota.
    pub fn acquire(&self, service: &str) -> Option<Selection> {
        self.lookup(service, true)
    }

    fn lookup(&self, service: &str, record: bool) -> Option<Selection> {
        let now = self.now();
        let mut services = self.lock();

        let Some(creds) = services.get_mut(service) else {
            tracing::warn!(service, "no credentials registered for service");
            return None;
        };

        let Some(idx) = pick(creds, now) else {
            tracing::warn!(service, "all credentials are at quota limit or failed");
            return None;
        };

        let cred = &mut creds[idx];
        if record {
            cred.record_use();
        }
        tracing::debug!(
            service,
            credential = %cred.name,
            priority = cred.priority,
            usage = cred.usage_count,
            acquired = record,
            "selected credential"
        );
        Some(Selection::from_credential(cred))
    }

    /// Caller feedback: the vendor rejected this credential. Takes it out of
    /// rotation until a probe or [`mark_working`](Self::mark_working)
    /// restores it. Returns `false` if no such credential exists.
    pub fn report_failure(&self, service: &str, name: &str) -> bool {
        let found = self.set_working(service, name, false);
        if found {
            tracing::warn!(service, credential = name, "credential marked failed");
        }
        found
    }

    pub fn mark_working(&self, service: &str, name: &str) -> bool {
        let found = self.set_working(service, name, true);
        if found {
            tracing::info!(service, credential = name, "credential marked working");
        }
        found
    }

    fn set_working(&self, service: &str, name: &str, working: bool) -> bool {
        let mut services = self.lock();
        match services
            .get_mut(service)
            .and_then(|creds| creds.iter_mut().find(|c| c.name == name))
        {
            Some(cred) => {
                cred.is_working = working;
                true
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
