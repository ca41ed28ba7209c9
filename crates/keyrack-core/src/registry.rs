use crate::clock::{Clock, SystemClock};
use crate::credential::{Credential, CredentialView};
use crate::quota::QuotaStatus;
use crate::selector;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::Zeroizing;

/// Service tag → credentials in registration order.
pub(crate) type ServiceMap = BTreeMap<String, Vec<Credential>>;

/// Process-wide credential registry.
///
/// Constructed once at startup and passed by reference to whatever needs
/// it. All credential state sits behind one mutex; no lock is ever held
/// across an await point.
pub struct Registry {
    services: Mutex<ServiceMap>,
    clock: Arc<dyn Clock>,
}

/// What the prober needs to check one credential without holding the lock.
pub(crate) struct ProbeTarget {
    pub service: String,
    pub name: String,
    pub priority: i32,
    pub secret: Zeroizing<String>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let services = self.lock();
        f.debug_struct("Registry")
            .field("services", &services.len())
            .field("credentials", &services.values().map(Vec::len).sum::<usize>())
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            services: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    /// Add a credential. Registering the same `(service, name)` twice is a
    /// no-op and returns `false`.
    pub fn register(&self, credential: Credential) -> bool {
        let mut services = self.lock();
        let group = services.entry(credential.service.clone()).or_default();
        if group.iter().any(|c| c.name == credential.name) {
            tracing::debug!(
                service = %credential.service,
                credential = %credential.name,
                "duplicate registration ignored"
            );
            return false;
        }
        tracing::debug!(
            service = %credential.service,
            credential = %credential.name,
            priority = credential.priority,
            "registered credential"
        );
        group.push(credential);
        true
    }

    /// All credentials tagged with `service`, in registration order.
    /// Unknown services yield an empty list.
    pub fn credentials_for(&self, service: &str) -> Vec<CredentialView> {
        self.lock()
            .get(service)
            .map(|creds| creds.iter().map(Credential::view).collect())
            .unwrap_or_default()
    }

    /// Every credential, grouped by service (services sorted).
    pub fn all(&self) -> Vec<CredentialView> {
        self.lock()
            .values()
            .flat_map(|creds| creds.iter().map(Credential::view))
            .collect()
    }

    /// Known service tags, sorted.
    pub fn services(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ServiceMap> {
        self.services.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot the credentials to probe. `service = None` means all.
    pub(crate) fn probe_targets(&self, service: Option<&str>) -> Vec<ProbeTarget> {
        self.lock()
            .iter()
            .filter(|(tag, _)| service.is_none_or(|s| s == tag.as_str()))
            .flat_map(|(_, creds)| creds.iter())
            .map(|c| ProbeTarget {
                service: c.service.clone(),
                name: c.name.clone(),
                priority: c.priority,
                secret: c.secret().clone(),
            })
            .collect()
    }

    /// Apply a probe result. Returns the recorded timestamp, or `None` if
    /// the credential is not registered.
    pub(crate) fn record_probe(
        &self,
        service: &str,
        name: &str,
        working: bool,
    ) -> Option<DateTime<Utc>> {
        let now = self.now();
        let mut services = self.lock();
        let cred = services
            .get_mut(service)?
            .iter_mut()
            .find(|c| c.name == name)?;
        cred.record_probe(working, now);
        Some(now)
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    /// Detailed state of one service's credentials, including which one a
    /// lookup would pick right now.
    ///
    /// Not read-only: working out the current pick runs the quota check,
    /// which resets any window older than 24h exactly as [`Registry::select`]
    /// does. Usage is never counted.
    pub fn service_info(&self, service: &str) -> ServiceInfo {
        let now = self.now();
        let mut services = self.lock();
        let Some(creds) = services.get_mut(service) else {
            return ServiceInfo {
                service: service.to_string(),
                current_key: None,
                available_keys: 0,
                total_keys: 0,
                keys: vec![],
            };
        };

        let current = selector::pick(creds, now).map(|i| creds[i].name.clone());
        let keys: Vec<KeyInfo> = creds
            .iter()
            .map(|c| KeyInfo {
                name: c.name.clone(),
                working: c.is_working,
                priority: c.priority,
                quota: QuotaStatus::of(c, now),
                last_tested: c.last_tested,
                is_current: current.as_deref() == Some(c.name.as_str()),
            })
            .collect();

        ServiceInfo {
            service: service.to_string(),
            current_key: current,
            available_keys: keys.iter().filter(|k| k.working).count(),
            total_keys: keys.len(),
            keys,
        }
    }

    /// Availability summary for every known service. Rolls expired quota
    /// windows the same way [`Registry::service_info`] does.
    pub fn overview(&self) -> Overview {
        let services = self
            .services()
            .into_iter()
            .map(|service| {
                let info = self.service_info(&service);
                (
                    service,
                    ServiceSummary {
                        available: info.current_key.is_some(),
                        total_keys: info.total_keys,
                        working_keys: info.available_keys,
                        current_key: info.current_key,
                    },
                )
            })
            .collect();

        Overview {
            services,
            fallback_enabled: true,
            generated_at: self.now(),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub name: String,
    pub working: bool,
    pub priority: i32,
    pub quota: QuotaStatus,
    pub last_tested: Option<DateTime<Utc>>,
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub service: String,
    pub current_key: Option<String>,
    /// Credentials currently marked working.
    pub available_keys: usize,
    pub total_keys: usize,
    pub keys: Vec<KeyInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    /// A lookup would currently succeed.
    pub available: bool,
    pub total_keys: usize,
    pub working_keys: usize,
    pub current_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub services: BTreeMap<String, ServiceSummary>,
    pub fallback_enabled: bool,
    pub generated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
