use crate::clock::Clock;
use crate::credential::Credential;
use crate::error::{Error, Result};
use crate::probe::{Prober, UnprobedPolicy, VendorProbe};
use crate::registry::Registry;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Startup configuration:
///
/// ```toml
/// [settings]
/// probe_timeout_secs = 10
/// unprobed_policy = "assume-working"
///
/// [[credential]]
/// name = "openai_main"
/// service = "openai"
/// priority = 1
/// quota_limit = 1000
/// secret_env = "OPENAI_API_KEY"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, rename = "credential")]
    pub credentials: Vec<CredentialSource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub probe_timeout_secs: u64,
    pub unprobed_policy: UnprobedPolicy,
    /// Service used by the command router when no verb matches.
    pub fallback_service: String,
    /// Enables the Vertex AI probe when set.
    pub vertex_project: Option<String>,
    pub vertex_location: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 10,
            unprobed_policy: UnprobedPolicy::default(),
            fallback_service: "gemini".to_string(),
            vertex_project: None,
            vertex_location: "us-central1".to_string(),
        }
    }
}

/// One `[[credential]]` entry. The secret comes from `secret_env` when that
/// variable is set and non-empty, otherwise from the literal `secret`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialSource {
    pub name: String,
    pub service: String,
    pub group: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub quota_limit: Option<u32>,
    pub secret_env: Option<String>,
    pub secret: Option<String>,
}

fn default_priority() -> i32 {
    1
}

/// Conventional environment variables picked up by [`Config::from_env`]:
/// (variable, service, credential name, priority, group).
const ENV_SOURCES: &[(&str, &str, &str, i32, &str)] = &[
    ("GEMINI_API_KEY", "gemini", "gemini_main", 1, "google"),
    ("GEMINI_API_KEY_BACKUP", "gemini", "gemini_backup", 2, "google"),
    ("VERTEX_AI_API_KEY", "vertex_ai", "vertex_main", 1, "google"),
    ("VERTEX_AI_API_KEY_BACKUP", "vertex_ai", "vertex_backup", 2, "google"),
    ("GOOGLE_CLOUD_API_KEY", "google_cloud", "google_cloud_main", 1, "google"),
    ("BIGQUERY_API_KEY", "bigquery", "bigquery_main", 1, "google"),
    ("BIGQUERY_API_KEY_BACKUP", "bigquery", "bigquery_backup", 2, "google"),
    ("OPENAI_API_KEY", "openai", "openai_main", 1, "openai"),
    ("OPENAI_API_KEY_BACKUP", "openai", "openai_backup", 2, "openai"),
    ("ANTHROPIC_API_KEY", "anthropic", "claude_main", 1, "anthropic"),
    ("ANTHROPIC_API_KEY_BACKUP", "anthropic", "claude_backup", 2, "anthropic"),
    ("TILDA_PUBLIC_KEY", "tilda", "tilda_main", 1, "tilda"),
    ("TILDA_SECRET_KEY", "tilda_secret", "tilda_secret", 1, "tilda"),
];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;
        config.settings.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read config '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Configuration built from the conventional `*_API_KEY` variables only.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Self {
        let credentials = ENV_SOURCES
            .iter()
            .filter(|&&(var, ..)| env(var).is_some_and(|v| !v.trim().is_empty()))
            .map(|&(var, service, name, priority, group)| CredentialSource {
                name: name.to_string(),
                service: service.to_string(),
                group: Some(group.to_string()),
                priority,
                quota_limit: None,
                secret_env: Some(var.to_string()),
                secret: None,
            })
            .collect();

        let settings = Settings {
            vertex_project: env("VERTEX_AI_PROJECT").filter(|p| !p.trim().is_empty()),
            ..Settings::default()
        };

        Self {
            settings,
            credentials,
        }
    }

    /// Build the registry from the process environment.
    ///
    /// Malformed entries are logged and skipped; the only fatal outcome is
    /// an empty registry.
    pub fn build_registry(&self, clock: Arc<dyn Clock>) -> Result<Registry> {
        self.build_registry_with(clock, |key| std::env::var(key).ok())
    }

    fn build_registry_with(
        &self,
        clock: Arc<dyn Clock>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Registry> {
        let registry = Registry::new(clock);

        for source in &self.credentials {
            match source.to_credential(&env) {
                Ok(cred) => {
                    registry.register(cred);
                }
                Err(e) => {
                    tracing::warn!(credential = %source.name, error = %e, "skipping credential");
                }
            }
        }

        if registry.is_empty() {
            return Err(Error::NoCredentialsLoaded);
        }

        tracing::info!(
            credentials = registry.len(),
            services = registry.services().len(),
            "loaded credentials"
        );
        Ok(registry)
    }
}

impl CredentialSource {
    fn resolve_secret(&self, env: &impl Fn(&str) -> Option<String>) -> Option<String> {
        self.secret_env
            .as_deref()
            .and_then(env)
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.secret.clone())
    }

    fn to_credential(&self, env: &impl Fn(&str) -> Option<String>) -> Result<Credential> {
        if self.quota_limit == Some(0) {
            return Err(Error::InvalidCredential {
                name: self.name.clone(),
                reason: "quota_limit must be greater than zero; omit it for unlimited".to_string(),
            });
        }

        let secret = self.resolve_secret(env).unwrap_or_default();
        let cred = Credential::new(&self.name, &self.service, &secret)?
            .with_priority(self.priority)
            .with_quota(self.quota_limit);

        Ok(match &self.group {
            Some(group) => cred.with_group(group),
            None => cred,
        })
    }
}

impl Settings {
    fn validate(&self) -> Result<()> {
        if self.probe_timeout_secs == 0 {
            return Err(Error::Config(
                "probe_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.fallback_service.trim().is_empty() {
            return Err(Error::Config("fallback_service must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Prober with every built-in probe this configuration enables.
    pub fn prober(&self) -> Result<Prober> {
        let prober = Prober::new(self.probe_timeout(), self.unprobed_policy)?.with_default_probes();
        Ok(match &self.vertex_project {
            Some(project) => prober.with_probe(VendorProbe::vertex_ai(project, &self.vertex_location)),
            None => prober,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
