use crate::error::{Error, Result};
use crate::registry::{ProbeTarget, Registry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Result of one liveness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// The vendor accepted the secret.
    Accepted,
    /// The vendor answered with a status outside the accepted set.
    Rejected { status: u16 },
    /// Network or protocol failure.
    Error { message: String },
    TimedOut,
    /// No probe is registered for the service.
    Unprobed,
}

/// What to do with credentials whose service has no registered probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnprobedPolicy {
    /// Keep them in rotation (logged as a warning).
    #[default]
    AssumeWorking,
    /// Take them out of rotation until an explicit `mark_working`.
    MarkFailed,
}

impl ProbeOutcome {
    fn is_working(&self, policy: UnprobedPolicy) -> bool {
        match self {
            ProbeOutcome::Accepted => true,
            ProbeOutcome::Unprobed => policy == UnprobedPolicy::AssumeWorking,
            _ => false,
        }
    }
}

/// One vendor-specific minimal check: exactly one round trip.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Service tag this probe answers for.
    fn service(&self) -> &str;

    async fn check(&self, client: &reqwest::Client, secret: &str) -> ProbeOutcome;
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub name: String,
    pub service: String,
    pub priority: i32,
    #[serde(flatten)]
    pub outcome: ProbeOutcome,
    pub working: bool,
    pub last_tested: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    pub total: usize,
    pub working: usize,
    pub failed: usize,
}

/// Batch probe report, grouped by service.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub tested_at: DateTime<Utc>,
    pub services: BTreeMap<String, Vec<ProbeResult>>,
    pub summary: ProbeSummary,
}

// ---------------------------------------------------------------------------
// Vendor probes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Auth {
    /// Secret passed as a query parameter.
    Query(&'static str),
    Bearer,
    Header(&'static str),
}

/// HTTP probe described by endpoint, auth style and accepted statuses.
#[derive(Debug, Clone)]
pub struct VendorProbe {
    service: String,
    base_url: String,
    path: String,
    auth: Auth,
    headers: Vec<(&'static str, &'static str)>,
    body: Option<serde_json::Value>,
    accepted: &'static [u16],
    /// Top-level JSON field that must be present in an accepted response.
    required_field: Option<&'static str>,
}

impl VendorProbe {
    fn get(service: &str, base_url: &str, path: &str, auth: Auth, accepted: &'static [u16]) -> Self {
        Self {
            service: service.to_string(),
            base_url: base_url.to_string(),
            path: path.to_string(),
            auth,
            headers: vec![],
            body: None,
            accepted,
            required_field: None,
        }
    }

    /// Generative-language model listing.
    pub fn gemini() -> Self {
        Self::get(
            "gemini",
            "https://generativelanguage.googleapis.com",
            "/v1/models",
            Auth::Query("key"),
            &[200],
        )
    }

    pub fn openai() -> Self {
        Self::get("openai", "https://api.openai.com", "/v1/models", Auth::Bearer, &[200])
    }

    /// Minimal message request. 400 and 429 still prove the key is valid.
    pub fn anthropic() -> Self {
        Self {
            headers: vec![("anthropic-version", "2023-06-01")],
            body: Some(serde_json::json!({
                "model": "claude-3-haiku-20240307",
                "max_tokens": 10,
                "messages": [{ "role": "user", "content": "Hi" }]
            })),
            ..Self::get(
                "anthropic",
                "https://api.anthropic.com",
                "/v1/messages",
                Auth::Header("x-api-key"),
                &[200, 400, 429],
            )
        }
    }

    /// Site-builder project listing; the body must carry `result`.
    pub fn tilda() -> Self {
        Self {
            required_field: Some("result"),
            ..Self::get(
                "tilda",
                "https://api.tildacdn.info",
                "/v1/getprojectslist/",
                Auth::Query("publickey"),
                &[200],
            )
        }
    }

    /// 400 means the token endpoint parsed the request; the key exists.
    pub fn google_cloud() -> Self {
        Self::get(
            "google_cloud",
            "https://www.googleapis.com",
            "/oauth2/v1/tokeninfo",
            Auth::Query("access_token"),
            &[200, 400],
        )
    }

    /// Model listing for a Vertex AI project. Auth errors still prove the
    /// key format is accepted.
    pub fn vertex_ai(project: &str, location: &str) -> Self {
        Self::get(
            "vertex_ai",
            &format!("https://{}-aiplatform.googleapis.com", location),
            &format!("/v1/projects/{}/locations/{}/models", project, location),
            Auth::Bearer,
            &[200, 401, 403],
        )
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn url(&self) -> String {
        format!("{}{}", self.base_url, self.path)
    }
}

#[async_trait]
impl Probe for VendorProbe {
    fn service(&self) -> &str {
        &self.service
    }

    async fn check(&self, client: &reqwest::Client, secret: &str) -> ProbeOutcome {
        let mut req = match &self.body {
            Some(body) => client.post(self.url()).json(body),
            None => client.get(self.url()),
        };
        req = match self.auth {
            Auth::Query(param) => req.query(&[(param, secret)]),
            Auth::Bearer => req.bearer_auth(secret),
            Auth::Header(name) => req.header(name, secret),
        };
        for (name, value) in &self.headers {
            req = req.header(*name, *value);
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            // reqwest errors may embed the URL, which can carry the secret
            Err(e) => {
                return ProbeOutcome::Error {
                    message: e.without_url().to_string(),
                };
            }
        };

        let status = resp.status().as_u16();
        if !self.accepted.contains(&status) {
            return ProbeOutcome::Rejected { status };
        }

        let Some(field) = self.required_field else {
            return ProbeOutcome::Accepted;
        };
        match resp.json::<serde_json::Value>().await {
            Ok(body) if body.get(field).is_some() => ProbeOutcome::Accepted,
            Ok(_) => ProbeOutcome::Error {
                message: format!("response has no '{}' field", field),
            },
            Err(e) => ProbeOutcome::Error {
                message: format!("invalid response body: {}", e.without_url()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Prober
// ---------------------------------------------------------------------------

/// Runs probes against registry credentials and records the outcome.
pub struct Prober {
    client: reqwest::Client,
    timeout: Duration,
    policy: UnprobedPolicy,
    probes: HashMap<String, Box<dyn Probe>>,
}

impl Prober {
    /// Prober with no vendor probes registered.
    pub fn new(timeout: Duration, policy: UnprobedPolicy) -> Result<Self> {
        Ok(Self {
            client: http_client(timeout)?,
            timeout,
            policy,
            probes: HashMap::new(),
        })
    }

    /// Register (or replace) the probe for its service.
    pub fn with_probe(mut self, probe: impl Probe + 'static) -> Self {
        self.probes.insert(probe.service().to_string(), Box::new(probe));
        self
    }

    /// Register every built-in probe that needs no extra configuration.
    pub fn with_default_probes(self) -> Self {
        self.with_probe(VendorProbe::gemini())
            .with_probe(VendorProbe::openai())
            .with_probe(VendorProbe::anthropic())
            .with_probe(VendorProbe::tilda())
            .with_probe(VendorProbe::google_cloud())
    }

    pub fn has_probe(&self, service: &str) -> bool {
        self.probes.contains_key(service)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe a single credential. `None` if it is not registered.
    pub async fn probe_one(&self, registry: &Registry, service: &str, name: &str) -> Option<ProbeResult> {
        let target = registry
            .probe_targets(Some(service))
            .into_iter()
            .find(|t| t.name == name)?;
        Some(self.run(registry, target).await)
    }

    /// Probe every credential of every service.
    pub async fn probe_all(&self, registry: &Registry) -> ProbeReport {
        self.probe_batch(registry, registry.probe_targets(None)).await
    }

    /// Probe every credential of one service.
    pub async fn probe_service(&self, registry: &Registry, service: &str) -> ProbeReport {
        self.probe_batch(registry, registry.probe_targets(Some(service))).await
    }

    /// Probes run concurrently; each one absorbs its own failure, so a dead
    /// vendor never stops the rest of the batch.
    async fn probe_batch(&self, registry: &Registry, targets: Vec<ProbeTarget>) -> ProbeReport {
        let tested_at = registry.now();
        tracing::info!(credentials = targets.len(), "probing credentials");

        let results =
            futures::future::join_all(targets.into_iter().map(|t| self.run(registry, t))).await;

        let mut report = ProbeReport {
            tested_at,
            services: BTreeMap::new(),
            summary: ProbeSummary::default(),
        };
        for result in results {
            report.summary.total += 1;
            if result.working {
                report.summary.working += 1;
            } else {
                report.summary.failed += 1;
            }
            report
                .services
                .entry(result.service.clone())
                .or_default()
                .push(result);
        }

        tracing::info!(
            total = report.summary.total,
            working = report.summary.working,
            failed = report.summary.failed,
            "probe batch finished"
        );
        report
    }

    async fn run(&self, registry: &Registry, target: ProbeTarget) -> ProbeResult {
        let outcome = match self.probes.get(&target.service) {
            Some(probe) => {
                tracing::debug!(service = %target.service, credential = %target.name, "probing");
                match tokio::time::timeout(self.timeout, probe.check(&self.client, &target.secret)).await {
                    Ok(outcome) => outcome,
                    Err(_) => ProbeOutcome::TimedOut,
                }
            }
            None => {
                tracing::warn!(
                    service = %target.service,
                    credential = %target.name,
                    policy = ?self.policy,
                    "no probe for service"
                );
                ProbeOutcome::Unprobed
            }
        };

        let working = outcome.is_working(self.policy);
        if !working {
            tracing::warn!(
                service = %target.service,
                credential = %target.name,
                outcome = ?outcome,
                "credential failed probe"
            );
        }
        let last_tested = registry.record_probe(&target.service, &target.name, working);

        ProbeResult {
            name: target.name,
            service: target.service,
            priority: target.priority,
            outcome,
            working,
            last_tested,
        }
    }
}

/// HTTP client bounded by the probe timeout. An unbounded client is never
/// substituted.
fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Probe(format!("Failed to build HTTP client: {}", e)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Credential;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cred(name: &str, service: &str, secret: &str) -> Credential {
        Credential::new(name, service, secret).unwrap()
    }

    fn prober() -> Prober {
        Prober::new(Duration::from_secs(5), UnprobedPolicy::AssumeWorking).unwrap()
    }

    /// Probe that never answers within any reasonable timeout.
    struct Hanging;

    #[async_trait]
    impl Probe for Hanging {
        fn service(&self) -> &str {
            "slow"
        }

        async fn check(&self, _client: &reqwest::Client, _secret: &str) -> ProbeOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            ProbeOutcome::Accepted
        }
    }

    #[tokio::test]
    async fn test_openai_probe_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer sk-good-key-1234"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;

        let probe = VendorProbe::openai().with_base_url(&server.uri());
        let outcome = probe.check(&reqwest::Client::new(), "sk-good-key-1234").await;
        assert_eq!(outcome, ProbeOutcome::Accepted);
    }

    #[tokio::test]
    async fn test_openai_probe_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let probe = VendorProbe::openai().with_base_url(&server.uri());
        let outcome = probe.check(&reqwest::Client::new(), "sk-bad").await;
        assert_eq!(outcome, ProbeOutcome::Rejected { status: 401 });
    }

    #[tokio::test]
    async fn test_gemini_probe_passes_key_as_query() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(query_param("key", "AIza-test"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let probe = VendorProbe::gemini().with_base_url(&server.uri());
        assert_eq!(
            probe.check(&reqwest::Client::new(), "AIza-test").await,
            ProbeOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn test_anthropic_rate_limited_counts_as_valid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-test"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(serde_json::json!({"max_tokens": 10})))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let probe = VendorProbe::anthropic().with_base_url(&server.uri());
        assert_eq!(
            probe.check(&reqwest::Client::new(), "sk-ant-test").await,
            ProbeOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn test_tilda_requires_result_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/getprojectslist/"))
            .and(query_param("publickey", "good"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "FOUND", "result": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/getprojectslist/"))
            .and(query_param("publickey", "bad"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"status": "ERROR", "message": "Wrong key"})),
            )
            .mount(&server)
            .await;

        let probe = VendorProbe::tilda().with_base_url(&server.uri());
        let client = reqwest::Client::new();
        assert_eq!(probe.check(&client, "good").await, ProbeOutcome::Accepted);
        assert!(matches!(
            probe.check(&client, "bad").await,
            ProbeOutcome::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_vertex_ai_path_and_auth_errors_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/projects/demo-project/locations/us-central1/models"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let probe = VendorProbe::vertex_ai("demo-project", "us-central1").with_base_url(&server.uri());
        assert_eq!(
            probe.check(&reqwest::Client::new(), "token").await,
            ProbeOutcome::Accepted
        );
    }

    #[tokio::test]
    async fn test_connection_error_does_not_leak_secret() {
        // Nothing listens on port 9 of localhost
        let probe = VendorProbe::gemini().with_base_url("http://127.0.0.1:9");
        let outcome = probe.check(&reqwest::Client::new(), "AIza-very-secret").await;
        match outcome {
            ProbeOutcome::Error { message } => assert!(!message.contains("AIza-very-secret")),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_all_records_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer good-key-1234"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .and(header("authorization", "Bearer dead-key-1234"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let reg = Registry::default();
        reg.register(cred("openai_main", "openai", "dead-key-1234"));
        reg.register(cred("openai_backup", "openai", "good-key-1234").with_priority(2));

        let prober = prober().with_probe(VendorProbe::openai().with_base_url(&server.uri()));
        let report = prober.probe_all(&reg).await;

        assert_eq!(report.summary, ProbeSummary { total: 2, working: 1, failed: 1 });
        let views = reg.credentials_for("openai");
        assert!(!views[0].is_working);
        assert!(views[1].is_working);
        assert!(views.iter().all(|v| v.last_tested.is_some()));

        // Dead primary is skipped by selection
        assert_eq!(reg.select("openai").unwrap().name, "openai_backup");
    }

    #[tokio::test]
    async fn test_timeout_marks_failed_and_batch_continues() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let reg = Registry::default();
        reg.register(cred("slow_main", "slow", "slow-secret-value"));
        reg.register(cred("openai_main", "openai", "sk-good-key-1234"));

        let prober = Prober::new(Duration::from_millis(100), UnprobedPolicy::AssumeWorking)
            .unwrap()
            .with_probe(Hanging)
            .with_probe(VendorProbe::openai().with_base_url(&server.uri()));
        let report = prober.probe_all(&reg).await;

        assert_eq!(report.summary.total, 2);
        assert_eq!(report.services["slow"][0].outcome, ProbeOutcome::TimedOut);
        assert!(!report.services["slow"][0].working);
        assert!(report.services["openai"][0].working);

        assert!(!reg.credentials_for("slow")[0].is_working);
        assert!(reg.select("slow").is_none());
        assert!(reg.select("openai").is_some());
    }

    #[tokio::test]
    async fn test_slow_http_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let reg = Registry::default();
        reg.register(cred("openai_main", "openai", "sk-good-key-1234"));
        let prober = Prober::new(Duration::from_millis(200), UnprobedPolicy::AssumeWorking)
            .unwrap()
            .with_probe(VendorProbe::openai().with_base_url(&server.uri()));

        let result = prober.probe_one(&reg, "openai", "openai_main").await.unwrap();
        assert!(!result.working);
        assert!(!reg.credentials_for("openai")[0].is_working);
    }

    #[tokio::test]
    async fn test_unprobed_service_policy() {
        let reg = Registry::default();
        reg.register(cred("aws_access", "aws", "AKIA-example-key"));

        let report = prober().probe_all(&reg).await;
        assert_eq!(report.services["aws"][0].outcome, ProbeOutcome::Unprobed);
        assert!(reg.credentials_for("aws")[0].is_working);
        assert!(reg.credentials_for("aws")[0].last_tested.is_some());

        let strict = Prober::new(Duration::from_secs(1), UnprobedPolicy::MarkFailed).unwrap();
        let report = strict.probe_all(&reg).await;
        assert_eq!(report.summary.failed, 1);
        assert!(reg.select("aws").is_none());
    }

    #[tokio::test]
    async fn test_probe_recovers_failed_credential() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let reg = Registry::default();
        reg.register(cred("openai_main", "openai", "sk-good-key-1234"));
        reg.report_failure("openai", "openai_main");
        assert!(reg.select("openai").is_none());

        let prober = prober().with_probe(VendorProbe::openai().with_base_url(&server.uri()));
        let report = prober.probe_service(&reg, "openai").await;
        assert_eq!(report.summary.working, 1);
        assert!(reg.select("openai").is_some());
    }

    #[tokio::test]
    async fn test_probe_one_unknown_credential() {
        let reg = Registry::default();
        assert!(prober().probe_one(&reg, "openai", "ghost").await.is_none());
    }

    #[test]
    fn test_new_keeps_timeout_and_policy() {
        let p = Prober::new(Duration::from_millis(1500), UnprobedPolicy::MarkFailed).unwrap();
        assert_eq!(p.timeout(), Duration::from_millis(1500));
        assert_eq!(p.policy, UnprobedPolicy::MarkFailed);
        assert!(!p.has_probe("openai"));
    }

    #[test]
    fn test_default_probes_registered() {
        let p = prober().with_default_probes();
        for service in ["gemini", "openai", "anthropic", "tilda", "google_cloud"] {
            assert!(p.has_probe(service), "missing probe for {}", service);
        }
        assert!(!p.has_probe("vertex_ai"));
    }

    #[test]
    fn test_policy_deserializes_kebab_case() {
        #[derive(Deserialize)]
        struct Wrap {
            policy: UnprobedPolicy,
        }
        let w: Wrap = toml::from_str("policy = \"mark-failed\"").unwrap();
        assert_eq!(w.policy, UnprobedPolicy::MarkFailed);
    }
}
