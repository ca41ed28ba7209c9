pub mod clock;
pub mod config;
pub mod credential;
pub mod dispatch;
pub mod error;
pub mod probe;
pub mod quota;
pub mod registry;
pub mod router;
pub mod selector;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, CredentialSource, Settings};
pub use credential::{Credential, CredentialView, mask_value};
pub use dispatch::{DispatchResponse, Dispatcher, DryRunHandler, ServiceHandler};
pub use error::{Error, Result};
pub use probe::{Probe, ProbeOutcome, ProbeReport, ProbeResult, Prober, UnprobedPolicy, VendorProbe};
pub use quota::{QUOTA_WINDOW, QuotaStatus, check_quota};
pub use registry::{Overview, Registry, ServiceInfo};
pub use router::{Route, Verb, route};
pub use selector::{Selection, SelectionSummary};

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "KEYRACK_CONFIG";
