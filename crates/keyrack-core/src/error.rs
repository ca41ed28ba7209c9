use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid credential '{name}': {reason}")]
    InvalidCredential { name: String, reason: String },

    #[error("Credential '{name}' has no secret. Set its env var or a literal fallback.")]
    EmptySecret { name: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("No credentials loaded. Configure at least one credential via --config or environment variables.")]
    NoCredentialsLoaded,

    #[error("no credential available for service {service}")]
    NoUsableCredential { service: String },

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },
}
