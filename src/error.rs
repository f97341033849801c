use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Target has no rule and does not exist: {0}")]
    NoRule(String),
    #[error("Dependency cycle through {target}: {}", path.join(" -> "))]
    Cycle { target: String, path: Vec<String> },
    #[error("Execution error in {job}: {reason}")]
    Execution { job: String, reason: String },
    #[error("Unstable dependencies in {job}: {}", deps.join(", "))]
    Instability { job: String, deps: Vec<String> },
    #[error("Backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },
    #[error("Job {job} cancelled: {reason}")]
    Cancelled { job: String, reason: String },
    #[error("Job {job} cannot use {dep}: {reason}")]
    Dependency { job: String, dep: String, reason: String },
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
}

impl EngineError {
    /// Short tag for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::NoRule(_) => "no_rule",
            Self::Cycle { .. } => "cycle",
            Self::Execution { .. } => "execution",
            Self::Instability { .. } => "instability",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::Cancelled { .. } => "cancelled",
            Self::Dependency { .. } => "dependency",
            Self::Persistence(_) => "persistence",
            Self::Io(_) => "io",
            Self::Protocol(_) => "protocol",
            Self::Invariant(_) => "invariant",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

// Helper conversions
impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}
impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self { Self::Io(e.to_string()) }
}
impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self { Self::Protocol(e.to_string()) }
}
impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl From<nix::Error> for EngineError {
    fn from(e: nix::Error) -> Self { Self::Io(e.to_string()) }
}
