//! Engine configuration.
//!
//! Settings come from an optional TOML file (`autobuild.toml` at the root
//! by default) overridden by `AUTOBUILD__*` environment variables, e.g.
//! `AUTOBUILD__MAX_JOBS=4` or `AUTOBUILD__HAZARD__MAX_RERUNS=2`.
//!
//! ```toml
//! autodep = "preload"
//! interposer = "target/release/libautobuild_interpose.so"
//!
//! [backends.cluster]
//! kind = "spool"
//! spool = "/shared/spool"
//!
//! [bases.c]
//! stems = { file = ".*" }
//!
//! [[rules]]
//! name = "compile"
//! base = "c"
//! target = "{file}.o"
//! deps = { src = "{file}.c" }
//! cmd = "cc -c -o {TARGET} {src}"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::autodep::Strategy;
use crate::error::{EngineError, Result};
use crate::links::LinkSupport;
use crate::rule::{Rule, RuleBase, RuleBuilder, RuleSet};
use crate::tmp::TmpMode;

/// When an execution is not trusted yet.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HazardPolicy {
    /// A dependency modified later than this long before the job started
    /// is considered still being written.
    pub hot_window_ms: u64,
    /// Re-executions allowed for hot dependencies before giving up.
    pub max_reruns: u32,
    /// Re-executions allowed for newly discovered buildable dependencies.
    pub max_discovery_rounds: u32,
}
impl Default for HazardPolicy {
    fn default() -> Self {
        Self { hot_window_ms: 0, max_reruns: 1, max_discovery_rounds: 16 }
    }
}
impl HazardPolicy {
    pub fn hot_window(&self) -> Duration {
        Duration::from_millis(self.hot_window_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    Local,
    Spool {
        spool: PathBuf,
        #[serde(default = "default_poll_ms")]
        poll_ms: u64,
        #[serde(default = "default_submit_retries")]
        submit_retries: u32,
        #[serde(default = "default_retry_backoff_ms")]
        retry_backoff_ms: u64,
    },
}
fn default_poll_ms() -> u64 {
    50
}
fn default_submit_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    100
}

/// A rule or base record as written in the configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuleDecl {
    pub name: String,
    pub base: Option<String>,
    pub target: Option<String>,
    pub targets: Vec<(String, String)>,
    pub side_targets: Vec<(String, String)>,
    pub deps: BTreeMap<String, String>,
    pub stems: BTreeMap<String, String>,
    pub cmd: Option<String>,
    pub autodep: Option<Strategy>,
    pub backend: Option<String>,
    pub link_support: Option<LinkSupport>,
    pub tmp: Option<PathBuf>,
    pub timeout_ms: Option<u64>,
    pub priority: Option<i32>,
    pub env: BTreeMap<String, String>,
}

impl RuleDecl {
    pub fn to_base(&self) -> RuleBase {
        RuleBase {
            stems: self.stems.clone(),
            deps: self.deps.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            autodep: self.autodep,
            backend: self.backend.clone(),
            link_support: self.link_support,
            tmp: self.tmp.clone().map(TmpMode::View),
            timeout: self.timeout_ms.map(Duration::from_millis),
            priority: self.priority,
            environment: self.env.clone(),
        }
    }
    pub fn to_rule(&self, bases: &BTreeMap<String, RuleDecl>) -> Result<Rule> {
        let mut base = self.to_base();
        if let Some(name) = &self.base {
            let record = bases
                .get(name)
                .ok_or_else(|| EngineError::Config(format!("rule {} uses unknown base {}", self.name, name)))?;
            base = record.to_base().overlay(&base);
        }
        let mut builder = RuleBuilder::new(&self.name).base(&base);
        if let Some(target) = &self.target {
            builder = builder.target(target);
        }
        for (key, pattern) in &self.targets {
            builder = builder.targets(key, pattern);
        }
        for (key, pattern) in &self.side_targets {
            builder = builder.side_target(key, pattern);
        }
        let cmd = self
            .cmd
            .as_deref()
            .ok_or_else(|| EngineError::Config(format!("rule {} has no cmd", self.name)))?;
        builder.shell(cmd).build()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub admin_dir: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub tmp_root: Option<PathBuf>,
    pub max_jobs: usize,
    pub link_support: LinkSupport,
    pub autodep: Strategy,
    pub interposer: Option<PathBuf>,
    pub runtime: Option<PathBuf>,
    pub hazard: HazardPolicy,
    pub backends: BTreeMap<String, BackendConfig>,
    pub bases: BTreeMap<String, RuleDecl>,
    pub rules: Vec<RuleDecl>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            admin_dir: None,
            database: None,
            tmp_root: None,
            max_jobs: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            link_support: LinkSupport::default(),
            autodep: Strategy::None,
            interposer: None,
            runtime: None,
            hazard: HazardPolicy::default(),
            backends: BTreeMap::new(),
            bases: BTreeMap::new(),
            rules: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Defaults for a repository at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        Self { root: root.to_path_buf(), ..Self::default() }.resolved()
    }
    /// Read `file`, or `<root>/autobuild.toml` when present, then the environment.
    pub fn load(file: Option<&Path>, root: &Path) -> Result<Self> {
        let path = file.map(Path::to_path_buf).unwrap_or_else(|| root.join("autobuild.toml"));
        let settings = Config::builder()
            .set_default("root", root.to_string_lossy().to_string())?
            .add_source(File::from(path.as_path()).required(file.is_some()))
            .add_source(Environment::with_prefix("AUTOBUILD").separator("__").try_parsing(true))
            .build()?;
        let config: EngineConfig = settings.try_deserialize()?;
        config.resolved()
    }
    // absolute and link-free paths, so that accesses can be compared to them
    fn resolved(mut self) -> Result<Self> {
        self.root = self
            .root
            .canonicalize()
            .map_err(|e| EngineError::Config(format!("root {}: {}", self.root.display(), e)))?;
        if self.max_jobs == 0 {
            return Err(EngineError::Config("max_jobs must be at least 1".into()));
        }
        let admin = self.admin_dir();
        std::fs::create_dir_all(&admin)?;
        self.admin_dir = Some(admin.canonicalize()?);
        if let Some(tmp_root) = &self.tmp_root {
            std::fs::create_dir_all(tmp_root)?;
            self.tmp_root = Some(tmp_root.canonicalize()?);
        }
        for (name, backend) in &self.backends {
            if name == "local" && *backend != BackendConfig::Local {
                return Err(EngineError::Config("backend name 'local' is reserved".into()));
            }
        }
        Ok(self)
    }
    pub fn admin_dir(&self) -> PathBuf {
        match &self.admin_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.root.join(dir),
            None => self.root.join(".autobuild"),
        }
    }
    pub fn database_path(&self) -> PathBuf {
        match &self.database {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.root.join(path),
            None => self.admin_dir().join("graph.db"),
        }
    }
    pub fn tmp_root(&self) -> PathBuf {
        self.tmp_root.clone().unwrap_or_else(|| self.admin_dir().join("tmp"))
    }
    /// Rules declared in the configuration file.
    pub fn rule_set(&self) -> Result<RuleSet> {
        let rules = self
            .rules
            .iter()
            .map(|decl| decl.to_rule(&self.bases))
            .collect::<Result<Vec<_>>>()?;
        RuleSet::new(rules)
    }
}
