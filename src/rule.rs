//! Rules and the rule matcher.
//!
//! A [`Rule`] is immutable once built. Shared settings live in a
//! [`RuleBase`] record that a [`RuleBuilder`] starts from; anything set on
//! the builder overrides the base. A [`RuleSet`] owns the loaded rules and
//! maps requested target paths to the rule producing them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::autodep::Strategy;
use crate::context::JobContext;
use crate::error::{EngineError, Result};
use crate::links::LinkSupport;
use crate::pattern::{CompiledPattern, Pattern, Stems};
use crate::tmp::TmpMode;

pub type Callback = Arc<dyn Fn(&mut JobContext) -> Result<()> + Send + Sync>;

/// What a job runs: a shell command line or a function registered by name.
#[derive(Clone)]
pub enum Command {
    Shell(String),
    Callback { name: String, func: Callback },
}
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Shell(text) => write!(f, "Shell({:?})", text),
            Self::Callback { name, .. } => write!(f, "Callback({})", name),
        }
    }
}

/// Callbacks by name, so that a job description can be shipped to another
/// process and still find its code.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<String, Callback>,
}
impl CallbackRegistry {
    pub fn new() -> Self {
        Self { callbacks: HashMap::new() }
    }
    pub fn register(&mut self, name: &str, func: Callback) {
        self.callbacks.insert(name.to_string(), func);
    }
    pub fn get(&self, name: &str) -> Option<Callback> {
        self.callbacks.get(name).cloned()
    }
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// Settings shared by several rules.
#[derive(Debug, Clone, Default)]
pub struct RuleBase {
    pub stems: BTreeMap<String, String>,
    pub deps: Vec<(String, String)>,
    pub autodep: Option<Strategy>,
    pub backend: Option<String>,
    pub link_support: Option<LinkSupport>,
    pub tmp: Option<TmpMode>,
    pub timeout: Option<Duration>,
    pub priority: Option<i32>,
    pub environment: BTreeMap<String, String>,
}

impl RuleBase {
    /// A copy of `self` with every field `other` sets taken from `other`.
    pub fn overlay(&self, other: &RuleBase) -> RuleBase {
        let mut merged = self.clone();
        merged.stems.extend(other.stems.clone());
        for (key, _) in &other.deps {
            merged.deps.retain(|(k, _)| k != key);
        }
        merged.deps.extend(other.deps.iter().cloned());
        merged.environment.extend(other.environment.clone());
        merged.autodep = other.autodep.or(merged.autodep);
        merged.backend = other.backend.clone().or(merged.backend);
        merged.link_support = other.link_support.or(merged.link_support);
        merged.tmp = other.tmp.clone().or(merged.tmp);
        merged.timeout = other.timeout.or(merged.timeout);
        merged.priority = other.priority.or(merged.priority);
        merged
    }
}

#[derive(Debug, Clone)]
pub struct TargetSpec {
    key: String,
    pattern: Pattern,
    compiled: CompiledPattern,
    side: bool,
}
impl TargetSpec {
    pub fn key(&self) -> &str {
        &self.key
    }
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }
    pub fn side(&self) -> bool {
        self.side
    }
    fn overlaps(&self, other: &TargetSpec) -> Result<bool> {
        let (head, tail) = self.pattern.fixed_ends();
        let (other_head, other_tail) = other.pattern.fixed_ends();
        if !(head.starts_with(other_head) || other_head.starts_with(head))
            || !(tail.ends_with(other_tail) || other_tail.ends_with(tail))
        {
            return Ok(false);
        }
        self.compiled.overlaps(&other.compiled)
    }
}

#[derive(Debug)]
pub struct Rule {
    name: String,
    stems: BTreeMap<String, String>,
    targets: Vec<TargetSpec>,
    deps: Vec<(String, Pattern)>,
    command: Command,
    autodep: Option<Strategy>,
    backend: String,
    link_support: Option<LinkSupport>,
    tmp: TmpMode,
    timeout: Option<Duration>,
    priority: i32,
    stdout_to_target: bool,
    environment: BTreeMap<String, String>,
    fingerprint: String,
}

impl Rule {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn stems(&self) -> &BTreeMap<String, String> {
        &self.stems
    }
    pub fn targets(&self) -> &[TargetSpec] {
        &self.targets
    }
    pub fn primary(&self) -> &TargetSpec {
        &self.targets[0]
    }
    pub fn deps(&self) -> &[(String, Pattern)] {
        &self.deps
    }
    pub fn command(&self) -> &Command {
        &self.command
    }
    /// `None` means the engine default.
    pub fn autodep(&self) -> Option<Strategy> {
        self.autodep
    }
    pub fn backend(&self) -> &str {
        &self.backend
    }
    pub fn link_support(&self) -> Option<LinkSupport> {
        self.link_support
    }
    pub fn tmp(&self) -> &TmpMode {
        &self.tmp
    }
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
    pub fn priority(&self) -> i32 {
        self.priority
    }
    pub fn stdout_to_target(&self) -> bool {
        self.stdout_to_target
    }
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }
    /// Changes whenever anything that affects the produced content changes.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
    /// Identity of the job producing the targets for this stem binding.
    pub fn job_name(&self, stems: &Stems) -> Result<String> {
        Ok(self.primary().pattern.bind(stems)?.text().to_string())
    }
    /// Static dependencies as (key, path).
    pub fn static_deps(&self, stems: &Stems) -> Result<Vec<(String, String)>> {
        self.deps
            .iter()
            .map(|(key, pattern)| Ok((key.clone(), pattern.expand(stems)?)))
            .collect()
    }
    /// Targets that can be named without star stems, as (key, path).
    pub fn static_targets(&self, stems: &Stems) -> Result<Vec<(String, String)>> {
        let mut targets = Vec::new();
        for target in &self.targets {
            if !target.pattern.has_star() {
                targets.push((target.key.clone(), target.pattern.expand(stems)?));
            }
        }
        Ok(targets)
    }
    /// Whether a job with this binding may write `path`.
    pub fn produces(&self, stems: &Stems, path: &str) -> bool {
        self.targets.iter().any(|target| match target.pattern.bind(stems) {
            Ok(bound) if bound.is_static() => bound.text() == path,
            Ok(bound) => bound.compile(&self.stems).is_ok_and(|c| c.is_match(path)),
            Err(_) => false,
        })
    }
    fn best_match(&self, path: &str) -> Option<(usize, Stems)> {
        let mut best: Option<(usize, Stems)> = None;
        for (index, target) in self.targets.iter().enumerate() {
            if let Some(stems) = target.compiled.captures(path) {
                let better = match &best {
                    None => true,
                    Some((current, _)) => rank(&target.pattern, self.priority) > rank(&self.targets[*current].pattern, self.priority),
                };
                if better {
                    best = Some((index, stems));
                }
            }
        }
        best
    }
}

fn rank(pattern: &Pattern, priority: i32) -> (i32, usize, usize) {
    (priority, pattern.fixed_prefix_len(), pattern.fixed_len())
}

// ------------- Builder -------------
pub struct RuleBuilder {
    name: String,
    base: RuleBase,
    targets: Vec<(String, String, bool)>,
    single_target: bool,
    command: Option<Command>,
}

impl RuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            base: RuleBase::default(),
            targets: Vec::new(),
            single_target: false,
            command: None,
        }
    }
    /// Start from a base record. Fields already set on the builder win.
    pub fn base(mut self, base: &RuleBase) -> Self {
        self.base = base.overlay(&self.base);
        self
    }
    pub fn stem(mut self, name: &str, regex: &str) -> Self {
        self.base.stems.insert(name.to_string(), regex.to_string());
        self
    }
    /// A single target, which also receives the standard output of shell commands.
    pub fn target(mut self, pattern: &str) -> Self {
        self.targets.push(("TARGET".to_string(), pattern.to_string(), false));
        self.single_target = true;
        self
    }
    pub fn targets(mut self, key: &str, pattern: &str) -> Self {
        self.targets.push((key.to_string(), pattern.to_string(), false));
        self
    }
    pub fn side_target(mut self, key: &str, pattern: &str) -> Self {
        self.targets.push((key.to_string(), pattern.to_string(), true));
        self
    }
    pub fn dep(mut self, key: &str, pattern: &str) -> Self {
        self.base.deps.retain(|(k, _)| k != key);
        self.base.deps.push((key.to_string(), pattern.to_string()));
        self
    }
    pub fn shell(mut self, text: &str) -> Self {
        self.command = Some(Command::Shell(text.to_string()));
        self
    }
    pub fn callback<F>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(&mut JobContext) -> Result<()> + Send + Sync + 'static,
    {
        self.command = Some(Command::Callback { name: name.to_string(), func: Arc::new(func) });
        self
    }
    pub fn autodep(mut self, strategy: Strategy) -> Self {
        self.base.autodep = Some(strategy);
        self
    }
    pub fn backend(mut self, name: &str) -> Self {
        self.base.backend = Some(name.to_string());
        self
    }
    pub fn link_support(mut self, mode: LinkSupport) -> Self {
        self.base.link_support = Some(mode);
        self
    }
    pub fn tmp(mut self, mode: TmpMode) -> Self {
        self.base.tmp = Some(mode);
        self
    }
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.base.timeout = Some(timeout);
        self
    }
    pub fn priority(mut self, priority: i32) -> Self {
        self.base.priority = Some(priority);
        self
    }
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.base.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> Result<Rule> {
        let name = self.name;
        let command = self
            .command
            .ok_or_else(|| EngineError::Config(format!("rule {} has no command", name)))?;
        if self.targets.is_empty() {
            return Err(EngineError::Config(format!("rule {} has no target", name)));
        }
        if self.single_target && self.targets.iter().filter(|(_, _, side)| !side).count() > 1 {
            return Err(EngineError::Config(format!("rule {} mixes target() with targets()", name)));
        }
        if self.targets[0].2 {
            return Err(EngineError::Config(format!("rule {} lists a side target first", name)));
        }
        // inline definitions join the rule-wide stem definitions
        let mut stems = self.base.stems.clone();
        let mut parsed = Vec::new();
        for (key, text, side) in &self.targets {
            let pattern = Pattern::parse(text)?;
            for (stem, regex) in pattern.inline_definitions() {
                match stems.get(stem) {
                    Some(existing) if existing != regex => {
                        return Err(EngineError::Config(format!(
                            "rule {} defines stem {} twice ('{}' and '{}')",
                            name, stem, existing, regex
                        )));
                    }
                    Some(_) => {}
                    None => {
                        stems.insert(stem.to_string(), regex.to_string());
                    }
                }
            }
            parsed.push((key.clone(), pattern, *side));
        }
        let job_stems: Vec<String> = parsed[0]
            .1
            .stem_names()
            .filter(|(_, star)| !star)
            .map(|(stem, _)| stem.to_string())
            .collect();
        let mut targets = Vec::new();
        for (key, pattern, side) in parsed {
            for (stem, star) in pattern.stem_names() {
                if !star && !job_stems.iter().any(|s| s == stem) {
                    return Err(EngineError::Config(format!(
                        "rule {}: target {} uses stem {} which the primary target does not bind",
                        name, key, stem
                    )));
                }
            }
            let compiled = pattern.compile(&stems)?;
            targets.push(TargetSpec { key, pattern, compiled, side });
        }
        let mut deps = Vec::new();
        for (key, text) in &self.base.deps {
            let pattern = Pattern::parse(text)?;
            for (stem, star) in pattern.stem_names() {
                if star || !job_stems.iter().any(|s| s == stem) {
                    return Err(EngineError::Config(format!(
                        "rule {}: dep {} uses stem {} which the primary target does not bind",
                        name, key, stem
                    )));
                }
            }
            deps.push((key.clone(), pattern));
        }
        let stdout_to_target = self.single_target && matches!(command, Command::Shell(_));
        let tmp = self.base.tmp.unwrap_or(TmpMode::Private);
        let backend = self.base.backend.unwrap_or_else(|| "local".to_string());

        let mut hasher = blake3::Hasher::new();
        hasher.update(name.as_bytes());
        hasher.update(format!("{:?}", command).as_bytes());
        for target in &targets {
            hasher.update(format!("{}={}/{}", target.key, target.pattern.text(), target.side).as_bytes());
        }
        for (key, pattern) in &deps {
            hasher.update(format!("{}={}", key, pattern.text()).as_bytes());
        }
        hasher.update(format!("{:?}{:?}{:?}{:?}", stems, self.base.link_support, tmp, self.base.environment).as_bytes());
        let fingerprint = hasher.finalize().to_hex().to_string();

        debug!(rule = %name, targets = targets.len(), deps = deps.len(), "Rule built");
        Ok(Rule {
            name,
            stems,
            targets,
            deps,
            command,
            autodep: self.base.autodep,
            backend,
            link_support: self.base.link_support,
            tmp,
            timeout: self.base.timeout,
            priority: self.base.priority.unwrap_or(0),
            stdout_to_target,
            environment: self.base.environment,
            fingerprint,
        })
    }
}

// ------------- Matcher -------------
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule: Arc<Rule>,
    pub stems: Stems,
}
impl RuleMatch {
    pub fn job_name(&self) -> Result<String> {
        self.rule.job_name(&self.stems)
    }
}

#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    /// Fails when some path would match targets of two rules with the same
    /// rank, leaving nothing to choose between them.
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        let rules: Vec<Arc<Rule>> = rules.into_iter().map(Arc::new).collect();
        let mut ranked: HashMap<(i32, usize, usize), Vec<(&str, &TargetSpec)>> = HashMap::new();
        for rule in &rules {
            if rules.iter().filter(|r| r.name == rule.name).count() > 1 {
                return Err(EngineError::Config(format!("rule name {} used twice", rule.name)));
            }
            for target in &rule.targets {
                let peers = ranked.entry(rank(&target.pattern, rule.priority)).or_default();
                for (other, spec) in peers.iter() {
                    if *other != rule.name && target.overlaps(spec)? {
                        return Err(EngineError::Config(format!(
                            "rules {} and {} are ambiguous for '{}' and '{}'",
                            other,
                            rule.name,
                            spec.pattern.text(),
                            target.pattern.text()
                        )));
                    }
                }
                peers.push((rule.name.as_str(), target));
            }
        }
        Ok(Self { rules })
    }
    pub fn rules(&self) -> &[Arc<Rule>] {
        &self.rules
    }
    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.iter().find(|r| r.name == name).cloned()
    }
    /// The most specific rule for `path`: highest priority, then longest
    /// fixed prefix, then most fixed text. Remaining ties go to the rule
    /// declared first.
    pub fn match_target(&self, path: &str) -> Option<RuleMatch> {
        let mut best: Option<((i32, usize, usize), RuleMatch)> = None;
        for rule in &self.rules {
            let Some((index, stems)) = rule.best_match(path) else { continue };
            let key = rank(&rule.targets[index].pattern, rule.priority);
            // targets of equal rank never overlap
            if best.as_ref().is_none_or(|(current, _)| *current < key) {
                best = Some((key, RuleMatch { rule: Arc::clone(rule), stems }));
            }
        }
        best.map(|(_, found)| found)
    }
    pub fn is_buildable(&self, path: &str) -> bool {
        self.match_target(path).is_some()
    }
    pub fn callbacks(&self) -> CallbackRegistry {
        let mut registry = CallbackRegistry::new();
        for rule in &self.rules {
            if let Command::Callback { name, func } = &rule.command {
                registry.register(name, Arc::clone(func));
            }
        }
        registry
    }
}
