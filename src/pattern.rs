//! Target and dependency patterns.
//!
//! A pattern is fixed text interleaved with stems, e.g. `obj/{File}.o` or
//! `{Dir:.*/}out/{*:.*}.txt`. Patterns are parsed with the grammar in
//! `pattern.pest` and compiled to an anchored [`regex::Regex`] for matching.
//! The `regex` crate has no back references, so a stem appearing more than
//! once gets one capture group per occurrence and the occurrences are
//! compared after the match.

use std::collections::{BTreeMap, HashSet};

use pest::Parser;
use pest_derive::Parser;
use regex::Regex;
use regex_automata::{Anchored, MatchKind};
use regex_automata::dfa::{Automaton, StartError, dense};
use regex_automata::util::start;

use crate::error::{EngineError, Result};

#[derive(Parser)]
#[grammar = "pattern.pest"]
struct PatternParser;

/// Stem name to value, for the stems that identify a job.
pub type Stems = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Fixed(String),
    Stem {
        name: Option<String>,
        star: bool,
        regex: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Pattern {
    text: String,
    segments: Vec<Segment>,
}

impl Pattern {
    pub fn parse(text: &str) -> Result<Self> {
        let mut parsed = PatternParser::parse(Rule::pattern, text)
            .map_err(|e| EngineError::Config(format!("bad pattern '{}': {}", text, e)))?;
        let mut segments: Vec<Segment> = Vec::new();
        let root = parsed
            .next()
            .ok_or_else(|| EngineError::Invariant("empty pattern parse".into()))?;
        for pair in root.into_inner() {
            let segment = match pair.as_rule() {
                Rule::lbrace => Segment::Fixed("{".into()),
                Rule::rbrace => Segment::Fixed("}".into()),
                Rule::fixed => Segment::Fixed(pair.as_str().to_string()),
                Rule::stem => {
                    let (mut name, mut star, mut regex) = (None, false, None);
                    for part in pair.into_inner() {
                        match part.as_rule() {
                            Rule::name => name = Some(part.as_str().to_string()),
                            Rule::star => star = true,
                            Rule::regex => regex = Some(part.as_str().to_string()),
                            _ => {}
                        }
                    }
                    if name.is_none() && !star {
                        return Err(EngineError::Config(format!("anonymous stem must be a star stem in '{}'", text)));
                    }
                    if matches!(regex.as_deref(), Some("")) {
                        return Err(EngineError::Config(format!("empty stem regex in '{}'", text)));
                    }
                    if name.is_none() && regex.is_none() {
                        return Err(EngineError::Config(format!("anonymous stem needs a regex in '{}'", text)));
                    }
                    Segment::Stem { name, star, regex }
                }
                _ => continue,
            };
            // adjacent fixed text (e.g. around an escaped brace) is merged
            match (segments.last_mut(), &segment) {
                (Some(Segment::Fixed(prev)), Segment::Fixed(next)) => prev.push_str(next),
                _ => segments.push(segment),
            }
        }
        Ok(Self { text: text.to_string(), segments })
    }
    pub fn text(&self) -> &str {
        &self.text
    }
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
    pub fn is_static(&self) -> bool {
        self.segments.iter().all(|s| matches!(s, Segment::Fixed(_)))
    }
    pub fn has_star(&self) -> bool {
        self.segments.iter().any(|s| matches!(s, Segment::Stem { star: true, .. }))
    }
    /// Length of the fixed text before the first stem.
    pub fn fixed_prefix_len(&self) -> usize {
        match self.segments.first() {
            Some(Segment::Fixed(text)) => text.len(),
            _ => 0,
        }
    }
    /// Total length of fixed text.
    pub fn fixed_len(&self) -> usize {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Fixed(text) => text.len(),
                _ => 0,
            })
            .sum()
    }
    /// Named stems, with whether they are star stems.
    pub fn stem_names(&self) -> impl Iterator<Item = (&str, bool)> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Stem { name: Some(name), star, .. } => Some((name.as_str(), *star)),
            _ => None,
        })
    }
    /// Inline stem definitions, `{Name:regex}`.
    pub fn inline_definitions(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.segments.iter().filter_map(|s| match s {
            Segment::Stem { name: Some(name), regex: Some(regex), .. } => Some((name.as_str(), regex.as_str())),
            _ => None,
        })
    }
    /// Fixed text before the first stem and after the last one. Two
    /// patterns whose fixed ends disagree cannot match the same path.
    pub fn fixed_ends(&self) -> (&str, &str) {
        let head = match self.segments.first() {
            Some(Segment::Fixed(text)) => text.as_str(),
            _ => "",
        };
        let tail = match self.segments.last() {
            Some(Segment::Fixed(text)) => text.as_str(),
            _ => "",
        };
        (head, tail)
    }
    /// Substitute stem values. Star stems cannot be expanded.
    pub fn expand(&self, stems: &Stems) -> Result<String> {
        let mut expanded = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Fixed(text) => expanded.push_str(text),
                Segment::Stem { name: Some(name), star: false, .. } => {
                    let value = stems.get(name).ok_or_else(|| {
                        EngineError::Config(format!("stem '{}' unbound in '{}'", name, self.text))
                    })?;
                    expanded.push_str(value);
                }
                Segment::Stem { .. } => {
                    return Err(EngineError::Config(format!("star stem cannot be expanded in '{}'", self.text)));
                }
            }
        }
        Ok(expanded)
    }
    /// Expand the non-star stems and keep star stems as matchable stems.
    pub fn bind(&self, stems: &Stems) -> Result<Pattern> {
        let mut segments = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Stem { name: Some(name), star: false, .. } => {
                    let value = stems.get(name).ok_or_else(|| {
                        EngineError::Config(format!("stem '{}' unbound in '{}'", name, self.text))
                    })?;
                    match segments.last_mut() {
                        Some(Segment::Fixed(prev)) => prev.push_str(value),
                        _ => segments.push(Segment::Fixed(value.clone())),
                    }
                }
                Segment::Fixed(text) => match segments.last_mut() {
                    Some(Segment::Fixed(prev)) => prev.push_str(text),
                    _ => segments.push(Segment::Fixed(text.clone())),
                },
                other => segments.push(other.clone()),
            }
        }
        let text = segments
            .iter()
            .map(|s| match s {
                Segment::Fixed(text) => text.replace('{', "{{").replace('}', "}}"),
                Segment::Stem { name, star, regex } => format!(
                    "{{{}{}{}}}",
                    name.as_deref().unwrap_or(""),
                    if *star { "*" } else { "" },
                    regex.as_ref().map(|r| format!(":{}", r)).unwrap_or_default()
                ),
            })
            .collect();
        Ok(Pattern { text, segments })
    }
    pub fn compile(&self, definitions: &BTreeMap<String, String>) -> Result<CompiledPattern> {
        let mut source = String::from("^");
        let mut groups = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Fixed(text) => source.push_str(&regex::escape(text)),
                Segment::Stem { name, star, regex } => {
                    let re = match (regex, name) {
                        (Some(re), _) => re.as_str(),
                        (None, Some(n)) => definitions.get(n).map(String::as_str).ok_or_else(|| {
                            EngineError::Config(format!("stem '{}' is not defined for '{}'", n, self.text))
                        })?,
                        (None, None) => {
                            return Err(EngineError::Invariant(format!("stem without regex in '{}'", self.text)));
                        }
                    };
                    let group = format!("_{}", groups.len());
                    source.push_str(&format!("(?P<{}>(?:{}))", group, re));
                    groups.push(StemGroup { group, name: name.clone(), star: *star });
                }
            }
        }
        source.push('$');
        let regex = Regex::new(&source)
            .map_err(|e| EngineError::Config(format!("bad stem regex in '{}': {}", self.text, e)))?;
        Ok(CompiledPattern { regex, groups, source })
    }
}

#[derive(Debug, Clone)]
struct StemGroup {
    group: String,
    name: Option<String>,
    star: bool,
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    regex: Regex,
    groups: Vec<StemGroup>,
    source: String,
}

impl CompiledPattern {
    /// The non-star stem bindings when `path` matches, with every
    /// occurrence of a stem bound to the same value.
    pub fn captures(&self, path: &str) -> Option<Stems> {
        let caps = self.regex.captures(path)?;
        let mut stems = Stems::new();
        let mut stars: BTreeMap<&str, &str> = BTreeMap::new();
        for group in &self.groups {
            let value = caps.name(&group.group).map_or("", |m| m.as_str());
            let Some(name) = group.name.as_deref() else { continue };
            if group.star {
                if stars.insert(name, value).is_some_and(|previous| previous != value) {
                    return None;
                }
            } else if let Some(previous) = stems.get(name) {
                if previous != value {
                    return None;
                }
            } else {
                stems.insert(name.to_string(), value.to_string());
            }
        }
        Some(stems)
    }
    pub fn is_match(&self, path: &str) -> bool {
        self.captures(path).is_some()
    }

    /// Whether some path matches both patterns. Repeated stems are not
    /// required to agree here, so this may claim an overlap the stem
    /// comparison in [`captures`](Self::captures) would rule out.
    pub fn overlaps(&self, other: &CompiledPattern) -> Result<bool> {
        let (a, b) = (self.automaton()?, other.automaton()?);
        let anchored = start::Config::new().anchored(Anchored::Yes);
        let bad_start = |e: StartError| EngineError::Invariant(format!("cannot start pattern automaton: {}", e));
        let first = (a.start_state(&anchored).map_err(bad_start)?, b.start_state(&anchored).map_err(bad_start)?);
        let mut seen = HashSet::from([first]);
        let mut pending = vec![first];
        // walk both automata in lockstep until both accept at the end
        while let Some((sa, sb)) = pending.pop() {
            if a.is_match_state(a.next_eoi_state(sa)) && b.is_match_state(b.next_eoi_state(sb)) {
                return Ok(true);
            }
            for byte in 0..=u8::MAX {
                let next = (a.next_state(sa, byte), b.next_state(sb, byte));
                if a.is_dead_state(next.0) || b.is_dead_state(next.1) {
                    continue;
                }
                if seen.insert(next) {
                    pending.push(next);
                }
            }
        }
        Ok(false)
    }
    fn automaton(&self) -> Result<dense::DFA<Vec<u32>>> {
        dense::Builder::new()
            .configure(dense::Config::new().match_kind(MatchKind::All))
            .build(&self.source)
            .map_err(|e| EngineError::Config(format!("cannot compare pattern '{}': {}", self.source, e)))
    }
}

/// Replace `{Name}` occurrences for which `lookup` has a value. Anything
/// else, such as shell `${VAR}`, is left untouched. `{{` and `}}` become
/// single braces.
pub fn substitute<'a>(text: &str, lookup: impl Fn(&str) -> Option<&'a str>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("{{") || tail.starts_with("}}") {
            out.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if let Some(end) = tail.find('}').filter(|_| tail.starts_with('{')) {
            if let Some(value) = lookup(&tail[1..end]) {
                out.push_str(value);
                rest = &tail[end + 1..];
                continue;
            }
        }
        out.push_str(&tail[..1]);
        rest = &tail[1..];
    }
    out.push_str(rest);
    out
}
