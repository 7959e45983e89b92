//! Canonical program model, identity keys and change computation for the bug bounty watcher.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "bbw-core";

/// Scope entries keyed by scope ID. Values are human readable descriptions.
pub type ScopeMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    HackerOne,
    Bugcrowd,
    Intigriti,
}

impl Platform {
    /// Processing order for a run.
    pub const ALL: [Platform; 3] = [Platform::HackerOne, Platform::Bugcrowd, Platform::Intigriti];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::HackerOne => "hackerone",
            Platform::Bugcrowd => "bugcrowd",
            Platform::Intigriti => "intigriti",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseError {
    kind: &'static str,
    value: String,
}

impl FromStr for Platform {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ParseError {
                kind: "platform",
                value: s.to_string(),
            })
    }
}

/// `Rdp` programs pay bounties, `Vdp` programs only accept disclosures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgramType {
    Vdp,
    Rdp,
}

impl ProgramType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramType::Vdp => "vdp",
            ProgramType::Rdp => "rdp",
        }
    }
}

impl fmt::Display for ProgramType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgramType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vdp" => Ok(ProgramType::Vdp),
            "rdp" => Ok(ProgramType::Rdp),
            other => Err(ParseError {
                kind: "program type",
                value: other.to_string(),
            }),
        }
    }
}

/// Bounty range exactly as the upstream listing spells it. Never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Reward {
    pub min: String,
    pub max: String,
}

/// Canonical, platform-agnostic program listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    pub url: String,
    #[serde(rename = "type")]
    pub program_type: ProgramType,
    pub key: String,
    pub platform: Platform,
    pub logo: String,
    pub scope: ScopeMap,
    pub reward: Option<Reward>,
}

impl Program {
    pub fn new(
        platform: Platform,
        name: impl Into<String>,
        url: impl Into<String>,
        program_type: ProgramType,
        logo: impl Into<String>,
        scope: ScopeMap,
        reward: Option<Reward>,
    ) -> Self {
        let name = name.into();
        let url = url.into();
        let key = program_key(&name, &url);
        Self {
            name,
            url,
            program_type,
            key,
            platform,
            logo: logo.into(),
            scope,
            reward,
        }
    }

    pub fn scope_descriptions(&self) -> Vec<String> {
        self.scope.values().cloned().collect()
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable identity for a program: SHA-256 over `name|url`, no normalization.
pub fn program_key(name: &str, url: &str) -> String {
    sha256_hex(format!("{name}|{url}").as_bytes())
}

/// Scope IDs are derived from the description so that the diff key is the description itself
/// and reordered upstream target lists produce no delta.
pub fn scope_id(description: &str) -> String {
    let mut digest = sha256_hex(description.as_bytes());
    digest.truncate(16);
    digest
}

pub fn scope_from_descriptions<I>(descriptions: I) -> ScopeMap
where
    I: IntoIterator<Item = String>,
{
    descriptions
        .into_iter()
        .map(|description| (scope_id(&description), description))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeChange {
    pub old: String,
    pub new: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScopeDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<ScopeChange>,
}

impl ScopeDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Exact ID matching between two scope mappings. Output order is not part of the contract.
pub fn diff_scopes(previous: &ScopeMap, current: &ScopeMap) -> ScopeDiff {
    let mut diff = ScopeDiff::default();

    for (id, description) in current {
        match previous.get(id) {
            None => diff.added.push(description.clone()),
            Some(old) if old != description => diff.changed.push(ScopeChange {
                old: old.clone(),
                new: description.clone(),
            }),
            Some(_) => {}
        }
    }

    for (id, description) in previous {
        if !current.contains_key(id) {
            diff.removed.push(description.clone());
        }
    }

    diff
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    New,
    Updated,
    Removed,
}

/// A detected change for one program. Produced by reconciliation, consumed by sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub program: Program,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub new_scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changed_scope: Vec<ScopeChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_type: Option<ProgramType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward: Option<Reward>,
}

fn reward_pair(reward: &Option<Reward>) -> (&str, &str) {
    reward
        .as_ref()
        .map(|r| (r.min.as_str(), r.max.as_str()))
        .unwrap_or(("", ""))
}

impl ChangeEvent {
    /// A first sighting carries the whole current scope, not a delta.
    pub fn added(program: Program) -> Self {
        let new_scope = program.scope_descriptions();
        Self {
            program,
            kind: ChangeKind::New,
            new_scope,
            removed_scope: Vec::new(),
            changed_scope: Vec::new(),
            new_type: None,
            reward: None,
        }
    }

    pub fn removed(program: Program) -> Self {
        Self {
            program,
            kind: ChangeKind::Removed,
            new_scope: Vec::new(),
            removed_scope: Vec::new(),
            changed_scope: Vec::new(),
            new_type: None,
            reward: None,
        }
    }

    /// Tracked-field delta between the stored record and the current one.
    /// `None` means nothing tracked changed and no write is due.
    pub fn between(previous: &Program, current: &Program) -> Option<Self> {
        let scope = diff_scopes(&previous.scope, &current.scope);
        let new_type = (previous.program_type != current.program_type).then_some(current.program_type);
        let reward = (reward_pair(&previous.reward) != reward_pair(&current.reward))
            .then(|| current.reward.clone().unwrap_or_default());

        if scope.is_empty() && new_type.is_none() && reward.is_none() {
            return None;
        }

        Some(Self {
            program: current.clone(),
            kind: ChangeKind::Updated,
            new_scope: scope.added,
            removed_scope: scope.removed,
            changed_scope: scope.changed,
            new_type,
            reward,
        })
    }

    pub fn is_new(&self) -> bool {
        self.kind == ChangeKind::New
    }

    pub fn is_removed(&self) -> bool {
        self.kind == ChangeKind::Removed
    }

    /// One plain line for text transports.
    pub fn summary(&self) -> String {
        let p = &self.program;
        let mut line = match self.kind {
            ChangeKind::New => format!("[{}] new program: {} ({}) {}", p.platform, p.name, p.program_type, p.url),
            ChangeKind::Updated => format!("[{}] program updated: {} {}", p.platform, p.name, p.url),
            ChangeKind::Removed => format!("[{}] program removed: {} ({})", p.platform, p.name, p.program_type),
        };
        if !self.new_scope.is_empty() {
            line.push_str(&format!(" | +{} scope: {}", self.new_scope.len(), scope_excerpt(&self.new_scope)));
        }
        if !self.removed_scope.is_empty() {
            line.push_str(&format!(
                " | -{} scope: {}",
                self.removed_scope.len(),
                scope_excerpt(&self.removed_scope)
            ));
        }
        if !self.changed_scope.is_empty() {
            line.push_str(&format!(" | ~{} scope", self.changed_scope.len()));
        }
        if let Some(new_type) = self.new_type {
            line.push_str(&format!(" | type -> {new_type}"));
        }
        if let Some(reward) = &self.reward {
            line.push_str(&format!(" | bounty {} - {}", reward.min, reward.max));
        }
        truncate_chars(line, SUMMARY_MAX_CHARS)
    }
}

/// Scope entries listed by name in a summary; the rest are counted.
pub const SUMMARY_SCOPE_ITEMS: usize = 5;

/// Upper bound on a summary line, below Discord's 2000-character message limit.
pub const SUMMARY_MAX_CHARS: usize = 1900;

fn scope_excerpt(scope: &[String]) -> String {
    let mut text = scope
        .iter()
        .take(SUMMARY_SCOPE_ITEMS)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if scope.len() > SUMMARY_SCOPE_ITEMS {
        text.push_str(&format!(" ... and {} more", scope.len() - SUMMARY_SCOPE_ITEMS));
    }
    text
}

fn truncate_chars(mut text: String, max_chars: usize) -> String {
    if let Some((cut, _)) = text.char_indices().nth(max_chars.saturating_sub(3)) {
        if text.chars().count() > max_chars {
            text.truncate(cut);
            text.push_str("...");
        }
    }
    text
}

/// Process-wide run mode. `first_run` holds iff the store was empty at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunContext {
    pub first_run: bool,
}

/// Per-platform subscription flags as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFlags {
    #[serde(default)]
    pub new_program: bool,
    #[serde(default)]
    pub removed_program: bool,
    #[serde(default)]
    pub new_scope: bool,
    #[serde(default)]
    pub removed_scope: bool,
    #[serde(default)]
    pub changed_scope: bool,
    #[serde(default)]
    pub new_type: bool,
    #[serde(default = "default_true")]
    pub reward_change: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NotificationFlags {
    fn default() -> Self {
        Self {
            new_program: false,
            removed_program: false,
            new_scope: false,
            removed_scope: false,
            changed_scope: false,
            new_type: false,
            reward_change: true,
        }
    }
}

impl NotificationFlags {
    pub fn all() -> Self {
        Self {
            new_program: true,
            removed_program: true,
            new_scope: true,
            removed_scope: true,
            changed_scope: true,
            new_type: true,
            reward_change: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn scope(entries: &[(&str, &str)]) -> ScopeMap {
        entries
            .iter()
            .map(|(id, d)| (id.to_string(), d.to_string()))
            .collect()
    }

    fn as_set(values: &[String]) -> BTreeSet<&str> {
        values.iter().map(String::as_str).collect()
    }

    fn program(name: &str, url: &str, scope: ScopeMap) -> Program {
        Program::new(
            Platform::HackerOne,
            name,
            url,
            ProgramType::Vdp,
            "https://logo.example/x.png",
            scope,
            None,
        )
    }

    #[test]
    fn program_key_is_stable_sha256_hex() {
        let key = program_key("Acme", "https://hackerone.com/acme");
        assert_eq!(key, "6ee3f84bad574d0f551d24d4ca4a52e0e03be38acb7845128fdb632ae6d6ce9c");
        assert_eq!(key, program_key("Acme", "https://hackerone.com/acme"));
        assert_eq!(key.len(), 64);
    }

    #[test]
    fn program_key_does_not_normalize_spelling() {
        let base = program_key("Acme", "https://hackerone.com/acme");
        assert_ne!(base, program_key("acme", "https://hackerone.com/acme"));
        assert_ne!(base, program_key("Acme ", "https://hackerone.com/acme"));
        assert_ne!(base, program_key("Acme", "https://hackerone.com/acme/"));
        // no escaping: a separator inside a field yields the same hashed text
        assert_eq!(program_key("a|b", "c"), program_key("a", "b|c"));
    }

    #[test]
    fn identical_identity_collapses_to_same_key() {
        let a = program("Acme", "https://x", BTreeMap::new());
        let mut b = program("Acme", "https://x", scope(&[("s", "api.acme.com (URL)")]));
        b.program_type = ProgramType::Rdp;
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn scope_delta_reports_added_entry_only() {
        let previous = scope(&[("t-0", "api.foo.com (URL)")]);
        let current = scope(&[("t-0", "api.foo.com (URL)"), ("t-1", "app.foo.com (URL)")]);
        let diff = diff_scopes(&previous, &current);
        assert_eq!(diff.added, vec!["app.foo.com (URL)".to_string()]);
        assert!(diff.removed.is_empty());
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn scope_diff_is_disjoint_and_exhaustive() {
        let previous = scope(&[("a", "keep"), ("b", "gone"), ("c", "before"), ("d", "gone too")]);
        let current = scope(&[("a", "keep"), ("c", "after"), ("e", "fresh"), ("f", "fresh too")]);
        let diff = diff_scopes(&previous, &current);

        assert_eq!(as_set(&diff.added), BTreeSet::from(["fresh", "fresh too"]));
        assert_eq!(as_set(&diff.removed), BTreeSet::from(["gone", "gone too"]));
        assert_eq!(
            diff.changed,
            vec![ScopeChange {
                old: "before".into(),
                new: "after".into()
            }]
        );
    }

    #[test]
    fn scope_diff_of_identical_maps_is_empty() {
        let s = scope(&[("a", "x (URL)"), ("b", "y (URL)")]);
        assert!(diff_scopes(&s, &s).is_empty());
        assert!(diff_scopes(&BTreeMap::new(), &BTreeMap::new()).is_empty());
    }

    #[test]
    fn description_derived_ids_ignore_upstream_order() {
        let first = scope_from_descriptions(vec!["a.com (URL)".to_string(), "b.com (URL)".to_string()]);
        let second = scope_from_descriptions(vec!["b.com (URL)".to_string(), "a.com (URL)".to_string()]);
        assert_eq!(first, second);
        assert!(diff_scopes(&first, &second).is_empty());
        assert_eq!(scope_id("a.com (URL)").len(), 16);
    }

    #[test]
    fn edited_description_is_removal_plus_addition() {
        let before = scope_from_descriptions(vec!["a.com (URL)".to_string()]);
        let after = scope_from_descriptions(vec!["a.com (WILDCARD)".to_string()]);
        let diff = diff_scopes(&before, &after);
        assert_eq!(diff.added, vec!["a.com (WILDCARD)".to_string()]);
        assert_eq!(diff.removed, vec!["a.com (URL)".to_string()]);
        assert!(diff.changed.is_empty());
    }

    #[test]
    fn added_event_carries_entire_scope() {
        let p = program("Acme", "https://x", scope(&[("1", "a (URL)"), ("2", "b (URL)")]));
        let event = ChangeEvent::added(p);
        assert!(event.is_new());
        assert!(!event.is_removed());
        assert_eq!(as_set(&event.new_scope), BTreeSet::from(["a (URL)", "b (URL)"]));
    }

    #[test]
    fn between_unchanged_records_is_none() {
        let p = program("Acme", "https://x", scope(&[("1", "a (URL)")]));
        let mut q = p.clone();
        q.logo = "https://elsewhere/logo.png".into();
        assert!(ChangeEvent::between(&p, &q).is_none());
    }

    #[test]
    fn between_reports_type_and_reward_changes() {
        let previous = program("Acme", "https://x", BTreeMap::new());
        let mut current = previous.clone();
        current.program_type = ProgramType::Rdp;
        current.reward = Some(Reward {
            min: "100".into(),
            max: "5000".into(),
        });

        let event = ChangeEvent::between(&previous, &current).expect("delta");
        assert_eq!(event.kind, ChangeKind::Updated);
        assert_eq!(event.new_type, Some(ProgramType::Rdp));
        assert_eq!(event.reward.as_ref().map(|r| r.max.as_str()), Some("5000"));
        assert!(event.new_scope.is_empty());
    }

    #[test]
    fn absent_reward_equals_empty_reward_pair() {
        let previous = program("Acme", "https://x", BTreeMap::new());
        let mut current = previous.clone();
        current.reward = Some(Reward::default());
        assert!(ChangeEvent::between(&previous, &current).is_none());
    }

    #[test]
    fn event_serializes_kind_and_skips_empty_fields() {
        let event = ChangeEvent::removed(program("Acme", "https://x", BTreeMap::new()));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "removed");
        assert_eq!(value["program"]["type"], "vdp");
        assert_eq!(value["program"]["platform"], "hackerone");
        assert!(value.get("new_scope").is_none());
        assert!(value.get("reward").is_none());
    }

    #[test]
    fn summary_mentions_scope_changes() {
        let previous = program("Acme", "https://x", scope_from_descriptions(vec!["a (URL)".into()]));
        let current = program("Acme", "https://x", scope_from_descriptions(vec!["b (URL)".into()]));
        let line = ChangeEvent::between(&previous, &current).unwrap().summary();
        assert_eq!(
            line,
            "[hackerone] program updated: Acme https://x | +1 scope: b (URL) | -1 scope: a (URL)"
        );
    }

    #[test]
    fn summary_caps_large_scope_lists() {
        let descriptions = (0..120).map(|i| format!("asset-{i:03}.example.com (URL)"));
        let event = ChangeEvent::added(program("Acme", "https://x", scope_from_descriptions(descriptions)));

        let line = event.summary();
        assert!(line.chars().count() <= SUMMARY_MAX_CHARS);
        assert!(line.contains("+120 scope: "));
        assert!(line.ends_with(" ... and 115 more"));
        assert_eq!(line.matches(".example.com (URL)").count(), SUMMARY_SCOPE_ITEMS);
    }

    #[test]
    fn summary_is_bounded_even_for_huge_descriptions() {
        let huge = "x".repeat(5000);
        let event = ChangeEvent::added(program("Acme", "https://x", scope_from_descriptions([huge])));

        let line = event.summary();
        assert_eq!(line.chars().count(), SUMMARY_MAX_CHARS);
        assert!(line.ends_with("..."));
    }

    #[test]
    fn platform_round_trips_through_str() {
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
        assert!("yeswehack".parse::<Platform>().is_err());
        assert_eq!("rdp".parse::<ProgramType>().unwrap(), ProgramType::Rdp);
    }

    #[test]
    fn missing_flags_default_off_except_reward() {
        let flags: NotificationFlags = serde_json::from_str(r#"{"new_program": true}"#).unwrap();
        assert!(flags.new_program);
        assert!(!flags.removed_program);
        assert!(!flags.new_scope);
        assert!(flags.reward_change);
        assert!(NotificationFlags::default().reward_change);
    }
}
