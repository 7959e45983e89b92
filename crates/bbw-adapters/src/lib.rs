//! Per-platform canonicalizers: raw upstream listing records in, canonical programs out.

use bbw_core::{scope_from_descriptions, Platform, Program, ProgramType, Reward, ScopeMap};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "bbw-adapters";

pub const HACKERONE_DEFAULT_LOGO: &str = "https://asset.brandfetch.io/idhUp0l1vN/id7Vk4WqZc.png";
pub const BUGCROWD_DEFAULT_LOGO: &str = "https://asset.brandfetch.io/idZPL+3f8a/idw6hFgY3p.png";
pub const INTIGRITI_DEFAULT_LOGO: &str = "https://api.intigriti.com/file/api/file/public_bucket_d23a1f29-c2fe-4d03-8daf-df24d1e076ea-c2449aa2-3a08-4bf5-a430-441a11020851";

/// HackerOne serves this bucket for programs that never uploaded a picture.
const HACKERONE_UNSET_LOGO_MARKER: &str = "hackerone-us-west-2-p";

/// A record that cannot become a program. The record is skipped, the snapshot is not.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CanonicalizeError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record has no name")]
    MissingName,
    #[error("program {name:?} has no resolvable url")]
    MissingUrl { name: String },
}

pub trait Canonicalizer: Send + Sync {
    fn platform(&self) -> Platform;

    /// Raw program records of a decoded snapshot, in source order.
    fn records<'a>(&self, snapshot: &'a JsonValue) -> Vec<&'a JsonValue> {
        root_array(snapshot)
    }

    fn canonicalize(&self, raw: &JsonValue) -> Result<Program, CanonicalizeError>;
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<JsonValue, serde_json::Error> {
    serde_json::from_slice(bytes)
}

pub fn canonicalizer_for(platform: Platform) -> Box<dyn Canonicalizer> {
    match platform {
        Platform::HackerOne => Box::new(HackerOneCanonicalizer),
        Platform::Bugcrowd => Box::new(BugcrowdCanonicalizer),
        Platform::Intigriti => Box::new(IntigritiCanonicalizer),
    }
}

fn root_array(snapshot: &JsonValue) -> Vec<&JsonValue> {
    snapshot
        .as_array()
        .map(|records| records.iter().collect())
        .unwrap_or_default()
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    (!cur.is_null()).then_some(cur)
}

/// Key presence, counting an explicit `null` as present.
fn json_has(value: &JsonValue, path: &[&str]) -> bool {
    let mut cur = value;
    for segment in path {
        match cur.get(*segment) {
            Some(next) => cur = next,
            None => return false,
        }
    }
    true
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// Loose boolean used by upstream indicator fields.
fn json_truthy(value: &JsonValue, path: &[&str]) -> bool {
    match json_at(value, path) {
        Some(JsonValue::Bool(b)) => *b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(JsonValue::String(s)) => matches!(s.as_str(), "1" | "t" | "T" | "true" | "TRUE" | "True"),
        _ => false,
    }
}

/// Opaque text of a field: strings verbatim, everything else as compact JSON.
fn json_text(value: &JsonValue, path: &[&str]) -> String {
    match json_at(value, path) {
        None => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn describe(name: &str, kind: Option<&str>) -> String {
    format!("{} ({})", name, kind.unwrap_or("unknown"))
}

fn resolve_logo<'a>(
    candidates: impl IntoIterator<Item = Option<&'a str>>,
    unset_marker: Option<&str>,
    default_logo: &str,
) -> String {
    candidates
        .into_iter()
        .flatten()
        .next()
        .filter(|logo| unset_marker.map_or(true, |marker| !logo.contains(marker)))
        .unwrap_or(default_logo)
        .to_string()
}

type ScopeStrategy = fn(&JsonValue) -> Vec<String>;

/// First strategy with at least one entry wins; none yields the empty scope.
fn first_yielding_scope(raw: &JsonValue, strategies: &[ScopeStrategy]) -> ScopeMap {
    strategies
        .iter()
        .map(|strategy| strategy(raw))
        .find(|descriptions| !descriptions.is_empty())
        .map(scope_from_descriptions)
        .unwrap_or_default()
}

fn domain_scope(raw: &JsonValue) -> Vec<String> {
    json_array(raw, &["domains"])
        .iter()
        .filter_map(|d| d.as_str().map(str::trim).filter(|s| !s.is_empty()))
        .map(|d| format!("{d} (domain)"))
        .collect()
}

/// Object target with the first present name field, or a bare string target.
fn named_target(target: &JsonValue, name_fields: &[&str]) -> Option<String> {
    if let Some(bare) = target.as_str().map(str::trim).filter(|s| !s.is_empty()) {
        return Some(describe(bare, None));
    }
    let name = name_fields.iter().find_map(|field| json_str(target, &[field]))?;
    Some(describe(name, json_str(target, &["type"])))
}

fn require_name(raw: &JsonValue) -> Result<&str, CanonicalizeError> {
    if !raw.is_object() {
        return Err(CanonicalizeError::NotAnObject);
    }
    json_str(raw, &["name"]).ok_or(CanonicalizeError::MissingName)
}

fn missing_url(name: &str) -> CanonicalizeError {
    CanonicalizeError::MissingUrl {
        name: name.to_string(),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HackerOneCanonicalizer;

impl HackerOneCanonicalizer {
    fn asset(target: &JsonValue) -> Option<String> {
        let asset = json_str(target, &["asset_identifier"]).or_else(|| json_str(target, &["asset"]))?;
        Some(describe(asset, json_str(target, &["type"])))
    }

    fn in_scope_targets(raw: &JsonValue) -> Vec<String> {
        json_array(raw, &["targets", "in_scope"])
            .iter()
            .filter_map(Self::asset)
            .collect()
    }

    fn eligible_targets(raw: &JsonValue) -> Vec<String> {
        json_array(raw, &["targets"])
            .iter()
            .filter(|t| json_truthy(t, &["eligible_for_submission"]))
            .filter_map(Self::asset)
            .collect()
    }
}

impl Canonicalizer for HackerOneCanonicalizer {
    fn platform(&self) -> Platform {
        Platform::HackerOne
    }

    fn records<'a>(&self, snapshot: &'a JsonValue) -> Vec<&'a JsonValue> {
        let root = root_array(snapshot);
        if !root.is_empty() {
            return root;
        }
        json_array(snapshot, &["data"]).iter().collect()
    }

    fn canonicalize(&self, raw: &JsonValue) -> Result<Program, CanonicalizeError> {
        let name = require_name(raw)?;
        let url = match json_str(raw, &["url"]) {
            Some(url) => url.to_string(),
            None => json_str(raw, &["handle"])
                .map(|handle| format!("https://hackerone.com/{handle}"))
                .ok_or_else(|| missing_url(name))?,
        };

        let logo = resolve_logo(
            [json_str(raw, &["profile_picture"])],
            Some(HACKERONE_UNSET_LOGO_MARKER),
            HACKERONE_DEFAULT_LOGO,
        );
        let program_type = if json_truthy(raw, &["offers_bounties"]) {
            ProgramType::Rdp
        } else {
            ProgramType::Vdp
        };
        let scope = first_yielding_scope(
            raw,
            &[Self::in_scope_targets, Self::eligible_targets, domain_scope],
        );

        Ok(Program::new(Platform::HackerOne, name, url, program_type, logo, scope, None))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BugcrowdCanonicalizer;

impl BugcrowdCanonicalizer {
    fn targets(raw: &JsonValue) -> Vec<String> {
        json_array(raw, &["targets"])
            .iter()
            .filter_map(|t| named_target(t, &["name", "target"]))
            .collect()
    }

    fn target_groups(raw: &JsonValue) -> Vec<String> {
        json_array(raw, &["target_groups"])
            .iter()
            .flat_map(|group| json_array(group, &["targets"]))
            .filter_map(|t| named_target(t, &["name"]))
            .collect()
    }
}

impl Canonicalizer for BugcrowdCanonicalizer {
    fn platform(&self) -> Platform {
        Platform::Bugcrowd
    }

    fn canonicalize(&self, raw: &JsonValue) -> Result<Program, CanonicalizeError> {
        let name = require_name(raw)?;
        let url = match json_str(raw, &["url"]) {
            Some(url) => url.to_string(),
            None => json_str(raw, &["briefUrl"])
                .map(|brief| {
                    let sep = if brief.starts_with('/') { "" } else { "/" };
                    format!("https://bugcrowd.com{sep}{brief}")
                })
                .ok_or_else(|| missing_url(name))?,
        };

        let logo = resolve_logo(
            [json_str(raw, &["logo"]), json_str(raw, &["logoUrl"])],
            None,
            BUGCROWD_DEFAULT_LOGO,
        );
        let pays = json_truthy(raw, &["offers_bounties"])
            || json_truthy(raw, &["bounty"])
            || json_has(raw, &["max_bounty"]);
        let (program_type, reward) = if pays {
            let reward = Reward {
                min: json_text(raw, &["min_bounty"]),
                max: json_text(raw, &["max_bounty"]),
            };
            (ProgramType::Rdp, Some(reward))
        } else {
            (ProgramType::Vdp, None)
        };
        let scope = first_yielding_scope(raw, &[Self::targets, Self::target_groups, domain_scope]);

        Ok(Program::new(Platform::Bugcrowd, name, url, program_type, logo, scope, reward))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntigritiCanonicalizer;

impl IntigritiCanonicalizer {
    const NAME_FIELDS: [&'static str; 3] = ["name", "endpoint", "target"];

    fn nested_in_scope(raw: &JsonValue) -> Vec<String> {
        json_array(raw, &["targets", "in_scope"])
            .iter()
            .filter(|t| t.is_object())
            .filter_map(|t| named_target(t, &Self::NAME_FIELDS))
            .collect()
    }

    fn flat_in_scope(raw: &JsonValue) -> Vec<String> {
        json_array(raw, &["in_scope"])
            .iter()
            .filter_map(|t| named_target(t, &Self::NAME_FIELDS))
            .collect()
    }
}

impl Canonicalizer for IntigritiCanonicalizer {
    fn platform(&self) -> Platform {
        Platform::Intigriti
    }

    fn canonicalize(&self, raw: &JsonValue) -> Result<Program, CanonicalizeError> {
        let name = require_name(raw)?;
        let url = json_str(raw, &["url"]).ok_or_else(|| missing_url(name))?;

        let logo = resolve_logo([json_str(raw, &["logo"])], None, INTIGRITI_DEFAULT_LOGO);
        let pays = json_has(raw, &["maxBounty"]) || json_truthy(raw, &["bounty"]);
        let (program_type, reward) = if pays {
            let reward = Reward {
                min: json_text(raw, &["minBounty"]),
                max: json_text(raw, &["maxBounty"]),
            };
            (ProgramType::Rdp, Some(reward))
        } else {
            (ProgramType::Vdp, None)
        };
        let scope = first_yielding_scope(
            raw,
            &[Self::nested_in_scope, Self::flat_in_scope, domain_scope],
        );

        Ok(Program::new(Platform::Intigriti, name, url, program_type, logo, scope, reward))
    }
}
