//! ModelRouter (spec §4.4): resolves task -> model tier, probes
//! provider health, and classifies task complexity.
//!
//! New component -- the teacher has no model-tier concept beyond a
//! `requested_harness`/`assigned_harness` string pair. The name-keyed
//! `Arc<dyn Trait>` lookup shape is grounded on `harness::registry::
//! HarnessRegistry`; the HTTP health probe borrows `reqwest` the way
//! the pack's `hoffmang9-WesoForge` example does (the teacher itself
//! never calls out to a provider API).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;

/// A symbolic capability tier. `Contest` is a sentinel the Dispatcher
/// recognizes and hands off to an out-of-core fan-out subsystem rather
/// than a concrete model to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Haiku,
    Sonnet,
    Opus,
    Contest,
}

impl Tier {
    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Haiku => Some(Tier::Sonnet),
            Tier::Sonnet => Some(Tier::Opus),
            Tier::Opus | Tier::Contest => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Tier::Haiku => "haiku",
            Tier::Sonnet => "sonnet",
            Tier::Opus => "opus",
            Tier::Contest => "CONTEST",
        };
        f.write_str(s)
    }
}

/// Resolution inputs, in decreasing precedence (spec §4.4).
#[derive(Debug, Clone, Default)]
pub struct TierResolutionInput<'a> {
    /// (1) An explicit per-task override, set by an operator annotation
    /// or CLI flag.
    pub explicit_override: Option<Tier>,
    /// (2) A tier named in the agent-definition frontmatter the task
    /// targets, if any.
    pub frontmatter_tier: Option<Tier>,
    /// (3) A learned recommendation, pre-computed from historical
    /// task-type success rates (only trusted when the caller has
    /// already checked the sample-size/success-rate thresholds).
    pub learned_recommendation: Option<Tier>,
    /// (4) Free-text description and tags, fed to the keyword
    /// classifier if nothing more specific applies.
    pub description: &'a str,
    pub tags: &'a [String],
}

/// Resolve a task to a concrete tier via the five-step precedence
/// chain: explicit override, frontmatter, learned recommendation,
/// keyword classifier, hard-coded default.
pub fn resolve_tier(input: &TierResolutionInput<'_>) -> Tier {
    input
        .explicit_override
        .or(input.frontmatter_tier)
        .or(input.learned_recommendation)
        .unwrap_or_else(|| classify_complexity(input.description, input.tags))
}

const SIMPLE_TAGS: &[&str] = &["trivial", "simple"];
const COMPLEX_TAGS: &[&str] = &["complex"];

const COMPLEX_KEYWORDS: &[&str] = &[
    "module-level refactor",
    "architecture",
    "redesign",
    "migrate",
    "rewrite",
    "cross-cutting",
];
const SIMPLE_KEYWORDS: &[&str] = &["typo", "rename", "bump version", "update comment", "function refactor"];

/// Deterministic keyword complexity classifier. A pure function of
/// (description, tags) -- no I/O. Explicit tags outrank keywords;
/// ambiguous matches (e.g. description mentions both a module-level and
/// a function-level refactor) resolve to the higher tier.
pub fn classify_complexity(description: &str, tags: &[String]) -> Tier {
    let tags_lower: Vec<String> = tags.iter().map(|t| t.to_lowercase()).collect();

    if tags_lower.iter().any(|t| COMPLEX_TAGS.contains(&t.as_str())) {
        return Tier::Opus;
    }
    if tags_lower.iter().any(|t| SIMPLE_TAGS.contains(&t.as_str())) {
        return Tier::Haiku;
    }

    let desc_lower = description.to_lowercase();
    let is_complex = COMPLEX_KEYWORDS.iter().any(|k| desc_lower.contains(k));
    let is_simple = SIMPLE_KEYWORDS.iter().any(|k| desc_lower.contains(k));

    match (is_complex, is_simple) {
        (true, _) => Tier::Opus,
        (false, true) => Tier::Haiku,
        (false, false) => Tier::Sonnet,
    }
}

/// Outcome of a health probe against a resolved model/provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unavailable,
    RateLimited,
    KeyInvalidOrCreditsExhausted,
}

#[derive(Debug, Deserialize)]
struct ModelListResponse {
    #[allow(dead_code)]
    data: Vec<serde_json::Value>,
}

struct CacheEntry {
    status: HealthStatus,
    checked_at: Instant,
}

/// Two-tier health check: a fast HTTP probe of the provider's
/// model-listing endpoint, cached for a short TTL, falling back to a
/// short CLI probe (`curl`) when the HTTP probe is inconclusive --
/// connection-level failures a proxy or system cert store might still
/// get through on, as opposed to a clean 4xx the provider itself sent.
/// A process-level fast-path bit, reset once per pulse via
/// [`HealthChecker::start_pulse`], short-circuits every repeat check
/// within the same pulse regardless of whether the TTL has lapsed.
pub struct HealthChecker {
    client: reqwest::Client,
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
    pulse_fast_path: Mutex<HashMap<String, HealthStatus>>,
}

impl HealthChecker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            ttl,
            cache: Mutex::new(HashMap::new()),
            pulse_fast_path: Mutex::new(HashMap::new()),
        }
    }

    /// Clear the process-level fast-path bit. Call once at the start of
    /// each pulse so a provider found healthy early in a pulse doesn't
    /// get silently re-trusted into the next one.
    pub fn start_pulse(&self) {
        self.pulse_fast_path.lock().unwrap().clear();
    }

    /// Check the health of `model`, consulting the per-pulse fast path
    /// first, then the TTL cache, then the HTTP probe (with CLI
    /// fallback).
    pub async fn check(&self, model: &str, api_base: &str, api_key: &str) -> HealthStatus {
        if let Some(status) = self.pulse_fast_path.lock().unwrap().get(model).copied() {
            return status;
        }
        if let Some(cached) = self.cached(model) {
            self.pulse_fast_path.lock().unwrap().insert(model.to_string(), cached);
            return cached;
        }

        let mut status = self.probe_http(model, api_base, api_key).await;
        if status == HealthStatus::Unavailable {
            if let Some(fallback) = self.probe_cli(api_base).await {
                status = fallback;
            }
        }

        self.cache.lock().unwrap().insert(model.to_string(), CacheEntry { status, checked_at: Instant::now() });
        self.pulse_fast_path.lock().unwrap().insert(model.to_string(), status);
        status
    }

    fn cached(&self, model: &str) -> Option<HealthStatus> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(model)?;
        (entry.checked_at.elapsed() < self.ttl).then_some(entry.status)
    }

    async fn probe_http(&self, model: &str, api_base: &str, api_key: &str) -> HealthStatus {
        let url = format!("{api_base}/v1/models/{model}");
        let response = self
            .client
            .get(&url)
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(5))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => HealthStatus::Healthy,
            Ok(resp) if resp.status().as_u16() == 429 => HealthStatus::RateLimited,
            Ok(resp) if resp.status().as_u16() == 401 || resp.status().as_u16() == 403 => {
                HealthStatus::KeyInvalidOrCreditsExhausted
            }
            Ok(_) | Err(_) => HealthStatus::Unavailable,
        }
    }

    /// Short CLI probe for when `probe_http` came back inconclusive:
    /// a plain `curl` HEAD request, bypassing whatever made the `reqwest`
    /// client itself fail to connect. `None` means the fallback was
    /// itself inconclusive and the caller should keep the HTTP verdict.
    async fn probe_cli(&self, api_base: &str) -> Option<HealthStatus> {
        let output = tokio::time::timeout(
            Duration::from_secs(5),
            tokio::process::Command::new("curl")
                .args(["-s", "-o", "/dev/null", "-w", "%{http_code}", "--max-time", "4", api_base])
                .output(),
        )
        .await
        .ok()?
        .ok()?;

        if !output.status.success() {
            return None;
        }
        let code: u16 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
        Some(match code {
            200..=299 => HealthStatus::Healthy,
            429 => HealthStatus::RateLimited,
            401 | 403 => HealthStatus::KeyInvalidOrCreditsExhausted,
            _ => HealthStatus::Unavailable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_override_wins_over_everything() {
        let tags = vec!["complex".to_string()];
        let input = TierResolutionInput {
            explicit_override: Some(Tier::Haiku),
            description: "rewrite the whole architecture",
            tags: &tags,
            ..Default::default()
        };
        assert_eq!(resolve_tier(&input), Tier::Haiku);
    }

    #[test]
    fn keyword_classifier_falls_back_when_nothing_more_specific() {
        let input = TierResolutionInput {
            description: "fix a typo in the README",
            tags: &[],
            ..Default::default()
        };
        assert_eq!(resolve_tier(&input), Tier::Haiku);
    }

    #[test]
    fn explicit_tag_outranks_keyword() {
        let tags = vec!["trivial".to_string()];
        assert_eq!(classify_complexity("migrate the whole auth subsystem", &tags), Tier::Haiku);
    }

    #[test]
    fn ambiguous_keyword_match_resolves_to_higher_tier() {
        let result = classify_complexity("module-level refactor touching a function refactor too", &[]);
        assert_eq!(result, Tier::Opus);
    }

    #[test]
    fn default_tier_is_sonnet_when_nothing_matches() {
        assert_eq!(classify_complexity("add a new endpoint", &[]), Tier::Sonnet);
    }

    #[test]
    fn tier_escalates_in_order() {
        assert_eq!(Tier::Haiku.next(), Some(Tier::Sonnet));
        assert_eq!(Tier::Sonnet.next(), Some(Tier::Opus));
        assert_eq!(Tier::Opus.next(), None);
    }

    #[tokio::test]
    async fn pulse_fast_path_short_circuits_without_a_network_call() {
        let checker = HealthChecker::new(Duration::from_secs(60));
        checker.pulse_fast_path.lock().unwrap().insert("haiku".to_string(), HealthStatus::RateLimited);

        let status = checker.check("haiku", "https://unreachable.invalid", "key").await;
        assert_eq!(status, HealthStatus::RateLimited);
    }

    #[test]
    fn start_pulse_clears_the_fast_path() {
        let checker = HealthChecker::new(Duration::from_secs(60));
        checker.pulse_fast_path.lock().unwrap().insert("haiku".to_string(), HealthStatus::Healthy);
        checker.start_pulse();
        assert!(checker.pulse_fast_path.lock().unwrap().is_empty());
    }
}
