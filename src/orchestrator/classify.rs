//! Keyword classification of feature descriptions.

use regex::Regex;
use stageflow_common::FeatureProfile;
use std::sync::LazyLock;

static UI_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(ui|ux|frontend|front-end|page|screen|button|form|modal|dashboard|component|layout|css|style|theme|view)s?\b")
        .unwrap()
});

static IMPROVEMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(improve|improvement|enhance|optimi[sz]e|refactor|speed\s+up|faster|performance|upgrade|simplify)\w*\b")
        .unwrap()
});

static METRICS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(metric|analytics|kpi|tracking|measure|telemetry|conversion|funnel|dashboard)s?\b")
        .unwrap()
});

static DEPLOYMENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(deploy|deployment|migration|migrate|infrastructure|infra|docker|kubernetes|k8s|terraform|ci|pipeline|schema)s?\b")
        .unwrap()
});

/// Derive the feature profile from a description.
pub fn classify(description: &str) -> FeatureProfile {
    let lower = description.to_lowercase();
    FeatureProfile {
        has_ui: UI_REGEX.is_match(&lower),
        is_improvement: IMPROVEMENT_REGEX.is_match(&lower),
        has_metrics: METRICS_REGEX.is_match(&lower),
        has_deployment_impact: DEPLOYMENT_REGEX.is_match(&lower),
    }
}
