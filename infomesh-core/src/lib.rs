use serde::{Deserialize, Serialize};
use std::fmt;

/// A creditable contribution action. Closed set — unknown actions are
/// rejected at the boundary rather than modeled as an open string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Crawl,
    QueryProcess,
    DocHosting,
    NetworkUptime,
    LlmOwn,
    LlmPeer,
    GitDocs,
    GitFix,
    GitFeature,
    GitMajor,
}

impl Action {
    pub const ALL: [Action; 10] = [
        Action::Crawl,
        Action::QueryProcess,
        Action::DocHosting,
        Action::NetworkUptime,
        Action::LlmOwn,
        Action::LlmPeer,
        Action::GitDocs,
        Action::GitFix,
        Action::GitFeature,
        Action::GitMajor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Crawl => "crawl",
            Action::QueryProcess => "query_process",
            Action::DocHosting => "doc_hosting",
            Action::NetworkUptime => "network_uptime",
            Action::LlmOwn => "llm_own",
            Action::LlmPeer => "llm_peer",
            Action::GitDocs => "git_docs",
            Action::GitFix => "git_fix",
            Action::GitFeature => "git_feature",
            Action::GitMajor => "git_major",
        }
    }

    pub fn parse(s: &str) -> Option<Action> {
        Action::ALL.into_iter().find(|a| a.as_str() == s)
    }

    /// Resource weight per unit, per spec.md §3.
    pub fn weight(&self) -> f64 {
        match self {
            Action::Crawl => 1.0,
            Action::QueryProcess => 0.5,
            Action::DocHosting => 0.1,
            Action::NetworkUptime => 0.5,
            Action::LlmOwn => 1.5,
            Action::LlmPeer => 2.0,
            Action::GitDocs => 1_000.0,
            Action::GitFix => 10_000.0,
            Action::GitFeature => 50_000.0,
            Action::GitMajor => 100_000.0,
        }
    }

    /// Whether this action is eligible for the off-peak multiplier.
    pub fn is_llm(&self) -> bool {
        matches!(self, Action::LlmOwn | Action::LlmPeer)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket of contribution score controlling search cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionTier {
    Tier1,
    Tier2,
    Tier3,
}

impl ContributionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionTier::Tier1 => "tier_1",
            ContributionTier::Tier2 => "tier_2",
            ContributionTier::Tier3 => "tier_3",
        }
    }
}

/// Descending-threshold table: `(threshold, tier, base_search_cost)`.
/// First threshold met wins — table scan in descending order.
pub const TIER_THRESHOLDS: [(f64, ContributionTier, f64); 3] = [
    (1000.0, ContributionTier::Tier3, 0.033),
    (100.0, ContributionTier::Tier2, 0.050),
    (0.0, ContributionTier::Tier1, 0.100),
];

/// Resolve a contribution score to its tier and base search cost.
pub fn tier_for_score(score: f64) -> (ContributionTier, f64) {
    for (threshold, tier, cost) in TIER_THRESHOLDS {
        if score >= threshold {
            return (tier, cost);
        }
    }
    (ContributionTier::Tier1, 0.100)
}

/// Node credit state — determines search cost behavior. Search is never
/// refused; only the effective cost changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditState {
    Normal,
    Grace,
    Debt,
}

impl CreditState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditState::Normal => "normal",
            CreditState::Grace => "grace",
            CreditState::Debt => "debt",
        }
    }
}

/// Credit multiplier applied to off-peak LLM work.
pub const OFF_PEAK_MULTIPLIER: f64 = 1.5;

/// Length of the grace window after balance goes non-positive.
pub const GRACE_PERIOD_HOURS: f64 = 72.0;

/// Search cost multiplier once a node has fallen into debt.
pub const DEBT_COST_MULTIPLIER: f64 = 2.0;

/// Maximum share of contribution score attributable to LLM actions.
pub const LLM_CREDIT_CAP_RATIO: f64 = 0.60;

/// Maximum plausible UTC offset mismatch between a claimed timezone and
/// the IP-derived estimate before a claim is flagged implausible.
pub const MAX_OFFSET_DIFF_HOURS: f64 = 2.0;

/// Maximum timezone changes tolerated per 24h before a peer is flagged
/// suspicious by the consistency tracker.
pub const MAX_TZ_CHANGES_PER_DAY: usize = 3;

/// Opaque peer identifier as carried on the wire; the P2P transport layer
/// (out of core scope) owns the concrete identity scheme.
pub type PeerId = String;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_match_contract() {
        assert_eq!(Action::Crawl.weight(), 1.0);
        assert_eq!(Action::QueryProcess.weight(), 0.5);
        assert_eq!(Action::DocHosting.weight(), 0.1);
        assert_eq!(Action::NetworkUptime.weight(), 0.5);
        assert_eq!(Action::LlmOwn.weight(), 1.5);
        assert_eq!(Action::LlmPeer.weight(), 2.0);
        assert_eq!(Action::GitDocs.weight(), 1_000.0);
        assert_eq!(Action::GitFix.weight(), 10_000.0);
        assert_eq!(Action::GitFeature.weight(), 50_000.0);
        assert_eq!(Action::GitMajor.weight(), 100_000.0);
    }

    #[test]
    fn only_llm_actions_are_llm() {
        for action in Action::ALL {
            let expected = matches!(action, Action::LlmOwn | Action::LlmPeer);
            assert_eq!(action.is_llm(), expected, "{action}");
        }
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(tier_for_score(99.999).0, ContributionTier::Tier1);
        assert_eq!(tier_for_score(100.0).0, ContributionTier::Tier2);
        assert_eq!(tier_for_score(999.999).0, ContributionTier::Tier2);
        assert_eq!(tier_for_score(1000.0).0, ContributionTier::Tier3);
    }

    #[test]
    fn tier_costs() {
        assert_eq!(tier_for_score(0.0).1, 0.100);
        assert_eq!(tier_for_score(100.0).1, 0.050);
        assert_eq!(tier_for_score(1000.0).1, 0.033);
    }

    #[test]
    fn action_round_trips_through_str() {
        for action in Action::ALL {
            assert_eq!(Action::parse(action.as_str()), Some(action));
        }
        assert_eq!(Action::parse("not_an_action"), None);
    }
}
