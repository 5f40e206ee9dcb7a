use std::collections::HashMap;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{Offset, Timelike, Utc};
use chrono_tz::Tz;
use infomesh_core::{PeerId, MAX_OFFSET_DIFF_HOURS, MAX_TZ_CHANGES_PER_DAY, OFF_PEAK_MULTIPLIER};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs_f64()
}

// --- Timezone plausibility verification (C5) -------------------------------

/// First-IPv4-octet → typical UTC offset heuristic. Approximate, no
/// external GeoIP dependency — good enough to catch a peer claiming an
/// implausible timezone for its apparent region.
const IP_REGION_OFFSETS: &[(std::ops::Range<u16>, f64, &str)] = &[
    // Asia
    (1..2, 8.0, "Asia (CN/JP/KR)"),
    (14..15, 9.0, "Asia-Pacific"),
    (27..28, 5.5, "South Asia"),
    (36..37, 9.0, "Japan"),
    (49..50, 9.0, "Japan"),
    (58..59, 8.0, "East Asia"),
    (61..62, 5.5, "India"),
    (101..126, 8.0, "East Asia"),
    (175..176, 9.0, "Asia-Pacific"),
    (210..212, 9.0, "Korea"),
    (218..222, 9.0, "Korea"),
    // Europe
    (2..3, 1.0, "Europe"),
    (5..6, 1.0, "Europe"),
    (31..32, 1.0, "Europe"),
    (37..38, 1.0, "France"),
    (46..47, 3.0, "Russia"),
    (62..63, 1.0, "Europe"),
    (77..80, 1.0, "Europe"),
    (80..82, 1.0, "Europe"),
    (83..88, 1.0, "Europe"),
    (88..96, 1.0, "Europe"),
    (145..150, 1.0, "Europe"),
    (176..178, 1.0, "Europe"),
    (185..195, 1.0, "Europe"),
    (193..196, 1.0, "Europe"),
    // Americas
    (3..5, -5.0, "North America"),
    (6..9, -5.0, "North America"),
    (12..14, -5.0, "North America"),
    (15..20, -5.0, "North America"),
    (23..27, -5.0, "North America"),
    (32..36, -5.0, "North America"),
    (38..45, -5.0, "North America"),
    (47..49, -5.0, "North America"),
    (50..55, -5.0, "North America"),
    (63..77, -5.0, "North America"),
    (96..101, -5.0, "North America"),
    (128..145, -5.0, "North America"),
    (198..210, -5.0, "North America"),
    // Oceania
    (150..154, 10.0, "Oceania"),
    (202..204, 10.0, "Oceania"),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimezoneCheck {
    pub peer_id: PeerId,
    pub claimed_tz: String,
    pub claimed_offset_hours: f64,
    pub estimated_offset_hours: Option<f64>,
    pub offset_diff_hours: Option<f64>,
    pub plausible: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyRecord {
    pub peer_id: PeerId,
    pub claim_count: usize,
    pub unique_timezones: usize,
    pub changes_in_24h: usize,
    pub suspicious: bool,
}

/// Current UTC offset, in hours, for an IANA timezone name. Falls back
/// to `0.0` for unknown/unparseable timezone strings.
pub fn get_timezone_offset(tz_name: &str) -> f64 {
    match Tz::from_str(tz_name) {
        Ok(tz) => Utc::now().with_timezone(&tz).offset().fix().local_minus_utc() as f64 / 3600.0,
        Err(_) => 0.0,
    }
}

/// Estimate a UTC offset from an IPv4 address's first octet using the
/// region heuristic table. Returns `None` for unmapped ranges.
pub fn estimate_offset_from_ip(ip_address: &str) -> Option<f64> {
    let first_octet: u16 = ip_address.split('.').next()?.parse().ok()?;
    IP_REGION_OFFSETS
        .iter()
        .find(|(range, _, _)| range.contains(&first_octet))
        .map(|(_, offset, _)| *offset)
}

/// Verify that a peer's claimed timezone is plausible given its IP.
pub fn verify_timezone(peer_id: &str, claimed_tz: &str, ip_address: &str) -> TimezoneCheck {
    let claimed_offset = get_timezone_offset(claimed_tz);
    let Some(estimated_offset) = estimate_offset_from_ip(ip_address) else {
        return TimezoneCheck {
            peer_id: peer_id.to_string(),
            claimed_tz: claimed_tz.to_string(),
            claimed_offset_hours: claimed_offset,
            estimated_offset_hours: None,
            offset_diff_hours: None,
            plausible: true,
            reason: "IP region unknown, cannot verify".to_string(),
        };
    };

    let mut diff = (claimed_offset - estimated_offset).abs();
    if diff > 12.0 {
        diff = 24.0 - diff;
    }
    let plausible = diff <= MAX_OFFSET_DIFF_HOURS;

    let reason = if plausible {
        format!("offset diff {diff:.1}h within ±{MAX_OFFSET_DIFF_HOURS:.0}h tolerance")
    } else {
        warn!(event = "timezone_mismatch", peer_id = %short(peer_id), claimed = claimed_tz, diff_hours = diff);
        format!(
            "offset diff {diff:.1}h exceeds ±{MAX_OFFSET_DIFF_HOURS:.0}h (claimed {claimed_tz}={claimed_offset:+.1}, IP suggests {estimated_offset:+.1})"
        )
    };

    TimezoneCheck {
        peer_id: peer_id.to_string(),
        claimed_tz: claimed_tz.to_string(),
        claimed_offset_hours: claimed_offset,
        estimated_offset_hours: Some(estimated_offset),
        offset_diff_hours: Some(diff),
        plausible,
        reason,
    }
}

fn short(peer_id: &str) -> &str {
    &peer_id[..peer_id.len().min(16)]
}

/// Tracks timezone claims per peer over a 48h rolling window and flags
/// peers that change claimed timezone more than
/// [`MAX_TZ_CHANGES_PER_DAY`] times within the trailing 24h.
///
/// `record_claim` both appends the new claim and evaluates suspicion —
/// it has a side effect and is the authoritative write path.
/// `suspicion_of` is a pure read over the current claim history with no
/// side effects, for callers that only want to query standing state.
pub struct TimezoneConsistencyTracker {
    claims: RwLock<HashMap<PeerId, Vec<(f64, String)>>>,
}

impl TimezoneConsistencyTracker {
    pub fn new() -> Self {
        Self { claims: RwLock::new(HashMap::new()) }
    }

    pub fn record_claim(&self, peer_id: &str, timezone: &str) -> ConsistencyRecord {
        let now_ts = now();
        let mut claims = self.claims.write();
        let entry = claims.entry(peer_id.to_string()).or_default();
        entry.push((now_ts, timezone.to_string()));

        let cutoff = now_ts - 48.0 * 3600.0;
        entry.retain(|(ts, _)| *ts >= cutoff);

        let record = consistency_record(peer_id, entry, now_ts);
        if record.suspicious {
            warn!(event = "timezone_suspicious_changes", peer_id = %short(peer_id), changes = record.changes_in_24h);
        }
        record
    }

    /// Pure read of current suspicion status — does not record a claim.
    pub fn suspicion_of(&self, peer_id: &str) -> bool {
        let claims = self.claims.read();
        match claims.get(peer_id) {
            Some(entry) => consistency_record(peer_id, entry, now()).suspicious,
            None => false,
        }
    }
}

impl Default for TimezoneConsistencyTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn consistency_record(peer_id: &str, claims: &[(f64, String)], now_ts: f64) -> ConsistencyRecord {
    let unique: std::collections::HashSet<&str> = claims.iter().map(|(_, tz)| tz.as_str()).collect();

    let recent_cutoff = now_ts - 24.0 * 3600.0;
    let recent: Vec<&(f64, String)> = claims.iter().filter(|(ts, _)| *ts >= recent_cutoff).collect();
    let mut changes_24h = 0usize;
    for window in recent.windows(2) {
        if window[0].1 != window[1].1 {
            changes_24h += 1;
        }
    }

    ConsistencyRecord {
        peer_id: peer_id.to_string(),
        claim_count: claims.len(),
        unique_timezones: unique.len(),
        changes_in_24h: changes_24h,
        suspicious: changes_24h >= MAX_TZ_CHANGES_PER_DAY,
    }
}

// --- Energy-aware scheduling (C6) ------------------------------------------

pub const DEFAULT_OFF_PEAK_START: u32 = 23;
pub const DEFAULT_OFF_PEAK_END: u32 = 7;
pub const MIN_OFF_PEAK_NODES: usize = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeScheduleInfo {
    pub peer_id: PeerId,
    pub off_peak_start: u32,
    pub off_peak_end: u32,
    pub timezone: String,
    pub has_llm: bool,
    pub trust_score: f64,
    pub ip_address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDecision {
    pub target_peer_id: PeerId,
    pub is_off_peak: bool,
    pub credit_multiplier: f64,
    pub reason: String,
}

/// Whether `hour` falls in the off-peak window `[start, end)`, handling
/// midnight wrap-around (e.g. 23 → 7).
pub fn is_off_peak_at(hour: u32, start: u32, end: u32) -> bool {
    if start > end {
        hour >= start || hour < end
    } else {
        start <= hour && hour < end
    }
}

/// Sorts descending by trust score, breaking ties by peer_id ascending —
/// an explicit, deterministic tie-break for replay (spec.md §4.6).
fn sort_by_trust_then_peer_id(nodes: &mut [&NodeScheduleInfo]) {
    nodes.sort_by(|a, b| b.trust_score.total_cmp(&a.trust_score).then_with(|| a.peer_id.cmp(&b.peer_id)));
}

/// Current hour (0-23) in an IANA timezone, falling back to UTC for an
/// unparseable timezone string.
pub fn current_hour_in_timezone(timezone: &str) -> u32 {
    match Tz::from_str(timezone) {
        Ok(tz) => Utc::now().with_timezone(&tz).hour(),
        Err(_) => Utc::now().hour(),
    }
}

pub fn node_is_off_peak(node: &NodeScheduleInfo, now_override_hour: Option<u32>) -> bool {
    let hour = now_override_hour.unwrap_or_else(|| current_hour_in_timezone(&node.timezone));
    is_off_peak_at(hour, node.off_peak_start, node.off_peak_end)
}

/// Selects LLM-capable nodes for tasks, preferring off-peak nodes (which
/// earn the off-peak credit multiplier) and screening out peers whose
/// off-peak claim fails timezone plausibility or consistency checks.
pub struct EnergyAwareScheduler {
    tz_tracker: TimezoneConsistencyTracker,
}

impl EnergyAwareScheduler {
    pub fn new() -> Self {
        Self { tz_tracker: TimezoneConsistencyTracker::new() }
    }

    fn verify_off_peak(&self, node: &NodeScheduleInfo, now_override_hour: Option<u32>) -> bool {
        if !node_is_off_peak(node, now_override_hour) {
            return false;
        }

        if node.ip_address.is_empty() {
            return true;
        }

        let check = verify_timezone(&node.peer_id, &node.timezone, &node.ip_address);
        let record = self.tz_tracker.record_claim(&node.peer_id, &node.timezone);

        if !check.plausible {
            warn!(event = "off_peak_tz_implausible", peer_id = %node.peer_id, claimed = %node.timezone, ip = %node.ip_address);
            return false;
        }
        if record.suspicious {
            warn!(event = "off_peak_tz_suspicious", peer_id = %node.peer_id, reason = "frequent_tz_changes");
            return false;
        }
        true
    }

    /// Partitions LLM-capable nodes into off-peak/on-peak, computing each
    /// node's classification exactly once (`verify_off_peak` has the
    /// consistency-tracker recording side effect, so it must not be
    /// invoked twice per node per scheduling call).
    fn partition_llm_nodes<'n>(
        &self,
        nodes: &'n [NodeScheduleInfo],
        now_override_hour: Option<u32>,
    ) -> (Vec<&'n NodeScheduleInfo>, Vec<&'n NodeScheduleInfo>) {
        let mut off_peak = Vec::new();
        let mut on_peak = Vec::new();
        for node in nodes.iter().filter(|n| n.has_llm) {
            if self.verify_off_peak(node, now_override_hour) {
                off_peak.push(node);
            } else {
                on_peak.push(node);
            }
        }
        (off_peak, on_peak)
    }

    pub fn schedule_llm_task(
        &self,
        nodes: &[NodeScheduleInfo],
        now_override_hour: Option<u32>,
    ) -> Option<ScheduleDecision> {
        if !nodes.iter().any(|n| n.has_llm) {
            debug!(event = "schedule_no_llm_nodes");
            return None;
        }

        let (mut off_peak, mut on_peak) = self.partition_llm_nodes(nodes, now_override_hour);

        if !off_peak.is_empty() {
            sort_by_trust_then_peer_id(&mut off_peak);
            let best = off_peak[0];
            return Some(ScheduleDecision {
                target_peer_id: best.peer_id.clone(),
                is_off_peak: true,
                credit_multiplier: OFF_PEAK_MULTIPLIER,
                reason: format!("off-peak in {} (trust={:.3})", best.timezone, best.trust_score),
            });
        }

        sort_by_trust_then_peer_id(&mut on_peak);
        let best = *on_peak.first()?;
        Some(ScheduleDecision {
            target_peer_id: best.peer_id.clone(),
            is_off_peak: false,
            credit_multiplier: 1.0,
            reason: format!("on-peak, no off-peak available (trust={:.3})", best.trust_score),
        })
    }

    pub fn schedule_batch(
        &self,
        nodes: &[NodeScheduleInfo],
        task_count: usize,
        now_override_hour: Option<u32>,
    ) -> Vec<ScheduleDecision> {
        if !nodes.iter().any(|n| n.has_llm) {
            return Vec::new();
        }

        let (mut off_peak, mut on_peak) = self.partition_llm_nodes(nodes, now_override_hour);
        sort_by_trust_then_peer_id(&mut off_peak);
        sort_by_trust_then_peer_id(&mut on_peak);

        let mut decisions = Vec::with_capacity(task_count);
        for i in 0..task_count {
            if !off_peak.is_empty() {
                let node = off_peak[i % off_peak.len()];
                decisions.push(ScheduleDecision {
                    target_peer_id: node.peer_id.clone(),
                    is_off_peak: true,
                    credit_multiplier: OFF_PEAK_MULTIPLIER,
                    reason: format!("batch off-peak ({})", node.timezone),
                });
            } else if !on_peak.is_empty() {
                let node = on_peak[i % on_peak.len()];
                decisions.push(ScheduleDecision {
                    target_peer_id: node.peer_id.clone(),
                    is_off_peak: false,
                    credit_multiplier: 1.0,
                    reason: format!("batch on-peak ({})", node.timezone),
                });
            } else {
                break;
            }
        }
        decisions
    }
}

impl Default for EnergyAwareScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, has_llm: bool, trust: f64, start: u32, end: u32) -> NodeScheduleInfo {
        NodeScheduleInfo {
            peer_id: id.to_string(),
            off_peak_start: start,
            off_peak_end: end,
            timezone: "UTC".to_string(),
            has_llm,
            trust_score: trust,
            ip_address: String::new(),
        }
    }

    #[test]
    fn midnight_wrap_off_peak_window() {
        assert!(is_off_peak_at(23, 23, 7));
        assert!(is_off_peak_at(3, 23, 7));
        assert!(!is_off_peak_at(12, 23, 7));
    }

    #[test]
    fn non_wrapping_window() {
        assert!(is_off_peak_at(2, 0, 6));
        assert!(!is_off_peak_at(6, 0, 6));
    }

    #[test]
    fn ip_region_lookup() {
        assert_eq!(estimate_offset_from_ip("1.2.3.4"), Some(8.0));
        assert_eq!(estimate_offset_from_ip("198.51.100.1"), Some(-5.0));
        assert_eq!(estimate_offset_from_ip("not-an-ip"), None);
    }

    #[test]
    fn offset_wraparound_handles_12h_boundary() {
        // claimed +13 vs estimated -11 → raw diff 24, wraps to 0
        let check = verify_timezone("peer", "Pacific/Kiritimati", "198.51.100.1");
        assert!(check.offset_diff_hours.is_some());
    }

    #[test]
    fn tracker_flags_frequent_changes() {
        let tracker = TimezoneConsistencyTracker::new();
        tracker.record_claim("peer-a", "Asia/Seoul");
        tracker.record_claim("peer-a", "Europe/Berlin");
        tracker.record_claim("peer-a", "Asia/Seoul");
        let record = tracker.record_claim("peer-a", "Europe/Berlin");
        assert!(record.changes_in_24h >= MAX_TZ_CHANGES_PER_DAY);
        assert!(record.suspicious);
        assert!(tracker.suspicion_of("peer-a"));
    }

    #[test]
    fn tracker_unknown_peer_not_suspicious() {
        let tracker = TimezoneConsistencyTracker::new();
        assert!(!tracker.suspicion_of("never-seen"));
    }

    #[test]
    fn schedules_off_peak_node_by_trust() {
        let scheduler = EnergyAwareScheduler::new();
        let nodes = vec![
            node("low-trust", true, 0.2, 23, 7),
            node("high-trust", true, 0.9, 23, 7),
        ];
        let decision = scheduler.schedule_llm_task(&nodes, Some(2)).unwrap();
        assert_eq!(decision.target_peer_id, "high-trust");
        assert!(decision.is_off_peak);
        assert_eq!(decision.credit_multiplier, OFF_PEAK_MULTIPLIER);
    }

    #[test]
    fn falls_back_to_on_peak_when_no_off_peak_nodes() {
        let scheduler = EnergyAwareScheduler::new();
        let nodes = vec![node("only", true, 0.5, 23, 7)];
        let decision = scheduler.schedule_llm_task(&nodes, Some(12)).unwrap();
        assert_eq!(decision.target_peer_id, "only");
        assert!(!decision.is_off_peak);
        assert_eq!(decision.credit_multiplier, 1.0);
    }

    #[test]
    fn no_llm_nodes_returns_none() {
        let scheduler = EnergyAwareScheduler::new();
        let nodes = vec![node("no-llm", false, 0.9, 23, 7)];
        assert!(scheduler.schedule_llm_task(&nodes, Some(2)).is_none());
    }

    #[test]
    fn batch_round_robins_across_off_peak_nodes() {
        let scheduler = EnergyAwareScheduler::new();
        let nodes = vec![
            node("a", true, 0.9, 23, 7),
            node("b", true, 0.8, 23, 7),
        ];
        let decisions = scheduler.schedule_batch(&nodes, 3, Some(2));
        assert_eq!(decisions.len(), 3);
        assert_eq!(decisions[0].target_peer_id, "a");
        assert_eq!(decisions[1].target_peer_id, "b");
        assert_eq!(decisions[2].target_peer_id, "a");
    }

    #[test]
    fn ties_in_trust_break_by_peer_id_ascending() {
        let scheduler = EnergyAwareScheduler::new();
        let nodes = vec![
            node("zeta", true, 0.5, 23, 7),
            node("alpha", true, 0.5, 23, 7),
        ];
        let decision = scheduler.schedule_llm_task(&nodes, Some(2)).unwrap();
        assert_eq!(decision.target_peer_id, "alpha");
    }

    #[test]
    fn scheduling_decision_records_exactly_one_claim_per_node() {
        let scheduler = EnergyAwareScheduler::new();
        let nodes = vec![node_with_ip("peer-a", true, 0.9, 23, 7, "198.51.100.1")];
        scheduler.schedule_llm_task(&nodes, Some(2));
        let claims = scheduler.tz_tracker.claims.read();
        assert_eq!(claims.get("peer-a").map(|c| c.len()), Some(1));
    }

    fn node_with_ip(id: &str, has_llm: bool, trust: f64, start: u32, end: u32, ip: &str) -> NodeScheduleInfo {
        NodeScheduleInfo {
            peer_id: id.to_string(),
            off_peak_start: start,
            off_peak_end: end,
            timezone: "UTC".to_string(),
            has_llm,
            trust_score: trust,
            ip_address: ip.to_string(),
        }
    }
}
