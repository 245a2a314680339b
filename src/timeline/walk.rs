//! Reverse-chronological DZ-total stake walk and validator dedup.
//!
//! The current DZ total is the only measured anchor; older values are derived
//! by subtracting the known contribution deltas of every newer attribution
//! event. The walk runs before filtering so every attribution event is
//! visible to it, and it must stay a single sequential pass.

use rustc_hash::FxHashMap;

use crate::timeline::event::TimelineEvent;

#[derive(Debug, Clone, Copy, Default)]
pub struct WalkAnchor {
    /// DZ share of total network stake right now, in percent.
    pub current_dz_total_pct: f64,
    /// Total network stake in lamports, read at walk time.
    pub total_network_stake_lamports: i64,
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Walks newest-to-oldest over events already sorted descending, rewriting
/// `dz_total_stake_share_pct` on every validator/gossip payload and filling
/// `stake_share_change_pct` on attribution events where absent.
pub fn apply_dz_total_walk(events: &mut [TimelineEvent], anchor: WalkAnchor) {
    let mut running = anchor.current_dz_total_pct;
    for event in events.iter_mut() {
        let Some(details) = event.details.validator_mut() else {
            continue;
        };
        details.dz_total_stake_share_pct = round2(running);
        if details.contribution_change_lamports != 0 && anchor.total_network_stake_lamports > 0 {
            let change_pct = details.contribution_change_lamports as f64 * 100.0
                / anchor.total_network_stake_lamports as f64;
            if details.stake_share_change_pct.is_none() {
                details.stake_share_change_pct = Some(round2(change_pct));
            }
            running -= change_pct;
        }
    }
}

/// Collapses events whose `(vote_pubkey, event_type, timestamp)` all match,
/// preferring the candidate that carries a non-zero contribution change.
pub fn dedup_validator_events(events: Vec<TimelineEvent>) -> Vec<TimelineEvent> {
    let mut keep: Vec<TimelineEvent> = Vec::with_capacity(events.len());
    let mut index: FxHashMap<(String, String, i64), usize> = FxHashMap::default();
    for event in events {
        let key = match event.details.validator() {
            Some(details) => (
                details.vote_pubkey.clone(),
                event.event_type.clone(),
                event.timestamp,
            ),
            None => {
                keep.push(event);
                continue;
            }
        };
        match index.get(&key) {
            Some(&at) => {
                let kept_has_change = keep[at]
                    .details
                    .validator()
                    .is_some_and(|d| d.contribution_change_lamports != 0);
                let candidate_has_change = event
                    .details
                    .validator()
                    .is_some_and(|d| d.contribution_change_lamports != 0);
                if candidate_has_change && !kept_has_change {
                    keep[at] = event;
                }
            }
            None => {
                index.insert(key, keep.len());
                keep.push(event);
            }
        }
    }
    keep
}
