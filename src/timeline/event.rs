//! Timeline event model: the unified record every source produces, the
//! deterministic event id, and the action-category mapping used by filters.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

/// Deterministic 16-hex-digit id. Equal `(entity_id, timestamp, event_type)`
/// inputs always produce equal ids.
pub fn generate_event_id(entity_id: &str, timestamp: i64, event_type: &str) -> String {
    let seed = format!("{entity_id}|{timestamp}|{event_type}");
    format!("{:016x}", xxh64(seed.as_bytes(), 0))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Device,
    Link,
    Metro,
    Contributor,
    User,
    Validator,
    Gossip,
}

impl EntityType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "device" => Some(Self::Device),
            "link" => Some(Self::Link),
            "metro" => Some(Self::Metro),
            "contributor" => Some(Self::Contributor),
            "user" => Some(Self::User),
            "validator" => Some(Self::Validator),
            "gossip" => Some(Self::Gossip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

impl EventSeverity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Coarse action buckets derived from the event type suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Added,
    Removed,
    Changed,
    Alerting,
    Resolved,
}

impl ActionCategory {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "added" => Some(Self::Added),
            "removed" => Some(Self::Removed),
            "changed" => Some(Self::Changed),
            "alerting" => Some(Self::Alerting),
            "resolved" => Some(Self::Resolved),
            _ => None,
        }
    }

    pub fn for_event_type(event_type: &str) -> Self {
        if event_type.contains("_created") || event_type.contains("_joined") {
            Self::Added
        } else if event_type.contains("_deleted") || event_type.contains("_left") {
            Self::Removed
        } else if event_type.contains("_updated") || event_type.contains("_stake_changed") {
            Self::Changed
        } else if event_type.contains("_started") || event_type.contains("_stake_increased") {
            Self::Alerting
        } else if event_type.contains("_stopped")
            || event_type.contains("_recovered")
            || event_type.contains("_stake_decreased")
        {
            Self::Resolved
        } else {
            Self::Changed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChangeDetails {
    pub changed_fields: Vec<String>,
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketLossDetails {
    pub link_pk: String,
    pub link_code: String,
    pub loss_pct: f64,
    pub previous_loss_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceDetails {
    pub device_pk: String,
    pub device_code: String,
    pub interface: String,
    pub link_pk: String,
    pub link_code: String,
    pub errors_delta: i64,
    pub discards_delta: i64,
    pub carrier_transitions_delta: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupedInterfaceDetails {
    pub device_pk: String,
    pub device_code: String,
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorDetails {
    pub vote_pubkey: String,
    pub node_pubkey: String,
    pub owner_pubkey: String,
    pub gossip_ip: String,
    pub stake_lamports: i64,
    pub stake_share_pct: f64,
    /// Share-of-network delta for attribution events; absent until the
    /// DZ-total walk fills it in.
    pub stake_share_change_pct: Option<f64>,
    /// Non-zero only on attribution events; advances the DZ-total walk.
    pub contribution_change_lamports: i64,
    /// Rewritten by the DZ-total walk in reverse-chronological order.
    pub dz_total_stake_share_pct: f64,
    pub on_dz: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventDetails {
    EntityChange(EntityChangeDetails),
    PacketLoss(PacketLossDetails),
    Interface(InterfaceDetails),
    GroupedInterface(GroupedInterfaceDetails),
    Validator(ValidatorDetails),
}

impl EventDetails {
    pub fn validator(&self) -> Option<&ValidatorDetails> {
        match self {
            EventDetails::Validator(details) => Some(details),
            _ => None,
        }
    }

    pub fn validator_mut(&mut self) -> Option<&mut ValidatorDetails> {
        match self {
            EventDetails::Validator(details) => Some(details),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    pub event_type: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub category: ActionCategory,
    pub severity: EventSeverity,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub entity_type: EntityType,
    pub entity_pk: String,
    pub entity_code: String,
    pub details: EventDetails,
}

impl TimelineEvent {
    /// Builds an event with the id and action category derived from the
    /// identity triple.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entity_id: &str,
        event_type: &str,
        timestamp: i64,
        severity: EventSeverity,
        title: String,
        entity_type: EntityType,
        entity_pk: String,
        entity_code: String,
        details: EventDetails,
    ) -> Self {
        Self {
            id: generate_event_id(entity_id, timestamp, event_type),
            event_type: event_type.to_string(),
            timestamp,
            category: ActionCategory::for_event_type(event_type),
            severity,
            title,
            description: None,
            entity_type,
            entity_pk,
            entity_code,
            details,
        }
    }
}

/// Total order: newest first, ties broken by id descending.
pub fn sort_events(events: &mut [TimelineEvent]) {
    events.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_is_deterministic_and_16_hex() {
        let a = generate_event_id("dev-1", 1_700_000_000, "device_updated");
        let b = generate_event_id("dev-1", 1_700_000_000, "device_updated");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        let c = generate_event_id("dev-1", 1_700_000_001, "device_updated");
        assert_ne!(a, c);
    }

    #[test]
    fn action_category_mapping() {
        use ActionCategory::*;
        let cases = [
            ("device_created", Added),
            ("validator_joined_dz", Added),
            ("link_deleted", Removed),
            ("validator_left_solana", Removed),
            ("gossip_left_dz", Removed),
            ("metro_updated", Changed),
            ("validator_stake_changed", Changed),
            ("packet_loss_started", Alerting),
            ("validator_stake_increased", Alerting),
            ("interface_errors_stopped", Resolved),
            ("packet_loss_recovered", Resolved),
            ("validator_stake_decreased", Resolved),
        ];
        for (event_type, expected) in cases {
            assert_eq!(
                ActionCategory::for_event_type(event_type),
                expected,
                "{event_type}"
            );
        }
    }

    fn bare(entity: &str, ts: i64, event_type: &str) -> TimelineEvent {
        TimelineEvent::new(
            entity,
            event_type,
            ts,
            EventSeverity::Info,
            "t".into(),
            EntityType::Device,
            entity.to_string(),
            entity.to_uppercase(),
            EventDetails::EntityChange(EntityChangeDetails {
                changed_fields: vec![],
                is_deleted: false,
            }),
        )
    }

    #[test]
    fn sort_is_total_and_descending() {
        let mut events = vec![
            bare("a", 100, "device_updated"),
            bare("b", 200, "device_updated"),
            bare("c", 100, "device_updated"),
        ];
        sort_events(&mut events);
        assert_eq!(events[0].timestamp, 200);
        assert_eq!(events[1].timestamp, 100);
        assert_eq!(events[2].timestamp, 100);
        assert!(events[1].id > events[2].id);

        // permuting the input yields the same order
        let mut shuffled = vec![events[2].clone(), events[0].clone(), events[1].clone()];
        sort_events(&mut shuffled);
        assert_eq!(shuffled, events);
    }
}
