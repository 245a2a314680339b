//! Field-prefixed timeline search.
//!
//! Terms are `field:value`, comma-separated, values lowercased at parse.
//! Semantics: AND across fields, OR within one field's values. A term
//! matches when any code or pubkey the event carries for that field
//! substring-contains the value.

use rustc_hash::FxHashMap;

use crate::timeline::event::{EntityType, EventDetails, TimelineEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchField {
    Device,
    Link,
    Metro,
    Contributor,
    Validator,
    User,
}

impl SearchField {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "device" => Some(Self::Device),
            "link" => Some(Self::Link),
            "metro" => Some(Self::Metro),
            "contributor" => Some(Self::Contributor),
            "validator" => Some(Self::Validator),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

pub type SearchTerms = FxHashMap<SearchField, Vec<String>>;

/// Parses `device:lax1,link:den-ord,device:ewr` into grouped lowercase
/// values. Unknown fields and malformed terms are dropped.
pub fn parse_search(raw: &str) -> SearchTerms {
    let mut terms: SearchTerms = FxHashMap::default();
    for part in raw.split(',') {
        let part = part.trim();
        let Some((field, value)) = part.split_once(':') else {
            continue;
        };
        let Some(field) = SearchField::parse(field.trim()) else {
            continue;
        };
        let value = value.trim().to_lowercase();
        if value.is_empty() {
            continue;
        }
        terms.entry(field).or_default().push(value);
    }
    terms
}

fn push_lower(out: &mut Vec<String>, s: &str) {
    if !s.is_empty() {
        out.push(s.to_lowercase());
    }
}

fn candidates(event: &TimelineEvent, field: SearchField) -> Vec<String> {
    let mut out = Vec::new();
    match field {
        SearchField::Device => {
            if event.entity_type == EntityType::Device {
                push_lower(&mut out, &event.entity_pk);
                push_lower(&mut out, &event.entity_code);
            }
            match &event.details {
                EventDetails::Interface(d) => {
                    push_lower(&mut out, &d.device_pk);
                    push_lower(&mut out, &d.device_code);
                }
                EventDetails::GroupedInterface(d) => {
                    push_lower(&mut out, &d.device_pk);
                    push_lower(&mut out, &d.device_code);
                }
                _ => {}
            }
        }
        SearchField::Link => {
            if event.entity_type == EntityType::Link {
                push_lower(&mut out, &event.entity_pk);
                push_lower(&mut out, &event.entity_code);
            }
            match &event.details {
                EventDetails::PacketLoss(d) => {
                    push_lower(&mut out, &d.link_pk);
                    push_lower(&mut out, &d.link_code);
                }
                EventDetails::Interface(d) => {
                    push_lower(&mut out, &d.link_pk);
                    push_lower(&mut out, &d.link_code);
                }
                _ => {}
            }
        }
        SearchField::Metro => {
            if event.entity_type == EntityType::Metro {
                push_lower(&mut out, &event.entity_pk);
                push_lower(&mut out, &event.entity_code);
            }
        }
        SearchField::Contributor => {
            if event.entity_type == EntityType::Contributor {
                push_lower(&mut out, &event.entity_pk);
                push_lower(&mut out, &event.entity_code);
            }
        }
        SearchField::Validator => {
            if matches!(event.entity_type, EntityType::Validator | EntityType::Gossip) {
                push_lower(&mut out, &event.entity_pk);
                push_lower(&mut out, &event.entity_code);
            }
            if let EventDetails::Validator(d) = &event.details {
                push_lower(&mut out, &d.vote_pubkey);
                push_lower(&mut out, &d.node_pubkey);
            }
        }
        SearchField::User => {
            if event.entity_type == EntityType::User {
                push_lower(&mut out, &event.entity_pk);
                push_lower(&mut out, &event.entity_code);
            }
            if let EventDetails::Validator(d) = &event.details {
                push_lower(&mut out, &d.owner_pubkey);
            }
        }
    }
    out
}

/// AND across fields, OR within a field's values. Empty terms never match.
pub fn event_matches_search(event: &TimelineEvent, terms: &SearchTerms) -> bool {
    if terms.is_empty() {
        return false;
    }
    for (&field, values) in terms {
        let haystacks = candidates(event, field);
        let hit = values
            .iter()
            .any(|value| haystacks.iter().any(|h| h.contains(value)));
        if !hit {
            return false;
        }
    }
    true
}
