//! Shared domain entities. Everything here is read from the backing stores;
//! fabricview never mutates these.

use serde::{Deserialize, Serialize};

/// Links with this delay override are treated as soft-drained regardless of
/// their declared status.
pub const SOFT_DRAIN_DELAY_OVERRIDE_NS: i64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkStatus {
    Activated,
    SoftDrained,
    HardDrained,
    Suspended,
    Pending,
    Deactivated,
}

impl LinkStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "activated" => Some(Self::Activated),
            "soft-drained" => Some(Self::SoftDrained),
            "hard-drained" => Some(Self::HardDrained),
            "suspended" => Some(Self::Suspended),
            "pending" => Some(Self::Pending),
            "deactivated" => Some(Self::Deactivated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Activated => "activated",
            Self::SoftDrained => "soft-drained",
            Self::HardDrained => "hard-drained",
            Self::Suspended => "suspended",
            Self::Pending => "pending",
            Self::Deactivated => "deactivated",
        }
    }

    pub fn is_drained(&self) -> bool {
        matches!(self, Self::SoftDrained | Self::HardDrained)
    }
}

/// Effective status string for a link. The delay override marks a link
/// soft-drained regardless of its declared status.
pub fn effective_link_status(status: &str, isis_delay_override_ns: i64) -> &str {
    if isis_delay_override_ns == SOFT_DRAIN_DELAY_OVERRIDE_NS {
        "soft-drained"
    } else {
        status
    }
}

pub fn is_drained_status(status: &str) -> bool {
    status == "soft-drained" || status == "hard-drained"
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Device {
    pub pk: String,
    pub code: String,
    pub status: String,
    pub device_type: String,
    pub public_ip: String,
    pub contributor_pk: String,
    pub metro_pk: String,
    pub max_users: i64,
    pub isis_system_id: Option<String>,
    pub isis_router_id: Option<String>,
}

impl Device {
    /// A device participates in the routing graph iff it carries an IS-IS
    /// system id.
    pub fn is_isis_enabled(&self) -> bool {
        self.isis_system_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Link {
    pub pk: String,
    pub code: String,
    pub status: String,
    pub link_type: String,
    pub tunnel_net: String,
    pub contributor_pk: String,
    pub side_a_pk: String,
    pub side_z_pk: String,
    pub side_a_iface_name: String,
    pub side_z_iface_name: String,
    pub committed_rtt_ns: i64,
    pub committed_jitter_ns: i64,
    pub bandwidth_bps: i64,
    pub isis_delay_override_ns: i64,
}

impl Link {
    pub fn effective_status(&self) -> &str {
        effective_link_status(&self.status, self.isis_delay_override_ns)
    }

    pub fn is_drained(&self) -> bool {
        is_drained_status(self.effective_status())
    }

    /// Committed RTT converted from nanoseconds to microseconds for
    /// comparison against measured telemetry.
    pub fn committed_rtt_us(&self) -> f64 {
        self.committed_rtt_ns as f64 / 1_000.0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metro {
    pub pk: String,
    pub code: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contributor {
    pub pk: String,
    pub code: String,
    pub name: String,
}

/// Per-window health classification shared by the status builder and the
/// history bucketizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
    NoData,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Disabled => "disabled",
            Self::NoData => "no_data",
        }
    }
}

/// Loss at or above this fraction of a window marks a link disabled in the
/// status snapshot.
pub const EXTENDED_LOSS_PCT: f64 = 95.0;

/// SLA classification for one link over one observation window.
///
/// `latency_overage_pct` must already be zeroed for links that are not
/// inter-metro WAN links with a positive committed RTT.
pub fn classify_sla(loss_pct: f64, latency_overage_pct: f64) -> HealthState {
    if loss_pct >= EXTENDED_LOSS_PCT {
        HealthState::Disabled
    } else if loss_pct >= 10.0 || latency_overage_pct >= 50.0 {
        HealthState::Unhealthy
    } else if loss_pct >= 1.0 || latency_overage_pct >= 20.0 {
        HealthState::Degraded
    } else {
        HealthState::Healthy
    }
}

/// Latency overage over committed RTT in percent. Only meaningful for
/// inter-metro WAN links with a positive committed RTT; callers pass
/// `eligible = false` otherwise and get 0.
pub fn latency_overage_pct(avg_rtt_us: f64, committed_rtt_us: f64, eligible: bool) -> f64 {
    if !eligible || committed_rtt_us <= 0.0 {
        return 0.0;
    }
    (avg_rtt_us - committed_rtt_us) / committed_rtt_us * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_override_forces_soft_drain() {
        assert_eq!(
            effective_link_status("activated", SOFT_DRAIN_DELAY_OVERRIDE_NS),
            "soft-drained"
        );
        assert_eq!(effective_link_status("activated", 0), "activated");
        // the override wins over any declared status
        assert_eq!(
            effective_link_status("pending", SOFT_DRAIN_DELAY_OVERRIDE_NS),
            "soft-drained"
        );
        assert_eq!(effective_link_status("suspended", 0), "suspended");
    }

    #[test]
    fn isis_enablement_requires_system_id() {
        let mut device = Device::default();
        assert!(!device.is_isis_enabled());
        device.isis_system_id = Some(String::new());
        assert!(!device.is_isis_enabled());
        device.isis_system_id = Some("0001.0002.0003".into());
        assert!(device.is_isis_enabled());
    }

    #[test]
    fn sla_thresholds() {
        assert_eq!(classify_sla(0.0, 0.0), HealthState::Healthy);
        assert_eq!(classify_sla(0.5, 10.0), HealthState::Healthy);
        assert_eq!(classify_sla(1.0, 0.0), HealthState::Degraded);
        assert_eq!(classify_sla(0.0, 20.0), HealthState::Degraded);
        assert_eq!(classify_sla(10.0, 0.0), HealthState::Unhealthy);
        assert_eq!(classify_sla(0.0, 50.0), HealthState::Unhealthy);
        assert_eq!(classify_sla(95.0, 0.0), HealthState::Disabled);
        assert_eq!(classify_sla(99.9, 500.0), HealthState::Disabled);
    }

    #[test]
    fn overage_zeroed_when_not_eligible() {
        assert_eq!(latency_overage_pct(1_500.0, 1_000.0, false), 0.0);
        assert_eq!(latency_overage_pct(1_500.0, 0.0, true), 0.0);
        assert!((latency_overage_pct(1_500.0, 1_000.0, true) - 50.0).abs() < 1e-9);
    }
}
