//! Volume/Spanning Manager
//!
//! Volume and pool bookkeeping plus the state machine that carries a job
//! across cartridges when one fills up.

pub mod spanning;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use spanning::{Operator, OperatorReply, SpanState, SpanningManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    #[default]
    Empty,
    Appendable,
    Full,
    Error,
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VolumeStatus::Empty => "empty",
            VolumeStatus::Appendable => "appendable",
            VolumeStatus::Full => "full",
            VolumeStatus::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub label: String,
    #[serde(default)]
    pub slot: Option<u32>,
    #[serde(default)]
    pub capacity_estimate: Option<u64>,
    #[serde(default)]
    pub used_bytes: u64,
    #[serde(default)]
    pub status: VolumeStatus,
}

impl Volume {
    pub fn new(label: &str, slot: Option<u32>) -> Self {
        Self {
            label: label.to_string(),
            slot,
            capacity_estimate: None,
            used_bytes: 0,
            status: VolumeStatus::Empty,
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self.status, VolumeStatus::Empty | VolumeStatus::Appendable)
    }
}

/// Named set of volumes sharing a retention policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    #[serde(default)]
    pub retention_days: u32,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl Pool {
    pub fn new(name: &str, retention_days: u32, volumes: Vec<Volume>) -> Self {
        Self {
            name: name.to_string(),
            retention_days,
            volumes,
        }
    }

    pub fn volume(&self, label: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.label == label)
    }

    pub fn volume_mut(&mut self, label: &str) -> Option<&mut Volume> {
        self.volumes.iter_mut().find(|v| v.label == label)
    }

    pub fn label_for_slot(&self, slot: u32) -> Option<&str> {
        self.volumes
            .iter()
            .find(|v| v.slot == Some(slot))
            .map(|v| v.label.as_str())
    }

    /// First usable volume with a slot that this job has not written yet.
    pub fn next_usable(&self, used: &[String]) -> Option<&Volume> {
        self.volumes
            .iter()
            .find(|v| v.is_usable() && v.slot.is_some() && !used.contains(&v.label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_usable_skips_full_and_used() {
        let mut pool = Pool::new(
            "weekly",
            28,
            vec![
                Volume::new("W001", Some(1)),
                Volume::new("W002", Some(2)),
                Volume::new("W003", Some(3)),
                Volume::new("W004", None),
            ],
        );
        pool.volume_mut("W002").unwrap().status = VolumeStatus::Full;

        assert_eq!(pool.next_usable(&[]).unwrap().label, "W001");
        assert_eq!(pool.next_usable(&["W001".to_string()]).unwrap().label, "W003");
        assert!(pool
            .next_usable(&["W001".to_string(), "W003".to_string()])
            .is_none());
        assert_eq!(pool.label_for_slot(3), Some("W003"));
    }

    #[test]
    fn test_pool_from_config_json() {
        let pool: Pool = serde_json::from_str(
            r#"{"name": "daily", "retention_days": 7, "volumes": [{"label": "D001", "slot": 4}]}"#,
        )
        .unwrap();
        assert_eq!(pool.volumes[0].status, VolumeStatus::Empty);
        assert_eq!(pool.volumes[0].slot, Some(4));
    }
}
