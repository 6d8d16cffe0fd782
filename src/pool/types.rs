//! Container records and the status state machine of a pool.

use std::{collections::HashMap, time::Instant};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use thiserror::Error;
use utoipa::ToSchema;

use crate::runtime::ContainerHandle;

/// Number of characters of a container id shown to callers.
pub const SHORT_ID_LEN: usize = 12;

pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

// ---------------------------------------------------------------------------
// ContainerStatus
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ContainerStatus {
    /// Started, waiting for the proxy to report ready.
    Provisioning,
    /// Ready and not leased.
    Idle,
    /// Leased to exactly one request.
    Busy,
    /// Being stopped and removed. Terminal.
    Removing,
}

impl ContainerStatus {
    // Valid transitions:
    //   Provisioning → Idle | Busy | Removing
    //   Idle         → Busy | Removing
    //   Busy         → Idle | Removing
    //   Removing     → (none)
    pub fn can_transition_to(self, next: ContainerStatus) -> bool {
        use ContainerStatus::*;
        matches!(
            (self, next),
            (Provisioning, Idle) |
                (Provisioning, Busy) |
                (Provisioning, Removing) |
                (Idle, Busy) |
                (Idle, Removing) |
                (Busy, Idle) |
                (Busy, Removing)
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition for container {container_id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub container_id: String,
    pub from: ContainerStatus,
    pub to: ContainerStatus,
}

// ---------------------------------------------------------------------------
// ContainerRecord
// ---------------------------------------------------------------------------

/// One container owned by a pool.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub handle: ContainerHandle,
    pub status: ContainerStatus,
    pub host_port: u16,
    pub last_active: Instant,
}

impl ContainerRecord {
    pub fn new(handle: ContainerHandle, host_port: u16) -> Self {
        Self {
            handle,
            status: ContainerStatus::Provisioning,
            host_port,
            last_active: Instant::now(),
        }
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.handle.id)
    }

    /// Move to `next` and refresh `last_active`.
    pub fn transition(&mut self, next: ContainerStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                container_id: self.handle.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.last_active = Instant::now();
        self.status = next;
        Ok(())
    }

    pub fn is_idle_expired(&self, now: Instant, idle_timeout: std::time::Duration) -> bool {
        self.status == ContainerStatus::Idle &&
            now.saturating_duration_since(self.last_active) > idle_timeout
    }

    pub fn summary(&self) -> ContainerSummary {
        ContainerSummary {
            id: self.short_id().to_string(),
            host_port: self.host_port,
            status: self.status,
        }
    }
}

// ---------------------------------------------------------------------------
// ContainerStore
// ---------------------------------------------------------------------------

/// Container records keyed by container id.
#[derive(Debug, Default)]
pub struct ContainerStore {
    map: HashMap<String, ContainerRecord>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ContainerRecord> {
        self.map.get_mut(id)
    }

    pub fn insert(&mut self, record: ContainerRecord) {
        self.map.insert(record.handle.id.clone(), record);
    }

    pub fn remove(&mut self, id: &str) -> Option<ContainerRecord> {
        self.map.remove(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &ContainerRecord> {
        self.map.values()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut ContainerRecord> {
        self.map.values_mut()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn count(&self, status: ContainerStatus) -> usize {
        self.map.values().filter(|c| c.status == status).count()
    }
}

// ---------------------------------------------------------------------------
// Status snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub host_port: u16,
    pub status: ContainerStatus,
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PoolStatus {
    pub function: String,
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub provisioning: usize,
    pub removing: usize,
    pub containers: Vec<ContainerSummary>,
}

impl PoolStatus {
    pub fn from_store(function: &str, store: &ContainerStore) -> Self {
        let mut containers: Vec<ContainerSummary> =
            store.values().map(ContainerRecord::summary).collect();
        containers.sort_by_key(|c| c.host_port);
        Self {
            function: function.to_string(),
            total: store.len(),
            idle: store.count(ContainerStatus::Idle),
            busy: store.count(ContainerStatus::Busy),
            provisioning: store.count(ContainerStatus::Provisioning),
            removing: store.count(ContainerStatus::Removing),
            containers,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, SocketAddr},
        time::Duration,
    };

    use super::*;

    fn record(id: &str, port: u16) -> ContainerRecord {
        ContainerRecord::new(
            ContainerHandle {
                id: id.to_string(),
                name: format!("fn-{}", id),
                endpoint: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            },
            port,
        )
    }

    #[test]
    fn test_valid_lifecycle() {
        let mut c = record("abcdef0123456789", 8000);
        assert_eq!(c.status, ContainerStatus::Provisioning);
        c.transition(ContainerStatus::Busy).unwrap();
        c.transition(ContainerStatus::Idle).unwrap();
        c.transition(ContainerStatus::Busy).unwrap();
        c.transition(ContainerStatus::Idle).unwrap();
        c.transition(ContainerStatus::Removing).unwrap();
    }

    #[test]
    fn test_rejects_illegal_transitions() {
        let mut c = record("c1", 8000);
        c.transition(ContainerStatus::Busy).unwrap();
        let err = c.transition(ContainerStatus::Provisioning).unwrap_err();
        assert_eq!(err.from, ContainerStatus::Busy);
        assert_eq!(err.to, ContainerStatus::Provisioning);
        // state unchanged after a rejected transition
        assert_eq!(c.status, ContainerStatus::Busy);

        c.transition(ContainerStatus::Idle).unwrap();
        assert!(c.transition(ContainerStatus::Idle).is_err());

        c.transition(ContainerStatus::Removing).unwrap();
        for next in [
            ContainerStatus::Provisioning,
            ContainerStatus::Idle,
            ContainerStatus::Busy,
            ContainerStatus::Removing,
        ] {
            assert!(c.transition(next).is_err());
        }
    }

    #[test]
    fn test_idle_expiry_only_applies_to_idle() {
        let mut c = record("c1", 8000);
        c.transition(ContainerStatus::Busy).unwrap();
        let later = Instant::now() + Duration::from_secs(10);
        assert!(!c.is_idle_expired(later, Duration::from_secs(1)));
        c.transition(ContainerStatus::Idle).unwrap();
        assert!(c.is_idle_expired(later, Duration::from_secs(1)));
        assert!(!c.is_idle_expired(later, Duration::from_secs(60)));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("short"), "short");
    }

    #[test]
    fn test_pool_status_counts() {
        let mut store = ContainerStore::new();
        let mut a = record("a", 8001);
        a.transition(ContainerStatus::Idle).unwrap();
        let mut b = record("b", 8000);
        b.transition(ContainerStatus::Busy).unwrap();
        store.insert(a);
        store.insert(b);
        store.insert(record("c", 8002));

        let status = PoolStatus::from_store("fn", &store);
        assert_eq!(status.total, 3);
        assert_eq!(status.idle, 1);
        assert_eq!(status.busy, 1);
        assert_eq!(status.provisioning, 1);
        assert_eq!(status.removing, 0);
        assert_eq!(status.containers[0].host_port, 8000);
        assert_eq!(status.containers[0].status, ContainerStatus::Busy);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ContainerStatus::Provisioning).unwrap();
        assert_eq!(json, "\"provisioning\"");
        assert_eq!(ContainerStatus::Removing.to_string(), "removing");
    }
}
