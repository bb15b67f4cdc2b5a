//! Topology reconciliation: snapshots scanned from the live chain are
//! compared against the previous snapshot to produce deterministic change
//! sets, and against the declared configuration to find missing and
//! hot-connected slaves.

use std::collections::HashSet;
use std::time::SystemTime;

use crate::al_state::AlState;
use crate::config::SlaveIdentity;
use crate::error::TransportError;
use crate::transport::Transport;

/// One discovered chain entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TopologySlaveInfo {
    pub position: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    pub esc_type: u16,
    pub esc_revision: u16,
    pub identity_from_coe: bool,
    pub identity_from_sii: bool,
    pub al_state: Option<AlState>,
    pub online: bool,
}

/// Snapshot of one discovery scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopologySnapshot {
    pub slaves: Vec<TopologySlaveInfo>,
    pub redundancy_healthy: bool,
}

/// Per-slave delta between two snapshots sharing a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TopologySlaveDelta {
    pub position: u16,
    pub was_online: bool,
    pub is_online: bool,
    pub previous_vendor_id: u32,
    pub previous_product_code: u32,
    pub vendor_id: u32,
    pub product_code: u32,
}

/// Deterministic change set emitted by a refresh.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopologyChangeSet {
    /// Monotonic counter of refreshes that observed any change.
    pub generation: u64,
    pub changed: bool,
    pub redundancy_changed: bool,
    pub previous_redundancy_healthy: bool,
    pub redundancy_healthy: bool,
    pub added: Vec<TopologySlaveInfo>,
    pub removed: Vec<TopologySlaveInfo>,
    pub updated: Vec<TopologySlaveDelta>,
}

/// Reconciles live scans into snapshots and change sets. The transport is
/// handed in per refresh; the manager owns only derived state.
#[derive(Debug, Default)]
pub struct TopologyManager {
    snapshot: TopologySnapshot,
    change_set: TopologyChangeSet,
    generation: u64,
    refreshed_once: bool,
}

impl TopologyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Scan the chain and reconcile against the previous snapshot.
    pub fn refresh<T: Transport>(&mut self, transport: &mut T) -> Result<(), TransportError> {
        let mut new_snapshot = transport.discover_topology()?;
        new_snapshot.redundancy_healthy = transport.is_redundancy_link_healthy()?;

        let change_set = self.diff(&new_snapshot);
        if change_set.changed || change_set.redundancy_changed {
            self.generation += 1;
        }
        self.change_set = TopologyChangeSet { generation: self.generation, ..change_set };
        self.snapshot = new_snapshot;
        self.refreshed_once = true;
        Ok(())
    }

    fn diff(&self, new_snapshot: &TopologySnapshot) -> TopologyChangeSet {
        let previous_positions: HashSet<u16> =
            self.snapshot.slaves.iter().map(|slave| slave.position).collect();
        let new_positions: HashSet<u16> =
            new_snapshot.slaves.iter().map(|slave| slave.position).collect();

        let added: Vec<TopologySlaveInfo> = new_snapshot
            .slaves
            .iter()
            .filter(|slave| !previous_positions.contains(&slave.position))
            .copied()
            .collect();
        let removed: Vec<TopologySlaveInfo> = self
            .snapshot
            .slaves
            .iter()
            .filter(|slave| !new_positions.contains(&slave.position))
            .copied()
            .collect();

        let mut updated = Vec::new();
        for current in &new_snapshot.slaves {
            let previous = match self
                .snapshot
                .slaves
                .iter()
                .find(|slave| slave.position == current.position)
            {
                Some(previous) => previous,
                None => continue,
            };
            if previous.online != current.online
                || previous.vendor_id != current.vendor_id
                || previous.product_code != current.product_code
            {
                updated.push(TopologySlaveDelta {
                    position: current.position,
                    was_online: previous.online,
                    is_online: current.online,
                    previous_vendor_id: previous.vendor_id,
                    previous_product_code: previous.product_code,
                    vendor_id: current.vendor_id,
                    product_code: current.product_code,
                });
            }
        }

        let previous_redundancy_healthy = if self.refreshed_once {
            self.snapshot.redundancy_healthy
        } else {
            new_snapshot.redundancy_healthy
        };
        TopologyChangeSet {
            generation: self.generation,
            changed: !added.is_empty() || !removed.is_empty() || !updated.is_empty(),
            redundancy_changed: previous_redundancy_healthy != new_snapshot.redundancy_healthy,
            previous_redundancy_healthy,
            redundancy_healthy: new_snapshot.redundancy_healthy,
            added,
            removed,
            updated,
        }
    }

    pub fn snapshot(&self) -> &TopologySnapshot {
        &self.snapshot
    }

    pub fn change_set(&self) -> &TopologyChangeSet {
        &self.change_set
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Expected slaves whose position is not online in the snapshot.
    pub fn detect_missing(&self, expected: &[SlaveIdentity]) -> Vec<SlaveIdentity> {
        let online: HashSet<u16> = self
            .snapshot
            .slaves
            .iter()
            .filter(|slave| slave.online)
            .map(|slave| slave.position)
            .collect();
        expected
            .iter()
            .filter(|slave| !online.contains(&slave.position))
            .cloned()
            .collect()
    }

    /// Online slaves whose position is not part of the expected chain.
    pub fn detect_hot_connected(&self, expected: &[SlaveIdentity]) -> Vec<SlaveIdentity> {
        let expected_positions: HashSet<u16> =
            expected.iter().map(|slave| slave.position).collect();
        self.snapshot
            .slaves
            .iter()
            .filter(|info| info.online && !expected_positions.contains(&info.position))
            .map(|info| SlaveIdentity {
                name: format!("HotConnected@{}", info.position),
                alias: 0,
                position: info.position,
                vendor_id: info.vendor_id,
                product_code: info.product_code,
            })
            .collect()
    }
}

/// Action bound to one of the topology fault conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyPolicyAction {
    #[default]
    Monitor,
    Retry,
    Reconfigure,
    Degrade,
    FailStop,
}

/// Per-condition grace-cycle counts and actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyRecoveryOptions {
    pub enable: bool,
    pub missing_grace_cycles: usize,
    pub missing_slave_action: TopologyPolicyAction,
    pub hot_connect_grace_cycles: usize,
    pub hot_connect_action: TopologyPolicyAction,
    pub redundancy_grace_cycles: usize,
    pub redundancy_action: TopologyPolicyAction,
    pub max_redundancy_transition_history: usize,
}

impl Default for TopologyRecoveryOptions {
    fn default() -> Self {
        Self {
            enable: true,
            missing_grace_cycles: 1,
            missing_slave_action: TopologyPolicyAction::Monitor,
            hot_connect_grace_cycles: 1,
            hot_connect_action: TopologyPolicyAction::Monitor,
            redundancy_grace_cycles: 1,
            redundancy_action: TopologyPolicyAction::Degrade,
            max_redundancy_transition_history: 64,
        }
    }
}

/// Redundancy path state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RedundancyState {
    #[default]
    PrimaryOnly,
    RedundantHealthy,
    RedundancyDegraded,
    Recovering,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RedundancyStatusSnapshot {
    pub state: RedundancyState,
    pub redundancy_healthy: bool,
    pub transition_count: u64,
    pub last_reason: String,
}

/// Redundancy KPI counters; latencies are -1 until first measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedundancyKpiSnapshot {
    pub degrade_events: u64,
    pub recover_events: u64,
    pub impacted_cycles: u64,
    pub last_detection_latency_ms: i64,
    pub last_policy_trigger_latency_ms: i64,
    pub last_recovery_latency_ms: i64,
}

impl Default for RedundancyKpiSnapshot {
    fn default() -> Self {
        Self {
            degrade_events: 0,
            recover_events: 0,
            impacted_cycles: 0,
            last_detection_latency_ms: -1,
            last_policy_trigger_latency_ms: -1,
            last_recovery_latency_ms: -1,
        }
    }
}

/// One redundancy state transition, kept in a bounded history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedundancyTransitionEvent {
    pub timestamp: SystemTime,
    pub cycle_index: u64,
    pub topology_generation: u64,
    pub from: RedundancyState,
    pub to: RedundancyState,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn info(position: u16, online: bool) -> TopologySlaveInfo {
        TopologySlaveInfo {
            position,
            vendor_id: 2,
            product_code: position as u32,
            online,
            ..TopologySlaveInfo::default()
        }
    }

    #[test]
    fn generation_advances_only_on_change() {
        let mock = MockTransport::new(1, 1);
        let mut transport = mock.clone();
        transport.open().unwrap();
        mock.set_discovered_slaves(vec![info(1, true)]);

        let mut manager = TopologyManager::new();
        manager.refresh(&mut transport).unwrap();
        assert_eq!(manager.generation(), 1);
        assert!(manager.change_set().changed);

        // Same topology again: no change, same generation.
        manager.refresh(&mut transport).unwrap();
        assert_eq!(manager.generation(), 1);
        assert!(!manager.change_set().changed);

        mock.set_discovered_slaves(vec![info(1, true), info(2, true)]);
        manager.refresh(&mut transport).unwrap();
        assert_eq!(manager.generation(), 2);
        assert_eq!(manager.change_set().added.len(), 1);
        assert_eq!(manager.change_set().added[0].position, 2);
    }

    #[test]
    fn change_flag_iff_delta_non_empty() {
        let mock = MockTransport::new(1, 1);
        let mut transport = mock.clone();
        transport.open().unwrap();
        mock.set_discovered_slaves(vec![info(1, true), info(2, true)]);

        let mut manager = TopologyManager::new();
        manager.refresh(&mut transport).unwrap();

        // Vendor id change on position 2 shows up as an update.
        let mut changed = info(2, true);
        changed.vendor_id = 99;
        mock.set_discovered_slaves(vec![info(1, true), changed]);
        manager.refresh(&mut transport).unwrap();
        let change_set = manager.change_set();
        assert!(change_set.changed);
        assert!(change_set.added.is_empty());
        assert!(change_set.removed.is_empty());
        assert_eq!(change_set.updated.len(), 1);
        assert_eq!(change_set.updated[0].previous_vendor_id, 2);
        assert_eq!(change_set.updated[0].vendor_id, 99);

        mock.set_discovered_slaves(vec![info(1, true)]);
        manager.refresh(&mut transport).unwrap();
        let change_set = manager.change_set();
        assert!(change_set.changed);
        assert_eq!(change_set.removed.len(), 1);
        assert_eq!(change_set.removed[0].position, 2);
    }

    #[test]
    fn redundancy_flip_advances_generation() {
        let mock = MockTransport::new(1, 1);
        let mut transport = mock.clone();
        transport.open().unwrap();
        mock.set_discovered_slaves(vec![info(1, true)]);

        let mut manager = TopologyManager::new();
        manager.refresh(&mut transport).unwrap();
        let base = manager.generation();

        mock.set_redundancy_healthy(false);
        manager.refresh(&mut transport).unwrap();
        let change_set = manager.change_set();
        assert_eq!(manager.generation(), base + 1);
        assert!(change_set.redundancy_changed);
        assert!(change_set.previous_redundancy_healthy);
        assert!(!change_set.redundancy_healthy);
        assert!(!change_set.changed);
    }

    #[test]
    fn missing_and_hot_connected_against_expected() {
        let mock = MockTransport::new(1, 1);
        let mut transport = mock.clone();
        transport.open().unwrap();
        mock.set_discovered_slaves(vec![info(1, true), info(3, true)]);

        let mut manager = TopologyManager::new();
        manager.refresh(&mut transport).unwrap();

        let expected = vec![SlaveIdentity::new("EL1008", 1), SlaveIdentity::new("EL2008", 2)];
        let missing = manager.detect_missing(&expected);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].position, 2);

        let hot = manager.detect_hot_connected(&expected);
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].position, 3);
        assert_eq!(hot[0].name, "HotConnected@3");
    }
}
