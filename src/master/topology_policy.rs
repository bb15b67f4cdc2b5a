//! Grace-counted topology fault policies and the redundancy state
//! machine driven by each refresh.

use std::time::{Instant, SystemTime};

use log::warn;

use crate::config::SlaveIdentity;
use crate::error::MasterError;
use crate::recovery::{RecoveryAction, RecoveryEvent};
use crate::topology::{RedundancyState, RedundancyTransitionEvent, TopologyPolicyAction};
use crate::transport::Transport;

use super::MasterInner;

fn map_topology_action(action: TopologyPolicyAction) -> RecoveryAction {
    match action {
        TopologyPolicyAction::Monitor => RecoveryAction::None,
        TopologyPolicyAction::Retry => RecoveryAction::RetryTransition,
        TopologyPolicyAction::Reconfigure => RecoveryAction::Reconfigure,
        TopologyPolicyAction::Degrade | TopologyPolicyAction::FailStop => RecoveryAction::Failover,
    }
}

impl<T: Transport> MasterInner<T> {
    pub(crate) fn refresh_topology_locked(&mut self) -> Result<(), MasterError> {
        let MasterInner { topology, transport, .. } = self;
        if let Err(err) = topology.refresh(transport) {
            self.set_error(format!("topology refresh failed: {}", err));
            return Err(MasterError::TopologyRefreshFailed(err));
        }

        let changes = self.topology.change_set().clone();
        self.redundancy_status.redundancy_healthy = changes.redundancy_healthy;
        if !self.topology_options.enable {
            let (state, reason) = if changes.redundancy_healthy {
                (RedundancyState::RedundantHealthy, "redundancy healthy (policy disabled)")
            } else {
                (RedundancyState::RedundancyDegraded, "redundancy degraded (policy disabled)")
            };
            self.transition_redundancy_state(state, reason.into(), changes.generation);
            return Ok(());
        }

        let missing = self.topology.detect_missing(&self.config.slaves);
        let hot_connected = self.topology.detect_hot_connected(&self.config.slaves);
        self.apply_topology_policy(
            &missing,
            &hot_connected,
            changes.redundancy_healthy,
            changes.generation,
        );
        Ok(())
    }

    pub(crate) fn transition_redundancy_state(
        &mut self,
        new_state: RedundancyState,
        reason: String,
        topology_generation: u64,
    ) {
        if self.redundancy_status.state == new_state {
            self.redundancy_status.last_reason = reason;
            return;
        }
        self.redundancy_transitions.push_back(RedundancyTransitionEvent {
            timestamp: SystemTime::now(),
            cycle_index: self.statistics.cycles_total,
            topology_generation,
            from: self.redundancy_status.state,
            to: new_state,
            reason: reason.clone(),
        });
        while self.redundancy_transitions.len()
            > self.topology_options.max_redundancy_transition_history
        {
            self.redundancy_transitions.pop_front();
        }
        self.redundancy_status.state = new_state;
        self.redundancy_status.last_reason = reason;
        self.redundancy_status.transition_count += 1;
    }

    fn emit_topology_event(
        &mut self,
        slave_position: u16,
        policy_action: TopologyPolicyAction,
        success: bool,
        reason: &str,
        topology_generation: u64,
    ) {
        self.append_recovery_event(RecoveryEvent {
            timestamp: SystemTime::now(),
            cycle_index: self.statistics.cycles_total,
            slave_position,
            al_status_code: 0,
            action: map_topology_action(policy_action),
            success,
            message: format!("topology_generation={} {}", topology_generation, reason),
        });
    }

    /// Run one policy action and report success. Degrade and FailStop are
    /// always "successful"; Retry and Reconfigure delegate to the recovery
    /// engine.
    fn run_topology_action(
        &mut self,
        action: TopologyPolicyAction,
        condition: &'static str,
    ) -> bool {
        match action {
            TopologyPolicyAction::Monitor => true,
            TopologyPolicyAction::Retry | TopologyPolicyAction::Reconfigure => {
                self.recover_network_locked()
            }
            TopologyPolicyAction::Degrade => {
                self.degraded = true;
                warn!("{} policy degraded the master", condition);
                true
            }
            TopologyPolicyAction::FailStop => {
                self.degraded = true;
                self.started = false;
                self.transport.close();
                warn!("{} policy fail-stopped the master", condition);
                true
            }
        }
    }

    pub(crate) fn apply_topology_policy(
        &mut self,
        missing: &[SlaveIdentity],
        hot_connected: &[SlaveIdentity],
        redundancy_healthy: bool,
        topology_generation: u64,
    ) {
        self.redundancy_status.redundancy_healthy = redundancy_healthy;
        let has_missing = !missing.is_empty();
        let has_hot_connected = !hot_connected.is_empty();
        let redundancy_down = !redundancy_healthy;

        self.missing_condition_cycles =
            if has_missing { self.missing_condition_cycles + 1 } else { 0 };
        self.hot_connect_condition_cycles =
            if has_hot_connected { self.hot_connect_condition_cycles + 1 } else { 0 };
        self.redundancy_condition_cycles =
            if redundancy_down { self.redundancy_condition_cycles + 1 } else { 0 };

        if !has_missing {
            self.missing_policy_latched = false;
        }
        if !has_hot_connected {
            self.hot_connect_policy_latched = false;
        }
        if !redundancy_down {
            self.redundancy_policy_latched = false;
        }

        if redundancy_down && !self.redundancy_fault_active {
            self.redundancy_fault_active = true;
            self.redundancy_fault_start = Some(Instant::now());
            self.redundancy_kpis.degrade_events += 1;
            self.redundancy_kpis.last_detection_latency_ms = 0;
            self.transition_redundancy_state(
                RedundancyState::RedundancyDegraded,
                "redundancy down detected".into(),
                topology_generation,
            );
        } else if !redundancy_down && self.redundancy_fault_active {
            self.redundancy_fault_active = false;
            self.redundancy_recovery_start = Some(Instant::now());
            self.redundancy_kpis.recover_events += 1;
            self.transition_redundancy_state(
                RedundancyState::Recovering,
                "redundancy link restored".into(),
                topology_generation,
            );
        }

        if has_missing
            && !self.missing_policy_latched
            && self.missing_condition_cycles >= self.topology_options.missing_grace_cycles
        {
            let action = self.topology_options.missing_slave_action;
            let position = missing[0].position;
            let ok = self.run_topology_action(action, "missing-slave");
            let reason = match (action, ok) {
                (TopologyPolicyAction::Monitor, _) => "missing-slave monitor",
                (TopologyPolicyAction::Retry, true) => "missing-slave retry recovery succeeded",
                (TopologyPolicyAction::Retry, false) => "missing-slave retry recovery failed",
                (TopologyPolicyAction::Reconfigure, true) => {
                    "missing-slave reconfigure recovery succeeded"
                }
                (TopologyPolicyAction::Reconfigure, false) => {
                    "missing-slave reconfigure recovery failed"
                }
                (TopologyPolicyAction::Degrade, _) => "missing-slave degraded",
                (TopologyPolicyAction::FailStop, _) => "missing-slave fail-stop",
            };
            self.emit_topology_event(position, action, ok, reason, topology_generation);
            self.missing_policy_latched = true;
        }

        if has_hot_connected
            && !self.hot_connect_policy_latched
            && self.hot_connect_condition_cycles >= self.topology_options.hot_connect_grace_cycles
        {
            let action = self.topology_options.hot_connect_action;
            let position = hot_connected[0].position;
            let ok = self.run_topology_action(action, "hot-connect");
            let reason = match (action, ok) {
                (TopologyPolicyAction::Monitor, _) => "hot-connect monitor",
                (TopologyPolicyAction::Retry, true) => "hot-connect retry recovery succeeded",
                (TopologyPolicyAction::Retry, false) => "hot-connect retry recovery failed",
                (TopologyPolicyAction::Reconfigure, true) => {
                    "hot-connect reconfigure recovery succeeded"
                }
                (TopologyPolicyAction::Reconfigure, false) => {
                    "hot-connect reconfigure recovery failed"
                }
                (TopologyPolicyAction::Degrade, _) => "hot-connect degraded",
                (TopologyPolicyAction::FailStop, _) => "hot-connect fail-stop",
            };
            self.emit_topology_event(position, action, ok, reason, topology_generation);
            self.hot_connect_policy_latched = true;
        }

        if redundancy_down
            && !self.redundancy_policy_latched
            && self.redundancy_condition_cycles >= self.topology_options.redundancy_grace_cycles
        {
            if let Some(fault_start) = self.redundancy_fault_start {
                self.redundancy_kpis.last_policy_trigger_latency_ms =
                    fault_start.elapsed().as_millis() as i64;
            }
            let action = self.topology_options.redundancy_action;
            let ok = self.run_topology_action(action, "redundancy-down");
            let reason = match (action, ok) {
                (TopologyPolicyAction::Monitor, _) => "redundancy-down monitor",
                (TopologyPolicyAction::Retry, true) => "redundancy-down retry recovery succeeded",
                (TopologyPolicyAction::Retry, false) => "redundancy-down retry recovery failed",
                (TopologyPolicyAction::Reconfigure, true) => {
                    "redundancy-down reconfigure recovery succeeded"
                }
                (TopologyPolicyAction::Reconfigure, false) => {
                    "redundancy-down reconfigure recovery failed"
                }
                (TopologyPolicyAction::Degrade, _) => "redundancy-down degraded",
                (TopologyPolicyAction::FailStop, _) => "redundancy-down fail-stop",
            };
            self.emit_topology_event(0, action, ok, reason, topology_generation);
            self.redundancy_policy_latched = true;
        }

        if !redundancy_down && self.redundancy_status.state == RedundancyState::Recovering {
            if let Some(recovery_start) = self.redundancy_recovery_start {
                self.redundancy_kpis.last_recovery_latency_ms =
                    recovery_start.elapsed().as_millis() as i64;
            }
            self.transition_redundancy_state(
                RedundancyState::RedundantHealthy,
                "redundancy healthy".into(),
                topology_generation,
            );
        }
    }
}
