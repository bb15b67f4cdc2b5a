//! Topology reconciliation and fault-policy scenarios.

use ethercat_rt::transport::MockTransport;
use ethercat_rt::{
    EthercatMaster, NetworkConfiguration, RecoveryAction, RedundancyState, SignalBinding,
    SlaveIdentity, StateMachineOptions, TopologyPolicyAction, TopologyRecoveryOptions,
    TopologySlaveInfo,
};

fn expected_config() -> NetworkConfiguration {
    NetworkConfiguration {
        slaves: vec![SlaveIdentity::new("EL1008", 1), SlaveIdentity::new("EL2008", 2)],
        signals: vec![
            SignalBinding::input("InputA", "EL1008", 0, 0),
            SignalBinding::output("OutputA", "EL2008", 0, 0),
        ],
        process_image_input_bytes: 1,
        process_image_output_bytes: 1,
    }
}

fn online(position: u16) -> TopologySlaveInfo {
    TopologySlaveInfo {
        position,
        vendor_id: 2,
        product_code: 0x1000 + u32::from(position),
        online: true,
        ..TopologySlaveInfo::default()
    }
}

fn started_master(mock: &MockTransport) -> EthercatMaster<MockTransport> {
    let _ = env_logger::builder().is_test(true).try_init();
    let master = EthercatMaster::new(mock.clone());
    master.set_state_machine_options(StateMachineOptions {
        enable: false,
        ..StateMachineOptions::default()
    });
    master.configure(expected_config()).unwrap();
    master.start().unwrap();
    master
}

#[test]
fn reconcile_missing_and_hot_connect_with_redundancy_fault() {
    let mock = MockTransport::new(1, 1);
    let master = started_master(&mock);

    // Discovered chain misses slave 2 and carries a stranger at 3; the
    // redundant link is down.
    mock.set_discovered_slaves(vec![online(1), online(3)]);
    mock.set_redundancy_healthy(false);
    master.refresh_topology().unwrap();

    let change_set = master.topology_change_set();
    let added: Vec<u16> = change_set.added.iter().map(|slave| slave.position).collect();
    assert_eq!(added, vec![1, 3]);
    assert!(change_set.removed.is_empty());
    assert!(change_set.changed);

    assert_eq!(master.redundancy_status().state, RedundancyState::RedundancyDegraded);
    let missing: Vec<u16> = master.missing_slaves().iter().map(|slave| slave.position).collect();
    assert_eq!(missing, vec![2]);
    let hot: Vec<u16> =
        master.hot_connected_slaves().iter().map(|slave| slave.position).collect();
    assert_eq!(hot, vec![3]);

    let generation = master.topology_generation();

    // Slave 2 returns and the redundant link heals.
    mock.set_discovered_slaves(vec![online(1), online(2), online(3)]);
    mock.set_redundancy_healthy(true);
    master.refresh_topology().unwrap();

    assert_eq!(master.topology_generation(), generation + 1);
    let change_set = master.topology_change_set();
    let added: Vec<u16> = change_set.added.iter().map(|slave| slave.position).collect();
    assert_eq!(added, vec![2]);
    assert_eq!(master.redundancy_status().state, RedundancyState::RedundantHealthy);
    assert!(master.redundancy_status().transition_count >= 1);

    let kpis = master.redundancy_kpis();
    assert_eq!(kpis.degrade_events, 1);
    assert_eq!(kpis.recover_events, 1);
    assert!(kpis.last_recovery_latency_ms >= 0);

    let transitions = master.redundancy_transitions();
    assert!(transitions.len() >= 2);
    assert_eq!(transitions[0].to, RedundancyState::RedundancyDegraded);
    assert_eq!(transitions.last().unwrap().to, RedundancyState::RedundantHealthy);
}

#[test]
fn missing_policy_respects_grace_and_fires_once_per_episode() {
    let mock = MockTransport::new(1, 1);
    let master = started_master(&mock);
    master.set_topology_options(TopologyRecoveryOptions {
        missing_grace_cycles: 3,
        missing_slave_action: TopologyPolicyAction::Monitor,
        ..TopologyRecoveryOptions::default()
    });

    mock.set_discovered_slaves(vec![online(1)]);

    // Two refreshes inside the grace window: no event yet.
    master.refresh_topology().unwrap();
    master.refresh_topology().unwrap();
    assert!(master.recovery_events().is_empty());

    // Third consecutive observation fires exactly once.
    master.refresh_topology().unwrap();
    master.refresh_topology().unwrap();
    master.refresh_topology().unwrap();
    let events = master.recovery_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].slave_position, 2);
    assert_eq!(events[0].action, RecoveryAction::None);
    assert!(events[0].message.contains("missing-slave monitor"));

    // The condition clears, then returns: a fresh grace window applies.
    mock.set_discovered_slaves(vec![online(1), online(2)]);
    master.refresh_topology().unwrap();
    mock.set_discovered_slaves(vec![online(1)]);
    master.refresh_topology().unwrap();
    master.refresh_topology().unwrap();
    assert_eq!(master.recovery_events().len(), 1);
    master.refresh_topology().unwrap();
    assert_eq!(master.recovery_events().len(), 2);
}

#[test]
fn hot_connect_degrade_policy_marks_master_degraded() {
    let mock = MockTransport::new(1, 1);
    let master = started_master(&mock);
    master.set_topology_options(TopologyRecoveryOptions {
        hot_connect_grace_cycles: 2,
        hot_connect_action: TopologyPolicyAction::Degrade,
        ..TopologyRecoveryOptions::default()
    });

    mock.set_discovered_slaves(vec![online(1), online(2), online(7)]);
    master.refresh_topology().unwrap();
    assert!(!master.is_degraded());
    master.refresh_topology().unwrap();
    assert!(master.is_degraded());

    let events = master.recovery_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].slave_position, 7);
    assert!(events[0].message.contains("hot-connect degraded"));
}

#[test]
fn missing_fail_stop_policy_stops_the_master() {
    let mock = MockTransport::new(1, 1);
    let master = started_master(&mock);
    master.set_topology_options(TopologyRecoveryOptions {
        missing_grace_cycles: 1,
        missing_slave_action: TopologyPolicyAction::FailStop,
        ..TopologyRecoveryOptions::default()
    });

    mock.set_discovered_slaves(vec![online(1)]);
    master.refresh_topology().unwrap();

    assert!(master.is_degraded());
    assert!(master.run_cycle().is_err());
}

#[test]
fn degraded_redundancy_counts_impacted_cycles() {
    let mock = MockTransport::new(1, 1);
    let master = started_master(&mock);

    mock.set_discovered_slaves(vec![online(1), online(2)]);
    mock.set_redundancy_healthy(false);
    master.refresh_topology().unwrap();
    assert_eq!(master.redundancy_status().state, RedundancyState::RedundancyDegraded);

    master.run_cycle().unwrap();
    master.run_cycle().unwrap();
    assert_eq!(master.redundancy_kpis().impacted_cycles, 2);

    mock.set_redundancy_healthy(true);
    master.refresh_topology().unwrap();
    assert_eq!(master.redundancy_status().state, RedundancyState::RedundantHealthy);
    master.run_cycle().unwrap();
    assert_eq!(master.redundancy_kpis().impacted_cycles, 2);
}

#[test]
fn policy_disabled_still_tracks_redundancy_state() {
    let mock = MockTransport::new(1, 1);
    let master = started_master(&mock);
    master.set_topology_options(TopologyRecoveryOptions {
        enable: false,
        ..TopologyRecoveryOptions::default()
    });

    mock.set_discovered_slaves(vec![online(1), online(2)]);
    mock.set_redundancy_healthy(false);
    master.refresh_topology().unwrap();
    assert_eq!(master.redundancy_status().state, RedundancyState::RedundancyDegraded);
    // No policy, no degraded flag and no events.
    assert!(!master.is_degraded());
    assert!(master.recovery_events().is_empty());

    mock.set_redundancy_healthy(true);
    master.refresh_topology().unwrap();
    assert_eq!(master.redundancy_status().state, RedundancyState::RedundantHealthy);
}
