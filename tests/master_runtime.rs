//! End-to-end master scenarios against the in-memory mock transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ethercat_rt::frame::coe::SdoAddress;
use ethercat_rt::transport::{MockTransport, Transport};
use ethercat_rt::{
    AlState, DcClosedLoopOptions, DcPolicyAction, DcSyncQualityOptions, EthercatMaster,
    NetworkConfiguration, RecoveryAction, RecoveryOptions, SignalBinding, SlaveIdentity,
    StateMachineOptions,
};

fn two_slave_config() -> NetworkConfiguration {
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

fn master_without_ladder(mock: &MockTransport) -> EthercatMaster<MockTransport> {
    let _ = env_logger::builder().is_test(true).try_init();
    let master = EthercatMaster::new(mock.clone());
    master.set_state_machine_options(StateMachineOptions {
        enable: false,
        ..StateMachineOptions::default()
    });
    master.configure(two_slave_config()).unwrap();
    master.start().unwrap();
    master
}

#[test]
fn mock_op_cycle_moves_bits_both_ways() {
    let mock = MockTransport::new(1, 1);
    let master = master_without_ladder(&mock);

    let observed: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    master
        .on_input_change("InputA", Box::new(move |value| sink.lock().unwrap().push(value)))
        .unwrap();

    mock.set_input_bit(0, 0, true);
    master.run_cycle().unwrap();
    assert_eq!(*observed.lock().unwrap(), vec![true]);
    assert_eq!(master.get_input_by_name("InputA").unwrap(), true);

    // A steady input does not re-fire the callback.
    master.run_cycle().unwrap();
    assert_eq!(observed.lock().unwrap().len(), 1);

    master.set_output_by_name("OutputA", true).unwrap();
    master.run_cycle().unwrap();
    assert!(mock.last_output_bit(0, 0));

    let statistics = master.statistics();
    assert_eq!(statistics.cycles_total, 3);
    assert_eq!(statistics.cycles_failed, 0);
    assert_eq!(statistics.cycles_succeeded(), 3);
    assert_eq!(statistics.last_working_counter, 1);
}

#[test]
fn startup_ladder_bootstraps_mapping_before_safe_op() {
    let mock = MockTransport::new(1, 1);
    let master = EthercatMaster::new(mock.clone());
    master.configure(two_slave_config()).unwrap();
    master.start().unwrap();

    assert!(mock.process_image_configured());
    let mut transport = mock.clone();
    assert_eq!(transport.read_network_state().unwrap(), AlState::Op);

    master.stop();
    // A stopped master fails cycles but keeps counting them.
    assert!(master.run_cycle().is_err());
    assert_eq!(master.statistics().cycles_failed, 1);
}

#[test]
fn unconfigured_master_refuses_to_start() {
    let mock = MockTransport::new(1, 1);
    let master: EthercatMaster<MockTransport> = EthercatMaster::new(mock.clone());
    assert!(master.start().is_err());
    assert!(master.last_error().is_some());
}

#[test]
fn configuration_errors_leave_no_partial_state() {
    let mock = MockTransport::new(1, 1);
    let master = EthercatMaster::new(mock.clone());
    let mut config = two_slave_config();
    config.signals.push(SignalBinding::input("InputA", "EL1008", 0, 1));
    assert!(master.configure(config).is_err());
    assert!(master.start().is_err());
}

#[test]
fn rejected_reconfiguration_keeps_the_running_master_intact() {
    let mock = MockTransport::new(1, 1);
    let master = master_without_ladder(&mock);
    mock.set_input_bit(0, 0, true);
    master.run_cycle().unwrap();
    assert_eq!(master.get_input_by_name("InputA").unwrap(), true);

    let mut bad = two_slave_config();
    bad.signals.push(SignalBinding::output("OutputA", "EL2008", 0, 1));
    assert!(master.configure(bad).is_err());
    assert!(master.last_error().unwrap().contains("duplicate"));

    // Previous bindings, image contents and counters all survive.
    assert_eq!(master.get_input_by_name("InputA").unwrap(), true);
    assert_eq!(master.statistics().cycles_total, 1);
    master.set_output_by_name("OutputA", true).unwrap();
    master.run_cycle().unwrap();
    assert!(mock.last_output_bit(0, 0));
    assert_eq!(master.statistics().cycles_total, 2);
}

#[test]
fn exchange_failure_recovers_and_next_cycle_succeeds() {
    let mock = MockTransport::new(1, 1);
    let master = master_without_ladder(&mock);

    // Slave 1 healthy in OP; slave 2 stuck in SAFE-OP with a recoverable
    // sync-manager configuration error.
    mock.set_slave_state(1, AlState::Op);
    mock.set_slave_state(2, AlState::SafeOp);
    mock.set_slave_al_status_code(2, 0x0017);
    mock.inject_exchange_failures(1);

    assert!(master.run_cycle().is_err());
    assert!(master.last_error().is_some());

    master.run_cycle().unwrap();

    let statistics = master.statistics();
    assert_eq!(statistics.cycles_total, 2);
    assert_eq!(statistics.cycles_failed, 1);

    let events = master.recovery_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].slave_position, 2);
    assert_eq!(events[0].al_status_code, 0x0017);
    assert!(matches!(
        events[0].action,
        RecoveryAction::RetryTransition | RecoveryAction::Reconfigure
    ));
    assert!(events[0].success);

    // Recovery drove the slave back to OP.
    let mut transport = mock.clone();
    assert_eq!(transport.read_slave_state(2).unwrap(), AlState::Op);
}

#[test]
fn recovery_override_forces_configured_action() {
    let mock = MockTransport::new(1, 1);
    let master = master_without_ladder(&mock);
    mock.set_slave_state(1, AlState::Op);
    mock.set_slave_state(2, AlState::SafeOp);
    mock.set_slave_al_status_code(2, 0x0017);
    master.set_recovery_action_override(0x0017, RecoveryAction::Failover);

    let diagnostics = master.collect_slave_diagnostics();
    let slave2 = diagnostics.iter().find(|d| d.identity.position == 2).unwrap();
    assert_eq!(slave2.suggested_action, RecoveryAction::Failover);

    assert!(master.recover_network());
    assert!(master.is_degraded());

    master.clear_recovery_action_overrides();
    mock.set_slave_al_status_code(2, 0x0017);
    mock.set_slave_state(2, AlState::SafeOp);
    let diagnostics = master.collect_slave_diagnostics();
    let slave2 = diagnostics.iter().find(|d| d.identity.position == 2).unwrap();
    assert_ne!(slave2.suggested_action, RecoveryAction::Failover);
}

#[test]
fn stop_on_failover_closes_the_transport() {
    let mock = MockTransport::new(1, 1);
    let master = master_without_ladder(&mock);
    master.set_recovery_options(RecoveryOptions {
        stop_master_on_failover: true,
        max_reconfigure_per_slave: 0,
        ..RecoveryOptions::default()
    });
    mock.set_slave_state(1, AlState::Op);
    mock.set_slave_state(2, AlState::SafeOp);
    // Unrecoverable firmware fault burns straight through the ladder.
    mock.set_slave_al_status_code(2, 0x0014);

    assert!(master.recover_network());
    assert!(master.is_degraded());
    assert!(master.run_cycle().is_err());
}

#[test]
fn recovery_event_ring_is_bounded_and_ordered() {
    let mock = MockTransport::new(1, 1);
    let master = master_without_ladder(&mock);
    master.set_recovery_options(RecoveryOptions {
        max_event_history: 2,
        ..RecoveryOptions::default()
    });
    mock.set_slave_state(1, AlState::Op);

    for _ in 0..3 {
        master.run_cycle().unwrap();
        mock.set_slave_state(2, AlState::SafeOp);
        mock.set_slave_al_status_code(2, 0x0017);
        master.recover_network();
    }

    let events = master.recovery_events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].cycle_index, 2);
    assert_eq!(events[1].cycle_index, 3);
    assert!(events[0].cycle_index <= events[1].cycle_index);
}

#[test]
fn sdo_services_and_emergencies_pass_through() {
    let mock = MockTransport::new(1, 1);
    let master = master_without_ladder(&mock);

    let address = SdoAddress::new(0x8000, 0x01);
    master.sdo_download(2, address, &[0xDE, 0xAD]).unwrap();
    assert_eq!(master.sdo_upload(2, address).unwrap(), vec![0xDE, 0xAD]);

    mock.enqueue_emergency(ethercat_rt::frame::coe::EmergencyMessage {
        error_code: 0x8130,
        error_register: 0x01,
        manufacturer_data: [1, 2, 3, 4, 5],
        slave_position: 2,
    });
    let drained = master.drain_emergencies(4);
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].error_code, 0x8130);
    assert!(master.drain_emergencies(4).is_empty());
}

#[test]
fn raw_byte_window_access_is_bounds_checked() {
    let mock = MockTransport::new(2, 2);
    let master = EthercatMaster::new(mock.clone());
    master.set_state_machine_options(StateMachineOptions {
        enable: false,
        ..StateMachineOptions::default()
    });
    let mut config = two_slave_config();
    config.process_image_input_bytes = 2;
    config.process_image_output_bytes = 2;
    master.configure(config).unwrap();
    master.start().unwrap();

    master.write_output_bytes(1, &[0x5A]).unwrap();
    assert!(master.write_output_bytes(2, &[0x01]).is_err());
    assert!(master.write_output_bytes(0, &[0, 0, 0]).is_err());

    mock.set_input_bytes(0, &[0x11, 0x22]);
    master.run_cycle().unwrap();
    assert_eq!(master.read_input_bytes(0, 2).unwrap(), vec![0x11, 0x22]);
    assert!(master.read_input_bytes(1, 2).is_err());
    assert!(mock.last_output_bit(1, 1));
}

#[test]
fn dc_closed_loop_applies_slew_limited_corrections() {
    let mock = MockTransport::new(1, 1);
    let master = EthercatMaster::new(mock.clone());
    master.set_state_machine_options(StateMachineOptions {
        enable: false,
        ..StateMachineOptions::default()
    });
    master.set_dc_options(DcClosedLoopOptions {
        enabled: true,
        reference_slave_position: 1,
        ..DcClosedLoopOptions::default()
    });
    master.configure(two_slave_config()).unwrap();
    master.start().unwrap();

    // Reference clock far ahead of the host clock: the raw correction
    // saturates, the applied correction ramps at the slew limit.
    mock.set_dc_system_time(1, 10_000_000_000);
    master.run_cycle().unwrap();
    assert_eq!(master.last_applied_dc_correction_ns(), Some(5_000));
    assert_eq!(mock.dc_time_offset(1), Some(5_000));

    master.run_cycle().unwrap();
    assert_eq!(master.last_applied_dc_correction_ns(), Some(10_000));

    let stats = master.distributed_clock_stats();
    assert_eq!(stats.samples, 2);
    assert!(stats.max_abs_offset_ns > 0);
}

#[test]
fn dc_read_failure_fails_the_cycle() {
    let mock = MockTransport::new(1, 1);
    let master = EthercatMaster::new(mock.clone());
    master.set_state_machine_options(StateMachineOptions {
        enable: false,
        ..StateMachineOptions::default()
    });
    master.set_dc_options(DcClosedLoopOptions {
        enabled: true,
        reference_slave_position: 9,
        ..DcClosedLoopOptions::default()
    });
    master.configure(two_slave_config()).unwrap();
    master.start().unwrap();

    // No DC time provisioned for slave 9.
    assert!(master.run_cycle().is_err());
    let statistics = master.statistics();
    assert_eq!(statistics.cycles_total, 1);
    assert_eq!(statistics.cycles_failed, 1);
}

#[test]
fn dc_sync_quality_degrade_policy_fires_once_per_latch() {
    let mock = MockTransport::new(1, 1);
    let master = EthercatMaster::new(mock.clone());
    master.set_state_machine_options(StateMachineOptions {
        enable: false,
        ..StateMachineOptions::default()
    });
    master.set_dc_sync_quality_options(DcSyncQualityOptions {
        enabled: true,
        max_phase_error_ns: 100,
        lock_acquire_in_window_cycles: 2,
        max_consecutive_out_of_window_cycles: 2,
        history_window_cycles: 32,
        policy_action: DcPolicyAction::Degrade,
    });
    master.configure(two_slave_config()).unwrap();
    master.start().unwrap();

    master.update_distributed_clock(1_000, 1_000);
    master.update_distributed_clock(2_000, 2_000);
    let quality = master.distributed_clock_quality();
    assert!(quality.locked);
    assert_eq!(quality.lock_acquisitions, 1);
    assert!(!master.is_degraded());

    master.update_distributed_clock(10_000, 0);
    let quality = master.distributed_clock_quality();
    assert!(!quality.locked);
    assert_eq!(quality.lock_losses, 1);

    master.update_distributed_clock(10_000, 0);
    master.update_distributed_clock(10_000, 0);
    let quality = master.distributed_clock_quality();
    assert_eq!(quality.policy_triggers, 1);
    assert!(master.is_degraded());
    assert!(master.last_error().unwrap().contains("DC sync degraded"));
}

#[test]
fn hil_conformance_reflects_runtime_counters() {
    let mock = MockTransport::new(1, 1);
    let master = master_without_ladder(&mock);
    for _ in 0..4 {
        master.run_cycle().unwrap();
    }
    mock.inject_exchange_failures(1);
    let _ = master.run_cycle();

    let report = master.evaluate_hil_conformance(
        ethercat_rt::HilThresholds {
            max_failure_rate: 0.5,
            max_p99_runtime_us: 1_000.0,
            max_degraded_cycles: 0,
        },
        120.0,
    );
    assert_eq!(report.kpi.cycles, 5);
    assert_eq!(report.kpi.cycle_failures, 1);
    assert!(report.all_passed());

    let strict = master.evaluate_hil_conformance(
        ethercat_rt::HilThresholds {
            max_failure_rate: 0.1,
            max_p99_runtime_us: 1_000.0,
            max_degraded_cycles: 0,
        },
        120.0,
    );
    assert!(!strict.rules[0].passed);
}

#[test]
fn input_callbacks_survive_many_cycles() {
    let mock = MockTransport::new(1, 1);
    let master = master_without_ladder(&mock);

    let toggles = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&toggles);
    master
        .on_input_change("InputA", Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

    for cycle in 0..10 {
        mock.set_input_bit(0, 0, cycle % 2 == 0);
        master.run_cycle().unwrap();
    }
    assert_eq!(toggles.load(Ordering::SeqCst), 10);
}
