//! The orchestrator: one configured master owning the process image,
//! mapping table, recovery state, DC discipline and topology policy, all
//! behind a single coarse lock so a cyclic driver can share it through an
//! `Arc`.

mod dc_loop;
mod recovery_engine;
mod topology_policy;

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::al_state::AlState;
use crate::config::NetworkConfiguration;
use crate::dc::{
    DcControllerOptions, DcSyncQualityOptions, DcSyncQualitySnapshot, DcSyncStats,
    DistributedClockController, SyncQualityMonitor,
};
use crate::error::{MasterError, SdoError, TransportError};
use crate::frame::coe::{
    EmergencyMessage, PdoMappingEntry, SdoAddress, RX_PDO_MAPPING_BASE, TX_PDO_MAPPING_BASE,
};
use crate::hil::{evaluate_hil_conformance, HilConformanceReport, HilKpi, HilThresholds};
use crate::mapper::{InputCallback, IoMapper};
use crate::process_image::ProcessImage;
use crate::recovery::{RecoveryAction, RecoveryEvent, SlaveDiagnostic};
use crate::topology::{
    RedundancyKpiSnapshot, RedundancyState, RedundancyStatusSnapshot, RedundancyTransitionEvent,
    TopologyChangeSet, TopologyManager, TopologyRecoveryOptions, TopologySnapshot,
};
use crate::transport::{FoeRequest, FoeResponse, Transport};
use crate::SlaveIdentity;

/// Startup state-machine behavior for the INIT→PRE-OP→SAFE-OP→OP ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMachineOptions {
    pub enable: bool,
    pub transition_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for StateMachineOptions {
    fn default() -> Self {
        Self {
            enable: true,
            transition_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// Recovery policy knobs used when cyclic exchange fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOptions {
    pub enable: bool,
    pub max_retries_per_slave: usize,
    pub max_reconfigure_per_slave: usize,
    pub stop_master_on_failover: bool,
    pub max_event_history: usize,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            enable: true,
            max_retries_per_slave: 3,
            max_reconfigure_per_slave: 1,
            stop_master_on_failover: false,
            max_event_history: 1024,
        }
    }
}

/// Closed-loop DC discipline configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DcClosedLoopOptions {
    pub enabled: bool,
    pub reference_slave_position: u16,
    pub target_phase_ns: i64,
    pub max_correction_step_ns: i64,
    pub max_slew_per_cycle_ns: i64,
    pub controller: DcControllerOptions,
}

impl Default for DcClosedLoopOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            reference_slave_position: 1,
            target_phase_ns: 0,
            max_correction_step_ns: 20_000,
            max_slew_per_cycle_ns: 5_000,
            controller: DcControllerOptions::default(),
        }
    }
}

/// Cycle counters, monotonic over the lifetime of one started instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleStatistics {
    pub cycles_total: u64,
    pub cycles_failed: u64,
    pub last_working_counter: u16,
    pub last_cycle_runtime: Duration,
}

impl CycleStatistics {
    pub fn cycles_succeeded(&self) -> u64 {
        self.cycles_total - self.cycles_failed
    }
}

pub(crate) struct MasterInner<T: Transport> {
    pub(crate) transport: T,
    pub(crate) mapper: IoMapper,
    pub(crate) config: NetworkConfiguration,
    pub(crate) process_image: ProcessImage,
    pub(crate) configured: bool,
    pub(crate) started: bool,
    pub(crate) start_instant: Instant,
    pub(crate) statistics: CycleStatistics,
    pub(crate) state_machine_options: StateMachineOptions,
    pub(crate) recovery_options: RecoveryOptions,
    pub(crate) recovery_overrides: HashMap<u16, RecoveryAction>,
    pub(crate) last_diagnostics: Vec<SlaveDiagnostic>,
    pub(crate) recovery_events: VecDeque<RecoveryEvent>,
    pub(crate) retry_counts: HashMap<u16, usize>,
    pub(crate) reconfigure_counts: HashMap<u16, usize>,
    pub(crate) degraded: bool,
    pub(crate) last_error: Option<String>,
    pub(crate) dc_controller: DistributedClockController,
    pub(crate) dc_options: DcClosedLoopOptions,
    pub(crate) dc_quality_options: DcSyncQualityOptions,
    pub(crate) dc_quality: SyncQualityMonitor,
    pub(crate) last_applied_dc_correction_ns: Option<i64>,
    pub(crate) topology: TopologyManager,
    pub(crate) topology_options: TopologyRecoveryOptions,
    pub(crate) missing_condition_cycles: usize,
    pub(crate) hot_connect_condition_cycles: usize,
    pub(crate) redundancy_condition_cycles: usize,
    pub(crate) missing_policy_latched: bool,
    pub(crate) hot_connect_policy_latched: bool,
    pub(crate) redundancy_policy_latched: bool,
    pub(crate) redundancy_status: RedundancyStatusSnapshot,
    pub(crate) redundancy_kpis: RedundancyKpiSnapshot,
    pub(crate) redundancy_fault_active: bool,
    pub(crate) redundancy_fault_start: Option<Instant>,
    pub(crate) redundancy_recovery_start: Option<Instant>,
    pub(crate) redundancy_transitions: VecDeque<RedundancyTransitionEvent>,
}

impl<T: Transport> MasterInner<T> {
    pub(crate) fn set_error(&mut self, message: String) {
        warn!("{}", message);
        self.last_error = Some(message);
    }

    /// Drive all slaves to `target` with BWR/BRD and poll until the whole
    /// network reports it.
    pub(crate) fn transition_network_to(&mut self, target: AlState) -> Result<(), MasterError> {
        if let Err(err) = self.transport.request_network_state(target) {
            self.set_error(format!("failed to request state {}: {}", target, err));
            return Err(MasterError::Transport(err));
        }

        let deadline = Instant::now() + self.state_machine_options.transition_timeout;
        while Instant::now() < deadline {
            match self.transport.read_network_state() {
                Ok(state) if state == target => return Ok(()),
                Ok(_) => {}
                Err(err) => {
                    self.set_error(format!("failed to read network state: {}", err));
                    return Err(MasterError::Transport(err));
                }
            }
            thread::sleep(self.state_machine_options.poll_interval);
        }

        let err = MasterError::TransitionTimeout { target };
        self.set_error(err.to_string());
        Err(err)
    }

    /// Per-slave variant using the auto-increment address.
    pub(crate) fn transition_slave_to(
        &mut self,
        position: u16,
        target: AlState,
    ) -> Result<(), MasterError> {
        if let Err(err) = self.transport.request_slave_state(position, target) {
            self.set_error(format!(
                "failed to request slave {} state {}: {}",
                position, target, err
            ));
            return Err(MasterError::Transport(err));
        }

        let deadline = Instant::now() + self.state_machine_options.transition_timeout;
        while Instant::now() < deadline {
            match self.transport.read_slave_state(position) {
                Ok(state) if state == target => return Ok(()),
                Ok(_) => {}
                Err(err) => {
                    self.set_error(format!(
                        "failed to read slave {} state: {}",
                        position, err
                    ));
                    return Err(MasterError::Transport(err));
                }
            }
            thread::sleep(self.state_machine_options.poll_interval);
        }

        let err = MasterError::SlaveTransitionTimeout { position, target };
        self.set_error(err.to_string());
        Err(err)
    }

    fn run_cycle_locked(&mut self) -> Result<(), MasterError> {
        if !self.started {
            self.set_error(MasterError::NotStarted.to_string());
            self.statistics.cycles_failed += 1;
            self.statistics.cycles_total += 1;
            return Err(MasterError::NotStarted);
        }

        let begin = Instant::now();
        let tx = self.process_image.output_bytes().to_vec();
        let mut rx = self.process_image.input_bytes().to_vec();
        match self.transport.exchange(&tx, &mut rx) {
            Ok(working_counter) => {
                *self.process_image.input_bytes_mut() = rx;
                self.statistics.last_working_counter = working_counter;
            }
            Err(err) => {
                self.set_error(format!("transport exchange failed: {}", err));
                if self.recovery_options.enable {
                    let recovered = self.recover_network_locked();
                    if !recovered {
                        let message = format!(
                            "{} | recovery failed",
                            self.last_error.as_deref().unwrap_or_default()
                        );
                        self.last_error = Some(message);
                    }
                }
                self.statistics.cycles_failed += 1;
                self.statistics.cycles_total += 1;
                return Err(MasterError::Transport(err));
            }
        }

        if matches!(
            self.redundancy_status.state,
            RedundancyState::RedundancyDegraded | RedundancyState::Recovering
        ) {
            self.redundancy_kpis.impacted_cycles += 1;
        }

        if let Err(err) = self.run_dc_closed_loop_update() {
            self.statistics.cycles_failed += 1;
            self.statistics.cycles_total += 1;
            return Err(err);
        }

        // Callbacks observe the input image only after the full swap.
        self.mapper.dispatch_input_changes(&self.process_image);

        self.statistics.last_cycle_runtime = begin.elapsed();
        self.statistics.cycles_total += 1;
        Ok(())
    }
}

/// EtherCAT master orchestrator, generic over the transport capability
/// set. All public methods take `&self`; serialization happens on one
/// internal lock.
pub struct EthercatMaster<T: Transport> {
    inner: Mutex<MasterInner<T>>,
}

impl<T: Transport> EthercatMaster<T> {
    pub fn new(transport: T) -> Self {
        Self {
            inner: Mutex::new(MasterInner {
                transport,
                mapper: IoMapper::default(),
                config: NetworkConfiguration::default(),
                process_image: ProcessImage::default(),
                configured: false,
                started: false,
                start_instant: Instant::now(),
                statistics: CycleStatistics::default(),
                state_machine_options: StateMachineOptions::default(),
                recovery_options: RecoveryOptions::default(),
                recovery_overrides: HashMap::new(),
                last_diagnostics: Vec::new(),
                recovery_events: VecDeque::new(),
                retry_counts: HashMap::new(),
                reconfigure_counts: HashMap::new(),
                degraded: false,
                last_error: None,
                dc_controller: DistributedClockController::default(),
                dc_options: DcClosedLoopOptions::default(),
                dc_quality_options: DcSyncQualityOptions::default(),
                dc_quality: SyncQualityMonitor::default(),
                last_applied_dc_correction_ns: None,
                topology: TopologyManager::new(),
                topology_options: TopologyRecoveryOptions::default(),
                missing_condition_cycles: 0,
                hot_connect_condition_cycles: 0,
                redundancy_condition_cycles: 0,
                missing_policy_latched: false,
                hot_connect_policy_latched: false,
                redundancy_policy_latched: false,
                redundancy_status: RedundancyStatusSnapshot::default(),
                redundancy_kpis: RedundancyKpiSnapshot::default(),
                redundancy_fault_active: false,
                redundancy_fault_start: None,
                redundancy_recovery_start: None,
                redundancy_transitions: VecDeque::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MasterInner<T>> {
        self.inner.lock().expect("master state poisoned")
    }

    /// Bind a validated configuration. The new mapper and process image
    /// are built up front and committed in one step once the whole
    /// configuration is accepted; a rejected configuration leaves the
    /// previous runtime state untouched.
    pub fn configure(&self, config: NetworkConfiguration) -> Result<(), MasterError> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let issues = config.validate();
        if NetworkConfiguration::has_errors(&issues) {
            let message = issues
                .iter()
                .map(|issue| issue.message.clone())
                .collect::<Vec<_>>()
                .join("; ");
            inner.set_error(format!("configuration invalid: {}", message));
            return Err(MasterError::InvalidConfiguration(message));
        }

        let mut mapper = IoMapper::default();
        for signal in &config.signals {
            if !mapper.bind(signal.clone()) {
                let message = format!("duplicate logical signal name: {}", signal.logical_name);
                inner.set_error(message.clone());
                return Err(MasterError::InvalidConfiguration(message));
            }
        }

        inner.mapper = mapper;
        inner.process_image = ProcessImage::new(
            config.process_image_input_bytes,
            config.process_image_output_bytes,
        );
        inner.statistics = CycleStatistics::default();
        inner.last_diagnostics.clear();
        inner.retry_counts.clear();
        inner.reconfigure_counts.clear();
        inner.recovery_events.clear();
        inner.degraded = false;
        inner.dc_controller = DistributedClockController::new(inner.dc_options.controller);
        inner.dc_quality = SyncQualityMonitor::new(inner.dc_quality_options);
        inner.last_applied_dc_correction_ns = None;
        inner.topology.reset();
        inner.missing_condition_cycles = 0;
        inner.hot_connect_condition_cycles = 0;
        inner.redundancy_condition_cycles = 0;
        inner.missing_policy_latched = false;
        inner.hot_connect_policy_latched = false;
        inner.redundancy_policy_latched = false;
        inner.redundancy_status = RedundancyStatusSnapshot::default();
        inner.redundancy_kpis = RedundancyKpiSnapshot::default();
        inner.redundancy_fault_active = false;
        inner.redundancy_transitions.clear();
        inner.config = config;
        inner.configured = true;
        Ok(())
    }

    /// Open the transport and, when the state machine is enabled, walk the
    /// network to OP with the process-image bootstrap before SAFE-OP.
    pub fn start(&self) -> Result<(), MasterError> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.configured {
            inner.set_error(MasterError::NotConfigured.to_string());
            return Err(MasterError::NotConfigured);
        }
        if let Err(err) = inner.transport.open() {
            inner.set_error(format!("transport open failed: {}", err));
            return Err(MasterError::Transport(err));
        }

        inner.dc_controller = DistributedClockController::new(inner.dc_options.controller);
        inner.dc_quality = SyncQualityMonitor::new(inner.dc_quality_options);
        inner.last_applied_dc_correction_ns = None;
        inner.redundancy_status = RedundancyStatusSnapshot::default();
        inner.redundancy_kpis = RedundancyKpiSnapshot::default();
        inner.redundancy_fault_active = false;
        inner.redundancy_transitions.clear();

        if inner.state_machine_options.enable {
            let ladder = (|| -> Result<(), MasterError> {
                inner.transition_network_to(AlState::Init)?;
                inner.transition_network_to(AlState::PreOp)?;
                let config = inner.config.clone();
                if let Err(err) = inner.transport.configure_process_image(&config) {
                    inner.set_error(format!(
                        "failed to configure process image mapping: {}",
                        err
                    ));
                    return Err(MasterError::Transport(err));
                }
                inner.transition_network_to(AlState::SafeOp)?;
                inner.transition_network_to(AlState::Op)
            })();
            if let Err(err) = ladder {
                inner.transport.close();
                return Err(err);
            }
        }

        inner.degraded = false;
        inner.started = true;
        inner.start_instant = Instant::now();
        debug!("master started");
        Ok(())
    }

    pub fn stop(&self) {
        let mut inner = self.lock();
        if inner.started {
            inner.transport.close();
            inner.started = false;
            debug!("master stopped");
        }
    }

    /// Run one cycle: push outputs, pull inputs, check the working
    /// counter, update the DC loop and dispatch input-change callbacks.
    pub fn run_cycle(&self) -> Result<(), MasterError> {
        self.lock().run_cycle_locked()
    }

    pub fn set_output_by_name(&self, logical_name: &str, value: bool) -> Result<(), MasterError> {
        let mut inner = self.lock();
        let MasterInner { mapper, process_image, .. } = &mut *inner;
        if mapper.set_output(process_image, logical_name, value) {
            Ok(())
        } else {
            let err = MasterError::UnknownOutputSignal(logical_name.to_owned());
            inner.set_error(err.to_string());
            Err(err)
        }
    }

    pub fn get_input_by_name(&self, logical_name: &str) -> Result<bool, MasterError> {
        let inner = self.lock();
        inner
            .mapper
            .get_input(&inner.process_image, logical_name)
            .ok_or_else(|| MasterError::UnknownInputSignal(logical_name.to_owned()))
    }

    /// Write raw bytes into the output image window.
    pub fn write_output_bytes(&self, byte_offset: usize, data: &[u8]) -> Result<(), MasterError> {
        let mut inner = self.lock();
        let output_len = inner.process_image.output_bytes().len();
        if byte_offset > output_len || data.len() > output_len - byte_offset {
            inner.set_error("write_output_bytes range outside process image".into());
            return Err(MasterError::ByteRangeOutOfBounds);
        }
        inner.process_image.output_bytes_mut()[byte_offset..byte_offset + data.len()]
            .copy_from_slice(data);
        Ok(())
    }

    /// Read raw bytes from the input image window.
    pub fn read_input_bytes(&self, byte_offset: usize, length: usize) -> Result<Vec<u8>, MasterError> {
        let inner = self.lock();
        let input = inner.process_image.input_bytes();
        if byte_offset > input.len() || length > input.len() - byte_offset {
            return Err(MasterError::ByteRangeOutOfBounds);
        }
        Ok(input[byte_offset..byte_offset + length].to_vec())
    }

    /// Register an input-change callback for a logical input signal.
    pub fn on_input_change(
        &self,
        logical_name: &str,
        callback: InputCallback,
    ) -> Result<(), MasterError> {
        let mut inner = self.lock();
        if inner.mapper.register_input_callback(logical_name, callback) {
            Ok(())
        } else {
            let err = MasterError::UnknownInputSignal(logical_name.to_owned());
            inner.set_error(err.to_string());
            Err(err)
        }
    }

    pub fn set_state_machine_options(&self, options: StateMachineOptions) {
        self.lock().state_machine_options = options;
    }

    pub fn set_recovery_options(&self, options: RecoveryOptions) {
        let mut options = options;
        if options.max_event_history == 0 {
            options.max_event_history = 1;
        }
        self.lock().recovery_options = options;
    }

    pub fn set_topology_options(&self, options: TopologyRecoveryOptions) {
        let mut options = options;
        if options.missing_grace_cycles == 0 {
            options.missing_grace_cycles = 1;
        }
        if options.hot_connect_grace_cycles == 0 {
            options.hot_connect_grace_cycles = 1;
        }
        if options.redundancy_grace_cycles == 0 {
            options.redundancy_grace_cycles = 1;
        }
        if options.max_redundancy_transition_history == 0 {
            options.max_redundancy_transition_history = 1;
        }
        self.lock().topology_options = options;
    }

    pub fn set_dc_options(&self, options: DcClosedLoopOptions) {
        let mut inner = self.lock();
        inner.dc_options = options;
        inner.dc_controller = DistributedClockController::new(options.controller);
        inner.last_applied_dc_correction_ns = None;
    }

    pub fn set_dc_sync_quality_options(&self, options: DcSyncQualityOptions) {
        let mut inner = self.lock();
        inner.dc_quality_options = options;
        inner.dc_quality = SyncQualityMonitor::new(options);
    }

    /// Force a recovery action for one AL status code, ahead of the
    /// decision ladder.
    pub fn set_recovery_action_override(&self, al_status_code: u16, action: RecoveryAction) {
        self.lock().recovery_overrides.insert(al_status_code, action);
    }

    pub fn clear_recovery_action_overrides(&self) {
        self.lock().recovery_overrides.clear();
    }

    pub fn collect_slave_diagnostics(&self) -> Vec<SlaveDiagnostic> {
        self.lock().collect_slave_diagnostics_locked()
    }

    /// Attempt recovery for every diagnosed slave; independent slaves are
    /// all serviced even if one fails. Returns whether any action
    /// succeeded.
    pub fn recover_network(&self) -> bool {
        self.lock().recover_network_locked()
    }

    pub fn recovery_events(&self) -> Vec<RecoveryEvent> {
        self.lock().recovery_events.iter().cloned().collect()
    }

    pub fn clear_recovery_events(&self) {
        self.lock().recovery_events.clear();
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().degraded
    }

    pub fn sdo_upload(&self, position: u16, address: SdoAddress) -> Result<Vec<u8>, SdoError> {
        self.lock().transport.sdo_upload(position, address)
    }

    pub fn sdo_download(
        &self,
        position: u16,
        address: SdoAddress,
        data: &[u8],
    ) -> Result<(), SdoError> {
        self.lock().transport.sdo_download(position, address, data)
    }

    pub fn configure_rx_pdo(
        &self,
        position: u16,
        entries: &[PdoMappingEntry],
    ) -> Result<(), SdoError> {
        self.lock().transport.configure_pdo(position, RX_PDO_MAPPING_BASE, entries)
    }

    pub fn configure_tx_pdo(
        &self,
        position: u16,
        entries: &[PdoMappingEntry],
    ) -> Result<(), SdoError> {
        self.lock().transport.configure_pdo(position, TX_PDO_MAPPING_BASE, entries)
    }

    /// Drain up to `max_messages` queued emergency telegrams.
    pub fn drain_emergencies(&self, max_messages: usize) -> Vec<EmergencyMessage> {
        let mut inner = self.lock();
        let mut messages = Vec::with_capacity(max_messages);
        for _ in 0..max_messages {
            match inner.transport.poll_emergency() {
                Some(message) => messages.push(message),
                None => break,
            }
        }
        messages
    }

    pub fn foe_read_file(
        &self,
        position: u16,
        request: &FoeRequest,
    ) -> Result<FoeResponse, TransportError> {
        self.lock().transport.foe_read(position, request)
    }

    pub fn foe_write_file(
        &self,
        position: u16,
        request: &FoeRequest,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.lock().transport.foe_write(position, request, data)
    }

    pub fn eoe_send_frame(&self, position: u16, frame: &[u8]) -> Result<(), TransportError> {
        self.lock().transport.eoe_send(position, frame)
    }

    pub fn eoe_receive_frame(&self, position: u16) -> Result<Option<Vec<u8>>, TransportError> {
        self.lock().transport.eoe_receive(position)
    }

    /// Feed one reference/local sample pair into the DC controller and
    /// sync-quality monitor; returns the clamped correction.
    pub fn update_distributed_clock(&self, reference_time_ns: i64, local_time_ns: i64) -> i64 {
        let mut inner = self.lock();
        let correction = inner.dc_controller.update(crate::dc::DcSyncSample {
            reference_time_ns,
            local_time_ns,
        });
        inner.update_dc_sync_quality(reference_time_ns - local_time_ns);
        correction
    }

    pub fn distributed_clock_stats(&self) -> DcSyncStats {
        self.lock().dc_controller.stats()
    }

    pub fn distributed_clock_quality(&self) -> DcSyncQualitySnapshot {
        self.lock().dc_quality.snapshot()
    }

    pub fn last_applied_dc_correction_ns(&self) -> Option<i64> {
        self.lock().last_applied_dc_correction_ns
    }

    /// Scan the live topology, reconcile against the previous snapshot and
    /// run the grace-counted fault policies.
    pub fn refresh_topology(&self) -> Result<(), MasterError> {
        self.lock().refresh_topology_locked()
    }

    pub fn topology_snapshot(&self) -> TopologySnapshot {
        self.lock().topology.snapshot().clone()
    }

    pub fn topology_change_set(&self) -> TopologyChangeSet {
        self.lock().topology.change_set().clone()
    }

    pub fn topology_generation(&self) -> u64 {
        self.lock().topology.generation()
    }

    pub fn missing_slaves(&self) -> Vec<SlaveIdentity> {
        let inner = self.lock();
        inner.topology.detect_missing(&inner.config.slaves)
    }

    pub fn hot_connected_slaves(&self) -> Vec<SlaveIdentity> {
        let inner = self.lock();
        inner.topology.detect_hot_connected(&inner.config.slaves)
    }

    pub fn redundancy_status(&self) -> RedundancyStatusSnapshot {
        self.lock().redundancy_status.clone()
    }

    pub fn redundancy_kpis(&self) -> RedundancyKpiSnapshot {
        self.lock().redundancy_kpis
    }

    pub fn redundancy_transitions(&self) -> Vec<RedundancyTransitionEvent> {
        self.lock().redundancy_transitions.iter().cloned().collect()
    }

    pub fn clear_redundancy_transitions(&self) {
        self.lock().redundancy_transitions.clear();
    }

    /// Evaluate the collected runtime KPIs against campaign thresholds.
    pub fn evaluate_hil_conformance(
        &self,
        thresholds: HilThresholds,
        observed_p99_runtime_us: f64,
    ) -> HilConformanceReport {
        let inner = self.lock();
        let cycles = inner.statistics.cycles_total;
        let failures = inner.statistics.cycles_failed;
        let kpi = HilKpi {
            cycles,
            cycle_failures: failures,
            recovery_events: inner.recovery_events.len() as u64,
            cycle_failure_rate: if cycles == 0 { 0.0 } else { failures as f64 / cycles as f64 },
            p99_cycle_runtime_us: observed_p99_runtime_us,
            degraded_cycles: if inner.degraded { cycles } else { 0 },
        };
        evaluate_hil_conformance(kpi, thresholds)
    }

    pub fn last_working_counter(&self) -> u16 {
        self.lock().statistics.last_working_counter
    }

    pub fn statistics(&self) -> CycleStatistics {
        self.lock().statistics
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    /// Direct access to the owned transport, for diagnostics surfaces the
    /// capability set does not cover.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.lock().transport)
    }
}
