//! In-memory transport for tests and dry runs. The handle is cloneable;
//! all clones share one state, so a test can keep a handle for fault
//! injection while the master owns another.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bit_field::BitField;

use crate::al_state::AlState;
use crate::config::NetworkConfiguration;
use crate::error::{SdoError, TransportError};
use crate::frame::coe::{EmergencyMessage, PdoMappingEntry, SdoAddress};
use crate::topology::{TopologySlaveInfo, TopologySnapshot};
use crate::transport::{FoeRequest, FoeResponse, Transport};

#[derive(Debug, Default)]
struct MockState {
    opened: bool,
    inputs: Vec<u8>,
    last_outputs: Vec<u8>,
    last_working_counter: u16,
    network_state: Option<AlState>,
    per_slave_state: HashMap<u16, AlState>,
    per_slave_al_status_code: HashMap<u16, u16>,
    sdo_objects: HashMap<(u16, u16, u8), Vec<u8>>,
    foe_files: HashMap<(u16, String), Vec<u8>>,
    pdo_assignments: HashMap<u16, Vec<PdoMappingEntry>>,
    emergencies: VecDeque<EmergencyMessage>,
    eoe_frames: VecDeque<(u16, Vec<u8>)>,
    discovered_slaves: Vec<TopologySlaveInfo>,
    dc_system_times: HashMap<u16, i64>,
    dc_time_offsets: HashMap<u16, i64>,
    redundancy_healthy: bool,
    remaining_exchange_failures: usize,
    process_image_configured: bool,
}

/// Cloneable mock implementing the full transport capability set.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(input_bytes: usize, output_bytes: usize) -> Self {
        let state = MockState {
            inputs: vec![0; input_bytes],
            last_outputs: vec![0; output_bytes],
            redundancy_healthy: true,
            ..MockState::default()
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock transport state poisoned")
    }

    pub fn set_input_bit(&self, byte_offset: usize, bit_offset: u8, value: bool) {
        let mut state = self.lock();
        if bit_offset < 8 {
            if let Some(byte) = state.inputs.get_mut(byte_offset) {
                byte.set_bit(usize::from(bit_offset), value);
            }
        }
    }

    pub fn set_input_byte(&self, byte_offset: usize, value: u8) {
        let mut state = self.lock();
        if let Some(byte) = state.inputs.get_mut(byte_offset) {
            *byte = value;
        }
    }

    pub fn set_input_bytes(&self, byte_offset: usize, data: &[u8]) {
        let mut state = self.lock();
        if byte_offset + data.len() <= state.inputs.len() {
            state.inputs[byte_offset..byte_offset + data.len()].copy_from_slice(data);
        }
    }

    pub fn last_output_bit(&self, byte_offset: usize, bit_offset: u8) -> bool {
        let state = self.lock();
        bit_offset < 8
            && state
                .last_outputs
                .get(byte_offset)
                .is_some_and(|byte| byte.get_bit(usize::from(bit_offset)))
    }

    pub fn last_outputs(&self) -> Vec<u8> {
        self.lock().last_outputs.clone()
    }

    pub fn set_slave_al_status_code(&self, position: u16, code: u16) {
        self.lock().per_slave_al_status_code.insert(position, code);
    }

    pub fn set_slave_state(&self, position: u16, state: AlState) {
        self.lock().per_slave_state.insert(position, state);
    }

    pub fn inject_exchange_failures(&self, count: usize) {
        self.lock().remaining_exchange_failures = count;
    }

    pub fn enqueue_emergency(&self, emergency: EmergencyMessage) {
        self.lock().emergencies.push_back(emergency);
    }

    pub fn set_redundancy_healthy(&self, healthy: bool) {
        self.lock().redundancy_healthy = healthy;
    }

    pub fn set_discovered_slaves(&self, slaves: Vec<TopologySlaveInfo>) {
        self.lock().discovered_slaves = slaves;
    }

    pub fn set_sdo_object(&self, position: u16, address: SdoAddress, data: Vec<u8>) {
        self.lock().sdo_objects.insert((position, address.index, address.sub_index), data);
    }

    pub fn set_dc_system_time(&self, position: u16, time_ns: i64) {
        self.lock().dc_system_times.insert(position, time_ns);
    }

    pub fn dc_time_offset(&self, position: u16) -> Option<i64> {
        self.lock().dc_time_offsets.get(&position).copied()
    }

    pub fn pdo_assignment(&self, position: u16) -> Option<Vec<PdoMappingEntry>> {
        self.lock().pdo_assignments.get(&position).cloned()
    }

    pub fn process_image_configured(&self) -> bool {
        self.lock().process_image_configured
    }
}

impl Transport for MockTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.opened = true;
        state.last_working_counter = 0;
        state.network_state = Some(AlState::Init);
        state.per_slave_state.clear();
        state.per_slave_al_status_code.clear();
        state.pdo_assignments.clear();
        state.emergencies.clear();
        state.eoe_frames.clear();
        state.remaining_exchange_failures = 0;
        state.process_image_configured = false;
        Ok(())
    }

    fn close(&mut self) {
        self.lock().opened = false;
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<u16, TransportError> {
        let mut state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        if tx.len() != state.last_outputs.len() || rx.len() != state.inputs.len() {
            return Err(TransportError::ImageSizeMismatch { tx: tx.len(), rx: rx.len() });
        }
        if state.remaining_exchange_failures > 0 {
            state.remaining_exchange_failures -= 1;
            return Err(TransportError::Io("injected exchange failure".into()));
        }

        state.last_outputs.copy_from_slice(tx);
        rx.copy_from_slice(&state.inputs);
        state.last_working_counter = 1;
        Ok(1)
    }

    fn last_working_counter(&self) -> u16 {
        self.lock().last_working_counter
    }

    fn request_network_state(&mut self, target: AlState) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state.network_state = Some(target);
        Ok(())
    }

    fn read_network_state(&mut self) -> Result<AlState, TransportError> {
        let state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state.network_state.ok_or(TransportError::InvalidAlState(0))
    }

    fn request_slave_state(&mut self, position: u16, target: AlState) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state.per_slave_state.insert(position, target);
        if target == AlState::Op {
            state.per_slave_al_status_code.insert(position, 0);
        }
        Ok(())
    }

    fn read_slave_state(&mut self, position: u16) -> Result<AlState, TransportError> {
        let state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        Ok(state
            .per_slave_state
            .get(&position)
            .copied()
            .or(state.network_state)
            .unwrap_or(AlState::Init))
    }

    fn read_slave_al_status_code(&mut self, position: u16) -> Result<u16, TransportError> {
        let state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        Ok(state.per_slave_al_status_code.get(&position).copied().unwrap_or(0))
    }

    fn reconfigure_slave(&mut self, position: u16) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state.per_slave_state.insert(position, AlState::SafeOp);
        state.per_slave_al_status_code.insert(position, 0);
        Ok(())
    }

    fn failover_slave(&mut self, position: u16) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state.per_slave_state.insert(position, AlState::SafeOp);
        state.per_slave_al_status_code.insert(position, 0x0014);
        Ok(())
    }

    fn sdo_upload(&mut self, position: u16, address: SdoAddress) -> Result<Vec<u8>, SdoError> {
        let state = self.lock();
        if !state.opened {
            return Err(SdoError::Transport(TransportError::NotOpen));
        }
        state
            .sdo_objects
            .get(&(position, address.index, address.sub_index))
            .cloned()
            .ok_or(SdoError::Abort(0x0602_0000))
    }

    fn sdo_download(
        &mut self,
        position: u16,
        address: SdoAddress,
        data: &[u8],
    ) -> Result<(), SdoError> {
        let mut state = self.lock();
        if !state.opened {
            return Err(SdoError::Transport(TransportError::NotOpen));
        }
        state
            .sdo_objects
            .insert((position, address.index, address.sub_index), data.to_vec());
        Ok(())
    }

    fn configure_pdo(
        &mut self,
        position: u16,
        _mapping_index: u16,
        entries: &[PdoMappingEntry],
    ) -> Result<(), SdoError> {
        let mut state = self.lock();
        if !state.opened {
            return Err(SdoError::Transport(TransportError::NotOpen));
        }
        state.pdo_assignments.insert(position, entries.to_vec());
        Ok(())
    }

    fn poll_emergency(&mut self) -> Option<EmergencyMessage> {
        let mut state = self.lock();
        if !state.opened {
            return None;
        }
        state.emergencies.pop_front()
    }

    fn discover_topology(&mut self) -> Result<TopologySnapshot, TransportError> {
        let state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        Ok(TopologySnapshot {
            slaves: state.discovered_slaves.clone(),
            redundancy_healthy: state.redundancy_healthy,
        })
    }

    fn is_redundancy_link_healthy(&mut self) -> Result<bool, TransportError> {
        let state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        Ok(state.redundancy_healthy)
    }

    fn configure_process_image(
        &mut self,
        _config: &NetworkConfiguration,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state.process_image_configured = true;
        Ok(())
    }

    fn read_dc_system_time(&mut self, position: u16) -> Result<i64, TransportError> {
        let state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state
            .dc_system_times
            .get(&position)
            .copied()
            .ok_or(TransportError::NotSupported)
    }

    fn write_dc_system_time_offset(
        &mut self,
        position: u16,
        offset_ns: i64,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state.dc_time_offsets.insert(position, offset_ns);
        Ok(())
    }

    fn foe_read(&mut self, position: u16, request: &FoeRequest) -> Result<FoeResponse, TransportError> {
        let state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state
            .foe_files
            .get(&(position, request.file_name.clone()))
            .map(|data| FoeResponse { data: data.clone() })
            .ok_or_else(|| TransportError::Io(format!("FoE file not found: {}", request.file_name)))
    }

    fn foe_write(
        &mut self,
        position: u16,
        request: &FoeRequest,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state.foe_files.insert((position, request.file_name.clone()), data.to_vec());
        Ok(())
    }

    fn eoe_send(&mut self, position: u16, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        state.eoe_frames.push_back((position, frame.to_vec()));
        Ok(())
    }

    fn eoe_receive(&mut self, position: u16) -> Result<Option<Vec<u8>>, TransportError> {
        let mut state = self.lock();
        if !state.opened {
            return Err(TransportError::NotOpen);
        }
        match state.eoe_frames.front() {
            Some((queued_position, _)) if *queued_position == position => {
                Ok(state.eoe_frames.pop_front().map(|(_, frame)| frame))
            }
            _ => Ok(None),
        }
    }
}
