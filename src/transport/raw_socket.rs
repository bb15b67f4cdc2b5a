//! Raw link-layer transport. All EtherCAT traffic goes through one
//! primary link (plus an optional redundant link for the cyclic path),
//! one datagram per frame, matched against the expected command, index
//! and payload length within the remaining cycle budget.

use std::collections::VecDeque;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::al_state::AlState;
use crate::config::{NetworkConfiguration, SignalBinding, SignalDirection};
use crate::error::{MailboxErrorClass, SdoError, TransportError};
use crate::frame::coe::{
    self, EmergencyMessage, PdoMappingEntry, SdoAddress, RX_PDO_MAPPING_BASE, SDO_SEGMENT_MAX_DATA,
    SM2_PDO_ASSIGN, SM3_PDO_ASSIGN, TX_PDO_MAPPING_BASE,
};
use crate::frame::ethercat::{
    auto_increment_address, build_datagram_frame, parse_datagram_frame, CommandType,
    DatagramRequest, BROADCAST_MAC,
};
use crate::frame::mailbox::{
    decode_mailbox, encode_mailbox, next_mailbox_counter, MailboxFrame, MailboxType,
};
use crate::register;
use crate::register::{FmmuEntry, SyncManagerEntry};
use crate::topology::{TopologySlaveInfo, TopologySnapshot};
use crate::transport::{
    DcDiagnostics, MailboxDiagnostics, Transport, TransportOptions,
};

/// One already-bound link-layer device: send a frame, receive the next
/// frame before a deadline. Production uses [`PnetLink`]; tests drive the
/// transport through scripted in-memory links.
pub trait RawLink {
    fn source_mac(&self) -> [u8; 6];
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;
    /// Receive one frame. `Ok(None)` means the deadline passed quietly.
    fn recv(&mut self, deadline: Instant) -> io::Result<Option<Vec<u8>>>;
}

/// Link-layer device over a `pnet_datalink` Ethernet channel.
pub struct PnetLink {
    source_mac: [u8; 6],
    tx: Box<dyn pnet_datalink::DataLinkSender>,
    rx: Box<dyn pnet_datalink::DataLinkReceiver>,
}

impl PnetLink {
    /// Open a channel on the named interface. The short read timeout keeps
    /// the receive loop responsive to the per-datagram deadline.
    pub fn open(interface_name: &str) -> io::Result<Self> {
        let interface = pnet_datalink::interfaces()
            .into_iter()
            .find(|candidate| candidate.name == interface_name)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no such interface: {}", interface_name),
                )
            })?;
        let source_mac = interface
            .mac
            .map(|mac| mac.octets())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("interface {} has no MAC address", interface_name),
                )
            })?;

        let config = pnet_datalink::Config {
            read_timeout: Some(Duration::from_millis(1)),
            ..pnet_datalink::Config::default()
        };
        match pnet_datalink::channel(&interface, config) {
            Ok(pnet_datalink::Channel::Ethernet(tx, rx)) => Ok(Self { source_mac, tx, rx }),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "non-Ethernet datalink channel",
            )),
            Err(err) => Err(err),
        }
    }
}

impl RawLink for PnetLink {
    fn source_mac(&self) -> [u8; 6] {
        self.source_mac
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        match self.tx.send_to(frame, None) {
            Some(result) => result,
            None => Err(io::Error::new(io::ErrorKind::Other, "datalink sender unavailable")),
        }
    }

    fn recv(&mut self, deadline: Instant) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.rx.next() {
                Ok(frame) => return Ok(Some(frame.to_vec())),
                Err(err)
                    if err.kind() == io::ErrorKind::TimedOut
                        || err.kind() == io::ErrorKind::WouldBlock =>
                {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Physical window mapped for one slave during the SAFE-OP bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessDataWindow {
    pub slave_position: u16,
    pub physical_start: u16,
    pub length: u16,
    pub logical_start: u32,
}

/// Send one datagram on a link and match its echo within the deadline.
/// Non-matching frames are drained; a scan budget bounds the drain.
fn send_and_receive<L: RawLink>(
    link: &mut L,
    timeout: Duration,
    max_frames_per_cycle: usize,
    expected_wkc: u16,
    request: &DatagramRequest,
) -> Result<(u16, Vec<u8>), TransportError> {
    let frame = build_datagram_frame(&BROADCAST_MAC, &link.source_mac(), request);
    link.send(&frame).map_err(|err| TransportError::Io(err.to_string()))?;

    let deadline = Instant::now() + timeout;
    let mut scanned_frames = 0usize;
    while scanned_frames < max_frames_per_cycle {
        if Instant::now() >= deadline {
            return Err(TransportError::ReceiveTimeout);
        }
        let received = link
            .recv(deadline)
            .map_err(|err| TransportError::Io(err.to_string()))?;
        let rx_frame = match received {
            Some(rx_frame) => rx_frame,
            None => return Err(TransportError::ReceiveTimeout),
        };
        scanned_frames += 1;

        let parsed = match parse_datagram_frame(
            &rx_frame,
            request.command,
            request.index,
            request.payload.len(),
        ) {
            Some(parsed) => parsed,
            None => continue,
        };
        if parsed.working_counter < expected_wkc {
            return Err(TransportError::WkcTooLow {
                got: parsed.working_counter,
                expected: expected_wkc,
            });
        }
        return Ok((parsed.working_counter, parsed.payload));
    }
    Err(TransportError::FrameNotFound)
}

/// Raw transport over one or two [`RawLink`] devices.
pub struct RawSocketTransport<L: RawLink> {
    primary: L,
    secondary: Option<L>,
    options: TransportOptions,
    opened: bool,
    datagram_index: u8,
    mailbox_counter: u8,
    last_working_counter: u16,
    last_frame_used_secondary: bool,
    emergencies: VecDeque<EmergencyMessage>,
    mailbox_diagnostics: MailboxDiagnostics,
    dc_diagnostics: DcDiagnostics,
    output_windows: Vec<ProcessDataWindow>,
}

impl RawSocketTransport<PnetLink> {
    /// Bind the primary interface by name.
    pub fn bind(interface_name: &str) -> io::Result<Self> {
        Ok(Self::new(PnetLink::open(interface_name)?))
    }

    /// Bind primary and redundant interfaces by name.
    pub fn bind_redundant(primary_name: &str, secondary_name: &str) -> io::Result<Self> {
        Ok(Self::with_redundancy(
            PnetLink::open(primary_name)?,
            PnetLink::open(secondary_name)?,
        ))
    }
}

impl<L: RawLink> RawSocketTransport<L> {
    pub fn new(primary: L) -> Self {
        Self {
            primary,
            secondary: None,
            options: TransportOptions::default(),
            opened: false,
            datagram_index: 0,
            mailbox_counter: 0,
            last_working_counter: 0,
            last_frame_used_secondary: false,
            emergencies: VecDeque::new(),
            mailbox_diagnostics: MailboxDiagnostics::default(),
            dc_diagnostics: DcDiagnostics::default(),
            output_windows: Vec::new(),
        }
    }

    pub fn with_redundancy(primary: L, secondary: L) -> Self {
        let mut transport = Self::new(primary);
        transport.secondary = Some(secondary);
        transport.options.redundancy_enabled = true;
        transport
    }

    pub fn set_options(&mut self, options: TransportOptions) {
        let mut options = options;
        if options.max_frames_per_cycle == 0 {
            options.max_frames_per_cycle = 1;
        }
        if options.emergency_queue_limit == 0 {
            options.emergency_queue_limit = 1;
        }
        self.options = options;
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    pub fn mailbox_diagnostics(&self) -> MailboxDiagnostics {
        self.mailbox_diagnostics
    }

    pub fn reset_mailbox_diagnostics(&mut self) {
        self.mailbox_diagnostics = MailboxDiagnostics::default();
    }

    pub fn dc_diagnostics(&self) -> DcDiagnostics {
        self.dc_diagnostics
    }

    pub fn last_frame_used_secondary(&self) -> bool {
        self.last_frame_used_secondary
    }

    pub fn output_windows(&self) -> &[ProcessDataWindow] {
        &self.output_windows
    }

    fn next_index(&mut self) -> u8 {
        let index = self.datagram_index;
        self.datagram_index = self.datagram_index.wrapping_add(1);
        index
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.opened {
            Ok(())
        } else {
            Err(TransportError::NotOpen)
        }
    }

    /// Issue one datagram on the primary link.
    fn send_datagram(&mut self, request: &DatagramRequest) -> Result<(u16, Vec<u8>), TransportError> {
        send_and_receive(
            &mut self.primary,
            self.options.cycle_timeout,
            self.options.max_frames_per_cycle,
            self.options.expected_working_counter,
            request,
        )
    }

    /// Issue one datagram, falling back to the redundant link once.
    fn send_datagram_failover(
        &mut self,
        request: &DatagramRequest,
    ) -> Result<(u16, Vec<u8>), TransportError> {
        let timeout = self.options.cycle_timeout;
        let max_frames = self.options.max_frames_per_cycle;
        let expected_wkc = self.options.expected_working_counter;

        match send_and_receive(&mut self.primary, timeout, max_frames, expected_wkc, request) {
            Ok(result) => {
                self.last_frame_used_secondary = false;
                Ok(result)
            }
            Err(primary_err) => {
                if !self.options.redundancy_enabled {
                    return Err(primary_err);
                }
                let secondary = match self.secondary.as_mut() {
                    Some(secondary) => secondary,
                    None => return Err(primary_err),
                };
                warn!(
                    "primary leg failed ({}), retrying {:?} on redundant link",
                    primary_err, request.command
                );
                match send_and_receive(secondary, timeout, max_frames, expected_wkc, request) {
                    Ok(result) => {
                        self.last_frame_used_secondary = true;
                        Ok(result)
                    }
                    Err(_) => Err(primary_err),
                }
            }
        }
    }

    fn read_register(
        &mut self,
        adp: u16,
        ado: u16,
        len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        let request = DatagramRequest::read(CommandType::Aprd, self.next_index(), adp, ado, len);
        let (wkc, payload) = self.send_datagram(&request)?;
        self.last_working_counter = wkc;
        if payload.len() < len {
            return Err(TransportError::PayloadTooShort("register read"));
        }
        Ok(payload)
    }

    fn write_register(
        &mut self,
        adp: u16,
        ado: u16,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let request =
            DatagramRequest::write(CommandType::Apwr, self.next_index(), adp, ado, payload);
        let (wkc, _) = self.send_datagram(&request)?;
        self.last_working_counter = wkc;
        Ok(())
    }

    /// Read one 32-bit value from the slave EEPROM through the SII
    /// registers: set the word address, issue the read command, poll the
    /// busy bit, then fetch the data register.
    fn read_sii_word32(&mut self, adp: u16, word_address: u16) -> Result<u32, TransportError> {
        let mut address_payload = word_address.to_le_bytes().to_vec();
        address_payload.extend_from_slice(&[0, 0]);
        self.write_register(adp, register::EEPROM_ADDRESS, address_payload)?;
        self.write_register(
            adp,
            register::EEPROM_CONTROL_STATUS,
            register::EEPROM_COMMAND_READ.to_le_bytes().to_vec(),
        )?;

        let deadline = Instant::now() + Duration::from_millis(100);
        while Instant::now() < deadline {
            let status_payload = self.read_register(adp, register::EEPROM_CONTROL_STATUS, 2)?;
            let status = u16::from_le_bytes([status_payload[0], status_payload[1]]);
            if status & register::EEPROM_BUSY != 0 {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            if status & register::EEPROM_ERROR_MASK != 0 {
                return Err(TransportError::EepromStatusError(status));
            }
            let data = self.read_register(adp, register::EEPROM_DATA, 4)?;
            return Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
        }
        Err(TransportError::EepromBusyTimeout)
    }

    fn classify_datagram_error(error: &TransportError) -> MailboxErrorClass {
        match error {
            TransportError::ReceiveTimeout | TransportError::FrameNotFound => {
                MailboxErrorClass::Timeout
            }
            _ => MailboxErrorClass::TransportIo,
        }
    }

    fn record_error_class(&mut self, class: MailboxErrorClass) {
        self.mailbox_diagnostics.last_error_class = class;
        if class == MailboxErrorClass::Timeout {
            self.mailbox_diagnostics.error_timeouts += 1;
        }
    }

    /// Datagram with the mailbox retry budget: exponential backoff between
    /// attempts, applied only to socket errors and timeouts.
    fn mailbox_datagram_with_retry(
        &mut self,
        request: &DatagramRequest,
    ) -> Result<(u16, Vec<u8>), TransportError> {
        let retries = self.options.retry.retries;
        let backoff_base = self.options.retry.backoff_base;
        let backoff_max = self.options.retry.backoff_max;

        let mut backoff = backoff_base;
        let mut attempt = 0u32;
        loop {
            match self.send_datagram(request) {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let class = Self::classify_datagram_error(&err);
                    self.record_error_class(class);
                    if attempt >= retries {
                        return Err(err);
                    }
                    attempt += 1;
                    self.mailbox_diagnostics.datagram_retries += 1;
                    trace!(
                        "mailbox datagram retry {}/{} after {}",
                        attempt,
                        retries,
                        err
                    );
                    thread::sleep(backoff.min(backoff_max));
                    backoff = (backoff * 2).min(backoff_max);
                }
            }
        }
    }

    /// Read one SyncManager window (start, length) for mailbox traffic.
    fn read_sm_window(&mut self, adp: u16, sm_index: u8) -> Result<(u16, u16), TransportError> {
        let request = DatagramRequest::read(
            CommandType::Aprd,
            self.next_index(),
            adp,
            register::sm_address(sm_index),
            SyncManagerEntry::<[u8; 0]>::SIZE,
        );
        let (wkc, payload) = self.mailbox_datagram_with_retry(&request)?;
        self.last_working_counter = wkc;
        if payload.len() < 4 {
            self.record_error_class(MailboxErrorClass::ParseReject);
            return Err(TransportError::PayloadTooShort("sync manager window"));
        }
        let entry = SyncManagerEntry(payload.as_slice());
        Ok((entry.physical_start_address(), entry.length()))
    }

    fn read_sm_status(&mut self, adp: u16, sm_index: u8) -> Result<u8, TransportError> {
        let request = DatagramRequest::read(
            CommandType::Aprd,
            self.next_index(),
            adp,
            register::sm_status_address(sm_index),
            1,
        );
        let (wkc, payload) = self.mailbox_datagram_with_retry(&request)?;
        self.last_working_counter = wkc;
        payload
            .first()
            .copied()
            .ok_or(TransportError::PayloadTooShort("sync manager status"))
    }

    /// Resolve write/read mailbox windows from SM0/SM1; fall back to the
    /// configured defaults when the registers are unreadable or empty.
    fn resolve_mailbox_windows(&mut self, adp: u16) -> (u16, u16, u16, u16) {
        let defaults = self.options.mailbox_windows;
        let resolved = self
            .read_sm_window(adp, 0)
            .and_then(|sm0| self.read_sm_window(adp, 1).map(|sm1| (sm0, sm1)));
        match resolved {
            Ok(((write_offset, write_size), (read_offset, read_size)))
                if write_size > 0 && read_size > 0 =>
            {
                (write_offset, write_size, read_offset, read_size)
            }
            _ => (
                defaults.write_offset,
                defaults.write_size,
                defaults.read_offset,
                defaults.read_size,
            ),
        }
    }

    /// Push one CoE payload into the slave's write mailbox. Returns the
    /// rolling counter stamped on the frame.
    fn mailbox_write_coe(
        &mut self,
        adp: u16,
        write_offset: u16,
        write_size: u16,
        coe_payload: Vec<u8>,
    ) -> Result<u8, TransportError> {
        use crate::transport::MailboxStatusMode;

        if self.options.mailbox_status_mode != MailboxStatusMode::Poll {
            let mut write_ready = false;
            for _probe in 0..3 {
                match self.read_sm_status(adp, 0) {
                    Ok(status) => {
                        if status & register::SM_STATUS_MAILBOX_FULL == 0 {
                            write_ready = true;
                            break;
                        }
                        thread::sleep(Duration::from_millis(1));
                    }
                    Err(_) => {
                        if self.options.mailbox_status_mode == MailboxStatusMode::Strict {
                            self.record_error_class(MailboxErrorClass::Busy);
                            return Err(TransportError::MailboxBusy);
                        }
                        break;
                    }
                }
            }
            if self.options.mailbox_status_mode == MailboxStatusMode::Strict && !write_ready {
                self.record_error_class(MailboxErrorClass::Busy);
                return Err(TransportError::MailboxBusy);
            }
        }

        self.mailbox_counter = next_mailbox_counter(self.mailbox_counter);
        let counter = self.mailbox_counter;
        let mut bytes = encode_mailbox(&MailboxFrame::coe(counter, coe_payload));
        if bytes.len() > usize::from(write_size) {
            self.record_error_class(MailboxErrorClass::ParseReject);
            return Err(TransportError::MailboxTooLarge {
                size: bytes.len(),
                window: usize::from(write_size),
            });
        }
        bytes.resize(usize::from(write_size), 0);

        let request =
            DatagramRequest::write(CommandType::Apwr, self.next_index(), adp, write_offset, bytes);
        let (wkc, _) = self.mailbox_datagram_with_retry(&request)?;
        self.mailbox_diagnostics.mailbox_writes += 1;
        self.last_working_counter = wkc;
        Ok(counter)
    }

    /// Poll the read mailbox until a CoE frame with the expected counter
    /// passes `accept`. Emergencies are queued as they arrive; frames of
    /// other services, stale counters and parse rejects are discarded.
    fn mailbox_read_matching(
        &mut self,
        adp: u16,
        slave_position: u16,
        read_offset: u16,
        read_size: u16,
        expected_counter: u8,
        accept: &dyn Fn(&[u8]) -> bool,
    ) -> Result<MailboxFrame, TransportError> {
        use crate::transport::MailboxStatusMode;

        let deadline = Instant::now() + self.options.cycle_timeout;
        let mut idle_polls = 0u32;
        while Instant::now() < deadline {
            if self.options.mailbox_status_mode != MailboxStatusMode::Poll {
                let status = self.read_sm_status(adp, 1);
                let mailbox_has_data = status
                    .as_ref()
                    .map(|value| value & register::SM_STATUS_MAILBOX_FULL != 0)
                    .unwrap_or(false);
                match self.options.mailbox_status_mode {
                    MailboxStatusMode::Strict => {
                        if status.is_err() {
                            self.record_error_class(MailboxErrorClass::Busy);
                            return Err(TransportError::MailboxBusy);
                        }
                        if !mailbox_has_data {
                            thread::sleep(Duration::from_millis(1));
                            continue;
                        }
                    }
                    MailboxStatusMode::Hybrid => {
                        // Read through every few polls even without the
                        // status bit, for slaves that never set it.
                        if !mailbox_has_data {
                            let skip = idle_polls % 3 != 0;
                            idle_polls += 1;
                            if skip {
                                thread::sleep(Duration::from_millis(1));
                                continue;
                            }
                        }
                    }
                    MailboxStatusMode::Poll => {}
                }
            }

            let request = DatagramRequest::read(
                CommandType::Aprd,
                self.next_index(),
                adp,
                read_offset,
                usize::from(read_size),
            );
            let (wkc, payload) = self.mailbox_datagram_with_retry(&request)?;
            self.mailbox_diagnostics.mailbox_reads += 1;
            self.last_working_counter = wkc;

            let frame = match decode_mailbox(&payload) {
                Some(frame) => frame,
                None => {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
            };
            if frame.mailbox_type != MailboxType::Coe as u8 {
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            if let Some(emergency) = coe::parse_emergency(&frame.payload, slave_position) {
                if self.emergencies.len() >= self.options.emergency_queue_limit {
                    self.emergencies.pop_front();
                    self.mailbox_diagnostics.emergency_dropped += 1;
                }
                self.emergencies.push_back(emergency);
                self.mailbox_diagnostics.emergency_queued += 1;
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            if frame.counter & 0x07 != expected_counter & 0x07 {
                self.mailbox_diagnostics.stale_counter_drops += 1;
                self.record_error_class(MailboxErrorClass::StaleCounter);
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            if !accept(&frame.payload) {
                self.mailbox_diagnostics.parse_rejects += 1;
                self.record_error_class(MailboxErrorClass::ParseReject);
                thread::sleep(Duration::from_millis(1));
                continue;
            }
            self.mailbox_diagnostics.matched_responses += 1;
            return Ok(frame);
        }
        self.mailbox_diagnostics.mailbox_timeouts += 1;
        self.record_error_class(MailboxErrorClass::Timeout);
        Err(TransportError::MailboxTimeout)
    }

    fn sdo_upload_inner(
        &mut self,
        position: u16,
        address: SdoAddress,
    ) -> Result<Vec<u8>, SdoError> {
        let adp = auto_increment_address(position);
        let (write_offset, write_size, read_offset, read_size) =
            self.resolve_mailbox_windows(adp);

        let counter = self.mailbox_write_coe(
            adp,
            write_offset,
            write_size,
            coe::build_sdo_initiate_upload_request(address),
        )?;
        let response = self.mailbox_read_matching(
            adp,
            position,
            read_offset,
            read_size,
            counter,
            &|payload| {
                matches!(
                    coe::parse_sdo_initiate_upload_response(payload, address),
                    Ok(_) | Err(crate::error::CoeParseError::Abort(_))
                )
            },
        )?;
        let initiate = coe::parse_sdo_initiate_upload_response(&response.payload, address)?;
        if initiate.expedited {
            return Ok(initiate.data);
        }

        let mut data = Vec::new();
        let mut toggle = 0u8;
        loop {
            let counter = self.mailbox_write_coe(
                adp,
                write_offset,
                write_size,
                coe::build_sdo_upload_segment_request(toggle),
            )?;
            let response = self.mailbox_read_matching(
                adp,
                position,
                read_offset,
                read_size,
                counter,
                &|payload| {
                    matches!(
                        coe::parse_sdo_upload_segment_response(payload),
                        Ok(_) | Err(crate::error::CoeParseError::Abort(_))
                    )
                },
            )?;
            let segment = coe::parse_sdo_upload_segment_response(&response.payload)?;
            data.extend_from_slice(&segment.data);
            toggle ^= 0x01;
            if segment.last_segment {
                break;
            }
        }
        Ok(data)
    }

    fn sdo_download_inner(
        &mut self,
        position: u16,
        address: SdoAddress,
        data: &[u8],
    ) -> Result<(), SdoError> {
        let adp = auto_increment_address(position);
        let (write_offset, write_size, read_offset, read_size) =
            self.resolve_mailbox_windows(adp);

        let counter = self.mailbox_write_coe(
            adp,
            write_offset,
            write_size,
            coe::build_sdo_initiate_download_request(address, data.len() as u32),
        )?;
        let response = self.mailbox_read_matching(
            adp,
            position,
            read_offset,
            read_size,
            counter,
            &|payload| {
                matches!(
                    coe::parse_sdo_initiate_download_response(payload, address),
                    Ok(()) | Err(crate::error::CoeParseError::Abort(_))
                )
            },
        )?;
        coe::parse_sdo_initiate_download_response(&response.payload, address)?;

        let mut toggle = 0u8;
        let mut offset = 0usize;
        while offset < data.len() {
            let chunk = (data.len() - offset).min(SDO_SEGMENT_MAX_DATA);
            let last_segment = offset + chunk >= data.len();
            let counter = self.mailbox_write_coe(
                adp,
                write_offset,
                write_size,
                coe::build_sdo_download_segment_request(
                    toggle,
                    last_segment,
                    &data[offset..offset + chunk],
                ),
            )?;
            let expected_toggle = toggle;
            let response = self.mailbox_read_matching(
                adp,
                position,
                read_offset,
                read_size,
                counter,
                &|payload| {
                    matches!(
                        coe::parse_sdo_download_segment_response(payload, expected_toggle),
                        Ok(()) | Err(crate::error::CoeParseError::Abort(_))
                    )
                },
            )?;
            coe::parse_sdo_download_segment_response(&response.payload, expected_toggle)?;
            offset += chunk;
            toggle ^= 0x01;
        }
        Ok(())
    }

    fn finish_transaction<T>(&mut self, result: Result<T, SdoError>) -> Result<T, SdoError> {
        if let Err(err) = &result {
            self.mailbox_diagnostics.transactions_failed += 1;
            if matches!(err, SdoError::Abort(_)) {
                self.record_error_class(MailboxErrorClass::Abort);
            }
        }
        result
    }

    fn write_fmmu_entry(
        &mut self,
        position: u16,
        fmmu_index: u8,
        logical_start: u32,
        length: u16,
        physical_start: u16,
        write_direction: bool,
    ) -> Result<(), TransportError> {
        let mut entry = FmmuEntry::new();
        entry.set_logical_start_address(logical_start);
        entry.set_length(length);
        entry.set_logical_start_bit(0);
        entry.set_logical_end_bit(7);
        entry.set_physical_start_address(physical_start);
        entry.set_physical_start_bit(0);
        if write_direction {
            entry.set_write_enable(true);
        } else {
            entry.set_read_enable(true);
        }
        entry.set_enable(true);

        self.write_register(
            auto_increment_address(position),
            register::fmmu_address(fmmu_index),
            entry.0.to_vec(),
        )
    }

    fn write_sm_entry(
        &mut self,
        position: u16,
        sm_index: u8,
        start: u16,
        length: u16,
        control: u8,
        activate: u8,
    ) -> Result<(), TransportError> {
        let mut entry = SyncManagerEntry::new();
        entry.set_physical_start_address(start);
        entry.set_length(length);
        entry.set_control(control);
        entry.set_activate(activate);

        self.write_register(
            auto_increment_address(position),
            register::sm_address(sm_index),
            entry.0.to_vec(),
        )
    }

    /// Map the process data of one direction: resolve the SM window (with
    /// default-PDO and direct-SM fallbacks for mailbox-less simple IO),
    /// program an FMMU entry and advance the logical cursor.
    #[allow(clippy::too_many_arguments)]
    fn map_direction(
        &mut self,
        slaves: &[(u16, Vec<SignalBinding>)],
        output_direction: bool,
        logical_cursor: &mut u32,
        fmmu_index: &mut u8,
    ) -> Result<usize, TransportError> {
        let sm_index = if output_direction { 2u8 } else { 3u8 };
        let mapping_base = if output_direction { RX_PDO_MAPPING_BASE } else { TX_PDO_MAPPING_BASE };
        let sm_control = if output_direction { 0x24u8 } else { 0x20u8 };
        let mut mapped = 0usize;

        for (position, signals) in slaves {
            let position = *position;
            let adp = auto_increment_address(position);
            let (mut sm_start, mut sm_len) = self.read_sm_window(adp, sm_index)?;
            debug!(
                "slave {} SM{} window start=0x{:04x} len={}",
                position, sm_index, sm_start, sm_len
            );

            if sm_len == 0 && !signals.is_empty() {
                // Channel bits of simple digital terminals live at
                // 0x6000:1..N (inputs) and 0x7000:1..N (outputs).
                let mut entries: Vec<PdoMappingEntry> = signals
                    .iter()
                    .map(|signal| PdoMappingEntry {
                        index: if output_direction { 0x7000 } else { 0x6000 },
                        sub_index: signal.bit_offset + 1,
                        bit_length: 1,
                    })
                    .collect();
                entries.sort_by_key(|entry| entry.sub_index);
                entries.dedup_by_key(|entry| entry.sub_index);

                match self.configure_pdo(position, mapping_base, &entries) {
                    Ok(()) => {
                        let window = self.read_sm_window(adp, sm_index)?;
                        sm_start = window.0;
                        sm_len = window.1;
                        debug!(
                            "slave {} SM{} after default PDO config: start=0x{:04x} len={}",
                            position, sm_index, sm_start, sm_len
                        );
                    }
                    Err(err) => {
                        debug!("slave {} default PDO config failed: {}", position, err);
                    }
                }

                if sm_len == 0 {
                    // Mailbox-less fallback: write a minimal SM window
                    // sized from the highest referenced byte offset.
                    let estimated = signals
                        .iter()
                        .map(|signal| signal.byte_offset + 1)
                        .max()
                        .unwrap_or(1)
                        .max(1) as u16;
                    if self
                        .write_sm_entry(position, sm_index, 0x1100, estimated, sm_control, 0x01)
                        .is_ok()
                    {
                        let window = self.read_sm_window(adp, sm_index)?;
                        sm_start = window.0;
                        sm_len = window.1;
                        debug!(
                            "slave {} SM{} after direct SM fallback: start=0x{:04x} len={}",
                            position, sm_index, sm_start, sm_len
                        );
                    }
                }
            }
            if sm_len == 0 {
                continue;
            }

            self.write_fmmu_entry(
                position,
                *fmmu_index,
                *logical_cursor,
                sm_len,
                sm_start,
                output_direction,
            )?;
            debug!(
                "slave {} FMMU{} {} logical=0x{:08x} len={} physical=0x{:04x}",
                position,
                fmmu_index,
                if output_direction { "write" } else { "read" },
                logical_cursor,
                sm_len,
                sm_start
            );
            if output_direction {
                self.output_windows.push(ProcessDataWindow {
                    slave_position: position,
                    physical_start: sm_start,
                    length: sm_len,
                    logical_start: *logical_cursor,
                });
            }
            *fmmu_index += 1;
            *logical_cursor += u32::from(sm_len);
            mapped += 1;
        }
        Ok(mapped)
    }
}

impl<L: RawLink> Transport for RawSocketTransport<L> {
    fn open(&mut self) -> Result<(), TransportError> {
        self.opened = true;
        self.datagram_index = 0;
        self.mailbox_counter = 0;
        self.last_working_counter = 0;
        self.last_frame_used_secondary = false;
        self.emergencies.clear();
        self.mailbox_diagnostics = MailboxDiagnostics::default();
        self.dc_diagnostics = DcDiagnostics::default();
        self.output_windows.clear();
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
        self.last_working_counter = 0;
        self.last_frame_used_secondary = false;
        self.emergencies.clear();
        self.output_windows.clear();
    }

    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<u16, TransportError> {
        self.ensure_open()?;

        let output_logical = self.options.logical_address;
        let input_logical = output_logical + tx.len() as u32;

        let lwr = DatagramRequest::logical(
            CommandType::Lwr,
            self.next_index(),
            output_logical,
            tx.to_vec(),
        );
        let (lwr_wkc, _) = self.send_datagram_failover(&lwr)?;
        trace!("LWR wkc={}", lwr_wkc);

        let lrd = DatagramRequest::logical(
            CommandType::Lrd,
            self.next_index(),
            input_logical,
            vec![0; rx.len()],
        );
        let (lrd_wkc, payload) = self.send_datagram_failover(&lrd)?;
        trace!("LRD wkc={}", lrd_wkc);

        rx.copy_from_slice(&payload[..rx.len()]);
        self.last_working_counter = lrd_wkc;
        Ok(lrd_wkc)
    }

    fn last_working_counter(&self) -> u16 {
        self.last_working_counter
    }

    fn request_network_state(&mut self, state: AlState) -> Result<(), TransportError> {
        self.ensure_open()?;
        let request = DatagramRequest::write(
            CommandType::Bwr,
            self.next_index(),
            0x0000,
            register::AL_CONTROL,
            vec![state as u8, 0x00],
        );
        let (wkc, _) = self.send_datagram(&request)?;
        self.last_working_counter = wkc;
        Ok(())
    }

    fn read_network_state(&mut self) -> Result<AlState, TransportError> {
        self.ensure_open()?;
        let request = DatagramRequest::read(
            CommandType::Brd,
            self.next_index(),
            0x0000,
            register::AL_STATUS,
            2,
        );
        let (wkc, payload) = self.send_datagram(&request)?;
        if payload.len() < 2 {
            return Err(TransportError::PayloadTooShort("AL status"));
        }
        self.last_working_counter = wkc;
        AlState::from_register(u16::from_le_bytes([payload[0], payload[1]]))
    }

    fn request_slave_state(&mut self, position: u16, state: AlState) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.write_register(
            auto_increment_address(position),
            register::AL_CONTROL,
            vec![state as u8, 0x00],
        )
    }

    fn read_slave_state(&mut self, position: u16) -> Result<AlState, TransportError> {
        self.ensure_open()?;
        let payload =
            self.read_register(auto_increment_address(position), register::AL_STATUS, 2)?;
        AlState::from_register(u16::from_le_bytes([payload[0], payload[1]]))
    }

    fn read_slave_al_status_code(&mut self, position: u16) -> Result<u16, TransportError> {
        self.ensure_open()?;
        let payload =
            self.read_register(auto_increment_address(position), register::AL_STATUS_CODE, 2)?;
        Ok(u16::from_le_bytes([payload[0], payload[1]]))
    }

    fn reconfigure_slave(&mut self, position: u16) -> Result<(), TransportError> {
        self.request_slave_state(position, AlState::Init)?;
        self.request_slave_state(position, AlState::PreOp)?;
        self.request_slave_state(position, AlState::SafeOp)
    }

    fn failover_slave(&mut self, position: u16) -> Result<(), TransportError> {
        self.request_slave_state(position, AlState::SafeOp)
    }

    fn sdo_upload(&mut self, position: u16, address: SdoAddress) -> Result<Vec<u8>, SdoError> {
        self.ensure_open()?;
        self.mailbox_diagnostics.transactions_started += 1;
        let result = self.sdo_upload_inner(position, address);
        self.finish_transaction(result)
    }

    fn sdo_download(
        &mut self,
        position: u16,
        address: SdoAddress,
        data: &[u8],
    ) -> Result<(), SdoError> {
        self.ensure_open()?;
        self.mailbox_diagnostics.transactions_started += 1;
        let result = self.sdo_download_inner(position, address, data);
        self.finish_transaction(result)
    }

    fn configure_pdo(
        &mut self,
        position: u16,
        mapping_index: u16,
        entries: &[PdoMappingEntry],
    ) -> Result<(), SdoError> {
        use crate::transport::TransportSdoExt;

        self.ensure_open()?;
        // Disable the mapping object, pack the entries, re-enable with the
        // final count, then point the SM assignment object at it.
        self.sdo_download_u8(position, SdoAddress::new(mapping_index, 0), 0)?;
        for (slot, entry) in entries.iter().enumerate() {
            self.sdo_download_u32(
                position,
                SdoAddress::new(mapping_index, slot as u8 + 1),
                entry.packed(),
            )?;
        }
        self.sdo_download_u8(position, SdoAddress::new(mapping_index, 0), entries.len() as u8)?;

        let sm_assign = if (RX_PDO_MAPPING_BASE..0x1800).contains(&mapping_index) {
            SM2_PDO_ASSIGN
        } else {
            SM3_PDO_ASSIGN
        };
        self.sdo_download_u8(position, SdoAddress::new(sm_assign, 0), 0)?;
        self.sdo_download_u16(position, SdoAddress::new(sm_assign, 1), mapping_index)?;
        self.sdo_download_u8(position, SdoAddress::new(sm_assign, 0), 1)?;
        Ok(())
    }

    fn poll_emergency(&mut self) -> Option<EmergencyMessage> {
        self.emergencies.pop_front()
    }

    fn discover_topology(&mut self) -> Result<TopologySnapshot, TransportError> {
        self.ensure_open()?;
        let mut snapshot = TopologySnapshot::default();

        for position in 0u16..256 {
            let adp = auto_increment_address(position);
            let al_payload = match self.read_register(adp, register::AL_STATUS, 2) {
                Ok(payload) => payload,
                Err(_) => {
                    // Position 0 is allowed one silent miss at cold start;
                    // any later gap ends the contiguous chain.
                    if position == 0 {
                        continue;
                    }
                    break;
                }
            };

            let mut info = TopologySlaveInfo { position, online: true, ..Default::default() };
            info.al_state =
                AlState::from_register(u16::from_le_bytes([al_payload[0], al_payload[1]])).ok();

            if let Ok(payload) = self.read_register(adp, register::ESC_TYPE, 2) {
                info.esc_type = u16::from_le_bytes([payload[0], payload[1]]);
            }
            if let Ok(payload) = self.read_register(adp, register::ESC_REVISION, 2) {
                info.esc_revision = u16::from_le_bytes([payload[0], payload[1]]);
            }

            // Prefer the standardized CoE identity object; fall back to
            // the SII identity words for mailbox-less slaves.
            let vendor = self
                .sdo_upload(position, SdoAddress::new(coe::IDENTITY_OBJECT, 0x01))
                .ok()
                .filter(|data| data.len() >= 4)
                .map(|data| u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
            let product = self
                .sdo_upload(position, SdoAddress::new(coe::IDENTITY_OBJECT, 0x02))
                .ok()
                .filter(|data| data.len() >= 4)
                .map(|data| u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
            if let (Some(vendor_id), Some(product_code)) = (vendor, product) {
                info.vendor_id = vendor_id;
                info.product_code = product_code;
                info.identity_from_coe = true;
            } else {
                let sii_vendor = self.read_sii_word32(adp, register::SII_WORD_VENDOR_ID).ok();
                let sii_product = self.read_sii_word32(adp, register::SII_WORD_PRODUCT_CODE).ok();
                if let (Some(vendor_id), Some(product_code)) = (sii_vendor, sii_product) {
                    info.vendor_id = vendor_id;
                    info.product_code = product_code;
                    info.identity_from_sii = true;
                }
            }

            snapshot.slaves.push(info);
        }

        snapshot.redundancy_healthy = self.secondary.is_some() || !self.options.redundancy_enabled;
        Ok(snapshot)
    }

    fn is_redundancy_link_healthy(&mut self) -> Result<bool, TransportError> {
        if !self.options.redundancy_enabled {
            return Ok(true);
        }
        Ok(self.secondary.is_some())
    }

    fn configure_process_image(
        &mut self,
        config: &NetworkConfiguration,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.output_windows.clear();

        let position_of = |name: &str| {
            config
                .slaves
                .iter()
                .find(|slave| slave.name == name)
                .map(|slave| slave.position)
        };
        let mut output_slaves: Vec<(u16, Vec<SignalBinding>)> = Vec::new();
        let mut input_slaves: Vec<(u16, Vec<SignalBinding>)> = Vec::new();
        for signal in &config.signals {
            let position = match position_of(&signal.slave_name) {
                Some(position) => position,
                None => continue,
            };
            let bucket = match signal.direction {
                SignalDirection::Output => &mut output_slaves,
                SignalDirection::Input => &mut input_slaves,
            };
            match bucket.iter_mut().find(|(existing, _)| *existing == position) {
                Some((_, signals)) => signals.push(signal.clone()),
                None => bucket.push((position, vec![signal.clone()])),
            }
        }
        output_slaves.sort_by_key(|(position, _)| *position);
        input_slaves.sort_by_key(|(position, _)| *position);

        let mut fmmu_index = 0u8;
        let mut output_logical = self.options.logical_address;
        let mapped_outputs =
            self.map_direction(&output_slaves, true, &mut output_logical, &mut fmmu_index)?;
        let mut input_logical =
            self.options.logical_address + config.process_image_output_bytes as u32;
        let mapped_inputs =
            self.map_direction(&input_slaves, false, &mut input_logical, &mut fmmu_index)?;

        if !output_slaves.is_empty() && mapped_outputs == 0 {
            return Err(TransportError::NoMappedWindow("output"));
        }
        if !input_slaves.is_empty() && mapped_inputs == 0 {
            return Err(TransportError::NoMappedWindow("input"));
        }
        debug!("process image mapped: outputs={} inputs={}", mapped_outputs, mapped_inputs);
        Ok(())
    }

    fn read_dc_system_time(&mut self, position: u16) -> Result<i64, TransportError> {
        self.dc_diagnostics.read_attempts += 1;
        if let Err(err) = self.ensure_open() {
            self.dc_diagnostics.read_failures += 1;
            return Err(err);
        }

        let payload =
            match self.read_register(auto_increment_address(position), register::DC_SYSTEM_TIME, 8)
            {
                Ok(payload) => payload,
                Err(err) => {
                    self.dc_diagnostics.read_failures += 1;
                    return Err(err);
                }
            };
        if payload.len() < 8 {
            self.dc_diagnostics.read_invalid_payloads += 1;
            self.dc_diagnostics.read_failures += 1;
            return Err(TransportError::PayloadTooShort("DC system time"));
        }
        self.dc_diagnostics.read_successes += 1;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&payload[..8]);
        Ok(i64::from_le_bytes(bytes))
    }

    fn write_dc_system_time_offset(
        &mut self,
        position: u16,
        offset_ns: i64,
    ) -> Result<(), TransportError> {
        self.dc_diagnostics.write_attempts += 1;
        if let Err(err) = self.ensure_open() {
            self.dc_diagnostics.write_failures += 1;
            return Err(err);
        }
        match self.write_register(
            auto_increment_address(position),
            register::DC_SYSTEM_TIME_OFFSET,
            offset_ns.to_le_bytes().to_vec(),
        ) {
            Ok(()) => {
                self.dc_diagnostics.write_successes += 1;
                Ok(())
            }
            Err(err) => {
                self.dc_diagnostics.write_failures += 1;
                Err(err)
            }
        }
    }
}
