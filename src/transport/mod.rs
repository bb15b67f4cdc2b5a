//! Transport abstraction: the orchestrator is polymorphic over a
//! capability set covering cyclic exchange, AL state handling, CoE
//! services, topology discovery and DC register access. Optional
//! capabilities default to "not supported".

pub mod mock;
pub mod raw_socket;

pub use mock::*;
pub use raw_socket::*;

use std::time::Duration;

use crate::al_state::AlState;
use crate::config::NetworkConfiguration;
use crate::error::{MailboxErrorClass, SdoError, TransportError};
use crate::frame::coe::{EmergencyMessage, PdoMappingEntry, SdoAddress};
use crate::topology::TopologySnapshot;

/// FoE file transfer request header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FoeRequest {
    pub file_name: String,
    pub password: u32,
}

/// FoE file transfer result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FoeResponse {
    pub data: Vec<u8>,
}

/// Mailbox SM status polling policy. Strict requires the SM status gate,
/// Poll ignores it entirely, and Hybrid reads through every few cycles to
/// tolerate slaves that do not update the bit reliably.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailboxStatusMode {
    Strict,
    Poll,
    #[default]
    Hybrid,
}

/// Write/read mailbox fallback windows used when SM0/SM1 cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxWindows {
    pub write_offset: u16,
    pub write_size: u16,
    pub read_offset: u16,
    pub read_size: u16,
}

impl Default for MailboxWindows {
    fn default() -> Self {
        Self { write_offset: 0x1000, write_size: 0x0080, read_offset: 0x1080, read_size: 0x0080 }
    }
}

/// Datagram-level retry budget for mailbox traffic. Retries apply only to
/// socket errors and timeouts, never across an accepted CoE abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxRetryConfig {
    pub retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for MailboxRetryConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(8),
        }
    }
}

/// Raw transport runtime options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub cycle_timeout: Duration,
    pub logical_address: u32,
    pub expected_working_counter: u16,
    pub max_frames_per_cycle: usize,
    pub redundancy_enabled: bool,
    pub mailbox_windows: MailboxWindows,
    pub mailbox_status_mode: MailboxStatusMode,
    pub emergency_queue_limit: usize,
    pub retry: MailboxRetryConfig,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            cycle_timeout: Duration::from_millis(10),
            logical_address: 0,
            expected_working_counter: 1,
            max_frames_per_cycle: 128,
            redundancy_enabled: false,
            mailbox_windows: MailboxWindows::default(),
            mailbox_status_mode: MailboxStatusMode::default(),
            emergency_queue_limit: 32,
            retry: MailboxRetryConfig::default(),
        }
    }
}

/// Mailbox-path diagnostics counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MailboxDiagnostics {
    pub transactions_started: u64,
    pub transactions_failed: u64,
    pub mailbox_writes: u64,
    pub mailbox_reads: u64,
    pub datagram_retries: u64,
    pub mailbox_timeouts: u64,
    pub error_timeouts: u64,
    pub stale_counter_drops: u64,
    pub parse_rejects: u64,
    pub emergency_queued: u64,
    pub emergency_dropped: u64,
    pub matched_responses: u64,
    pub last_error_class: MailboxErrorClass,
}

/// DC register access counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DcDiagnostics {
    pub read_attempts: u64,
    pub read_successes: u64,
    pub read_failures: u64,
    pub read_invalid_payloads: u64,
    pub write_attempts: u64,
    pub write_successes: u64,
    pub write_failures: u64,
}

/// Capability set the orchestrator drives. A cyclic-only transport needs
/// `open`, `close` and `exchange`; everything else has a conservative
/// default.
pub trait Transport {
    fn open(&mut self) -> Result<(), TransportError>;
    fn close(&mut self);

    /// One cyclic process-data exchange: push `tx`, fill `rx`, return the
    /// working counter of the input leg.
    fn exchange(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<u16, TransportError>;

    fn last_working_counter(&self) -> u16 {
        0
    }

    fn request_network_state(&mut self, _state: AlState) -> Result<(), TransportError> {
        Err(TransportError::NotSupported)
    }

    fn read_network_state(&mut self) -> Result<AlState, TransportError> {
        Err(TransportError::NotSupported)
    }

    fn request_slave_state(&mut self, _position: u16, _state: AlState) -> Result<(), TransportError> {
        Err(TransportError::NotSupported)
    }

    fn read_slave_state(&mut self, _position: u16) -> Result<AlState, TransportError> {
        Err(TransportError::NotSupported)
    }

    fn read_slave_al_status_code(&mut self, _position: u16) -> Result<u16, TransportError> {
        Err(TransportError::NotSupported)
    }

    /// Walk the slave back through Init and PreOp up to SafeOp so it can
    /// be retried into OP with a clean configuration.
    fn reconfigure_slave(&mut self, _position: u16) -> Result<(), TransportError> {
        Err(TransportError::NotSupported)
    }

    /// Pin a slave in SafeOp as the failover parking state.
    fn failover_slave(&mut self, _position: u16) -> Result<(), TransportError> {
        Err(TransportError::NotSupported)
    }

    fn sdo_upload(&mut self, _position: u16, _address: SdoAddress) -> Result<Vec<u8>, SdoError> {
        Err(SdoError::Transport(TransportError::NotSupported))
    }

    fn sdo_download(
        &mut self,
        _position: u16,
        _address: SdoAddress,
        _data: &[u8],
    ) -> Result<(), SdoError> {
        Err(SdoError::Transport(TransportError::NotSupported))
    }

    /// Program a PDO mapping object and its SM assignment object.
    fn configure_pdo(
        &mut self,
        _position: u16,
        _mapping_index: u16,
        _entries: &[PdoMappingEntry],
    ) -> Result<(), SdoError> {
        Err(SdoError::Transport(TransportError::NotSupported))
    }

    /// Pop one queued emergency telegram, oldest first.
    fn poll_emergency(&mut self) -> Option<EmergencyMessage> {
        None
    }

    fn discover_topology(&mut self) -> Result<TopologySnapshot, TransportError> {
        Err(TransportError::NotSupported)
    }

    fn is_redundancy_link_healthy(&mut self) -> Result<bool, TransportError> {
        Ok(true)
    }

    /// SAFE-OP bootstrap: resolve SM windows and program FMMU entries for
    /// every slave that carries process data.
    fn configure_process_image(
        &mut self,
        _config: &NetworkConfiguration,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn read_dc_system_time(&mut self, _position: u16) -> Result<i64, TransportError> {
        Err(TransportError::NotSupported)
    }

    fn write_dc_system_time_offset(
        &mut self,
        _position: u16,
        _offset_ns: i64,
    ) -> Result<(), TransportError> {
        Err(TransportError::NotSupported)
    }

    fn foe_read(&mut self, _position: u16, _request: &FoeRequest) -> Result<FoeResponse, TransportError> {
        Err(TransportError::NotSupported)
    }

    fn foe_write(
        &mut self,
        _position: u16,
        _request: &FoeRequest,
        _data: &[u8],
    ) -> Result<(), TransportError> {
        Err(TransportError::NotSupported)
    }

    fn eoe_send(&mut self, _position: u16, _frame: &[u8]) -> Result<(), TransportError> {
        Err(TransportError::NotSupported)
    }

    fn eoe_receive(&mut self, _position: u16) -> Result<Option<Vec<u8>>, TransportError> {
        Err(TransportError::NotSupported)
    }
}

macro_rules! sdo_typed_access {
    ($($ty:ty),*) => {
        /// Typed little-endian convenience wrappers over the raw SDO services.
        pub trait TransportSdoExt: Transport {
            $(
                ::paste::paste! {
                    fn [<sdo_upload_ $ty>](
                        &mut self,
                        position: u16,
                        address: SdoAddress,
                    ) -> Result<$ty, SdoError> {
                        let data = self.sdo_upload(position, address)?;
                        let mut bytes = [0u8; core::mem::size_of::<$ty>()];
                        let used = bytes.len().min(data.len());
                        bytes[..used].copy_from_slice(&data[..used]);
                        Ok(<$ty>::from_le_bytes(bytes))
                    }

                    fn [<sdo_download_ $ty>](
                        &mut self,
                        position: u16,
                        address: SdoAddress,
                        value: $ty,
                    ) -> Result<(), SdoError> {
                        self.sdo_download(position, address, &value.to_le_bytes())
                    }
                }
            )*
        }

        impl<T: Transport + ?Sized> TransportSdoExt for T {}
    };
}

sdo_typed_access!(u8, u16, u32);
