use core::fmt;

use crate::al_state::AlState;
use crate::frame::coe::AbortCode;

/// Datagram- and socket-level failures of the raw transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    NotOpen,
    NotSupported,
    Io(String),
    SendTruncated { sent: usize, frame: usize },
    ReceiveTimeout,
    FrameNotFound,
    WkcTooLow { got: u16, expected: u16 },
    ImageSizeMismatch { tx: usize, rx: usize },
    PayloadTooShort(&'static str),
    InvalidAlState(u16),
    MailboxTooLarge { size: usize, window: usize },
    MailboxBusy,
    MailboxTimeout,
    EepromBusyTimeout,
    EepromStatusError(u16),
    NoMappedWindow(&'static str),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOpen => write!(f, "transport not open"),
            Self::NotSupported => write!(f, "operation not supported by this transport"),
            Self::Io(msg) => write!(f, "socket io error: {}", msg),
            Self::SendTruncated { sent, frame } => {
                write!(f, "short send: {} of {} bytes", sent, frame)
            }
            Self::ReceiveTimeout => write!(f, "receive timeout"),
            Self::FrameNotFound => write!(f, "response frame not found in cycle window"),
            Self::WkcTooLow { got, expected } => {
                write!(f, "working counter too low (got={}, expected>={})", got, expected)
            }
            Self::ImageSizeMismatch { tx, rx } => {
                write!(f, "tx/rx process image size mismatch ({} vs {})", tx, rx)
            }
            Self::PayloadTooShort(what) => write!(f, "{} payload too short", what),
            Self::InvalidAlState(raw) => write!(f, "unknown AL state value 0x{:04x}", raw),
            Self::MailboxTooLarge { size, window } => {
                write!(f, "mailbox payload of {} bytes exceeds {}-byte window", size, window)
            }
            Self::MailboxBusy => write!(f, "mailbox busy"),
            Self::MailboxTimeout => write!(f, "timed out waiting for CoE mailbox response"),
            Self::EepromBusyTimeout => write!(f, "EEPROM busy bit did not clear"),
            Self::EepromStatusError(status) => {
                write!(f, "EEPROM status error bits set: 0x{:04x}", status)
            }
            Self::NoMappedWindow(direction) => write!(
                f,
                "no {} slaves produced a valid sync manager window (all lengths were zero)",
                direction
            ),
        }
    }
}

impl std::error::Error for TransportError {}

/// Mailbox failure classification used by transaction diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailboxErrorClass {
    #[default]
    None,
    Timeout,
    Busy,
    StaleCounter,
    ParseReject,
    Abort,
    TransportIo,
}

/// SDO transaction outcome. Aborts carry the 32-bit CoE abort code;
/// transport failures keep their datagram-level cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdoError {
    Abort(u32),
    Protocol(CoeParseError),
    Transport(TransportError),
}

impl SdoError {
    pub fn abort_code(&self) -> Option<AbortCode> {
        match self {
            Self::Abort(code) => Some(AbortCode::from(*code)),
            Self::Protocol(CoeParseError::Abort(code)) => Some(AbortCode::from(*code)),
            _ => None,
        }
    }
}

impl fmt::Display for SdoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Abort(code) => {
                write!(f, "SDO abort 0x{:08x}: {}", code, AbortCode::from(*code).description())
            }
            Self::Protocol(err) => write!(f, "SDO protocol reject: {}", err),
            Self::Transport(err) => write!(f, "SDO transport failure: {}", err),
        }
    }
}

impl std::error::Error for SdoError {}

impl From<TransportError> for SdoError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<CoeParseError> for SdoError {
    fn from(err: CoeParseError) -> Self {
        match err {
            CoeParseError::Abort(code) => Self::Abort(code),
            other => Self::Protocol(other),
        }
    }
}

/// Rejections raised while decoding CoE mailbox payloads. A reject drops
/// the frame from the match set; an abort is an accepted-but-failed SDO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoeParseError {
    TooShort(&'static str),
    ServiceMismatch,
    AddressMismatch,
    UnexpectedCommand(u8),
    ToggleMismatch { got: u8, expected: u8 },
    InvalidUnusedCount(u8),
    Abort(u32),
}

impl fmt::Display for CoeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooShort(what) => write!(f, "{} too short", what),
            Self::ServiceMismatch => write!(f, "unexpected CoE service"),
            Self::AddressMismatch => write!(f, "SDO response address mismatch"),
            Self::UnexpectedCommand(cmd) => write!(f, "unexpected SDO command 0x{:02x}", cmd),
            Self::ToggleMismatch { got, expected } => {
                write!(f, "SDO toggle mismatch (got={}, expected={})", got, expected)
            }
            Self::InvalidUnusedCount(n) => {
                write!(f, "invalid unused-byte count {} in segment", n)
            }
            Self::Abort(code) => write!(f, "SDO abort 0x{:08x}", code),
        }
    }
}

impl std::error::Error for CoeParseError {}

/// Orchestrator-level failures surfaced through `last_error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterError {
    NotConfigured,
    NotStarted,
    InvalidConfiguration(String),
    UnknownOutputSignal(String),
    UnknownInputSignal(String),
    ByteRangeOutOfBounds,
    TransitionTimeout { target: AlState },
    SlaveTransitionTimeout { position: u16, target: AlState },
    Transport(TransportError),
    Sdo(SdoError),
    DcReadFailed(TransportError),
    DcWriteFailed(TransportError),
    TopologyRefreshFailed(TransportError),
}

impl fmt::Display for MasterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConfigured => write!(f, "master not configured"),
            Self::NotStarted => write!(f, "master not started"),
            Self::InvalidConfiguration(msg) => write!(f, "configuration invalid: {}", msg),
            Self::UnknownOutputSignal(name) => {
                write!(f, "unknown output signal or wrong direction: {}", name)
            }
            Self::UnknownInputSignal(name) => {
                write!(f, "unknown input signal or wrong direction: {}", name)
            }
            Self::ByteRangeOutOfBounds => write!(f, "byte range outside process image"),
            Self::TransitionTimeout { target } => {
                write!(f, "timeout waiting for network state {}", target)
            }
            Self::SlaveTransitionTimeout { position, target } => {
                write!(f, "timeout waiting for slave {} state {}", position, target)
            }
            Self::Transport(err) => write!(f, "transport: {}", err),
            Self::Sdo(err) => write!(f, "{}", err),
            Self::DcReadFailed(err) => write!(f, "DC read failed: {}", err),
            Self::DcWriteFailed(err) => write!(f, "DC write failed: {}", err),
            Self::TopologyRefreshFailed(err) => write!(f, "topology refresh failed: {}", err),
        }
    }
}

impl std::error::Error for MasterError {}

impl From<TransportError> for MasterError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<SdoError> for MasterError {
    fn from(err: SdoError) -> Self {
        Self::Sdo(err)
    }
}
