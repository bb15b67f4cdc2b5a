//! AL status interpretation and the recovery decision policy.

use core::fmt;
use std::time::SystemTime;

use crate::al_state::AlState;
use crate::config::SlaveIdentity;

/// Action the recovery engine takes for a diagnosed slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RecoveryAction {
    #[default]
    None,
    RetryTransition,
    Reconfigure,
    Failover,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::RetryTransition => "RetryTransition",
            Self::Reconfigure => "Reconfigure",
            Self::Failover => "Failover",
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse the textual form used by recovery-profile files.
pub fn parse_recovery_action(text: &str) -> Option<RecoveryAction> {
    match text.to_ascii_lowercase().as_str() {
        "none" => Some(RecoveryAction::None),
        "retrytransition" | "retry_transition" | "retry" => Some(RecoveryAction::RetryTransition),
        "reconfigure" => Some(RecoveryAction::Reconfigure),
        "failover" => Some(RecoveryAction::Failover),
        _ => None,
    }
}

/// Decoded AL status register code.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AlStatusInterpretation {
    pub code: u16,
    pub name: &'static str,
    pub description: &'static str,
    pub recoverable: bool,
}

/// Decode an AL status code through the fixed interpretation table.
pub fn decode_al_status(code: u16) -> AlStatusInterpretation {
    let (name, description, recoverable): (&'static str, &'static str, bool) = match code {
        0x0000 => ("NoError", "No AL status error", true),
        0x0011 => (
            "InvalidRequestedStateChange",
            "Requested state transition is not allowed",
            true,
        ),
        0x0012 => ("UnknownRequestedState", "Requested state is not recognized", false),
        0x0013 => ("BootstrapNotSupported", "Bootstrap transition unsupported", false),
        0x0014 => ("NoValidFirmware", "No valid firmware/application present", false),
        0x0015 => ("InvalidMailboxConfiguration", "Mailbox configuration invalid", true),
        0x0016 => ("InvalidMailboxConfiguration", "Mailbox setup conflict detected", true),
        0x0017 => ("InvalidSyncManagerConfiguration", "Sync manager assignment invalid", true),
        0x0018 => ("NoValidInputConfiguration", "Input process image configuration invalid", true),
        0x0019 => (
            "NoValidOutputConfiguration",
            "Output process image configuration invalid",
            true,
        ),
        0x001A => ("SyncError", "Synchronization error in distributed clock / sync path", true),
        0x001B => ("SyncManagerWatchdog", "Sync manager watchdog event", true),
        _ => ("Unknown", "Unrecognized AL status code", false),
    };
    AlStatusInterpretation { code, name, description, recoverable }
}

/// Diagnostic record for one configured slave.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SlaveDiagnostic {
    pub identity: SlaveIdentity,
    pub available: bool,
    pub state: Option<AlState>,
    pub al_status_code: u16,
    pub al_status: AlStatusInterpretation,
    pub suggested_action: RecoveryAction,
}

/// Decision ladder applied when no override matches: a healthy OP slave
/// needs nothing; recoverable codes retry while budget remains, then a
/// reconfigure is attempted, then failover.
pub fn decide_recovery_action(
    diagnostic: &SlaveDiagnostic,
    retry_count: usize,
    reconfigure_count: usize,
    max_retries: usize,
    max_reconfigure: usize,
) -> RecoveryAction {
    if !diagnostic.available {
        return RecoveryAction::Failover;
    }
    if diagnostic.state == Some(AlState::Op) && diagnostic.al_status_code == 0 {
        return RecoveryAction::None;
    }
    if diagnostic.al_status.recoverable && retry_count < max_retries {
        return RecoveryAction::RetryTransition;
    }
    if reconfigure_count < max_reconfigure {
        return RecoveryAction::Reconfigure;
    }
    RecoveryAction::Failover
}

/// Append-only record of one recovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryEvent {
    pub timestamp: SystemTime,
    pub cycle_index: u64,
    pub slave_position: u16,
    pub al_status_code: u16,
    pub action: RecoveryAction,
    pub success: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diagnostic(state: AlState, code: u16) -> SlaveDiagnostic {
        SlaveDiagnostic {
            identity: SlaveIdentity::new("EL2008", 2),
            available: true,
            state: Some(state),
            al_status_code: code,
            al_status: decode_al_status(code),
            suggested_action: RecoveryAction::None,
        }
    }

    #[test]
    fn status_table_fixed_entries() {
        let sm = decode_al_status(0x0017);
        assert_eq!(sm.name, "InvalidSyncManagerConfiguration");
        assert!(sm.recoverable);

        let firmware = decode_al_status(0x0014);
        assert_eq!(firmware.name, "NoValidFirmware");
        assert!(!firmware.recoverable);

        assert_eq!(decode_al_status(0x7777).name, "Unknown");
    }

    #[test]
    fn healthy_op_slave_needs_nothing() {
        let action = decide_recovery_action(&diagnostic(AlState::Op, 0), 0, 0, 3, 1);
        assert_eq!(action, RecoveryAction::None);
    }

    #[test]
    fn recoverable_code_retries_until_budget_spent() {
        let diag = diagnostic(AlState::SafeOp, 0x0017);
        assert_eq!(decide_recovery_action(&diag, 0, 0, 3, 1), RecoveryAction::RetryTransition);
        assert_eq!(decide_recovery_action(&diag, 2, 0, 3, 1), RecoveryAction::RetryTransition);
        assert_eq!(decide_recovery_action(&diag, 3, 0, 3, 1), RecoveryAction::Reconfigure);
        assert_eq!(decide_recovery_action(&diag, 3, 1, 3, 1), RecoveryAction::Failover);
    }

    #[test]
    fn unrecoverable_code_skips_retry() {
        let diag = diagnostic(AlState::Init, 0x0014);
        assert_eq!(decide_recovery_action(&diag, 0, 0, 3, 1), RecoveryAction::Reconfigure);
        assert_eq!(decide_recovery_action(&diag, 0, 1, 3, 1), RecoveryAction::Failover);
    }

    #[test]
    fn unavailable_slave_fails_over() {
        let mut diag = diagnostic(AlState::Op, 0);
        diag.available = false;
        assert_eq!(decide_recovery_action(&diag, 0, 0, 3, 1), RecoveryAction::Failover);
    }

    #[test]
    fn action_text_round_trip() {
        for action in [
            RecoveryAction::None,
            RecoveryAction::RetryTransition,
            RecoveryAction::Reconfigure,
            RecoveryAction::Failover,
        ] {
            assert_eq!(parse_recovery_action(action.as_str()), Some(action));
        }
        assert_eq!(parse_recovery_action("retry"), Some(RecoveryAction::RetryTransition));
        assert_eq!(parse_recovery_action("bogus"), None);
    }
}
