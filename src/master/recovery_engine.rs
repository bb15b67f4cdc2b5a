//! Diagnostics collection and the per-slave recovery actions.

use std::time::SystemTime;

use log::{info, warn};

use crate::al_state::AlState;
use crate::recovery::{
    decide_recovery_action, decode_al_status, AlStatusInterpretation, RecoveryAction,
    RecoveryEvent, SlaveDiagnostic,
};
use crate::transport::Transport;

use super::MasterInner;

impl<T: Transport> MasterInner<T> {
    pub(crate) fn append_recovery_event(&mut self, event: RecoveryEvent) {
        self.recovery_events.push_back(event);
        while self.recovery_events.len() > self.recovery_options.max_event_history {
            self.recovery_events.pop_front();
        }
    }

    /// Read state and AL status code for every configured slave and
    /// classify what, if anything, should be done about it.
    pub(crate) fn collect_slave_diagnostics_locked(&mut self) -> Vec<SlaveDiagnostic> {
        let slaves = self.config.slaves.clone();
        let mut diagnostics = Vec::with_capacity(slaves.len());
        for slave in slaves {
            let position = slave.position;
            let mut diagnostic = SlaveDiagnostic { identity: slave, ..SlaveDiagnostic::default() };

            let state = self.transport.read_slave_state(position);
            let al_status_code = self.transport.read_slave_al_status_code(position);
            match (state, al_status_code) {
                (Ok(state), Ok(code)) => {
                    diagnostic.available = true;
                    diagnostic.state = Some(state);
                    diagnostic.al_status_code = code;
                    diagnostic.al_status = decode_al_status(code);
                    diagnostic.suggested_action =
                        match self.recovery_overrides.get(&code).copied() {
                            Some(action) => action,
                            None => decide_recovery_action(
                                &diagnostic,
                                self.retry_counts.get(&position).copied().unwrap_or(0),
                                self.reconfigure_counts.get(&position).copied().unwrap_or(0),
                                self.recovery_options.max_retries_per_slave,
                                self.recovery_options.max_reconfigure_per_slave,
                            ),
                        };
                }
                (state, code) => {
                    let cause = state.err().or(code.err());
                    diagnostic.available = false;
                    diagnostic.al_status = AlStatusInterpretation {
                        code: 0,
                        name: "Unavailable",
                        description: "slave state or AL status read failed",
                        recoverable: false,
                    };
                    diagnostic.suggested_action = RecoveryAction::Failover;
                    if let Some(err) = cause {
                        warn!(
                            "slave {} diagnostics unavailable: {}",
                            diagnostic.identity.position, err
                        );
                    }
                }
            }
            diagnostics.push(diagnostic);
        }
        self.last_diagnostics = diagnostics.clone();
        diagnostics
    }

    /// Run every suggested action. Never short-circuits so independent
    /// slaves are all serviced in the same pass.
    pub(crate) fn recover_network_locked(&mut self) -> bool {
        let diagnostics = self.collect_slave_diagnostics_locked();
        if diagnostics.is_empty() {
            self.set_error("no slaves available for recovery".into());
            return false;
        }

        let mut recovered_any = false;
        for diagnostic in &diagnostics {
            if diagnostic.suggested_action == RecoveryAction::None {
                continue;
            }
            if self.recover_slave_locked(diagnostic) {
                recovered_any = true;
            }
        }
        recovered_any
    }

    fn recover_slave_locked(&mut self, diagnostic: &SlaveDiagnostic) -> bool {
        let position = diagnostic.identity.position;
        let mut event = RecoveryEvent {
            timestamp: SystemTime::now(),
            cycle_index: self.statistics.cycles_total,
            slave_position: position,
            al_status_code: diagnostic.al_status_code,
            action: diagnostic.suggested_action,
            success: false,
            message: String::new(),
        };

        match diagnostic.suggested_action {
            RecoveryAction::None => {
                event.success = true;
                event.message = "no recovery needed".into();
                self.append_recovery_event(event);
                true
            }
            RecoveryAction::RetryTransition => {
                *self.retry_counts.entry(position).or_insert(0) += 1;
                event.success = self.transition_slave_to(position, AlState::Op).is_ok();
                event.message = if event.success {
                    info!("slave {} retry transition to OP succeeded", position);
                    "retry transition to OP succeeded".into()
                } else {
                    self.last_error.clone().unwrap_or_default()
                };
                let success = event.success;
                self.append_recovery_event(event);
                success
            }
            RecoveryAction::Reconfigure => {
                *self.reconfigure_counts.entry(position).or_insert(0) += 1;
                if let Err(err) = self.transport.reconfigure_slave(position) {
                    self.set_error(format!("reconfigure failed for slave {}: {}", position, err));
                    event.message = self.last_error.clone().unwrap_or_default();
                    self.append_recovery_event(event);
                    return false;
                }
                event.success = self.transition_slave_to(position, AlState::Op).is_ok();
                event.message = if event.success {
                    info!("slave {} reconfigure + transition to OP succeeded", position);
                    "reconfigure + transition to OP succeeded".into()
                } else {
                    self.last_error.clone().unwrap_or_default()
                };
                let success = event.success;
                self.append_recovery_event(event);
                success
            }
            RecoveryAction::Failover => {
                if let Err(err) = self.transport.failover_slave(position) {
                    self.set_error(format!("failover failed for slave {}: {}", position, err));
                    event.message = self.last_error.clone().unwrap_or_default();
                    self.append_recovery_event(event);
                    return false;
                }
                self.degraded = true;
                event.success = true;
                if self.recovery_options.stop_master_on_failover {
                    self.started = false;
                    self.transport.close();
                    self.set_error(format!(
                        "failover triggered master stop for slave {}",
                        position
                    ));
                    event.message = self.last_error.clone().unwrap_or_default();
                } else {
                    warn!("slave {} moved to failover/degraded mode", position);
                    event.message = "slave moved to failover/degraded mode".into();
                }
                self.append_recovery_event(event);
                true
            }
        }
    }
}
