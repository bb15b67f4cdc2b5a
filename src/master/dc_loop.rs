//! Closed-loop DC discipline: read the reference slave's system time,
//! discipline it against the host monotonic clock, and write back the
//! clamped correction.

use log::trace;

use crate::dc::{clamp_dc_step, DcPolicyAction, DcSyncSample};
use crate::error::MasterError;
use crate::transport::Transport;

use super::MasterInner;

impl<T: Transport> MasterInner<T> {
    pub(crate) fn update_dc_sync_quality(&mut self, phase_error_ns: i64) {
        if let Some(action) = self.dc_quality.record(phase_error_ns) {
            self.apply_dc_policy(action);
        }
    }

    fn apply_dc_policy(&mut self, action: DcPolicyAction) {
        match action {
            DcPolicyAction::Warn => {
                self.set_error("DC sync out-of-window threshold exceeded".into());
            }
            DcPolicyAction::Degrade => {
                self.degraded = true;
                self.set_error("DC sync degraded: out-of-window threshold exceeded".into());
            }
            DcPolicyAction::Recover => {
                self.set_error("DC sync recovery requested due to out-of-window threshold".into());
                if self.started {
                    let _ = self.recover_network_locked();
                }
            }
        }
    }

    /// Per-cycle closed-loop update. A disabled loop is a no-op; an
    /// unreadable reference clock fails the cycle.
    pub(crate) fn run_dc_closed_loop_update(&mut self) -> Result<(), MasterError> {
        if !self.dc_options.enabled {
            return Ok(());
        }

        let reference = self.dc_options.reference_slave_position;
        let slave_time_ns = match self.transport.read_dc_system_time(reference) {
            Ok(time) => time,
            Err(err) => {
                self.set_error(format!("DC read failed: {}", err));
                return Err(MasterError::DcReadFailed(err));
            }
        };
        let host_time_ns =
            self.start_instant.elapsed().as_nanos() as i64 + self.dc_options.target_phase_ns;

        let sample = DcSyncSample { reference_time_ns: slave_time_ns, local_time_ns: host_time_ns };
        let raw_correction = self.dc_controller.update(sample);
        self.update_dc_sync_quality(sample.reference_time_ns - sample.local_time_ns);

        let previous = self.last_applied_dc_correction_ns.unwrap_or(0);
        let applied = clamp_dc_step(
            raw_correction,
            previous,
            self.dc_options.max_correction_step_ns,
            self.dc_options.max_slew_per_cycle_ns,
        );
        if let Err(err) = self.transport.write_dc_system_time_offset(reference, applied) {
            self.set_error(format!("DC write failed: {}", err));
            return Err(MasterError::DcWriteFailed(err));
        }
        self.last_applied_dc_correction_ns = Some(applied);
        trace!(
            "dc loop: ref_ns={} host_ns={} raw_corr_ns={} applied_corr_ns={} locked={}",
            sample.reference_time_ns,
            sample.local_time_ns,
            raw_correction,
            applied,
            self.dc_quality.snapshot().locked
        );
        Ok(())
    }
}
