//! Distributed-clock discipline: a low-pass PI loop on the phase error
//! between the reference clock and a local clock, plus the sync-quality
//! monitor that tracks lock state and drives the out-of-window policy.

use std::collections::VecDeque;

/// One timing sample fed to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DcSyncSample {
    pub reference_time_ns: i64,
    pub local_time_ns: i64,
}

/// Aggregated controller statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DcSyncStats {
    pub last_offset_ns: i64,
    pub filtered_offset_ns: i64,
    pub correction_ns: i64,
    pub max_abs_offset_ns: i64,
    pub jitter_rms_ns: f64,
    pub samples: u64,
}

/// Tuning for the PI controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DcControllerOptions {
    pub filter_alpha: f64,
    pub kp: f64,
    pub ki: f64,
    pub correction_clamp_ns: i64,
}

impl Default for DcControllerOptions {
    fn default() -> Self {
        Self { filter_alpha: 0.2, kp: 0.1, ki: 0.01, correction_clamp_ns: 50_000 }
    }
}

/// PI controller with a first-order low-pass on the phase error. The
/// absolute clamp applies to the raw PI output; per-cycle slew limiting of
/// the applied correction is done by [`clamp_dc_step`].
#[derive(Debug, Clone, Default)]
pub struct DistributedClockController {
    options: DcControllerOptions,
    stats: DcSyncStats,
    integral: f64,
    sum_squares: f64,
}

impl DistributedClockController {
    pub fn new(options: DcControllerOptions) -> Self {
        Self { options, ..Self::default() }
    }

    /// Feed one sample, returning the clamped correction in nanoseconds.
    pub fn update(&mut self, sample: DcSyncSample) -> i64 {
        let offset = sample.reference_time_ns - sample.local_time_ns;
        self.stats.last_offset_ns = offset;

        let filtered = if self.stats.samples == 0 {
            offset as f64
        } else {
            (1.0 - self.options.filter_alpha) * self.stats.filtered_offset_ns as f64
                + self.options.filter_alpha * offset as f64
        };
        self.stats.filtered_offset_ns = filtered as i64;

        self.integral += filtered;
        let clamp = self.options.correction_clamp_ns as f64;
        let correction = (self.options.kp * filtered + self.options.ki * self.integral)
            .clamp(-clamp, clamp);
        self.stats.correction_ns = correction as i64;

        self.stats.max_abs_offset_ns = self.stats.max_abs_offset_ns.max(offset.abs());
        self.sum_squares += offset as f64 * offset as f64;
        self.stats.samples += 1;
        self.stats.jitter_rms_ns = (self.sum_squares / self.stats.samples as f64).sqrt();

        self.stats.correction_ns
    }

    pub fn stats(&self) -> DcSyncStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.stats = DcSyncStats::default();
        self.integral = 0.0;
        self.sum_squares = 0.0;
    }
}

/// Bound a correction by an absolute step limit and by the per-cycle slew
/// from the previously applied correction. A limit of zero disables the
/// respective bound.
pub fn clamp_dc_step(
    correction_ns: i64,
    previous_correction_ns: i64,
    max_step_ns: i64,
    max_slew_ns: i64,
) -> i64 {
    let mut clamped = correction_ns;
    if max_step_ns > 0 && clamped.abs() > max_step_ns {
        clamped = if clamped < 0 { -max_step_ns } else { max_step_ns };
    }
    if max_slew_ns > 0 {
        let delta = clamped - previous_correction_ns;
        if delta.abs() > max_slew_ns {
            clamped = previous_correction_ns + if delta < 0 { -max_slew_ns } else { max_slew_ns };
        }
    }
    clamped
}

/// Action taken when the loop stays out of the phase window too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DcPolicyAction {
    #[default]
    Warn,
    Degrade,
    Recover,
}

/// Sync-quality monitor configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcSyncQualityOptions {
    pub enabled: bool,
    pub max_phase_error_ns: i64,
    pub lock_acquire_in_window_cycles: usize,
    pub max_consecutive_out_of_window_cycles: usize,
    pub history_window_cycles: usize,
    pub policy_action: DcPolicyAction,
}

impl Default for DcSyncQualityOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            max_phase_error_ns: 1_000,
            lock_acquire_in_window_cycles: 16,
            max_consecutive_out_of_window_cycles: 8,
            history_window_cycles: 1024,
            policy_action: DcPolicyAction::Warn,
        }
    }
}

/// Observable sync-quality state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DcSyncQualitySnapshot {
    pub enabled: bool,
    pub locked: bool,
    pub last_phase_error_ns: i64,
    pub samples: u64,
    pub consecutive_in_window_cycles: usize,
    pub consecutive_out_of_window_cycles: usize,
    pub lock_acquisitions: u64,
    pub lock_losses: u64,
    pub policy_triggers: u64,
    pub jitter_p50_ns: i64,
    pub jitter_p95_ns: i64,
    pub jitter_p99_ns: i64,
    pub jitter_max_ns: i64,
}

/// Lock tracker over per-cycle phase errors. Returns the configured policy
/// action exactly once per out-of-window run; the latch clears when the
/// loop re-acquires lock.
#[derive(Debug, Default)]
pub struct SyncQualityMonitor {
    options: DcSyncQualityOptions,
    snapshot: DcSyncQualitySnapshot,
    history_abs_ns: VecDeque<i64>,
    policy_latched: bool,
}

impl SyncQualityMonitor {
    pub fn new(options: DcSyncQualityOptions) -> Self {
        let mut monitor = Self { options, ..Self::default() };
        monitor.snapshot.enabled = options.enabled;
        monitor
    }

    pub fn snapshot(&self) -> DcSyncQualitySnapshot {
        self.snapshot
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    /// Record one phase error. Returns `Some(action)` when the policy must
    /// fire for this out-of-window run.
    pub fn record(&mut self, phase_error_ns: i64) -> Option<DcPolicyAction> {
        if !self.options.enabled {
            return None;
        }
        self.snapshot.enabled = true;
        self.snapshot.last_phase_error_ns = phase_error_ns;
        self.snapshot.samples += 1;

        let abs_error = phase_error_ns.abs();
        let in_window = abs_error <= self.options.max_phase_error_ns;
        let mut fire = None;
        if in_window {
            self.snapshot.consecutive_in_window_cycles += 1;
            self.snapshot.consecutive_out_of_window_cycles = 0;
            if !self.snapshot.locked
                && self.snapshot.consecutive_in_window_cycles
                    >= self.options.lock_acquire_in_window_cycles
            {
                self.snapshot.locked = true;
                self.snapshot.lock_acquisitions += 1;
                self.policy_latched = false;
            }
        } else {
            self.snapshot.consecutive_in_window_cycles = 0;
            self.snapshot.consecutive_out_of_window_cycles += 1;
            if self.snapshot.locked {
                self.snapshot.locked = false;
                self.snapshot.lock_losses += 1;
            }
            if self.snapshot.consecutive_out_of_window_cycles
                >= self.options.max_consecutive_out_of_window_cycles
                && !self.policy_latched
            {
                self.policy_latched = true;
                self.snapshot.policy_triggers += 1;
                fire = Some(self.options.policy_action);
            }
        }

        self.history_abs_ns.push_back(abs_error);
        while self.history_abs_ns.len() > self.options.history_window_cycles {
            self.history_abs_ns.pop_front();
        }
        let mut sorted: Vec<i64> = self.history_abs_ns.iter().copied().collect();
        sorted.sort_unstable();
        self.snapshot.jitter_p50_ns = percentile_from_sorted(&sorted, 50.0);
        self.snapshot.jitter_p95_ns = percentile_from_sorted(&sorted, 95.0);
        self.snapshot.jitter_p99_ns = percentile_from_sorted(&sorted, 99.0);
        self.snapshot.jitter_max_ns = sorted.last().copied().unwrap_or(0);

        fire
    }
}

fn percentile_from_sorted(sorted: &[i64], percentile: f64) -> i64 {
    if sorted.is_empty() {
        return 0;
    }
    let index = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[index.saturating_sub(1).min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converges_on_constant_offset() {
        let mut controller = DistributedClockController::new(DcControllerOptions {
            filter_alpha: 0.3,
            kp: 0.2,
            ki: 0.0,
            correction_clamp_ns: 1_000_000,
        });
        let offset = 4_000i64;
        // After N >= 1/alpha samples the filtered offset is within 5%.
        for k in 0..8 {
            controller.update(DcSyncSample {
                reference_time_ns: 1_000_000 * k + offset,
                local_time_ns: 1_000_000 * k,
            });
        }
        let stats = controller.stats();
        assert!((stats.filtered_offset_ns - offset).abs() <= offset / 20);
        assert_eq!(stats.samples, 8);
    }

    #[test]
    fn corrections_respect_clamp() {
        let mut controller = DistributedClockController::new(DcControllerOptions {
            filter_alpha: 0.3,
            kp: 0.2,
            ki: 0.01,
            correction_clamp_ns: 1_000,
        });
        let samples = 32;
        for k in 1..=samples {
            let reference = 1_000_000 * k;
            let local = 1_000_000 * k - 800 + 10_000;
            let correction = controller.update(DcSyncSample {
                reference_time_ns: reference,
                local_time_ns: local,
            });
            assert!((-1_000..=1_000).contains(&correction));
        }
        let stats = controller.stats();
        assert_eq!(stats.samples, samples as u64);
        assert!(stats.max_abs_offset_ns >= 800);
        assert!(stats.jitter_rms_ns > 0.0);
    }

    #[test]
    fn step_clamp_bounds_magnitude_and_slew() {
        assert_eq!(clamp_dc_step(30_000, 0, 20_000, 0), 20_000);
        assert_eq!(clamp_dc_step(-30_000, 0, 20_000, 0), -20_000);
        assert_eq!(clamp_dc_step(10_000, 2_000, 20_000, 5_000), 7_000);
        assert_eq!(clamp_dc_step(-10_000, 2_000, 20_000, 5_000), -3_000);

        // Consecutive applications never move faster than the slew limit.
        let mut applied = 0i64;
        for raw in [18_000i64, -18_000, 18_000, 0] {
            let next = clamp_dc_step(raw, applied, 20_000, 5_000);
            assert!((next - applied).abs() <= 5_000);
            assert!(next.abs() <= 20_000);
            applied = next;
        }
    }

    fn monitor(policy: DcPolicyAction) -> SyncQualityMonitor {
        SyncQualityMonitor::new(DcSyncQualityOptions {
            enabled: true,
            max_phase_error_ns: 100,
            lock_acquire_in_window_cycles: 3,
            max_consecutive_out_of_window_cycles: 2,
            history_window_cycles: 16,
            policy_action: policy,
        })
    }

    #[test]
    fn lock_acquired_after_exact_in_window_run() {
        let mut monitor = monitor(DcPolicyAction::Warn);
        monitor.record(50);
        monitor.record(-80);
        assert!(!monitor.snapshot().locked);
        monitor.record(10);
        let snapshot = monitor.snapshot();
        assert!(snapshot.locked);
        assert_eq!(snapshot.lock_acquisitions, 1);
    }

    #[test]
    fn single_out_of_window_sample_unlocks() {
        let mut monitor = monitor(DcPolicyAction::Warn);
        for _ in 0..3 {
            monitor.record(0);
        }
        assert!(monitor.snapshot().locked);
        monitor.record(500);
        let snapshot = monitor.snapshot();
        assert!(!snapshot.locked);
        assert_eq!(snapshot.lock_losses, 1);
    }

    #[test]
    fn policy_fires_once_per_out_of_window_run() {
        let mut monitor = monitor(DcPolicyAction::Degrade);
        for _ in 0..3 {
            monitor.record(0);
        }
        assert_eq!(monitor.record(500), None);
        assert_eq!(monitor.record(500), Some(DcPolicyAction::Degrade));
        assert_eq!(monitor.record(500), None);
        assert_eq!(monitor.record(500), None);
        assert_eq!(monitor.snapshot().policy_triggers, 1);

        // Re-lock clears the latch; the next run fires again.
        for _ in 0..3 {
            monitor.record(0);
        }
        assert!(monitor.snapshot().locked);
        monitor.record(500);
        assert_eq!(monitor.record(500), Some(DcPolicyAction::Degrade));
        assert_eq!(monitor.snapshot().policy_triggers, 2);
    }

    #[test]
    fn jitter_percentiles_from_rolling_window() {
        let mut monitor = monitor(DcPolicyAction::Warn);
        for error in [10i64, -20, 30, 40, 50, 60, 70, 80] {
            monitor.record(error);
        }
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.jitter_p50_ns, 40);
        assert_eq!(snapshot.jitter_max_ns, 80);
        assert!(snapshot.jitter_p95_ns >= snapshot.jitter_p50_ns);
        assert!(snapshot.jitter_p99_ns >= snapshot.jitter_p95_ns);
    }

    #[test]
    fn disabled_monitor_records_nothing() {
        let mut monitor = SyncQualityMonitor::new(DcSyncQualityOptions::default());
        assert_eq!(monitor.record(1_000_000), None);
        assert_eq!(monitor.snapshot().samples, 0);
    }
}
