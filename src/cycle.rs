//! Fixed-period cyclic driver. A dedicated worker thread invokes
//! `run_cycle` on an absolute schedule so late wake-ups do not accumulate
//! drift, and stops after a run of consecutive failures when asked to.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::master::EthercatMaster;
use crate::transport::Transport;

/// Provider of an optional per-cycle phase correction in nanoseconds,
/// added to the next absolute wake time.
pub type PhaseCorrectionProvider = Box<dyn Fn() -> Option<i64> + Send>;

/// Cyclic driver configuration.
pub struct CycleControllerOptions {
    pub period: Duration,
    pub stop_on_error: bool,
    pub max_consecutive_failures: usize,
    pub phase_correction: Option<PhaseCorrectionProvider>,
}

impl Default for CycleControllerOptions {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1),
            stop_on_error: true,
            max_consecutive_failures: 3,
            phase_correction: None,
        }
    }
}

/// Runtime report for one executed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle_index: u64,
    pub success: bool,
    pub working_counter: u16,
    pub runtime: Duration,
}

pub type CycleReportCallback = Box<dyn Fn(&CycleReport) + Send>;

/// Worker-thread runner for `EthercatMaster::run_cycle`.
#[derive(Default)]
pub struct CycleController {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CycleController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the worker. Returns `false` when it is already running.
    pub fn start<T>(
        &mut self,
        master: Arc<EthercatMaster<T>>,
        options: CycleControllerOptions,
        callback: Option<CycleReportCallback>,
    ) -> bool
    where
        T: Transport + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let running = Arc::clone(&self.running);
        self.worker = Some(thread::spawn(move || {
            let mut cycle_index = 0u64;
            let mut consecutive_failures = 0usize;
            let mut next_wake = Instant::now();

            while running.load(Ordering::SeqCst) {
                let start = Instant::now();
                let ok = master.run_cycle().is_ok();
                let runtime = start.elapsed();

                if ok {
                    consecutive_failures = 0;
                } else {
                    consecutive_failures += 1;
                }

                let report = CycleReport {
                    cycle_index,
                    success: ok,
                    working_counter: master.last_working_counter(),
                    runtime,
                };
                cycle_index += 1;
                if let Some(callback) = &callback {
                    callback(&report);
                }

                if !ok
                    && options.stop_on_error
                    && consecutive_failures >= options.max_consecutive_failures
                {
                    warn!(
                        "cyclic driver stopping after {} consecutive failures",
                        consecutive_failures
                    );
                    running.store(false, Ordering::SeqCst);
                    break;
                }

                // Absolute schedule: late cycles shorten the next sleep
                // instead of shifting every subsequent deadline.
                next_wake += options.period;
                if let Some(provider) = &options.phase_correction {
                    if let Some(correction_ns) = provider() {
                        if correction_ns >= 0 {
                            next_wake += Duration::from_nanos(correction_ns as u64);
                        } else {
                            next_wake -= Duration::from_nanos(correction_ns.unsigned_abs());
                        }
                    }
                }
                let now = Instant::now();
                if next_wake > now {
                    thread::sleep(next_wake - now);
                }
            }
            debug!("cyclic driver exited after {} cycles", cycle_index);
        }));
        true
    }

    /// Cooperative stop, observed between cycles.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for CycleController {
    fn drop(&mut self) {
        self.stop();
    }
}
