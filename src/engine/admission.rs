//! Load-based admission control
//!
//! Before each dequeue the creation engine reads the 5-minute load average and
//! sleeps `load * 10 + 1` time units. The `+1` keeps an idle node from
//! spinning. A node whose load exceeds the threshold takes no job that cycle.

use std::io;
use std::time::Duration;

use crate::config::AdmissionConfig;

/// Source of the node's load average
pub trait LoadProbe: Send + Sync {
    /// 5-minute load average
    fn five_minute(&self) -> io::Result<f64>;
}

/// Load average of the running kernel
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLoad;

impl LoadProbe for SystemLoad {
    fn five_minute(&self) -> io::Result<f64> {
        let mut loads = [0f64; 3];
        // SAFETY: getloadavg writes at most `nelem` doubles into the buffer,
        // which holds exactly 3.
        let samples = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
        if samples < 2 {
            return Err(io::Error::new(io::ErrorKind::Other, "getloadavg returned no 5-minute sample"));
        }
        Ok(loads[1])
    }
}

/// Delay before a dequeue attempt: `unit * (load * 10 + 1)`
///
/// Negative or non-finite loads count as 0.
pub fn admission_delay(load: f64, unit: Duration) -> Duration {
    let load = if load.is_finite() && load > 0.0 { load } else { 0.0 };
    let factor = load * 10.0 + 1.0;
    Duration::try_from_secs_f64(unit.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Admission gate for new guests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub threshold: f64,
    pub time_unit: Duration,
}

impl Admission {
    pub fn new(threshold: f64, time_unit: Duration) -> Self {
        Self { threshold, time_unit }
    }

    /// Whether a node at `load` may take a job
    pub fn admits(&self, load: f64) -> bool {
        load <= self.threshold
    }

    pub fn delay(&self, load: f64) -> Duration {
        admission_delay(load, self.time_unit)
    }
}

impl From<&AdmissionConfig> for Admission {
    fn from(config: &AdmissionConfig) -> Self {
        Self::new(config.load_threshold, config.time_unit())
    }
}

impl Default for Admission {
    fn default() -> Self {
        Self::from(&AdmissionConfig::default())
    }
}
