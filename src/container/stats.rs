// src/container/stats.rs

use std::sync::Mutex;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Samples RSS and CPU usage of running processes.
///
/// CPU usage is computed by sysinfo as the delta since the previous refresh,
/// so the first sample for a pid reports 0%.
#[derive(Debug)]
pub struct StatsSampler {
    sys: Mutex<System>,
}

impl Default for StatsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSampler {
    pub fn new() -> Self {
        Self {
            sys: Mutex::new(System::new()),
        }
    }

    /// `(rss_bytes, cpu_percent)` for `pid`, or `None` if it has exited.
    pub fn sample(&self, pid: u32) -> Option<(u64, f32)> {
        let mut sys = self.sys.lock().unwrap_or_else(|p| p.into_inner());
        let pid = Pid::from_u32(pid);
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory().with_cpu(),
        );
        sys.process(pid).map(|p| (p.memory(), p.cpu_usage()))
    }
}
