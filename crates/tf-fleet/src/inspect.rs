//! Resource inspection for worker processes and the host
//!
//! Wraps sysinfo behind a trait so the health monitor and scaling policy
//! can be tested with canned samples. The sysinfo `System` is kept alive
//! across refreshes; cpu_usage needs two samples to produce a real number.

use sysinfo::{Pid, ProcessesToUpdate, System};

/// CPU and memory usage of a single worker process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessSample {
    pub cpu_percent: f32,
    pub mem_percent: f32,
    pub alive: bool,
}

impl ProcessSample {
    pub fn dead() -> Self {
        Self {
            cpu_percent: 0.0,
            mem_percent: 0.0,
            alive: false,
        }
    }
}

/// Host-wide CPU and memory usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostSample {
    pub cpu_percent: f32,
    pub mem_percent: f32,
}

pub trait ResourceInspector: Send + Sync {
    /// Sample one process by pid. Returns a dead sample when the process
    /// no longer exists.
    fn sample_process(&mut self, pid: u32) -> ProcessSample;

    /// Sample host-wide usage.
    fn sample_host(&mut self) -> HostSample;
}

pub struct SysinfoInspector {
    system: System,
}

impl SysinfoInspector {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceInspector for SysinfoInspector {
    fn sample_process(&mut self, pid: u32) -> ProcessSample {
        let pid = Pid::from_u32(pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        match self.system.process(pid) {
            Some(proc) => {
                let total = self.system.total_memory();
                let mem_percent = if total > 0 {
                    (proc.memory() as f32 / total as f32) * 100.0
                } else {
                    0.0
                };
                ProcessSample {
                    cpu_percent: proc.cpu_usage(),
                    mem_percent,
                    alive: true,
                }
            }
            None => ProcessSample::dead(),
        }
    }

    fn sample_host(&mut self) -> HostSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let mem_percent = if total > 0 {
            (self.system.used_memory() as f32 / total as f32) * 100.0
        } else {
            0.0
        };
        HostSample {
            cpu_percent: self.system.global_cpu_usage(),
            mem_percent,
        }
    }
}
