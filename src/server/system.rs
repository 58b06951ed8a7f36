//! Host resource sampling for the server heartbeat.

use std::sync::Mutex;
use sysinfo::{Pid, System};

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ResourceSample {
    pub free_memory_bytes: u64,
    pub system_cpu_load: f64,
    pub process_cpu_load: f64,
}

pub(crate) struct SystemResourceSampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemResourceSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_all()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    pub fn sample(&self) -> ResourceSample {
        let mut system = self.system.lock().unwrap();
        system.refresh_all();
        let process_cpu_load = self
            .pid
            .and_then(|pid| system.process(pid))
            .map(|p| f64::from(p.cpu_usage()) / 100.0)
            .unwrap_or(0.0);
        ResourceSample {
            free_memory_bytes: system.available_memory(),
            system_cpu_load: f64::from(system.global_cpu_usage()) / 100.0,
            process_cpu_load,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_returns_plausible_values() {
        let sampler = SystemResourceSampler::new();
        let sample = sampler.sample();
        assert!(sample.system_cpu_load >= 0.0);
        assert!(sample.process_cpu_load >= 0.0);
    }
}
