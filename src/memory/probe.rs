use std::sync::Mutex;
use sysinfo::{Pid, System};

/// OS memory introspection, in bytes.
pub trait MemoryProbe: Send + Sync {
    fn total_physical_memory(&self) -> u64;
    fn current_resident_memory(&self) -> u64;
}

/// Reads this process's resident set size through `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot resolve current pid, resident memory will read as 0");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }

    fn with_system<T>(&self, f: impl FnOnce(&mut System) -> T) -> T {
        let mut system = match self.system.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut system)
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn total_physical_memory(&self) -> u64 {
        self.with_system(|system| {
            system.refresh_memory();
            system.total_memory()
        })
    }

    fn current_resident_memory(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        self.with_system(|system| {
            if !system.refresh_process(pid) {
                return 0;
            }
            system.process(pid).map(|p| p.memory()).unwrap_or(0)
        })
    }
}
