use std::{
    fmt,
    ops::{Add, Sub},
};

use serde::{Deserialize, Serialize};

/// A set of resources, either advertised by a worker or requested by a task.
/// Memory and disk are measured in megabytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cores: u32,
    pub memory: u64,
    pub disk: u64,
}

impl Resources {
    pub const fn new(cores: u32, memory: u64, disk: u64) -> Self {
        Self {
            cores,
            memory,
            disk,
        }
    }

    /// Return true if this request can be satisfied from `available`.
    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cores <= available.cores
            && self.memory <= available.memory
            && self.disk <= available.disk
    }

    pub fn is_zero(&self) -> bool {
        self.cores == 0 && self.memory == 0 && self.disk == 0
    }

    /// Detect the resources of the current host. `workdir` picks the disk whose free
    /// space is reported.
    #[cfg(feature = "stats")]
    pub fn detect(workdir: &std::path::Path) -> Resources {
        use sysinfo::{Disks, MemoryRefreshKind, System};

        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        let mut system = System::new();
        system.refresh_memory_specifics(MemoryRefreshKind::new().with_ram());
        let memory = system.total_memory() / (1024 * 1024);

        let workdir = workdir
            .canonicalize()
            .unwrap_or_else(|_| workdir.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        let disk = disks
            .iter()
            .filter(|d| workdir.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space() / (1024 * 1024))
            .unwrap_or(0);

        Resources::new(cores, memory, disk)
    }

    #[cfg(not(feature = "stats"))]
    pub fn detect(_workdir: &std::path::Path) -> Resources {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Resources::new(cores, 0, 0)
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            cores: self.cores.saturating_add(rhs.cores),
            memory: self.memory.saturating_add(rhs.memory),
            disk: self.disk.saturating_add(rhs.disk),
        }
    }
}

impl Sub for Resources {
    type Output = Resources;

    /// Saturating subtraction, so releasing more than was committed clamps at zero.
    fn sub(self, rhs: Resources) -> Resources {
        Resources {
            cores: self.cores.saturating_sub(rhs.cores),
            memory: self.memory.saturating_sub(rhs.memory),
            disk: self.disk.saturating_sub(rhs.disk),
        }
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cores={} memory={}MB disk={}MB",
            self.cores, self.memory, self.disk
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_within_checks_every_dimension() {
        let available = Resources::new(4, 1024, 100);
        assert!(Resources::new(4, 1024, 100).fits_within(&available));
        assert!(Resources::new(1, 0, 0).fits_within(&available));
        assert!(!Resources::new(5, 0, 0).fits_within(&available));
        assert!(!Resources::new(1, 2048, 0).fits_within(&available));
        assert!(!Resources::new(1, 0, 101).fits_within(&available));
    }

    #[test]
    fn subtraction_saturates() {
        let free = Resources::new(2, 100, 10) - Resources::new(3, 50, 20);
        assert_eq!(free, Resources::new(0, 50, 0));
    }

    #[test]
    fn detect_reports_at_least_one_core() {
        let dir = tempfile::tempdir().expect("creating temp dir");
        assert!(Resources::detect(dir.path()).cores >= 1);
    }
}
