//! CPU affinity masks

use serde::{Deserialize, Serialize};

/// A set of application-visible CPUs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSet(Vec<u8>);

impl CpuSet {
    /// A set containing CPUs `[0, cores)`
    pub fn full(cores: u32) -> Self {
        let cores = cores as usize;
        let mut bytes = vec![0xffu8; cores.div_ceil(8)];
        if cores % 8 != 0 {
            if let Some(last) = bytes.last_mut() {
                *last = (1u8 << (cores % 8)) - 1;
            }
        }
        Self(bytes)
    }

    pub fn contains(&self, cpu: u32) -> bool {
        let cpu = cpu as usize;
        self.0
            .get(cpu / 8)
            .is_some_and(|byte| byte & (1 << (cpu % 8)) != 0)
    }

    pub fn num_cpus(&self) -> u32 {
        self.0.iter().map(|b| b.count_ones()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_set() {
        let set = CpuSet::full(10);
        assert_eq!(set.num_cpus(), 10);
        assert!(set.contains(9));
        assert!(!set.contains(10));
        assert_eq!(CpuSet::full(16).num_cpus(), 16);
    }
}
