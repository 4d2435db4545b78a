//! Host CPU numbering and CPU masks.

use core::fmt;

/// Upper bound on host CPUs; one bit each in a `CpuMask`
pub const MAX_CPUS: usize = 64;

/// Set of host CPUs
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CpuMask(pub u64);

impl CpuMask {
    pub const NONE: CpuMask = CpuMask(0);

    /// Every CPU below `nr_cpus`
    pub fn all(nr_cpus: usize) -> Self {
        if nr_cpus >= MAX_CPUS {
            CpuMask(u64::MAX)
        } else {
            CpuMask((1u64 << nr_cpus) - 1)
        }
    }

    pub const fn single(cpu: usize) -> Self {
        CpuMask(1u64 << cpu)
    }

    pub fn contains(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0 & (1u64 << cpu) != 0
    }

    pub fn set(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.0 |= 1u64 << cpu;
        }
    }

    pub fn clear(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.0 &= !(1u64 << cpu);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn first(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    pub fn and(&self, other: CpuMask) -> CpuMask {
        CpuMask(self.0 & other.0)
    }

    pub fn weight(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..MAX_CPUS).filter(move |cpu| bits & (1u64 << cpu) != 0)
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuMask({:#x})", self.0)
    }
}
