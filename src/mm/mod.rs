//! Memory management: host frame pool and second-stage translation

pub mod allocator;
pub mod host;
pub mod stage2;

pub use allocator::{PAGE_SHIFT, PAGE_SIZE};
pub use host::{HostAspace, HostMemFlags, HostRamPool};
pub use stage2::{best_page_size, MapFlags, Stage2Table, VmidPool};
