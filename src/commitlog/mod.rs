mod in_memory;
mod log;
mod storage;

pub use in_memory::InMemoryLog;
pub use log::Entry;
pub use log::Index;
pub use log::Log;
pub use storage::SegmentedDiskLog;
pub use storage::StorageConfig;
