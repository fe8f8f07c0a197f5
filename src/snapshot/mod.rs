mod backoff;
mod download;
mod file_store;
mod format;
mod in_memory;
mod store;

pub use backoff::BackoffOptions;
pub use download::DownloadOptions;
pub use download::SnapshotDownloader;
pub use download::SnapshotPeer;
pub use download::SnapshotPeerError;
pub use file_store::FileSnapshotStore;
pub use in_memory::InMemorySnapshotStore;
pub use store::Snapshot;
pub use store::SnapshotBlock;
pub use store::SnapshotError;
pub use store::SnapshotMeta;
pub use store::SnapshotStore;
