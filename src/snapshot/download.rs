use crate::clock::{Clock, RealClock};
use crate::commitlog::Index;
use crate::snapshot::backoff::{BackoffOptions, BackoffStrategy};
use crate::snapshot::store::{SnapshotBlock, SnapshotError, SnapshotStore};
use std::io;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotPeerError {
    #[error("Snapshot RPC failed: {0}")]
    Rpc(String),
    #[error("Snapshot RPC timed out")]
    Timeout,
    #[error("Peer no longer has the snapshot")]
    NoSuchSnapshot,
}

/// A peer that serves its snapshot store.
#[async_trait::async_trait]
pub trait SnapshotPeer: Send + Sync {
    fn peer_id(&self) -> &str;

    async fn latest_snapshot_id(
        &self,
        max_snapshot_id: Option<Index>,
    ) -> Result<Option<Index>, SnapshotPeerError>;

    async fn read_snapshot(
        &self,
        snapshot_id: Index,
        offset: u64,
        length: u64,
    ) -> Result<Option<SnapshotBlock>, SnapshotPeerError>;
}

#[derive(Clone, Debug)]
pub struct DownloadOptions {
    pub block_size: u64,
    pub rpc_timeout: Duration,
    pub backoff: BackoffOptions,
}

/// Fetches snapshots from peers into the local store.
pub struct SnapshotDownloader<C: Clock = RealClock> {
    logger: slog::Logger,
    store: Arc<dyn SnapshotStore>,
    peers: Vec<Arc<dyn SnapshotPeer>>,
    options: DownloadOptions,
    clock: C,
}

impl SnapshotDownloader {
    pub fn new(
        logger: slog::Logger,
        store: Arc<dyn SnapshotStore>,
        peers: Vec<Arc<dyn SnapshotPeer>>,
        options: DownloadOptions,
    ) -> Self {
        SnapshotDownloader::with_clock(logger, store, peers, options, RealClock)
    }
}

impl<C: Clock> SnapshotDownloader<C> {
    pub fn with_clock(
        logger: slog::Logger,
        store: Arc<dyn SnapshotStore>,
        peers: Vec<Arc<dyn SnapshotPeer>>,
        options: DownloadOptions,
        clock: C,
    ) -> Self {
        SnapshotDownloader {
            logger,
            store,
            peers,
            options,
            clock,
        }
    }

    /// Makes a snapshot with id `required` or newer available in the local store and returns its
    /// id. Peers are tried from the newest reported snapshot down; each peer gets retries with
    /// backoff before the next one is tried.
    pub async fn download(&mut self, required: Index) -> Result<Index, SnapshotError> {
        if let Some(local) = self.store.latest_snapshot_id(None)? {
            if local >= required {
                return Ok(local);
            }
        }

        let candidates = self.discover(required).await;
        slog::info!(
            self.logger,
            "Will download snapshot from peers";
            "Required" => ?required,
            "Candidates" => candidates.len()
        );

        for (snapshot_id, peer) in candidates {
            let logger = self.logger.new(slog::o!(
                "SnapshotId" => format!("{:?}", snapshot_id),
                "Peer" => peer.peer_id().to_string()
            ));

            let bytes = match self.fetch(&logger, peer.as_ref(), snapshot_id).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    slog::warn!(logger, "Snapshot download from peer failed: {}", e);
                    continue;
                }
            };

            let store = self.store.clone();
            let write_result =
                tokio::task::spawn_blocking(move || store.write_raw(snapshot_id, bytes))
                    .await
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            match write_result {
                Ok(()) => {
                    slog::info!(logger, "Snapshot downloaded successfully");
                    return Ok(snapshot_id);
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    slog::warn!(logger, "Downloaded snapshot failed verification: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(SnapshotError::Unavailable { required })
    }

    /// Asks every peer for its latest snapshot and returns the usable ones, newest first.
    async fn discover(&self, required: Index) -> Vec<(Index, Arc<dyn SnapshotPeer>)> {
        let rpc_timeout = self.options.rpc_timeout;
        let lookups: Vec<_> = self
            .peers
            .iter()
            .cloned()
            .map(|peer| {
                tokio::spawn(async move {
                    let result = tokio::time::timeout(rpc_timeout, peer.latest_snapshot_id(None))
                        .await
                        .unwrap_or(Err(SnapshotPeerError::Timeout));
                    (peer, result)
                })
            })
            .collect();

        let mut candidates = Vec::new();
        for lookup in lookups {
            match lookup.await {
                Ok((peer, Ok(Some(snapshot_id)))) if snapshot_id >= required => {
                    candidates.push((snapshot_id, peer));
                }
                Ok((peer, Ok(reported))) => {
                    slog::debug!(
                        self.logger,
                        "Peer has no suitable snapshot";
                        "Peer" => peer.peer_id().to_string(),
                        "Reported" => ?reported
                    );
                }
                Ok((peer, Err(e))) => {
                    slog::warn!(
                        self.logger,
                        "Snapshot discovery failed: {}", e;
                        "Peer" => peer.peer_id().to_string()
                    );
                }
                Err(e) => {
                    slog::warn!(self.logger, "Snapshot discovery task failed: {}", e);
                }
            }
        }

        // Stable sort keeps cluster order between peers with the same snapshot.
        candidates.sort_by(|a, b| b.0.cmp(&a.0));
        candidates
    }

    async fn fetch(
        &mut self,
        logger: &slog::Logger,
        peer: &dyn SnapshotPeer,
        snapshot_id: Index,
    ) -> Result<Vec<u8>, SnapshotPeerError> {
        let mut bytes: Vec<u8> = Vec::new();
        let mut backoff = BackoffStrategy::new(self.options.backoff.clone());

        loop {
            let offset = bytes.len() as u64;
            let read = peer.read_snapshot(snapshot_id, offset, self.options.block_size);
            let result = tokio::time::timeout(self.options.rpc_timeout, read)
                .await
                .unwrap_or(Err(SnapshotPeerError::Timeout));

            match result {
                Ok(Some(block)) => {
                    backoff.restart();
                    if block.data.is_empty() && offset < block.total_length {
                        return Err(SnapshotPeerError::Rpc(format!(
                            "empty block at offset {} of {}",
                            offset, block.total_length
                        )));
                    }

                    bytes.extend_from_slice(&block.data);
                    slog::debug!(
                        logger,
                        "Snapshot block received";
                        "Offset" => offset,
                        "Size" => block.data.len()
                    );
                    if bytes.len() as u64 >= block.total_length {
                        return Ok(bytes);
                    }
                }
                Ok(None) => return Err(SnapshotPeerError::NoSuchSnapshot),
                Err(e) => {
                    if !backoff.next() {
                        return Err(e);
                    }
                    slog::debug!(
                        logger,
                        "Retrying snapshot block read: {}", e;
                        "Attempt" => backoff.invocation_index()
                    );
                    self.clock.sleep(backoff.backoff()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{InMemorySnapshotStore, Snapshot};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakePeer {
        id: String,
        store: InMemorySnapshotStore,
        failures_left: AtomicU32,
        reads: AtomicU32,
    }

    impl FakePeer {
        fn new(id: &str, snapshot_ids: &[u64], failures: u32) -> Arc<Self> {
            let store = InMemorySnapshotStore::new();
            for snapshot_id in snapshot_ids {
                store
                    .write(&Snapshot::new(
                        Index::new(*snapshot_id),
                        1,
                        id.to_string(),
                        vec![*snapshot_id as u8; 100],
                    ))
                    .unwrap();
            }
            Arc::new(FakePeer {
                id: id.to_string(),
                store,
                failures_left: AtomicU32::new(failures),
                reads: AtomicU32::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl SnapshotPeer for FakePeer {
        fn peer_id(&self) -> &str {
            &self.id
        }

        async fn latest_snapshot_id(
            &self,
            max_snapshot_id: Option<Index>,
        ) -> Result<Option<Index>, SnapshotPeerError> {
            Ok(self.store.latest_snapshot_id(max_snapshot_id).unwrap())
        }

        async fn read_snapshot(
            &self,
            snapshot_id: Index,
            offset: u64,
            length: u64,
        ) -> Result<Option<SnapshotBlock>, SnapshotPeerError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(SnapshotPeerError::Rpc("injected".into()));
            }
            Ok(self.store.read_block(snapshot_id, offset, length).unwrap())
        }
    }

    fn options() -> DownloadOptions {
        DownloadOptions {
            block_size: 32,
            rpc_timeout: Duration::from_secs(1),
            backoff: BackoffOptions {
                invocation_count: 3,
                min_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                multiplier: 2.0,
                jitter: 0.0,
            },
        }
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn downloader(
        store: Arc<InMemorySnapshotStore>,
        peers: Vec<Arc<FakePeer>>,
    ) -> SnapshotDownloader {
        let peers = peers
            .into_iter()
            .map(|p| p as Arc<dyn SnapshotPeer>)
            .collect();
        SnapshotDownloader::new(logger(), store, peers, options())
    }

    #[tokio::test]
    async fn downloads_newest_snapshot_in_blocks() {
        let local = Arc::new(InMemorySnapshotStore::new());
        let old = FakePeer::new("old", &[4], 0);
        let new = FakePeer::new("new", &[4, 9], 0);

        let mut downloader = downloader(local.clone(), vec![old.clone(), new.clone()]);
        let id = downloader.download(Index::new(3)).await.unwrap();

        assert_eq!(id, Index::new(9));
        assert_eq!(old.reads.load(Ordering::SeqCst), 0);
        assert!(new.reads.load(Ordering::SeqCst) > 1);
        let snapshot = local.read_state(Index::new(9)).unwrap().unwrap();
        assert_eq!(snapshot.state, vec![9u8; 100]);
        assert_eq!(snapshot.meta.builder, "new");
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let local = Arc::new(InMemorySnapshotStore::new());
        let flaky = FakePeer::new("flaky", &[5], 2);

        let mut downloader = downloader(local.clone(), vec![flaky]);
        assert_eq!(downloader.download(Index::new(5)).await.unwrap(), Index::new(5));
        assert!(local.contains(Index::new(5)).unwrap());
    }

    #[tokio::test]
    async fn falls_back_to_next_peer() {
        let local = Arc::new(InMemorySnapshotStore::new());
        let broken = FakePeer::new("broken", &[5], 100);
        let healthy = FakePeer::new("healthy", &[5], 0);

        let mut downloader = downloader(local.clone(), vec![broken.clone(), healthy]);
        assert_eq!(downloader.download(Index::new(5)).await.unwrap(), Index::new(5));
        // invocation_count bounds the attempts against the broken peer.
        assert_eq!(broken.reads.load(Ordering::SeqCst), 3);
        assert_eq!(
            local.read_state(Index::new(5)).unwrap().unwrap().meta.builder,
            "healthy"
        );
    }

    #[tokio::test]
    async fn unavailable_when_peers_are_behind() {
        let local = Arc::new(InMemorySnapshotStore::new());
        let behind = FakePeer::new("behind", &[2], 0);

        let mut downloader = downloader(local, vec![behind]);
        match downloader.download(Index::new(6)).await {
            Err(SnapshotError::Unavailable { required }) => assert_eq!(required, Index::new(6)),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn local_snapshot_short_circuits() {
        let local = Arc::new(InMemorySnapshotStore::new());
        local
            .write(&Snapshot::new(Index::new(8), 1, "me".into(), vec![]))
            .unwrap();
        let peer = FakePeer::new("peer", &[9], 0);

        let mut downloader = downloader(local, vec![peer.clone()]);
        assert_eq!(downloader.download(Index::new(7)).await.unwrap(), Index::new(8));
        assert_eq!(peer.reads.load(Ordering::SeqCst), 0);
    }
}
