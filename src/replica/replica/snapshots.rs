use super::{Replica, SnapshotThreshold};
use crate::commitlog::{Index, Log};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::mutation_log::MutationRecord;
use crate::replica::replica_api::{SnapshotBuilt, SnapshotDownloaded};
use crate::snapshot::{Snapshot, SnapshotDownloader, SnapshotPeer};
use std::io;
use std::sync::Arc;

impl<L, S> Replica<L, S>
where
    L: Log<MutationRecord> + 'static,
    S: PersistentLocalState,
{
    /// Snapshot points are multiples of the threshold, so every replica snapshots the same
    /// sequence numbers unless it is still busy writing the previous one.
    pub(super) fn maybe_build_snapshot(&mut self, applied_index: Index, applied_term: Term) {
        let threshold = match self.options.snapshot_threshold {
            SnapshotThreshold::Off => return,
            SnapshotThreshold::Mutations(n) => n,
        };
        if threshold == 0 || applied_index.as_u64() % threshold != 0 {
            return;
        }
        if let Some(in_progress) = self.snapshot_in_progress {
            slog::warn!(
                self.logger,
                "Skipping snapshot, previous one still being written";
                "SnapshotId" => ?applied_index,
                "InProgress" => ?in_progress
            );
            return;
        }

        self.build_snapshot(applied_index, applied_term);
    }

    /// Serializes the automaton here, then writes the file on a blocking task.
    fn build_snapshot(&mut self, snapshot_id: Index, term: Term) {
        let state = self.automaton.save_snapshot();
        let snapshot = Snapshot::new(
            snapshot_id,
            term.as_u64(),
            self.my_replica_id.as_str().to_string(),
            state,
        );
        slog::info!(self.logger, "Building snapshot"; "SnapshotId" => ?snapshot_id, "Bytes" => snapshot.state.len());
        self.snapshot_in_progress = Some(snapshot_id);

        let store = self.snapshot_store.clone();
        let snapshots_to_keep = self.options.snapshots_to_keep;
        let actor_client = self.actor_client.clone();
        tokio::task::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                store.write(&snapshot)?;
                store.remove_older_than(snapshots_to_keep)
            })
            .await
            .unwrap_or_else(|join_error| Err(io::Error::new(io::ErrorKind::Other, join_error)));

            actor_client
                .notify_snapshot_built(SnapshotBuilt {
                    snapshot_id,
                    term,
                    result,
                })
                .await;
        });
    }

    pub(crate) fn handle_snapshot_built(&mut self, built: SnapshotBuilt) {
        if self.snapshot_in_progress == Some(built.snapshot_id) {
            self.snapshot_in_progress = None;
        }

        let logger = self
            .logger
            .new(slog::o!("SnapshotId" => format!("{:?}", built.snapshot_id)));
        match built.result {
            Ok(removed) => {
                slog::info!(logger, "Snapshot written"; "Removed" => ?removed);
                if let Err(e) = self.mutation_log.compact_through(built.term, built.snapshot_id) {
                    slog::warn!(logger, "Failed to compact log behind snapshot: {:?}", e);
                }
            }
            Err(e) => slog::error!(logger, "Failed to write snapshot: {:?}", e),
        }
    }

    /// Downloads a snapshot of at least `required` from whichever peers have one. The result
    /// comes back as a [`SnapshotDownloaded`] event.
    pub(super) fn start_snapshot_download(&mut self, required: Index) {
        let peers: Vec<Arc<dyn SnapshotPeer>> = self
            .cluster_tracker
            .iter_peers()
            .map(|peer| Arc::new(peer.client.clone()) as Arc<dyn SnapshotPeer>)
            .collect();
        let logger = self
            .logger
            .new(slog::o!("Required" => format!("{:?}", required)));
        let mut downloader = SnapshotDownloader::new(
            logger,
            self.snapshot_store.clone(),
            peers,
            self.options.snapshot_download.clone(),
        );
        self.downloading_snapshot = Some(required);

        let actor_client = self.actor_client.clone();
        tokio::task::spawn(async move {
            let result = downloader.download(required).await;
            actor_client
                .notify_snapshot_downloaded(SnapshotDownloaded { result })
                .await;
        });
    }

    pub(crate) fn handle_snapshot_downloaded(&mut self, downloaded: SnapshotDownloaded) {
        self.downloading_snapshot = None;

        match downloaded.result {
            Ok(snapshot_id) => self.install_downloaded_snapshot(snapshot_id),
            // The leader asks again on its next heartbeat.
            Err(e) => slog::warn!(self.logger, "Snapshot download failed: {}", e),
        }
        self.update_follower_recovery();
    }

    fn install_downloaded_snapshot(&mut self, snapshot_id: Index) {
        let logger = self
            .logger
            .new(slog::o!("SnapshotId" => format!("{:?}", snapshot_id)));
        if matches!(self.mutation_log.last_applied_index(), Some(applied) if applied >= snapshot_id) {
            slog::info!(logger, "Already applied past downloaded snapshot");
            return;
        }

        let snapshot = match self.snapshot_store.read_state(snapshot_id) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                slog::warn!(logger, "Downloaded snapshot was removed before it could be installed");
                return;
            }
            Err(e) => {
                slog::error!(logger, "Failed to read downloaded snapshot: {:?}", e);
                return;
            }
        };

        // The automaton is cleared before loading; a failure leaves it unusable.
        if let Err(e) = self.automaton.load_snapshot(&snapshot.state) {
            self.abort_on_apply_failure(snapshot_id, "<snapshot>", &e.to_string());
        }
        let term = Term::new(snapshot.meta.last_included_term);
        if let Err(e) = self.mutation_log.install_snapshot(term, snapshot_id) {
            self.abort_on_apply_failure(snapshot_id, "<snapshot>", &e.to_string());
        }
        slog::info!(logger, "Installed snapshot from peer"; "Builder" => &snapshot.meta.builder);

        self.apply_committed_mutations();
    }
}
