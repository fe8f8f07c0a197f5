use crate::replica;
use crate::replica::ActorExited;
use std::error::Error;
use std::fmt::Debug;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};

#[cfg(test)]
pub(crate) mod test_utils;

// Design choice: Disk interaction is synchronous inside the event loop, except for snapshot
//                files which are written and downloaded by spawned tasks.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader (active): append, replicate, store callback until applied.
    // Otherwise: redirect or reject.
    CommitMutation(
        replica::CommitMutationInput,
        Callback<replica::MutationResponse, replica::CommitMutationError>,
    ),
    // Leader (active): run against local state without logging.
    ExecuteTransient(
        replica::ExecuteTransientInput,
        Callback<Result<Vec<u8>, crate::automaton::MutationError>, replica::CommitMutationError>,
    ),
    Query(replica::QueryInput, Callback<Vec<u8>, replica::QueryError>),

    RequestVote(
        replica::RequestVoteInput,
        Callback<replica::RequestVoteOutput, replica::RequestVoteError>,
    ),
    RequestVoteReplyFromPeer(replica::RequestVoteReplyFromPeer),

    AppendEntries(
        replica::AppendEntriesInput,
        Callback<replica::AppendEntriesOutput, replica::AppendEntriesError>,
    ),
    InstallSnapshot(
        replica::InstallSnapshotInput,
        Callback<replica::InstallSnapshotOutput, replica::InstallSnapshotError>,
    ),
    ReplicationReplyFromPeer(replica::ReplicationReplyFromPeer),

    HeartbeatTick(replica::HeartbeatTick),
    ElectionTimeout,
    CommitDeadline(replica::CommitDeadline),

    SnapshotBuilt(replica::SnapshotBuilt),
    SnapshotDownloaded(replica::SnapshotDownloaded),

    Diagnose(oneshot::Sender<replica::ReplicaDiagnostics>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Error>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Error> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

/// Strong handle to a replica actor. The event loop exits once every strong handle is dropped, or
/// on `shutdown()`.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: Arc<mpsc::Sender<Event>>,
}

/// Handle held by timers, spawned RPC tasks and the RPC server. Doesn't keep the actor alive.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: Weak<mpsc::Sender<Event>>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);

        (ActorClient { sender: Arc::new(tx) }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: Arc::downgrade(&self.sender),
        }
    }

    pub(crate) async fn commit_mutation(
        &self,
        input: replica::CommitMutationInput,
    ) -> Result<replica::MutationResponse, replica::CommitMutationError> {
        self.call(|callback| Event::CommitMutation(input, callback)).await
    }

    pub(crate) async fn execute_transient(
        &self,
        input: replica::ExecuteTransientInput,
    ) -> Result<Result<Vec<u8>, crate::automaton::MutationError>, replica::CommitMutationError> {
        self.call(|callback| Event::ExecuteTransient(input, callback)).await
    }

    pub(crate) async fn query(&self, input: replica::QueryInput) -> Result<Vec<u8>, replica::QueryError> {
        self.call(|callback| Event::Query(input, callback)).await
    }

    pub(crate) async fn request_vote(
        &self,
        input: replica::RequestVoteInput,
    ) -> Result<replica::RequestVoteOutput, replica::RequestVoteError> {
        self.call(|callback| Event::RequestVote(input, callback)).await
    }

    pub(crate) async fn append_entries(
        &self,
        input: replica::AppendEntriesInput,
    ) -> Result<replica::AppendEntriesOutput, replica::AppendEntriesError> {
        self.call(|callback| Event::AppendEntries(input, callback)).await
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: replica::InstallSnapshotInput,
    ) -> Result<replica::InstallSnapshotOutput, replica::InstallSnapshotError> {
        self.call(|callback| Event::InstallSnapshot(input, callback)).await
    }

    pub(crate) async fn diagnose(&self) -> Result<replica::ReplicaDiagnostics, ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Diagnose(tx)).await?;
        rx.await.map_err(|_| ActorExited)
    }

    /// Stops the replica and waits for the event loop to acknowledge.
    pub(crate) async fn shutdown(&self) -> Result<(), ActorExited> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Shutdown(tx)).await?;
        rx.await.map_err(|_| ActorExited)
    }

    async fn call<O, E, F>(&self, to_event: F) -> Result<O, E>
    where
        O: Debug,
        E: Error + From<ActorExited>,
        F: FnOnce(Callback<O, E>) -> Event,
    {
        let (tx, rx) = oneshot::channel();
        self.send(to_event(Callback(tx))).await?;

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ActorExited.into()),
        }
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        self.sender.send(event).await.map_err(|_| ActorExited)
    }
}

impl WeakActorClient {
    fn upgrade(&self) -> Result<ActorClient, ActorExited> {
        self.sender
            .upgrade()
            .map(|sender| ActorClient { sender })
            .ok_or(ActorExited)
    }

    pub(crate) async fn commit_mutation(
        &self,
        input: replica::CommitMutationInput,
    ) -> Result<replica::MutationResponse, replica::CommitMutationError> {
        self.upgrade()?.commit_mutation(input).await
    }

    pub(crate) async fn execute_transient(
        &self,
        input: replica::ExecuteTransientInput,
    ) -> Result<Result<Vec<u8>, crate::automaton::MutationError>, replica::CommitMutationError> {
        self.upgrade()?.execute_transient(input).await
    }

    pub(crate) async fn query(&self, input: replica::QueryInput) -> Result<Vec<u8>, replica::QueryError> {
        self.upgrade()?.query(input).await
    }

    pub(crate) async fn request_vote(
        &self,
        input: replica::RequestVoteInput,
    ) -> Result<replica::RequestVoteOutput, replica::RequestVoteError> {
        self.upgrade()?.request_vote(input).await
    }

    pub(crate) async fn append_entries(
        &self,
        input: replica::AppendEntriesInput,
    ) -> Result<replica::AppendEntriesOutput, replica::AppendEntriesError> {
        self.upgrade()?.append_entries(input).await
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: replica::InstallSnapshotInput,
    ) -> Result<replica::InstallSnapshotOutput, replica::InstallSnapshotError> {
        self.upgrade()?.install_snapshot(input).await
    }

    // Notifications below are dropped once the actor is gone; nobody is left to care.

    pub(crate) async fn notify_request_vote_reply(&self, reply: replica::RequestVoteReplyFromPeer) {
        self.notify(Event::RequestVoteReplyFromPeer(reply)).await;
    }

    pub(crate) async fn notify_replication_reply(&self, reply: replica::ReplicationReplyFromPeer) {
        self.notify(Event::ReplicationReplyFromPeer(reply)).await;
    }

    pub(crate) async fn heartbeat_tick(&self, tick: replica::HeartbeatTick) {
        self.notify(Event::HeartbeatTick(tick)).await;
    }

    pub(crate) async fn election_timeout(&self) {
        self.notify(Event::ElectionTimeout).await;
    }

    pub(crate) async fn commit_deadline(&self, deadline: replica::CommitDeadline) {
        self.notify(Event::CommitDeadline(deadline)).await;
    }

    pub(crate) async fn notify_snapshot_built(&self, built: replica::SnapshotBuilt) {
        self.notify(Event::SnapshotBuilt(built)).await;
    }

    pub(crate) async fn notify_snapshot_downloaded(&self, downloaded: replica::SnapshotDownloaded) {
        self.notify(Event::SnapshotDownloaded(downloaded)).await;
    }

    async fn notify(&self, event: Event) {
        if let Ok(client) = self.upgrade() {
            let _ = client.send(event).await;
        }
    }
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L, S>
where
    L: crate::commitlog::Log<replica::MutationRecord>,
    S: replica::PersistentLocalState,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica<L, S>,
}

impl<L, S> ReplicaActor<L, S>
where
    L: crate::commitlog::Log<replica::MutationRecord> + Send + 'static,
    S: replica::PersistentLocalState,
{
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: replica::Replica<L, S>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            if let Some(shutdown_ack) = self.handle_event(event) {
                self.replica.shutdown();
                let _ = shutdown_ack.send(());
                break;
            }
        }

        if !self.replica.is_stopped() {
            self.replica.shutdown();
        }
        slog::info!(self.logger, "Replica event loop exited");
    }

    // This must NOT be async. Any long running work must be spawned on another task and come back
    // as an event to this actor. Returns the acknowledgement channel of a shutdown request.
    fn handle_event(&mut self, event: Event) -> Option<oneshot::Sender<()>> {
        match event {
            Event::CommitMutation(input, callback) => {
                // Callback completes once the mutation is applied.
                self.replica.handle_commit_mutation(input, callback);
            }
            Event::ExecuteTransient(input, callback) => {
                let result = self.replica.handle_execute_transient(input);
                callback.send(result);
            }
            Event::Query(input, callback) => {
                let result = self.replica.handle_query(input);
                callback.send(result);
            }
            Event::RequestVote(input, callback) => {
                let result = self.replica.server_handle_request_vote(input);
                callback.send(result);
            }
            Event::RequestVoteReplyFromPeer(reply) => {
                self.replica.handle_request_vote_reply_from_peer(reply);
            }
            Event::AppendEntries(input, callback) => {
                let result = self.replica.server_handle_append_entries(input);
                callback.send(result);
            }
            Event::InstallSnapshot(input, callback) => {
                let result = self.replica.server_handle_install_snapshot(input);
                callback.send(result);
            }
            Event::ReplicationReplyFromPeer(reply) => {
                self.replica.handle_replication_reply_from_peer(reply);
            }
            Event::HeartbeatTick(tick) => {
                self.replica.handle_heartbeat_tick(tick);
            }
            Event::ElectionTimeout => {
                self.replica.handle_election_timeout();
            }
            Event::CommitDeadline(deadline) => {
                self.replica.handle_commit_deadline(deadline);
            }
            Event::SnapshotBuilt(built) => {
                self.replica.handle_snapshot_built(built);
            }
            Event::SnapshotDownloaded(downloaded) => {
                self.replica.handle_snapshot_downloaded(downloaded);
            }
            Event::Diagnose(reply) => {
                let _ = reply.send(self.replica.diagnose());
            }
            Event::Shutdown(ack) => return Some(ack),
        }

        None
    }
}
