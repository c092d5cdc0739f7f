//! Room actor: an isolated Tokio task that owns one session.
//!
//! Every operation on a session is a command on the actor's channel, so
//! operations on one room are applied strictly one at a time while
//! different rooms run in parallel. Store I/O never runs inside the
//! command loop: loads re-enter the loop as a follow-up command, and
//! saves go through a per-room checkpoint writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tavern_protocol::{
    Action, RequestId, RollContext, RoomId, ServerEvent, SetRef, Snapshot, Token, UserId,
};
use tavern_transport::ConnectionId;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::session::{Caller, Outbound, Recipient, Session};
use crate::store::{SnapshotStore, StoreError};
use crate::{RoomError, TurnPhase};

/// Channel a connection handler drains to push events to its client.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// A room-scoped operation, already decoded and stripped of its room id.
#[derive(Debug, Clone)]
pub enum RoomRequest {
    /// Re-send `session-ready` to the caller.
    ConfirmReady,
    Join {
        display_name: String,
    },
    SubmitTurn {
        user_id: UserId,
        display_name: String,
        actions: Vec<Action>,
    },
    StartTurn {
        snapshot: Snapshot,
    },
    EndTurn,
    RequestAccess {
        user_id: UserId,
        display_name: String,
        token: Token,
    },
    GrantAccess(RequestId),
    DeclineAccess(RequestId),
    ListAccessRequests,
    ApproveAction {
        action: Action,
        user_id: UserId,
        message: String,
    },
    RequestRoll(RollContext),
    CancelRoll(RollContext),
    SubmitRoll {
        value: u8,
        display_name: String,
        action_index: usize,
    },
    Log(String),
    RelayAction(Action),
}

/// Commands sent to a room actor through its channel.
pub(crate) enum RoomCommand {
    /// Apply one operation on behalf of a connection.
    Dispatch {
        caller: Caller,
        outbox: Outbox,
        request: RoomRequest,
        reply: oneshot::Sender<Result<(), RoomError>>,
    },

    /// A store load started by a join has finished.
    SnapshotLoaded {
        caller: Caller,
        outbox: Outbox,
        result: Result<Option<Snapshot>, StoreError>,
    },

    /// The connection is gone; drop its memberships. `at` is when the
    /// handle was told, so the idle clock doesn't depend on queue depth.
    Disconnect { connection: ConnectionId, at: Instant },

    GetInfo { reply: oneshot::Sender<RoomInfo> },

    /// Stop if the room has been empty for `timeout`, checked and acted on
    /// as one step so no join can slip in between. Replies whether it
    /// stopped.
    ShutdownIfIdle {
        timeout: Duration,
        reply: oneshot::Sender<bool>,
    },

    Shutdown,
}

/// Room metadata, as seen by the registry and operators.
#[derive(Debug, Clone)]
pub struct RoomInfo {
    pub room_id: RoomId,
    pub name: String,
    pub host: UserId,
    pub phase: TurnPhase,
    /// Connections currently joined.
    pub member_count: usize,
    pub pending_access_requests: usize,
    pub queued_submissions: usize,
    /// When the last member left, if the room is empty.
    pub idle_since: Option<Instant>,
}

impl RoomInfo {
    /// Whether the room has had no members for at least `timeout`.
    pub fn is_idle_for(&self, timeout: Duration) -> bool {
        self.idle_since
            .is_some_and(|since| since.elapsed() >= timeout)
    }
}

/// Handle to a running room actor.
///
/// Cheap to clone: it's an `mpsc::Sender` and the room id. The registry
/// holds one per room and hands out clones.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    room_id: RoomId,
    sender: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// Applies `request` as `caller` and waits for the verdict.
    ///
    /// Events produced by the operation are already queued on the
    /// recipients' outboxes when this returns `Ok`.
    pub async fn dispatch(
        &self,
        caller: Caller,
        outbox: Outbox,
        request: RoomRequest,
    ) -> Result<(), RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::Dispatch {
                caller,
                outbox,
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())?
    }

    /// Tells the room a connection closed (fire-and-forget).
    pub async fn disconnect(&self, connection: ConnectionId) -> Result<(), RoomError> {
        let at = Instant::now();
        self.sender
            .send(RoomCommand::Disconnect { connection, at })
            .await
            .map_err(|_| self.unavailable())
    }

    pub async fn get_info(&self) -> Result<RoomInfo, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::GetInfo { reply: reply_tx })
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())
    }

    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.sender
            .send(RoomCommand::Shutdown)
            .await
            .map_err(|_| self.unavailable())
    }

    /// Shuts the room down if it has had no members for `timeout`.
    /// Returns `Ok(true)` if it stopped.
    pub async fn shutdown_if_idle(&self, timeout: Duration) -> Result<bool, RoomError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender
            .send(RoomCommand::ShutdownIfIdle {
                timeout,
                reply: reply_tx,
            })
            .await
            .map_err(|_| self.unavailable())?;
        reply_rx.await.map_err(|_| self.unavailable())
    }

    /// Whether both handles point at the same actor. A room id can be
    /// reused once the old room is gone, so ids alone can't tell.
    pub fn same_room(&self, other: &RoomHandle) -> bool {
        self.sender.same_channel(&other.sender)
    }

    fn unavailable(&self) -> RoomError {
        RoomError::Unavailable(self.room_id.clone())
    }
}

struct RoomActor<S: SnapshotStore> {
    session: Session,
    /// Outboxes of every connection that joined, keyed by connection.
    outboxes: HashMap<ConnectionId, Outbox>,
    store: Arc<S>,
    /// Latest snapshot to persist. `None` when the store is disabled.
    checkpoints: Option<watch::Sender<Option<Snapshot>>>,
    /// Lets store tasks re-enter the loop without keeping the room alive.
    commands: mpsc::WeakSender<RoomCommand>,
    receiver: mpsc::Receiver<RoomCommand>,
    idle_since: Option<Instant>,
}

impl<S: SnapshotStore> RoomActor<S> {
    async fn run(mut self) {
        tracing::info!(room_id = %self.session.id(), "room actor started");

        while let Some(cmd) = self.receiver.recv().await {
            match cmd {
                RoomCommand::Dispatch {
                    caller,
                    outbox,
                    request,
                    reply,
                } => {
                    let result = self.handle_dispatch(&caller, &outbox, request);
                    let _ = reply.send(result);
                }
                RoomCommand::SnapshotLoaded {
                    caller,
                    outbox,
                    result,
                } => {
                    self.handle_snapshot_loaded(&caller, &outbox, result);
                }
                RoomCommand::Disconnect { connection, at } => {
                    self.handle_disconnect(connection, at);
                }
                RoomCommand::GetInfo { reply } => {
                    let _ = reply.send(self.info());
                }
                RoomCommand::ShutdownIfIdle { timeout, reply } => {
                    let idle = self.info().is_idle_for(timeout);
                    let _ = reply.send(idle);
                    if idle {
                        tracing::info!(room_id = %self.session.id(), "room idle, shutting down");
                        break;
                    }
                }
                RoomCommand::Shutdown => {
                    tracing::info!(room_id = %self.session.id(), "room shutting down");
                    break;
                }
            }
        }

        tracing::info!(room_id = %self.session.id(), "room actor stopped");
    }

    fn handle_dispatch(
        &mut self,
        caller: &Caller,
        outbox: &Outbox,
        request: RoomRequest,
    ) -> Result<(), RoomError> {
        match self.apply(caller, outbox, request) {
            Ok(outbound) => {
                self.deliver(outbound, Some((caller.connection, outbox)));
                Ok(())
            }
            Err(err) => {
                tracing::debug!(
                    room_id = %self.session.id(),
                    user_id = %caller.user_id,
                    error = %err,
                    "operation rejected"
                );
                Err(err)
            }
        }
    }

    fn apply(
        &mut self,
        caller: &Caller,
        outbox: &Outbox,
        request: RoomRequest,
    ) -> Result<Outbound, RoomError> {
        let session = &mut self.session;
        match request {
            RoomRequest::ConfirmReady => Ok(vec![(
                Recipient::Connection(caller.connection),
                ServerEvent::SessionReady(session.id().clone()),
            )]),
            RoomRequest::Join { display_name } => Ok(self.handle_join(caller, outbox, &display_name)),
            RoomRequest::SubmitTurn {
                user_id,
                display_name,
                actions,
            } => session.submit_turn(caller, user_id, display_name, actions),
            RoomRequest::StartTurn { snapshot } => {
                let outbound = session.start_turn(caller, snapshot)?;
                self.checkpoint();
                Ok(outbound)
            }
            RoomRequest::EndTurn => session.end_turn(caller),
            RoomRequest::RequestAccess {
                user_id,
                display_name,
                token,
            } => session.request_access(caller, user_id, display_name, token),
            RoomRequest::GrantAccess(id) => session.grant_access(caller, id),
            RoomRequest::DeclineAccess(id) => session.decline_access(caller, id),
            RoomRequest::ListAccessRequests => session.list_access_requests(caller),
            RoomRequest::ApproveAction {
                action,
                user_id,
                message,
            } => session.approve_action(caller, action, &user_id, message),
            RoomRequest::RequestRoll(context) => session.request_roll(caller, context),
            RoomRequest::CancelRoll(context) => session.cancel_roll(caller, &context),
            RoomRequest::SubmitRoll {
                value,
                display_name,
                action_index,
            } => session.submit_roll(caller, value, &display_name, action_index),
            RoomRequest::Log(message) => session.log(caller, message),
            RoomRequest::RelayAction(action) => session.relay_action(caller, action),
        }
    }

    fn handle_join(&mut self, caller: &Caller, outbox: &Outbox, display_name: &str) -> Outbound {
        self.outboxes.insert(caller.connection, outbox.clone());
        self.idle_since = None;
        let mut outbound = self.session.join(caller, display_name);

        if self.session.state_snapshot().is_none() && self.store.is_enabled() {
            // The joiner's reply waits for the store; everyone else has
            // already been told about the arrival.
            self.load_snapshot_for(caller.clone(), outbox.clone());
        } else {
            outbound.push((
                Recipient::Connection(caller.connection),
                self.session.join_reply(&caller.user_id),
            ));
        }

        tracing::info!(
            room_id = %self.session.id(),
            user_id = %caller.user_id,
            members = self.session.member_count(),
            "player joined"
        );
        outbound
    }

    fn load_snapshot_for(&self, caller: Caller, outbox: Outbox) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let set = self.session.set_reference().clone();
        let room_id = self.session.id().clone();

        tokio::spawn(async move {
            let result = store.load(&set).await;
            let reply_to = outbox.clone();
            let loaded = RoomCommand::SnapshotLoaded {
                caller,
                outbox,
                result,
            };
            if commands.send(loaded).await.is_err() {
                // Room reaped while the store was busy.
                let _ = reply_to.send(ServerEvent::OperationFailed(
                    RoomError::NotFound(room_id).to_string(),
                ));
            }
        });
    }

    fn handle_snapshot_loaded(
        &mut self,
        caller: &Caller,
        outbox: &Outbox,
        result: Result<Option<Snapshot>, StoreError>,
    ) {
        match result {
            Ok(Some(snapshot)) => self.session.seed_snapshot(snapshot),
            Ok(None) => {}
            Err(err) => tracing::warn!(
                room_id = %self.session.id(),
                set = %self.session.set_reference(),
                error = %err,
                "snapshot load failed, joining without one"
            ),
        }

        // The joiner may have left or moved to another connection while
        // the store was busy.
        if self.session.member_connection(&caller.user_id) != Some(caller.connection) {
            tracing::debug!(
                room_id = %self.session.id(),
                user_id = %caller.user_id,
                "joiner gone before snapshot arrived"
            );
            return;
        }

        let reply = self.session.join_reply(&caller.user_id);
        self.deliver(
            vec![(Recipient::Connection(caller.connection), reply)],
            Some((caller.connection, outbox)),
        );
    }

    fn handle_disconnect(&mut self, connection: ConnectionId, at: Instant) {
        self.outboxes.remove(&connection);
        if !self.session.disconnect(connection) {
            return;
        }

        tracing::info!(
            room_id = %self.session.id(),
            conn = %connection,
            members = self.session.member_count(),
            "player left"
        );
        if self.session.member_count() == 0 {
            self.idle_since = Some(at);
        }
    }

    /// Hands the current snapshot to the checkpoint writer. Only the most
    /// recent snapshot is kept if the store falls behind.
    fn checkpoint(&self) {
        if let (Some(checkpoints), Some(snapshot)) =
            (&self.checkpoints, self.session.state_snapshot())
        {
            checkpoints.send_replace(Some(snapshot.clone()));
        }
    }

    /// Resolves recipients against current membership and queues events.
    /// Recipients that aren't connected are skipped.
    fn deliver(&self, outbound: Outbound, origin: Option<(ConnectionId, &Outbox)>) {
        for (recipient, event) in outbound {
            match recipient {
                Recipient::Room => {
                    for conn in self.session.member_connections() {
                        self.send_to(conn, event.clone(), origin);
                    }
                }
                Recipient::RoomExcept(excluded) => {
                    for conn in self.session.member_connections() {
                        if conn != excluded {
                            self.send_to(conn, event.clone(), origin);
                        }
                    }
                }
                Recipient::User(user_id) => match self.session.member_connection(&user_id) {
                    Some(conn) => self.send_to(conn, event, origin),
                    None => tracing::debug!(
                        room_id = %self.session.id(),
                        %user_id,
                        event = event.name(),
                        "recipient not connected, dropping"
                    ),
                },
                Recipient::Guests => {
                    for conn in self.session.guest_connections() {
                        self.send_to(conn, event.clone(), origin);
                    }
                }
                Recipient::Host => {
                    if let Some(conn) = self.session.host_connection() {
                        self.send_to(conn, event, origin);
                    }
                }
                Recipient::Connection(conn) => self.send_to(conn, event, origin),
            }
        }
    }

    /// Queues one event. The caller's own outbox is used when its
    /// connection never joined (a host acting from a fresh connection).
    fn send_to(&self, conn: ConnectionId, event: ServerEvent, origin: Option<(ConnectionId, &Outbox)>) {
        let outbox = self.outboxes.get(&conn).or_else(|| {
            origin
                .filter(|(origin_conn, _)| *origin_conn == conn)
                .map(|(_, outbox)| outbox)
        });
        if let Some(outbox) = outbox {
            // A closed outbox means the handler is already tearing down.
            let _ = outbox.send(event);
        }
    }

    fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.session.id().clone(),
            name: self.session.name().to_owned(),
            host: self.session.host().clone(),
            phase: self.session.phase(),
            member_count: self.session.member_count(),
            pending_access_requests: self.session.access_requests().len(),
            queued_submissions: self.session.action_queue().len(),
            idle_since: self.idle_since,
        }
    }
}

/// Persists snapshots for one room, newest first, until the room stops.
async fn checkpoint_writer<S: SnapshotStore>(
    store: Arc<S>,
    room_id: RoomId,
    set: SetRef,
    mut latest: watch::Receiver<Option<Snapshot>>,
) {
    while latest.changed().await.is_ok() {
        let snapshot = latest.borrow_and_update().clone();
        let Some(snapshot) = snapshot else {
            continue;
        };
        if let Err(err) = store.save(&set, &snapshot).await {
            tracing::warn!(%room_id, %set, error = %err, "checkpoint failed");
        }
    }
}

/// Spawns a room actor for `session` and returns a handle to it.
///
/// `initial` is delivered before the actor starts, so events produced by
/// creating the session reach the host before any command is processed.
/// `channel_size` bounds the command channel; senders wait when it is full.
pub(crate) fn spawn_room<S: SnapshotStore>(
    session: Session,
    initial: Outbound,
    host_outbox: Outbox,
    store: Arc<S>,
    channel_size: usize,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel(channel_size);
    let room_id = session.id().clone();

    let checkpoints = store.is_enabled().then(|| {
        let (checkpoint_tx, checkpoint_rx) = watch::channel(None);
        tokio::spawn(checkpoint_writer(
            Arc::clone(&store),
            room_id.clone(),
            session.set_reference().clone(),
            checkpoint_rx,
        ));
        checkpoint_tx
    });

    let mut outboxes = HashMap::new();
    if let Some(conn) = session.host_connection() {
        outboxes.insert(conn, host_outbox);
    }

    let actor = RoomActor {
        session,
        outboxes,
        store,
        checkpoints,
        commands: tx.downgrade(),
        receiver: rx,
        idle_since: None,
    };
    actor.deliver(initial, None);

    tokio::spawn(actor.run());

    RoomHandle { room_id, sender: tx }
}
