//! Per-connection handler: handshake, outbound pump, and event dispatch.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Receive `handshake` → check version, authenticate the token
//!   2. Send `handshake-ack` → the connection now speaks for that user
//!   3. Start a writer task draining the connection's outbox
//!   4. Loop: receive events → answer heartbeats, route everything else
//!      to the room it names
//!
//! Rooms push to the connection through its outbox, so replies and
//! notifications from any room reach the socket in the order they were
//! produced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tavern_identity::{Authenticator, Identity, IdentityError};
use tavern_protocol::{
    ClientEvent, Codec, EventTag, PROTOCOL_VERSION, ProtocolError, RoomId, ServerEvent, UserId,
};
use tavern_room::{Caller, Outbox, RoomError, RoomHandle, RoomRequest, SnapshotStore};
use tavern_transport::{Connection, ConnectionId, WebSocketConnection};
use tokio::sync::mpsc;

use crate::TavernError;
use crate::server::ServerState;

/// Tells every room this connection joined that it's gone when the
/// handler exits, including by panic.
///
/// `Drop` is synchronous, so the notifications go out on a spawned task.
struct DisconnectGuard {
    connection: ConnectionId,
    rooms: HashMap<RoomId, RoomHandle>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.rooms.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let connection = self.connection;
        let rooms: Vec<RoomHandle> = self.rooms.drain().map(|(_, room)| room).collect();
        runtime.spawn(async move {
            for room in rooms {
                if let Err(e) = room.disconnect(connection).await {
                    tracing::debug!(%connection, error = %e, "room already gone");
                }
            }
        });
    }
}

/// Per-connection state shared by the dispatch functions.
struct ConnectionContext<A: Authenticator, C: Codec, S: SnapshotStore> {
    state: Arc<ServerState<A, C, S>>,
    identity: Identity,
    caller: Caller,
    outbox: Outbox,
    joined: DisconnectGuard,
    started: Instant,
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<A, C, S>(
    conn: WebSocketConnection,
    state: Arc<ServerState<A, C, S>>,
) -> Result<(), TavernError>
where
    A: Authenticator,
    C: Codec,
    S: SnapshotStore,
{
    let conn_id = conn.id();
    let started = Instant::now();
    tracing::debug!(%conn_id, "handling new connection");

    // --- Step 1: Handshake ---
    let identity = match perform_handshake(&conn, &state).await {
        Ok(identity) => identity,
        Err(e) => {
            let _ = conn.close().await;
            return Err(e);
        }
    };
    tracing::info!(%conn_id, user_id = %identity.user_id, "player authenticated");

    // --- Step 2: Outbound pump ---
    let conn = Arc::new(conn);
    let (outbox, inbox) = mpsc::unbounded_channel();
    let writer = tokio::spawn(pump_outbox(Arc::clone(&conn), Arc::clone(&state), inbox));

    let mut ctx = ConnectionContext {
        caller: Caller::new(identity.user_id.clone(), conn_id),
        identity,
        outbox,
        joined: DisconnectGuard {
            connection: conn_id,
            rooms: HashMap::new(),
        },
        state,
        started,
    };

    // --- Step 3: Event loop ---
    let heartbeat_timeout = ctx.state.config.heartbeat_timeout;
    loop {
        let data = match tokio::time::timeout(heartbeat_timeout, conn.recv()).await {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                tracing::info!(%conn_id, "connection closed cleanly");
                break;
            }
            Ok(Err(e)) => {
                tracing::debug!(%conn_id, error = %e, "recv error");
                break;
            }
            Err(_) => {
                tracing::info!(%conn_id, "connection timed out");
                break;
            }
        };

        let event: ClientEvent = match ctx.state.codec.decode(&data) {
            Ok(event) => event,
            Err(e) => {
                report_malformed(&ctx, &data, e);
                continue;
            }
        };

        let name = event.name();
        if let Err(e) = handle_event(&mut ctx, event).await {
            tracing::warn!(
                %conn_id,
                user_id = %ctx.identity.user_id,
                event = name,
                error = %e,
                "operation failed"
            );
            let _ = ctx.outbox.send(ServerEvent::OperationFailed(e.to_string()));
        }
    }

    writer.abort();
    let _ = conn.close().await;
    // ctx.joined drops here → every joined room hears about the disconnect.
    Ok(())
}

/// Answers a frame that names a known event but carries arguments of
/// the wrong shape. Anything else is not an event and is skipped.
fn report_malformed<A, C, S>(ctx: &ConnectionContext<A, C, S>, data: &[u8], err: ProtocolError)
where
    A: Authenticator,
    C: Codec,
    S: SnapshotStore,
{
    let conn_id = ctx.caller.connection;
    match ctx.state.codec.decode::<EventTag>(data) {
        Ok(tag) if ClientEvent::is_known(&tag.event) => {
            tracing::warn!(
                %conn_id,
                user_id = %ctx.identity.user_id,
                event = %tag.event,
                error = %err,
                "malformed arguments"
            );
            let reason = format!("malformed {} arguments", tag.event);
            let _ = ctx.outbox.send(ServerEvent::OperationFailed(reason));
        }
        _ => tracing::debug!(%conn_id, error = %err, "skipping undecodable frame"),
    }
}

/// Receives the handshake, validates it, and acknowledges it.
///
/// On any failure the client gets an `operation-failed` explaining why
/// before the error is returned.
/// Whole milliseconds in `elapsed`, capped at `u64::MAX`.
fn millis_saturating(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

async fn perform_handshake<A, C, S>(
    conn: &WebSocketConnection,
    state: &ServerState<A, C, S>,
) -> Result<Identity, TavernError>
where
    A: Authenticator,
    C: Codec,
    S: SnapshotStore,
{
    let data = match tokio::time::timeout(state.config.handshake_timeout, conn.recv()).await {
        Ok(Ok(Some(data))) => data,
        Ok(Ok(None)) => {
            let err = ProtocolError::InvalidMessage("connection closed before handshake".into());
            return Err(err.into());
        }
        Ok(Err(e)) => return Err(TavernError::Transport(e)),
        Err(_) => {
            let err = ProtocolError::InvalidMessage("handshake timed out".into());
            send_direct(conn, &state.codec, ServerEvent::OperationFailed(err.to_string())).await?;
            return Err(err.into());
        }
    };

    let (version, token) = match state.codec.decode::<ClientEvent>(&data) {
        Ok(ClientEvent::Handshake(version, token)) => (version, token),
        Ok(_) | Err(_) => {
            let err = ProtocolError::InvalidMessage("first message must be a handshake".into());
            return reject(conn, state, err.into()).await;
        }
    };

    if version != PROTOCOL_VERSION {
        let err = ProtocolError::InvalidMessage(format!(
            "version mismatch: expected {PROTOCOL_VERSION}, got {version}"
        ));
        return reject(conn, state, err.into()).await;
    }

    let Some(token) = token else {
        return reject(conn, state, IdentityError::MissingToken.into()).await;
    };
    let identity = match state.auth.authenticate(&token).await {
        Ok(identity) => identity,
        Err(e) => return reject(conn, state, e.into()).await,
    };

    send_direct(
        conn,
        &state.codec,
        ServerEvent::HandshakeAck(identity.user_id.clone(), identity.display_name.clone()),
    )
    .await?;
    Ok(identity)
}

async fn reject<A, C, S>(
    conn: &WebSocketConnection,
    state: &ServerState<A, C, S>,
    err: TavernError,
) -> Result<Identity, TavernError>
where
    A: Authenticator,
    C: Codec,
    S: SnapshotStore,
{
    send_direct(conn, &state.codec, ServerEvent::OperationFailed(err.to_string())).await?;
    Err(err)
}

/// Encodes and sends one event, bypassing the outbox. Only used before
/// the outbox exists.
async fn send_direct(
    conn: &WebSocketConnection,
    codec: &impl Codec,
    event: ServerEvent,
) -> Result<(), TavernError> {
    let bytes = codec.encode(&event)?;
    conn.send(&bytes).await?;
    Ok(())
}

/// Drains the outbox onto the socket until the socket fails or every
/// sender is gone.
async fn pump_outbox<A, C, S>(
    conn: Arc<WebSocketConnection>,
    state: Arc<ServerState<A, C, S>>,
    mut inbox: mpsc::UnboundedReceiver<ServerEvent>,
) where
    A: Authenticator,
    C: Codec,
    S: SnapshotStore,
{
    while let Some(event) = inbox.recv().await {
        let bytes = match state.codec.encode(&event) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(conn_id = %conn.id(), event = event.name(), error = %e, "encode failed");
                continue;
            }
        };
        if let Err(e) = conn.send(&bytes).await {
            tracing::debug!(conn_id = %conn.id(), error = %e, "send failed, stopping writer");
            break;
        }
    }
}

/// Routes one decoded event.
async fn handle_event<A, C, S>(
    ctx: &mut ConnectionContext<A, C, S>,
    event: ClientEvent,
) -> Result<(), TavernError>
where
    A: Authenticator,
    C: Codec,
    S: SnapshotStore,
{
    match event {
        ClientEvent::Handshake(..) => {
            Err(ProtocolError::InvalidMessage("handshake already completed".into()).into())
        }

        ClientEvent::Heartbeat(client_time) => {
            let server_time = millis_saturating(ctx.started.elapsed());
            let _ = ctx
                .outbox
                .send(ServerEvent::HeartbeatAck(client_time, server_time));
            Ok(())
        }

        ClientEvent::CreateSession(room_id, user_id, set_reference, name) => {
            ensure_self(ctx, &user_id, "create a session for another user")?;
            let room = ctx.state.registry.lock().await.create_session(
                room_id.clone(),
                ctx.caller.clone(),
                ctx.outbox.clone(),
                set_reference,
                name,
            )?;
            ctx.joined.rooms.insert(room_id, room);
            Ok(())
        }

        ClientEvent::JoinSession(user_id, display_name, room_id) => {
            ensure_self(ctx, &user_id, "join as another user")?;
            let room = find_room(ctx, &room_id).await?;
            room.dispatch(
                ctx.caller.clone(),
                ctx.outbox.clone(),
                RoomRequest::Join { display_name },
            )
            .await?;
            ctx.joined.rooms.insert(room_id, room);
            Ok(())
        }

        ClientEvent::RelayAction(action) => {
            if ctx.joined.rooms.is_empty() {
                return Err(RoomError::NotInAnySession.into());
            }
            let rooms: Vec<RoomHandle> = ctx.joined.rooms.values().cloned().collect();
            for room in rooms {
                if let Err(e) = room
                    .dispatch(
                        ctx.caller.clone(),
                        ctx.outbox.clone(),
                        RoomRequest::RelayAction(action.clone()),
                    )
                    .await
                {
                    tracing::debug!(room_id = %room.room_id(), error = %e, "relay skipped room");
                }
            }
            Ok(())
        }

        ClientEvent::ConfirmReady(room_id) => {
            dispatch_to(ctx, &room_id, RoomRequest::ConfirmReady).await
        }
        ClientEvent::SubmitTurn(room_id, user_id, display_name, actions) => {
            let request = RoomRequest::SubmitTurn {
                user_id,
                display_name,
                actions,
            };
            dispatch_to(ctx, &room_id, request).await
        }
        ClientEvent::StartTurn(room_id, snapshot) => {
            dispatch_to(ctx, &room_id, RoomRequest::StartTurn { snapshot }).await
        }
        ClientEvent::EndTurn(room_id) => dispatch_to(ctx, &room_id, RoomRequest::EndTurn).await,
        ClientEvent::RequestAccess(room_id, user_id, display_name, token) => {
            let request = RoomRequest::RequestAccess {
                user_id,
                display_name,
                token,
            };
            dispatch_to(ctx, &room_id, request).await
        }
        ClientEvent::GrantAccess(room_id, id) => {
            dispatch_to(ctx, &room_id, RoomRequest::GrantAccess(id)).await
        }
        ClientEvent::DeclineAccess(room_id, id) => {
            dispatch_to(ctx, &room_id, RoomRequest::DeclineAccess(id)).await
        }
        ClientEvent::ListAccessRequests(room_id) => {
            dispatch_to(ctx, &room_id, RoomRequest::ListAccessRequests).await
        }
        ClientEvent::ApproveAction(room_id, action, user_id, message) => {
            let request = RoomRequest::ApproveAction {
                action,
                user_id,
                message,
            };
            dispatch_to(ctx, &room_id, request).await
        }
        ClientEvent::CancelRollRequest(room_id, context) => {
            dispatch_to(ctx, &room_id, RoomRequest::CancelRoll(context)).await
        }
        ClientEvent::BroadcastLog(room_id, message) => {
            dispatch_to(ctx, &room_id, RoomRequest::Log(message)).await
        }
        ClientEvent::RequestRoll(room_id, context) => {
            dispatch_to(ctx, &room_id, RoomRequest::RequestRoll(context)).await
        }
        ClientEvent::SubmitRoll(room_id, value, display_name, action_index) => {
            let request = RoomRequest::SubmitRoll {
                value,
                display_name,
                action_index,
            };
            dispatch_to(ctx, &room_id, request).await
        }
    }
}

/// Applies `request` in the named room as this connection's user.
async fn dispatch_to<A, C, S>(
    ctx: &ConnectionContext<A, C, S>,
    room_id: &RoomId,
    request: RoomRequest,
) -> Result<(), TavernError>
where
    A: Authenticator,
    C: Codec,
    S: SnapshotStore,
{
    let room = find_room(ctx, room_id).await?;
    room.dispatch(ctx.caller.clone(), ctx.outbox.clone(), request)
        .await?;
    Ok(())
}

/// Looks the room up in the registry. The lock is released before the
/// handle is used.
async fn find_room<A, C, S>(
    ctx: &ConnectionContext<A, C, S>,
    room_id: &RoomId,
) -> Result<RoomHandle, RoomError>
where
    A: Authenticator,
    C: Codec,
    S: SnapshotStore,
{
    ctx.state.registry.lock().await.get(room_id)
}

/// Rejects events that name a user other than the authenticated one.
fn ensure_self<A, C, S>(
    ctx: &ConnectionContext<A, C, S>,
    user_id: &UserId,
    operation: &'static str,
) -> Result<(), RoomError>
where
    A: Authenticator,
    C: Codec,
    S: SnapshotStore,
{
    if *user_id == ctx.identity.user_id {
        Ok(())
    } else {
        Err(RoomError::Unauthorized {
            user: ctx.identity.user_id.clone(),
            operation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_saturate_instead_of_wrapping() {
        assert_eq!(millis_saturating(Duration::from_millis(1500)), 1500);
        assert_eq!(millis_saturating(Duration::MAX), u64::MAX);
    }
}
