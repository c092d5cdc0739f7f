//! Session registry: the process-wide map from room id to running room.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tavern_protocol::{RoomId, SetRef};

use crate::room::spawn_room;
use crate::session::{Caller, Session};
use crate::store::SnapshotStore;
use crate::{Outbox, RoomConfig, RoomError, RoomHandle, RoomInfo};

/// Creates, finds, and reaps rooms.
///
/// The registry only holds handles. Callers clone a handle out and talk
/// to the room without keeping the registry locked.
pub struct SessionRegistry<S: SnapshotStore> {
    rooms: HashMap<RoomId, RoomHandle>,
    store: Arc<S>,
    config: RoomConfig,
}

impl<S: SnapshotStore> SessionRegistry<S> {
    pub fn new(config: RoomConfig, store: S) -> Self {
        Self {
            rooms: HashMap::new(),
            store: Arc::new(store),
            config,
        }
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Starts a new session hosted by `host`.
    ///
    /// The host becomes the only member and receives `session-ready` on
    /// `outbox` before this returns. Must be called from within a Tokio
    /// runtime.
    ///
    /// # Errors
    /// [`RoomError::AlreadyExists`] if the room id is taken; the existing
    /// session is left untouched.
    pub fn create_session(
        &mut self,
        room_id: RoomId,
        host: Caller,
        outbox: Outbox,
        set_reference: SetRef,
        name: String,
    ) -> Result<RoomHandle, RoomError> {
        if self.contains(&room_id) {
            return Err(RoomError::AlreadyExists(room_id));
        }

        let (session, initial) = Session::new(room_id.clone(), name, &host, set_reference);
        let handle = spawn_room(
            session,
            initial,
            outbox,
            Arc::clone(&self.store),
            self.config.channel_size,
        );
        self.rooms.insert(room_id.clone(), handle.clone());

        tracing::info!(
            %room_id,
            host = %host.user_id,
            rooms = self.rooms.len(),
            "session created"
        );
        Ok(handle)
    }

    pub fn find(&self, room_id: &RoomId) -> Option<RoomHandle> {
        self.rooms.get(room_id).cloned()
    }

    /// Like [`find`](Self::find), but a missing room is an error.
    pub fn get(&self, room_id: &RoomId) -> Result<RoomHandle, RoomError> {
        self.find(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))
    }

    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Returns cloned handles to every room.
    pub fn room_handles(&self) -> Vec<RoomHandle> {
        self.rooms.values().cloned().collect()
    }

    pub async fn get_room_info(&self, room_id: &RoomId) -> Result<RoomInfo, RoomError> {
        self.get(room_id)?.get_info().await
    }

    /// Shuts a room down and forgets it.
    pub async fn destroy(&mut self, room_id: &RoomId) -> Result<(), RoomError> {
        let handle = self
            .rooms
            .remove(room_id)
            .ok_or_else(|| RoomError::NotFound(room_id.clone()))?;
        let _ = handle.shutdown().await;
        tracing::info!(%room_id, "session destroyed");
        Ok(())
    }

    /// Reaps idle rooms while holding the registry exclusively.
    ///
    /// A registry shared behind a lock should instead call
    /// [`stop_idle_rooms`] on [`room_handles`](Self::room_handles) with the
    /// lock released, then [`forget`](Self::forget) the result.
    pub async fn reap_idle(&mut self) -> Vec<RoomId> {
        let stopped = stop_idle_rooms(self.room_handles(), self.config.idle_timeout).await;
        self.forget(&stopped)
    }

    /// Removes the given stopped rooms. A room id that now belongs to a
    /// newer room is left alone. Returns the ids that were removed.
    pub fn forget(&mut self, stopped: &[RoomHandle]) -> Vec<RoomId> {
        let mut removed = Vec::new();
        for handle in stopped {
            let room_id = handle.room_id();
            if self
                .rooms
                .get(room_id)
                .is_some_and(|current| current.same_room(handle))
            {
                self.rooms.remove(room_id);
                tracing::info!(%room_id, "idle session reaped");
                removed.push(room_id.clone());
            }
        }
        removed
    }
}

/// Asks each room to stop if it has been empty for `idle_timeout`.
/// Returns the rooms that stopped, plus any whose actor had already died.
///
/// Each room decides and stops in a single step, so a join racing the
/// sweep either lands first and keeps the room or fails with
/// [`RoomError::Unavailable`].
pub async fn stop_idle_rooms(handles: Vec<RoomHandle>, idle_timeout: Duration) -> Vec<RoomHandle> {
    let mut stopped = Vec::new();
    for handle in handles {
        match handle.shutdown_if_idle(idle_timeout).await {
            Ok(true) => stopped.push(handle),
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(room_id = %handle.room_id(), error = %err, "dropping unresponsive room");
                stopped.push(handle);
            }
        }
    }
    stopped
}

#[cfg(test)]
mod tests {
    use tavern_protocol::ServerEvent;
    use tavern_transport::ConnectionId;
    use tokio::sync::mpsc;

    use super::*;
    use crate::store::NoStore;

    fn registry(idle_timeout: Duration) -> SessionRegistry<NoStore> {
        SessionRegistry::new(
            RoomConfig {
                idle_timeout,
                ..RoomConfig::default()
            },
            NoStore,
        )
    }

    fn create(
        registry: &mut SessionRegistry<NoStore>,
        room: &str,
    ) -> (RoomHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = registry
            .create_session(
                RoomId::from(room),
                Caller::new("H", ConnectionId::new(1)),
                tx,
                SetRef::from("S1"),
                "Crypt".into(),
            )
            .unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn test_create_sends_session_ready() {
        let mut registry = registry(Duration::from_secs(60));
        let (_, mut rx) = create(&mut registry, "R1");

        assert_eq!(rx.try_recv().unwrap(), ServerEvent::SessionReady(RoomId::from("R1")));
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_room_id_rejected() {
        let mut registry = registry(Duration::from_secs(60));
        let (_first, _rx) = create(&mut registry, "R1");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = registry
            .create_session(
                RoomId::from("R1"),
                Caller::new("X", ConnectionId::new(2)),
                tx,
                SetRef::from("S2"),
                "Other".into(),
            )
            .unwrap_err();

        assert_eq!(err, RoomError::AlreadyExists(RoomId::from("R1")));
        assert_eq!(err.to_string(), "Name: 'R1' already taken!");
        assert!(rx.try_recv().is_err());

        let info = registry.get_room_info(&RoomId::from("R1")).await.unwrap();
        assert_eq!(info.host, tavern_protocol::UserId::from("H"));
        assert_eq!(info.name, "Crypt");
    }

    #[tokio::test]
    async fn test_missing_room() {
        let registry = registry(Duration::from_secs(60));
        assert!(registry.find(&RoomId::from("nope")).is_none());
        let err = registry.get(&RoomId::from("nope")).err().unwrap();
        assert_eq!(err.to_string(), "Couldn't find game: 'nope'");
    }

    #[tokio::test]
    async fn test_reap_leaves_occupied_rooms() {
        let mut registry = registry(Duration::ZERO);
        let (_handle, _rx) = create(&mut registry, "R1");

        assert!(registry.reap_idle().await.is_empty());
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_reap_removes_empty_rooms() {
        let mut registry = registry(Duration::ZERO);
        let (handle, _rx) = create(&mut registry, "R1");
        handle.disconnect(ConnectionId::new(1)).await.unwrap();

        let reaped = registry.reap_idle().await;

        assert_eq!(reaped, vec![RoomId::from("R1")]);
        assert!(!registry.contains(&RoomId::from("R1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_waits_for_idle_timeout() {
        let mut registry = registry(Duration::from_secs(30));
        let (handle, _rx) = create(&mut registry, "R1");
        handle.disconnect(ConnectionId::new(1)).await.unwrap();
        // Round trip so the actor has applied the disconnect.
        handle.get_info().await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(registry.reap_idle().await.is_empty());

        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(registry.reap_idle().await, vec![RoomId::from("R1")]);
    }

    #[tokio::test]
    async fn test_forget_leaves_recreated_room() {
        let mut registry = registry(Duration::ZERO);
        let (old, _rx) = create(&mut registry, "R1");
        old.disconnect(ConnectionId::new(1)).await.unwrap();

        let stopped = stop_idle_rooms(registry.room_handles(), Duration::ZERO).await;
        assert_eq!(stopped.len(), 1);

        // The id is reused before the sweep comes back to remove it.
        registry.rooms.remove(&RoomId::from("R1"));
        let (_new, _rx2) = create(&mut registry, "R1");

        assert!(registry.forget(&stopped).is_empty());
        assert!(registry.get_room_info(&RoomId::from("R1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_skips_room_that_was_joined() {
        let mut registry = registry(Duration::ZERO);
        let (handle, _rx) = create(&mut registry, "R1");
        handle.disconnect(ConnectionId::new(1)).await.unwrap();

        let (tx, _guest_rx) = mpsc::unbounded_channel();
        handle
            .dispatch(
                Caller::new("A", ConnectionId::new(2)),
                tx,
                crate::RoomRequest::Join {
                    display_name: "Ann".into(),
                },
            )
            .await
            .unwrap();

        assert!(registry.reap_idle().await.is_empty());
        assert_eq!(handle.get_info().await.unwrap().member_count, 1);
    }

    #[tokio::test]
    async fn test_destroy_shuts_room_down() {
        let mut registry = registry(Duration::from_secs(60));
        let (handle, _rx) = create(&mut registry, "R1");

        registry.destroy(&RoomId::from("R1")).await.unwrap();

        assert_eq!(registry.room_count(), 0);
        assert!(matches!(
            handle.get_info().await,
            Err(RoomError::Unavailable(_))
        ));
    }
}
