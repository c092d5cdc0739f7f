//! The session record and every coordinator operation on it.
//!
//! [`Session`] is plain data: no channels, no tasks. Each operation
//! validates the caller, mutates the record, and returns the events it
//! wants delivered as `(Recipient, ServerEvent)` pairs. The room actor
//! owns the connections and does the delivery, which keeps everything in
//! here testable without a runtime.

use std::collections::{BTreeMap, HashMap};

use tavern_protocol::{
    AccessRequest, Action, RequestId, RollContext, RollOutcome, RoomId, ServerEvent, SetRef,
    Snapshot, Token, TurnSubmission, UserId, DIE_SIDES, ROLL_THRESHOLD,
};
use tavern_transport::ConnectionId;

use crate::{RollState, RoomError, TurnPhase};

/// Who an outgoing event is addressed to, resolved against the session's
/// membership at delivery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// Every member connection.
    Room,
    /// Every member connection except this one.
    RoomExcept(ConnectionId),
    /// Whichever connection this user is currently joined from.
    User(UserId),
    /// Every member connection except the host's.
    Guests,
    /// The host's current connection.
    Host,
    /// One specific connection.
    Connection(ConnectionId),
}

/// Events produced by one operation, in delivery order.
pub type Outbound = Vec<(Recipient, ServerEvent)>;

/// The authenticated origin of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub connection: ConnectionId,
}

impl Caller {
    pub fn new(user_id: impl Into<UserId>, connection: ConnectionId) -> Self {
        Self {
            user_id: user_id.into(),
            connection,
        }
    }
}

#[derive(Debug, Clone)]
struct PendingRoll {
    context: RollContext,
    state: RollState,
}

/// One hosted game.
#[derive(Debug)]
pub struct Session {
    id: RoomId,
    name: String,
    host: UserId,
    host_connection: Option<ConnectionId>,
    set_reference: SetRef,
    members: HashMap<UserId, ConnectionId>,
    role_assignments: BTreeMap<UserId, Token>,
    action_queue: Vec<TurnSubmission>,
    state_snapshot: Option<Snapshot>,
    access_requests: Vec<AccessRequest>,
    next_request_id: u64,
    phase: TurnPhase,
    rolls: BTreeMap<usize, PendingRoll>,
}

impl Session {
    /// Creates the session with the host as its only member and tells the
    /// host it can proceed.
    pub fn new(id: RoomId, name: String, host: &Caller, set_reference: SetRef) -> (Self, Outbound) {
        let session = Self {
            id: id.clone(),
            name,
            host: host.user_id.clone(),
            host_connection: Some(host.connection),
            set_reference,
            members: HashMap::from([(host.user_id.clone(), host.connection)]),
            role_assignments: BTreeMap::new(),
            action_queue: Vec::new(),
            state_snapshot: None,
            access_requests: Vec::new(),
            next_request_id: 0,
            phase: TurnPhase::Idle,
            rolls: BTreeMap::new(),
        };
        let outbound = vec![(Recipient::Connection(host.connection), ServerEvent::SessionReady(id))];
        (session, outbound)
    }

    // -- Accessors ----------------------------------------------------------

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &UserId {
        &self.host
    }

    pub fn host_connection(&self) -> Option<ConnectionId> {
        self.host_connection
    }

    pub fn set_reference(&self) -> &SetRef {
        &self.set_reference
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn state_snapshot(&self) -> Option<&Snapshot> {
        self.state_snapshot.as_ref()
    }

    pub fn action_queue(&self) -> &[TurnSubmission] {
        &self.action_queue
    }

    pub fn access_requests(&self) -> &[AccessRequest] {
        &self.access_requests
    }

    pub fn role_of(&self, user_id: &UserId) -> Option<&Token> {
        self.role_assignments.get(user_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn member_connection(&self, user_id: &UserId) -> Option<ConnectionId> {
        self.members.get(user_id).copied()
    }

    pub fn member_connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.members.values().copied()
    }

    pub fn guest_connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.members
            .iter()
            .filter(|(user_id, _)| !self.is_host(user_id))
            .map(|(_, conn)| *conn)
    }

    /// Current state of the roll gating action `index`.
    pub fn roll_state(&self, index: usize) -> RollState {
        self.rolls
            .get(&index)
            .map_or(RollState::Unresolved, |roll| roll.state)
    }

    pub fn is_host(&self, user_id: &UserId) -> bool {
        self.host == *user_id
    }

    // -- Membership ---------------------------------------------------------

    /// Maps the caller's user to the caller's connection.
    ///
    /// Rejoining overwrites the previous mapping, and a connection speaks
    /// for one user at a time, so any other user mapped to this connection
    /// is dropped. The rest of the room hears about the arrival; the
    /// joiner's own reply comes from [`Session::join_reply`].
    pub fn join(&mut self, caller: &Caller, display_name: &str) -> Outbound {
        self.members
            .retain(|user, conn| *conn != caller.connection || *user == caller.user_id);
        self.members.insert(caller.user_id.clone(), caller.connection);
        if self.is_host(&caller.user_id) {
            self.host_connection = Some(caller.connection);
        }

        tracing::debug!(
            room_id = %self.id,
            user_id = %caller.user_id,
            conn = %caller.connection,
            "member joined"
        );

        vec![(
            Recipient::RoomExcept(caller.connection),
            ServerEvent::Log(format!("{display_name} has connected")),
        )]
    }

    /// The event a joiner needs to restore its view: the host resumes with
    /// the set reference, a guest additionally learns its role.
    pub fn join_reply(&self, user_id: &UserId) -> ServerEvent {
        let snapshot = self.state_snapshot.clone();
        if self.is_host(user_id) {
            ServerEvent::HostResume(self.id.clone(), self.set_reference.clone(), snapshot)
        } else {
            ServerEvent::GuestJoin(
                self.id.clone(),
                self.set_reference.clone(),
                self.role_assignments.get(user_id).cloned(),
                snapshot,
            )
        }
    }

    /// Adopts a snapshot loaded from the store, unless a turn already
    /// supplied a newer one.
    pub fn seed_snapshot(&mut self, snapshot: Snapshot) {
        if self.state_snapshot.is_none() {
            self.state_snapshot = Some(snapshot);
        }
    }

    /// Drops every membership carried by `connection`. Returns whether
    /// anything was removed.
    pub fn disconnect(&mut self, connection: ConnectionId) -> bool {
        let before = self.members.len();
        self.members.retain(|_, conn| *conn != connection);
        if self.host_connection == Some(connection) {
            self.host_connection = None;
        }
        before != self.members.len()
    }

    // -- Access control -----------------------------------------------------

    /// Records a guest's request to control `token` and notifies the host.
    pub fn request_access(
        &mut self,
        caller: &Caller,
        user_id: UserId,
        display_name: String,
        token: Token,
    ) -> Result<Outbound, RoomError> {
        self.ensure_member(caller)?;
        self.ensure_self(caller, &user_id, "request access for another user")?;

        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;

        let log = format!("'{display_name}' is requesting access to {token}");
        self.access_requests.push(AccessRequest {
            id,
            room: self.id.clone(),
            requester_name: display_name,
            requester_user_id: user_id,
            requested_token: token,
        });

        Ok(vec![(Recipient::Host, ServerEvent::Log(log))])
    }

    /// Host only: the full pending list.
    pub fn list_access_requests(&self, caller: &Caller) -> Result<Outbound, RoomError> {
        self.ensure_host(caller, "list access requests")?;
        Ok(vec![(
            Recipient::Connection(caller.connection),
            ServerEvent::PendingAccessRequests(self.access_requests.clone()),
        )])
    }

    /// Host only: assigns the requested token and tells the requester.
    pub fn grant_access(&mut self, caller: &Caller, id: RequestId) -> Result<Outbound, RoomError> {
        self.ensure_host(caller, "grant access")?;
        let request = self.take_request(id)?;

        self.role_assignments
            .insert(request.requester_user_id.clone(), request.requested_token.clone());

        Ok(vec![(
            Recipient::User(request.requester_user_id),
            ServerEvent::GrantToken(Some(request.requested_token)),
        )])
    }

    /// Host only: discards the request and tells the requester.
    pub fn decline_access(&mut self, caller: &Caller, id: RequestId) -> Result<Outbound, RoomError> {
        self.ensure_host(caller, "decline access")?;
        let request = self.take_request(id)?;

        Ok(vec![(
            Recipient::User(request.requester_user_id),
            ServerEvent::Log(format!("'{}' access declined", request.requested_token)),
        )])
    }

    fn take_request(&mut self, id: RequestId) -> Result<AccessRequest, RoomError> {
        let position = self
            .access_requests
            .iter()
            .position(|req| req.id == id)
            .ok_or(RoomError::UnknownAccessRequest(id))?;
        Ok(self.access_requests.remove(position))
    }

    // -- Turns --------------------------------------------------------------

    /// Host only: opens a new turn from `snapshot`.
    ///
    /// Clears the queue, cancels any outstanding roll, re-grants every
    /// assigned role, and has everyone refresh their backup copy. Allowed
    /// in any phase.
    pub fn start_turn(&mut self, caller: &Caller, snapshot: Snapshot) -> Result<Outbound, RoomError> {
        self.ensure_host(caller, "start a turn")?;

        let mut outbound = Vec::new();

        self.action_queue.clear();
        for roll in std::mem::take(&mut self.rolls).into_values() {
            if roll.state == RollState::AwaitingRoll {
                outbound.push((Recipient::User(roll.context.user), ServerEvent::DisableRoll));
            }
        }
        self.state_snapshot = Some(snapshot);

        for (user, token) in &self.role_assignments {
            outbound.push((
                Recipient::User(user.clone()),
                ServerEvent::GrantToken(Some(token.clone())),
            ));
        }
        outbound.push((Recipient::Room, ServerEvent::RefreshSnapshot));
        outbound.push((Recipient::Host, ServerEvent::GrantAllAccess));

        self.phase = TurnPhase::TurnOpen;
        tracing::info!(room_id = %self.id, "turn started");
        Ok(outbound)
    }

    /// Appends the caller's actions to the open turn's queue.
    pub fn submit_turn(
        &mut self,
        caller: &Caller,
        user_id: UserId,
        display_name: String,
        actions: Vec<Action>,
    ) -> Result<Outbound, RoomError> {
        self.ensure_member(caller)?;
        self.ensure_self(caller, &user_id, "submit a turn for another user")?;
        if !self.phase.accepts_submissions() {
            return Err(RoomError::InvalidPhase {
                operation: "submit a turn",
                phase: self.phase,
            });
        }

        let log = format!("'{display_name}' has ended turn");
        self.action_queue.push(TurnSubmission {
            user_id,
            display_name,
            actions,
        });

        Ok(vec![(Recipient::Room, ServerEvent::Log(log))])
    }

    /// Host only: closes the turn and hands the host the queue to resolve.
    ///
    /// Guests lose turn access. The host keeps it on every connection,
    /// including one that never joined.
    pub fn end_turn(&mut self, caller: &Caller) -> Result<Outbound, RoomError> {
        self.ensure_host(caller, "end the turn")?;
        if !self.phase.can_end() {
            return Err(RoomError::InvalidPhase {
                operation: "end the turn",
                phase: self.phase,
            });
        }

        self.phase = TurnPhase::TurnClosing;
        tracing::info!(
            room_id = %self.id,
            submissions = self.action_queue.len(),
            "turn closing"
        );

        Ok(vec![
            (Recipient::Guests, ServerEvent::RevokeTurnAccess),
            (
                Recipient::Connection(caller.connection),
                ServerEvent::ActionQueue(self.action_queue.clone()),
            ),
            (Recipient::Room, ServerEvent::ResyncBoard),
        ])
    }

    // -- Rolls --------------------------------------------------------------

    /// Host only: asks `context.user` to roll for the gated action.
    pub fn request_roll(&mut self, caller: &Caller, context: RollContext) -> Result<Outbound, RoomError> {
        self.ensure_host(caller, "request a roll")?;
        let index = context.action_index;
        if !self.roll_state(index).can_transition_to(RollState::AwaitingRoll) {
            return Err(RoomError::RollAlreadyResolved(index));
        }

        let outbound = vec![
            (
                Recipient::User(context.user.clone()),
                ServerEvent::EnableRoll(context.clone()),
            ),
            (
                Recipient::Room,
                ServerEvent::Log(format!("Waiting for {} to roll", context.roller)),
            ),
            (
                Recipient::Room,
                ServerEvent::Log(format!(
                    "To use {}, rolling {ROLL_THRESHOLD}+ is needed",
                    context.ability
                )),
            ),
        ];
        self.rolls.insert(
            index,
            PendingRoll {
                context,
                state: RollState::AwaitingRoll,
            },
        );
        Ok(outbound)
    }

    /// Host only: withdraws the roll request for `context.action_index`.
    pub fn cancel_roll(&mut self, caller: &Caller, context: &RollContext) -> Result<Outbound, RoomError> {
        self.ensure_host(caller, "cancel a roll")?;
        let index = context.action_index;
        if !self.roll_state(index).can_transition_to(RollState::Unresolved) {
            return Err(RoomError::NoPendingRoll(index));
        }

        // Unresolved is the absence of an entry.
        let Some(roll) = self.rolls.remove(&index) else {
            return Err(RoomError::NoPendingRoll(index));
        };

        Ok(vec![
            (Recipient::User(roll.context.user), ServerEvent::DisableRoll),
            (
                Recipient::Room,
                ServerEvent::Log("Roll cancelled, skipping request".into()),
            ),
        ])
    }

    /// Resolves the pending roll for `action_index` with `value`.
    ///
    /// Only the player the roll was requested from may submit it.
    pub fn submit_roll(
        &mut self,
        caller: &Caller,
        value: u8,
        display_name: &str,
        action_index: usize,
    ) -> Result<Outbound, RoomError> {
        self.ensure_member(caller)?;

        let Some(roll) = self.rolls.get_mut(&action_index) else {
            return Err(RoomError::NoPendingRoll(action_index));
        };
        // Stored rolls are awaiting or resolved; unresolved has no entry.
        if roll.state.is_terminal() {
            return Err(RoomError::RollAlreadyResolved(action_index));
        }
        if roll.context.user != caller.user_id {
            return Err(RoomError::Unauthorized {
                user: caller.user_id.clone(),
                operation: "roll for another player",
            });
        }
        if !(1..=DIE_SIDES).contains(&value) {
            return Err(RoomError::InvalidRoll(value));
        }

        let outcome = RollOutcome::from_roll(value);
        roll.state = RollState::Resolved(outcome);

        let verdict = if outcome.is_success() {
            "Attempt succeeded!"
        } else {
            "Attempt failed!"
        };
        Ok(vec![
            (
                Recipient::Room,
                ServerEvent::Log(format!("{display_name} rolled a {value}")),
            ),
            (Recipient::Room, ServerEvent::Log(verdict.into())),
            (Recipient::Host, ServerEvent::RollOutcome(outcome, action_index)),
        ])
    }

    // -- Broadcast ----------------------------------------------------------

    /// Appends a line to every member's game log.
    pub fn log(&self, caller: &Caller, message: String) -> Result<Outbound, RoomError> {
        self.ensure_member(caller)?;
        Ok(vec![(Recipient::Room, ServerEvent::Log(message))])
    }

    /// Host only: has every member apply `action`, then logs `message`.
    pub fn approve_action(
        &self,
        caller: &Caller,
        action: Action,
        user_id: &UserId,
        message: String,
    ) -> Result<Outbound, RoomError> {
        self.ensure_host(caller, "approve actions")?;
        tracing::debug!(room_id = %self.id, submitter = %user_id, "action approved");
        Ok(vec![
            (Recipient::Room, ServerEvent::ExecuteAction(action)),
            (Recipient::Room, ServerEvent::Log(message)),
        ])
    }

    /// Forwards `action` to every other member.
    pub fn relay_action(&self, caller: &Caller, action: Action) -> Result<Outbound, RoomError> {
        self.ensure_member(caller)?;
        Ok(vec![(
            Recipient::RoomExcept(caller.connection),
            ServerEvent::ExecuteAction(action),
        )])
    }

    // -- Guards -------------------------------------------------------------

    fn ensure_host(&self, caller: &Caller, operation: &'static str) -> Result<(), RoomError> {
        if self.is_host(&caller.user_id) {
            Ok(())
        } else {
            Err(RoomError::Unauthorized {
                user: caller.user_id.clone(),
                operation,
            })
        }
    }

    fn ensure_member(&self, caller: &Caller) -> Result<(), RoomError> {
        if self.members.get(&caller.user_id) == Some(&caller.connection) {
            Ok(())
        } else {
            Err(RoomError::NotAMember(caller.user_id.clone(), self.id.clone()))
        }
    }

    fn ensure_self(&self, caller: &Caller, user_id: &UserId, operation: &'static str) -> Result<(), RoomError> {
        if caller.user_id == *user_id {
            Ok(())
        } else {
            Err(RoomError::Unauthorized {
                user: caller.user_id.clone(),
                operation,
            })
        }
    }
}
