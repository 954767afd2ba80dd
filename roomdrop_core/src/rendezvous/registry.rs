//! Room membership registry
//!
//! The room table and the member→room index sit behind one lock and are
//! only ever updated together, so membership has a single authoritative
//! representation. Every admission is one check-and-insert under the write
//! lock: two concurrent joiners can never both see a free slot.

use super::messages::ServerMessage;
use crate::error::RoomError;
use serde_json::Value;
use std::collections::HashMap;
use std::time::SystemTime;
use tokio::sync::{RwLock, mpsc};

/// Maximum number of members in one room
pub const ROOM_CAPACITY: usize = 2;

/// Server-assigned identifier of one signaling connection
pub type MemberId = String;

/// A connected participant: its identifier plus the outbox its socket
/// task drains
#[derive(Debug, Clone)]
pub struct MemberHandle {
    id: MemberId,
    outbox: mpsc::UnboundedSender<ServerMessage>,
}

impl MemberHandle {
    pub fn new(id: impl Into<MemberId>, outbox: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            id: id.into(),
            outbox,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn notify(&self, msg: ServerMessage) {
        if self.outbox.send(msg).is_err() {
            tracing::debug!("Outbox of member {} already closed", self.id);
        }
    }
}

struct Room {
    members: Vec<MemberHandle>,
    created_at: SystemTime,
}

impl Room {
    fn new(first: MemberHandle) -> Self {
        Self {
            members: vec![first],
            created_at: SystemTime::now(),
        }
    }

    fn contains(&self, member_id: &str) -> bool {
        self.members.iter().any(|m| m.id() == member_id)
    }

    fn is_full(&self) -> bool {
        self.members.len() >= ROOM_CAPACITY
    }

    fn notify_others(&self, member_id: &str, msg: &ServerMessage) -> usize {
        let mut delivered = 0;
        for other in self.members.iter().filter(|m| m.id() != member_id) {
            other.notify(msg.clone());
            delivered += 1;
        }
        delivered
    }
}

/// Read-only view of a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub members: Vec<MemberId>,
    pub created_at: SystemTime,
}

/// How a member ended up in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The room did not exist and was created with this member
    Created,
    /// The member took the free slot of an existing room
    Admitted,
    /// The member was already in the room; nothing changed
    AlreadyMember,
}

/// What happened to a room when a member left
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    /// Other members remain and were told about the departure
    Left { room_id: String, remaining: usize },
    /// The last member left and the room was deleted
    RoomClosed { room_id: String },
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Create,
    Join,
    Reconnect,
}

impl Request {
    fn reply(self, room_id: &str, result: &Result<Admission, RoomError>) -> ServerMessage {
        let room_id = room_id.to_string();
        match (self, result) {
            // A late creator takes the free slot and plays the joining side
            (Request::Create, Ok(Admission::Admitted)) => ServerMessage::RoomJoined { room_id },
            (Request::Create, Ok(_)) => ServerMessage::RoomCreated { room_id },
            (Request::Join, Ok(_)) => ServerMessage::RoomJoined { room_id },
            (Request::Reconnect, Ok(_)) => ServerMessage::ReconnectedToRoom { room_id },
            (_, Err(RoomError::RoomFull(_))) => ServerMessage::RoomFull { room_id },
            (_, Err(RoomError::RoomNotFound(_))) => ServerMessage::RoomNotFound { room_id },
            (_, Err(RoomError::ReconnectionFailed(_))) => {
                ServerMessage::ReconnectionFailed { room_id }
            }
        }
    }

    fn peer_notice(self, member_id: &str) -> ServerMessage {
        let peer_id = member_id.to_string();
        match self {
            Request::Create | Request::Join => ServerMessage::OtherUserJoined { peer_id },
            Request::Reconnect => ServerMessage::UserReconnected { peer_id },
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    rooms: HashMap<String, Room>,
    member_rooms: HashMap<MemberId, String>,
}

impl RegistryInner {
    fn admit(
        &mut self,
        room_id: &str,
        member: &MemberHandle,
        request: Request,
    ) -> Result<Admission, RoomError> {
        let admission = match self.rooms.get(room_id) {
            None => match request {
                Request::Create => Admission::Created,
                Request::Join => return Err(RoomError::RoomNotFound(room_id.to_string())),
                Request::Reconnect => {
                    return Err(RoomError::ReconnectionFailed(room_id.to_string()));
                }
            },
            Some(room) if room.contains(member.id()) => return Ok(Admission::AlreadyMember),
            Some(room) if room.is_full() => {
                return Err(match request {
                    Request::Reconnect => RoomError::ReconnectionFailed(room_id.to_string()),
                    _ => RoomError::RoomFull(room_id.to_string()),
                });
            }
            Some(_) => Admission::Admitted,
        };

        // A handle belongs to at most one room
        let previous = self.member_rooms.get(member.id()).cloned();
        if previous.is_some_and(|prev| prev != room_id) {
            self.remove_member(member.id());
        }

        match admission {
            Admission::Created => {
                self.rooms
                    .insert(room_id.to_string(), Room::new(member.clone()));
            }
            _ => {
                if let Some(room) = self.rooms.get_mut(room_id) {
                    room.notify_others(member.id(), &request.peer_notice(member.id()));
                    room.members.push(member.clone());
                }
            }
        }
        self.member_rooms
            .insert(member.id().to_string(), room_id.to_string());
        Ok(admission)
    }

    fn remove_member(&mut self, member_id: &str) -> Option<Departure> {
        let room_id = self.member_rooms.remove(member_id)?;
        let remaining = {
            let room = self.rooms.get_mut(&room_id)?;
            room.members.retain(|m| m.id() != member_id);
            room.members.len()
        };

        if remaining == 0 {
            self.rooms.remove(&room_id);
            tracing::info!("Room {} closed (last member {} left)", room_id, member_id);
            return Some(Departure::RoomClosed { room_id });
        }

        if let Some(room) = self.rooms.get(&room_id) {
            room.notify_others(
                member_id,
                &ServerMessage::UserDisconnected {
                    peer_id: member_id.to_string(),
                },
            );
        }
        tracing::info!(
            "Member {} left room {} ({} remaining)",
            member_id,
            room_id,
            remaining
        );
        Some(Departure::Left { room_id, remaining })
    }
}

/// Shared registry of rooms, owned by the rendezvous server state
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<RegistryInner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `room_id` with `member`, or add `member` to it if a slot is free.
    /// Confirms with `roomCreated` for a new room and `roomJoined` when the
    /// room already existed, or answers `roomFull`.
    pub async fn create(&self, room_id: &str, member: MemberHandle) -> Result<Admission, RoomError> {
        self.handle(room_id, member, Request::Create).await
    }

    /// Join an existing room. Confirms with `roomJoined` and tells the other
    /// member `otherUserJoined`; answers `roomNotFound` or `roomFull` otherwise.
    pub async fn join(&self, room_id: &str, member: MemberHandle) -> Result<Admission, RoomError> {
        self.handle(room_id, member, Request::Join).await
    }

    /// Re-admit a participant under a fresh handle after a lost connection
    pub async fn reconnect(
        &self,
        room_id: &str,
        member: MemberHandle,
    ) -> Result<Admission, RoomError> {
        self.handle(room_id, member, Request::Reconnect).await
    }

    async fn handle(
        &self,
        room_id: &str,
        member: MemberHandle,
        request: Request,
    ) -> Result<Admission, RoomError> {
        let mut inner = self.inner.write().await;
        let result = inner.admit(room_id, &member, request);
        member.notify(request.reply(room_id, &result));

        match &result {
            Ok(admission) => tracing::info!(
                "Member {} {:?} room {} via {:?}",
                member.id(),
                admission,
                room_id,
                request
            ),
            Err(e) => tracing::info!("Member {} refused: {}", member.id(), e),
        }
        result
    }

    /// Forward `payload` untouched to the other member(s) of `room_id`.
    /// Returns the number of recipients; zero when `from` is not a member.
    pub async fn relay(&self, room_id: &str, from: &str, payload: Value) -> usize {
        let inner = self.inner.read().await;
        let Some(room) = inner.rooms.get(room_id) else {
            tracing::debug!("Relay from {} to missing room {}", from, room_id);
            return 0;
        };
        if !room.contains(from) {
            tracing::debug!("Relay from non-member {} to room {}", from, room_id);
            return 0;
        }

        room.notify_others(
            from,
            &ServerMessage::Relay {
                room_id: room_id.to_string(),
                from: from.to_string(),
                payload,
            },
        )
    }

    /// Remove `member_id` from whichever room holds it
    pub async fn leave(&self, member_id: &str) -> Option<Departure> {
        self.inner.write().await.remove_member(member_id)
    }

    pub async fn room_size(&self, room_id: &str) -> Option<usize> {
        self.inner
            .read()
            .await
            .rooms
            .get(room_id)
            .map(|room| room.members.len())
    }

    pub async fn room_of(&self, member_id: &str) -> Option<String> {
        self.inner.read().await.member_rooms.get(member_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    pub async fn snapshot(&self, room_id: &str) -> Option<RoomSnapshot> {
        let inner = self.inner.read().await;
        inner.rooms.get(room_id).map(|room| RoomSnapshot {
            room_id: room_id.to_string(),
            members: room.members.iter().map(|m| m.id().to_string()).collect(),
            created_at: room.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn member(id: &str) -> (MemberHandle, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MemberHandle::new(id, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_pairing_scenario() {
        let registry = RoomRegistry::new();
        let (a, mut a_rx) = member("a");
        let (b, mut b_rx) = member("b");
        let (c, mut c_rx) = member("c");

        assert_eq!(registry.create("4821", a).await, Ok(Admission::Created));
        assert_eq!(registry.join("4821", b).await, Ok(Admission::Admitted));
        assert_eq!(
            registry.join("4821", c).await,
            Err(RoomError::RoomFull("4821".to_string()))
        );

        assert_eq!(
            drain(&mut a_rx),
            vec![
                ServerMessage::RoomCreated {
                    room_id: "4821".to_string()
                },
                ServerMessage::OtherUserJoined {
                    peer_id: "b".to_string()
                },
            ]
        );
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerMessage::RoomJoined {
                room_id: "4821".to_string()
            }]
        );
        assert_eq!(
            drain(&mut c_rx),
            vec![ServerMessage::RoomFull {
                room_id: "4821".to_string()
            }]
        );
        assert_eq!(registry.room_size("4821").await, Some(2));
    }

    #[tokio::test]
    async fn test_second_create_is_confirmed_as_join() {
        let registry = RoomRegistry::new();
        let (a, mut a_rx) = member("a");
        let (b, mut b_rx) = member("b");

        assert_eq!(registry.create("7777", a).await, Ok(Admission::Created));
        assert_eq!(registry.create("7777", b.clone()).await, Ok(Admission::Admitted));
        assert_eq!(
            drain(&mut a_rx),
            vec![
                ServerMessage::RoomCreated {
                    room_id: "7777".to_string()
                },
                ServerMessage::OtherUserJoined {
                    peer_id: "b".to_string()
                },
            ]
        );
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerMessage::RoomJoined {
                room_id: "7777".to_string()
            }]
        );

        // Repeating the request changes nothing
        assert_eq!(registry.create("7777", b).await, Ok(Admission::AlreadyMember));
        assert_eq!(registry.room_size("7777").await, Some(2));
    }

    #[tokio::test]
    async fn test_concurrent_joins_admit_exactly_one() {
        let registry = Arc::new(RoomRegistry::new());
        let (owner, _owner_rx) = member("owner");
        registry.create("race", owner).await.unwrap();

        let mut handles = vec![];
        let mut receivers = vec![];
        for i in 0..20 {
            let (joiner, rx) = member(&format!("joiner-{i}"));
            receivers.push(rx);
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.join("race", joiner).await
            }));
        }

        let mut admitted = 0;
        let mut full = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(RoomError::RoomFull(_)) => full += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(admitted, 1);
        assert_eq!(full, 19);
        assert_eq!(registry.room_size("race").await, Some(ROOM_CAPACITY));
    }

    #[tokio::test]
    async fn test_concurrent_creates_never_exceed_capacity() {
        let registry = Arc::new(RoomRegistry::new());
        let mut handles = vec![];
        let mut receivers = vec![];
        for i in 0..10 {
            let (m, rx) = member(&format!("m{i}"));
            receivers.push(rx);
            let registry = registry.clone();
            handles.push(tokio::spawn(async move { registry.create("fresh", m).await }));
        }

        let ok = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| r.as_ref().unwrap().is_ok())
            .count();
        assert_eq!(ok, 2);
        assert_eq!(registry.room_size("fresh").await, Some(2));
    }

    #[tokio::test]
    async fn test_leave_transitions() {
        let registry = RoomRegistry::new();
        let (a, mut a_rx) = member("a");
        let (b, _b_rx) = member("b");
        registry.create("r", a).await.unwrap();
        registry.join("r", b).await.unwrap();
        drain(&mut a_rx);

        assert_eq!(
            registry.leave("b").await,
            Some(Departure::Left {
                room_id: "r".to_string(),
                remaining: 1
            })
        );
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerMessage::UserDisconnected {
                peer_id: "b".to_string()
            }]
        );
        assert_eq!(registry.room_size("r").await, Some(1));

        assert_eq!(
            registry.leave("a").await,
            Some(Departure::RoomClosed {
                room_id: "r".to_string()
            })
        );
        assert_eq!(registry.room_count().await, 0);

        let (late, _late_rx) = member("late");
        assert_eq!(
            registry.join("r", late).await,
            Err(RoomError::RoomNotFound("r".to_string()))
        );
        assert_eq!(registry.leave("a").await, None);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_for_same_handle() {
        let registry = RoomRegistry::new();
        let (a, mut a_rx) = member("a");
        registry.create("r", a.clone()).await.unwrap();
        assert_eq!(registry.create("r", a.clone()).await, Ok(Admission::AlreadyMember));
        assert_eq!(registry.join("r", a).await, Ok(Admission::AlreadyMember));
        assert_eq!(registry.room_size("r").await, Some(1));
        assert_eq!(drain(&mut a_rx).len(), 3);
    }

    #[tokio::test]
    async fn test_reconnect_under_fresh_handle() {
        let registry = RoomRegistry::new();
        let (a, mut a_rx) = member("a");
        let (b, _b_rx) = member("b");
        registry.create("r", a).await.unwrap();
        registry.join("r", b).await.unwrap();
        registry.leave("b").await;
        drain(&mut a_rx);

        let (b2, mut b2_rx) = member("b2");
        assert_eq!(registry.reconnect("r", b2).await, Ok(Admission::Admitted));
        assert_eq!(
            drain(&mut b2_rx),
            vec![ServerMessage::ReconnectedToRoom {
                room_id: "r".to_string()
            }]
        );
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerMessage::UserReconnected {
                peer_id: "b2".to_string()
            }]
        );

        let (intruder, mut intruder_rx) = member("x");
        assert_eq!(
            registry.reconnect("r", intruder).await,
            Err(RoomError::ReconnectionFailed("r".to_string()))
        );
        assert_eq!(
            drain(&mut intruder_rx),
            vec![ServerMessage::ReconnectionFailed {
                room_id: "r".to_string()
            }]
        );

        let (lost, _lost_rx) = member("lost");
        assert!(registry.reconnect("missing", lost).await.is_err());
    }

    #[tokio::test]
    async fn test_relay_only_from_members() {
        let registry = RoomRegistry::new();
        let (a, mut a_rx) = member("a");
        let (b, mut b_rx) = member("b");
        registry.create("r", a).await.unwrap();
        registry.join("r", b).await.unwrap();
        drain(&mut a_rx);
        drain(&mut b_rx);

        let payload = json!({"kind": "offer", "addr": "127.0.0.1:9"});
        assert_eq!(registry.relay("r", "a", payload.clone()).await, 1);
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerMessage::Relay {
                room_id: "r".to_string(),
                from: "a".to_string(),
                payload: payload.clone(),
            }]
        );
        assert!(drain(&mut a_rx).is_empty());

        assert_eq!(registry.relay("r", "stranger", payload.clone()).await, 0);
        assert_eq!(registry.relay("nope", "a", payload).await, 0);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_member_moves_between_rooms() {
        let registry = RoomRegistry::new();
        let (a, _a_rx) = member("a");
        let (b, mut b_rx) = member("b");
        registry.create("first", b.clone()).await.unwrap();
        registry.join("first", a.clone()).await.unwrap();
        drain(&mut b_rx);

        registry.create("second", a).await.unwrap();
        assert_eq!(registry.room_of("a").await.as_deref(), Some("second"));
        assert_eq!(registry.room_size("first").await, Some(1));
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerMessage::UserDisconnected {
                peer_id: "a".to_string()
            }]
        );
        let snapshot = registry.snapshot("first").await.unwrap();
        assert_eq!(snapshot.members, vec!["b".to_string()]);
    }
}
