//! Ring / accept / busy / end handshake that precedes WebRTC negotiation.

pub mod push;

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use time::{Duration, OffsetDateTime};

use crate::{
    clock::SharedClock,
    db::Db,
    error::{SignalError, SignalResult},
    gateway::events::ServerEvent,
    presence::{ConnectionId, Registry, RoomId},
};

use push::{PushNotifier, WakePayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Accepted,
    Busy,
    TimedOut,
    Ended,
}

/// Who is being rung.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallTarget {
    Room,
    Peer(ConnectionId),
}

impl From<Option<ConnectionId>> for CallTarget {
    fn from(target: Option<ConnectionId>) -> Self {
        target.map_or(CallTarget::Room, CallTarget::Peer)
    }
}

type SessionKey = (ConnectionId, CallTarget);

#[derive(Debug, Clone)]
pub struct CallSession {
    pub room: RoomId,
    pub initiator: ConnectionId,
    pub target: CallTarget,
    pub state: CallState,
    pub started_at: OffsetDateTime,
    /// The connection that accepted or declined.
    pub answered_by: Option<ConnectionId>,
}

impl CallSession {
    fn rings(&self, id: ConnectionId) -> bool {
        id != self.initiator
            && match self.target {
                CallTarget::Room => true,
                CallTarget::Peer(peer) => peer == id,
            }
    }

    /// True when `id` is on the other end of this call.
    fn involves(&self, id: ConnectionId) -> bool {
        match self.answered_by {
            Some(answerer) => answerer == id,
            None => self.rings(id),
        }
    }

    /// True when `id` is this call's one counterpart rather than one of many
    /// rung devices.
    fn pinned_to(&self, id: ConnectionId) -> bool {
        self.answered_by == Some(id) || self.target == CallTarget::Peer(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ring {
    /// Live connections the request was handed to.
    pub delivered: usize,
    /// Wake pushes dispatched.
    pub pushes: usize,
}

/// Sessions are keyed by initiator and target. A fresh request for the same
/// pair replaces the old session; any other pair is independent, so one
/// initiator may ring several peers and the room at once.
pub struct CallController {
    sessions: Mutex<HashMap<SessionKey, CallSession>>,
    registry: Arc<Registry>,
    db: Db,
    notifier: Arc<dyn PushNotifier>,
    clock: SharedClock,
    ring_timeout: Duration,
}

impl CallController {
    pub fn new(
        registry: Arc<Registry>,
        db: Db,
        notifier: Arc<dyn PushNotifier>,
        clock: SharedClock,
        ring_timeout_seconds: u64,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            registry,
            db,
            notifier,
            clock,
            ring_timeout: Duration::seconds(ring_timeout_seconds as i64),
        }
    }

    pub async fn request_call(
        &self,
        initiator: ConnectionId,
        room: &str,
        target: Option<ConnectionId>,
    ) -> SignalResult<Ring> {
        let Some((_, sender)) = self.registry.membership(initiator).filter(|(r, _)| r == room) else {
            return Err(SignalError::Unauthorized(format!("not a member of room {room}")));
        };
        if target == Some(initiator) {
            return Err(SignalError::Validation("cannot call yourself".into()));
        }

        let session = CallSession {
            room: room.to_owned(),
            initiator,
            target: target.into(),
            state: CallState::Ringing,
            started_at: self.clock.now(),
            answered_by: None,
        };
        self.sessions.lock().insert((initiator, session.target), session);

        let event = ServerEvent::CallRequest {
            sender_id: initiator,
            room: room.to_owned(),
        };
        let delivered = match target {
            Some(peer) if self.registry.room_of(peer).as_deref() == Some(room) => {
                usize::from(self.registry.send_to(peer, event))
            }
            Some(_) => 0,
            None => self.registry.broadcast(room, &event, Some(initiator)),
        };

        let tokens = self.wake_tokens(room, target, sender.push_token.as_deref()).await;
        let payload = WakePayload::call_request(initiator, room);
        for token in &tokens {
            let notifier = self.notifier.clone();
            let token = token.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&token, &payload).await {
                    tracing::warn!(room = %payload.room_id, error = %e, "wake push failed");
                }
            });
        }

        tracing::info!(conn_id = %initiator, room, delivered, pushes = tokens.len(), "ringing");
        Ok(Ring {
            delivered,
            pushes: tokens.len(),
        })
    }

    /// Push tokens to wake for a ring: the target's own token for a targeted
    /// call, otherwise every token ever registered in the room plus those of
    /// live members. The caller's own token is never included.
    async fn wake_tokens(
        &self,
        room: &str,
        target: Option<ConnectionId>,
        own_token: Option<&str>,
    ) -> Vec<String> {
        let mut tokens: Vec<String> = match target {
            Some(peer) => self
                .registry
                .member(peer)
                .and_then(|m| m.push_token)
                .into_iter()
                .collect(),
            None => {
                let mut tokens: Vec<String> = self
                    .registry
                    .list_members(room)
                    .into_iter()
                    .filter_map(|m| m.push_token)
                    .collect();
                match self.db.push_tokens(room).await {
                    Ok(stored) => tokens.extend(stored.into_iter().map(|t| t.token)),
                    Err(e) => tracing::error!(room, error = %e, "could not read push tokens"),
                }
                tokens
            }
        };

        tokens.sort();
        tokens.dedup();
        tokens.retain(|t| Some(t.as_str()) != own_token);
        tokens
    }

    /// Looks up the ringing session of `initiator` that `answerer` may answer.
    fn answer(
        &self,
        initiator: ConnectionId,
        answerer: ConnectionId,
        next: CallState,
    ) -> SignalResult<()> {
        let mut sessions = self.sessions.lock();
        // a ring aimed at the answerer wins over a room ring, a ringing one over a settled one
        let keys: Vec<SessionKey> = [CallTarget::Peer(answerer), CallTarget::Room]
            .into_iter()
            .map(|target| (initiator, target))
            .filter(|key| sessions.contains_key(key))
            .collect();
        let key = keys
            .iter()
            .find(|key| sessions.get(*key).is_some_and(|s| s.state == CallState::Ringing))
            .or(keys.first())
            .copied();
        let Some(session) = key.and_then(|key| sessions.get_mut(&key)) else {
            return Err(SignalError::NotFound("call".into()));
        };

        if !session.rings(answerer)
            || self.registry.room_of(answerer).as_deref() != Some(session.room.as_str())
        {
            return Err(SignalError::Unauthorized("this call is not ringing you".into()));
        }
        if session.state == CallState::Ringing
            && self.clock.now() - session.started_at >= self.ring_timeout
        {
            session.state = CallState::TimedOut;
        }
        match session.state {
            CallState::Ringing => {}
            CallState::TimedOut => return Err(SignalError::Expired),
            _ => return Err(SignalError::Conflict("call already answered".into())),
        }

        session.state = next;
        session.answered_by = Some(answerer);
        Ok(())
    }

    pub fn accept_call(&self, initiator: ConnectionId, accepter: ConnectionId) -> SignalResult<()> {
        self.answer(initiator, accepter, CallState::Accepted)?;
        tracing::info!(conn_id = %accepter, initiator = %initiator, "call accepted");
        self.registry
            .send_to(initiator, ServerEvent::CallAccept { sender_id: accepter });
        Ok(())
    }

    pub fn decline_busy(&self, initiator: ConnectionId, decliner: ConnectionId) -> SignalResult<()> {
        self.answer(initiator, decliner, CallState::Busy)?;
        tracing::info!(conn_id = %decliner, initiator = %initiator, "call declined busy");
        self.registry
            .send_to(initiator, ServerEvent::CallBusy { sender_id: decliner });
        Ok(())
    }

    /// Ends the call between `sender` and `target`, whichever of them started
    /// it. Returns whether a session was ended; ending a call that no longer
    /// exists is a no-op.
    pub fn end_call(&self, sender: ConnectionId, target: ConnectionId) -> bool {
        let ended = {
            let mut sessions = self.sessions.lock();
            let between: Vec<(SessionKey, bool)> = sessions
                .iter()
                .filter_map(|(key, s)| {
                    let other = match key.0 {
                        id if id == sender => target,
                        id if id == target => sender,
                        _ => return None,
                    };
                    s.involves(other).then(|| (*key, s.pinned_to(other)))
                })
                .collect();

            // a room ring only goes when nothing more specific links the two
            let pinned = between.iter().any(|(_, pinned)| *pinned);
            between
                .into_iter()
                .filter(|(_, p)| *p || !pinned)
                .filter_map(|(key, _)| sessions.remove(&key))
                .collect::<Vec<_>>()
        };

        if ended.is_empty() {
            tracing::debug!(conn_id = %sender, target = %target, "end-call for no active call");
            return false;
        }

        self.registry
            .send_to(target, ServerEvent::EndCall { sender_id: sender });
        for session in &ended {
            tracing::info!(conn_id = %sender, target = %target, room = %session.room, "call ended");
        }
        true
    }

    /// Current state of the call `initiator` placed to `target` (`None` for
    /// the room), timeouts applied.
    pub fn state(&self, initiator: ConnectionId, target: Option<ConnectionId>) -> Option<CallState> {
        let sessions = self.sessions.lock();
        let session = sessions.get(&(initiator, target.into()))?;
        if session.state == CallState::Ringing
            && self.clock.now() - session.started_at >= self.ring_timeout
        {
            return Some(CallState::TimedOut);
        }
        Some(session.state)
    }

    /// Forgets every call a departed connection placed or was pinned to. The
    /// other side of an accepted call is told it ended.
    pub fn drop_connection(&self, id: ConnectionId) {
        let dropped: Vec<CallSession> = {
            let mut sessions = self.sessions.lock();
            let keys: Vec<SessionKey> = sessions
                .iter()
                .filter(|(key, s)| key.0 == id || s.pinned_to(id))
                .map(|(key, _)| *key)
                .collect();
            keys.iter().filter_map(|key| sessions.remove(key)).collect()
        };

        for session in dropped {
            if session.state == CallState::Accepted {
                let other = if session.initiator == id {
                    session.answered_by
                } else {
                    Some(session.initiator)
                };
                if let Some(other) = other {
                    self.registry.send_to(other, ServerEvent::EndCall { sender_id: id });
                }
            }
            tracing::debug!(conn_id = %id, room = %session.room, "discarded call of departed connection");
        }
    }
}
