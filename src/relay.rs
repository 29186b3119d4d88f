//! Forwarding of WebRTC negotiation messages.
//!
//! Delivery is best effort. A message for a connection that has already gone
//! is dropped: the peers' own negotiation times out and retries, which is
//! where that responsibility lives.

use std::sync::Arc;

use crate::{
    error::{SignalError, SignalResult},
    gateway::events::{Relayed, ServerEvent, SignalEnvelope},
    presence::{ConnectionId, Registry},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    fn event(self, relayed: Relayed) -> ServerEvent {
        match self {
            SignalKind::Offer => ServerEvent::Offer(relayed),
            SignalKind::Answer => ServerEvent::Answer(relayed),
            SignalKind::Candidate => ServerEvent::Candidate(relayed),
        }
    }
}

#[derive(Clone)]
pub struct Relay {
    registry: Arc<Registry>,
}

impl Relay {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Forwards to `target_id` when present, otherwise to everyone else in
    /// `room`. Either way the sender must be in that room. Returns how many
    /// connections it was handed to.
    pub fn relay(
        &self,
        sender: ConnectionId,
        kind: SignalKind,
        SignalEnvelope { target_id, room, payload }: SignalEnvelope,
    ) -> SignalResult<usize> {
        let event = kind.event(Relayed {
            sender_id: sender,
            target_id,
            room: room.clone(),
            payload,
        });

        if let Some(target) = target_id {
            let Some(own_room) = self.registry.room_of(sender) else {
                return Err(SignalError::Unauthorized("join a room before signaling".into()));
            };
            let delivered = match self.registry.room_of(target) {
                Some(target_room) if target_room == own_room => self.registry.send_to(target, event),
                Some(_) => {
                    return Err(SignalError::Unauthorized("target is in another room".into()));
                }
                None => false,
            };
            if !delivered {
                tracing::debug!(conn_id = %sender, target = %target, ?kind, "target gone, dropped");
            }
            return Ok(usize::from(delivered));
        }

        let Some(room) = room else {
            return Err(SignalError::Validation(format!("{kind:?} needs targetId or room")));
        };
        if self.registry.room_of(sender).as_deref() != Some(room.as_str()) {
            return Err(SignalError::Unauthorized(format!("not a member of room {room}")));
        }
        Ok(self.registry.broadcast(&room, &event, Some(sender)))
    }
}
