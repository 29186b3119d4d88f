//! Connection gateway: the one place sockets enter and leave.
//!
//! Each connection gets an id and an outbound queue on connect. Inbound
//! frames are parsed into [`ClientEvent`]s and dispatched to presence, calls
//! or the relay. `disconnect` is the cleanup hook and runs however the socket
//! ended.

pub mod events;
pub mod outbox;
pub mod ws;

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::{
    calls::{push::PushNotifier, CallController},
    clock::SharedClock,
    config::Config,
    db::Db,
    error::{SignalError, SignalResult},
    presence::{ConnectionId, Member, Registry},
    relay::{Relay, SignalKind},
};

use events::{ClientEvent, JoinRequest, ServerEvent};
use outbox::Outbox;

#[derive(Clone)]
pub struct Gateway {
    registry: Arc<Registry>,
    calls: Arc<CallController>,
    relay: Relay,
    outbox: Outbox,
    db: Db,
    clock: SharedClock,
}

impl Gateway {
    pub fn new(db: Db, notifier: Arc<dyn PushNotifier>, clock: SharedClock, config: &Config) -> Self {
        let outbox = Outbox::default();
        let registry = Arc::new(Registry::new(outbox.clone()));
        let calls = Arc::new(CallController::new(
            registry.clone(),
            db.clone(),
            notifier,
            clock.clone(),
            config.calls.ring_timeout_seconds,
        ));

        Self {
            relay: Relay::new(registry.clone()),
            registry,
            calls,
            outbox,
            db,
            clock,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn calls(&self) -> &CallController {
        &self.calls
    }

    pub fn connection_count(&self) -> usize {
        self.outbox.len()
    }

    pub fn connect(&self) -> (ConnectionId, UnboundedReceiver<ServerEvent>) {
        let id = ConnectionId::new();
        let rx = self.outbox.register(id);
        self.outbox.send(id, ServerEvent::Welcome { id });
        tracing::debug!(conn_id = %id, "connected");
        (id, rx)
    }

    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        self.registry.send_to(id, event)
    }

    pub fn broadcast(&self, room: &str, event: &ServerEvent, exclude: Option<ConnectionId>) -> usize {
        self.registry.broadcast(room, event, exclude)
    }

    pub async fn handle_text(&self, id: ConnectionId, text: &str) {
        match ClientEvent::parse(text) {
            Ok(event) => self.dispatch(id, event).await,
            Err(e) => self.reject(id, &e),
        }
    }

    /// Runs one inbound event. Failures go back to the sender as an `error`
    /// event; nothing here tears the connection down.
    pub async fn dispatch(&self, id: ConnectionId, event: ClientEvent) {
        if let Err(e) = self.try_dispatch(id, event).await {
            self.reject(id, &e);
        }
    }

    fn reject(&self, id: ConnectionId, err: &SignalError) {
        match err {
            SignalError::Store(_) => tracing::error!(conn_id = %id, error = %err, "event failed"),
            _ => tracing::debug!(conn_id = %id, error = %err, "event rejected"),
        }
        self.outbox.send(id, err.into());
    }

    async fn try_dispatch(&self, id: ConnectionId, event: ClientEvent) -> SignalResult<()> {
        match event {
            ClientEvent::Join(join) => self.join(id, join).await?,
            ClientEvent::Leave(_) => {
                self.calls.drop_connection(id);
                self.registry.leave(id);
            }
            ClientEvent::CallRequest(req) => {
                self.calls.request_call(id, &req.room, req.target_id).await?;
            }
            ClientEvent::CallAccept(reply) => self.calls.accept_call(reply.target_id, id)?,
            ClientEvent::CallBusy(reply) => self.calls.decline_busy(reply.target_id, id)?,
            ClientEvent::EndCall(reply) => {
                self.calls.end_call(id, reply.target_id);
            }
            ClientEvent::Offer(envelope) => {
                self.relay.relay(id, SignalKind::Offer, envelope)?;
            }
            ClientEvent::Answer(envelope) => {
                self.relay.relay(id, SignalKind::Answer, envelope)?;
            }
            ClientEvent::Candidate(envelope) => {
                self.relay.relay(id, SignalKind::Candidate, envelope)?;
            }
            ClientEvent::Ping(ping) => {
                let user_id = ping.user_id.or_else(|| self.registry.member(id).and_then(|m| m.user_id));
                if let Some(user_id) = user_id {
                    self.touch(user_id).await;
                }
                self.outbox.send(id, ServerEvent::Pong);
            }
        }
        Ok(())
    }

    async fn join(&self, id: ConnectionId, join: JoinRequest) -> SignalResult<()> {
        let JoinRequest { room, role, device_name, device_mode, push_token, user_id } = join;
        if room.trim().is_empty() {
            return Err(SignalError::missing("room"));
        }
        if device_name.trim().is_empty() {
            return Err(SignalError::missing("deviceName"));
        }

        let member = Member {
            id,
            role,
            device_name: device_name.clone(),
            device_mode,
            push_token: push_token.clone(),
            user_id,
        };
        let elders = self.registry.join(&room, member)?;

        if let Some(token) = push_token {
            let stored = self
                .db
                .upsert_push_token(&room, &token, &device_name, role.as_str(), self.clock.now())
                .await;
            if let Err(e) = stored {
                tracing::error!(conn_id = %id, room, error = %e, "could not store push token");
            }
        }
        if let Some(user_id) = user_id {
            self.touch(user_id).await;
        }
        if let Some(elders) = elders {
            self.outbox.send(id, ServerEvent::ElderList(elders));
        }
        Ok(())
    }

    async fn touch(&self, user_id: i64) {
        if let Err(e) = self.db.touch_last_seen(user_id, self.clock.now()).await {
            tracing::warn!(user_id, error = %e, "could not update last seen");
        }
    }

    /// Cleanup for a finished connection, clean close or not.
    pub async fn disconnect(&self, id: ConnectionId) {
        self.calls.drop_connection(id);
        if let Some((room, member)) = self.registry.leave(id) {
            if let Some(user_id) = member.user_id {
                self.touch(user_id).await;
            }
            tracing::debug!(conn_id = %id, room, "disconnected from room");
        }
        self.outbox.unregister(id);
        tracing::debug!(conn_id = %id, "disconnected");
    }
}
