//! Device session actor
//!
//! One `Session` per device session owns the transport, the presence
//! protocol, and the replication engine. Everything is driven from a
//! single `tokio::select!` loop over commands, verified inbound
//! envelopes, and the heartbeat interval, so handler runs are atomic
//! with respect to session state: no await spans a read-modify-write.
//!
//! Callers talk to the actor through the clonable [`SessionHandle`]
//! (request/response commands over mpsc + oneshot) and observe it
//! through the typed [`SessionEvent`] stream.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core_presence::{PeerRecord, Presence, PresenceAction};
use crate::core_replication::{MergeOutcome, OrderStats, ReplicationEngine};
use crate::core_store::{StoreError, StoreHandle, UserProfile};
use crate::core_transport::{
    select_transport, BroadcastBus, LinkState, Transport, TransportError,
};
use crate::core_wire::{
    now_ms, DeviceId, Envelope, MessageBody, OrderRecord, PeerInfo, Role, RosterEntry, TeamUpdate,
};
use crate::metrics::record_counter;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is no longer running")]
    Closed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Whether this session is syncing with peers or running alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Synced,
    /// No transport primitive was available; local state only.
    LocalOnly,
}

/// Notifications pushed to the application.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerJoined(PeerRecord),
    PeerLeft(PeerRecord),
    ConnectionChanged(LinkState),
    OrderReceived(OrderRecord),
    OrderUpdated(OrderRecord),
    TeamUpdated(Vec<RosterEntry>),
    SyncMode(SyncMode),
}

enum SessionCommand {
    PublishOrder {
        text: String,
        items: Vec<String>,
        reply: oneshot::Sender<Result<OrderRecord, SessionError>>,
    },
    CompleteOrder {
        id: u64,
        reply: oneshot::Sender<Result<Option<OrderRecord>, SessionError>>,
    },
    ReplaceRoster {
        roster: Vec<RosterEntry>,
        reply: oneshot::Sender<Result<Vec<RosterEntry>, SessionError>>,
    },
    UpsertMember {
        member: RosterEntry,
        reply: oneshot::Sender<Result<Vec<RosterEntry>, SessionError>>,
    },
    ClearOrders {
        reply: oneshot::Sender<Result<usize, SessionError>>,
    },
    Announce {
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Orders {
        reply: oneshot::Sender<Vec<OrderRecord>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerRecord>>,
    },
    Roster {
        reply: oneshot::Sender<Vec<RosterEntry>>,
    },
    Stats {
        reply: oneshot::Sender<OrderStats>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Clonable front door to a running session actor.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    device_id: DeviceId,
}

impl SessionHandle {
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub async fn publish_order(
        &self,
        text: impl Into<String>,
        items: Vec<String>,
    ) -> Result<OrderRecord, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::PublishOrder {
                text: text.into(),
                items,
                reply,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Mark an order completed and replicate the update. Returns `None`
    /// when the id is unknown or the order was already completed.
    pub async fn complete_order(&self, id: u64) -> Result<Option<OrderRecord>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::CompleteOrder { id, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn replace_roster(
        &self,
        roster: Vec<RosterEntry>,
    ) -> Result<Vec<RosterEntry>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::ReplaceRoster { roster, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn upsert_member(
        &self,
        member: RosterEntry,
    ) -> Result<Vec<RosterEntry>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::UpsertMember { member, reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Wipe the local order history (manager action). Clears this
    /// device only; peers keep their logs.
    pub async fn clear_orders(&self) -> Result<usize, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::ClearOrders { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Re-announce this device to the mesh.
    pub async fn announce(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Announce { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn orders(&self) -> Result<Vec<OrderRecord>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Orders { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn peers(&self) -> Result<Vec<PeerRecord>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Peers { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn roster(&self) -> Result<Vec<RosterEntry>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Roster { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn stats(&self) -> Result<OrderStats, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Stats { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Say Goodbye, tear the transport down, and stop the actor.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Disconnect { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

pub struct Session {
    config: Config,
    device_id: DeviceId,
    profile: UserProfile,
    store: StoreHandle,
    transport: Option<Arc<dyn Transport>>,
    presence: Presence,
    engine: ReplicationEngine,
    events: mpsc::Sender<SessionEvent>,
}

impl Session {
    /// Start a session on the best available same-device transport.
    ///
    /// When neither the broadcast bus nor a store change feed is
    /// available the session still starts, in local-only mode, and says
    /// so through a [`SessionEvent::SyncMode`] event.
    pub async fn connect(
        config: Config,
        store: StoreHandle,
        bus: Option<&BroadcastBus>,
        profile: Option<UserProfile>,
    ) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>), SessionError> {
        let device_id = store.device_id().await?;
        let transport = match select_transport(bus, &store, &device_id, &config) {
            Ok(transport) => Some(transport),
            Err(TransportError::Unavailable) => None,
            Err(e) => return Err(e.into()),
        };
        Self::spawn(config, store, transport, profile, device_id).await
    }

    /// Start a session on an already-established transport, typically a
    /// signaled data channel.
    pub async fn connect_with_transport(
        config: Config,
        store: StoreHandle,
        transport: Arc<dyn Transport>,
        profile: Option<UserProfile>,
    ) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>), SessionError> {
        let device_id = store.device_id().await?;
        Self::spawn(config, store, Some(transport), profile, device_id).await
    }

    async fn spawn(
        config: Config,
        store: StoreHandle,
        transport: Option<Arc<dyn Transport>>,
        profile: Option<UserProfile>,
        device_id: DeviceId,
    ) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>), SessionError> {
        // Resolve the signed-in profile: explicit beats stored beats a
        // generated placeholder.
        let profile = match profile {
            Some(profile) => {
                store.save_user(&profile).await?;
                profile
            }
            None => match store.user().await? {
                Some(profile) => profile,
                None => UserProfile {
                    display_name: format!("Device-{}", &device_id.as_str()[..13.min(device_id.as_str().len())]),
                    role: Role::Barista,
                },
            },
        };

        let mut engine = ReplicationEngine::new(device_id.clone());
        engine.seed(store.orders().await?, store.team().await?);

        let (command_tx, command_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);

        let inbound = match &transport {
            Some(transport) => Some(transport.take_incoming()?),
            None => None,
        };
        let state_rx = transport.as_ref().map(|t| t.watch_state());

        info!(
            device = %device_id,
            name = %profile.display_name,
            role = %profile.role,
            transport = transport.as_ref().map(|t| t.name()).unwrap_or("none"),
            orders = engine.orders().len(),
            "session starting"
        );

        let session = Session {
            config,
            device_id: device_id.clone(),
            profile,
            store,
            transport,
            presence: Presence::new(device_id.clone()),
            engine,
            events: event_tx,
        };
        tokio::spawn(session.run(command_rx, inbound, state_rx));

        Ok((
            SessionHandle {
                commands: command_tx,
                device_id,
            },
            event_rx,
        ))
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        inbound: Option<mpsc::Receiver<Envelope>>,
        state_rx: Option<watch::Receiver<LinkState>>,
    ) {
        let synced = self.transport.is_some();
        // Park disabled branches on channels that never yield.
        let mut inbound = inbound.unwrap_or_else(|| mpsc::channel(1).1);
        let mut state_rx = state_rx.unwrap_or_else(|| watch::channel(LinkState::Open).1);

        let mut heartbeat = tokio::time::interval(self.config.presence.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Consume the immediate first tick; announce covers startup.
        heartbeat.tick().await;

        if synced {
            self.send_announce().await;
        } else {
            warn!("no transport available, running local-only");
            self.emit(SessionEvent::SyncMode(SyncMode::LocalOnly)).await;
        }

        loop {
            tokio::select! {
                maybe_cmd = commands.recv() => {
                    let Some(cmd) = maybe_cmd else { break };
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Some(envelope) = inbound.recv(), if synced => {
                    self.handle_envelope(envelope).await;
                }
                _ = heartbeat.tick(), if synced => {
                    self.heartbeat_tick().await;
                }
                Ok(()) = state_rx.changed(), if synced => {
                    let state = *state_rx.borrow_and_update();
                    debug!(?state, "transport state changed");
                    if state == LinkState::Open {
                        // Fresh link: make ourselves known again.
                        self.send_announce().await;
                    }
                    self.emit(SessionEvent::ConnectionChanged(state)).await;
                }
            }
        }
        debug!(device = %self.device_id, "session actor stopped");
    }

    /// Returns true when the actor must stop.
    async fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::PublishOrder { text, items, reply } => {
                let order =
                    self.engine
                        .create_order(text, items, self.profile.display_name.clone(), now_ms());
                self.persist_orders().await;
                self.broadcast(MessageBody::Order(order.clone())).await;
                let _ = reply.send(Ok(order));
            }
            SessionCommand::CompleteOrder { id, reply } => {
                let updated =
                    self.engine
                        .complete_order(id, self.profile.display_name.clone(), now_ms());
                if let Some(order) = &updated {
                    self.persist_orders().await;
                    self.broadcast(MessageBody::OrderUpdate(order.clone())).await;
                }
                let _ = reply.send(Ok(updated));
            }
            SessionCommand::ReplaceRoster { roster, reply } => {
                let roster = self.engine.replace_roster(roster);
                self.persist_team().await;
                self.broadcast(MessageBody::TeamUpdate(TeamUpdate::ReplaceRoster {
                    roster: roster.clone(),
                }))
                .await;
                self.emit(SessionEvent::TeamUpdated(roster.clone())).await;
                let _ = reply.send(Ok(roster));
            }
            SessionCommand::UpsertMember { member, reply } => {
                let member_id = member.id.clone();
                let roster = self.engine.upsert_member(member);
                self.persist_team().await;
                // Broadcast the entry as the engine settled it (origin
                // flag included).
                if let Some(member) = roster.iter().find(|m| m.id == member_id).cloned() {
                    self.broadcast(MessageBody::TeamUpdate(TeamUpdate::UpsertMember { member }))
                        .await;
                }
                self.emit(SessionEvent::TeamUpdated(roster.clone())).await;
                let _ = reply.send(Ok(roster));
            }
            SessionCommand::ClearOrders { reply } => {
                let cleared = self.engine.clear_orders();
                if let Err(e) = self.store.clear_orders().await {
                    warn!(error = %e, "failed to clear persisted orders");
                    let _ = reply.send(Err(e.into()));
                } else {
                    info!(cleared, "order history cleared");
                    let _ = reply.send(Ok(cleared));
                }
            }
            SessionCommand::Announce { reply } => {
                self.send_announce().await;
                let _ = reply.send(Ok(()));
            }
            SessionCommand::Orders { reply } => {
                let _ = reply.send(self.engine.orders().to_vec());
            }
            SessionCommand::Peers { reply } => {
                let _ = reply.send(self.presence.peers());
            }
            SessionCommand::Roster { reply } => {
                let _ = reply.send(self.engine.roster().to_vec());
            }
            SessionCommand::Stats { reply } => {
                let _ = reply.send(self.engine.stats());
            }
            SessionCommand::Disconnect { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.body {
            MessageBody::Announce(info) => {
                let actions = self.presence.handle_announce(&info, now_ms());
                self.apply_presence_actions(actions).await;
            }
            MessageBody::Beacon(info) => {
                let actions = self.presence.handle_beacon(&info, now_ms());
                self.apply_presence_actions(actions).await;
            }
            MessageBody::Heartbeat => {
                self.presence.handle_heartbeat(&envelope.sender_id, now_ms());
            }
            MessageBody::Goodbye => {
                let actions = self.presence.handle_goodbye(&envelope.sender_id);
                self.apply_presence_actions(actions).await;
            }
            MessageBody::Order(order) => {
                if let MergeOutcome::Inserted(order) = self.engine.merge_order(order) {
                    self.persist_orders().await;
                    self.emit(SessionEvent::OrderReceived(order)).await;
                }
            }
            MessageBody::OrderUpdate(order) => {
                if let Some(order) = self.engine.merge_update(order) {
                    self.persist_orders().await;
                    self.emit(SessionEvent::OrderUpdated(order)).await;
                }
            }
            MessageBody::TeamUpdate(update) => {
                let roster = self.engine.merge_team_update(update);
                self.persist_team().await;
                self.emit(SessionEvent::TeamUpdated(roster)).await;
            }
            MessageBody::Offer(_) | MessageBody::Answer(_) => {
                // Connection setup runs out-of-band through tokens, not
                // through an established session.
                debug!(sender = %envelope.sender_id, "ignoring in-band signaling message");
            }
        }
    }

    async fn apply_presence_actions(&mut self, actions: Vec<PresenceAction>) {
        for action in actions {
            match action {
                PresenceAction::PeerJoined(record) => {
                    self.backfill_orders().await;
                    self.emit(SessionEvent::PeerJoined(record)).await;
                }
                PresenceAction::PeerLeft(record) => {
                    self.emit(SessionEvent::PeerLeft(record)).await;
                }
                PresenceAction::ReplyAnnounce => {
                    self.send_announce().await;
                }
            }
        }
    }

    async fn heartbeat_tick(&mut self) {
        self.broadcast(MessageBody::Heartbeat).await;
        let actions = self
            .presence
            .sweep(now_ms(), self.config.presence.peer_timeout);
        self.apply_presence_actions(actions).await;
    }

    async fn send_announce(&mut self) {
        self.broadcast(MessageBody::Announce(self.local_info())).await;
    }

    /// Re-broadcast the full order log for a newly joined peer. Full and
    /// unbounded; the receiver absorbs everything it already has as
    /// duplicates.
    async fn backfill_orders(&mut self) {
        for order in self.engine.backfill() {
            self.broadcast(MessageBody::Order(order)).await;
        }
    }

    async fn broadcast(&self, body: MessageBody) {
        let Some(transport) = &self.transport else {
            return;
        };
        let envelope = Envelope::new(
            body,
            self.device_id.clone(),
            self.config.mesh.shared_secret.clone(),
            now_ms(),
        );
        match transport.send(&envelope).await {
            Ok(()) => {}
            Err(TransportError::ChannelNotOpen) => {
                record_counter("sync.messages.dropped.link", 1);
                debug!(kind = envelope.body.kind(), "dropped message, link not open");
            }
            Err(e) => {
                warn!(kind = envelope.body.kind(), error = %e, "send failed");
            }
        }
    }

    async fn persist_orders(&self) {
        if let Err(e) = self.store.save_orders(self.engine.orders()).await {
            warn!(error = %e, "failed to persist orders");
        }
    }

    async fn persist_team(&self) {
        if let Err(e) = self.store.save_team(self.engine.roster()).await {
            warn!(error = %e, "failed to persist roster");
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("event receiver dropped");
        }
    }

    fn local_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.device_id.clone(),
            display_name: self.profile.display_name.clone(),
            role: self.profile.role,
        }
    }

    /// Goodbye goes out before the transport comes down, so remote
    /// registries drop us immediately instead of waiting out the sweep.
    async fn shutdown(&mut self) {
        if let Some(transport) = &self.transport {
            let goodbye = Envelope::new(
                MessageBody::Goodbye,
                self.device_id.clone(),
                self.config.mesh.shared_secret.clone(),
                now_ms(),
            );
            if let Err(e) = transport.send(&goodbye).await {
                debug!(error = %e, "goodbye not sent");
            }
            transport.close().await;
        }
        self.presence.clear();
        self.emit(SessionEvent::ConnectionChanged(LinkState::Closed))
            .await;
        info!(device = %self.device_id, "session disconnected");
    }
}
