//! The hub: single owner of the live connection set.
//!
//! All membership changes and every broadcast go through one request queue
//! and are applied by one task, in arrival order. Each member's outbound
//! queue sender lives only here, so removing a member is what closes its
//! queue. Fan-out uses `try_send`: a receiver whose queue is full is dropped
//! on the spot instead of stalling everyone else.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parlor_shared::envelope::{now_secs, Envelope};
use parlor_shared::UserId;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// An encoded envelope, shared by every queue it is fanned out to.
pub type Payload = Arc<str>;

/// Process-unique handle for one registered connection.
///
/// Distinct from [`UserId`]: two connections may present the same hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Hub is no longer running")]
    Closed,
}

/// What a connection gets back from [`HubHandle::register`].
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    /// Closed by the hub when the connection is removed.
    pub outbound: mpsc::Receiver<Payload>,
}

enum HubCommand {
    Register {
        id: ConnectionId,
        user_id: UserId,
        sender: mpsc::Sender<Payload>,
    },
    Unregister(ConnectionId),
    Broadcast(Payload),
}

struct Member {
    user_id: UserId,
    sender: mpsc::Sender<Payload>,
}

/// Read-only view of membership for out-of-band queries (stats).
/// Written only by the hub loop.
type Membership = Arc<RwLock<HashMap<ConnectionId, UserId>>>;

pub struct Hub {
    commands: mpsc::Receiver<HubCommand>,
    members: HashMap<ConnectionId, Member>,
    membership: Membership,
}

/// Cloneable entry point to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    membership: Membership,
    next_id: Arc<AtomicU64>,
    outbound_capacity: usize,
}

impl Hub {
    /// Build a hub and its handle. The hub does nothing until [`Hub::run`].
    ///
    /// `outbound_capacity` is the size of every connection's outbound queue,
    /// `queue_capacity` the size of the hub's own request queue.
    pub fn new(outbound_capacity: usize, queue_capacity: usize) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let membership: Membership = Arc::new(RwLock::new(HashMap::new()));

        let hub = Self {
            commands: rx,
            members: HashMap::new(),
            membership: membership.clone(),
        };
        let handle = HubHandle {
            commands: tx,
            membership,
            next_id: Arc::new(AtomicU64::new(1)),
            outbound_capacity,
        };
        (hub, handle)
    }

    /// Build a hub and run it on a background task.
    pub fn spawn(outbound_capacity: usize, queue_capacity: usize) -> HubHandle {
        let (hub, handle) = Self::new(outbound_capacity, queue_capacity);
        tokio::spawn(hub.run());
        handle
    }

    /// Process requests until every [`HubHandle`] is gone.
    pub async fn run(mut self) {
        info!("Hub started");
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Register {
                    id,
                    user_id,
                    sender,
                } => self.register(id, user_id, sender).await,
                HubCommand::Unregister(id) => self.unregister(id).await,
                HubCommand::Broadcast(payload) => self.broadcast(payload).await,
            }
        }
        info!(clients = self.members.len(), "Hub stopped");
    }

    async fn register(&mut self, id: ConnectionId, user_id: UserId, sender: mpsc::Sender<Payload>) {
        self.membership.write().await.insert(id, user_id.clone());
        self.members.insert(id, Member { user_id: user_id.clone(), sender });

        info!(
            conn = %id,
            user = %user_id,
            clients = self.members.len(),
            "Client connected"
        );

        if let Some(payload) = self.client_count_payload() {
            self.broadcast(payload).await;
        }
    }

    async fn unregister(&mut self, id: ConnectionId) {
        let Some(member) = self.remove(id).await else {
            debug!(conn = %id, "Unregister for unknown connection ignored");
            return;
        };

        info!(
            conn = %id,
            user = %member.user_id,
            clients = self.members.len(),
            "Client disconnected"
        );

        if let Some(payload) = self.client_count_payload() {
            self.broadcast(payload).await;
        }
    }

    /// Deliver to every member; drop the ones that cannot take it.
    ///
    /// Each round of drops is followed by a corrected client count, which
    /// may in turn drop more members.
    async fn broadcast(&mut self, payload: Payload) {
        let mut payload = payload;
        loop {
            let dropped = self.fan_out(&payload);
            if dropped.is_empty() {
                return;
            }

            for id in dropped {
                self.remove(id).await;
            }
            info!(clients = self.members.len(), "Dropped unresponsive clients");

            match self.client_count_payload() {
                Some(next) => payload = next,
                None => return,
            }
        }
    }

    fn fan_out(&self, payload: &Payload) -> Vec<ConnectionId> {
        let mut dropped = Vec::new();

        for (id, member) in &self.members {
            match member.sender.try_send(payload.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        conn = %id,
                        user = %member.user_id,
                        "Outbound queue full, dropping slow client"
                    );
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn = %id, user = %member.user_id, "Outbound queue closed");
                    dropped.push(*id);
                }
            }
        }

        debug!(
            delivered = self.members.len() - dropped.len(),
            clients = self.members.len(),
            bytes = payload.len(),
            "Broadcast fanned out"
        );
        dropped
    }

    /// Removing the member drops the only sender of its queue.
    async fn remove(&mut self, id: ConnectionId) -> Option<Member> {
        let member = self.members.remove(&id)?;
        self.membership.write().await.remove(&id);
        Some(member)
    }

    /// `None` when nobody is left to tell, or the envelope will not encode.
    fn client_count_payload(&self) -> Option<Payload> {
        let count = self.members.len();
        if count == 0 {
            return None;
        }

        match Envelope::client_count(count as u64, now_secs()).to_json() {
            Ok(json) => Some(Payload::from(json)),
            Err(e) => {
                error!(error = %e, "Failed to encode client count");
                None
            }
        }
    }
}

impl HubHandle {
    /// Create the connection's outbound queue and hand its sender to the hub.
    pub async fn register(&self, user_id: UserId) -> Result<Registration, HubError> {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, outbound) = mpsc::channel(self.outbound_capacity);

        self.send(HubCommand::Register {
            id,
            user_id,
            sender,
        })
        .await?;

        Ok(Registration { id, outbound })
    }

    /// Remove a connection. Unknown or already removed ids are ignored.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister(id)).await
    }

    /// Queue an encoded envelope for every live connection.
    ///
    /// Waits only for the hub to accept the request, never for delivery.
    pub async fn broadcast(&self, payload: impl Into<Payload>) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast(payload.into())).await
    }

    /// Live connection count as of the last processed request.
    pub async fn client_count(&self) -> usize {
        self.membership.read().await.len()
    }

    /// Live connections and their users, ordered by connection id.
    pub async fn members(&self) -> Vec<(ConnectionId, UserId)> {
        let mut members: Vec<_> = self
            .membership
            .read()
            .await
            .iter()
            .map(|(id, user_id)| (*id, user_id.clone()))
            .collect();
        members.sort_by_key(|(id, _)| *id);
        members
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands.send(command).await.map_err(|_| HubError::Closed)
    }
}
