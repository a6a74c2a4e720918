use anyhow::{Context, Result};
use rand::Rng;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, broadcast, mpsc, watch};
use tracing::info;

use super::config::GossipConfig;
use super::events::{MemberEvent, MemberEventKind, MemberListeners, dispatch_events};
use super::table::MembershipTable;
use super::transport::{Transport, TransportError};
use super::types::{MembershipRecord, PeerId};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const EVENT_SUBSCRIBER_CAPACITY: usize = 1024;

/// A single gossip node.
///
/// Owns the node's membership table and UDP transport and drives three loops over them:
/// the disseminator, the receiver and the failure detector.
pub struct GossipService {
    pub local_id: PeerId,
    pub local_addr: SocketAddr,
    pub config: GossipConfig,
    pub members: Arc<MembershipTable>,
    transport: Arc<Transport>,
    send_permits: Arc<Semaphore>,
    listeners: Arc<MemberListeners>,
    event_tx: mpsc::UnboundedSender<MemberEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<MemberEvent>>>,
    subscribers: broadcast::Sender<MemberEvent>,
    stop_tx: watch::Sender<bool>,
}

impl GossipService {
    /// Binds the listen socket and seeds the table with the local node and, optionally,
    /// one initial peer. Nothing runs until `start` is called.
    ///
    /// The listen IP is what the node advertises to its peers, so it must be a concrete
    /// address rather than `0.0.0.0` or `::`.
    pub async fn new(
        listen_addr: SocketAddr,
        seed: Option<SocketAddr>,
        config: GossipConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        anyhow::ensure!(
            !listen_addr.ip().is_unspecified(),
            "Cannot advertise unspecified listen address {}; bind to a routable IP",
            listen_addr
        );

        let transport = Transport::bind(listen_addr)
            .await
            .with_context(|| format!("Failed to bind gossip socket on {}", listen_addr))?;
        let local_addr = transport.local_addr();
        let local_id = PeerId::from(local_addr);

        let now = Instant::now();
        let members = Arc::new(MembershipTable::new());
        members.put_if_absent(local_id.clone(), MembershipRecord::new(local_addr, 0, now));

        if let Some(seed) = seed {
            let seed_id = PeerId::from(seed);
            if seed_id != local_id {
                info!("Joining cluster via seed node {}", seed);
                members.put_if_absent(seed_id, MembershipRecord::new(seed, 0, now));
            }
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (subscribers, _) = broadcast::channel(EVENT_SUBSCRIBER_CAPACITY);
        let (stop_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            local_id,
            local_addr,
            config,
            members,
            transport: Arc::new(transport),
            send_permits: Arc::new(Semaphore::new(config.fanout)),
            listeners: Arc::new(MemberListeners::new()),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            subscribers,
            stop_tx,
        }))
    }

    /// Spawns the event dispatcher and the three protocol loops.
    ///
    /// Calling it a second time only logs a warning.
    pub async fn start(self: Arc<Self>) {
        let event_rx = match self.event_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(event_rx) = event_rx else {
            tracing::warn!("Gossip service {} already started", self.local_id);
            return;
        };

        tracing::info!("Starting gossip service on {}...", self.local_addr);

        tokio::spawn(dispatch_events(
            event_rx,
            self.listeners.clone(),
            self.subscribers.clone(),
            self.stop_tx.subscribe(),
        ));

        let _gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            })
        };

        let _receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let _failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            })
        };

        tracing::info!("All background tasks started");
    }

    /// Raises the stop flag. Every loop exits at its next iteration.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        tracing::info!("Stopping gossip service on {}", self.local_addr);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn on_new_member<F>(&self, handler: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.listeners.register(MemberEventKind::New, handler);
    }

    pub fn on_failed_member<F>(&self, handler: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.listeners.register(MemberEventKind::Failed, handler);
    }

    pub fn on_removed_member<F>(&self, handler: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.listeners.register(MemberEventKind::Removed, handler);
    }

    pub fn on_revived_member<F>(&self, handler: F)
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.listeners.register(MemberEventKind::Revived, handler);
    }

    /// Stream of every lifecycle event emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MemberEvent> {
        self.subscribers.subscribe()
    }

    pub fn get_alive_members(&self) -> Vec<SocketAddr> {
        self.members
            .snapshot()
            .into_iter()
            .filter(|record| !record.failed)
            .map(|record| record.address)
            .collect()
    }

    pub fn get_failed_members(&self) -> Vec<SocketAddr> {
        self.members
            .snapshot()
            .into_iter()
            .filter(|record| record.failed)
            .map(|record| record.address)
            .collect()
    }

    pub fn get_all_members(&self) -> Vec<SocketAddr> {
        self.members
            .snapshot()
            .into_iter()
            .map(|record| record.address)
            .collect()
    }

    pub fn get_member(&self, id: &PeerId) -> Option<MembershipRecord> {
        self.members.get(id)
    }

    pub fn local_record(&self) -> Option<MembershipRecord> {
        self.members.get(&self.local_id)
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let mut interval = tokio::time::interval(self.config.update_interval);

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => self.gossip_round(),
                _ = stop.changed() => {}
            }
        }

        tracing::debug!("Gossip loop on {} stopped", self.local_addr);
    }

    /// Bumps the local heartbeat and pushes it to up to `fanout` peers.
    ///
    /// Sends run as detached tasks; a target whose send permit is not available is
    /// skipped this round, the next round makes up for it.
    pub(crate) fn gossip_round(&self) {
        let Some(local) = self.members.increment_heartbeat(&self.local_id, Instant::now()) else {
            tracing::error!("Local record {} missing from membership table", self.local_id);
            return;
        };

        let peers = self.members.peer_ids_except(&self.local_id);
        let targets = select_targets(&peers, self.config.fanout, &mut rand::thread_rng());

        for target in targets {
            let Some(record) = self.members.get(&target) else {
                continue;
            };

            let Ok(permit) = self.send_permits.clone().try_acquire_owned() else {
                tracing::debug!("Send pool exhausted, skipping {} this round", target);
                continue;
            };

            let transport = self.transport.clone();
            let local = local.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match transport.send(record.address, &local).await {
                    Ok(()) => tracing::debug!(
                        "Sent heartbeat {} to {}",
                        local.heartbeat,
                        record.address
                    ),
                    Err(e) => tracing::warn!("Failed to send gossip to {}: {}", record.address, e),
                }
            });
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                result = self.transport.receive() => match result {
                    Ok((record, src)) => {
                        tracing::debug!(
                            "Received heartbeat {} for {} from {}",
                            record.heartbeat,
                            record.address,
                            src
                        );
                        self.ingest(record, Instant::now());
                    }
                    Err(TransportError::Io(e)) => {
                        tracing::error!("Failed to receive UDP packet: {}", e);
                        tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                    }
                    Err(e) => {
                        tracing::warn!("Dropping gossip datagram: {}", e);
                    }
                },
                _ = stop.changed() => {}
            }
        }

        tracing::debug!("Receive loop on {} stopped", self.local_addr);
    }

    /// Registers an unknown peer or merges the heartbeat of a known one.
    ///
    /// Returns the `New` event if the peer was registered. Merges never produce events.
    pub(crate) fn ingest(&self, record: MembershipRecord, now: Instant) -> Option<MemberEvent> {
        let id = record.peer_id();

        // Only our own disseminator advances the local record.
        if id == self.local_id {
            return None;
        }

        if let Some(changed) = self.members.merge(&id, record.heartbeat, now) {
            if changed {
                tracing::trace!("Updated {} to heartbeat {}", id, record.heartbeat);
            }
            return None;
        }

        let address = record.address;
        let fresh = MembershipRecord::new(address, record.heartbeat, now);

        if self.members.put_if_absent(id.clone(), fresh) {
            info!("Connected to new member {}", address);
            let event = MemberEvent::New(address);
            self.emit(event);
            Some(event)
        } else {
            // Lost an insert race; the record exists now.
            self.members.merge(&id, record.heartbeat, now);
            None
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut stop = self.stop_tx.subscribe();
        let mut interval = tokio::time::interval(self.config.failure_check_interval);

        loop {
            if *stop.borrow() {
                break;
            }

            tokio::select! {
                _ = interval.tick() => {
                    self.detect_failures(Instant::now());
                }
                _ = stop.changed() => {}
            }
        }

        tracing::debug!("Failure detection loop on {} stopped", self.local_addr);
    }

    /// One failure detector pass. Emits and returns the transitions it observed.
    pub(crate) fn detect_failures(&self, now: Instant) -> Vec<MemberEvent> {
        let events = self.members.sweep(&self.local_id, now, &self.config);

        for event in &events {
            match event {
                MemberEvent::Failed(addr) => tracing::warn!("Member {} failed", addr),
                MemberEvent::Revived(addr) => tracing::info!("Member {} revived", addr),
                MemberEvent::Removed(addr) => {
                    tracing::info!(
                        "Member {} removed, cluster size now {}",
                        addr,
                        self.members.len()
                    )
                }
                MemberEvent::New(_) => {}
            }
            self.emit(*event);
        }

        events
    }

    fn emit(&self, event: MemberEvent) {
        // The dispatcher is gone once the service has stopped.
        let _ = self.event_tx.send(event);
    }
}

/// Picks the peers to gossip with this round.
///
/// With fewer than `fanout` peers every peer is a target. Otherwise peers are sampled
/// uniformly, resampling duplicates, until `fanout` distinct ones are chosen.
pub fn select_targets<R: Rng>(peers: &[PeerId], fanout: usize, rng: &mut R) -> Vec<PeerId> {
    if peers.len() < fanout {
        return peers.to_vec();
    }

    let mut picked = HashSet::with_capacity(fanout);
    let mut targets = Vec::with_capacity(fanout);

    while targets.len() < fanout {
        let idx = rng.gen_range(0..peers.len());
        if picked.insert(idx) {
            targets.push(peers[idx].clone());
        }
    }

    targets
}
