//! The per-process node
//!
//! One task owns the registry and multiplexes front-end commands, peer
//! channel events, the snapshot trigger and the status checker. Nothing else
//! mutates the registry, so mutations never interleave. Wake dispatches and
//! forwarded wakes run in their own tasks and report back by message.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use crate::config::Config;
use crate::devices::{
    Clock, Device, DeviceId, DeviceStatus, FieldValue, JsonFileStore, Registry, RegistryDelta,
    WakeAddress,
};
use crate::peer::{
    BackoffPolicy, ChannelEvent, ChannelEvents, Hello, LinkState, PeerChannel, PeerId, PeerMessage,
    transport,
};
use crate::snapshot::{SnapshotEntry, SnapshotProvider};
use crate::status::{StatusProbe, TcpProbe, check_all};
use crate::sync::SyncCoordinator;
use crate::wake::{
    CommandWake, WakeCapability, WakeDispatcher, WakeOutcome, WakeRequest, WakeResponder,
    WakeResult,
};
use crate::{Error, Result};

/// Queue depth for front-end commands
const COMMAND_BUFFER: usize = 64;

/// Knobs for building a node
#[derive(Clone)]
pub struct NodeOptions {
    /// Present on the process that sends magic packets
    pub capability: Option<Arc<dyn WakeCapability>>,
    /// Status checker; `None` disables it
    pub probe: Option<Arc<dyn StatusProbe>>,
    pub wake_timeout: Duration,
    pub dedup_retention: Duration,
    pub status_interval: Duration,
    pub snapshot_interval: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            capability: None,
            probe: None,
            wake_timeout: crate::wake::DEFAULT_WAKE_TIMEOUT,
            dedup_retention: Duration::from_secs(crate::wake::dedup::DEDUP_TTL_SECS),
            status_interval: crate::status::DEFAULT_STATUS_INTERVAL,
            snapshot_interval: Duration::from_secs(900),
        }
    }
}

impl std::fmt::Debug for NodeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeOptions")
            .field("wake_capable", &self.capability.is_some())
            .field("probe", &self.probe.is_some())
            .field("wake_timeout", &self.wake_timeout)
            .field("status_interval", &self.status_interval)
            .field("snapshot_interval", &self.snapshot_interval)
            .finish_non_exhaustive()
    }
}

/// A peer as seen from this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub state: LinkState,
    pub wake_capable: bool,
}

enum Command {
    Snapshot(oneshot::Sender<Vec<SnapshotEntry>>),
    List(oneshot::Sender<Vec<Device>>),
    Add {
        name: String,
        address: WakeAddress,
        reply: oneshot::Sender<Result<DeviceId>>,
    },
    Mutate {
        id: DeviceId,
        value: FieldValue,
        reply: oneshot::Sender<Result<()>>,
    },
    Wake {
        request: WakeRequest,
        retry: bool,
        reply: oneshot::Sender<Result<WakeResult>>,
    },
    RequestDeviceList(oneshot::Sender<Vec<PeerId>>),
    Peers(oneshot::Sender<Vec<PeerInfo>>),
    Shutdown,
}

/// Front-end handle to a running node; cheap to clone
#[derive(Debug, Clone)]
pub struct NodeHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Vec<SnapshotEntry>>,
}

impl NodeHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Current pinned-device snapshot
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the node has stopped
    pub async fn request_snapshot(&self) -> Result<Vec<SnapshotEntry>> {
        self.call(Command::Snapshot).await
    }

    /// Push updates of the snapshot
    #[must_use]
    pub fn subscribe_snapshots(&self) -> watch::Receiver<Vec<SnapshotEntry>> {
        self.snapshots.clone()
    }

    /// Every device in insertion order
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the node has stopped
    pub async fn list(&self) -> Result<Vec<Device>> {
        self.call(Command::List).await
    }

    /// Add a device and propagate it to peers
    ///
    /// # Errors
    ///
    /// Returns `InvalidChange` for a blank name, or `Cancelled`
    pub async fn add(&self, name: &str, address: WakeAddress) -> Result<DeviceId> {
        let name = name.to_string();
        self.call(|reply| Command::Add {
            name,
            address,
            reply,
        })
        .await?
    }

    /// Set one user-owned field
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `ReadOnlyField` for status
    pub async fn mutate(&self, id: &DeviceId, value: FieldValue) -> Result<()> {
        let id = id.clone();
        self.call(|reply| Command::Mutate { id, value, reply }).await?
    }

    /// Delete a device everywhere
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id
    pub async fn remove(&self, id: &DeviceId) -> Result<()> {
        self.mutate(id, FieldValue::Removed).await
    }

    /// Wake a device with a fresh request
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when waking locally an unknown device, or
    /// `Cancelled` if the node stops first
    pub async fn request_wake(&self, device_id: &DeviceId) -> Result<WakeResult> {
        self.wake(WakeRequest::new(device_id.clone())).await
    }

    /// Dispatch a request the caller keeps for retries
    ///
    /// # Errors
    ///
    /// Same as [`Self::request_wake`]
    pub async fn wake(&self, request: WakeRequest) -> Result<WakeResult> {
        self.call(|reply| Command::Wake {
            request,
            retry: false,
            reply,
        })
        .await?
    }

    /// Re-send an earlier request under its original request ID
    ///
    /// # Errors
    ///
    /// Same as [`Self::request_wake`]
    pub async fn retry_wake(&self, request: &WakeRequest) -> Result<WakeResult> {
        let request = request.clone();
        self.call(|reply| Command::Wake {
            request,
            retry: true,
            reply,
        })
        .await?
    }

    /// Ask reachable peers for anything we are missing
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the node has stopped
    pub async fn request_device_list(&self) -> Result<Vec<PeerId>> {
        self.call(Command::RequestDeviceList).await
    }

    /// Known peers and their link state
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if the node has stopped
    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        self.call(Command::Peers).await
    }

    /// Stop the node; pending wakes complete with `Cancelled`
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// The event loop owning one process's registry
pub struct Node {
    registry: Registry,
    channel: PeerChannel,
    events: ChannelEvents,
    sync: SyncCoordinator,
    dispatcher: WakeDispatcher,
    responder: Option<WakeResponder>,
    snapshots: SnapshotProvider,
    probe: Option<Arc<dyn StatusProbe>>,
    status_interval: Duration,
    snapshot_interval: Duration,
    commands: mpsc::Receiver<Command>,
    status_tx: mpsc::UnboundedSender<Vec<(DeviceId, DeviceStatus)>>,
    status_rx: mpsc::UnboundedReceiver<Vec<(DeviceId, DeviceStatus)>>,
    probing: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("peer", self.channel.local_id())
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Build a node around a loaded registry
    #[must_use]
    pub fn new(registry: Registry, options: NodeOptions) -> (Self, NodeHandle) {
        let local = registry.local_peer().clone();
        let (channel, events) = PeerChannel::new(Hello::new(local, options.capability.is_some()));

        // Local and forwarded wakes share one responder and its dedup cache
        let (dispatcher, responder) = match options.capability {
            Some(capability) => {
                let responder = WakeResponder::new(capability, options.dedup_retention);
                (
                    WakeDispatcher::local(responder.clone(), channel.clone(), options.wake_timeout),
                    Some(responder),
                )
            }
            None => (WakeDispatcher::remote(channel.clone(), options.wake_timeout), None),
        };

        let snapshots = SnapshotProvider::new();
        snapshots.publish(&registry);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) = mpsc::unbounded_channel();

        let handle = NodeHandle {
            commands: command_tx,
            snapshots: snapshots.subscribe(),
        };
        let node = Self {
            registry,
            sync: SyncCoordinator::new(channel.clone()),
            channel,
            events,
            dispatcher,
            responder,
            snapshots,
            probe: options.probe,
            status_interval: options.status_interval,
            snapshot_interval: options.snapshot_interval,
            commands: command_rx,
            status_tx,
            status_rx,
            probing: false,
            tasks: Vec::new(),
        };
        (node, handle)
    }

    /// Build a node from configuration with the file store and shipped capabilities
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read or the wake program is missing
    pub fn from_config(config: &Config) -> Result<(Self, NodeHandle)> {
        let store = JsonFileStore::new(config.registry_path());
        let registry = Registry::open(Box::new(store), Clock::system(config.peer_id.clone()))?;

        let capability: Option<Arc<dyn WakeCapability>> = if config.wake_capable {
            Some(Arc::new(CommandWake::new(
                &config.wake.command,
                config.wake.args.clone(),
            )?))
        } else {
            None
        };

        let probe: Option<Arc<dyn StatusProbe>> = (!config.status.interval.is_zero()).then(|| {
            Arc::new(TcpProbe::new(
                config.status.probe_ports.clone(),
                config.status.probe_timeout,
            )) as Arc<dyn StatusProbe>
        });

        Ok(Self::new(
            registry,
            NodeOptions {
                capability,
                probe,
                wake_timeout: config.wake.timeout,
                dedup_retention: config.wake.dedup_retention,
                status_interval: config.status.interval,
                snapshot_interval: config.snapshot_interval,
            },
        ))
    }

    /// Channel handle for attaching peer streams
    #[must_use]
    pub fn channel(&self) -> PeerChannel {
        self.channel.clone()
    }

    /// Start the TCP listener and outbound dial loops
    ///
    /// # Errors
    ///
    /// Returns error if the listen address cannot be bound
    pub async fn start_transport(&mut self, listen: Option<SocketAddr>, connect: &[String]) -> Result<()> {
        if let Some(addr) = listen {
            let listener = transport::bind(addr).await?;
            self.tasks
                .push(tokio::spawn(transport::serve(listener, self.channel.clone())));
        }
        for addr in connect {
            tracing::info!(addr = %addr, "keeping link to peer");
            self.tasks.push(tokio::spawn(transport::dial_forever(
                addr.clone(),
                self.channel.clone(),
                BackoffPolicy::default(),
            )));
        }
        Ok(())
    }

    /// Run until shutdown is requested or every handle is dropped
    pub async fn run(mut self) {
        let mut snapshot_tick = periodic(self.snapshot_interval);
        let mut status_tick = if self.probe.is_some() {
            periodic(self.status_interval)
        } else {
            None
        };

        tracing::info!(
            peer = %self.channel.local_id(),
            devices = self.registry.len(),
            wake_capable = self.dispatcher.is_local(),
            "node started"
        );

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        tracing::info!("shutdown requested");
                        break;
                    }
                    Some(command) => self.handle_command(command),
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(results) = self.status_rx.recv() => self.apply_status(results),
                () = tick(&mut snapshot_tick) => {
                    self.snapshots.publish(&self.registry);
                }
                () = tick(&mut status_tick) => self.start_status_check(),
            }

            self.end_turn();
        }

        self.dispatcher.cancel_all();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Err(e) = self.registry.flush() {
            tracing::error!(error = %e, "failed to persist registry on shutdown");
        }
        tracing::info!(peer = %self.channel.local_id(), "node stopped");
    }

    fn end_turn(&mut self) {
        if !self.registry.is_dirty() {
            return;
        }
        self.snapshots.publish(&self.registry);
        if let Err(e) = self.registry.flush() {
            tracing::error!(error = %e, "failed to persist registry");
        }
    }

    fn local_change(&self, delta: &RegistryDelta) {
        self.sync.on_local_change(delta);
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshots.publish(&self.registry));
            }
            Command::List(reply) => {
                let _ = reply.send(self.registry.all().into_iter().cloned().collect());
            }
            Command::Add {
                name,
                address,
                reply,
            } => {
                let result = self.registry.add(&name, address).map(|(id, delta)| {
                    self.local_change(&delta);
                    id
                });
                let _ = reply.send(result);
            }
            Command::Mutate { id, value, reply } => {
                let result = self.registry.mutate(&id, value).map(|delta| {
                    self.local_change(&delta);
                });
                let _ = reply.send(result);
            }
            Command::Wake {
                request,
                retry,
                reply,
            } => self.start_wake(request, retry, reply),
            Command::RequestDeviceList(reply) => {
                let _ = reply.send(self.sync.request_device_list(&self.registry));
            }
            Command::Peers(reply) => {
                let peers = self
                    .channel
                    .peers()
                    .into_iter()
                    .map(|(peer_id, state, wake_capable)| PeerInfo {
                        peer_id,
                        state,
                        wake_capable,
                    })
                    .collect();
                let _ = reply.send(peers);
            }
            Command::Shutdown => {}
        }
    }

    fn start_wake(
        &self,
        request: WakeRequest,
        retry: bool,
        reply: oneshot::Sender<Result<WakeResult>>,
    ) {
        let address = self.registry.get(&request.device_id).map(|d| d.address.clone());
        if self.dispatcher.is_local() && address.is_none() {
            let _ = reply.send(Err(Error::NotFound(request.device_id.to_string())));
            return;
        }

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let result = if retry {
                dispatcher.retry(&request, address).await
            } else {
                dispatcher.dispatch_request(request, address).await
            };
            let _ = reply.send(result);
        });
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::StateChanged {
                peer,
                previous,
                current,
            } => {
                tracing::debug!(peer = %peer, from = %previous, to = %current, "peer state");
                self.sync
                    .on_state_changed(&peer, previous, current, &self.registry);
            }
            ChannelEvent::Message { from, message } => self.handle_message(from, message),
        }
    }

    fn handle_message(&mut self, from: PeerId, message: PeerMessage) {
        match message {
            PeerMessage::Hello(_) => {}
            PeerMessage::Delta(delta) | PeerMessage::ResyncReply(delta) => {
                self.sync.on_remote_delta(&from, &delta, &mut self.registry);
            }
            PeerMessage::ResyncRequest(digest) => {
                self.sync.on_resync_request(&from, &digest, &self.registry);
            }
            PeerMessage::WakeRequest(request) => self.answer_wake(from, request),
            PeerMessage::WakeResult(result) => {
                self.dispatcher.resolve(result);
            }
        }
    }

    fn answer_wake(&self, from: PeerId, request: WakeRequest) {
        let Some(responder) = self.responder.clone() else {
            tracing::warn!(peer = %from, device_id = %request.device_id, "wake request sent to a node without wake capability");
            let result = WakeResult::new(request.request_id, WakeOutcome::CapabilityFailed);
            if let Err(e) = self.channel.send(&from, PeerMessage::WakeResult(result)) {
                tracing::debug!(peer = %from, error = %e, "wake result not delivered");
            }
            return;
        };

        let address = self.registry.get(&request.device_id).map(|d| d.address.clone());
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let Some(result) = responder.respond(&request, address).await else {
                return;
            };
            if let Err(e) = channel.send(&from, PeerMessage::WakeResult(result)) {
                tracing::debug!(peer = %from, error = %e, "wake result not delivered");
            }
        });
    }

    fn start_status_check(&mut self) {
        let Some(probe) = self.probe.clone() else {
            return;
        };
        if self.probing {
            tracing::debug!("previous status check still running");
            return;
        }

        let devices: Vec<Device> = self
            .registry
            .all()
            .into_iter()
            .filter(|d| d.address.validate().is_ok())
            .cloned()
            .collect();
        if devices.is_empty() {
            return;
        }

        self.probing = true;
        let tx = self.status_tx.clone();
        tokio::spawn(async move {
            let results = check_all(probe.as_ref(), &devices).await;
            let _ = tx.send(results);
        });
    }

    fn apply_status(&mut self, results: Vec<(DeviceId, DeviceStatus)>) {
        self.probing = false;
        let mut delta = RegistryDelta::default();
        for (id, status) in results {
            // Devices removed while the probe ran are skipped
            if let Ok(changed) = self.registry.set_status(&id, status) {
                delta.extend(changed);
            }
        }
        if !delta.is_empty() {
            tracing::debug!(changes = delta.len(), "device status changed");
            self.local_change(&delta);
        }
    }
}

fn periodic(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(interval)
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
