//! # Hypercore Session
//!
//! [`Hypercore`] is a cloneable handle onto an actor task that exclusively
//! owns one [`Core`] and its [`Replicator`]. Handles talk to the actor over a
//! bounded command queue; waits (`get`, `seek`, `update`, downloads) are
//! registered by the actor and awaited by the handle, so a slow want never
//! blocks the actor.
//!
//! Each replicated connection gets its own task that frames bytes in both
//! directions and forwards decoded messages to the actor.
//!
//! Work that touches storage (appends, truncation, clearing, proofs in either
//! direction, the final flush) runs on Tokio's blocking pool. The core and
//! scheduler sit behind one mutex for that; only the actor and the blocking
//! task it is awaiting ever take it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use omega_core::{
    AppendOutcome, Authorization, Core, CoreConfig, CoreError, CoreInfo, CoreStats, CoreStorage,
    Ed25519Authorization, Hash,
};
use omega_crypto::{capability, Ed25519KeyPair};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::adapters::{encode_frame, FrameDecoder, Multiplexer, MuxEvent};
use crate::config::ReplicationConfig;
use crate::domain::{
    BlockValue, CoreEvent, Message, PeerId, PeerMessage, ReplicationError, ReplicationStats,
    Replicator, Waiter,
};
use crate::ports::Transport;

type Reply<T> = oneshot::Sender<Result<T, ReplicationError>>;

/// Options for [`Hypercore::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    /// Wait for a peer to deliver a missing block.
    pub wait: bool,
    /// Fail with [`ReplicationError::BlockNotAvailable`] once no peer claims
    /// the block, instead of waiting for one that might.
    pub if_available: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            wait: true,
            if_available: false,
        }
    }
}

impl GetOptions {
    /// Only return what is stored locally.
    pub fn local() -> Self {
        Self {
            wait: false,
            if_available: false,
        }
    }

    /// Wait only while some peer claims the block.
    pub fn if_available() -> Self {
        Self {
            wait: true,
            if_available: true,
        }
    }
}

/// Blocks to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadRange {
    /// First block.
    pub start: u64,
    /// End (exclusive). `None` follows the core as it grows.
    pub end: Option<u64>,
    /// Fetch in index order instead of randomly.
    pub linear: bool,
}

impl DownloadRange {
    /// Blocks `[start, end)`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
            linear: false,
        }
    }

    /// Every block from `start` on, including future ones.
    pub fn from(start: u64) -> Self {
        Self {
            start,
            end: None,
            linear: false,
        }
    }

    /// Fetch in index order.
    pub fn linear(mut self) -> Self {
        self.linear = true;
        self
    }
}

/// A running download.
#[derive(Debug)]
pub struct RangeHandle {
    id: u64,
    done: Waiter<()>,
    commands: mpsc::Sender<Command>,
}

impl RangeHandle {
    /// Range id within the session.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait until every block of the range is stored.
    ///
    /// Fails with [`ReplicationError::RequestCancelled`] if the range was
    /// destroyed. Await it once.
    pub async fn done(&mut self) -> Result<(), ReplicationError> {
        (&mut self.done)
            .await
            .map_err(|_| ReplicationError::SessionClosed)?
    }

    /// Stop the download. Requests already sent still complete.
    pub async fn destroy(&self) {
        let _ = self
            .commands
            .send(Command::DestroyRange { id: self.id })
            .await;
    }
}

/// Counters of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionStats {
    /// Storage counters of the core.
    pub core: CoreStats,
    /// Transfer counters of the scheduler.
    pub replication: ReplicationStats,
}

/// Handle onto a registered extension.
///
/// Incoming messages for the extension show up as [`CoreEvent::Extension`]
/// on [`Hypercore::subscribe`]. Peers that never registered the name drop
/// what we send.
#[derive(Debug, Clone)]
pub struct Extension {
    name: String,
    commands: mpsc::Sender<Command>,
}

impl Extension {
    /// Extension name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send `payload` to every open peer.
    pub async fn broadcast(&self, payload: Vec<u8>) -> Result<(), ReplicationError> {
        self.send_to(None, payload).await
    }

    /// Send `payload` to one peer. Fails with
    /// [`ReplicationError::Disconnected`] unless its channel is open.
    pub async fn send(&self, peer: PeerId, payload: Vec<u8>) -> Result<(), ReplicationError> {
        self.send_to(Some(peer), payload).await
    }

    async fn send_to(&self, peer: Option<PeerId>, payload: Vec<u8>) -> Result<(), ReplicationError> {
        let name = self.name.clone();
        call(&self.commands, |reply| Command::SendExtension {
            name,
            peer,
            payload,
            reply,
        })
        .await
    }
}

/// Signing policy a handle appends and truncates with.
#[derive(Clone)]
struct Signer(Arc<dyn Authorization>);

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signer").field(&self.0.public_key()).finish()
    }
}

#[derive(Debug)]
enum Command {
    Append {
        blocks: Vec<Vec<u8>>,
        signer: Option<Signer>,
        reply: Reply<AppendOutcome>,
    },
    AppendChunked {
        data: Vec<u8>,
        signer: Option<Signer>,
        reply: Reply<AppendOutcome>,
    },
    Get {
        index: u64,
        options: GetOptions,
        reply: Reply<Option<Waiter<BlockValue>>>,
    },
    Has {
        index: u64,
        reply: Reply<bool>,
    },
    Seek {
        bytes: u64,
        reply: Reply<Waiter<(u64, u64)>>,
    },
    Download {
        range: DownloadRange,
        reply: Reply<(u64, Waiter<()>)>,
    },
    DestroyRange {
        id: u64,
    },
    Update {
        reply: Reply<Waiter<bool>>,
    },
    Truncate {
        length: u64,
        signer: Option<Signer>,
        reply: Reply<()>,
    },
    Clear {
        start: u64,
        end: u64,
        reply: Reply<u64>,
    },
    Info {
        reply: Reply<CoreInfo>,
    },
    Stats {
        reply: Reply<SessionStats>,
    },
    RegisterExtension {
        name: String,
        reply: Reply<()>,
    },
    SendExtension {
        name: String,
        peer: Option<PeerId>,
        payload: Vec<u8>,
        reply: Reply<()>,
    },
    Connect {
        handshake_hash: Hash,
        is_initiator: bool,
        outbound: mpsc::UnboundedSender<Message>,
        reply: Reply<u64>,
    },
    Inbound {
        connection: u64,
        message: Message,
    },
    Disconnected {
        connection: u64,
    },
    Close {
        reply: Reply<()>,
    },
}

/// Handle onto a replicated core.
#[derive(Debug, Clone)]
pub struct Hypercore {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CoreEvent>,
    key: [u8; 32],
    discovery_key: Hash,
    signer: Option<Signer>,
}

impl Hypercore {
    /// Start a session owning `core`. Must be called within a Tokio runtime.
    pub fn new(core: Core, config: ReplicationConfig) -> Self {
        let (commands, rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let key = core.key();
        let discovery_key = core.discovery_key();

        let actor = SessionActor {
            shared: Arc::new(Mutex::new(Shared {
                replicator: Replicator::new(config, core.fork()),
                core,
            })),
            key,
            discovery_key,
            connections: HashMap::new(),
            next_connection: 0,
            events: events.clone(),
        };
        tokio::spawn(actor.run(rx));

        Self {
            commands,
            events,
            key,
            discovery_key,
            signer: None,
        }
    }

    /// Open or create the core in `storage` and start a session on it.
    pub fn open(
        storage: CoreStorage,
        auth: Arc<dyn Authorization>,
        core_config: CoreConfig,
        config: ReplicationConfig,
    ) -> Result<Self, ReplicationError> {
        let core = Core::open(storage, auth, core_config)?;
        Ok(Self::new(core, config))
    }

    /// Fresh writable in-memory core.
    pub fn memory(core_config: CoreConfig, config: ReplicationConfig) -> Result<Self, ReplicationError> {
        Ok(Self::new(Core::memory(core_config)?, config))
    }

    /// Handle on the same session that signs with `signer`.
    ///
    /// Fails with [`CoreError::SessionNotWritable`] if the signer cannot
    /// sign and [`CoreError::Unauthorized`] if it signs for another key.
    pub fn with_signer(&self, signer: Arc<dyn Authorization>) -> Result<Self, ReplicationError> {
        if !signer.can_sign() {
            return Err(CoreError::SessionNotWritable.into());
        }
        if signer.public_key() != self.key {
            return Err(CoreError::Unauthorized.into());
        }
        Ok(Self {
            signer: Some(Signer(signer)),
            ..self.clone()
        })
    }

    /// Handle on the same session that signs with `key_pair`.
    pub fn with_key_pair(&self, key_pair: Ed25519KeyPair) -> Result<Self, ReplicationError> {
        self.with_signer(Arc::new(Ed25519Authorization::writer(key_pair)))
    }

    /// Public key of the core.
    pub fn key(&self) -> [u8; 32] {
        self.key
    }

    /// Discovery key of the core.
    pub fn discovery_key(&self) -> Hash {
        self.discovery_key
    }

    /// Append blocks. Fails unless the session can sign.
    pub async fn append<B: AsRef<[u8]>>(&self, blocks: &[B]) -> Result<AppendOutcome, ReplicationError> {
        let blocks = blocks.iter().map(|b| b.as_ref().to_vec()).collect();
        let signer = self.signer.clone();
        self.call(|reply| Command::Append {
            blocks,
            signer,
            reply,
        })
        .await
    }

    /// Append `data` split into blocks of at most the configured chunk size.
    pub async fn append_chunked(&self, data: Vec<u8>) -> Result<AppendOutcome, ReplicationError> {
        let signer = self.signer.clone();
        self.call(|reply| Command::AppendChunked {
            data,
            signer,
            reply,
        })
        .await
    }

    /// Block `index`, fetched from peers if needed.
    ///
    /// `Ok(None)` only when `options.wait` is off and the block is not local.
    pub async fn get(&self, index: u64, options: GetOptions) -> Result<Option<Vec<u8>>, ReplicationError> {
        let waiter = self
            .call(|reply| Command::Get {
                index,
                options,
                reply,
            })
            .await?;
        match waiter {
            Some(waiter) => settle(waiter).await.map(Some),
            None => Ok(None),
        }
    }

    /// Whether block `index` is stored locally.
    pub async fn has(&self, index: u64) -> Result<bool, ReplicationError> {
        self.call(|reply| Command::Has { index, reply }).await
    }

    /// Block containing byte `bytes` and the offset within it.
    pub async fn seek(&self, bytes: u64) -> Result<(u64, u64), ReplicationError> {
        let waiter = self.call(|reply| Command::Seek { bytes, reply }).await?;
        settle(waiter).await
    }

    /// Start downloading `range`.
    pub async fn download(&self, range: DownloadRange) -> Result<RangeHandle, ReplicationError> {
        let (id, done) = self
            .call(|reply| Command::Download { range, reply })
            .await?;
        Ok(RangeHandle {
            id,
            done,
            commands: self.commands.clone(),
        })
    }

    /// Wait for a longer core or a new fork. `false` if no peer offers one.
    pub async fn update(&self) -> Result<bool, ReplicationError> {
        let waiter = self.call(|reply| Command::Update { reply }).await?;
        settle(waiter).await
    }

    /// Shrink to `length` blocks, starting a new fork.
    pub async fn truncate(&self, length: u64) -> Result<(), ReplicationError> {
        let signer = self.signer.clone();
        self.call(|reply| Command::Truncate {
            length,
            signer,
            reply,
        })
        .await
    }

    /// Release the stored blocks in `[start, end)` and tell peers they are
    /// gone. The tree is untouched, so the blocks can be fetched again.
    /// Returns how many blocks were released.
    pub async fn clear(&self, start: u64, end: u64) -> Result<u64, ReplicationError> {
        self.call(|reply| Command::Clear { start, end, reply })
            .await
    }

    /// Snapshot of the core.
    pub async fn info(&self) -> Result<CoreInfo, ReplicationError> {
        let mut info = self.call(|reply| Command::Info { reply }).await?;
        info.writable |= self.signer.is_some();
        Ok(info)
    }

    /// Storage and transfer counters.
    pub async fn stats(&self) -> Result<SessionStats, ReplicationError> {
        self.call(|reply| Command::Stats { reply }).await
    }

    /// Start accepting messages for extension `name`.
    pub async fn register_extension(&self, name: &str) -> Result<Extension, ReplicationError> {
        let name = name.to_string();
        let registered = name.clone();
        self.call(|reply| Command::RegisterExtension {
            name: registered,
            reply,
        })
        .await?;
        Ok(Extension {
            name,
            commands: self.commands.clone(),
        })
    }

    /// Replicate over `transport` until either side closes it.
    pub async fn replicate<T: Transport>(&self, transport: T) -> Result<(), ReplicationError> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let handshake_hash = transport.handshake_hash();
        let is_initiator = transport.is_initiator();
        let connection = self
            .call(|reply| Command::Connect {
                handshake_hash,
                is_initiator,
                outbound,
                reply,
            })
            .await?;

        tokio::spawn(run_connection(
            transport,
            connection,
            outbound_rx,
            self.commands.clone(),
        ));
        Ok(())
    }

    /// Session events. Slow receivers lag rather than block the session.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Close the session, rejecting every pending want. Idempotent.
    pub async fn close(&self) -> Result<(), ReplicationError> {
        match self.call(|reply| Command::Close { reply }).await {
            Err(ReplicationError::SessionClosed) => Ok(()),
            other => other,
        }
    }

    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, ReplicationError> {
        call(&self.commands, command).await
    }
}

async fn call<T>(
    commands: &mpsc::Sender<Command>,
    command: impl FnOnce(Reply<T>) -> Command,
) -> Result<T, ReplicationError> {
    let (reply, rx) = oneshot::channel();
    commands
        .send(command(reply))
        .await
        .map_err(|_| ReplicationError::SessionClosed)?;
    rx.await.map_err(|_| ReplicationError::SessionClosed)?
}

async fn settle<T>(waiter: Waiter<T>) -> Result<T, ReplicationError> {
    waiter.await.map_err(|_| ReplicationError::SessionClosed)?
}

struct ConnectionState {
    mux: Multiplexer,
    peer: PeerId,
    handshake_hash: Hash,
    is_initiator: bool,
    outbound: mpsc::UnboundedSender<Message>,
}

/// What the actor hands to blocking storage tasks.
struct Shared {
    core: Core,
    replicator: Replicator,
}

struct SessionActor {
    shared: Arc<Mutex<Shared>>,
    key: [u8; 32],
    discovery_key: Hash,
    connections: HashMap<u64, ConnectionState>,
    next_connection: u64,
    events: broadcast::Sender<CoreEvent>,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let (length, fork, writable) =
            self.with(|core, _| (core.length(), core.fork(), core.writable()));
        info!(length, fork, writable, "session started");

        while let Some(command) = commands.recv().await {
            if let Command::Close { reply } = command {
                let result = self.shutdown().await;
                // Release storage before the caller hears back.
                drop(self);
                let _ = reply.send(result);
                return;
            }
            self.handle(command).await;
            self.flush();
        }

        // Every handle and connection is gone.
        if let Err(err) = self.shutdown().await {
            warn!(error = %err, "flushing core on shutdown failed");
        }
    }

    async fn shutdown(&mut self) -> Result<(), ReplicationError> {
        self.with(|_, replicator| replicator.close());
        self.flush();
        self.connections.clear();
        debug!("session closed");
        self.blocking(|core, _| Ok(core.flush()?)).await
    }

    /// Run `work` against the core and scheduler on the actor's thread.
    fn with<T>(&self, work: impl FnOnce(&mut Core, &mut Replicator) -> T) -> T {
        let mut shared = self.shared.lock();
        let Shared { core, replicator } = &mut *shared;
        work(core, replicator)
    }

    /// Run storage-bound `work` on the blocking pool.
    fn blocking<T, F>(&self, work: F) -> impl Future<Output = Result<T, ReplicationError>> + 'static
    where
        T: Send + 'static,
        F: FnOnce(&mut Core, &mut Replicator) -> Result<T, ReplicationError> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        async move {
            tokio::task::spawn_blocking(move || {
                let mut shared = shared.lock();
                let Shared { core, replicator } = &mut *shared;
                work(core, replicator)
            })
            .await
            .map_err(|err| ReplicationError::Task(err.to_string()))?
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Append {
                blocks,
                signer,
                reply,
            } => {
                let result = self
                    .blocking(move |core, replicator| {
                        let start = core.length();
                        let outcome = match &signer {
                            Some(Signer(auth)) => core.append_as(auth.as_ref(), &blocks)?,
                            None => core.append(&blocks)?,
                        };
                        replicator.on_append(core, start);
                        Ok(outcome)
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::AppendChunked {
                data,
                signer,
                reply,
            } => {
                let result = self
                    .blocking(move |core, replicator| {
                        let start = core.length();
                        let outcome = match &signer {
                            Some(Signer(auth)) => core.append_chunked_as(auth.as_ref(), &data)?,
                            None => core.append_chunked(&data)?,
                        };
                        replicator.on_append(core, start);
                        Ok(outcome)
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::Get {
                index,
                options,
                reply,
            } => {
                let waiter = self.with(|core, replicator| {
                    if options.wait || core.has(index) {
                        Some(replicator.request_block(core, index, options.if_available))
                    } else {
                        None
                    }
                });
                let _ = reply.send(Ok(waiter));
            }
            Command::Has { index, reply } => {
                let _ = reply.send(Ok(self.with(|core, _| core.has(index))));
            }
            Command::Seek { bytes, reply } => {
                let waiter = self.with(|core, replicator| replicator.request_seek(core, bytes));
                let _ = reply.send(Ok(waiter));
            }
            Command::Download { range, reply } => {
                let added = self.with(|core, replicator| {
                    replicator.add_range(core, range.start, range.end, range.linear)
                });
                let _ = reply.send(Ok(added));
            }
            Command::DestroyRange { id } => {
                self.with(|_, replicator| replicator.destroy_range(id));
            }
            Command::Update { reply } => {
                let waiter = self.with(|core, replicator| replicator.request_upgrade(core));
                let _ = reply.send(Ok(waiter));
            }
            Command::Truncate {
                length,
                signer,
                reply,
            } => {
                let result = self
                    .blocking(move |core, replicator| {
                        let previous = core.length();
                        match &signer {
                            Some(Signer(auth)) => core.truncate_as(auth.as_ref(), length)?,
                            None => core.truncate(length)?,
                        }
                        replicator.on_truncate(core, previous);
                        Ok(())
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::Clear { start, end, reply } => {
                let result = self
                    .blocking(move |core, replicator| {
                        let cleared = core.clear(start, end)?;
                        if cleared > 0 {
                            replicator.on_clear(core, start, end);
                        }
                        Ok(cleared)
                    })
                    .await;
                let _ = reply.send(result);
            }
            Command::Info { reply } => {
                let _ = reply.send(Ok(self.with(|core, _| core.info())));
            }
            Command::Stats { reply } => {
                let stats = self.with(|core, replicator| SessionStats {
                    core: core.stats(),
                    replication: replicator.stats(),
                });
                let _ = reply.send(Ok(stats));
            }
            Command::RegisterExtension { name, reply } => {
                self.with(|_, replicator| replicator.register_extension(&name));
                let _ = reply.send(Ok(()));
            }
            Command::SendExtension {
                name,
                peer,
                payload,
                reply,
            } => {
                let sent =
                    self.with(|_, replicator| replicator.send_extension(peer, &name, payload));
                let _ = reply.send(sent);
            }
            Command::Connect {
                handshake_hash,
                is_initiator,
                outbound,
                reply,
            } => {
                let _ = reply.send(Ok(self.connect(handshake_hash, is_initiator, outbound)));
            }
            Command::Inbound {
                connection,
                message,
            } => self.on_inbound(connection, message).await,
            Command::Disconnected { connection } => {
                if let Some(state) = self.connections.remove(&connection) {
                    debug!(connection, peer = %state.peer, "connection ended");
                    self.with(|core, replicator| replicator.remove_peer(core, state.peer));
                }
            }
            Command::Close { reply } => {
                let _ = reply.send(self.shutdown().await);
            }
        }
    }

    fn connect(
        &mut self,
        handshake_hash: Hash,
        is_initiator: bool,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> u64 {
        self.next_connection += 1;
        let connection = self.next_connection;
        let peer = self.with(|_, replicator| replicator.add_peer());

        let mut mux = Multiplexer::new();
        let own = capability(is_initiator, &handshake_hash, &self.key);
        let _ = outbound.send(mux.open_channel(self.discovery_key, own));

        debug!(connection, %peer, is_initiator, "replicating");
        self.connections.insert(
            connection,
            ConnectionState {
                mux,
                peer,
                handshake_hash,
                is_initiator,
                outbound,
            },
        );
        connection
    }

    async fn on_inbound(&mut self, connection: u64, message: Message) {
        let Some(state) = self.connections.get_mut(&connection) else {
            return;
        };
        let Some(event) = state.mux.incoming(message) else {
            return;
        };
        let peer = state.peer;

        match event {
            MuxEvent::Reply(reply) => {
                let _ = state.outbound.send(reply);
            }
            MuxEvent::RemoteOpen {
                discovery_key,
                capability: remote,
            } => {
                let expected = capability(!state.is_initiator, &state.handshake_hash, &self.key);
                if remote != expected {
                    warn!(
                        connection,
                        %peer,
                        error = %ReplicationError::InvalidCapability,
                        "closing channel"
                    );
                    let _ = state.outbound.send(Message::Close { discovery_key });
                    self.connections.remove(&connection);
                    self.with(|core, replicator| replicator.remove_peer(core, peer));
                    return;
                }
                self.with(|core, replicator| replicator.on_remote_open(core, peer));
            }
            MuxEvent::RemoteClose { .. } => {
                self.connections.remove(&connection);
                self.with(|core, replicator| replicator.remove_peer(core, peer));
            }
            MuxEvent::Message { message, .. } => {
                // Requests read blocks and answers write them.
                if matches!(message, PeerMessage::Request { .. } | PeerMessage::Data { .. }) {
                    let handled = self
                        .blocking(move |core, replicator| {
                            replicator.on_message(core, peer, message);
                            Ok(())
                        })
                        .await;
                    if let Err(err) = handled {
                        warn!(connection, %peer, error = %err, "message handling failed");
                    }
                } else {
                    self.with(|core, replicator| replicator.on_message(core, peer, message));
                }
            }
        }
    }

    /// Put scheduler output on the wire and publish its events.
    fn flush(&mut self) {
        let (outbox, events) =
            self.with(|_, replicator| (replicator.drain_outbox(), replicator.drain_events()));
        for (peer, message) in outbox {
            let Some((&connection, state)) =
                self.connections.iter_mut().find(|(_, c)| c.peer == peer)
            else {
                continue;
            };
            let closing = message == PeerMessage::Close;
            if let Some(wire) = state.mux.outgoing(self.discovery_key, message) {
                let _ = state.outbound.send(wire);
            }
            if closing {
                self.connections.remove(&connection);
            }
        }

        for event in events {
            let _ = self.events.send(event);
        }
    }
}

async fn run_connection<T: Transport>(
    mut transport: T,
    connection: u64,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    commands: mpsc::Sender<Command>,
) {
    let mut decoder = FrameDecoder::new();
    let mut open = true;

    while open {
        tokio::select! {
            bytes = transport.recv() => {
                let Some(bytes) = bytes else {
                    break;
                };
                decoder.push(&bytes);
                loop {
                    match decoder.next() {
                        Ok(Some(message)) => {
                            let inbound = Command::Inbound { connection, message };
                            if commands.send(inbound).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            warn!(connection, error = %err, "dropping connection");
                            open = false;
                            break;
                        }
                    }
                }
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                match encode_frame(&message) {
                    Ok(frame) => {
                        if transport.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(connection, error = %err, "message not sent"),
                }
            }
        }
    }

    let _ = commands.send(Command::Disconnected { connection }).await;
}
