use crate::net::decoder::{ReliableDedup, WireEvent, WireReader};
use crate::net::encoder::Encoder;
use crate::net::message::{
    opcode, ClientConnected, ClientDisconnected, ConnectAck, ConnectAttempt, ReceiveChat,
    ReliableMessage, SubmitChat,
};
use crate::net::packet_log::PacketLog;
use crate::net::packet_queue::PacketQueue;
use crate::net::queue::{MessageSender, SnapshotAckTracker, SnapshotSendQueue};
use crate::net::socket::{self, UdpEndpoint};
use crate::net::{DATAGRAM_SIZE, PROTOCOL_VERSION, TIMEOUT_SECONDS};
use crate::predict::PredictionConstants;
use crate::state::node::NodeType;
use crate::state::remote::{self, RemoteFactory};
use crate::state::tree::StateTree;
use crate::stats::{FrameStatistics, StatisticsRing};
use hashbrown::{HashMap, HashSet};
use quark::logfile::StructuredLogFile;
use quark::logging::{self, Logger};
use quark::time::{timestamp_secs, Clock, TICKS_PER_SECOND};
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Application hooks driven by the client's tick worker. The tick runs
/// before the snapshot is taken, so values written during it ship the same
/// tick.
pub trait ClientApp: RemoteFactory {
    fn init(&mut self, _tree: &mut StateTree) {}

    fn tick(&mut self, delta: f32, absolute: f64, tree: &mut StateTree, sender: &MessageSender);

    /// Application-defined reliable opcodes (64 and up) plus any core
    /// opcode the client itself leaves unhandled (e.g. chat delivery).
    /// Return true when handled.
    fn reliable_message(&mut self, _opcode: u32, _payload: &[u8], _tree: &mut StateTree) -> bool {
        false
    }

    fn terminate(&mut self, _tree: &mut StateTree) {}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    InvalidHostname = 3,
    Timeout = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> ConnectionState {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::InvalidHostname,
            4 => ConnectionState::Timeout,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub id: u16,
    pub user_name: String,
    pub is_self: bool,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub port: u16,
    pub frames_per_second: u32,
    pub user_name: String,
    pub password: Option<String>,
    pub timeout_seconds: i64,
    /// Stage complete snapshots for an external thread instead of applying
    /// them on the network worker. The embedder then drives
    /// [`Client::single_threaded_tick`].
    pub staged_apply: bool,
    pub packet_logging: bool,
    pub statistics_logging: bool,
    /// Fraction of received datagrams to randomly discard; exercises the
    /// fractured-snapshot path.
    pub packet_drop: f32,
    pub prediction: PredictionConstants,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            server: "localhost".to_string(),
            port: 28008,
            frames_per_second: 20,
            user_name: String::new(),
            password: None,
            timeout_seconds: TIMEOUT_SECONDS,
            staged_apply: false,
            packet_logging: false,
            statistics_logging: false,
            packet_drop: 0.0,
            prediction: PredictionConstants::default(),
        }
    }
}

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_ROUND_TICKS: i64 = 2 * TICKS_PER_SECOND;

struct ClientShared<A> {
    state: AtomicU8,
    disconnect: AtomicBool,
    connect_attempts: AtomicU32,
    data_received_recently: AtomicBool,
    fractured: AtomicBool,
    good_snapshots: AtomicU32,

    server_time_base: AtomicI64,
    server_tick_freq: AtomicI64,
    client_time_base: AtomicI64,

    app: Mutex<A>,
    tree: Mutex<StateTree>,
    completed: Mutex<VecDeque<PacketQueue>>,
    free: Mutex<VecDeque<PacketQueue>>,
    roster: Mutex<HashMap<u16, RosterEntry>>,
    stats: Mutex<StatisticsRing>,
    remote_objects: Mutex<HashSet<u32>>,
}

impl<A> ClientShared<A> {
    #[inline]
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Relaxed))
    }

    #[inline]
    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }
}

/// Replays a staged snapshot's node events into the tree as one atomic
/// batch, stamped with the snapshot's receive time.
fn apply_packet_queue<A: ClientApp>(
    tree: &mut StateTree,
    app: &mut A,
    remote_objects: &mut HashSet<u32>,
    queue: &PacketQueue,
    constants: &PredictionConstants,
) {
    let now = queue.timestamp();

    for item in WireReader::new(queue.bytes()) {
        let packet = match item {
            Ok(packet) => packet,
            Err(_) => break,
        };

        match packet.event {
            WireEvent::NodeUpdate { id, storage } => {
                tree.update_node_data(id, storage, now, constants);
            }
            WireEvent::NodeCreate {
                id,
                parent_id,
                node_type_tag,
                creation_code,
                blob,
            } => {
                if let Some(node_type) = NodeType::from_u8(node_type_tag) {
                    // Mirrors stay peer-owned on the client.
                    remote::handle_create_node(
                        tree,
                        app,
                        remote_objects,
                        parent_id,
                        id,
                        node_type,
                        creation_code,
                        blob,
                        false,
                    );
                }
            }
            WireEvent::NodeDelete { id } => {
                remote::handle_delete_node(tree, app, remote_objects, id);
            }
            _ => {}
        }
    }
}

struct Worker<A: ClientApp> {
    shared: Arc<ClientShared<A>>,
    config: ClientConfig,
    clock: Clock,
    nonce: u16,
    user_name: String,

    socket: UdpEndpoint,
    encoder: Encoder,
    send_queue: SnapshotSendQueue,
    sender: MessageSender,
    ack_tracker: SnapshotAckTracker,
    dedup: ReliableDedup,
    decode_log: PacketLog,
    stats_log: StructuredLogFile,

    current_queue: PacketQueue,
    stats: FrameStatistics,
    last_recv_ticks: i64,

    log: Logger,
}

impl<A: ClientApp> Worker<A> {
    fn run(&mut self) {
        if self.config.packet_logging {
            let prefix = timestamp_secs();
            drop(
                self.encoder
                    .log_mut()
                    .open(format!("client-encoder-{}-{}.csv", prefix, self.nonce)),
            );
            drop(self.decode_log.open(format!("client-decoder-{}-{}.csv", prefix, self.nonce)));
        }
        if self.config.statistics_logging {
            use crate::stats::STATISTICS_COLUMNS;
            drop(self.stats_log.open(
                format!("client-stats-{}-{}.csv", timestamp_secs(), self.nonce),
                &STATISTICS_COLUMNS,
            ));
        }

        if !self.handshake() {
            return;
        }

        {
            let mut app = self.shared.app.lock().expect("app poisoned");
            let mut tree = self.shared.tree.lock().expect("tree poisoned");
            app.init(&mut tree);
        }

        self.main_loop();
        self.finish();
    }

    /// Up to five two-second rounds of `ConnectAttempt`. Success is signaled
    /// by the `ConnectAck` handler flipping the state to `Connected`.
    fn handshake(&mut self) -> bool {
        let attempt_base = ConnectAttempt {
            protocol_version: PROTOCOL_VERSION,
            nonce: self.nonce,
            user_name: self.user_name.clone(),
            hashed_password: match self.config.password {
                // Placeholder scheme; real hashing is out of protocol scope.
                Some(_) => "password".to_string(),
                None => String::new(),
            },
            client_ticks: 0,
            client_tick_freq: TICKS_PER_SECOND,
        };

        let mut attempts = 0;
        while attempts < CONNECT_ATTEMPTS
            && self.shared.state() == ConnectionState::Connecting
            && !self.shared.disconnect.load(Ordering::Relaxed)
        {
            let now = self.clock.ticks();
            let deadline = now + CONNECT_ROUND_TICKS;
            self.last_recv_ticks = now;

            logging::debug!(self.log, "sending connect attempt";
                            "context" => "handshake",
                            "attempt" => attempts + 1,
                            "nonce" => self.nonce);

            let snapshot = self.shared.tree.lock().expect("tree poisoned").snapshot();
            self.send_queue.queue_snapshot(snapshot);

            let mut attempt = attempt_base.clone();
            attempt.client_ticks = now;
            self.send_queue.queue_reliable(ReliableMessage::with_payload(
                opcode::CONNECT_ATTEMPT,
                attempt.write(),
            ));

            self.send_queue
                .send_update(&mut self.encoder, &mut self.stats, now);

            while self.clock.ticks() < deadline {
                thread::sleep(Duration::from_millis(1));

                if self.receive_drain().is_err() {
                    break;
                }
                if self.shared.state() != ConnectionState::Connecting {
                    break;
                }
            }

            attempts += 1;
            self.shared.connect_attempts.store(attempts, Ordering::Relaxed);
        }

        if self.shared.state() == ConnectionState::Connected {
            self.last_recv_ticks = self.clock.ticks();
            true
        } else {
            logging::info!(self.log, "connection timed out"; "context" => "handshake");
            self.shared.set_state(ConnectionState::Timeout);
            false
        }
    }

    fn main_loop(&mut self) {
        let start = self.clock.ticks();
        let frame_ticks = Clock::ticks_per_frame(self.config.frames_per_second);
        let mut next_ticks = start;
        let mut last_ticks = start;
        self.last_recv_ticks = start;

        while !self.shared.disconnect.load(Ordering::Relaxed) {
            let mut now = self.clock.ticks();
            while now < next_ticks {
                thread::sleep(Duration::from_millis(1));
                if self.shared.disconnect.load(Ordering::Relaxed) {
                    return;
                }
                now = self.clock.ticks();
            }

            next_ticks = now + frame_ticks;

            let delta_ticks = (now - last_ticks).min(frame_ticks);
            let absolute = (now - start) as f64 / TICKS_PER_SECOND as f64;
            let delta = (delta_ticks as f64 / TICKS_PER_SECOND as f64) as f32;
            last_ticks = now;

            self.stats.timestamp = now;

            if self.receive_drain().is_err() {
                self.shared.disconnect.store(true, Ordering::Relaxed);
            }

            let snapshot = {
                let mut app = self.shared.app.lock().expect("app poisoned");
                let mut tree = self.shared.tree.lock().expect("tree poisoned");
                app.tick(delta, absolute, &mut tree, &self.sender);
                tree.snapshot()
            };

            self.send_queue.queue_snapshot(snapshot);
            self.send_queue
                .send_update(&mut self.encoder, &mut self.stats, now);

            self.push_stats_frame();
        }
    }

    /// Drains the socket. `Err` means the connection is gone (fatal socket
    /// error or peer-inactivity timeout).
    fn receive_drain(&mut self) -> Result<(), ()> {
        let mut buf = [0u8; DATAGRAM_SIZE];
        self.decode_log.reset_indices();

        loop {
            let now = self.clock.ticks();

            match self.socket.recv_from(&mut buf) {
                Ok(None) => {
                    if now >= self.last_recv_ticks + TICKS_PER_SECOND / 2 {
                        self.shared
                            .data_received_recently
                            .store(false, Ordering::Relaxed);
                    }
                    if now >= self.last_recv_ticks + TICKS_PER_SECOND * self.config.timeout_seconds
                    {
                        logging::info!(self.log, "server silent, disconnecting"; "context" => "receive");
                        return Err(());
                    }
                    return Ok(());
                }
                Ok(Some((size, _))) => {
                    if size == 0 {
                        continue;
                    }

                    if self.config.packet_drop > 0.0
                        && rand::random::<f32>() < self.config.packet_drop
                    {
                        continue;
                    }

                    self.stats.bytes_received += size as u32;
                    self.stats.packets_received += 1;
                    self.last_recv_ticks = now;
                    self.shared
                        .data_received_recently
                        .store(true, Ordering::Relaxed);

                    self.process_datagram(&buf[..size], now);
                    self.decode_log.increment_packet_index();
                }
                Err(err) => {
                    logging::warn!(self.log, "receive failed"; "context" => "receive", "error" => ?err);
                    return Err(());
                }
            }
        }
    }

    fn process_datagram(&mut self, data: &[u8], now: i64) {
        for item in WireReader::new(data) {
            let packet = match item {
                Ok(packet) => packet,
                Err(err) => {
                    logging::warn!(self.log, "malformed datagram"; "context" => "decode", "error" => ?err);
                    return;
                }
            };

            match packet.event {
                WireEvent::NoOp => {}
                WireEvent::Acknowledge { index } => {
                    self.stats.ack_messages_received += 1;
                    self.decode_log
                        .log_message(crate::net::wire::PacketType::Acknowledge, index, 0, 4);
                    self.send_queue.ack_snapshot(index, now);
                }
                WireEvent::BeginSnapshot { index } => {
                    self.stats.begin_snapshots_received += 1;
                    self.decode_log.set_snapshot_index(index);
                    self.decode_log
                        .log_message(crate::net::wire::PacketType::BeginSnapshot, index, 0, 4);

                    if index <= 1 && self.ack_tracker.current_index() >= 2 {
                        // The server restarted its snapshot sequence; this
                        // session cannot continue.
                        logging::info!(self.log, "server restart detected"; "context" => "decode");
                        self.shared.disconnect.store(true, Ordering::Relaxed);
                    }

                    if !self.ack_tracker.begin_snapshot(index) {
                        // Stale snapshot; discard the rest of the datagram.
                        return;
                    }
                    self.current_queue.set_frame(index, now);
                }
                WireEvent::EndSnapshot {
                    index,
                    packet_count,
                } => {
                    self.stats.end_snapshots_received += 1;
                    self.decode_log.log_message(
                        crate::net::wire::PacketType::EndSnapshot,
                        index,
                        packet_count,
                        8,
                    );

                    let good = match self.ack_tracker.end_snapshot(index, packet_count) {
                        Some(ack) => {
                            self.send_queue.queue_acknowledge(ack);
                            self.shared.good_snapshots.fetch_add(1, Ordering::Relaxed);
                            true
                        }
                        None => false,
                    };
                    self.shared
                        .fractured
                        .store(self.ack_tracker.fractured(), Ordering::Relaxed);

                    self.complete_packet_queue(good);
                }
                WireEvent::ReliableMessage {
                    opcode: op,
                    unique_index,
                    payload,
                } => {
                    if self.dedup.accept(unique_index) {
                        self.stats.reliable_messages_received += 1;
                        self.stats.reliable_message_bytes_received += packet.raw.len() as u32;
                        self.handle_reliable(op, payload, now);
                    } else {
                        self.stats.duplicate_reliable_messages_skipped += 1;
                    }
                }
                WireEvent::UnreliableMessage { opcode: op, payload } => {
                    self.stats.unreliable_messages_received += 1;
                    self.stats.unreliable_message_bytes_received += packet.raw.len() as u32;
                    self.handle_reliable(op, payload, now);
                }
                WireEvent::NodeUpdate { .. }
                | WireEvent::NodeCreate { .. }
                | WireEvent::NodeDelete { .. } => {
                    use crate::net::wire::PacketType;
                    match packet.event {
                        WireEvent::NodeUpdate { id, .. } => {
                            self.stats.node_update_messages_received += 1;
                            self.stats.node_update_bytes_received += packet.raw.len() as u32;
                            self.decode_log.log_message(
                                PacketType::NodeUpdate,
                                id,
                                0,
                                packet.raw.len() as u32,
                            );
                        }
                        WireEvent::NodeCreate { id, parent_id, blob, .. } => {
                            let ptype = if blob.is_empty() {
                                PacketType::NodeCreateSimple
                            } else {
                                PacketType::NodeCreateComplex
                            };
                            self.decode_log.log_message(
                                ptype,
                                id,
                                parent_id,
                                packet.raw.len() as u32,
                            );
                        }
                        WireEvent::NodeDelete { id } => {
                            self.decode_log.log_message(
                                PacketType::NodeDelete,
                                id,
                                0,
                                packet.raw.len() as u32,
                            );
                        }
                        _ => {}
                    }
                    // Node mutations stage until the snapshot proves whole.
                    self.current_queue.copy_packet(packet.raw);
                }
            }
        }
    }

    fn complete_packet_queue(&mut self, good: bool) {
        if good && !self.current_queue.is_empty() {
            if self.config.staged_apply {
                let fresh = self
                    .shared
                    .free
                    .lock()
                    .expect("free queue poisoned")
                    .pop_front()
                    .unwrap_or_else(PacketQueue::new);
                let staged = mem::replace(&mut self.current_queue, fresh);
                self.shared
                    .completed
                    .lock()
                    .expect("completed queue poisoned")
                    .push_back(staged);
                return;
            }

            let mut app = self.shared.app.lock().expect("app poisoned");
            let mut tree = self.shared.tree.lock().expect("tree poisoned");
            let mut remotes = self
                .shared
                .remote_objects
                .lock()
                .expect("remote set poisoned");
            apply_packet_queue(
                &mut tree,
                &mut *app,
                &mut remotes,
                &self.current_queue,
                &self.config.prediction,
            );
        }

        self.current_queue.reset();
    }

    fn handle_reliable(&mut self, op: u32, payload: &[u8], now: i64) {
        match op {
            opcode::CONNECT_ACK => {
                let ack = match ConnectAck::read(payload) {
                    Ok(ack) => ack,
                    Err(_) => return,
                };

                if ack.success != 0 {
                    logging::info!(self.log, "server accepted connection";
                                   "context" => "handshake",
                                   "nonce" => ack.nonce);
                    self.shared
                        .server_time_base
                        .store(ack.server_ticks, Ordering::Relaxed);
                    self.shared
                        .server_tick_freq
                        .store(ack.server_tick_freq, Ordering::Relaxed);
                    // Halving the send->now span estimates the instant the
                    // server sampled its clock.
                    self.shared
                        .client_time_base
                        .store((now + ack.client_ticks) >> 1, Ordering::Relaxed);
                    self.shared.set_state(ConnectionState::Connected);
                } else {
                    logging::warn!(self.log, "server rejected connection"; "context" => "handshake");
                }
            }
            opcode::CLIENT_CONNECTED => {
                if let Ok(connected) = ClientConnected::read(payload) {
                    let mut roster = self.shared.roster.lock().expect("roster poisoned");
                    roster.entry(connected.nonce).or_insert_with(|| RosterEntry {
                        id: connected.nonce,
                        user_name: connected.user_name,
                        is_self: connected.nonce == self.nonce,
                    });
                }
            }
            opcode::CLIENT_DISCONNECTED => {
                if let Ok(disconnected) = ClientDisconnected::read(payload) {
                    self.shared
                        .roster
                        .lock()
                        .expect("roster poisoned")
                        .remove(&disconnected.nonce);
                }
            }
            _ => {
                let handled = {
                    let mut app = self.shared.app.lock().expect("app poisoned");
                    let mut tree = self.shared.tree.lock().expect("tree poisoned");
                    app.reliable_message(op, payload, &mut tree)
                };

                if !handled && op == opcode::RECEIVE_CHAT {
                    if let Ok(chat) = ReceiveChat::read(payload) {
                        logging::info!(self.log, "chat received";
                                       "context" => "chat",
                                       "source" => chat.source,
                                       "text" => &chat.text);
                    }
                }
            }
        }
    }

    fn push_stats_frame(&mut self) {
        let mut ring = self.shared.stats.lock().expect("stats poisoned");
        *ring.current_mut() = self.stats;
        ring.advance(&mut self.stats_log);
        self.stats.zero();
    }

    fn finish(&mut self) {
        if self.shared.state() == ConnectionState::Connected {
            // One final snapshot carrying the disconnect notice.
            self.send_queue
                .queue_reliable(ReliableMessage::new(opcode::DISCONNECT));
            let snapshot = self.shared.tree.lock().expect("tree poisoned").snapshot();
            self.send_queue.queue_snapshot(snapshot);
            self.send_queue
                .send_update(&mut self.encoder, &mut self.stats, self.clock.ticks());
        }

        self.shared.set_state(ConnectionState::Disconnected);

        let mut app = self.shared.app.lock().expect("app poisoned");
        let mut tree = self.shared.tree.lock().expect("tree poisoned");
        app.terminate(&mut tree);

        logging::info!(self.log, "client worker exited"; "context" => "shutdown");
    }
}

/// Handle to a client session. The network loop runs on its own worker
/// thread from `connect` until disconnect; the handle observes connection
/// state, exchanges messages and (in staged mode) applies snapshots.
pub struct Client<A: ClientApp> {
    shared: Arc<ClientShared<A>>,
    sender: MessageSender,
    clock: Clock,
    nonce: u16,
    prediction: PredictionConstants,
    thread: Option<thread::JoinHandle<()>>,
}

impl<A: ClientApp + Send + 'static> Client<A> {
    /// Starts the worker and begins connecting. The handle is available
    /// immediately; watch [`connection_state`](Client::connection_state).
    pub fn connect<'a, L: Into<Option<&'a Logger>>>(
        config: ClientConfig,
        app: A,
        log: L,
    ) -> Client<A> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        let nonce = loop {
            let candidate = rand::random::<u16>();
            if candidate != 0 {
                break candidate;
            }
        };

        let clock = Clock::new();
        let prediction = config.prediction;
        let sender = MessageSender::new();

        let shared = Arc::new(ClientShared {
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            disconnect: AtomicBool::new(false),
            connect_attempts: AtomicU32::new(0),
            data_received_recently: AtomicBool::new(true),
            fractured: AtomicBool::new(false),
            good_snapshots: AtomicU32::new(0),
            server_time_base: AtomicI64::new(0),
            server_tick_freq: AtomicI64::new(TICKS_PER_SECOND),
            client_time_base: AtomicI64::new(0),
            app: Mutex::new(app),
            tree: Mutex::new(StateTree::new(true)),
            completed: Mutex::new(VecDeque::new()),
            free: Mutex::new(VecDeque::new()),
            roster: Mutex::new(HashMap::new()),
            stats: Mutex::new(StatisticsRing::new()),
            remote_objects: Mutex::new(HashSet::new()),
        });

        let worker_shared = shared.clone();
        let worker_sender = sender.clone();
        let worker_config = config.clone();

        let thread = thread::spawn(move || {
            let user_name = if worker_config.user_name.is_empty() {
                format!("Player{}", nonce)
            } else {
                worker_config.user_name.clone()
            };

            let address = match socket::resolve(&worker_config.server, worker_config.port) {
                Ok(address) => address,
                Err(_) => {
                    worker_shared.set_state(ConnectionState::InvalidHostname);
                    return;
                }
            };

            let (socket, encoder_socket) = match UdpEndpoint::connect(address)
                .and_then(|s| s.try_clone().map(|c| (s, c)))
            {
                Ok(pair) => pair,
                Err(_) => {
                    worker_shared.set_state(ConnectionState::InvalidHostname);
                    return;
                }
            };

            let null_snapshot = worker_shared
                .tree
                .lock()
                .expect("tree poisoned")
                .null_snapshot();
            let now = clock.ticks();

            let mut worker = Worker {
                shared: worker_shared,
                clock,
                nonce,
                user_name,
                socket,
                encoder: Encoder::new(encoder_socket, None),
                send_queue: SnapshotSendQueue::with_sender(null_snapshot, now, worker_sender.clone()),
                sender: worker_sender,
                ack_tracker: SnapshotAckTracker::new(),
                dedup: ReliableDedup::new(),
                decode_log: PacketLog::new(),
                stats_log: StructuredLogFile::new(),
                current_queue: PacketQueue::new(),
                stats: FrameStatistics::default(),
                last_recv_ticks: 0,
                config: worker_config,
                log,
            };
            worker.run();
        });

        Client {
            shared,
            sender,
            clock,
            nonce,
            prediction,
            thread: Some(thread),
        }
    }
}

impl<A: ClientApp> Client<A> {
    #[inline]
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    #[inline]
    pub fn connect_attempts(&self) -> u32 {
        self.shared.connect_attempts.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn nonce(&self) -> u16 {
        self.nonce
    }

    #[inline]
    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    /// Recently received data and the last snapshot arrived whole.
    #[inline]
    pub fn is_network_good(&self) -> bool {
        !self.shared.fractured.load(Ordering::Relaxed)
            && self.shared.data_received_recently.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn good_snapshot_count(&self) -> u32 {
        self.shared.good_snapshots.load(Ordering::Relaxed)
    }

    pub fn roster(&self) -> Vec<RosterEntry> {
        self.shared
            .roster
            .lock()
            .expect("roster poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Estimated current value of the server's clock, projected from the
    /// handshake clock alignment.
    pub fn server_time_estimate(&self) -> i64 {
        let base = self.shared.client_time_base.load(Ordering::Relaxed);
        let server_base = self.shared.server_time_base.load(Ordering::Relaxed);
        let server_freq = self.shared.server_tick_freq.load(Ordering::Relaxed);

        let client_delta = self.clock.ticks() - base;
        let server_delta =
            (client_delta as i128 * server_freq as i128 / TICKS_PER_SECOND as i128) as i64;

        server_base + server_delta
    }

    /// Sends a chat line; destination 0 reaches everyone.
    pub fn submit_chat(&self, destination: u16, text: &str) {
        let chat = SubmitChat {
            destination,
            text: text.to_string(),
        };
        self.sender
            .queue_reliable(ReliableMessage::with_payload(opcode::SUBMIT_CHAT, chat.write()));
    }

    /// Runs a closure against the replicated tree (shared with the worker).
    pub fn with_tree<R>(&self, f: impl FnOnce(&mut StateTree) -> R) -> R {
        let mut tree = self.shared.tree.lock().expect("tree poisoned");
        f(&mut tree)
    }

    /// Runs a closure against the application state.
    pub fn with_app<R>(&self, f: impl FnOnce(&mut A) -> R) -> R {
        let mut app = self.shared.app.lock().expect("app poisoned");
        f(&mut app)
    }

    /// Statistics of the most recent completed frames.
    pub fn statistics(&self) -> MutexGuard<'_, StatisticsRing> {
        self.shared.stats.lock().expect("stats poisoned")
    }

    /// In staged mode: applies every completed snapshot batch to the tree.
    /// Call from the thread that owns rendering/simulation.
    pub fn single_threaded_tick(&self) {
        loop {
            let staged = self
                .shared
                .completed
                .lock()
                .expect("completed queue poisoned")
                .pop_front();

            let mut queue = match staged {
                Some(queue) => queue,
                None => break,
            };

            {
                let mut app = self.shared.app.lock().expect("app poisoned");
                let mut tree = self.shared.tree.lock().expect("tree poisoned");
                let mut remotes = self
                    .shared
                    .remote_objects
                    .lock()
                    .expect("remote set poisoned");
                apply_packet_queue(&mut tree, &mut *app, &mut remotes, &queue, &self.prediction);
            }

            queue.reset();
            self.shared
                .free
                .lock()
                .expect("free queue poisoned")
                .push_back(queue);
        }
    }

    #[inline]
    pub fn request_disconnect(&self) {
        self.shared.disconnect.store(true, Ordering::Relaxed);
    }

    /// Requests disconnect and waits (bounded) for the worker to send its
    /// final snapshot and exit.
    pub fn disconnect_and_wait(&mut self) {
        self.request_disconnect();

        if let Some(thread) = self.thread.take() {
            for _ in 0..5000 {
                if thread.is_finished() {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            if thread.is_finished() {
                drop(thread.join());
            }
        }

        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl<A: ClientApp> Drop for Client<A> {
    fn drop(&mut self) {
        self.shared.disconnect.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Server, ServerApp, ServerConfig};
    use crate::state::node::{self, NodeType};
    use crate::state::object::ReplicableObject;
    use crate::state::tree::Backing;
    use byteorder::ByteOrder;

    struct WorldApp;

    impl RemoteFactory for WorldApp {
        fn create_remote_object(
            &mut self,
            _parent_id: u32,
            _id: u32,
            _creation_blob: &[u8],
        ) -> Option<Box<dyn ReplicableObject>> {
            None
        }
    }

    impl ServerApp for WorldApp {
        fn init(&mut self, tree: &mut StateTree) {
            tree.create_node(0, 1, NodeType::Complex, Backing::None, 0, None, true);

            let mut value = [0u8; 4];
            byteorder::LittleEndian::write_f32(&mut value, 3.5);
            tree.create_node(
                1,
                10,
                NodeType::Float,
                Backing::Owned(value.to_vec()),
                0,
                None,
                true,
            );
        }

        fn tick(&mut self, _delta: f32, _absolute: f64, _tree: &mut StateTree) {}
    }

    struct MirrorApp;

    impl RemoteFactory for MirrorApp {
        fn create_remote_object(
            &mut self,
            _parent_id: u32,
            _id: u32,
            _creation_blob: &[u8],
        ) -> Option<Box<dyn ReplicableObject>> {
            None
        }
    }

    impl ClientApp for MirrorApp {
        fn tick(
            &mut self,
            _delta: f32,
            _absolute: f64,
            _tree: &mut StateTree,
            _sender: &MessageSender,
        ) {
        }
    }

    fn start_server() -> (std::thread::JoinHandle<()>, Arc<AtomicBool>, u16) {
        let config = ServerConfig {
            port: 0,
            frames_per_second: 50,
            ..ServerConfig::default()
        };
        let mut server = Server::bind(config, WorldApp, None).unwrap();
        let port = server.local_port();
        let flag = server.stop_flag();
        let handle = thread::spawn(move || server.run());
        (handle, flag, port)
    }

    fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        for _ in 0..5000 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn test_handshake_and_replication() {
        let (server_thread, server_flag, port) = start_server();

        let config = ClientConfig {
            server: "127.0.0.1".to_string(),
            port,
            frames_per_second: 50,
            user_name: "Alice".to_string(),
            ..ClientConfig::default()
        };
        let mut client = Client::connect(config, MirrorApp, None);

        wait_for("connection", || client.is_connected());

        // Roster includes ourselves.
        wait_for("roster", || {
            client.roster().iter().any(|e| e.is_self && e.user_name == "Alice")
        });

        // The server's float node arrives with its value.
        wait_for("replicated value", || {
            client.with_tree(|tree| {
                tree.expanded_bytes(10)
                    .map(|bytes| byteorder::LittleEndian::read_f32(&bytes) == 3.5)
                    .unwrap_or(false)
            })
        });

        assert!(client.with_tree(|tree| tree.find(1).is_some()));
        assert!(client.good_snapshot_count() > 0);
        assert!(client.is_network_good());

        client.disconnect_and_wait();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        server_flag.store(false, Ordering::Relaxed);
        server_thread.join().unwrap();
    }

    #[test]
    fn test_invalid_hostname() {
        let config = ClientConfig {
            server: "definitely-not-a-host.invalid.".to_string(),
            port: 1,
            ..ClientConfig::default()
        };
        let mut client = Client::connect(config, MirrorApp, None);

        wait_for("invalid hostname", || {
            client.connection_state() == ConnectionState::InvalidHostname
        });

        client.disconnect_and_wait();
    }

    #[test]
    fn test_staged_apply_path() {
        let (server_thread, server_flag, port) = start_server();

        let config = ClientConfig {
            server: "127.0.0.1".to_string(),
            port,
            frames_per_second: 50,
            user_name: "Stager".to_string(),
            staged_apply: true,
            ..ClientConfig::default()
        };
        let mut client = Client::connect(config, MirrorApp, None);

        wait_for("connection", || client.is_connected());

        // Nothing lands in the tree until the embedder applies the staged
        // queues.
        wait_for("staged queue", || {
            !client
                .shared
                .completed
                .lock()
                .unwrap()
                .is_empty()
        });
        assert!(client.with_tree(|tree| tree.find(10).is_none()));

        client.single_threaded_tick();

        assert!(client.with_tree(|tree| {
            tree.expanded_bytes(10)
                .map(|bytes| byteorder::LittleEndian::read_f32(&bytes) == 3.5)
                .unwrap_or(false)
        }));

        // Buffers recycle through the free list.
        assert!(!client.shared.free.lock().unwrap().is_empty());

        client.disconnect_and_wait();
        server_flag.store(false, Ordering::Relaxed);
        server_thread.join().unwrap();
    }

    #[test]
    fn test_sticky_delta_reaches_filter() {
        // Verifies the end-to-end delta path: a server-side Float3Delta node
        // yields a filterable value client-side.
        let mut storage = [0u8; 12];
        node::write_vec3(&mut storage, glam::Vec3::new(1.0, 2.0, 3.0));

        let mut tree = StateTree::new(true);
        tree.create_node(0, 1, NodeType::Complex, Backing::None, 0, None, false);
        tree.create_node(
            1,
            20,
            NodeType::Float3Delta,
            Backing::owned_zeroed(NodeType::Float3Delta),
            0,
            None,
            false,
        );

        let constants = PredictionConstants::default();
        tree.update_node_data(20, &storage, 1000, &constants);

        let sampled = tree.sample_vec3(20, 1000, &constants).unwrap();
        assert_eq!(sampled, glam::Vec3::new(1.0, 2.0, 3.0));
    }
}
