use crate::net::decoder::{ReliableDedup, WireEvent, WireReader};
use crate::net::encoder::Encoder;
use crate::net::message::{
    opcode, ClientConnected, ClientDisconnected, ConnectAck, ConnectAttempt, ReceiveChat,
    ReliableMessage, SubmitChat,
};
use crate::net::queue::{SnapshotAckTracker, SnapshotSendQueue};
use crate::net::socket::UdpEndpoint;
use crate::net::support::NetResult;
use crate::net::{DATAGRAM_SIZE, PROTOCOL_VERSION, TIMEOUT_SECONDS};
use crate::predict::PredictionConstants;
use crate::state::node::NodeType;
use crate::state::remote::{self, RemoteFactory};
use crate::state::tree::StateTree;
use crate::stats::StatisticsRing;
use hashbrown::{HashMap, HashSet};
use indexmap::IndexMap;
use quark::logfile::{StructuredLogFile, TimestampedLogFile};
use quark::logging::{self, Logger};
use quark::time::{timestamp_secs, Clock, TICKS_PER_SECOND};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Application hooks driven by the server's tick worker. All callbacks run
/// on the worker; the tree handed in is the authoritative one.
pub trait ServerApp: RemoteFactory {
    fn init(&mut self, _tree: &mut StateTree) {}

    fn tick(&mut self, delta: f32, absolute: f64, tree: &mut StateTree);

    fn client_connected(&mut self, _client: &ClientInfo, _tree: &mut StateTree) {}

    fn client_disconnected(&mut self, _client: &ClientInfo, _tree: &mut StateTree) {}

    /// A chat line starting with `/` or `\`. An optional reply is announced
    /// back to the issuing client.
    fn chat_command(&mut self, _client: &ClientInfo, _destination: u16, _line: &str) -> Option<String> {
        None
    }

    /// Application-defined reliable opcodes (64 and up). Return true when
    /// handled.
    fn reliable_message(
        &mut self,
        _client: &ClientInfo,
        _opcode: u32,
        _payload: &[u8],
        _tree: &mut StateTree,
    ) -> bool {
        false
    }

    fn terminate(&mut self, _tree: &mut StateTree) {}
}

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: u16,
    pub user_name: String,
    pub address: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub frames_per_second: u32,
    pub timeout_seconds: i64,
    /// Open a per-peer encoder CSV trace when a client connects.
    pub packet_logging: bool,
    pub prediction: PredictionConstants,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: 28008,
            frames_per_second: 20,
            timeout_seconds: TIMEOUT_SECONDS,
            packet_logging: false,
            prediction: PredictionConstants::default(),
        }
    }
}

/// Book-keeping for one remote endpoint. Exists from the first datagram; a
/// peer only counts as connected once the handshake assigned its id.
struct Peer {
    id: u16,
    user_name: String,
    address: SocketAddr,
    send_queue: SnapshotSendQueue,
    encoder: Encoder,
    ack_tracker: SnapshotAckTracker,
    dedup: ReliableDedup,
    last_recv_ticks: i64,
    server_ticks_at_connect: i64,
    client_ticks_at_connect: i64,
    client_tick_freq: i64,
}

impl Peer {
    #[inline]
    fn is_connected(&self) -> bool {
        self.id != 0
    }

    fn info(&self) -> ClientInfo {
        ClientInfo {
            id: self.id,
            user_name: self.user_name.clone(),
            address: self.address,
        }
    }
}

const CLIENT_REPORT_INTERVAL_SECS: i64 = 5;

/// The authoritative endpoint: accepts datagrams from any peer, demuxes
/// them by source address, applies them to the state tree, and distributes
/// a fresh snapshot to every connected peer each tick.
///
/// Drive it either by calling [`run_once`](Server::run_once) from an
/// embedder loop, or spawn the built-in worker thread with
/// [`Server::spawn`].
pub struct Server<A: ServerApp> {
    app: A,
    config: ServerConfig,
    socket: UdpEndpoint,
    tree: StateTree,

    peers: IndexMap<SocketAddr, Peer>,
    peers_by_id: HashMap<u16, SocketAddr>,
    remote_objects: HashSet<u32>,

    clock: Clock,
    frame_ticks: i64,
    start_ticks: i64,
    next_frame_ticks: i64,
    last_frame_ticks: i64,
    next_report_ticks: i64,
    current_ticks: i64,

    current_snapshot_index: u32,
    stats: StatisticsRing,
    stats_log: StructuredLogFile,
    text_log: TimestampedLogFile,

    running: Arc<AtomicBool>,
    started: bool,
    packet_discard: f32,

    log: Logger,
}

impl<A: ServerApp> Server<A> {
    /// Binds the listen socket and prepares a stepped server. Nothing runs
    /// until the first `run_once` call.
    pub fn bind<'a, L: Into<Option<&'a Logger>>>(
        config: ServerConfig,
        app: A,
        log: L,
    ) -> NetResult<Server<A>> {
        let socket = UdpEndpoint::bind(config.port)?;
        Ok(Self::with_socket(
            config,
            app,
            socket,
            Arc::new(AtomicBool::new(true)),
            match log.into() {
                Some(log) => log.new(logging::o!()),
                None => logging::discard(),
            },
        ))
    }

    fn with_socket(
        config: ServerConfig,
        app: A,
        socket: UdpEndpoint,
        running: Arc<AtomicBool>,
        log: Logger,
    ) -> Server<A> {
        let clock = Clock::new();
        let frame_ticks = TICKS_PER_SECOND / i64::from(config.frames_per_second.max(1));

        Server {
            app,
            config,
            socket,
            tree: StateTree::new(false),
            peers: IndexMap::new(),
            peers_by_id: HashMap::new(),
            remote_objects: HashSet::new(),
            clock,
            frame_ticks,
            start_ticks: 0,
            next_frame_ticks: 0,
            last_frame_ticks: 0,
            next_report_ticks: 0,
            current_ticks: 0,
            current_snapshot_index: 0,
            stats: StatisticsRing::new(),
            stats_log: StructuredLogFile::new(),
            text_log: TimestampedLogFile::new(),
            running,
            started: false,
            packet_discard: 0.0,
            log,
        }
    }

    /// Shared stop flag; clearing it makes the loop (or worker) wind down.
    #[inline]
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// The actual bound port (useful when configured with port 0).
    pub fn local_port(&self) -> u16 {
        self.socket
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.config.port)
    }

    #[inline]
    pub fn tree_mut(&mut self) -> &mut StateTree {
        &mut self.tree
    }

    #[inline]
    pub fn current_snapshot_index(&self) -> u32 {
        self.current_snapshot_index
    }

    #[inline]
    pub fn statistics(&self) -> &StatisticsRing {
        &self.stats
    }

    #[inline]
    pub fn connected_clients(&self) -> impl Iterator<Item = ClientInfo> + '_ {
        self.peers
            .values()
            .filter(|p| p.is_connected())
            .map(Peer::info)
    }

    /// Opens the timestamped text log (chat transcript, connect notices,
    /// periodic client report).
    pub fn start_logging(&mut self) -> std::io::Result<()> {
        let path = format!("server-{}.log", timestamp_secs());
        self.text_log.open(path, self.clock.ticks())
    }

    pub fn stop_logging(&mut self) {
        drop(self.text_log.close());
    }

    /// Randomly discards the given fraction of received datagrams. For
    /// exercising the fractured-snapshot path.
    pub fn enable_packet_drop_testing(&mut self, numerator: u32, denominator: u32) {
        if numerator == 0 || denominator == 0 {
            self.packet_discard = 0.0;
        } else {
            self.packet_discard = numerator.min(denominator) as f32 / denominator as f32;
        }
    }

    fn start(&mut self) {
        let now = self.clock.ticks();
        self.start_ticks = now;
        self.current_ticks = now;
        self.next_frame_ticks = now + self.frame_ticks;
        self.last_frame_ticks = now;
        self.next_report_ticks = now;
        self.started = true;

        self.app.init(&mut self.tree);

        logging::info!(self.log, "server started";
                       "context" => "start",
                       "port" => self.config.port,
                       "fps" => self.config.frames_per_second);
    }

    /// Performs at most one tick. Returns false when the frame deadline has
    /// not arrived yet (callers should sleep briefly) or the server has
    /// been stopped.
    pub fn run_once(&mut self) -> bool {
        if !self.running.load(Ordering::Relaxed) {
            if self.started {
                self.started = false;
                self.app.terminate(&mut self.tree);
            }
            return false;
        }

        if !self.started {
            self.start();
        }

        let now = self.clock.ticks();
        if now < self.next_frame_ticks {
            return false;
        }

        self.next_frame_ticks = now + self.frame_ticks;
        self.current_ticks = now;

        let delta_ticks = (now - self.last_frame_ticks).min(self.frame_ticks);
        let absolute = (now - self.start_ticks) as f64 / TICKS_PER_SECOND as f64;
        let delta = (delta_ticks as f64 / TICKS_PER_SECOND as f64) as f32;
        self.last_frame_ticks = now;

        self.stats.current_mut().timestamp = now;

        self.process_incoming(now);
        self.sweep_timeouts(now);
        self.client_report(now);

        self.app.tick(delta, absolute, &mut self.tree);

        let snapshot = self.tree.snapshot();
        self.current_snapshot_index = snapshot.index();

        for peer in self.peers.values_mut() {
            if peer.is_connected() {
                peer.send_queue.queue_snapshot(snapshot.clone());
                peer.send_queue
                    .send_update(&mut peer.encoder, self.stats.current_mut(), now);
            }
        }

        self.stats.advance(&mut self.stats_log);

        true
    }

    /// Runs until the stop flag clears, sleeping between frames.
    pub fn run(&mut self) {
        while self.running.load(Ordering::Relaxed) {
            if !self.run_once() {
                thread::sleep(Duration::from_millis(1));
            }
        }
        // Deliver the terminate callback.
        self.run_once();
    }

    /// Binds the socket, then runs the whole server on a worker thread.
    pub fn spawn<'a, L: Into<Option<&'a Logger>>>(
        config: ServerConfig,
        app: A,
        log: L,
    ) -> NetResult<ServerWorker>
    where
        A: Send + 'static,
    {
        let socket = UdpEndpoint::bind(config.port)?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        let thread = thread::spawn(move || {
            let mut server = Server::with_socket(config, app, socket, flag, log);
            server.run();
        });

        Ok(ServerWorker {
            running,
            thread: Some(thread),
        })
    }

    // --- receive path ------------------------------------------------------

    fn process_incoming(&mut self, now: i64) {
        let mut buf = [0u8; DATAGRAM_SIZE];

        loop {
            match self.socket.recv_from(&mut buf) {
                Ok(Some((size, addr))) => {
                    if size == 0 {
                        continue;
                    }

                    if self.packet_discard > 0.0 && rand::random::<f32>() < self.packet_discard {
                        continue;
                    }

                    let stats = self.stats.current_mut();
                    stats.bytes_received += size as u32;
                    stats.packets_received += 1;

                    self.process_datagram(addr, &buf[..size], now);
                }
                Ok(None) => break,
                Err(err) => {
                    logging::warn!(self.log, "receive failed"; "context" => "recv", "error" => ?err);
                    break;
                }
            }
        }
    }

    fn touch_peer(&mut self, addr: SocketAddr, now: i64) -> bool {
        if !self.peers.contains_key(&addr) {
            let encoder_socket = match self.socket.try_clone() {
                Ok(socket) => socket,
                Err(err) => {
                    logging::warn!(self.log, "socket clone failed"; "context" => "accept", "error" => ?err);
                    return false;
                }
            };

            logging::debug!(self.log, "provisional peer"; "context" => "accept", "addr" => %addr);

            self.peers.insert(
                addr,
                Peer {
                    id: 0,
                    user_name: String::new(),
                    address: addr,
                    send_queue: SnapshotSendQueue::new(self.tree.null_snapshot(), now),
                    encoder: Encoder::new(encoder_socket, Some(addr)),
                    ack_tracker: SnapshotAckTracker::new(),
                    dedup: ReliableDedup::new(),
                    last_recv_ticks: now,
                    server_ticks_at_connect: 0,
                    client_ticks_at_connect: 0,
                    client_tick_freq: 0,
                },
            );
        }

        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.last_recv_ticks = now;
        }
        true
    }

    fn process_datagram(&mut self, addr: SocketAddr, data: &[u8], now: i64) {
        if !self.touch_peer(addr, now) {
            return;
        }

        for item in WireReader::new(data) {
            let packet = match item {
                Ok(packet) => packet,
                Err(err) => {
                    logging::warn!(self.log, "malformed datagram"; "context" => "decode", "addr" => %addr, "error" => ?err);
                    break;
                }
            };

            match packet.event {
                WireEvent::NoOp => {}
                WireEvent::Acknowledge { index } => {
                    self.stats.current_mut().ack_messages_received += 1;
                    if let Some(peer) = self.peers.get_mut(&addr) {
                        peer.send_queue.ack_snapshot(index, now);
                    }
                }
                WireEvent::BeginSnapshot { index } => {
                    self.stats.current_mut().begin_snapshots_received += 1;
                    let accepted = match self.peers.get_mut(&addr) {
                        Some(peer) => peer.ack_tracker.begin_snapshot(index),
                        None => false,
                    };
                    if !accepted {
                        // Stale snapshot; drop the rest of this datagram.
                        break;
                    }
                }
                WireEvent::EndSnapshot {
                    index,
                    packet_count,
                } => {
                    self.stats.current_mut().end_snapshots_received += 1;
                    if let Some(peer) = self.peers.get_mut(&addr) {
                        if let Some(ack) = peer.ack_tracker.end_snapshot(index, packet_count) {
                            peer.send_queue.queue_acknowledge(ack);
                        }
                    }
                }
                WireEvent::ReliableMessage {
                    opcode,
                    unique_index,
                    payload,
                } => {
                    let fresh = match self.peers.get_mut(&addr) {
                        Some(peer) => peer.dedup.accept(unique_index),
                        None => false,
                    };

                    let stats = self.stats.current_mut();
                    if fresh {
                        stats.reliable_messages_received += 1;
                        stats.reliable_message_bytes_received += packet.raw.len() as u32;
                        self.handle_reliable(addr, opcode, payload, now);
                    } else {
                        stats.duplicate_reliable_messages_skipped += 1;
                    }
                }
                WireEvent::UnreliableMessage { opcode, payload } => {
                    let stats = self.stats.current_mut();
                    stats.unreliable_messages_received += 1;
                    stats.unreliable_message_bytes_received += packet.raw.len() as u32;
                    self.handle_reliable(addr, opcode, payload, now);
                }
                WireEvent::NodeUpdate { id, storage } => {
                    let stats = self.stats.current_mut();
                    stats.node_update_messages_received += 1;
                    stats.node_update_bytes_received += packet.raw.len() as u32;
                    self.tree
                        .update_node_data(id, storage, now, &self.config.prediction);
                }
                WireEvent::NodeCreate {
                    id,
                    parent_id,
                    node_type_tag,
                    creation_code,
                    blob,
                } => {
                    if let Some(node_type) = NodeType::from_u8(node_type_tag) {
                        // Client-authored state re-broadcasts to other peers.
                        remote::handle_create_node(
                            &mut self.tree,
                            &mut self.app,
                            &mut self.remote_objects,
                            parent_id,
                            id,
                            node_type,
                            creation_code,
                            blob,
                            true,
                        );
                    }
                }
                WireEvent::NodeDelete { id } => {
                    remote::handle_delete_node(
                        &mut self.tree,
                        &mut self.app,
                        &mut self.remote_objects,
                        id,
                    );
                }
            }
        }
    }

    fn handle_reliable(&mut self, addr: SocketAddr, opcode: u32, payload: &[u8], now: i64) {
        match opcode {
            opcode::CONNECT_ATTEMPT => self.handle_connect_attempt(addr, payload, now),
            opcode::DISCONNECT => {
                if let Some(peer) = self.peers.get_mut(&addr) {
                    // Zeroing the receive time lets the sweep reap it as a
                    // clean disconnect.
                    peer.last_recv_ticks = 0;
                }
            }
            opcode::SUBMIT_CHAT => {
                let chat = match SubmitChat::read(payload) {
                    Ok(chat) => chat,
                    Err(_) => return,
                };

                let info = match self.peers.get(&addr) {
                    Some(peer) if peer.is_connected() => peer.info(),
                    _ => return,
                };

                self.text_log
                    .write_line(now, &format!("Chat from {}: {}", info.user_name, chat.text));

                if chat.text.starts_with('/') || chat.text.starts_with('\\') {
                    if let Some(reply) = self.app.chat_command(&info, chat.destination, &chat.text)
                    {
                        self.relay_chat(0, info.id, &reply, now);
                    }
                } else {
                    self.relay_chat(info.id, chat.destination, &chat.text, now);
                }
            }
            _ if opcode >= opcode::FIRST_APPLICATION => {
                let info = match self.peers.get(&addr) {
                    Some(peer) => peer.info(),
                    None => return,
                };
                self.app
                    .reliable_message(&info, opcode, payload, &mut self.tree);
            }
            _ => {
                logging::debug!(self.log, "unhandled core opcode"; "context" => "reliable", "opcode" => opcode);
            }
        }
    }

    fn handle_connect_attempt(&mut self, addr: SocketAddr, payload: &[u8], now: i64) {
        let attempt = match ConnectAttempt::read(payload) {
            Ok(attempt) => attempt,
            Err(_) => return,
        };

        let peer = match self.peers.get_mut(&addr) {
            Some(peer) => peer,
            None => return,
        };

        if peer.id == attempt.nonce {
            // Retransmitted handshake of an accepted connection.
            return;
        }

        if peer.id != 0 {
            logging::warn!(self.log, "connect attempt on live connection";
                           "context" => "handshake",
                           "addr" => %addr,
                           "nonce" => attempt.nonce);
            return;
        }

        let success = attempt.protocol_version == PROTOCOL_VERSION && attempt.nonce != 0;

        peer.id = attempt.nonce;
        peer.server_ticks_at_connect = now;
        peer.client_ticks_at_connect = attempt.client_ticks;
        peer.client_tick_freq = attempt.client_tick_freq;
        self.peers_by_id.insert(attempt.nonce, addr);

        let ack = ConnectAck {
            success: success as u32,
            nonce: attempt.nonce,
            server_ticks: now,
            server_tick_freq: TICKS_PER_SECOND,
            client_ticks: attempt.client_ticks,
        };
        peer.send_queue
            .queue_reliable(ReliableMessage::with_payload(opcode::CONNECT_ACK, ack.write()));

        if success {
            peer.user_name = attempt.user_name.clone();
            self.process_client_connected(addr, now);
        } else {
            logging::info!(self.log, "connect refused";
                           "context" => "handshake",
                           "addr" => %addr,
                           "protocol" => attempt.protocol_version);
            peer.last_recv_ticks = 0;
        }
    }

    fn process_client_connected(&mut self, addr: SocketAddr, now: i64) {
        let info = match self.peers.get(&addr) {
            Some(peer) => peer.info(),
            None => return,
        };

        logging::info!(self.log, "client connected";
                       "context" => "handshake",
                       "addr" => %addr,
                       "client_id" => info.id,
                       "user" => &info.user_name);

        if self.config.packet_logging {
            let path = format!("server-encoder-{}-{}.csv", timestamp_secs(), info.id);
            if let Some(peer) = self.peers.get_mut(&addr) {
                drop(peer.encoder.log_mut().open(path));
            }
        }

        // Roster fan-out: everyone learns about the newcomer; the newcomer
        // learns about everyone, itself included.
        let roster: Vec<(u16, String)> = self
            .peers
            .values()
            .filter(|p| p.is_connected())
            .map(|p| (p.id, p.user_name.clone()))
            .collect();

        let newcomer = ClientConnected {
            nonce: info.id,
            user_name: info.user_name.clone(),
        }
        .write();

        for peer in self.peers.values() {
            if !peer.is_connected() {
                continue;
            }

            if peer.address == addr {
                for (id, user_name) in &roster {
                    let message = ClientConnected {
                        nonce: *id,
                        user_name: user_name.clone(),
                    };
                    peer.send_queue.queue_reliable(ReliableMessage::with_payload(
                        opcode::CLIENT_CONNECTED,
                        message.write(),
                    ));
                }
            } else {
                peer.send_queue.queue_reliable(ReliableMessage::with_payload(
                    opcode::CLIENT_CONNECTED,
                    newcomer.clone(),
                ));
            }
        }

        self.send_server_announcement(&format!("{} connected to the server.", info.user_name), now);

        self.app.client_connected(&info, &mut self.tree);
    }

    fn process_client_disconnected(&mut self, addr: SocketAddr, now: i64) {
        let peer = match self.peers.shift_remove(&addr) {
            Some(peer) => peer,
            None => return,
        };
        self.peers_by_id.remove(&peer.id);

        if !peer.is_connected() {
            return;
        }

        let info = peer.info();
        let reason = if peer.last_recv_ticks == 0 {
            "clean disconnect"
        } else {
            "timeout"
        };

        logging::info!(self.log, "client disconnected";
                       "context" => "disconnect",
                       "client_id" => info.id,
                       "user" => &info.user_name,
                       "reason" => reason);

        let notice = ClientDisconnected { nonce: info.id }.write();
        for other in self.peers.values() {
            if other.is_connected() {
                other.send_queue.queue_reliable(ReliableMessage::with_payload(
                    opcode::CLIENT_DISCONNECTED,
                    notice.clone(),
                ));
            }
        }

        self.send_server_announcement(
            &format!("{} disconnected from the server ({}).", info.user_name, reason),
            now,
        );

        self.app.client_disconnected(&info, &mut self.tree);
    }

    fn sweep_timeouts(&mut self, now: i64) {
        let expired = now - TICKS_PER_SECOND * self.config.timeout_seconds;

        let dead: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|peer| peer.last_recv_ticks <= expired)
            .map(|peer| peer.address)
            .collect();

        for addr in dead {
            self.process_client_disconnected(addr, now);
        }
    }

    fn client_report(&mut self, now: i64) {
        if now < self.next_report_ticks || !self.text_log.is_open() {
            return;
        }
        self.next_report_ticks = now + TICKS_PER_SECOND * CLIENT_REPORT_INTERVAL_SECS;

        self.text_log.write_line(
            now,
            &format!("Current snapshot index: {}", self.current_snapshot_index),
        );

        let lines: Vec<String> = self
            .peers
            .values()
            .filter(|p| p.is_connected())
            .map(|peer| {
                let acked = peer.send_queue.last_acked();
                format!(
                    "Client \"{}\" [CID {}]: Last ack snapshot {} (delta {})",
                    peer.user_name,
                    peer.id,
                    acked,
                    i64::from(self.current_snapshot_index) - i64::from(acked)
                )
            })
            .collect();

        for line in lines {
            self.text_log.write_line(now, &line);
        }
    }

    /// Relays a chat line. Destination 0 broadcasts; source 0 is the server.
    fn relay_chat(&mut self, source: u16, destination: u16, text: &str, _now: i64) {
        let message = ReliableMessage::with_payload(
            opcode::RECEIVE_CHAT,
            ReceiveChat {
                source,
                text: text.to_string(),
            }
            .write(),
        );

        if destination == 0 {
            for peer in self.peers.values() {
                if peer.is_connected() {
                    peer.send_queue.queue_reliable(message.clone());
                }
            }
        } else if let Some(addr) = self.peers_by_id.get(&destination) {
            if let Some(peer) = self.peers.get(addr) {
                peer.send_queue.queue_reliable(message);
            }
        }
    }

    /// Broadcasts a server-sourced chat announcement to every client.
    pub fn send_server_announcement(&mut self, text: &str, now: i64) {
        self.text_log
            .write_line(now, &format!("Chat from Server: {}", text));
        self.relay_chat(0, 0, text, now);
    }
}

/// Handle to a server running on its own thread.
pub struct ServerWorker {
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerWorker {
    /// Signals the worker to stop and waits (bounded) for it to exit.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);

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
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for ServerWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::object::ReplicableObject;

    struct NullApp {
        ticks: u32,
    }

    impl RemoteFactory for NullApp {
        fn create_remote_object(
            &mut self,
            _parent_id: u32,
            _id: u32,
            _creation_blob: &[u8],
        ) -> Option<Box<dyn ReplicableObject>> {
            None
        }
    }

    impl ServerApp for NullApp {
        fn tick(&mut self, _delta: f32, _absolute: f64, _tree: &mut StateTree) {
            self.ticks += 1;
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            frames_per_second: 1000,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn test_run_once_ticks_at_frame_rate() {
        let mut server = Server::bind(test_config(), NullApp { ticks: 0 }, None).unwrap();

        // First call starts and ticks.
        while !server.run_once() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(server.app.ticks, 1);
        assert_eq!(server.current_snapshot_index(), 1);

        // Immediately after, the next frame is not due.
        let ticked = server.run_once();
        if ticked {
            assert_eq!(server.app.ticks, 2);
        } else {
            assert_eq!(server.app.ticks, 1);
        }
    }

    #[test]
    fn test_stop_flag_terminates() {
        let mut server = Server::bind(test_config(), NullApp { ticks: 0 }, None).unwrap();

        while !server.run_once() {
            thread::sleep(Duration::from_millis(1));
        }

        server.stop_flag().store(false, Ordering::Relaxed);
        assert!(!server.run_once());
        assert!(!server.started);
    }

    #[test]
    fn test_spawn_and_stop() {
        let worker = Server::spawn(test_config(), NullApp { ticks: 0 }, None).unwrap();
        thread::sleep(Duration::from_millis(20));
        worker.stop();
    }

    #[test]
    fn test_provisional_peer_created_on_datagram() {
        let mut server = Server::bind(test_config(), NullApp { ticks: 0 }, None).unwrap();
        let addr: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        assert!(server.touch_peer(addr, 100));
        assert!(server.peers.contains_key(&addr));
        assert!(!server.peers[&addr].is_connected());
        assert_eq!(server.peers[&addr].last_recv_ticks, 100);
    }

    #[test]
    fn test_handshake_assigns_id_and_acks() {
        let mut server = Server::bind(test_config(), NullApp { ticks: 0 }, None).unwrap();
        let addr: SocketAddr = "127.0.0.1:9998".parse().unwrap();
        server.touch_peer(addr, 1);

        let attempt = ConnectAttempt {
            protocol_version: PROTOCOL_VERSION,
            nonce: 0xABCD,
            user_name: "Alice".to_string(),
            hashed_password: "password".to_string(),
            client_ticks: 5,
            client_tick_freq: TICKS_PER_SECOND,
        };
        server.handle_reliable(addr, opcode::CONNECT_ATTEMPT, &attempt.write(), 10);

        let peer = &server.peers[&addr];
        assert_eq!(peer.id, 0xABCD);
        assert_eq!(peer.user_name, "Alice");
        assert!(server.peers_by_id.contains_key(&0xABCD));

        // Duplicate attempt is discarded silently.
        server.handle_reliable(addr, opcode::CONNECT_ATTEMPT, &attempt.write(), 20);
        assert_eq!(server.peers[&addr].id, 0xABCD);
    }

    #[test]
    fn test_handshake_version_mismatch_refused() {
        let mut server = Server::bind(test_config(), NullApp { ticks: 0 }, None).unwrap();
        let addr: SocketAddr = "127.0.0.1:9997".parse().unwrap();
        server.touch_peer(addr, 1);

        let attempt = ConnectAttempt {
            protocol_version: 3,
            nonce: 0x1234,
            user_name: "Old".to_string(),
            hashed_password: String::new(),
            client_ticks: 0,
            client_tick_freq: 1,
        };
        server.handle_reliable(addr, opcode::CONNECT_ATTEMPT, &attempt.write(), 10);

        // The refusal zeroes the receive time so the sweep reaps the peer.
        assert_eq!(server.peers[&addr].last_recv_ticks, 0);

        server.sweep_timeouts(TICKS_PER_SECOND * 100);
        assert!(!server.peers.contains_key(&addr));
    }

    #[test]
    fn test_timeout_sweep_disconnects() {
        let mut server = Server::bind(test_config(), NullApp { ticks: 0 }, None).unwrap();
        let addr: SocketAddr = "127.0.0.1:9996".parse().unwrap();
        server.touch_peer(addr, 1);

        // Recent peer survives.
        server.sweep_timeouts(2);
        assert!(server.peers.contains_key(&addr));

        // Stale peer is reaped.
        server.sweep_timeouts(TICKS_PER_SECOND * (TIMEOUT_SECONDS + 1));
        assert!(!server.peers.contains_key(&addr));
    }
}
