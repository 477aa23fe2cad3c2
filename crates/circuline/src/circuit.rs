//! One reliable conversation with a single simulator endpoint: sequencing,
//! selective ACKs with piggyback tails, bounded resends, duplicate
//! suppression, ping/latency tracking and the connection handshake.

use crate::consts;
use crate::error::{CircuitError, Result};
use crate::events::{EventHub, Signal, Subscription};
use crate::protocol::messages::{
    CompleteAgentMovement, CompletePingCheck, Message, PacketAck, RegionHandshakeReply,
    StartPingCheck, UseCircuitCode,
};
use crate::protocol::{self, PacketHeader, acks, zerocode};
use crate::reliability::{NeedAckMap, OutgoingPacket, PacketArchive};
use crate::stats::{CircuitStats, StatsSnapshot};
use crate::throttle::{ThrottleCategory, ThrottleQueues};
use bytes::Bytes;
use log::{debug, info, trace, warn};
use opaline_binary::io::BinaryWriter;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Tunables for one circuit. Defaults match the protocol constants; tests
/// shrink the intervals to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub mtu: usize,
    pub network_tick: Duration,
    pub resend_timeout: Duration,
    pub max_resends: u8,
    pub ping_interval: Duration,
    pub stats_interval: Duration,
    pub liveness_interval: Duration,
    pub max_pending_acks: usize,
    pub archive_capacity: usize,
    pub login_timeout: Duration,
    pub logout_timeout: Duration,
    pub move_in_delay: Duration,
    pub send_pings: bool,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            mtu: consts::MTU,
            network_tick: consts::NETWORK_TICK,
            resend_timeout: consts::RESEND_TIMEOUT,
            max_resends: consts::MAX_RESENDS,
            ping_interval: consts::PING_INTERVAL,
            stats_interval: consts::STATS_INTERVAL,
            liveness_interval: consts::LIVENESS_INTERVAL,
            max_pending_acks: consts::MAX_PENDING_ACKS,
            archive_capacity: consts::PACKET_ARCHIVE_SIZE,
            login_timeout: consts::LOGIN_TIMEOUT,
            logout_timeout: consts::LOGOUT_TIMEOUT,
            move_in_delay: consts::MOVE_IN_DELAY,
            send_pings: true,
        }
    }
}

/// Identity of the simulator session being opened.
#[derive(Debug, Clone, Copy)]
pub struct CircuitParams {
    pub remote: SocketAddr,
    pub region_handle: u64,
    pub circuit_code: u32,
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

/// Connection lifecycle of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Disconnected,
    /// Socket open, UseCircuitCode in flight.
    Connecting,
    /// UseCircuitCode acknowledged, waiting for the region handshake.
    Handshaking,
    /// Region handshake received, circuit fully up.
    Connected,
    /// Teardown in progress.
    Disconnecting,
}

struct Shared {
    cfg: CircuitConfig,
    socket: UdpSocket,
    remote: SocketAddr,
    region_handle: u64,
    circuit_code: u32,
    agent_id: Uuid,
    session_id: Uuid,

    sequence: AtomicU32,
    pending_acks: Mutex<VecDeque<u32>>,
    need_ack: NeedAckMap,
    archive: Mutex<PacketArchive>,
    throttle: ThrottleQueues,
    stats: CircuitStats,

    state: Mutex<CircuitState>,
    connected: AtomicBool,
    disconnect_candidate: AtomicBool,
    agent_movement_complete: AtomicBool,
    connect_time: Mutex<Option<Instant>>,

    handshake_acked: Signal,
    region_handshake: Signal,
    logout_reply: Signal,

    next_ping_id: AtomicU8,
    ping_sent: Mutex<Option<(u8, Instant)>>,

    events: EventHub<Arc<Message>>,
    closing: CancellationToken,
}

/// A live session with one simulator.
pub struct Circuit {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Circuit {
    /// Binds a socket toward `params.remote` and starts the receive
    /// worker, the send pump and the schedulers. The circuit starts in
    /// `Connecting`; call [`Circuit::connect`] to run the handshake.
    pub async fn open(cfg: CircuitConfig, params: CircuitParams) -> Result<Arc<Circuit>> {
        let bind_ip: IpAddr = if params.remote.is_ipv4() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        };
        let bind_addr = SocketAddr::new(bind_ip, 0);
        let socket = UdpSocket::bind(bind_addr).await?;
        info!(
            "[{}] Circuit socket bound to {} (region handle {})",
            params.remote,
            socket.local_addr()?,
            params.region_handle
        );

        let archive_capacity = cfg.archive_capacity;
        let shared = Arc::new(Shared {
            cfg,
            socket,
            remote: params.remote,
            region_handle: params.region_handle,
            circuit_code: params.circuit_code,
            agent_id: params.agent_id,
            session_id: params.session_id,
            sequence: AtomicU32::new(0),
            pending_acks: Mutex::new(VecDeque::new()),
            need_ack: NeedAckMap::new(),
            archive: Mutex::new(PacketArchive::new(archive_capacity)),
            throttle: ThrottleQueues::new(),
            stats: CircuitStats::new(),
            state: Mutex::new(CircuitState::Connecting),
            connected: AtomicBool::new(false),
            disconnect_candidate: AtomicBool::new(false),
            agent_movement_complete: AtomicBool::new(false),
            connect_time: Mutex::new(None),
            handshake_acked: Signal::new(),
            region_handshake: Signal::new(),
            logout_reply: Signal::new(),
            next_ping_id: AtomicU8::new(0),
            ping_sent: Mutex::new(None),
            events: EventHub::new(),
            closing: CancellationToken::new(),
        });

        let circuit = Arc::new(Circuit {
            shared: Arc::clone(&shared),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = circuit.tasks.lock().unwrap();
        tasks.push(tokio::spawn(recv_loop(Arc::clone(&shared))));
        tasks.push(tokio::spawn(send_pump(Arc::clone(&shared))));
        tasks.push(tokio::spawn(scheduler(Arc::clone(&shared))));
        drop(tasks);

        Ok(circuit)
    }

    /// Runs the handshake: UseCircuitCode reliably, await its ACK, await
    /// the region handshake. With `move_to_sim`, CompleteAgentMovement is
    /// sent after the settle delay.
    pub async fn connect(&self, move_to_sim: bool) -> Result<()> {
        let shared = &self.shared;
        shared.set_state(CircuitState::Connecting);
        shared
            .send_message(
                Message::UseCircuitCode(UseCircuitCode {
                    code: shared.circuit_code,
                    session_id: shared.session_id,
                    agent_id: shared.agent_id,
                }),
                true,
                false,
            )
            .await?;

        timeout(shared.cfg.login_timeout, shared.handshake_acked.wait())
            .await
            .map_err(|_| CircuitError::Timeout("UseCircuitCode ack"))?;
        shared.set_state(CircuitState::Handshaking);
        debug!("[{}] Circuit code acknowledged", shared.remote);

        timeout(shared.cfg.login_timeout, shared.region_handshake.wait())
            .await
            .map_err(|_| CircuitError::Timeout("region handshake"))?;

        if move_to_sim {
            tokio::time::sleep(shared.cfg.move_in_delay).await;
            shared
                .send_message(
                    Message::CompleteAgentMovement(CompleteAgentMovement {
                        agent_id: shared.agent_id,
                        session_id: shared.session_id,
                        circuit_code: shared.circuit_code,
                    }),
                    true,
                    false,
                )
                .await?;
        }
        Ok(())
    }

    /// Queues a message on the default (task) throttle category.
    pub async fn send(&self, message: Message, reliable: bool, zerocoded: bool) -> Result<()> {
        self.shared.send_message(message, reliable, zerocoded).await
    }

    /// Queues a message on an explicit throttle category.
    pub async fn send_in_category(
        &self,
        message: Message,
        reliable: bool,
        zerocoded: bool,
        category: ThrottleCategory,
    ) -> Result<()> {
        self.shared
            .send_message_in(message, reliable, zerocoded, category)
            .await
    }

    /// Graceful logout: LogoutRequest (throttle bypass), bounded wait for
    /// LogoutReply, then teardown without CloseCircuit.
    pub async fn logout(&self) -> Result<()> {
        self.shared
            .send_message(
                Message::LogoutRequest(crate::protocol::messages::LogoutRequest {
                    agent_id: self.shared.agent_id,
                    session_id: self.shared.session_id,
                }),
                true,
                false,
            )
            .await?;
        if timeout(self.shared.cfg.logout_timeout, self.shared.logout_reply.wait())
            .await
            .is_err()
        {
            warn!(
                "[{}] No LogoutReply within {:?}, closing anyway",
                self.shared.remote, self.shared.cfg.logout_timeout
            );
        }
        self.close(false).await;
        Ok(())
    }

    /// Stops schedulers, optionally emits CloseCircuit, releases the
    /// socket tasks.
    pub async fn close(&self, send_close_circuit: bool) {
        self.shared.set_state(CircuitState::Disconnecting);
        if send_close_circuit {
            if let Ok(body) = Message::CloseCircuit.encode() {
                let sequence = self.shared.next_sequence();
                if let Ok(packet) = self.shared.frame(body, 0, sequence, protocol::CLOSE_CIRCUIT) {
                    self.shared.emit(&packet).await;
                }
            }
        }
        self.shared.begin_close();
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            handle.abort();
        }
        self.shared.set_state(CircuitState::Disconnected);
        info!("[{}] Circuit closed", self.shared.remote);
    }

    pub fn subscribe(&self) -> Subscription<Arc<Message>> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> CircuitState {
        *self.shared.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn handshake_complete(&self) -> bool {
        self.shared.region_handshake.is_set()
    }

    pub fn agent_movement_complete(&self) -> bool {
        self.shared.agent_movement_complete.load(Ordering::Acquire)
    }

    pub fn connect_time(&self) -> Option<Instant> {
        *self.shared.connect_time.lock().unwrap()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn remote(&self) -> SocketAddr {
        self.shared.remote
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    pub fn region_handle(&self) -> u64 {
        self.shared.region_handle
    }

    pub fn circuit_code(&self) -> u32 {
        self.shared.circuit_code
    }

    pub fn agent_id(&self) -> Uuid {
        self.shared.agent_id
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        self.shared.begin_close();
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

impl Shared {
    fn set_state(&self, state: CircuitState) {
        *self.state.lock().unwrap() = state;
    }

    fn begin_close(&self) {
        self.connected.store(false, Ordering::Release);
        self.throttle.clear();
        self.closing.cancel();
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stamps a header in front of `body` and wraps it as an
    /// [`OutgoingPacket`]. `flags` must not include APPENDED_ACKS; the
    /// tail is added per emission.
    fn frame(&self, body: Bytes, flags: u8, sequence: u32, num: u32) -> Result<OutgoingPacket> {
        let mut writer = BinaryWriter::with_capacity(consts::MIN_HEADER + body.len());
        PacketHeader::new(flags, sequence).encode(&mut writer)?;
        writer.write_bytes(&body)?;
        Ok(OutgoingPacket {
            buffer: writer.into_inner(),
            num,
            sequence,
            category: ThrottleCategory::Task,
            reliable: flags & protocol::FLAG_RELIABLE != 0,
            first_sent: None,
            resend_count: 0,
        })
    }

    async fn send_message(&self, message: Message, reliable: bool, zerocoded: bool) -> Result<()> {
        self.send_message_in(message, reliable, zerocoded, ThrottleCategory::Task)
            .await
    }

    async fn send_message_in(
        &self,
        message: Message,
        reliable: bool,
        zerocoded: bool,
        category: ThrottleCategory,
    ) -> Result<()> {
        if self.closing.is_cancelled() {
            return Err(CircuitError::Closed);
        }
        let max_body = self.cfg.mtu - consts::MIN_HEADER;
        let num = message.num();

        for part in message.split_for_mtu(max_body) {
            let body = part.encode()?;
            let mut flags = 0u8;
            let wire_body: Bytes = if zerocoded {
                match zerocode::zero_encode(&body, max_body) {
                    Some(encoded) => {
                        flags |= protocol::FLAG_ZEROCODED;
                        Bytes::from(encoded)
                    }
                    // Encoded form exceeded the MTU; send raw instead.
                    None => body,
                }
            } else {
                body
            };
            if wire_body.len() > max_body {
                return Err(CircuitError::Oversize {
                    len: wire_body.len(),
                    mtu: self.cfg.mtu,
                });
            }
            if reliable {
                flags |= protocol::FLAG_RELIABLE;
            }

            let sequence = self.next_sequence();
            let mut packet = self.frame(wire_body, flags, sequence, num)?;
            packet.category = category;
            if reliable {
                self.need_ack.insert(packet.clone());
            }

            // PacketAck and LogoutRequest skip the throttle entirely.
            if num == protocol::PACKET_ACK || num == protocol::LOGOUT_REQUEST {
                self.emit(&packet).await;
            } else {
                self.throttle.push(packet);
            }
        }
        Ok(())
    }

    /// Final emitter: drains pending ACKs onto the tail, puts the
    /// datagram on the wire and stamps the first-sent tick (only when the
    /// packet carries none, so resends are restamped here).
    async fn emit(&self, packet: &OutgoingPacket) {
        let mut wire = packet.buffer.to_vec();
        {
            let mut pending = self.pending_acks.lock().unwrap();
            if acks::append_acks(&mut wire, &mut pending, self.cfg.mtu) > 0 {
                wire[0] |= protocol::FLAG_APPENDED_ACKS;
            }
        }

        match self.socket.send_to(&wire, self.remote).await {
            Ok(sent) => {
                self.stats.sent_packets.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .sent_bytes
                    .fetch_add(sent as u64, Ordering::Relaxed);
                if packet.reliable {
                    self.need_ack.mark_sent(packet.sequence, Instant::now());
                }
                trace!(
                    "[{}] Sent {} #{} ({} bytes)",
                    self.remote,
                    protocol::message_name(packet.num),
                    packet.sequence,
                    sent
                );
            }
            Err(e) => {
                warn!(
                    "[{}] Failed to send {} #{}: {}",
                    self.remote,
                    protocol::message_name(packet.num),
                    packet.sequence,
                    e
                );
            }
        }
    }

    async fn process_datagram(&self, data: &[u8]) {
        let (header, body_start) = match PacketHeader::decode(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("[{}] Malformed datagram: {}", self.remote, e);
                return;
            }
        };
        self.disconnect_candidate.store(false, Ordering::Release);
        self.stats.recv_packets.fetch_add(1, Ordering::Relaxed);
        self.stats
            .recv_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        if header.is_resent() {
            self.stats.received_resends.fetch_add(1, Ordering::Relaxed);
        }

        let mut body = &data[body_start..];
        let mut piggybacked: Vec<u32> = Vec::new();
        if header.has_appended_acks() {
            match acks::strip_acks(body) {
                Some((stripped, ids)) => {
                    body = stripped;
                    piggybacked = ids;
                }
                None => {
                    debug!(
                        "[{}] Malformed appended-ACK tail on #{}",
                        self.remote, header.sequence
                    );
                    return;
                }
            }
        }

        let owned_body: Vec<u8> = if header.is_zerocoded() {
            match zerocode::zero_decode(body, consts::MAX_DECODED_SIZE) {
                Ok(decoded) => decoded,
                Err(e) => {
                    debug!(
                        "[{}] Failed to zero-decode #{}: {}",
                        self.remote, header.sequence, e
                    );
                    return;
                }
            }
        } else {
            body.to_vec()
        };

        for id in piggybacked {
            self.apply_ack(id);
        }

        if header.is_reliable() {
            let must_flush = {
                let mut pending = self.pending_acks.lock().unwrap();
                pending.push_back(header.sequence);
                pending.len() >= self.cfg.max_pending_acks
            };
            if must_flush {
                self.flush_acks().await;
            }
            let fresh = self.archive.lock().unwrap().insert(header.sequence);
            if !fresh {
                debug!(
                    "[{}] Duplicate packet #{}, payload suppressed",
                    self.remote, header.sequence
                );
                return;
            }
        }

        let message = match Message::decode(Bytes::from(owned_body)) {
            Ok(message) => message,
            Err(e) => {
                debug!(
                    "[{}] Failed to decode message in #{}: {} (payload {})",
                    self.remote,
                    header.sequence,
                    e,
                    hex::encode(&data[body_start..data.len().min(body_start + 16)])
                );
                return;
            }
        };
        self.handle_message(message).await;
    }

    fn apply_ack(&self, sequence: u32) {
        if let Some(num) = self.need_ack.acknowledge(sequence) {
            trace!(
                "[{}] ACK retired {} #{}",
                self.remote,
                protocol::message_name(num),
                sequence
            );
            if num == protocol::USE_CIRCUIT_CODE {
                self.handshake_acked.fire();
            }
        }
    }

    async fn handle_message(&self, message: Message) {
        match &message {
            Message::PacketAck(ack) => {
                for id in &ack.ids {
                    self.apply_ack(*id);
                }
                return; // carrier, not an application event
            }
            Message::StartPingCheck(ping) => {
                trace!("[{}] Ping {} from peer", self.remote, ping.ping_id);
                let _ = self
                    .send_message(
                        Message::CompletePingCheck(CompletePingCheck {
                            ping_id: ping.ping_id,
                        }),
                        false,
                        false,
                    )
                    .await;
                return;
            }
            Message::CompletePingCheck(pong) => {
                let sent = *self.ping_sent.lock().unwrap();
                if let Some((id, at)) = sent {
                    if id == pong.ping_id {
                        let rtt = at.elapsed();
                        self.stats
                            .last_rtt_us
                            .store(rtt.as_micros() as u64, Ordering::Relaxed);
                        trace!("[{}] Ping {} RTT {:?}", self.remote, id, rtt);
                    }
                }
                return;
            }
            Message::RegionHandshake(handshake) => {
                debug!(
                    "[{}] Region handshake from '{}'",
                    self.remote, handshake.sim_name
                );
                let _ = self
                    .send_message(
                        Message::RegionHandshakeReply(RegionHandshakeReply {
                            agent_id: self.agent_id,
                            session_id: self.session_id,
                            flags: 0,
                        }),
                        true,
                        false,
                    )
                    .await;
                self.promote_connected();
                self.region_handshake.fire();
            }
            Message::AgentMovementComplete(_) => {
                self.agent_movement_complete.store(true, Ordering::Release);
                debug!("[{}] Agent movement complete", self.remote);
            }
            Message::LogoutReply(_) => {
                self.logout_reply.fire();
            }
            Message::CloseCircuit => {
                info!("[{}] Peer closed the circuit", self.remote);
                self.begin_close();
                self.set_state(CircuitState::Disconnected);
                return;
            }
            _ => {}
        }
        self.events.publish(Arc::new(message));
    }

    fn promote_connected(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            CircuitState::Connecting | CircuitState::Handshaking => {
                *state = CircuitState::Connected;
                drop(state);
                self.connected.store(true, Ordering::Release);
                let mut connect_time = self.connect_time.lock().unwrap();
                if connect_time.is_none() {
                    *connect_time = Some(Instant::now());
                }
                info!("[{}] Circuit connected", self.remote);
            }
            _ => {}
        }
    }

    /// Synthesizes an explicit PacketAck from everything pending.
    async fn flush_acks(&self) {
        let ids: Vec<u32> = {
            let mut pending = self.pending_acks.lock().unwrap();
            pending.drain(..).collect()
        };
        if ids.is_empty() {
            return;
        }
        trace!("[{}] Flushing {} explicit ACKs", self.remote, ids.len());
        if let Err(e) = self
            .send_message(Message::PacketAck(PacketAck { ids }), false, false)
            .await
        {
            warn!("[{}] Failed to flush ACKs: {}", self.remote, e);
        }
    }

    async fn send_ping(&self) {
        let ping_id = self.next_ping_id.fetch_add(1, Ordering::Relaxed);
        let oldest_unacked = self.need_ack.oldest_unacked().unwrap_or(0);
        *self.ping_sent.lock().unwrap() = Some((ping_id, Instant::now()));
        let _ = self
            .send_message(
                Message::StartPingCheck(StartPingCheck {
                    ping_id,
                    oldest_unacked,
                }),
                false,
                false,
            )
            .await;
    }

    fn resend_sweep(&self) {
        let sweep = self
            .need_ack
            .sweep(Instant::now(), self.cfg.resend_timeout, self.cfg.max_resends);
        for mut packet in sweep.resends {
            debug!(
                "[{}] Resending {} #{} (attempt {})",
                self.remote,
                protocol::message_name(packet.num),
                packet.sequence,
                packet.resend_count
            );
            self.stats.resent_packets.fetch_add(1, Ordering::Relaxed);
            packet.category = ThrottleCategory::Resend;
            self.throttle.push(packet);
        }
        for (sequence, num) in sweep.evicted {
            warn!(
                "[{}] Dropping {} #{} after {} resends",
                self.remote,
                protocol::message_name(num),
                sequence,
                self.cfg.max_resends
            );
            self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Two consecutive silent sweeps mean the peer is gone.
    fn liveness_sweep(&self) -> bool {
        if self.disconnect_candidate.swap(true, Ordering::AcqRel) {
            warn!("[{}] Peer liveness timeout", self.remote);
            return true;
        }
        false
    }
}

async fn recv_loop(shared: Arc<Shared>) {
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            _ = shared.closing.cancelled() => break,
            received = shared.socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, src)) => {
                        if src != shared.remote {
                            warn!(
                                "[{}] Dropping datagram from unexpected source {}",
                                shared.remote, src
                            );
                            continue;
                        }
                        shared.process_datagram(&buf[..len]).await;
                    }
                    Err(e) => {
                        warn!("[{}] Socket receive error: {}", shared.remote, e);
                        break;
                    }
                }
            }
        }
    }
    trace!("[{}] Receive worker stopped", shared.remote);
}

async fn send_pump(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = shared.closing.cancelled() => break,
            _ = shared.throttle.ready.notified() => {}
        }
        while let Some(packet) = shared.throttle.pop() {
            shared.emit(&packet).await;
        }
    }
    trace!("[{}] Send pump stopped", shared.remote);
}

async fn scheduler(shared: Arc<Shared>) {
    let mut network_tick = tokio::time::interval(shared.cfg.network_tick);
    let mut stats_tick = tokio::time::interval(shared.cfg.stats_interval);
    let mut ping_tick = tokio::time::interval(shared.cfg.ping_interval);
    let mut liveness_tick = tokio::time::interval(shared.cfg.liveness_interval);
    network_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    liveness_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval fires immediately; skip the
    // liveness one so a freshly opened circuit is not a candidate.
    liveness_tick.tick().await;

    loop {
        tokio::select! {
            _ = shared.closing.cancelled() => break,
            _ = network_tick.tick() => {
                shared.resend_sweep();
                shared.flush_acks().await;
            }
            _ = stats_tick.tick() => {
                shared.stats.roll_window();
            }
            _ = ping_tick.tick() => {
                if shared.cfg.send_pings && shared.connected.load(Ordering::Acquire) {
                    shared.send_ping().await;
                }
            }
            _ = liveness_tick.tick() => {
                if shared.liveness_sweep() {
                    shared.begin_close();
                    shared.set_state(CircuitState::Disconnected);
                    break;
                }
            }
        }
    }
    trace!("[{}] Scheduler stopped", shared.remote);
}
