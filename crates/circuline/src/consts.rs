use std::time::Duration;

/// Largest datagram this layer will put on the wire.
pub const MTU: usize = 1200;

/// Flags byte + big-endian sequence + extra-header length.
pub const MIN_HEADER: usize = 6;

/// Upper bound for a zero-decoded body.
pub const MAX_DECODED_SIZE: usize = 8192;

/// Inbound reliable sequence numbers held for piggybacking before an
/// explicit PacketAck is forced out.
pub const MAX_PENDING_ACKS: usize = 250;

/// Recently seen inbound sequence numbers kept for duplicate suppression.
pub const PACKET_ARCHIVE_SIZE: usize = 1000;

/// Resend scheduler and ACK flush cadence.
pub const NETWORK_TICK: Duration = Duration::from_millis(100);

/// Age at which an unacknowledged reliable packet is resent.
pub const RESEND_TIMEOUT: Duration = Duration::from_secs(4);

/// Resends before a reliable packet is dropped and counted lost.
pub const MAX_RESENDS: u8 = 3;

/// StartPingCheck cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Throughput rollup cadence.
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Slots in the moving throughput window.
pub const STATS_QUEUE_SIZE: usize = 5;

/// Bound on waiting for the UseCircuitCode ACK and the region handshake.
pub const LOGIN_TIMEOUT: Duration = Duration::from_secs(20);

/// Bound on waiting for LogoutReply during a graceful logout.
pub const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Peer-liveness sweep cadence. Two consecutive silent sweeps disconnect.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(60);

/// Pause between connect and CompleteAgentMovement when moving in.
pub const MOVE_IN_DELAY: Duration = Duration::from_millis(500);
