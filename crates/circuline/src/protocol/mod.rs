//! Wire-level framing for the simulator circuit: the packet header, the
//! frequency-coded message numbers, and the codec helpers layered on top.

use crate::consts::MIN_HEADER;
use crate::error::CircuitError;
use opaline_binary::error::BinaryError;
use opaline_binary::io::{BinaryReader, BinaryWriter};

pub mod acks;
pub mod messages;
pub mod zerocode;

// --- Header flag bits (byte 0) ---
pub const FLAG_ZEROCODED: u8 = 0x80;
pub const FLAG_RELIABLE: u8 = 0x40;
pub const FLAG_RESENT: u8 = 0x20;
pub const FLAG_APPENDED_ACKS: u8 = 0x10;

// --- Message numbers ---
// High-frequency numbers occupy a single byte (0x01..=0xFE). Medium ones
// are escaped with one 0xFF, low ones with two, and fixed numbers encode
// as a full four 0xFF-prefixed bytes. The u32 value carries the band.
pub const START_PING_CHECK: u32 = 0x0000_0001;
pub const COMPLETE_PING_CHECK: u32 = 0x0000_0002;

pub const USE_CIRCUIT_CODE: u32 = 0xFFFF_0003;
pub const AGENT_SET_APPEARANCE: u32 = 0xFFFF_0054;
pub const REGION_HANDSHAKE: u32 = 0xFFFF_0094;
pub const REGION_HANDSHAKE_REPLY: u32 = 0xFFFF_0095;
pub const AVATAR_APPEARANCE: u32 = 0xFFFF_009E;
pub const COMPLETE_AGENT_MOVEMENT: u32 = 0xFFFF_00F9;
pub const AGENT_MOVEMENT_COMPLETE: u32 = 0xFFFF_00FA;
pub const LOGOUT_REQUEST: u32 = 0xFFFF_00FC;
pub const LOGOUT_REPLY: u32 = 0xFFFF_00FD;
pub const AGENT_WEARABLES_REQUEST: u32 = 0xFFFF_017D;
pub const AGENT_WEARABLES_UPDATE: u32 = 0xFFFF_017E;
pub const AGENT_IS_NOW_WEARING: u32 = 0xFFFF_017F;
pub const AGENT_CACHED_TEXTURE: u32 = 0xFFFF_0180;
pub const AGENT_CACHED_TEXTURE_RESPONSE: u32 = 0xFFFF_0181;
pub const REBAKE_AVATAR_TEXTURES: u32 = 0xFFFF_018D;

pub const PACKET_ACK: u32 = 0xFFFF_FFFB;
pub const CLOSE_CIRCUIT: u32 = 0xFFFF_FFFC;

/// Leading bytes of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: u8,
    pub sequence: u32,
}

impl PacketHeader {
    pub fn new(flags: u8, sequence: u32) -> Self {
        Self { flags, sequence }
    }

    pub fn is_zerocoded(&self) -> bool {
        self.flags & FLAG_ZEROCODED != 0
    }

    pub fn is_reliable(&self) -> bool {
        self.flags & FLAG_RELIABLE != 0
    }

    pub fn is_resent(&self) -> bool {
        self.flags & FLAG_RESENT != 0
    }

    pub fn has_appended_acks(&self) -> bool {
        self.flags & FLAG_APPENDED_ACKS != 0
    }

    pub fn encode(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_u8(self.flags)?;
        writer.write_u32(self.sequence)?;
        writer.write_u8(0) // extra-header length
    }

    /// Parses the header and returns it together with the offset at which
    /// the body starts (past any extra-header bytes).
    pub fn decode(data: &[u8]) -> Result<(Self, usize), CircuitError> {
        if data.len() < MIN_HEADER {
            return Err(CircuitError::Truncated { len: data.len() });
        }
        let flags = data[0];
        let sequence = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let extra = data[5] as usize;
        let body_start = MIN_HEADER + extra;
        if data.len() < body_start {
            return Err(CircuitError::Truncated { len: data.len() });
        }
        Ok((Self { flags, sequence }, body_start))
    }
}

/// Writes a frequency-coded message number.
pub fn write_message_num(writer: &mut BinaryWriter, num: u32) -> Result<(), BinaryError> {
    match num {
        0x01..=0xFE => writer.write_u8(num as u8),
        0xFF01..=0xFFFE => {
            writer.write_u8(0xFF)?;
            writer.write_u8((num & 0xFF) as u8)
        }
        0xFFFF_0001..=0xFFFF_FEFF => {
            writer.write_u8(0xFF)?;
            writer.write_u8(0xFF)?;
            writer.write_u16((num & 0xFFFF) as u16)
        }
        0xFFFF_FF00..=0xFFFF_FFFF => {
            writer.write_u8(0xFF)?;
            writer.write_u8(0xFF)?;
            writer.write_u8(0xFF)?;
            writer.write_u8((num & 0xFF) as u8)
        }
        _ => Err(BinaryError::InvalidData(format!(
            "Message number {:#010x} is outside every frequency band",
            num
        ))),
    }
}

/// Reads a frequency-coded message number.
pub fn read_message_num(reader: &mut BinaryReader) -> Result<u32, BinaryError> {
    let first = reader.read_u8()?;
    if first != 0xFF {
        return Ok(first as u32);
    }
    let second = reader.read_u8()?;
    if second != 0xFF {
        return Ok(0xFF00 | second as u32);
    }
    let low = reader.read_u16()?;
    if low >= 0xFF00 {
        Ok(0xFFFF_FF00 | (low & 0xFF) as u32)
    } else {
        Ok(0xFFFF_0000 | low as u32)
    }
}

/// Human-readable name for log lines. Unlisted numbers print numerically.
pub fn message_name(num: u32) -> &'static str {
    match num {
        START_PING_CHECK => "StartPingCheck",
        COMPLETE_PING_CHECK => "CompletePingCheck",
        USE_CIRCUIT_CODE => "UseCircuitCode",
        AGENT_SET_APPEARANCE => "AgentSetAppearance",
        REGION_HANDSHAKE => "RegionHandshake",
        REGION_HANDSHAKE_REPLY => "RegionHandshakeReply",
        AVATAR_APPEARANCE => "AvatarAppearance",
        COMPLETE_AGENT_MOVEMENT => "CompleteAgentMovement",
        AGENT_MOVEMENT_COMPLETE => "AgentMovementComplete",
        LOGOUT_REQUEST => "LogoutRequest",
        LOGOUT_REPLY => "LogoutReply",
        AGENT_WEARABLES_REQUEST => "AgentWearablesRequest",
        AGENT_WEARABLES_UPDATE => "AgentWearablesUpdate",
        AGENT_IS_NOW_WEARING => "AgentIsNowWearing",
        AGENT_CACHED_TEXTURE => "AgentCachedTexture",
        AGENT_CACHED_TEXTURE_RESPONSE => "AgentCachedTextureResponse",
        REBAKE_AVATAR_TEXTURES => "RebakeAvatarTextures",
        PACKET_ACK => "PacketAck",
        CLOSE_CIRCUIT => "CloseCircuit",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opaline_binary::io::{BinaryReader, BinaryWriter};

    fn round_trip(num: u32) -> (u32, usize) {
        let mut writer = BinaryWriter::new();
        write_message_num(&mut writer, num).unwrap();
        let frozen = writer.freeze();
        let encoded_len = frozen.len();
        let mut reader = BinaryReader::new(frozen);
        (read_message_num(&mut reader).unwrap(), encoded_len)
    }

    #[test]
    fn message_num_bands() {
        assert_eq!(round_trip(START_PING_CHECK), (START_PING_CHECK, 1));
        assert_eq!(round_trip(0xFF42), (0xFF42, 2));
        assert_eq!(round_trip(USE_CIRCUIT_CODE), (USE_CIRCUIT_CODE, 4));
        assert_eq!(round_trip(PACKET_ACK), (PACKET_ACK, 4));
    }

    #[test]
    fn header_round_trip() {
        let header = PacketHeader::new(FLAG_RELIABLE | FLAG_ZEROCODED, 0x0102_0304);
        let mut writer = BinaryWriter::new();
        header.encode(&mut writer).unwrap();
        let bytes = writer.freeze();
        assert_eq!(bytes.len(), MIN_HEADER);
        let (parsed, body_start) = PacketHeader::decode(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(body_start, MIN_HEADER);
        assert!(parsed.is_reliable());
        assert!(parsed.is_zerocoded());
        assert!(!parsed.is_resent());
    }

    #[test]
    fn extra_header_bytes_shift_the_body() {
        let data = [FLAG_RELIABLE, 0, 0, 0, 7, 2, 0xAA, 0xBB, 0x01];
        let (header, body_start) = PacketHeader::decode(&data).unwrap();
        assert_eq!(header.sequence, 7);
        assert_eq!(body_start, 8);
        assert_eq!(data[body_start], 0x01);
    }

    #[test]
    fn truncated_header_is_rejected() {
        assert!(matches!(
            PacketHeader::decode(&[0x40, 0, 0]),
            Err(CircuitError::Truncated { len: 3 })
        ));
    }
}
