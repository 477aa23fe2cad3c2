//! Typed bodies for the message catalog subset this layer understands.
//! Everything else travels as an opaque payload and is delivered to
//! subscribers undecoded.

use super::{read_message_num, write_message_num};
use bytes::Bytes;
use opaline_binary::error::BinaryError;
use opaline_binary::io::{BinaryReader, BinaryWriter, Vector3};
use opaline_binary::traits::{Readable, Writable};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq)]
pub struct PacketAck {
    pub ids: Vec<u32>,
}

impl Writable for PacketAck {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        self.ids.write(writer)
    }
}

impl Readable for PacketAck {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            ids: Vec::read(reader)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StartPingCheck {
    pub ping_id: u8,
    /// Smallest outstanding reliable sequence, 0 when none.
    pub oldest_unacked: u32,
}

impl Writable for StartPingCheck {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_u8(self.ping_id)?;
        writer.write_u32(self.oldest_unacked)
    }
}

impl Readable for StartPingCheck {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            ping_id: reader.read_u8()?,
            oldest_unacked: reader.read_u32()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompletePingCheck {
    pub ping_id: u8,
}

impl Writable for CompletePingCheck {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_u8(self.ping_id)
    }
}

impl Readable for CompletePingCheck {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            ping_id: reader.read_u8()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UseCircuitCode {
    pub code: u32,
    pub session_id: Uuid,
    pub agent_id: Uuid,
}

impl Writable for UseCircuitCode {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_u32(self.code)?;
        writer.write_uuid(&self.session_id)?;
        writer.write_uuid(&self.agent_id)
    }
}

impl Readable for UseCircuitCode {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            code: reader.read_u32()?,
            session_id: reader.read_uuid()?,
            agent_id: reader.read_uuid()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegionHandshake {
    pub region_flags: u32,
    pub sim_access: u8,
    pub sim_name: String,
    pub region_id: Uuid,
}

impl Writable for RegionHandshake {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_u32(self.region_flags)?;
        writer.write_u8(self.sim_access)?;
        writer.write_string(&self.sim_name)?;
        writer.write_uuid(&self.region_id)
    }
}

impl Readable for RegionHandshake {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            region_flags: reader.read_u32()?,
            sim_access: reader.read_u8()?,
            sim_name: reader.read_string()?,
            region_id: reader.read_uuid()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionHandshakeReply {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub flags: u32,
}

impl Writable for RegionHandshakeReply {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.agent_id)?;
        writer.write_uuid(&self.session_id)?;
        writer.write_u32(self.flags)
    }
}

impl Readable for RegionHandshakeReply {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            agent_id: reader.read_uuid()?,
            session_id: reader.read_uuid()?,
            flags: reader.read_u32()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompleteAgentMovement {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}

impl Writable for CompleteAgentMovement {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.agent_id)?;
        writer.write_uuid(&self.session_id)?;
        writer.write_u32(self.circuit_code)
    }
}

impl Readable for CompleteAgentMovement {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            agent_id: reader.read_uuid()?,
            session_id: reader.read_uuid()?,
            circuit_code: reader.read_u32()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AgentMovementComplete {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub position: Vector3,
    pub look_at: Vector3,
    pub region_handle: u64,
    pub timestamp: u32,
}

impl Writable for AgentMovementComplete {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.agent_id)?;
        writer.write_uuid(&self.session_id)?;
        self.position.write(writer)?;
        self.look_at.write(writer)?;
        writer.write_u64(self.region_handle)?;
        writer.write_u32(self.timestamp)
    }
}

impl Readable for AgentMovementComplete {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            agent_id: reader.read_uuid()?,
            session_id: reader.read_uuid()?,
            position: Vector3::read(reader)?,
            look_at: Vector3::read(reader)?,
            region_handle: reader.read_u64()?,
            timestamp: reader.read_u32()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LogoutRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

impl Writable for LogoutRequest {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.agent_id)?;
        writer.write_uuid(&self.session_id)
    }
}

impl Readable for LogoutRequest {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            agent_id: reader.read_uuid()?,
            session_id: reader.read_uuid()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogoutReply {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub item_ids: Vec<Uuid>,
}

impl Writable for LogoutReply {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.agent_id)?;
        writer.write_uuid(&self.session_id)?;
        self.item_ids.write(writer)
    }
}

impl Readable for LogoutReply {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            agent_id: reader.read_uuid()?,
            session_id: reader.read_uuid()?,
            item_ids: Vec::read(reader)?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AgentWearablesRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

impl Writable for AgentWearablesRequest {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.agent_id)?;
        writer.write_uuid(&self.session_id)
    }
}

impl Readable for AgentWearablesRequest {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            agent_id: reader.read_uuid()?,
            session_id: reader.read_uuid()?,
        })
    }
}

/// One worn item as reported by the simulator.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WearableDataBlock {
    pub item_id: Uuid,
    pub asset_id: Uuid,
    pub wearable_type: u8,
}

impl Writable for WearableDataBlock {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.item_id)?;
        writer.write_uuid(&self.asset_id)?;
        writer.write_u8(self.wearable_type)
    }
}

impl Readable for WearableDataBlock {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            item_id: reader.read_uuid()?,
            asset_id: reader.read_uuid()?,
            wearable_type: reader.read_u8()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentWearablesUpdate {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub serial_num: u32,
    pub wearables: Vec<WearableDataBlock>,
}

impl Writable for AgentWearablesUpdate {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.agent_id)?;
        writer.write_uuid(&self.session_id)?;
        writer.write_u32(self.serial_num)?;
        self.wearables.write(writer)
    }
}

impl Readable for AgentWearablesUpdate {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            agent_id: reader.read_uuid()?,
            session_id: reader.read_uuid()?,
            serial_num: reader.read_u32()?,
            wearables: Vec::read(reader)?,
        })
    }
}

/// One of the 16 primary wearable slots in an AgentIsNowWearing snapshot.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WornItemBlock {
    pub item_id: Uuid,
    pub wearable_type: u8,
}

impl Writable for WornItemBlock {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.item_id)?;
        writer.write_u8(self.wearable_type)
    }
}

impl Readable for WornItemBlock {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            item_id: reader.read_uuid()?,
            wearable_type: reader.read_u8()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentIsNowWearing {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub wearables: Vec<WornItemBlock>,
}

impl Writable for AgentIsNowWearing {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.agent_id)?;
        writer.write_uuid(&self.session_id)?;
        self.wearables.write(writer)
    }
}

impl Readable for AgentIsNowWearing {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            agent_id: reader.read_uuid()?,
            session_id: reader.read_uuid()?,
            wearables: Vec::read(reader)?,
        })
    }
}

/// A bake-layer cache entry: the query hash outbound, the cached texture
/// ID inbound. `texture_index` is a bake-layer index (0..=5).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CachedTextureBlock {
    pub id: Uuid,
    pub texture_index: u8,
}

impl Writable for CachedTextureBlock {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.id)?;
        writer.write_u8(self.texture_index)
    }
}

impl Readable for CachedTextureBlock {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            id: reader.read_uuid()?,
            texture_index: reader.read_u8()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentCachedTexture {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub serial_num: i32,
    pub blocks: Vec<CachedTextureBlock>,
}

impl Writable for AgentCachedTexture {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.agent_id)?;
        writer.write_uuid(&self.session_id)?;
        writer.write_i32(self.serial_num)?;
        self.blocks.write(writer)
    }
}

impl Readable for AgentCachedTexture {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            agent_id: reader.read_uuid()?,
            session_id: reader.read_uuid()?,
            serial_num: reader.read_i32()?,
            blocks: Vec::read(reader)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentCachedTextureResponse {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub serial_num: i32,
    pub blocks: Vec<CachedTextureBlock>,
}

impl Writable for AgentCachedTextureResponse {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.agent_id)?;
        writer.write_uuid(&self.session_id)?;
        writer.write_i32(self.serial_num)?;
        self.blocks.write(writer)
    }
}

impl Readable for AgentCachedTextureResponse {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            agent_id: reader.read_uuid()?,
            session_id: reader.read_uuid()?,
            serial_num: reader.read_i32()?,
            blocks: Vec::read(reader)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentSetAppearance {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub serial_num: u32,
    pub size: Vector3,
    /// Six `{bake hash, bake-layer index}` slots.
    pub wearable_data: Vec<CachedTextureBlock>,
    /// Serialized per-face texture entry.
    pub texture_entry: Bytes,
    /// Packed visual-parameter bytes.
    pub visual_params: Vec<u8>,
}

impl Writable for AgentSetAppearance {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.agent_id)?;
        writer.write_uuid(&self.session_id)?;
        writer.write_u32(self.serial_num)?;
        self.size.write(writer)?;
        self.wearable_data.write(writer)?;
        if self.texture_entry.len() > u16::MAX as usize {
            return Err(BinaryError::LengthOverflow {
                what: "texture entry",
                len: self.texture_entry.len(),
                max: u16::MAX as usize,
            });
        }
        writer.write_u16(self.texture_entry.len() as u16)?;
        writer.write_bytes(&self.texture_entry)?;
        self.visual_params.write(writer)
    }
}

impl Readable for AgentSetAppearance {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        let agent_id = reader.read_uuid()?;
        let session_id = reader.read_uuid()?;
        let serial_num = reader.read_u32()?;
        let size = Vector3::read(reader)?;
        let wearable_data = Vec::read(reader)?;
        let te_len = reader.read_u16()? as usize;
        let texture_entry = reader.read_bytes(te_len)?;
        let visual_params = Vec::read(reader)?;
        Ok(Self {
            agent_id,
            session_id,
            serial_num,
            size,
            wearable_data,
            texture_entry,
            visual_params,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AvatarAppearance {
    pub id: Uuid,
    pub is_trial: bool,
    pub texture_entry: Bytes,
    pub visual_params: Vec<u8>,
}

impl Writable for AvatarAppearance {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.id)?;
        writer.write_bool(self.is_trial)?;
        if self.texture_entry.len() > u16::MAX as usize {
            return Err(BinaryError::LengthOverflow {
                what: "texture entry",
                len: self.texture_entry.len(),
                max: u16::MAX as usize,
            });
        }
        writer.write_u16(self.texture_entry.len() as u16)?;
        writer.write_bytes(&self.texture_entry)?;
        self.visual_params.write(writer)
    }
}

impl Readable for AvatarAppearance {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        let id = reader.read_uuid()?;
        let is_trial = reader.read_bool()?;
        let te_len = reader.read_u16()? as usize;
        let texture_entry = reader.read_bytes(te_len)?;
        let visual_params = Vec::read(reader)?;
        Ok(Self {
            id,
            is_trial,
            texture_entry,
            visual_params,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RebakeAvatarTextures {
    pub texture_id: Uuid,
}

impl Writable for RebakeAvatarTextures {
    fn write(&self, writer: &mut BinaryWriter) -> Result<(), BinaryError> {
        writer.write_uuid(&self.texture_id)
    }
}

impl Readable for RebakeAvatarTextures {
    fn read(reader: &mut BinaryReader) -> Result<Self, BinaryError> {
        Ok(Self {
            texture_id: reader.read_uuid()?,
        })
    }
}

/// A decoded inbound or to-be-encoded outbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    PacketAck(PacketAck),
    StartPingCheck(StartPingCheck),
    CompletePingCheck(CompletePingCheck),
    UseCircuitCode(UseCircuitCode),
    CloseCircuit,
    RegionHandshake(RegionHandshake),
    RegionHandshakeReply(RegionHandshakeReply),
    CompleteAgentMovement(CompleteAgentMovement),
    AgentMovementComplete(AgentMovementComplete),
    LogoutRequest(LogoutRequest),
    LogoutReply(LogoutReply),
    AgentWearablesRequest(AgentWearablesRequest),
    AgentWearablesUpdate(AgentWearablesUpdate),
    AgentIsNowWearing(AgentIsNowWearing),
    AgentCachedTexture(AgentCachedTexture),
    AgentCachedTextureResponse(AgentCachedTextureResponse),
    AgentSetAppearance(AgentSetAppearance),
    AvatarAppearance(AvatarAppearance),
    RebakeAvatarTextures(RebakeAvatarTextures),
    /// A message this layer does not decode. Payload excludes the number.
    Unknown { num: u32, payload: Bytes },
}

impl Message {
    pub fn num(&self) -> u32 {
        match self {
            Message::PacketAck(_) => super::PACKET_ACK,
            Message::StartPingCheck(_) => super::START_PING_CHECK,
            Message::CompletePingCheck(_) => super::COMPLETE_PING_CHECK,
            Message::UseCircuitCode(_) => super::USE_CIRCUIT_CODE,
            Message::CloseCircuit => super::CLOSE_CIRCUIT,
            Message::RegionHandshake(_) => super::REGION_HANDSHAKE,
            Message::RegionHandshakeReply(_) => super::REGION_HANDSHAKE_REPLY,
            Message::CompleteAgentMovement(_) => super::COMPLETE_AGENT_MOVEMENT,
            Message::AgentMovementComplete(_) => super::AGENT_MOVEMENT_COMPLETE,
            Message::LogoutRequest(_) => super::LOGOUT_REQUEST,
            Message::LogoutReply(_) => super::LOGOUT_REPLY,
            Message::AgentWearablesRequest(_) => super::AGENT_WEARABLES_REQUEST,
            Message::AgentWearablesUpdate(_) => super::AGENT_WEARABLES_UPDATE,
            Message::AgentIsNowWearing(_) => super::AGENT_IS_NOW_WEARING,
            Message::AgentCachedTexture(_) => super::AGENT_CACHED_TEXTURE,
            Message::AgentCachedTextureResponse(_) => super::AGENT_CACHED_TEXTURE_RESPONSE,
            Message::AgentSetAppearance(_) => super::AGENT_SET_APPEARANCE,
            Message::AvatarAppearance(_) => super::AVATAR_APPEARANCE,
            Message::RebakeAvatarTextures(_) => super::REBAKE_AVATAR_TEXTURES,
            Message::Unknown { num, .. } => *num,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Message::Unknown { .. } => "Unknown",
            other => super::message_name(other.num()),
        }
    }

    /// Encodes the message number followed by the body.
    pub fn encode(&self) -> Result<Bytes, BinaryError> {
        let mut writer = BinaryWriter::new();
        write_message_num(&mut writer, self.num())?;
        match self {
            Message::PacketAck(m) => m.write(&mut writer)?,
            Message::StartPingCheck(m) => m.write(&mut writer)?,
            Message::CompletePingCheck(m) => m.write(&mut writer)?,
            Message::UseCircuitCode(m) => m.write(&mut writer)?,
            Message::CloseCircuit => {}
            Message::RegionHandshake(m) => m.write(&mut writer)?,
            Message::RegionHandshakeReply(m) => m.write(&mut writer)?,
            Message::CompleteAgentMovement(m) => m.write(&mut writer)?,
            Message::AgentMovementComplete(m) => m.write(&mut writer)?,
            Message::LogoutRequest(m) => m.write(&mut writer)?,
            Message::LogoutReply(m) => m.write(&mut writer)?,
            Message::AgentWearablesRequest(m) => m.write(&mut writer)?,
            Message::AgentWearablesUpdate(m) => m.write(&mut writer)?,
            Message::AgentIsNowWearing(m) => m.write(&mut writer)?,
            Message::AgentCachedTexture(m) => m.write(&mut writer)?,
            Message::AgentCachedTextureResponse(m) => m.write(&mut writer)?,
            Message::AgentSetAppearance(m) => m.write(&mut writer)?,
            Message::AvatarAppearance(m) => m.write(&mut writer)?,
            Message::RebakeAvatarTextures(m) => m.write(&mut writer)?,
            Message::Unknown { payload, .. } => writer.write_bytes(payload)?,
        }
        Ok(writer.freeze())
    }

    /// Decodes a full body (message number included).
    pub fn decode(body: Bytes) -> Result<Self, BinaryError> {
        let mut reader = BinaryReader::new(body);
        let num = read_message_num(&mut reader)?;
        let message = match num {
            super::PACKET_ACK => Message::PacketAck(PacketAck::read(&mut reader)?),
            super::START_PING_CHECK => Message::StartPingCheck(StartPingCheck::read(&mut reader)?),
            super::COMPLETE_PING_CHECK => {
                Message::CompletePingCheck(CompletePingCheck::read(&mut reader)?)
            }
            super::USE_CIRCUIT_CODE => Message::UseCircuitCode(UseCircuitCode::read(&mut reader)?),
            super::CLOSE_CIRCUIT => Message::CloseCircuit,
            super::REGION_HANDSHAKE => Message::RegionHandshake(RegionHandshake::read(&mut reader)?),
            super::REGION_HANDSHAKE_REPLY => {
                Message::RegionHandshakeReply(RegionHandshakeReply::read(&mut reader)?)
            }
            super::COMPLETE_AGENT_MOVEMENT => {
                Message::CompleteAgentMovement(CompleteAgentMovement::read(&mut reader)?)
            }
            super::AGENT_MOVEMENT_COMPLETE => {
                Message::AgentMovementComplete(AgentMovementComplete::read(&mut reader)?)
            }
            super::LOGOUT_REQUEST => Message::LogoutRequest(LogoutRequest::read(&mut reader)?),
            super::LOGOUT_REPLY => Message::LogoutReply(LogoutReply::read(&mut reader)?),
            super::AGENT_WEARABLES_REQUEST => {
                Message::AgentWearablesRequest(AgentWearablesRequest::read(&mut reader)?)
            }
            super::AGENT_WEARABLES_UPDATE => {
                Message::AgentWearablesUpdate(AgentWearablesUpdate::read(&mut reader)?)
            }
            super::AGENT_IS_NOW_WEARING => {
                Message::AgentIsNowWearing(AgentIsNowWearing::read(&mut reader)?)
            }
            super::AGENT_CACHED_TEXTURE => {
                Message::AgentCachedTexture(AgentCachedTexture::read(&mut reader)?)
            }
            super::AGENT_CACHED_TEXTURE_RESPONSE => {
                Message::AgentCachedTextureResponse(AgentCachedTextureResponse::read(&mut reader)?)
            }
            super::AGENT_SET_APPEARANCE => {
                Message::AgentSetAppearance(AgentSetAppearance::read(&mut reader)?)
            }
            super::AVATAR_APPEARANCE => {
                Message::AvatarAppearance(AvatarAppearance::read(&mut reader)?)
            }
            super::REBAKE_AVATAR_TEXTURES => {
                Message::RebakeAvatarTextures(RebakeAvatarTextures::read(&mut reader)?)
            }
            _ => Message::Unknown {
                num,
                payload: reader.read_remaining(),
            },
        };
        Ok(message)
    }

    /// Splits a message whose variable-length blocks exceed `max_body`
    /// bytes into multiple messages of the same type, each fitting the
    /// budget. Messages without a splittable block are returned whole.
    pub fn split_for_mtu(self, max_body: usize) -> Vec<Message> {
        let fits = match self.encode() {
            Ok(body) => body.len() <= max_body,
            Err(_) => false,
        };
        if fits {
            return vec![self];
        }
        match self {
            Message::PacketAck(m) => {
                // 4 bytes number + 1 count byte, then 4 per ID. The block
                // count byte caps a single message at 255 entries.
                let per = (max_body.saturating_sub(5) / 4).clamp(1, 255);
                m.ids
                    .chunks(per)
                    .map(|c| Message::PacketAck(PacketAck { ids: c.to_vec() }))
                    .collect()
            }
            Message::AgentWearablesUpdate(m) => {
                let fixed = 4 + 16 + 16 + 4 + 1;
                let per = (max_body.saturating_sub(fixed) / 33).clamp(1, 255);
                m.wearables
                    .chunks(per)
                    .map(|c| {
                        Message::AgentWearablesUpdate(AgentWearablesUpdate {
                            agent_id: m.agent_id,
                            session_id: m.session_id,
                            serial_num: m.serial_num,
                            wearables: c.to_vec(),
                        })
                    })
                    .collect()
            }
            Message::AgentCachedTexture(m) => {
                let fixed = 4 + 16 + 16 + 4 + 1;
                let per = (max_body.saturating_sub(fixed) / 17).clamp(1, 255);
                m.blocks
                    .chunks(per)
                    .map(|c| {
                        Message::AgentCachedTexture(AgentCachedTexture {
                            agent_id: m.agent_id,
                            session_id: m.session_id,
                            serial_num: m.serial_num,
                            blocks: c.to_vec(),
                        })
                    })
                    .collect()
            }
            other => vec![other],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let body = message.encode().unwrap();
        assert_eq!(Message::decode(body).unwrap(), message);
    }

    #[test]
    fn use_circuit_code_round_trip() {
        round_trip(Message::UseCircuitCode(UseCircuitCode {
            code: 42,
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
        }));
    }

    #[test]
    fn packet_ack_round_trip() {
        round_trip(Message::PacketAck(PacketAck {
            ids: vec![1, 7, 100_000],
        }));
    }

    #[test]
    fn cached_texture_round_trip() {
        round_trip(Message::AgentCachedTexture(AgentCachedTexture {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            serial_num: 3,
            blocks: vec![
                CachedTextureBlock {
                    id: Uuid::new_v4(),
                    texture_index: 0,
                },
                CachedTextureBlock {
                    id: Uuid::new_v4(),
                    texture_index: 1,
                },
            ],
        }));
    }

    #[test]
    fn set_appearance_round_trip() {
        round_trip(Message::AgentSetAppearance(AgentSetAppearance {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            serial_num: 9,
            size: Vector3::new(0.45, 0.6, 1.9),
            wearable_data: vec![CachedTextureBlock {
                id: Uuid::new_v4(),
                texture_index: 0,
            }],
            texture_entry: Bytes::from_static(&[1, 2, 3, 4]),
            visual_params: vec![128, 64, 255],
        }));
    }

    #[test]
    fn unknown_messages_survive_undecoded() {
        round_trip(Message::Unknown {
            num: 0xFF33,
            payload: Bytes::from_static(&[9, 9, 9]),
        });
    }

    #[test]
    fn oversized_packet_ack_splits_evenly() {
        let ids: Vec<u32> = (0..600).collect();
        let parts =
            Message::PacketAck(PacketAck { ids: ids.clone() }).split_for_mtu(1024);
        assert!(parts.len() > 1);
        let mut collected = Vec::new();
        for part in parts {
            let body = part.encode().unwrap();
            assert!(body.len() <= 1024);
            match part {
                Message::PacketAck(p) => collected.extend(p.ids),
                other => panic!("split changed the type: {:?}", other),
            }
        }
        assert_eq!(collected, ids);
    }
}
