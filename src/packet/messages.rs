//! Message bodies of the supported subset of the message template. Single blocks are flattened
//!  into the message struct, variable blocks are `Vec`s.

use std::net::Ipv4Addr;
use bytes::{Buf, BufMut};
use glam::{Quat, Vec3};
use uuid::Uuid;
use crate::packet::message_number::MessageNumber;
use crate::util::buf_ext::{BufExt, BufMutExt, MAX_TEXT2_LEN};

macro_rules! define_messages {
    ($($name:ident => $freq:ident($num:literal), zerocoded: $zerocoded:literal $(, reuse: [$($field:ident),*])?;)*) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum PacketType {
            $($name,)*
            /// a message number that is not part of the supported template subset
            Unknown,
        }

        impl PacketType {
            pub fn message_number(self) -> Option<MessageNumber> {
                match self {
                    $(PacketType::$name => Some(MessageNumber::$freq($num)),)*
                    PacketType::Unknown => None,
                }
            }

            pub fn from_message_number(number: MessageNumber) -> PacketType {
                match number {
                    $(MessageNumber::$freq($num) => PacketType::$name,)*
                    _ => PacketType::Unknown,
                }
            }

            /// whether the template marks the message as zero-coded
            pub fn is_zerocoded(self) -> bool {
                match self {
                    $(PacketType::$name => $zerocoded,)*
                    PacketType::Unknown => false,
                }
            }
        }

        #[derive(Clone, Debug, PartialEq)]
        pub enum Message {
            $($name($name),)*
            Unknown(UnknownMessage),
        }

        impl Message {
            /// an empty message of the given type
            pub fn new_for(packet_type: PacketType) -> Message {
                match packet_type {
                    $(PacketType::$name => Message::$name($name::default()),)*
                    PacketType::Unknown => Message::Unknown(UnknownMessage::default()),
                }
            }

            /// Resets the message to its empty state. The strings and block vectors listed as
            ///  `reuse` are cleared rather than dropped, keeping their allocations.
            pub fn clear(&mut self) {
                match self {
                    $(Message::$name(m) => {
                        $($(let mut $field = std::mem::take(&mut m.$field);)*)?
                        *m = $name::default();
                        $($(
                            $field.clear();
                            m.$field = $field;
                        )*)?
                    })*
                    Message::Unknown(m) => m.body.clear(),
                }
            }

            pub fn packet_type(&self) -> PacketType {
                match self {
                    $(Message::$name(_) => PacketType::$name,)*
                    Message::Unknown(_) => PacketType::Unknown,
                }
            }

            pub fn message_number(&self) -> MessageNumber {
                match self {
                    $(Message::$name(_) => MessageNumber::$freq($num),)*
                    Message::Unknown(m) => m.number,
                }
            }

            pub fn ser(&self, buf: &mut impl BufMut) {
                match self {
                    $(Message::$name(m) => m.ser(buf),)*
                    Message::Unknown(m) => buf.put_slice(&m.body),
                }
            }

            pub fn deser(number: MessageNumber, buf: &mut impl Buf) -> anyhow::Result<Message> {
                match PacketType::from_message_number(number) {
                    $(PacketType::$name => Ok(Message::$name($name::deser(buf)?)),)*
                    PacketType::Unknown => Ok(Message::Unknown(UnknownMessage {
                        number,
                        body: buf.copy_to_bytes(buf.remaining()).to_vec(),
                    })),
                }
            }
        }

        $(
        impl From<$name> for Message {
            fn from(value: $name) -> Message {
                Message::$name(value)
            }
        }
        )*
    };
}

define_messages! {
    StartPingCheck => High(1), zerocoded: false;
    CompletePingCheck => High(2), zerocoded: false;
    AgentUpdate => High(4), zerocoded: true;
    ImprovedTerseObjectUpdate => High(15), zerocoded: false, reuse: [objects];
    KillObject => High(16), zerocoded: false, reuse: [local_ids];
    UseCircuitCode => Low(3), zerocoded: false;
    TeleportLocationRequest => Low(63), zerocoded: false;
    ChatFromViewer => Low(80), zerocoded: true, reuse: [message];
    AgentThrottle => Low(81), zerocoded: true, reuse: [throttles];
    AlertMessage => Low(134), zerocoded: false, reuse: [message];
    ChatFromSimulator => Low(139), zerocoded: false, reuse: [from_name, message];
    RegionHandshakeReply => Low(149), zerocoded: true;
    SimulatorViewerTimeMessage => Low(150), zerocoded: false;
    EnableSimulator => Low(151), zerocoded: false;
    DisableSimulator => Low(152), zerocoded: false;
    KickUser => Low(163), zerocoded: false, reuse: [reason];
    AgentPause => Low(212), zerocoded: false;
    AgentResume => Low(213), zerocoded: false;
    UuidNameRequest => Low(235), zerocoded: false, reuse: [ids];
    UuidNameReply => Low(236), zerocoded: false, reuse: [entries];
    CompleteAgentMovement => Low(249), zerocoded: false;
    AgentMovementComplete => Low(250), zerocoded: false, reuse: [channel_version];
    LogoutRequest => Low(252), zerocoded: false;
    LogoutReply => Low(253), zerocoded: true, reuse: [item_ids];
    PacketAck => Fixed(0xFB), zerocoded: false, reuse: [ids];
    OpenCircuit => Fixed(0xFC), zerocoded: false;
    CloseCircuit => Fixed(0xFD), zerocoded: false;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UnknownMessage {
    pub number: MessageNumber,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StartPingCheck {
    pub ping_id: u8,
    /// the oldest sequence number the sender is still waiting for an ack for
    pub oldest_unacked: u32,
}
impl StartPingCheck {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.ping_id);
        buf.put_u32_le(self.oldest_unacked);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<StartPingCheck> {
        Ok(StartPingCheck {
            ping_id: buf.try_read_u8()?,
            oldest_unacked: buf.try_read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompletePingCheck {
    pub ping_id: u8,
}
impl CompletePingCheck {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.ping_id);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<CompletePingCheck> {
        Ok(CompletePingCheck {
            ping_id: buf.try_read_u8()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentUpdate {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub body_rotation: Quat,
    pub head_rotation: Quat,
    pub state: u8,
    pub camera_center: Vec3,
    pub camera_at_axis: Vec3,
    pub camera_left_axis: Vec3,
    pub camera_up_axis: Vec3,
    pub far: f32,
    pub control_flags: u32,
    pub flags: u8,
}
impl AgentUpdate {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_quat(self.body_rotation);
        buf.put_quat(self.head_rotation);
        buf.put_u8(self.state);
        buf.put_vec3(self.camera_center);
        buf.put_vec3(self.camera_at_axis);
        buf.put_vec3(self.camera_left_axis);
        buf.put_vec3(self.camera_up_axis);
        buf.put_f32_le(self.far);
        buf.put_u32_le(self.control_flags);
        buf.put_u8(self.flags);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<AgentUpdate> {
        Ok(AgentUpdate {
            agent_id: buf.try_read_uuid()?,
            session_id: buf.try_read_uuid()?,
            body_rotation: buf.try_read_quat()?,
            head_rotation: buf.try_read_quat()?,
            state: buf.try_read_u8()?,
            camera_center: buf.try_read_vec3()?,
            camera_at_axis: buf.try_read_vec3()?,
            camera_left_axis: buf.try_read_vec3()?,
            camera_up_axis: buf.try_read_vec3()?,
            far: buf.try_read_f32_le()?,
            control_flags: buf.try_read_u32_le()?,
            flags: buf.try_read_u8()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImprovedTerseObjectUpdate {
    pub region_handle: u64,
    pub time_dilation: u16,
    pub objects: Vec<TerseObjectData>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TerseObjectData {
    /// the packed terse block, see `serializers::terse_update_block`
    pub data: Vec<u8>,
    pub texture_entry: Vec<u8>,
}

impl ImprovedTerseObjectUpdate {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.region_handle);
        buf.put_u16_le(self.time_dilation);
        buf.put_block_count(self.objects.len());
        for object in &self.objects {
            buf.put_variable1(&object.data);
            buf.put_variable2(&object.texture_entry);
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<ImprovedTerseObjectUpdate> {
        let region_handle = buf.try_read_u64_le()?;
        let time_dilation = buf.try_read_u16_le()?;
        let num_objects = buf.try_read_block_count()?;
        let mut objects = Vec::with_capacity(num_objects);
        for _ in 0..num_objects {
            objects.push(TerseObjectData {
                data: buf.try_read_variable1()?,
                texture_entry: buf.try_read_variable2()?,
            });
        }
        Ok(ImprovedTerseObjectUpdate { region_handle, time_dilation, objects })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct KillObject {
    pub local_ids: Vec<u32>,
}
impl KillObject {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_block_count(self.local_ids.len());
        for &id in &self.local_ids {
            buf.put_u32_le(id);
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<KillObject> {
        let num_ids = buf.try_read_block_count()?;
        let mut local_ids = Vec::with_capacity(num_ids);
        for _ in 0..num_ids {
            local_ids.push(buf.try_read_u32_le()?);
        }
        Ok(KillObject { local_ids })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UseCircuitCode {
    pub code: u32,
    pub session_id: Uuid,
    pub agent_id: Uuid,
}
impl UseCircuitCode {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.code);
        buf.put_uuid(&self.session_id);
        buf.put_uuid(&self.agent_id);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<UseCircuitCode> {
        Ok(UseCircuitCode {
            code: buf.try_read_u32_le()?,
            session_id: buf.try_read_uuid()?,
            agent_id: buf.try_read_uuid()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TeleportLocationRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub region_handle: u64,
    pub position: Vec3,
    pub look_at: Vec3,
}
impl TeleportLocationRequest {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_u64_le(self.region_handle);
        buf.put_vec3(self.position);
        buf.put_vec3(self.look_at);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<TeleportLocationRequest> {
        Ok(TeleportLocationRequest {
            agent_id: buf.try_read_uuid()?,
            session_id: buf.try_read_uuid()?,
            region_handle: buf.try_read_u64_le()?,
            position: buf.try_read_vec3()?,
            look_at: buf.try_read_vec3()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatFromViewer {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub message: String,
    pub chat_type: u8,
    pub channel: i32,
}
impl ChatFromViewer {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_text2(&self.message, MAX_TEXT2_LEN);
        buf.put_u8(self.chat_type);
        buf.put_i32_le(self.channel);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<ChatFromViewer> {
        Ok(ChatFromViewer {
            agent_id: buf.try_read_uuid()?,
            session_id: buf.try_read_uuid()?,
            message: buf.try_read_text2()?,
            chat_type: buf.try_read_u8()?,
            channel: buf.try_read_i32_le()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentThrottle {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
    pub gen_counter: u32,
    /// seven F32 values in bits per second, see `ThrottleRates::with_client_throttles`
    pub throttles: Vec<u8>,
}
impl AgentThrottle {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_u32_le(self.circuit_code);
        buf.put_u32_le(self.gen_counter);
        buf.put_variable1(&self.throttles);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<AgentThrottle> {
        Ok(AgentThrottle {
            agent_id: buf.try_read_uuid()?,
            session_id: buf.try_read_uuid()?,
            circuit_code: buf.try_read_u32_le()?,
            gen_counter: buf.try_read_u32_le()?,
            throttles: buf.try_read_variable1()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AlertMessage {
    pub message: String,
}
impl AlertMessage {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_text1(&self.message);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<AlertMessage> {
        Ok(AlertMessage {
            message: buf.try_read_text1()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatFromSimulator {
    pub from_name: String,
    pub source_id: Uuid,
    pub owner_id: Uuid,
    pub source_type: u8,
    pub chat_type: u8,
    pub audible: u8,
    pub position: Vec3,
    pub message: String,
}
impl ChatFromSimulator {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_text1(&self.from_name);
        buf.put_uuid(&self.source_id);
        buf.put_uuid(&self.owner_id);
        buf.put_u8(self.source_type);
        buf.put_u8(self.chat_type);
        buf.put_u8(self.audible);
        buf.put_vec3(self.position);
        buf.put_text2(&self.message, MAX_TEXT2_LEN);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<ChatFromSimulator> {
        Ok(ChatFromSimulator {
            from_name: buf.try_read_text1()?,
            source_id: buf.try_read_uuid()?,
            owner_id: buf.try_read_uuid()?,
            source_type: buf.try_read_u8()?,
            chat_type: buf.try_read_u8()?,
            audible: buf.try_read_u8()?,
            position: buf.try_read_vec3()?,
            message: buf.try_read_text2()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegionHandshakeReply {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub flags: u32,
}
impl RegionHandshakeReply {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_u32_le(self.flags);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<RegionHandshakeReply> {
        Ok(RegionHandshakeReply {
            agent_id: buf.try_read_uuid()?,
            session_id: buf.try_read_uuid()?,
            flags: buf.try_read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SimulatorViewerTimeMessage {
    pub usec_since_start: u64,
    pub sec_per_day: u32,
    pub sec_per_year: u32,
    pub sun_direction: Vec3,
    pub sun_phase: f32,
    pub sun_ang_velocity: Vec3,
}
impl SimulatorViewerTimeMessage {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.usec_since_start);
        buf.put_u32_le(self.sec_per_day);
        buf.put_u32_le(self.sec_per_year);
        buf.put_vec3(self.sun_direction);
        buf.put_f32_le(self.sun_phase);
        buf.put_vec3(self.sun_ang_velocity);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<SimulatorViewerTimeMessage> {
        Ok(SimulatorViewerTimeMessage {
            usec_since_start: buf.try_read_u64_le()?,
            sec_per_day: buf.try_read_u32_le()?,
            sec_per_year: buf.try_read_u32_le()?,
            sun_direction: buf.try_read_vec3()?,
            sun_phase: buf.try_read_f32_le()?,
            sun_ang_velocity: buf.try_read_vec3()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnableSimulator {
    pub region_handle: u64,
    pub ip: Ipv4Addr,
    pub port: u16,
}
impl Default for EnableSimulator {
    fn default() -> Self {
        EnableSimulator {
            region_handle: 0,
            ip: Ipv4Addr::UNSPECIFIED,
            port: 0,
        }
    }
}
impl EnableSimulator {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.region_handle);
        buf.put_ipv4(self.ip);
        buf.put_u16(self.port);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<EnableSimulator> {
        Ok(EnableSimulator {
            region_handle: buf.try_read_u64_le()?,
            ip: buf.try_read_ipv4()?,
            port: buf.try_read_u16_be()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DisableSimulator;
impl DisableSimulator {
    fn ser(&self, _buf: &mut impl BufMut) {
    }

    fn deser(_buf: &mut impl Buf) -> anyhow::Result<DisableSimulator> {
        Ok(DisableSimulator)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct KickUser {
    pub target_ip: Ipv4Addr,
    pub target_port: u16,
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub reason: String,
}
impl Default for KickUser {
    fn default() -> Self {
        KickUser {
            target_ip: Ipv4Addr::UNSPECIFIED,
            target_port: 0,
            agent_id: Uuid::nil(),
            session_id: Uuid::nil(),
            reason: String::new(),
        }
    }
}
impl KickUser {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_ipv4(self.target_ip);
        buf.put_u16(self.target_port);
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_text2(&self.reason, MAX_TEXT2_LEN);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<KickUser> {
        Ok(KickUser {
            target_ip: buf.try_read_ipv4()?,
            target_port: buf.try_read_u16_be()?,
            agent_id: buf.try_read_uuid()?,
            session_id: buf.try_read_uuid()?,
            reason: buf.try_read_text2()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentPause {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub serial_num: u32,
}
impl AgentPause {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_u32_le(self.serial_num);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<AgentPause> {
        Ok(AgentPause {
            agent_id: buf.try_read_uuid()?,
            session_id: buf.try_read_uuid()?,
            serial_num: buf.try_read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentResume {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub serial_num: u32,
}
impl AgentResume {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_u32_le(self.serial_num);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<AgentResume> {
        Ok(AgentResume {
            agent_id: buf.try_read_uuid()?,
            session_id: buf.try_read_uuid()?,
            serial_num: buf.try_read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UuidNameRequest {
    pub ids: Vec<Uuid>,
}
impl UuidNameRequest {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_block_count(self.ids.len());
        for id in &self.ids {
            buf.put_uuid(id);
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<UuidNameRequest> {
        let num_ids = buf.try_read_block_count()?;
        let mut ids = Vec::with_capacity(num_ids);
        for _ in 0..num_ids {
            ids.push(buf.try_read_uuid()?);
        }
        Ok(UuidNameRequest { ids })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UuidNameReply {
    pub entries: Vec<UuidNameEntry>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UuidNameEntry {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
}

impl UuidNameReply {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_block_count(self.entries.len());
        for entry in &self.entries {
            buf.put_uuid(&entry.id);
            buf.put_text1(&entry.first_name);
            buf.put_text1(&entry.last_name);
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<UuidNameReply> {
        let num_entries = buf.try_read_block_count()?;
        let mut entries = Vec::with_capacity(num_entries);
        for _ in 0..num_entries {
            entries.push(UuidNameEntry {
                id: buf.try_read_uuid()?,
                first_name: buf.try_read_text1()?,
                last_name: buf.try_read_text1()?,
            });
        }
        Ok(UuidNameReply { entries })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompleteAgentMovement {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}
impl CompleteAgentMovement {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_u32_le(self.circuit_code);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<CompleteAgentMovement> {
        Ok(CompleteAgentMovement {
            agent_id: buf.try_read_uuid()?,
            session_id: buf.try_read_uuid()?,
            circuit_code: buf.try_read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AgentMovementComplete {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub position: Vec3,
    pub look_at: Vec3,
    pub region_handle: u64,
    pub timestamp: u32,
    pub channel_version: String,
}
impl AgentMovementComplete {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_vec3(self.position);
        buf.put_vec3(self.look_at);
        buf.put_u64_le(self.region_handle);
        buf.put_u32_le(self.timestamp);
        buf.put_text2(&self.channel_version, MAX_TEXT2_LEN);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<AgentMovementComplete> {
        Ok(AgentMovementComplete {
            agent_id: buf.try_read_uuid()?,
            session_id: buf.try_read_uuid()?,
            position: buf.try_read_vec3()?,
            look_at: buf.try_read_vec3()?,
            region_handle: buf.try_read_u64_le()?,
            timestamp: buf.try_read_u32_le()?,
            channel_version: buf.try_read_text2()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogoutRequest {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}
impl LogoutRequest {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<LogoutRequest> {
        Ok(LogoutRequest {
            agent_id: buf.try_read_uuid()?,
            session_id: buf.try_read_uuid()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogoutReply {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub item_ids: Vec<Uuid>,
}
impl LogoutReply {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uuid(&self.agent_id);
        buf.put_uuid(&self.session_id);
        buf.put_block_count(self.item_ids.len());
        for id in &self.item_ids {
            buf.put_uuid(id);
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<LogoutReply> {
        let agent_id = buf.try_read_uuid()?;
        let session_id = buf.try_read_uuid()?;
        let num_items = buf.try_read_block_count()?;
        let mut item_ids = Vec::with_capacity(num_items);
        for _ in 0..num_items {
            item_ids.push(buf.try_read_uuid()?);
        }
        Ok(LogoutReply { agent_id, session_id, item_ids })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PacketAck {
    pub ids: Vec<u32>,
}
impl PacketAck {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_block_count(self.ids.len());
        for &id in &self.ids {
            buf.put_u32_le(id);
        }
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketAck> {
        let num_ids = buf.try_read_block_count()?;
        let mut ids = Vec::with_capacity(num_ids);
        for _ in 0..num_ids {
            ids.push(buf.try_read_u32_le()?);
        }
        Ok(PacketAck { ids })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpenCircuit {
    pub ip: Ipv4Addr,
    pub port: u16,
}
impl Default for OpenCircuit {
    fn default() -> Self {
        OpenCircuit {
            ip: Ipv4Addr::UNSPECIFIED,
            port: 0,
        }
    }
}
impl OpenCircuit {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_ipv4(self.ip);
        buf.put_u16(self.port);
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<OpenCircuit> {
        Ok(OpenCircuit {
            ip: buf.try_read_ipv4()?,
            port: buf.try_read_u16_be()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CloseCircuit;
impl CloseCircuit {
    fn ser(&self, _buf: &mut impl BufMut) {
    }

    fn deser(_buf: &mut impl Buf) -> anyhow::Result<CloseCircuit> {
        Ok(CloseCircuit)
    }
}
