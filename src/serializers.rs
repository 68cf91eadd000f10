//! Conversion of simulation-side data into outbound packets. These are pure functions apart
//!  from drawing packet objects from the pool.

use std::net::Ipv4Addr;
use bytes::BufMut;
use glam::{Quat, Vec3};
use tracing::warn;
use uuid::Uuid;
use crate::buffers::packet_pool::PacketPool;
use crate::packet::header::SEQUENCE_END;
use crate::packet::messages::*;
use crate::packet::Packet;
use crate::util::buf_ext::{truncate_utf8, MAX_VARIABLE1_LEN};

pub const VELOCITY_RANGE: f32 = 128.0;
pub const ACCELERATION_RANGE: f32 = 64.0;
pub const ROTATION_RANGE: f32 = 1.0;
pub const ANGULAR_VELOCITY_RANGE: f32 = 64.0;

/// length of the terse `Data` block of an avatar
pub const TERSE_AVATAR_LEN: usize = 60;
/// length of the terse `Data` block of a prim, which has no collision plane
pub const TERSE_PRIM_LEN: usize = 44;

/// Maps `value`, clamped to `lower..=upper`, linearly onto `0..=65535`
pub fn float_to_u16(value: f32, lower: f32, upper: f32) -> u16 {
    if value.is_nan() {
        return float_to_u16(0.0, lower, upper);
    }
    let normalized = (value.clamp(lower, upper) - lower) / (upper - lower);
    (normalized * u16::MAX as f32).round() as u16
}

pub fn u16_to_float(value: u16, lower: f32, upper: f32) -> f32 {
    lower + (value as f32 / u16::MAX as f32) * (upper - lower)
}

/// The movement state of an avatar or prim for a terse update
#[derive(Clone, Debug, PartialEq)]
pub struct TerseUpdate {
    pub local_id: u32,
    pub state: u8,
    pub position: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
    pub rotation: Quat,
    pub angular_velocity: Vec3,
}

fn put_packed_vec3(buf: &mut impl BufMut, v: Vec3, range: f32) {
    buf.put_u16_le(float_to_u16(v.x, -range, range));
    buf.put_u16_le(float_to_u16(v.y, -range, range));
    buf.put_u16_le(float_to_u16(v.z, -range, range));
}

/// the packed `Data` block of a terse update
pub fn terse_update_block(update: &TerseUpdate, is_avatar: bool) -> Vec<u8> {
    let mut buf = Vec::with_capacity(TERSE_AVATAR_LEN);
    buf.put_u32_le(update.local_id);
    buf.put_u8(update.state);
    buf.put_u8(is_avatar as u8);
    if is_avatar {
        // collision plane
        buf.put_f32_le(0.0);
        buf.put_f32_le(0.0);
        buf.put_f32_le(0.0);
        buf.put_f32_le(1.0);
    }
    buf.put_f32_le(update.position.x);
    buf.put_f32_le(update.position.y);
    buf.put_f32_le(update.position.z);
    put_packed_vec3(&mut buf, update.velocity, VELOCITY_RANGE);
    put_packed_vec3(&mut buf, update.acceleration, ACCELERATION_RANGE);

    let rotation = if update.rotation == Quat::from_xyzw(0.0, 0.0, 0.0, 0.0) {
        Quat::IDENTITY
    }
    else {
        update.rotation
    };
    for component in [rotation.x, rotation.y, rotation.z, rotation.w] {
        buf.put_u16_le(float_to_u16(component, -ROTATION_RANGE, ROTATION_RANGE));
    }

    put_packed_vec3(&mut buf, update.angular_velocity, ANGULAR_VELOCITY_RANGE);
    buf
}

/// flags, sequence and the length of an empty extra header
const PACKET_HEADER_LEN: usize = SEQUENCE_END + 1;

/// a variable block carries its entry count in a u8
pub const MAX_BLOCK_ENTRIES: usize = u8::MAX as usize;

/// The bytes left for a message's variable block in a packet of `max_packet_size`, after the
///  header, the message number and the message's fixed fields (block count included)
fn block_budget(max_packet_size: usize, packet_type: PacketType, fixed_len: usize) -> usize {
    let number_len = packet_type.message_number()
        .map(|n| n.wire_len())
        .unwrap_or(0);
    max_packet_size.saturating_sub(PACKET_HEADER_LEN + number_len + fixed_len)
}

/// Splits the entries of a variable block into per-packet batches, preserving their order. A
///  batch has at most [MAX_BLOCK_ENTRIES] entries which fit `budget` bytes on the wire. An
///  entry that does not even fit an otherwise empty packet is dropped.
fn split_block<T>(entries: Vec<T>, budget: usize, wire_len: impl Fn(&T) -> usize) -> Vec<Vec<T>> {
    let mut result = Vec::new();
    let mut batch = Vec::new();
    let mut batch_len = 0;

    for entry in entries {
        let len = wire_len(&entry);
        if len > budget {
            warn!("block entry of {} bytes exceeds the budget of {} bytes per packet - dropping it", len, budget);
            continue;
        }
        if batch.len() == MAX_BLOCK_ENTRIES || batch_len + len > budget {
            result.push(std::mem::take(&mut batch));
            batch_len = 0;
        }
        batch.push(entry);
        batch_len += len;
    }

    if !batch.is_empty() {
        result.push(batch);
    }
    result
}

fn terse_update(pool: &PacketPool, max_packet_size: usize, region_handle: u64, time_dilation: f32, objects: Vec<TerseObjectData>) -> Vec<Packet> {
    // region handle, time dilation, block count
    let budget = block_budget(max_packet_size, PacketType::ImprovedTerseObjectUpdate, 8 + 2 + 1);
    let time_dilation = float_to_u16(time_dilation, 0.0, 1.0);

    split_block(objects, budget, |o| 1 + o.data.len() + 2 + o.texture_entry.len())
        .into_iter()
        .map(|objects| pool.acquire_with(ImprovedTerseObjectUpdate {
            region_handle,
            time_dilation,
            objects,
        }))
        .collect()
}

/// One `ImprovedTerseObjectUpdate` per batch of avatars that fits a packet; none for no avatars
pub fn terse_avatar_update(pool: &PacketPool, max_packet_size: usize, region_handle: u64, time_dilation: f32, avatars: &[TerseUpdate]) -> Vec<Packet> {
    let objects = avatars.iter()
        .map(|a| TerseObjectData {
            data: terse_update_block(a, true),
            texture_entry: Vec::new(),
        })
        .collect();
    terse_update(pool, max_packet_size, region_handle, time_dilation, objects)
}

pub fn terse_prim_update(pool: &PacketPool, max_packet_size: usize, region_handle: u64, time_dilation: f32, prims: &[(TerseUpdate, Vec<u8>)]) -> Vec<Packet> {
    let objects = prims.iter()
        .map(|(p, texture_entry)| TerseObjectData {
            data: terse_update_block(p, false),
            texture_entry: texture_entry.clone(),
        })
        .collect();
    terse_update(pool, max_packet_size, region_handle, time_dilation, objects)
}

pub fn kill_object(pool: &PacketPool, max_packet_size: usize, local_ids: &[u32]) -> Vec<Packet> {
    let budget = block_budget(max_packet_size, PacketType::KillObject, 1);
    split_block(local_ids.to_vec(), budget, |_| size_of::<u32>())
        .into_iter()
        .map(|local_ids| {
            let mut result = pool.acquire_with(KillObject { local_ids });
            result.set_reliable(true);
            result
        })
        .collect()
}

/// A standalone ack, sent unreliably. The ids are copied into the block of a recycled packet.
pub fn packet_ack(pool: &PacketPool, ids: &[u32]) -> Packet {
    let mut result = pool.acquire(PacketType::PacketAck);
    if let Message::PacketAck(ack) = &mut result.message {
        ack.ids.extend_from_slice(ids);
    }
    result
}

pub fn start_ping_check(pool: &PacketPool, ping_id: u8, oldest_unacked: u32) -> Packet {
    pool.acquire_with(StartPingCheck { ping_id, oldest_unacked })
}

pub fn complete_ping_check(pool: &PacketPool, ping_id: u8) -> Packet {
    pool.acquire_with(CompletePingCheck { ping_id })
}

pub fn alert_message(pool: &PacketPool, message: &str) -> Packet {
    let mut result = pool.acquire_with(AlertMessage { message: message.to_string() });
    result.set_reliable(true);
    result
}

/// Chat as the viewer displays it: who said it, from where, and how loud
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatArgs<'a> {
    pub from_name: &'a str,
    pub source_id: Uuid,
    pub owner_id: Uuid,
    pub source_type: u8,
    pub chat_type: u8,
    pub audible: u8,
    pub position: Vec3,
    pub message: &'a str,
}

pub fn chat_from_simulator(pool: &PacketPool, chat: &ChatArgs) -> Packet {
    let mut result = pool.acquire_with(ChatFromSimulator {
        from_name: chat.from_name.to_string(),
        source_id: chat.source_id,
        owner_id: chat.owner_id,
        source_type: chat.source_type,
        chat_type: chat.chat_type,
        audible: chat.audible,
        position: chat.position,
        message: chat.message.to_string(),
    });
    result.set_reliable(true);
    result
}

pub fn kick_user(pool: &PacketPool, target_ip: Ipv4Addr, target_port: u16, agent_id: Uuid, session_id: Uuid, reason: &str) -> Packet {
    let mut result = pool.acquire_with(KickUser {
        target_ip,
        target_port,
        agent_id,
        session_id,
        reason: reason.to_string(),
    });
    result.set_reliable(true);
    result
}

pub fn disable_simulator(pool: &PacketPool) -> Packet {
    pool.acquire_with(DisableSimulator)
}

pub fn enable_simulator(pool: &PacketPool, region_handle: u64, ip: Ipv4Addr, port: u16) -> Packet {
    let mut result = pool.acquire_with(EnableSimulator { region_handle, ip, port });
    result.set_reliable(true);
    result
}

pub fn logout_reply(pool: &PacketPool, agent_id: Uuid, session_id: Uuid) -> Packet {
    let mut result = pool.acquire_with(LogoutReply {
        agent_id,
        session_id,
        item_ids: Vec::new(),
    });
    result.set_reliable(true);
    result
}

pub fn agent_movement_complete(pool: &PacketPool, agent_id: Uuid, session_id: Uuid, position: Vec3, look_at: Vec3, region_handle: u64, timestamp: u32, channel_version: &str) -> Packet {
    let mut result = pool.acquire_with(AgentMovementComplete {
        agent_id,
        session_id,
        position,
        look_at,
        region_handle,
        timestamp,
        channel_version: channel_version.to_string(),
    });
    result.set_reliable(true);
    result
}

fn text1_len(s: &str) -> usize {
    // length prefix and NUL
    truncate_utf8(s, MAX_VARIABLE1_LEN - 1).len() + 2
}

pub fn uuid_name_reply(pool: &PacketPool, max_packet_size: usize, names: &[(Uuid, &str, &str)]) -> Vec<Packet> {
    let entries = names.iter()
        .map(|&(id, first_name, last_name)| UuidNameEntry {
            id,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        })
        .collect();

    let budget = block_budget(max_packet_size, PacketType::UuidNameReply, 1);
    split_block(entries, budget, |e| 16 + text1_len(&e.first_name) + text1_len(&e.last_name))
        .into_iter()
        .map(|entries| {
            let mut result = pool.acquire_with(UuidNameReply { entries });
            result.set_reliable(true);
            result
        })
        .collect()
}

pub fn simulator_viewer_time(pool: &PacketPool, usec_since_start: u64, sec_per_day: u32, sec_per_year: u32, sun_direction: Vec3, sun_phase: f32, sun_ang_velocity: Vec3) -> Packet {
    pool.acquire_with(SimulatorViewerTimeMessage {
        usec_since_start,
        sec_per_day,
        sec_per_year,
        sun_direction,
        sun_phase,
        sun_ang_velocity,
    })
}
