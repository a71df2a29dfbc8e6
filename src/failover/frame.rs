//! Wire framing for the peer control channel.
//!
//! Every message is a length-prefixed frame:
//!
//! ```text
//! offset 0-1  total length, big-endian, header included
//! offset 2    message type
//! offset 3    reserved flags, always 0
//! offset 4..  payload
//! ```

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::model::FailoverRole;
use crate::core::errors::FailoverError;
use crate::core::packet::HardwareAddress;

use super::state::FailoverState;

pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

const KIND_CONNECT: u8 = 1;
const KIND_CONNECTACK: u8 = 2;
const KIND_STATE: u8 = 3;
const KIND_CONTACT: u8 = 4;
const KIND_DISCONNECT: u8 = 5;
const KIND_BNDUPD: u8 = 6;
const KIND_BNDACK: u8 = 7;
const KIND_POOLREQ: u8 = 9;
const KIND_UPDREQALL: u8 = 11;
const KIND_UPDDONE: u8 = 12;

/// Lease states as replicated between peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Free,
    Active,
    Expired,
    Released,
    Abandoned,
    Reset,
}

impl BindingState {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Free),
            1 => Some(Self::Active),
            2 => Some(Self::Expired),
            3 => Some(Self::Released),
            4 => Some(Self::Abandoned),
            5 => Some(Self::Reset),
            _ => None,
        }
    }

    pub fn wire(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Active => 1,
            Self::Expired => 2,
            Self::Released => 3,
            Self::Abandoned => 4,
            Self::Reset => 5,
        }
    }
}

/// A replicated binding. Times are u32 unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingUpdate {
    pub tx_id: u32,
    pub address: Ipv4Addr,
    pub hardware_address: HardwareAddress,
    pub state: BindingState,
    pub start_time: u32,
    pub end_time: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverMessage {
    Connect {
        version: (u8, u8),
        send_time: u32,
        mclt: u32,
        split: u8,
        role: FailoverRole,
        state: FailoverState,
        local_addr: Ipv4Addr,
    },
    ConnectAck {
        reject_reason: u8,
        state: FailoverState,
    },
    State {
        state: FailoverState,
    },
    Contact,
    Disconnect,
    BndUpd(BindingUpdate),
    BndAck {
        tx_id: u32,
        status: u8,
    },
    PoolReq,
    UpdReqAll,
    UpdDone,
}

impl FailoverMessage {
    pub fn kind(&self) -> u8 {
        match self {
            Self::Connect { .. } => KIND_CONNECT,
            Self::ConnectAck { .. } => KIND_CONNECTACK,
            Self::State { .. } => KIND_STATE,
            Self::Contact => KIND_CONTACT,
            Self::Disconnect => KIND_DISCONNECT,
            Self::BndUpd(_) => KIND_BNDUPD,
            Self::BndAck { .. } => KIND_BNDACK,
            Self::PoolReq => KIND_POOLREQ,
            Self::UpdReqAll => KIND_UPDREQALL,
            Self::UpdDone => KIND_UPDDONE,
        }
    }

    /// Renders the complete frame, header included.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Self::Connect {
                version,
                send_time,
                mclt,
                split,
                role,
                state,
                local_addr,
            } => {
                payload.push(version.0);
                payload.push(version.1);
                payload.extend_from_slice(&send_time.to_be_bytes());
                payload.extend_from_slice(&mclt.to_be_bytes());
                payload.push(*split);
                payload.push(role.wire());
                payload.push(state.wire());
                payload.extend_from_slice(&local_addr.octets());
            }
            Self::ConnectAck {
                reject_reason,
                state,
            } => {
                payload.push(*reject_reason);
                payload.push(state.wire());
            }
            Self::State { state } => payload.push(state.wire()),
            Self::Contact | Self::Disconnect | Self::PoolReq | Self::UpdReqAll | Self::UpdDone => {}
            Self::BndUpd(update) => {
                payload.extend_from_slice(&update.tx_id.to_be_bytes());
                payload.extend_from_slice(&update.address.octets());
                payload.extend_from_slice(&update.hardware_address.bytes());
                payload.push(update.state.wire());
                payload.extend_from_slice(&update.start_time.to_be_bytes());
                payload.extend_from_slice(&update.end_time.to_be_bytes());
            }
            Self::BndAck { tx_id, status } => {
                payload.extend_from_slice(&tx_id.to_be_bytes());
                payload.push(*status);
            }
        }

        let total = (payload.len() + 4) as u16;
        let mut frame = Vec::with_capacity(total as usize);
        frame.extend_from_slice(&total.to_be_bytes());
        frame.push(self.kind());
        frame.push(0);
        frame.extend_from_slice(&payload);
        frame
    }

    pub fn decode(kind: u8, payload: &[u8]) -> Result<Self, FailoverError> {
        match kind {
            KIND_CONNECT => {
                if payload.len() < 17 {
                    return Err(FailoverError::BadFrame("short CONNECT"));
                }
                let role = match payload[11] {
                    0 => FailoverRole::Primary,
                    1 => FailoverRole::Secondary,
                    _ => return Err(FailoverError::BadFrame("unknown role")),
                };
                let state = FailoverState::from_wire(payload[12])
                    .ok_or(FailoverError::BadFrame("unknown state"))?;
                Ok(Self::Connect {
                    version: (payload[0], payload[1]),
                    send_time: be_u32(&payload[2..6]),
                    mclt: be_u32(&payload[6..10]),
                    split: payload[10],
                    role,
                    state,
                    local_addr: Ipv4Addr::new(
                        payload[13], payload[14], payload[15], payload[16],
                    ),
                })
            }
            KIND_CONNECTACK => {
                if payload.len() < 2 {
                    return Err(FailoverError::BadFrame("short CONNECTACK"));
                }
                let state = FailoverState::from_wire(payload[1])
                    .ok_or(FailoverError::BadFrame("unknown state"))?;
                Ok(Self::ConnectAck {
                    reject_reason: payload[0],
                    state,
                })
            }
            KIND_STATE => {
                let state = payload
                    .first()
                    .and_then(|b| FailoverState::from_wire(*b))
                    .ok_or(FailoverError::BadFrame("short STATE"))?;
                Ok(Self::State { state })
            }
            KIND_CONTACT => Ok(Self::Contact),
            KIND_DISCONNECT => Ok(Self::Disconnect),
            KIND_BNDUPD => {
                if payload.len() < 23 {
                    return Err(FailoverError::BadFrame("short BNDUPD"));
                }
                let mut hw = [0u8; 6];
                hw.copy_from_slice(&payload[8..14]);
                let state = BindingState::from_wire(payload[14])
                    .ok_or(FailoverError::BadFrame("unknown binding state"))?;
                Ok(Self::BndUpd(BindingUpdate {
                    tx_id: be_u32(&payload[0..4]),
                    address: Ipv4Addr::new(payload[4], payload[5], payload[6], payload[7]),
                    hardware_address: HardwareAddress::new(hw),
                    state,
                    start_time: be_u32(&payload[15..19]),
                    end_time: be_u32(&payload[19..23]),
                }))
            }
            KIND_BNDACK => {
                if payload.len() < 5 {
                    return Err(FailoverError::BadFrame("short BNDACK"));
                }
                Ok(Self::BndAck {
                    tx_id: be_u32(&payload[0..4]),
                    status: payload[4],
                })
            }
            KIND_POOLREQ => Ok(Self::PoolReq),
            KIND_UPDREQALL => Ok(Self::UpdReqAll),
            KIND_UPDDONE => Ok(Self::UpdDone),
            _ => Err(FailoverError::BadFrame("unknown message type")),
        }
    }
}

fn be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Reads one frame off the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<FailoverMessage, FailoverError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;
    let total = u16::from_be_bytes([header[0], header[1]]) as usize;
    if total < 4 {
        return Err(FailoverError::BadFrame("length below header size"));
    }
    let mut payload = vec![0u8; total - 4];
    reader.read_exact(&mut payload).await?;
    FailoverMessage::decode(header[2], &payload)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &FailoverMessage,
) -> Result<(), FailoverError> {
    writer.write_all(&message.encode()).await?;
    writer.flush().await?;
    Ok(())
}
