//! Byte-level frame codec.
//!
//! Frames are small datagrams with an address block, a 6-bit sequence
//! number, and a trailing two's-complement checksum. Three frame kinds
//! exist on the wire: requests, responses (correlated by sequence number),
//! and unsolicited events (never correlated).

use crate::error::{Error, Result};
use crate::types::{Address, Message, RawResponse};

/// Frame kind discriminants.
mod kind {
    pub const REQUEST: u8 = 0x00;
    pub const RESPONSE: u8 = 0x01;
    pub const EVENT: u8 = 0x02;
}

/// Address tag values in the frame address block.
mod addr_tag {
    pub const SYSTEM_INTERFACE: u8 = 0x00;
    pub const BUS: u8 = 0x01;
    pub const BUS_BROADCAST: u8 = 0x02;
}

/// Number of sequence slots (the wire field is 6 bits).
pub const MAX_SEQ: usize = 64;

/// Maximum command/response data length carried in one frame.
pub const MAX_DATA_LEN: usize = 64;

/// Length of the typed header at the front of every repository record:
/// id (2), version (1), type (1), remaining length (1).
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest record slice requested per transfer; longer records are
/// assembled from chunked offset reads.
pub const MAX_RECORD_CHUNK: usize = 32;

const FIXED_LEN: usize = 9;

/// A decoded incoming frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A response to an outstanding request.
    Response {
        /// Echoed sequence number.
        seq: u8,
        /// Responder address.
        source: Address,
        /// Response network function (request netfn with the reply bit set).
        netfn: u8,
        /// Echoed command number.
        cmd: u8,
        /// Completion code and data.
        response: RawResponse,
    },
    /// An unsolicited event.
    Event {
        /// Originating address.
        source: Address,
        /// Raw event payload.
        message: Message,
    },
}

fn push_address(out: &mut Vec<u8>, addr: Address) {
    match addr {
        Address::SystemInterface { channel, lun } => {
            out.extend_from_slice(&[addr_tag::SYSTEM_INTERFACE, channel, lun, 0x00]);
        }
        Address::Bus {
            channel,
            lun,
            target,
        } => {
            out.extend_from_slice(&[addr_tag::BUS, channel, lun, target]);
        }
        Address::BusBroadcast {
            channel,
            lun,
            target,
        } => {
            out.extend_from_slice(&[addr_tag::BUS_BROADCAST, channel, lun, target]);
        }
    }
}

fn parse_address(bytes: &[u8]) -> Result<Address> {
    let (tag, channel, lun, target) = (bytes[0], bytes[1], bytes[2], bytes[3]);
    match tag {
        addr_tag::SYSTEM_INTERFACE => Ok(Address::SystemInterface { channel, lun }),
        addr_tag::BUS => Ok(Address::Bus {
            channel,
            lun,
            target,
        }),
        addr_tag::BUS_BROADCAST => Ok(Address::BusBroadcast {
            channel,
            lun,
            target,
        }),
        _ => Err(Error::Protocol("unknown address tag")),
    }
}

fn checksum(bytes: &[u8]) -> u8 {
    let sum: u8 = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    sum.wrapping_neg()
}

fn encode(kind: u8, addr: Address, seq: u8, netfn: u8, cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
    if data.len() > MAX_DATA_LEN {
        return Err(Error::InvalidArgument("frame data too long"));
    }
    if seq as usize >= MAX_SEQ {
        return Err(Error::InvalidArgument("sequence number out of range"));
    }

    let mut frame = Vec::with_capacity(FIXED_LEN + data.len() + 1);
    frame.push(kind);
    push_address(&mut frame, addr);
    frame.push(seq);
    frame.push(netfn);
    frame.push(cmd);
    frame.push(data.len() as u8);
    frame.extend_from_slice(data);
    frame.push(checksum(&frame));

    Ok(frame)
}

/// Encode a request frame.
pub fn encode_request(addr: Address, seq: u8, msg: &Message) -> Result<Vec<u8>> {
    encode(kind::REQUEST, addr, seq, msg.netfn, msg.cmd, &msg.data)
}

/// Encode a response frame (device side; used by channel test doubles and
/// bridge tooling).
pub fn encode_response(
    source: Address,
    seq: u8,
    netfn: u8,
    cmd: u8,
    response: &RawResponse,
) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(1 + response.data.len());
    data.push(response.completion_code);
    data.extend_from_slice(&response.data);
    encode(kind::RESPONSE, source, seq, netfn, cmd, &data)
}

/// Encode an unsolicited event frame (device side).
pub fn encode_event(source: Address, msg: &Message) -> Result<Vec<u8>> {
    encode(kind::EVENT, source, 0, msg.netfn, msg.cmd, &msg.data)
}

struct RawFrame<'a> {
    kind: u8,
    source: Address,
    seq: u8,
    netfn: u8,
    cmd: u8,
    data: &'a [u8],
}

fn split_frame(bytes: &[u8]) -> Result<RawFrame<'_>> {
    if bytes.len() < FIXED_LEN + 1 {
        return Err(Error::Protocol("frame too short"));
    }
    if checksum(&bytes[..bytes.len() - 1]) != bytes[bytes.len() - 1] {
        return Err(Error::Protocol("bad frame checksum"));
    }

    let data_len = bytes[8] as usize;
    if data_len > MAX_DATA_LEN || bytes.len() != FIXED_LEN + data_len + 1 {
        return Err(Error::Protocol("frame length mismatch"));
    }

    Ok(RawFrame {
        kind: bytes[0],
        source: parse_address(&bytes[1..5])?,
        seq: bytes[5],
        netfn: bytes[6],
        cmd: bytes[7],
        data: &bytes[FIXED_LEN..FIXED_LEN + data_len],
    })
}

/// Decode one incoming frame.
///
/// Requests are not expected on the receive path of a client and are
/// rejected as a protocol error like any other malformed frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let raw = split_frame(bytes)?;

    match raw.kind {
        kind::RESPONSE => {
            if raw.seq as usize >= MAX_SEQ {
                return Err(Error::Protocol("response sequence out of range"));
            }
            if raw.data.is_empty() {
                return Err(Error::Protocol("response without completion code"));
            }
            Ok(Frame::Response {
                seq: raw.seq,
                source: raw.source,
                netfn: raw.netfn,
                cmd: raw.cmd,
                response: RawResponse {
                    completion_code: raw.data[0],
                    data: raw.data[1..].to_vec(),
                },
            })
        }
        kind::EVENT => Ok(Frame::Event {
            source: raw.source,
            message: Message::new(raw.netfn, raw.cmd, raw.data.to_vec()),
        }),
        kind::REQUEST => Err(Error::Protocol("unexpected request frame")),
        _ => Err(Error::Protocol("unknown frame kind")),
    }
}

/// Decode a request frame (device side; used by channel test doubles and
/// bridge tooling).
pub fn decode_request(bytes: &[u8]) -> Result<(Address, u8, Message)> {
    let raw = split_frame(bytes)?;

    if raw.kind != kind::REQUEST {
        return Err(Error::Protocol("not a request frame"));
    }
    if raw.seq as usize >= MAX_SEQ {
        return Err(Error::Protocol("request sequence out of range"));
    }

    Ok((
        raw.source,
        raw.seq,
        Message::new(raw.netfn, raw.cmd, raw.data.to_vec()),
    ))
}
