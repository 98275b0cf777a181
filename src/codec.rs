use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio_util::bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::IpFamily;
use crate::message::{Broadcast, MemberUpdate, Message, Verb};
use crate::state::NodeStatus;

/// Flag bit: a broadcast block follows the member records.
const FLAG_BROADCAST: u8 = 0x80;
/// Flag bit: a target block follows the header (ping-req and relayed acks).
const FLAG_TARGET: u8 = 0x40;
const VERB_MASK: u8 = 0x0F;

/// Fixed header: flags/verb (1), sender heartbeat (4), nonce (4),
/// address family tag (1), member count (1).
const HEADER_LEN: usize = 11;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("encoded datagram is {len} bytes, exceeds maximum of {max}")]
    Oversize { len: usize, max: usize },

    #[error("datagram truncated")]
    Truncated,

    #[error("unknown verb byte {0:#04x}")]
    BadVerb(u8),

    #[error("unknown status byte {0:#04x}")]
    BadStatus(u8),

    #[error("address family tag {0} does not match this cluster")]
    BadFamily(u8),

    #[error("broadcast length {declared} exceeds maximum of {max}")]
    BadLength { declared: usize, max: usize },

    #[error("{0} trailing bytes after message body")]
    Trailing(usize),
}

/// Encoder/decoder for the membership wire format.
///
/// Big-endian throughout. The codec is pure: it holds only the address
/// family and size limits it was constructed with, so concurrent use needs
/// no synchronization. Layout of one datagram:
///
/// ```text
/// 0        flags (bit7 broadcast, bit6 target) | verb (low 4 bits)
/// 1..5     sender heartbeat (u32)
/// 5..9     nonce (u32)
/// 9        address family (4 or 6)
/// 10       member count M
/// 11..     target block, if flagged: port (2) | ip (ipLen)
/// then     M member records:
///            status (1) | heartbeat (4) | port (2) | ip (ipLen)
///            | source port (2) | source ip (ipLen)
/// then     broadcast block, if flagged:
///            origin port (2) | origin ip (ipLen) | index (4)
///            | length (2) | payload
/// ```
///
/// The sender's own address is never encoded; it is taken from the UDP
/// source address on receive.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WireCodec {
    family: IpFamily,
    max_datagram: usize,
    max_broadcast: usize,
}

impl WireCodec {
    pub(crate) fn new(family: IpFamily, max_datagram: usize, max_broadcast: usize) -> Self {
        Self {
            family,
            max_datagram,
            max_broadcast,
        }
    }

    fn ip_len(&self) -> usize {
        self.family.ip_len()
    }

    /// Bytes taken by the fixed header plus an optional target block.
    pub(crate) fn base_len(&self, with_target: bool) -> usize {
        HEADER_LEN + if with_target { 2 + self.ip_len() } else { 0 }
    }

    /// Bytes taken by one member record.
    pub(crate) fn member_record_len(&self) -> usize {
        9 + 2 * self.ip_len()
    }

    /// Bytes taken by a broadcast block carrying `payload_len` bytes.
    pub(crate) fn broadcast_len(&self, payload_len: usize) -> usize {
        8 + self.ip_len() + payload_len
    }

    pub(crate) fn encode(&self, msg: &Message) -> Result<BytesMut, CodecError> {
        let mut flags = msg.verb as u8;
        if msg.target.is_some() {
            flags |= FLAG_TARGET;
        }
        if msg.broadcast.is_some() {
            flags |= FLAG_BROADCAST;
        }

        let mut dst = BytesMut::with_capacity(self.max_datagram);
        dst.put_u8(flags);
        dst.put_u32(msg.sender_heartbeat);
        dst.put_u32(msg.nonce);
        dst.put_u8(self.family.wire_tag());
        dst.put_u8(u8::try_from(msg.members.len()).map_err(|_| CodecError::Oversize {
            len: msg.members.len(),
            max: u8::MAX as usize,
        })?);

        if let Some(target) = msg.target {
            dst.put_u16(target.port());
            self.put_ip(&mut dst, target.ip())?;
        }

        for member in &msg.members {
            dst.put_u8(member.status as u8);
            dst.put_u32(member.heartbeat);
            dst.put_u16(member.addr.port());
            self.put_ip(&mut dst, member.addr.ip())?;
            dst.put_u16(member.source.port());
            self.put_ip(&mut dst, member.source.ip())?;
        }

        if let Some(broadcast) = &msg.broadcast {
            if broadcast.payload.len() > self.max_broadcast {
                return Err(CodecError::BadLength {
                    declared: broadcast.payload.len(),
                    max: self.max_broadcast,
                });
            }
            dst.put_u16(broadcast.origin.port());
            self.put_ip(&mut dst, broadcast.origin.ip())?;
            dst.put_u32(broadcast.index);
            dst.put_u16(broadcast.payload.len() as u16);
            dst.extend_from_slice(&broadcast.payload);
        }

        if dst.len() > self.max_datagram {
            return Err(CodecError::Oversize {
                len: dst.len(),
                max: self.max_datagram,
            });
        }

        Ok(dst)
    }

    /// Decode one datagram. `sender` is the UDP source address of the frame.
    pub(crate) fn decode(&self, sender: SocketAddr, src: &[u8]) -> Result<Message, CodecError> {
        let mut buf = src;
        need(buf, HEADER_LEN)?;

        let flags = buf.get_u8();
        let verb = Verb::from_wire(flags & VERB_MASK).ok_or(CodecError::BadVerb(flags & VERB_MASK))?;
        let sender_heartbeat = buf.get_u32();
        let nonce = buf.get_u32();

        let family_tag = buf.get_u8();
        if family_tag != self.family.wire_tag() {
            return Err(CodecError::BadFamily(family_tag));
        }

        let member_count = buf.get_u8() as usize;

        let target = if flags & FLAG_TARGET != 0 {
            need(buf, 2 + self.ip_len())?;
            let port = buf.get_u16();
            let ip = self.get_ip(&mut buf);
            Some(SocketAddr::new(ip, port))
        } else {
            None
        };

        let mut members = Vec::with_capacity(member_count);
        for _ in 0..member_count {
            need(buf, self.member_record_len())?;
            let status_byte = buf.get_u8();
            let status = NodeStatus::from_wire(status_byte).ok_or(CodecError::BadStatus(status_byte))?;
            let heartbeat = buf.get_u32();
            let port = buf.get_u16();
            let ip = self.get_ip(&mut buf);
            let source_port = buf.get_u16();
            let source_ip = self.get_ip(&mut buf);
            members.push(MemberUpdate {
                addr: SocketAddr::new(ip, port),
                status,
                heartbeat,
                source: SocketAddr::new(source_ip, source_port),
            });
        }

        let broadcast = if flags & FLAG_BROADCAST != 0 {
            need(buf, 8 + self.ip_len())?;
            let origin_port = buf.get_u16();
            let origin_ip = self.get_ip(&mut buf);
            let index = buf.get_u32();
            let length = buf.get_u16() as usize;
            if length > self.max_broadcast {
                return Err(CodecError::BadLength {
                    declared: length,
                    max: self.max_broadcast,
                });
            }
            need(buf, length)?;
            let payload = Bytes::copy_from_slice(&buf[..length]);
            buf.advance(length);
            Some(Broadcast {
                origin: SocketAddr::new(origin_ip, origin_port),
                index,
                payload,
            })
        } else {
            None
        };

        if !buf.is_empty() {
            return Err(CodecError::Trailing(buf.len()));
        }

        Ok(Message {
            verb,
            sender_heartbeat,
            nonce,
            sender,
            target,
            members,
            broadcast,
        })
    }

    fn put_ip(&self, dst: &mut BytesMut, ip: IpAddr) -> Result<(), CodecError> {
        match (self.family, ip) {
            (IpFamily::V4, IpAddr::V4(v4)) => dst.extend_from_slice(&v4.octets()),
            (IpFamily::V6, IpAddr::V6(v6)) => dst.extend_from_slice(&v6.octets()),
            (family, _) => return Err(CodecError::BadFamily(family.wire_tag())),
        }
        Ok(())
    }

    fn get_ip(&self, buf: &mut &[u8]) -> IpAddr {
        // Length was validated by the caller's `need`.
        match self.family {
            IpFamily::V4 => {
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            IpFamily::V6 => {
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        }
    }
}

fn need(buf: &[u8], len: usize) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    Ok(())
}
