// Copyright 2020 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! ICMP Echo Request/Reply codec.
//!
//! Builds on `pnet`'s ICMP packet types. `pnet`'s transport layer already
//! strips the IPv4 header for us before handing a reply to the receive
//! loop (it is built on `Layer4(Ipv4(Icmp))`), so decoding here only ever
//! sees ICMP bytes.

use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpTypes};
use pnet::packet::Packet;
use pnet::util;

/// One 1024-byte chunk of a file.
pub const DATA_LENGTH: usize = 1024;

/// Bytes of fixed ICMP echo header (type, code, checksum, identifier, sequence).
const ICMP_ECHO_HEADER_LEN: usize = 8;
/// Bytes of the file_id trailer that precedes the payload.
const FILE_ID_LEN: usize = 4;

/// A decoded Echo Reply carrying loop data.
#[derive(Debug, Clone)]
pub struct DecodedReply {
    pub loop_index: u16,
    pub sequence_number: u16,
    pub file_id: u32,
    pub payload: Vec<u8>,
}

/// Encodes an Echo Request (type 8, code 0) with the wire format:
/// `[ icmp header ][ 4 bytes file_id, little-endian ][ up to 1024 bytes payload ]`.
///
/// Reuses `buffer` as scratch space, clearing it first instead of
/// allocating a fresh one per send.
pub fn encode_echo_request(
    buffer: &mut Vec<u8>,
    loop_index: u16,
    sequence_number: u16,
    file_id: u32,
    data: &[u8],
) {
    buffer.clear();
    buffer.resize(ICMP_ECHO_HEADER_LEN + FILE_ID_LEN + data.len(), 0);

    let mut trailer = Vec::with_capacity(FILE_ID_LEN + data.len());
    trailer.extend_from_slice(&file_id.to_le_bytes());
    trailer.extend_from_slice(data);

    let mut packet = MutableEchoRequestPacket::new(buffer).expect("buffer sized for echo header");
    packet.set_icmp_type(IcmpTypes::EchoRequest);
    packet.set_icmp_code(IcmpCode::new(0));
    packet.set_identifier(loop_index);
    packet.set_sequence_number(sequence_number);
    packet.set_payload(&trailer);
    packet.set_checksum(0);
    let checksum = util::checksum(packet.packet(), 1);
    packet.set_checksum(checksum);
}

/// Decodes an Echo Reply. Returns `None` (a silent drop) on a bad checksum,
/// a non-Echo-Reply type, or a trailer too short to hold a file_id.
pub fn decode_echo_reply(packet: IcmpPacket) -> Option<DecodedReply> {
    if packet.get_icmp_type() != IcmpTypes::EchoReply {
        return None;
    }
    let bytes = packet.packet();
    let reply = EchoReplyPacket::new(bytes)?;
    if util::checksum(reply.packet(), 1) != reply.get_checksum() {
        return None;
    }

    let trailer = reply.payload();
    if trailer.len() < FILE_ID_LEN {
        return None;
    }
    let mut file_id_bytes = [0u8; FILE_ID_LEN];
    file_id_bytes.copy_from_slice(&trailer[..FILE_ID_LEN]);

    Some(DecodedReply {
        loop_index: reply.get_identifier(),
        sequence_number: reply.get_sequence_number(),
        file_id: u32::from_le_bytes(file_id_bytes),
        payload: trailer[FILE_ID_LEN..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pnet::packet::icmp::MutableIcmpPacket;

    /// Rebuild an `IcmpPacket` the way the real receive path would hand one
    /// to `decode_echo_reply`: same bytes, reinterpreted generically.
    fn as_generic<'a>(bytes: &'a [u8]) -> IcmpPacket<'a> {
        IcmpPacket::new(bytes).unwrap()
    }

    fn make_reply(loop_index: u16, seq: u16, file_id: u32, data: &[u8]) -> Vec<u8> {
        // Build an echo request the way encode_echo_request does, then flip
        // its type to EchoReply, as a compliant host's kernel would.
        let mut buf = Vec::new();
        encode_echo_request(&mut buf, loop_index, seq, file_id, data);
        {
            let mut packet = MutableIcmpPacket::new(&mut buf).unwrap();
            packet.set_icmp_type(IcmpTypes::EchoReply);
            packet.set_checksum(0);
        }
        let checksum = util::checksum(&buf, 1);
        let mut packet = MutableIcmpPacket::new(&mut buf).unwrap();
        packet.set_checksum(checksum);
        buf
    }

    #[test]
    fn round_trips_loop_index_sequence_file_id_and_payload() {
        let data = b"hello world, this is loop payload";
        let buf = make_reply(7, 42, 99, data);
        let decoded = decode_echo_reply(as_generic(&buf)).expect("valid reply");
        assert_eq!(decoded.loop_index, 7);
        assert_eq!(decoded.sequence_number, 42);
        assert_eq!(decoded.file_id, 99);
        assert_eq!(decoded.payload, data);
    }

    #[test]
    fn rejects_non_echo_reply_type() {
        let mut buf = Vec::new();
        encode_echo_request(&mut buf, 1, 1, 1, b"x");
        // This is still an EchoRequest, not a reply: must be dropped.
        assert!(decode_echo_reply(as_generic(&buf)).is_none());
    }

    #[test]
    fn rejects_corrupted_checksum() {
        let mut buf = make_reply(1, 1, 1, b"payload");
        buf[2] ^= 0xff; // flip a checksum byte
        assert!(decode_echo_reply(as_generic(&buf)).is_none());
    }

    #[test]
    fn rejects_trailer_shorter_than_file_id() {
        // Hand-build a reply whose trailer is only 2 bytes, shorter than the
        // 4-byte file_id a real encoder would always include.
        let mut buf = vec![0u8; ICMP_ECHO_HEADER_LEN + 2];
        {
            let mut packet = MutableIcmpPacket::new(&mut buf).unwrap();
            packet.set_icmp_type(IcmpTypes::EchoReply);
            packet.set_checksum(0);
        }
        let checksum = util::checksum(&buf, 1);
        {
            let mut packet = MutableIcmpPacket::new(&mut buf).unwrap();
            packet.set_checksum(checksum);
        }
        assert!(decode_echo_reply(as_generic(&buf)).is_none());
    }
}
