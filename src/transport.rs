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

//! The raw-socket send side of the engine, and the trait seam that lets
//! tests swap it out.
//!
//! Production code owns a `pnet::transport::TransportSender` directly,
//! behind a small [`Transport`] trait so engine tests don't need to open a
//! raw ICMP socket, which requires elevated privilege and so isn't
//! available in most test environments.

use std::net::{IpAddr, Ipv4Addr};

use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::transport::{TransportChannelType, TransportSender};

use crate::codec;

/// Abstracts "send these already-encoded Echo Request bytes to this IPv4
/// destination" so the engine doesn't have to know whether it's talking to
/// a real socket or a test double.
pub trait Transport: Send {
    fn send_to(&mut self, packet: &[u8], destination: Ipv4Addr) -> std::io::Result<()>;
}

/// Creates the `TransportChannelType` for raw ICMP over IPv4.
pub fn icmp_protocol() -> TransportChannelType {
    use pnet::packet::ip::IpNextHeaderProtocols;
    use pnet::transport::TransportChannelType::Layer4;
    use pnet::transport::TransportProtocol::Ipv4;
    Layer4(Ipv4(IpNextHeaderProtocols::Icmp))
}

/// The production `Transport`: a real raw ICMP socket via `pnet`.
pub struct PnetTransport {
    sender: TransportSender,
}

impl PnetTransport {
    pub fn new(sender: TransportSender) -> Self {
        Self { sender }
    }
}

impl Transport for PnetTransport {
    fn send_to(&mut self, packet: &[u8], destination: Ipv4Addr) -> std::io::Result<()> {
        // `packet` was already fully encoded by `codec::encode_echo_request`;
        // reconstruct the typed view `TransportSender::send_to` wants.
        let mut scratch = packet.to_vec();
        let echo_packet =
            MutableEchoRequestPacket::new(&mut scratch).expect("encoded buffer is a valid echo request");
        self.sender
            .send_to(echo_packet, IpAddr::V4(destination))
            .map(|_| ())
    }
}

/// A `Transport` double for tests: records sends and decodes each one back
/// as if a compliant host had echoed it, so engine tests (in this crate's
/// own `#[cfg(test)]` modules and in `tests/`) don't need a raw socket.
pub mod fake {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// One packet captured by [`FakeTransport`].
    #[derive(Debug, Clone)]
    pub struct SentPacket {
        pub destination: Ipv4Addr,
        pub decoded: codec::DecodedReply,
    }

    /// Records every send instead of touching the network, and decodes
    /// each one back (as if a compliant host had echoed it) so engine
    /// tests can assert on what would have gone out.
    #[derive(Clone)]
    pub struct FakeTransport {
        pub sent: Arc<Mutex<Vec<SentPacket>>>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self {
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Transport for FakeTransport {
        fn send_to(&mut self, packet: &[u8], destination: Ipv4Addr) -> std::io::Result<()> {
            use pnet::packet::icmp::{IcmpPacket, IcmpTypes, MutableIcmpPacket};
            use pnet::packet::Packet;
            use pnet::util;
            // Reinterpret our own request as if it were the Echo Reply a
            // compliant host would send back: flip the type byte and
            // recompute the checksum over the mutated bytes, then reuse the
            // decoder's trailer parsing.
            let mut scratch = packet.to_vec();
            {
                let mut view = MutableIcmpPacket::new(&mut scratch).unwrap();
                view.set_icmp_type(IcmpTypes::EchoReply);
                view.set_checksum(0);
            }
            let checksum = util::checksum(&scratch, 1);
            {
                let mut view = MutableIcmpPacket::new(&mut scratch).unwrap();
                view.set_checksum(checksum);
            }
            if let Some(decoded) = codec::decode_echo_reply(IcmpPacket::new(&scratch).unwrap()) {
                self.sent.lock().unwrap().push(SentPacket { destination, decoded });
            }
            Ok(())
        }
    }
}
