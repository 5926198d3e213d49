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

//! The ping engine: send path, receive path, read/write entry points, and
//! lifecycle. `write_to_loop`, `read_from_loop` and `send_to_loop_nodes`
//! are the three operations everything else is built from, backed by
//! timeout/dead-loop tracking so a lost packet doesn't leak an entry
//! forever.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error};

use crate::codec::{self, DecodedReply, DATA_LENGTH};
use crate::error::PoolError;
use crate::pool::AddressPool;
use crate::slot::{self, Slot};
use crate::table::{Key, OutstandingTable};
use crate::timer::TimerService;
use crate::transport::Transport;

/// Sender state shared under one lock: the scratch send buffer and whatever
/// `Transport` currently owns the socket, so every send reuses the same
/// buffer instead of allocating one per packet.
struct SendState {
    buffer: Vec<u8>,
    transport: Box<dyn Transport>,
}

pub struct Engine {
    pools: AddressPool,
    table: Arc<OutstandingTable>,
    timers: Arc<TimerService>,
    write_slot: Slot,
    read_slot: Slot,
    send: Mutex<SendState>,
    running: AtomicBool,
}

impl Engine {
    pub fn new(pools: AddressPool, transport: Box<dyn Transport>) -> Arc<Self> {
        let timers = TimerService::new();
        let table = OutstandingTable::new(Arc::clone(&timers));
        Arc::new(Self {
            pools,
            table,
            timers,
            write_slot: Slot::new(),
            read_slot: Slot::new(),
            send: Mutex::new(SendState {
                buffer: Vec::new(),
                transport,
            }),
            running: AtomicBool::new(false),
        })
    }

    pub fn pools(&self) -> &AddressPool {
        &self.pools
    }

    /// Registers the outstanding entry and fans the echo out to every
    /// pool's destination at `loop_index`, all under one table-lock
    /// acquisition.
    pub fn send_to_loop_nodes(
        &self,
        loop_index: u16,
        file_id: u32,
        sequence_number: u16,
        data: &[u8],
    ) -> Result<(), PoolError> {
        let destinations = self.pools.addresses_at(loop_index)?;
        let key = Key {
            file_id,
            loop_index,
            sequence_number,
        };
        self.table.register(key, &destinations);

        let mut send = self.send.lock().unwrap();
        for destination in &destinations {
            codec::encode_echo_request(&mut send.buffer, loop_index, sequence_number, file_id, data);
            if let Err(e) = send.transport.send_to(&send.buffer, *destination) {
                error!("send to {} failed: {}", destination, e);
            }
            send.buffer.clear();
        }
        Ok(())
    }

    /// Writes `data` at `position`, splitting it across 1024-byte sequence
    /// boundaries as needed. Returns the number of bytes written (always
    /// `data.len()`) and the file's new size.
    pub fn write_to_loop(&self, file_id: u32, position: u64, data: &[u8], current_size: u64) -> (usize, u64) {
        let mut current_size = current_size;
        let mut offset = 0usize;
        while offset < data.len() {
            let pos = position + offset as u64;
            let prepared = slot::split_sequence(pos, data.len() - offset);
            let chunk = &data[offset..offset + prepared.length as usize];

            let circulating_sequences = div_ceil(current_size, DATA_LENGTH as u64);
            if prepared.sequence_number as u64 >= circulating_sequences {
                match self.pools.sample() {
                    Ok(loop_index) => {
                        if let Err(e) = self.send_to_loop_nodes(loop_index, file_id, prepared.sequence_number, chunk) {
                            error!("write_to_loop: could not send new sequence: {}", e);
                        }
                    }
                    Err(e) => error!("write_to_loop: no loop index available: {}", e),
                }
            } else {
                self.write_slot.wait_write(file_id, prepared, chunk.to_vec());
            }

            offset += prepared.length as usize;
            current_size = current_size.max(position + offset as u64);
        }
        (offset, current_size)
    }

    /// Reads `length` bytes starting at `position`. A pure observer: it
    /// never sends anything, it only waits for the next echo of each
    /// sequence it needs.
    pub fn read_from_loop(&self, file_id: u32, position: u64, length: usize) -> Vec<u8> {
        let mut result = Vec::with_capacity(length);
        let mut offset = 0usize;
        while offset < length {
            let pos = position + offset as u64;
            let prepared = slot::split_sequence(pos, length - offset);
            let bytes = self.read_slot.wait_read(file_id, prepared);
            result.extend_from_slice(&bytes);
            offset += prepared.length as usize;
        }
        result
    }

    /// Runs the blocking receive loop on the calling thread until
    /// [`Engine::stop`] clears `running`. `next_reply` blocks for the next
    /// decoded Echo Reply and its source address, or returns `None` on a
    /// bounded-wait timeout, so this loop can periodically recheck
    /// `running` without needing to unblock a real socket read: `stop()`
    /// does not actively interrupt the socket, so the loop simply polls
    /// with a short timeout instead of blocking forever.
    pub fn run_receive_loop<F>(&self, mut next_reply: F)
    where
        F: FnMut() -> Option<(DecodedReply, IpAddr)>,
    {
        self.running.store(true, Ordering::SeqCst);
        while self.running.load(Ordering::SeqCst) {
            match next_reply() {
                Some((reply, IpAddr::V4(source))) => self.handle_reply(reply, source),
                Some((_, IpAddr::V6(_))) => {
                    debug!("dropping reply from an IPv6 source: unsupported per spec non-goals");
                }
                None => continue,
            }
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn handle_reply(&self, reply: DecodedReply, source: std::net::Ipv4Addr) {
        let mut payload = reply.payload;

        self.write_slot
            .try_fulfill_into_network(reply.file_id, reply.sequence_number, &mut payload);
        let _ = self
            .read_slot
            .try_fulfill_from_network(reply.file_id, reply.sequence_number, &payload);

        let key = Key {
            file_id: reply.file_id,
            loop_index: reply.loop_index,
            sequence_number: reply.sequence_number,
        };
        let outcome = self.table.match_and_consume(key, source);
        if !outcome.found {
            debug!(
                "dropping unmatched reply: file_id={} seq={} loop_index={} source={}",
                reply.file_id, reply.sequence_number, reply.loop_index, source
            );
            return;
        }

        if outcome.was_first_reply {
            let loop_index = match self.pools.sample() {
                Ok(idx) => idx,
                Err(e) => {
                    error!("could not sample a loop index for resend: {}", e);
                    return;
                }
            };
            if let Err(e) = self.send_to_loop_nodes(loop_index, reply.file_id, reply.sequence_number, &payload) {
                error!("resend failed: {}", e);
            }
        }
    }
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}
