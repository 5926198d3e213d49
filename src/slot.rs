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

//! Pending-operation slots.
//!
//! A `Slot` is the rendezvous between the filesystem thread, which wants to
//! observe or inject bytes at a specific `(file_id, sequence_number)`, and
//! the network thread, which owns the one echo currently on the wire for
//! that sequence. The waiter gets handed back an owned `Vec<u8>` rather
//! than writing through a raw buffer pointer, the safe idiomatic shape for
//! a value crossing threads in Rust.

use std::sync::{Condvar, Mutex};

use crate::codec::DATA_LENGTH;

/// The sequence-aligned coordinates of one sub-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prepared {
    pub sequence_number: u16,
    pub byte_index: u16,
    pub length: u16,
}

/// Splits a `(position, candidate_len)` pair into sequence coordinates,
/// clamping `length` to the rest of the current 1024-byte sequence. Pure
/// and stateless: merely computing coordinates does not register a
/// rendezvous (only `wait_write`/`wait_read` do that).
pub fn split_sequence(position: u64, candidate_len: usize) -> Prepared {
    let sequence_number = (position / DATA_LENGTH as u64) as u16;
    let byte_index = (position % DATA_LENGTH as u64) as u16;
    let remaining_in_sequence = DATA_LENGTH - byte_index as usize;
    let length = candidate_len.min(remaining_in_sequence) as u16;
    Prepared {
        sequence_number,
        byte_index,
        length,
    }
}

struct PendingOp {
    file_id: u32,
    sequence_number: u16,
    byte_index: u16,
    length: u16,
    /// For a write slot: the user bytes to inject into the outgoing echo.
    /// For a read slot: unused (the answer instead lands in `SlotState::Ready`).
    data: Vec<u8>,
}

enum SlotState {
    Idle,
    Waiting(PendingOp),
    Ready(Vec<u8>),
}

/// One rendezvous point. The engine owns exactly two: one for reads, one
/// for writes.
pub struct Slot {
    state: Mutex<SlotState>,
    condvar: Condvar,
}

impl Slot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Idle),
            condvar: Condvar::new(),
        }
    }

    /// Registers a pending write and blocks until the network thread
    /// fulfills it. `data` is the exact `prepared.length` bytes to splice
    /// into the next echo of this sequence.
    pub fn wait_write(&self, file_id: u32, prepared: Prepared, data: Vec<u8>) {
        debug_assert_eq!(data.len(), prepared.length as usize);
        let mut state = self.state.lock().unwrap();
        *state = SlotState::Waiting(PendingOp {
            file_id,
            sequence_number: prepared.sequence_number,
            byte_index: prepared.byte_index,
            length: prepared.length,
            data,
        });
        state = self
            .condvar
            .wait_while(state, |s| matches!(s, SlotState::Waiting(_)))
            .unwrap();
        *state = SlotState::Idle;
    }

    /// Registers a pending read and blocks until the network thread copies
    /// the matching sequence's bytes out, returning exactly those bytes.
    pub fn wait_read(&self, file_id: u32, prepared: Prepared) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        *state = SlotState::Waiting(PendingOp {
            file_id,
            sequence_number: prepared.sequence_number,
            byte_index: prepared.byte_index,
            length: prepared.length,
            data: Vec::new(),
        });
        state = self
            .condvar
            .wait_while(state, |s| matches!(s, SlotState::Waiting(_)))
            .unwrap();
        match std::mem::replace(&mut *state, SlotState::Idle) {
            SlotState::Ready(bytes) => bytes,
            _ => Vec::new(),
        }
    }

    /// Network-thread side for a read slot: if the waiter's
    /// `(file_id, sequence_number)` matches, copies `length` bytes out of
    /// `received` starting at `byte_index` and wakes the waiter. Returns
    /// `byte_index + length` on a match.
    pub fn try_fulfill_from_network(&self, file_id: u32, sequence_number: u16, received: &[u8]) -> Option<u16> {
        let mut state = self.state.lock().unwrap();
        let op = match &*state {
            SlotState::Waiting(op) if op.file_id == file_id && op.sequence_number == sequence_number => {
                (op.byte_index, op.length)
            }
            _ => return None,
        };
        let (byte_index, length) = op;
        let start = byte_index as usize;
        let end = start + length as usize;
        let bytes = received.get(start..end)?.to_vec();
        *state = SlotState::Ready(bytes);
        drop(state);
        self.condvar.notify_one();
        Some(byte_index + length)
    }

    /// Network-thread side for a write slot: if the waiter's
    /// `(file_id, sequence_number)` matches, copies the waiter's bytes into
    /// `payload` at `byte_index` (so the retransmit carries the new data)
    /// and wakes the waiter. Returns `byte_index + length` on a match.
    ///
    /// `payload` is grown to fit before the copy: a write can land past the
    /// end of whatever the current echo happens to be carrying (the file is
    /// growing while this sequence is still in flight), and the only way to
    /// widen the retransmit is to widen the buffer here, before the caller
    /// reads its length back out.
    pub fn try_fulfill_into_network(&self, file_id: u32, sequence_number: u16, payload: &mut Vec<u8>) -> Option<u16> {
        let mut state = self.state.lock().unwrap();
        let (byte_index, length, data) = match &*state {
            SlotState::Waiting(op) if op.file_id == file_id && op.sequence_number == sequence_number => {
                (op.byte_index, op.length, op.data.clone())
            }
            _ => return None,
        };
        let start = byte_index as usize;
        let end = start + length as usize;
        if end > payload.len() {
            payload.resize(end, 0);
        }
        payload[start..end].copy_from_slice(&data);
        *state = SlotState::Ready(Vec::new());
        drop(state);
        self.condvar.notify_one();
        Some(byte_index + length)
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::new()
    }
}
