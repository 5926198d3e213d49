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

//! Outstanding-reply table.
//!
//! Indexes every in-flight echo by `(file_id, loop_index, sequence_number)`,
//! keyed in a `HashMap` instead of scanned linearly, and backed by a real
//! per-destination timeout on each entry so a lost packet eventually
//! expires instead of leaking forever.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, warn};

use crate::timer::{TimerHandle, TimerService};

const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Identity of one outstanding echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub file_id: u32,
    pub loop_index: u16,
    pub sequence_number: u16,
}

struct Entry {
    needs_resend: bool,
    destinations: HashMap<Ipv4Addr, TimerHandle>,
}

/// Result of [`OutstandingTable::match_and_consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOutcome {
    pub found: bool,
    pub was_first_reply: bool,
    pub table_now_empty: bool,
}

impl MatchOutcome {
    fn not_found() -> Self {
        Self {
            found: false,
            was_first_reply: false,
            table_now_empty: false,
        }
    }
}

pub struct OutstandingTable {
    entries: Mutex<HashMap<Key, Entry>>,
    timers: Arc<TimerService>,
}

impl OutstandingTable {
    pub fn new(timers: Arc<TimerService>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            timers,
        })
    }

    /// Allocates a new entry for `key` and arms a 1-second timer for every
    /// destination. Done under one lock acquisition so the entry and its
    /// timers are published atomically.
    pub fn register(self: &Arc<Self>, key: Key, destinations: &[Ipv4Addr]) {
        let mut entries = self.entries.lock().unwrap();
        let mut entry = Entry {
            needs_resend: true,
            destinations: HashMap::with_capacity(destinations.len()),
        };
        for &destination in destinations {
            let table = Arc::clone(self);
            let handle = self
                .timers
                .schedule(REPLY_TIMEOUT, move || table.expire(key, destination));
            entry.destinations.insert(destination, handle);
        }
        // A resend can land on the same (file_id, loop_index, seq) triple
        // an older, not-yet-fully-consumed entry still occupies (small
        // pools make the loop index space small). Cancel whatever timers
        // that stale entry still holds before it's replaced, so they don't
        // fire against the new entry's unrelated destinations later.
        if let Some(stale) = entries.insert(key, entry) {
            for (_, handle) in stale.destinations {
                handle.cancel();
            }
        }
    }

    /// Accounts for a reply matching `key` arriving from `source`.
    pub fn match_and_consume(&self, key: Key, source: Ipv4Addr) -> MatchOutcome {
        let mut entries = self.entries.lock().unwrap();
        let entry = match entries.get_mut(&key) {
            Some(entry) => entry,
            None => return MatchOutcome::not_found(),
        };

        let matching = entry.destinations.keys().filter(|&&d| d == source).count();
        if matching != 1 {
            warn!(
                "anomalous table state: {} destinations matched {} for {:?} (expected 1)",
                matching, source, key
            );
        }

        if let Some(handle) = entry.destinations.remove(&source) {
            handle.cancel();
        }
        let was_first_reply = entry.needs_resend;
        entry.needs_resend = false;

        let table_now_empty = entry.destinations.is_empty();
        if table_now_empty {
            entries.remove(&key);
        }

        MatchOutcome {
            found: true,
            was_first_reply,
            table_now_empty,
        }
    }

    /// Called by the timer thread (or synchronously, if the cancellation
    /// race lost) when one destination's 1-second deadline elapses without
    /// a reply.
    fn expire(&self, key: Key, destination: Ipv4Addr) {
        let mut entries = self.entries.lock().unwrap();
        let dead_loop = {
            let entry = match entries.get_mut(&key) {
                Some(entry) => entry,
                None => return,
            };
            entry.destinations.remove(&destination);
            if entry.destinations.is_empty() {
                Some(entry.needs_resend)
            } else {
                None
            }
        };
        if let Some(never_resent) = dead_loop {
            entries.remove(&key);
            if never_resent {
                error!(
                    "dead loop: file_id={} seq={} loop_index={}, every destination timed out \
                     before any reply arrived, data for this sequence is lost",
                    key.file_id, key.sequence_number, key.loop_index
                );
            }
        }
    }

    #[cfg(test)]
    pub fn contains(&self, key: Key) -> bool {
        self.entries.lock().unwrap().contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn key(seq: u16) -> Key {
        Key {
            file_id: 1,
            loop_index: 0,
            sequence_number: seq,
        }
    }

    #[test]
    fn register_then_match_reports_first_reply_and_empties_table() {
        let timers = TimerService::new();
        let table = OutstandingTable::new(timers);
        let dest = Ipv4Addr::new(127, 0, 0, 1);
        table.register(key(1), &[dest]);

        let outcome = table.match_and_consume(key(1), dest);
        assert!(outcome.found);
        assert!(outcome.was_first_reply);
        assert!(outcome.table_now_empty);
        assert!(!table.contains(key(1)));
    }

    #[test]
    fn only_first_of_several_destinations_reports_was_first_reply() {
        let timers = TimerService::new();
        let table = OutstandingTable::new(timers);
        let a = Ipv4Addr::new(127, 0, 0, 1);
        let b = Ipv4Addr::new(127, 0, 0, 2);
        let c = Ipv4Addr::new(127, 0, 0, 3);
        table.register(key(1), &[a, b, c]);

        let first = table.match_and_consume(key(1), a);
        assert!(first.was_first_reply);
        assert!(!first.table_now_empty);

        let second = table.match_and_consume(key(1), b);
        assert!(!second.was_first_reply);
        assert!(!second.table_now_empty);

        let third = table.match_and_consume(key(1), c);
        assert!(!third.was_first_reply);
        assert!(third.table_now_empty);
    }

    #[test]
    fn match_against_unknown_key_reports_not_found() {
        let timers = TimerService::new();
        let table = OutstandingTable::new(timers);
        let outcome = table.match_and_consume(key(99), Ipv4Addr::new(127, 0, 0, 1));
        assert!(!outcome.found);
    }

    #[test]
    fn timeout_removes_destination_but_survives_while_others_remain() {
        let timers = TimerService::new();
        let table = OutstandingTable::new(timers);
        let reachable = Ipv4Addr::new(127, 0, 0, 1);
        let unreachable = Ipv4Addr::new(10, 0, 0, 1);
        table.register(key(1), &[reachable, unreachable]);

        // Let the unreachable destination's 1s timer fire.
        std::thread::sleep(Duration::from_millis(1200));
        assert!(table.contains(key(1)));

        let outcome = table.match_and_consume(key(1), reachable);
        assert!(outcome.was_first_reply);
        assert!(outcome.table_now_empty);
    }

    #[test]
    fn dead_loop_erases_entry_when_every_destination_times_out_unreplied() {
        let timers = TimerService::new();
        let table = OutstandingTable::new(timers);
        let unreachable = Ipv4Addr::new(10, 0, 0, 1);
        table.register(key(1), &[unreachable]);

        std::thread::sleep(Duration::from_millis(1200));
        assert!(!table.contains(key(1)));
    }
}
