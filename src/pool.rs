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

//! Address pool registry.
//!
//! Holds N parallel lists of IPv4 addresses and samples a uniform "loop
//! index" bounded by the smallest list, recomputing the sampling range
//! each time a new list is added.

use std::net::Ipv4Addr;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::PoolError;

pub struct AddressPool {
    lists: Mutex<Vec<Vec<Ipv4Addr>>>,
    rng: Mutex<StdRng>,
}

impl AddressPool {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(Vec::new()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Parses one address per whitespace-separated token and adds it as a
    /// new pool. An empty list or an unparsable token is a hard error with
    /// no fallback.
    pub fn add_list(&self, text: &str) -> Result<(), PoolError> {
        let mut list = Vec::new();
        for token in text.split_whitespace() {
            let addr: Ipv4Addr = token
                .parse()
                .map_err(|_| PoolError::InvalidAddress(token.to_string()))?;
            list.push(addr);
        }
        if list.is_empty() {
            return Err(PoolError::EmptyList);
        }
        let mut lists = self.lists.lock().unwrap();
        lists.push(list);
        Ok(())
    }

    /// Number of pools configured so far.
    pub fn pool_count(&self) -> usize {
        self.lists.lock().unwrap().len()
    }

    /// The sampling bound: `min(|L_i|)` across all configured pools.
    fn sample_bound(&self) -> Result<usize, PoolError> {
        let lists = self.lists.lock().unwrap();
        lists
            .iter()
            .map(|l| l.len())
            .min()
            .ok_or(PoolError::NoPools)
    }

    /// Draws a loop index uniformly from `[0, min(|L_i|))`.
    pub fn sample(&self) -> Result<u16, PoolError> {
        let bound = self.sample_bound()?;
        let mut rng = self.rng.lock().unwrap();
        Ok(rng.gen_range(0..bound as u32) as u16)
    }

    /// Returns the destination address in each pool at `loop_index`, one per
    /// pool, in pool-registration order. These are the redundant
    /// destinations `send_to_loop_nodes` fans a single echo out to.
    pub fn addresses_at(&self, loop_index: u16) -> Result<Vec<Ipv4Addr>, PoolError> {
        let lists = self.lists.lock().unwrap();
        if lists.is_empty() {
            return Err(PoolError::NoPools);
        }
        lists
            .iter()
            .map(|l| {
                l.get(loop_index as usize)
                    .copied()
                    .ok_or(PoolError::IndexOutOfRange {
                        index: loop_index,
                        size: l.len(),
                    })
            })
            .collect()
    }
}

impl Default for AddressPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_list_parses_whitespace_separated_addresses() {
        let pool = AddressPool::new();
        pool.add_list("127.0.0.1 10.0.0.1\n10.0.0.2").unwrap();
        assert_eq!(pool.pool_count(), 1);
        assert_eq!(
            pool.addresses_at(0).unwrap(),
            vec![Ipv4Addr::new(127, 0, 0, 1)]
        );
    }

    #[test]
    fn add_list_rejects_empty_input() {
        let pool = AddressPool::new();
        assert!(matches!(
            pool.add_list("   \n  ").unwrap_err(),
            PoolError::EmptyList
        ));
    }

    #[test]
    fn add_list_rejects_unparsable_token() {
        let pool = AddressPool::new();
        assert!(matches!(
            pool.add_list("not-an-ip").unwrap_err(),
            PoolError::InvalidAddress(_)
        ));
    }

    #[test]
    fn sample_is_bounded_by_smallest_list() {
        let pool = AddressPool::new();
        pool.add_list("127.0.0.1 127.0.0.2 127.0.0.3").unwrap();
        pool.add_list("10.0.0.1 10.0.0.2").unwrap();
        for _ in 0..200 {
            let idx = pool.sample().unwrap();
            assert!(idx < 2, "sampled index {} should be < 2", idx);
        }
    }

    #[test]
    fn addresses_at_returns_one_destination_per_pool() {
        let pool = AddressPool::new();
        pool.add_list("127.0.0.1 127.0.0.2").unwrap();
        pool.add_list("10.0.0.1 10.0.0.2").unwrap();
        let dests = pool.addresses_at(1).unwrap();
        assert_eq!(
            dests,
            vec![Ipv4Addr::new(127, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 2)]
        );
    }

    #[test]
    fn sample_without_any_pool_is_an_error() {
        let pool = AddressPool::new();
        assert!(matches!(pool.sample().unwrap_err(), PoolError::NoPools));
    }
}
