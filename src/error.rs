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

//! Error types for the ping-loop storage engine.

use thiserror::Error;

/// Errors raised while building or growing an [`crate::pool::AddressPool`].
///
/// Both variants are fatal at startup: there is no fallback for an
/// unparsable or empty pool file.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("pool list is empty")]
    EmptyList,
    #[error("could not parse '{0}' as an IPv4 address")]
    InvalidAddress(String),
    #[error("loop index {index} is out of range for a pool of size {size}")]
    IndexOutOfRange { index: u16, size: usize },
    #[error("no address pools have been configured")]
    NoPools,
}

/// Top-level error type for the daemon entry point: only pool loading and
/// the initial raw-socket bind can fail fatally; everything past that
/// point is absorbed by the receive/expiry paths.
#[derive(Error, Debug)]
pub enum PingloopError {
    #[error("address pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
