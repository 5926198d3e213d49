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

//! A storage engine that keeps file data alive by perpetually bouncing ICMP
//! Echo Request/Reply packets off remote hosts, exposed as a mountable
//! filesystem. See each module for the piece of the engine it owns.

pub mod codec;
pub mod engine;
pub mod error;
pub mod fstree;
pub mod fuse_adaptor;
pub mod pool;
pub mod slot;
pub mod table;
pub mod timer;
pub mod transport;

pub use engine::Engine;
pub use error::{PingloopError, PoolError};
pub use fstree::FsTree;
pub use pool::AddressPool;
