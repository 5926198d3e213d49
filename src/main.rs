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

use std::sync::Arc;

#[macro_use]
extern crate log;
extern crate env_logger;

use clap::Parser;
use pnet::transport::{icmp_packet_iter, transport_channel};

use pingloop::fstree::FsTree;
use pingloop::fuse_adaptor::PingloopFs;
use pingloop::pool::AddressPool;
use pingloop::transport::{icmp_protocol, PnetTransport};
use pingloop::{Engine, PingloopError, PoolError};

#[derive(Parser, Debug)]
#[clap(
    version = "0.1.0",
    author = "David Martinez Marti <deavidsedice@gmail.com>",
    about = "Stores file data by bouncing ICMP echoes off remote hosts, exposed as a mountable filesystem"
)]
struct Opts {
    /// Directory to mount the filesystem at.
    #[clap(short, long)]
    mountpoint: String,

    /// Path to a text file listing one IPv4 address per whitespace-separated
    /// token. May be repeated 1-5 times; each occurrence becomes one pool.
    #[clap(short, long)]
    pool: Vec<String>,

    /// Stay attached to the terminal instead of daemonizing.
    #[clap(short, long)]
    foreground: bool,
}

/// Reads every `--pool` file and registers it: each one is a text file
/// containing one IPv4 address per whitespace-separated token. An
/// unreadable or empty/invalid pool file is fatal, with no fallback.
fn load_pools(opts: &Opts) -> Result<AddressPool, PingloopError> {
    let pools = AddressPool::new();
    for path in &opts.pool {
        let text = std::fs::read_to_string(path)?;
        pools.add_list(&text)?;
    }
    if pools.pool_count() == 0 {
        return Err(PingloopError::Pool(PoolError::NoPools));
    }
    Ok(pools)
}

fn main() -> Result<(), PingloopError> {
    env_logger::init();
    let opts = Opts::parse();
    if !opts.foreground {
        debug!("running in the foreground regardless: daemonizing is left to the service supervisor");
    }

    info!("starting, {} pool file(s) configured", opts.pool.len());
    let pools = load_pools(&opts)?;

    let (tx, mut rx) = transport_channel(65536, icmp_protocol())?;
    let transport = Box::new(PnetTransport::new(tx));
    let engine = Engine::new(pools, transport);
    let tree = Arc::new(FsTree::new());

    let network_engine = Arc::clone(&engine);
    let network_thread = std::thread::spawn(move || {
        let mut iter = icmp_packet_iter(&mut rx);
        network_engine.run_receive_loop(|| loop {
            match iter.next() {
                Ok((packet, addr)) => match pingloop::codec::decode_echo_reply(packet) {
                    Some(decoded) => return Some((decoded, addr)),
                    None => continue,
                },
                Err(e) => {
                    error!("error reading from raw socket: {}", e);
                    return None;
                }
            }
        });
    });

    info!("mounting at {}", opts.mountpoint);
    let options = vec![
        fuser::MountOption::FSName("pingloop".to_string()),
        fuser::MountOption::AutoUnmount,
    ];
    if let Err(e) = fuser::mount2(PingloopFs::new(tree, Arc::clone(&engine)), &opts.mountpoint, &options) {
        error!("mount exited with an error: {}", e);
    }

    engine.stop();
    let _ = network_thread.join();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn opts_with_pools(paths: Vec<String>) -> Opts {
        Opts {
            mountpoint: "/mnt/unused".to_string(),
            pool: paths,
            foreground: false,
        }
    }

    #[test]
    fn load_pools_reads_and_parses_every_file() {
        let mut a = tempfile::NamedTempFile::new().unwrap();
        writeln!(a, "127.0.0.1 127.0.0.2").unwrap();
        let mut b = tempfile::NamedTempFile::new().unwrap();
        writeln!(b, "10.0.0.1").unwrap();

        let opts = opts_with_pools(vec![
            a.path().to_str().unwrap().to_string(),
            b.path().to_str().unwrap().to_string(),
        ]);
        let pools = load_pools(&opts).unwrap();
        assert_eq!(pools.pool_count(), 2);
    }

    #[test]
    fn load_pools_rejects_an_unreadable_path() {
        let opts = opts_with_pools(vec!["/nonexistent/pool/file".to_string()]);
        assert!(matches!(load_pools(&opts), Err(PingloopError::Io(_))));
    }

    #[test]
    fn load_pools_rejects_an_empty_pool_file() {
        let empty = tempfile::NamedTempFile::new().unwrap();
        let opts = opts_with_pools(vec![empty.path().to_str().unwrap().to_string()]);
        assert!(matches!(
            load_pools(&opts),
            Err(PingloopError::Pool(PoolError::EmptyList))
        ));
    }

    #[test]
    fn load_pools_rejects_zero_pools() {
        let opts = opts_with_pools(vec![]);
        assert!(matches!(
            load_pools(&opts),
            Err(PingloopError::Pool(PoolError::NoPools))
        ));
    }
}
