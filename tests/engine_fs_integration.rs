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

//! End-to-end scenarios driven against [`FsTree`] + [`Engine`] the way the
//! mount adaptor would, but with a [`FakeTransport`] standing in for the
//! raw socket and a loopback host (two pools both resolving to 127.0.0.1).

use std::net::IpAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use pingloop::fstree::FsTree;
use pingloop::pool::AddressPool;
use pingloop::transport::fake::FakeTransport;
use pingloop::Engine;

fn two_loopback_pools() -> AddressPool {
    let pools = AddressPool::new();
    pools.add_list("127.0.0.1").unwrap();
    pools.add_list("127.0.0.1").unwrap();
    pools
}

/// Bounces every packet a test writes straight back as its own reply,
/// mirroring a compliant loopback host, until the test calls `engine.stop()`.
fn spawn_loopback(engine: Arc<Engine>, fake: FakeTransport) -> JoinHandle<()> {
    std::thread::spawn(move || {
        engine.run_receive_loop(|| {
            let mut sent = fake.sent.lock().unwrap();
            if sent.is_empty() {
                drop(sent);
                std::thread::sleep(std::time::Duration::from_millis(2));
                None
            } else {
                let packet = sent.remove(0);
                Some((packet.decoded, IpAddr::V4(packet.destination)))
            }
        });
    })
}

/// Scenario 1: mount, mkdir, mknod, write, getattr, read.
#[test]
fn scenario_1_mkdir_mknod_write_read() {
    let tree = FsTree::new();
    let fake = FakeTransport::new();
    let engine = Engine::new(two_loopback_pools(), Box::new(fake.clone()));
    let handle = spawn_loopback(Arc::clone(&engine), fake);

    tree.mkdir("/d").unwrap();
    let file_id = tree.mknod("/d/f").unwrap();

    let (written, _size) = engine.write_to_loop(file_id, 0, b"hello", 0);
    tree.grow_to("/d/f", 0, written as u64).unwrap();

    let attr = tree.getattr("/d/f").unwrap();
    assert_eq!(attr.size, 5);

    let read = engine.read_from_loop(file_id, 0, 5);
    assert_eq!(read, b"hello");

    engine.stop();
    handle.join().unwrap();
}

/// Scenario 2: a 20-byte write still confined to one sequence.
#[test]
fn scenario_2_larger_write_within_one_sequence() {
    let tree = FsTree::new();
    let fake = FakeTransport::new();
    let engine = Engine::new(two_loopback_pools(), Box::new(fake.clone()));
    let handle = spawn_loopback(Arc::clone(&engine), fake);

    let file_id = tree.mknod("/f").unwrap();
    let payload = b"xxxxxxxxxxyyyyyyyyyy";
    assert_eq!(payload.len(), 20);

    let (written, _size) = engine.write_to_loop(file_id, 0, payload, 0);
    tree.grow_to("/f", 0, written as u64).unwrap();

    let read = engine.read_from_loop(file_id, 0, 20);
    assert_eq!(&read, payload);

    engine.stop();
    handle.join().unwrap();
}

/// A second, longer write at the same offset of an already-circulating
/// file must grow the in-flight echo instead of losing the extra bytes or
/// deadlocking the following read.
#[test]
fn scenario_2b_second_larger_write_grows_the_circulating_sequence() {
    let tree = FsTree::new();
    let fake = FakeTransport::new();
    let engine = Engine::new(two_loopback_pools(), Box::new(fake.clone()));
    let handle = spawn_loopback(Arc::clone(&engine), fake);

    let file_id = tree.mknod("/f").unwrap();
    let (written, size) = engine.write_to_loop(file_id, 0, b"hello", 0);
    tree.grow_to("/f", 0, written as u64).unwrap();
    assert_eq!(size, 5);

    let longer = b"hello world, this is longer";
    let (written, size) = engine.write_to_loop(file_id, 0, longer, size);
    tree.grow_to("/f", 0, written as u64).unwrap();
    assert_eq!(written, longer.len());
    assert_eq!(size, longer.len() as u64);

    let read = engine.read_from_loop(file_id, 0, longer.len());
    assert_eq!(&read, longer);

    engine.stop();
    handle.join().unwrap();
}

/// Scenario 3: a write straddling sequences 0 and 1 issues two sub-writes,
/// and a read over the same range reassembles them.
#[test]
fn scenario_3_write_straddles_two_sequences() {
    let tree = FsTree::new();
    let fake = FakeTransport::new();
    let engine = Engine::new(two_loopback_pools(), Box::new(fake.clone()));
    let handle = spawn_loopback(Arc::clone(&engine), fake);

    let file_id = tree.mknod("/f").unwrap();
    let (written, _size) = engine.write_to_loop(file_id, 1020, b"ABCDEFGH", 0);
    assert_eq!(written, 8);
    tree.grow_to("/f", 1020, written as u64).unwrap();

    let read = engine.read_from_loop(file_id, 1020, 8);
    assert_eq!(read, b"ABCDEFGH");

    engine.stop();
    handle.join().unwrap();
}

/// Scenario 6: readdir at the root and at a subdirectory after a few files
/// and directories have been created.
#[test]
fn scenario_6_readdir_listings() {
    let tree = FsTree::new();
    tree.mkdir("/d").unwrap();
    tree.mknod("/d/f").unwrap();

    let mut root = tree.readdir("/").unwrap();
    root.sort();
    assert_eq!(root, vec!["d".to_string()]);

    let mut sub = tree.readdir("/d").unwrap();
    sub.sort();
    assert_eq!(sub, vec!["f".to_string()]);
}

/// Property F: mkdir/getattr and mknod/getattr report the expected mode and
/// link count.
#[test]
fn property_f_idempotent_directory_ops() {
    let tree = FsTree::new();
    tree.mkdir("/a").unwrap();
    let dir_attr = tree.getattr("/a").unwrap();
    assert!(dir_attr.is_dir);
    assert_eq!(dir_attr.mode, 0o755);

    tree.mknod("/a/b").unwrap();
    let file_attr = tree.getattr("/a/b").unwrap();
    assert!(!file_attr.is_dir);
    assert_eq!(file_attr.nlink, 1);
    assert_eq!(file_attr.mode, 0o777);
}
