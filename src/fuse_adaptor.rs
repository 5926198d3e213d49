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

//! The mount adaptor: translates `fuser`'s inode-keyed kernel callbacks into
//! calls against [`FsTree`] and [`Engine`].
//!
//! libfuse's classic API is path-based (every callback receives a
//! `const char* path`), but `fuser::Filesystem` is inode-based, so this
//! keeps one extra piece of state: a `path <-> inode` table. Inode 1 is
//! always the mount root.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen,
    ReplyWrite, Request,
};
use libc::ENOENT;

use crate::engine::Engine;
use crate::fstree::{Attr, FsError, FsTree};

const ROOT_INODE: u64 = 1;
const TTL: Duration = Duration::from_secs(1);

struct InodeTable {
    path_by_ino: HashMap<u64, String>,
    ino_by_path: HashMap<String, u64>,
    next_ino: AtomicU64,
}

impl InodeTable {
    fn new() -> Self {
        let mut path_by_ino = HashMap::new();
        let mut ino_by_path = HashMap::new();
        path_by_ino.insert(ROOT_INODE, "/".to_string());
        ino_by_path.insert("/".to_string(), ROOT_INODE);
        Self {
            path_by_ino,
            ino_by_path,
            next_ino: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.path_by_ino.get(&ino).cloned()
    }

    /// Returns the inode for `path`, assigning a fresh one if this is the
    /// first time it's been named.
    fn ino_of(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.ino_by_path.get(path) {
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        self.ino_by_path.insert(path.to_string(), ino);
        self.path_by_ino.insert(ino, path.to_string());
        ino
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Implements `fuser::Filesystem` over a [`FsTree`] and an [`Engine`].
pub struct PingloopFs {
    tree: Arc<FsTree>,
    engine: Arc<Engine>,
    inodes: Mutex<InodeTable>,
}

impl PingloopFs {
    pub fn new(tree: Arc<FsTree>, engine: Arc<Engine>) -> Self {
        Self {
            tree,
            engine,
            inodes: Mutex::new(InodeTable::new()),
        }
    }

    fn file_attr(&self, ino: u64, attr: &Attr) -> FileAttr {
        FileAttr {
            ino,
            size: attr.size,
            blocks: (attr.size + 511) / 512,
            atime: attr.accessed,
            mtime: attr.modified,
            ctime: attr.modified,
            crtime: attr.modified,
            kind: if attr.is_dir { FileType::Directory } else { FileType::RegularFile },
            perm: attr.mode as u16,
            nlink: attr.nlink,
            uid: crate::fstree::OWNER_ID,
            gid: crate::fstree::OWNER_ID,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for PingloopFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(ENOENT),
        };
        let mut inodes = self.inodes.lock().unwrap();
        let parent_path = match inodes.path_of(parent) {
            Some(p) => p,
            None => return reply.error(ENOENT),
        };
        let path = join(&parent_path, name);
        match self.tree.getattr(&path) {
            Ok(attr) => {
                let ino = inodes.ino_of(&path);
                reply.entry(&TTL, &self.file_attr(ino, &attr), 0);
            }
            Err(FsError::NotFound) => reply.error(ENOENT),
            Err(_) => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let path = match self.inodes.lock().unwrap().path_of(ino) {
            Some(p) => p,
            None => return reply.error(ENOENT),
        };
        match self.tree.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &self.file_attr(ino, &attr)),
            Err(_) => reply.error(ENOENT),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let mut inodes = self.inodes.lock().unwrap();
        let path = match inodes.path_of(ino) {
            Some(p) => p,
            None => return reply.error(ENOENT),
        };
        let names = match self.tree.readdir(&path) {
            Ok(names) => names,
            Err(_) => return reply.error(ENOENT),
        };

        let mut entries = vec![(ino, FileType::Directory, ".".to_string())];
        entries.push((ROOT_INODE, FileType::Directory, "..".to_string()));
        for name in names {
            let child_path = join(&path, &name);
            let is_dir = matches!(self.tree.getattr(&child_path), Ok(a) if a.is_dir);
            let child_ino = inodes.ino_of(&child_path);
            let kind = if is_dir { FileType::Directory } else { FileType::RegularFile };
            entries.push((child_ino, kind, name));
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(entry_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn opendir(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.inodes.lock().unwrap().path_of(ino) {
            Some(p) => p,
            None => return reply.error(ENOENT),
        };
        let (file_id, file_size) = match self.tree.file_id_and_size(&path) {
            Ok(v) => v,
            Err(_) => return reply.error(ENOENT),
        };
        let offset = offset as u64;
        if offset >= file_size {
            return reply.data(&[]);
        }
        let length = (size as u64).min(file_size - offset) as usize;
        let bytes = self.engine.read_from_loop(file_id, offset, length);
        reply.data(&bytes);
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let path = match self.inodes.lock().unwrap().path_of(ino) {
            Some(p) => p,
            None => return reply.error(ENOENT),
        };
        let (file_id, current_size) = match self.tree.file_id_and_size(&path) {
            Ok(v) => v,
            Err(_) => return reply.error(ENOENT),
        };
        let offset = offset as u64;
        let (written, _new_size) = self.engine.write_to_loop(file_id, offset, data, current_size);
        let _ = self.tree.grow_to(&path, offset, written as u64);
        reply.written(written as u32);
    }

    fn mknod(&mut self, _req: &Request, parent: u64, name: &OsStr, _mode: u32, _umask: u32, _rdev: u32, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(ENOENT),
        };
        let mut inodes = self.inodes.lock().unwrap();
        let parent_path = match inodes.path_of(parent) {
            Some(p) => p,
            None => return reply.error(ENOENT),
        };
        let path = join(&parent_path, name);
        match self.tree.mknod(&path) {
            Ok(_file_id) => {
                let ino = inodes.ino_of(&path);
                let attr = self.tree.getattr(&path).expect("just created");
                reply.entry(&TTL, &self.file_attr(ino, &attr), 0);
            }
            Err(_) => reply.error(libc::EEXIST),
        }
    }

    fn mkdir(&mut self, _req: &Request, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(n) => n,
            None => return reply.error(ENOENT),
        };
        let mut inodes = self.inodes.lock().unwrap();
        let parent_path = match inodes.path_of(parent) {
            Some(p) => p,
            None => return reply.error(ENOENT),
        };
        let path = join(&parent_path, name);
        match self.tree.mkdir(&path) {
            Ok(()) => {
                let ino = inodes.ino_of(&path);
                let attr = self.tree.getattr(&path).expect("just created");
                reply.entry(&TTL, &self.file_attr(ino, &attr), 0);
            }
            Err(_) => reply.error(libc::EEXIST),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // chmod/chown/truncate report success without mutating anything;
        // utimens is the one setattr field actually honored.
        let path = match self.inodes.lock().unwrap().path_of(ino) {
            Some(p) => p,
            None => return reply.error(ENOENT),
        };
        let now = SystemTime::now();
        let resolve = |t: Option<fuser::TimeOrNow>| match t {
            Some(fuser::TimeOrNow::SpecificTime(t)) => t,
            _ => now,
        };
        let _ = self.tree.set_utimes(&path, resolve(atime), resolve(mtime));
        match self.tree.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &self.file_attr(ino, &attr)),
            Err(_) => reply.error(ENOENT),
        }
    }

    // The remaining mutating operations report success without touching
    // the tree.

    fn unlink(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.ok();
    }

    /// Links are a non-goal: no link is actually recorded, but an
    /// uncooperative client calling `ln -s` must see success, not a hard
    /// failure, so this synthesizes an entry reply for a name the tree never
    /// actually holds.
    fn symlink(&mut self, _req: &Request, parent: u64, link_name: &OsStr, _target: &std::path::Path, reply: ReplyEntry) {
        let name = match link_name.to_str() {
            Some(n) => n,
            None => return reply.error(ENOENT),
        };
        let mut inodes = self.inodes.lock().unwrap();
        let parent_path = match inodes.path_of(parent) {
            Some(p) => p,
            None => return reply.error(ENOENT),
        };
        let path = join(&parent_path, name);
        let ino = inodes.ino_of(&path);
        reply.entry(&TTL, &self.file_attr(ino, &stub_attr()), 0);
    }

    fn rename(
        &mut self,
        _req: &Request,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn link(&mut self, _req: &Request, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let name = match newname.to_str() {
            Some(n) => n,
            None => return reply.error(ENOENT),
        };
        let mut inodes = self.inodes.lock().unwrap();
        let parent_path = match inodes.path_of(newparent) {
            Some(p) => p,
            None => return reply.error(ENOENT),
        };
        let path = join(&parent_path, name);
        inodes.ino_of(&path);
        reply.entry(&TTL, &self.file_attr(ino, &stub_attr()), 0);
    }
}

/// A placeholder attribute for entries synthesized by the non-mutating
/// `symlink`/`link` stubs: zero size, regular file, world-readable.
fn stub_attr() -> Attr {
    let now = SystemTime::now();
    Attr {
        is_dir: false,
        file_id: 0,
        size: 0,
        mode: 0o644,
        nlink: 1,
        accessed: now,
        modified: now,
    }
}
