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

//! In-memory filesystem tree.
//!
//! A real directory/file hierarchy, rooted at `/`, so the mount adaptor in
//! `fuse_adaptor.rs` has somewhere to create and look up arbitrary paths
//! via the usual getattr/readdir/read/write operations.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

/// Regular-file mode bits.
pub const FILE_MODE: u32 = 0o777;
/// Directory mode bits.
pub const DIR_MODE: u32 = 0o755;
/// Fixed owner uid/gid for every node; there is no real user/group model.
pub const OWNER_ID: u32 = 33;

/// What [`FsTree::lookup`] and friends report back about one node, detached
/// from the tree's internal lock so callers (the mount adaptor) can use it
/// without holding anything.
#[derive(Debug, Clone)]
pub struct Attr {
    pub is_dir: bool,
    pub file_id: u32,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub accessed: SystemTime,
    pub modified: SystemTime,
}

enum NodeKind {
    Dir(BTreeMap<String, Node>),
    File { file_id: u32, size: u64 },
}

struct Node {
    kind: NodeKind,
    accessed: SystemTime,
    modified: SystemTime,
}

impl Node {
    fn new_dir() -> Self {
        let now = SystemTime::now();
        Self {
            kind: NodeKind::Dir(BTreeMap::new()),
            accessed: now,
            modified: now,
        }
    }

    fn new_file(file_id: u32) -> Self {
        let now = SystemTime::now();
        Self {
            kind: NodeKind::File { file_id, size: 0 },
            accessed: now,
            modified: now,
        }
    }

    fn attr(&self) -> Attr {
        match &self.kind {
            NodeKind::Dir(_) => Attr {
                is_dir: true,
                file_id: 0,
                size: 0,
                mode: DIR_MODE,
                nlink: 2,
                accessed: self.accessed,
                modified: self.modified,
            },
            NodeKind::File { file_id, size } => Attr {
                is_dir: false,
                file_id: *file_id,
                size: *size,
                mode: FILE_MODE,
                nlink: 1,
                accessed: self.accessed,
                modified: self.modified,
            },
        }
    }
}

/// Error cases the mount adaptor needs to turn into errno values. A missing
/// path becomes ENOENT; everything else the adaptor otherwise treats as a
/// no-op success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    NotADirectory,
    AlreadyExists,
}

/// Splits a `/`-separated path into its non-empty components.
fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

struct Tree {
    root: Node,
}

impl Tree {
    fn lookup(&self, components: &[&str]) -> Result<&Node, FsError> {
        let mut node = &self.root;
        for name in components {
            match &node.kind {
                NodeKind::Dir(children) => {
                    node = children.get(*name).ok_or(FsError::NotFound)?;
                }
                NodeKind::File { .. } => return Err(FsError::NotFound),
            }
        }
        Ok(node)
    }

    fn lookup_mut(&mut self, components: &[&str]) -> Result<&mut Node, FsError> {
        let mut node = &mut self.root;
        for name in components {
            match &mut node.kind {
                NodeKind::Dir(children) => {
                    node = children.get_mut(*name).ok_or(FsError::NotFound)?;
                }
                NodeKind::File { .. } => return Err(FsError::NotFound),
            }
        }
        Ok(node)
    }

    fn parent_and_name<'a>(&mut self, components: &'a [&'a str]) -> Result<(&mut Node, &'a str), FsError> {
        let (name, parent_components) = components.split_last().ok_or(FsError::AlreadyExists)?;
        let parent = self.lookup_mut(parent_components)?;
        Ok((parent, name))
    }
}

/// The directory/file hierarchy backing the mount, one per running daemon.
/// The root is always a directory, created fresh at startup and discarded
/// at shutdown.
pub struct FsTree {
    tree: Mutex<Tree>,
    next_file_id: AtomicU64,
}

impl FsTree {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(Tree { root: Node::new_dir() }),
            // file_ids are positive; 0 is reserved for "not a file".
            next_file_id: AtomicU64::new(1),
        }
    }

    /// get-attributes.
    pub fn getattr(&self, path: &str) -> Result<Attr, FsError> {
        let components = split_path(path);
        let tree = self.tree.lock().unwrap();
        tree.lookup(&components).map(Node::attr)
    }

    /// list-directory: child names in a stable order, "." and ".." prepended
    /// by the caller per FUSE convention.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let components = split_path(path);
        let tree = self.tree.lock().unwrap();
        match &tree.lookup(&components)?.kind {
            NodeKind::Dir(children) => Ok(children.keys().cloned().collect()),
            NodeKind::File { .. } => Err(FsError::NotADirectory),
        }
    }

    /// open: just confirms the path resolves to a file.
    pub fn open(&self, path: &str) -> Result<u32, FsError> {
        let components = split_path(path);
        let tree = self.tree.lock().unwrap();
        match &tree.lookup(&components)?.kind {
            NodeKind::File { file_id, .. } => Ok(*file_id),
            NodeKind::Dir(_) => Err(FsError::NotADirectory),
        }
    }

    /// create-file (mknod): assigns the next `file_id`, inserts as a regular
    /// file under the parent.
    pub fn mknod(&self, path: &str) -> Result<u32, FsError> {
        let components = split_path(path);
        let mut tree = self.tree.lock().unwrap();
        let (parent, name) = tree.parent_and_name(&components)?;
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst) as u32;
        match &mut parent.kind {
            NodeKind::Dir(children) => {
                if children.contains_key(name) {
                    return Err(FsError::AlreadyExists);
                }
                children.insert(name.to_string(), Node::new_file(file_id));
                Ok(file_id)
            }
            NodeKind::File { .. } => Err(FsError::NotADirectory),
        }
    }

    /// make-directory.
    pub fn mkdir(&self, path: &str) -> Result<(), FsError> {
        let components = split_path(path);
        let mut tree = self.tree.lock().unwrap();
        let (parent, name) = tree.parent_and_name(&components)?;
        match &mut parent.kind {
            NodeKind::Dir(children) => {
                if children.contains_key(name) {
                    return Err(FsError::AlreadyExists);
                }
                children.insert(name.to_string(), Node::new_dir());
                Ok(())
            }
            NodeKind::File { .. } => Err(FsError::NotADirectory),
        }
    }

    /// Records the file's `file_id` and current `size`, for the mount
    /// adaptor to hand to [`crate::engine::Engine::read_from_loop`] /
    /// `write_to_loop` outside this lock.
    pub fn file_id_and_size(&self, path: &str) -> Result<(u32, u64), FsError> {
        let components = split_path(path);
        let tree = self.tree.lock().unwrap();
        match &tree.lookup(&components)?.kind {
            NodeKind::File { file_id, size } => Ok((*file_id, *size)),
            NodeKind::Dir(_) => Err(FsError::NotADirectory),
        }
    }

    /// Updates `size = max(size, offset+length)` after a write has gone
    /// through the engine.
    pub fn grow_to(&self, path: &str, offset: u64, length: u64) -> Result<(), FsError> {
        let components = split_path(path);
        let mut tree = self.tree.lock().unwrap();
        let node = tree.lookup_mut(&components)?;
        node.modified = SystemTime::now();
        match &mut node.kind {
            NodeKind::File { size, .. } => {
                *size = (*size).max(offset + length);
                Ok(())
            }
            NodeKind::Dir(_) => Err(FsError::NotADirectory),
        }
    }

    /// set-utimes: records timestamps.
    pub fn set_utimes(&self, path: &str, accessed: SystemTime, modified: SystemTime) -> Result<(), FsError> {
        let components = split_path(path);
        let mut tree = self.tree.lock().unwrap();
        let node = tree.lookup_mut(&components)?;
        node.accessed = accessed;
        node.modified = modified;
        Ok(())
    }
}

impl Default for FsTree {
    fn default() -> Self {
        Self::new()
    }
}
