use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use nfs4d_common::FileHandle;
use parking_lot::RwLock;

use super::{
    FileType, SetAttrs, Stat, VfsError, VfsResult, VirtualFileSystem, ACCESS_DELETE,
    ACCESS_EXECUTE, ACCESS_EXTEND, ACCESS_LOOKUP, ACCESS_MODIFY, ACCESS_READ,
};
use crate::rpc::RpcCredential;

const ROOT_ID: u64 = 1;
const GENERATION: u64 = 1;
const MAX_NAME_LEN: usize = 255;

/// An in-memory filesystem.
///
/// Every object lives in a single inode table keyed by file id. Handles carry
/// the file id, so resolving a handle is one map lookup. Nothing is persisted,
/// which makes it suitable for tests and for embedding the server without a
/// real backend.
#[derive(Debug)]
pub struct MemoryFs {
    export_id: u32,
    nodes: RwLock<HashMap<u64, Node>>,
    next_id: AtomicU64,
}

#[derive(Debug)]
struct Node {
    stat: Stat,
    data: Vec<u8>,
    children: BTreeMap<String, u64>,
}

impl Node {
    fn new(file_id: u64, file_type: FileType, uid: u32, gid: u32, mode: u32) -> Self {
        let now = SystemTime::now();
        Self {
            stat: Stat {
                file_id,
                file_type,
                mode,
                nlink: if file_type == FileType::Directory { 2 } else { 1 },
                uid,
                gid,
                size: 0,
                atime: now,
                mtime: now,
                ctime: now,
                change: 1,
            },
            data: Vec::new(),
            children: BTreeMap::new(),
        }
    }

    fn touch(&mut self) {
        let now = SystemTime::now();
        self.stat.mtime = now;
        self.stat.ctime = now;
        self.stat.change += 1;
    }

    fn dir_mut(&mut self) -> VfsResult<&mut BTreeMap<String, u64>> {
        match self.stat.file_type {
            FileType::Directory => Ok(&mut self.children),
            _ => Err(VfsError::NotDir),
        }
    }
}

impl MemoryFs {
    /// Create a filesystem holding only a root directory owned by root
    pub fn new() -> Self {
        Self::with_export_id(0)
    }

    /// Create a filesystem whose handles carry `export_id`
    pub fn with_export_id(export_id: u32) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(ROOT_ID, Node::new(ROOT_ID, FileType::Directory, 0, 0, 0o777));
        Self {
            export_id,
            nodes: RwLock::new(nodes),
            next_id: AtomicU64::new(ROOT_ID + 1),
        }
    }

    fn handle(&self, file_id: u64) -> FileHandle {
        FileHandle::new(file_id, GENERATION, self.export_id)
    }

    fn resolve(&self, fh: &FileHandle) -> VfsResult<u64> {
        if fh.export_id() != self.export_id || fh.generation() != GENERATION {
            return Err(VfsError::Stale);
        }
        Ok(fh.file_id())
    }

    fn check_name(name: &str) -> VfsResult<()> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(VfsError::Invalid(format!("bad name {:?}", name)));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(VfsError::Invalid("name too long".into()));
        }
        Ok(())
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualFileSystem for MemoryFs {
    fn root(&self) -> FileHandle {
        self.handle(ROOT_ID)
    }

    fn getattr(&self, fh: &FileHandle) -> VfsResult<Stat> {
        let id = self.resolve(fh)?;
        let nodes = self.nodes.read();
        nodes.get(&id).map(|n| n.stat.clone()).ok_or(VfsError::Stale)
    }

    fn setattr(&self, fh: &FileHandle, attrs: &SetAttrs) -> VfsResult<Stat> {
        let id = self.resolve(fh)?;
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(&id).ok_or(VfsError::Stale)?;

        if let Some(size) = attrs.size {
            if node.stat.file_type == FileType::Directory {
                return Err(VfsError::IsDir);
            }
            let size = usize::try_from(size).map_err(|_| VfsError::Invalid("size".into()))?;
            node.data.resize(size, 0);
            node.stat.size = size as u64;
        }
        if let Some(mode) = attrs.mode {
            node.stat.mode = mode & 0o7777;
        }
        if let Some(uid) = attrs.uid {
            node.stat.uid = uid;
        }
        if let Some(gid) = attrs.gid {
            node.stat.gid = gid;
        }
        node.touch();
        if let Some(atime) = attrs.atime {
            node.stat.atime = atime.resolve();
        }
        if let Some(mtime) = attrs.mtime {
            node.stat.mtime = mtime.resolve();
        }
        Ok(node.stat.clone())
    }

    fn lookup(&self, dir: &FileHandle, name: &str) -> VfsResult<FileHandle> {
        let id = self.resolve(dir)?;
        let nodes = self.nodes.read();
        let node = nodes.get(&id).ok_or(VfsError::Stale)?;
        if node.stat.file_type != FileType::Directory {
            return Err(VfsError::NotDir);
        }
        node.children
            .get(name)
            .map(|child| self.handle(*child))
            .ok_or(VfsError::NotFound)
    }

    fn create(
        &self,
        dir: &FileHandle,
        name: &str,
        file_type: FileType,
        uid: u32,
        gid: u32,
        mode: u32,
    ) -> VfsResult<FileHandle> {
        Self::check_name(name)?;
        let dir_id = self.resolve(dir)?;
        let mut nodes = self.nodes.write();

        let parent = nodes.get_mut(&dir_id).ok_or(VfsError::Stale)?;
        let children = parent.dir_mut()?;
        if children.contains_key(name) {
            return Err(VfsError::Exists);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        children.insert(name.to_string(), id);
        parent.touch();

        nodes.insert(id, Node::new(id, file_type, uid, gid, mode & 0o7777));
        Ok(self.handle(id))
    }

    fn read(&self, fh: &FileHandle, offset: u64, count: u32) -> VfsResult<(Bytes, bool)> {
        let id = self.resolve(fh)?;
        let nodes = self.nodes.read();
        let node = nodes.get(&id).ok_or(VfsError::Stale)?;
        if node.stat.file_type == FileType::Directory {
            return Err(VfsError::IsDir);
        }

        let len = node.data.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(count as usize).min(len);
        Ok((Bytes::copy_from_slice(&node.data[start..end]), end == len))
    }

    fn write(&self, fh: &FileHandle, offset: u64, data: &[u8]) -> VfsResult<u32> {
        let id = self.resolve(fh)?;
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(&id).ok_or(VfsError::Stale)?;
        if node.stat.file_type == FileType::Directory {
            return Err(VfsError::IsDir);
        }

        let start = usize::try_from(offset).map_err(|_| VfsError::Invalid("offset".into()))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| VfsError::Invalid("offset".into()))?;
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[start..end].copy_from_slice(data);
        node.stat.size = node.data.len() as u64;
        node.touch();
        Ok(data.len() as u32)
    }

    fn rename(
        &self,
        from_dir: &FileHandle,
        from_name: &str,
        to_dir: &FileHandle,
        to_name: &str,
    ) -> VfsResult<()> {
        Self::check_name(to_name)?;
        let from_id = self.resolve(from_dir)?;
        let to_id = self.resolve(to_dir)?;
        let mut nodes = self.nodes.write();

        if !nodes.contains_key(&to_id) {
            return Err(VfsError::Stale);
        }
        if nodes.get(&to_id).map(|n| n.stat.file_type) != Some(FileType::Directory) {
            return Err(VfsError::NotDir);
        }
        if nodes
            .get(&to_id)
            .is_some_and(|n| n.children.contains_key(to_name))
        {
            return Err(VfsError::Exists);
        }

        let source = nodes.get_mut(&from_id).ok_or(VfsError::Stale)?;
        let child = source.dir_mut()?.remove(from_name).ok_or(VfsError::NotFound)?;
        source.touch();

        let target = nodes.get_mut(&to_id).ok_or(VfsError::Stale)?;
        target.children.insert(to_name.to_string(), child);
        target.touch();
        Ok(())
    }

    fn access(&self, fh: &FileHandle, cred: &RpcCredential, mask: u32) -> VfsResult<u32> {
        let stat = self.getattr(fh)?;
        if cred.uid == 0 {
            return Ok(mask);
        }

        let bits = if cred.uid == stat.uid {
            stat.mode >> 6
        } else if cred.in_group(stat.gid) {
            stat.mode >> 3
        } else {
            stat.mode
        } & 0o7;

        let mut granted = 0;
        if bits & 0o4 != 0 {
            granted |= ACCESS_READ;
        }
        if bits & 0o2 != 0 {
            granted |= ACCESS_MODIFY | ACCESS_EXTEND | ACCESS_DELETE;
        }
        if bits & 0o1 != 0 {
            granted |= ACCESS_EXECUTE | ACCESS_LOOKUP;
        }
        Ok(mask & granted)
    }
}
