//! Mutable in-memory filesystem
//!
//! The mount owns every inode (arena ownership); directory entries and
//! parent pointers are plain inode numbers, so the parent/child cycles of a
//! directory tree never form ownership cycles. An inode's reference count
//! tracks the open handles pointing at it; an inode leaves the arena only
//! once both its link count and its reference count reach zero.
//!
//! File data lives in a balanced tree of page-sized blocks keyed by file
//! offset (always page-aligned). Holes read as zeroes. Directory children
//! live in a balanced tree keyed by name, with names capped at
//! [`RAMFS_ENTRY_MAX_LEN`] bytes.

use crate::error::{Errno, Result};
use crate::sync::KRwLock;
use crate::vfs::{
    FileHandle, Filesystem, FsFlags, FsRef, GetdentsCb, HandleBase, OpenFlags, ResolvedEntry,
    Stat64, VfsDent, VfsEntryType, VfsInode, Whence, S_IFDIR, S_IFLNK, S_IFREG,
};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::ops::ControlFlow;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, Once};

pub const PAGE_SIZE: usize = 4096;
/// Upper bound for one directory entry name
pub const RAMFS_ENTRY_MAX_LEN: usize = 240;

const ROOT_INO: VfsInode = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InodeKind {
    File,
    Directory,
    Symlink,
}

impl InodeKind {
    fn entry_type(self) -> VfsEntryType {
        match self {
            InodeKind::File => VfsEntryType::File,
            InodeKind::Directory => VfsEntryType::Dir,
            InodeKind::Symlink => VfsEntryType::Symlink,
        }
    }
}

enum Payload {
    /// Page-sized blocks keyed by (page-aligned) file offset
    File(BTreeMap<u64, Box<[u8; PAGE_SIZE]>>),
    /// Children keyed by name
    Directory(BTreeMap<String, VfsInode>),
    Symlink(String),
}

struct NodeData {
    size: u64,
    payload: Payload,
}

struct RamfsInode {
    ino: VfsInode,
    kind: InodeKind,
    /// Number of open handles referring to this inode
    refcount: AtomicU32,
    nlink: AtomicU32,
    mode: AtomicU32,
    /// Guards this inode's own data (the per-handle lock hooks)
    rwlock: KRwLock,
    /// Containing directory; non-owning, the arena owns all inodes
    parent: AtomicU64,
    data: Mutex<NodeData>,
}

impl RamfsInode {
    fn new(ino: VfsInode, kind: InodeKind, mode: u32, parent: VfsInode) -> Arc<Self> {
        let payload = match kind {
            InodeKind::File => Payload::File(BTreeMap::new()),
            InodeKind::Directory => Payload::Directory(BTreeMap::new()),
            InodeKind::Symlink => Payload::Symlink(String::new()),
        };

        Arc::new(Self {
            ino,
            kind,
            refcount: AtomicU32::new(0),
            nlink: AtomicU32::new(if kind == InodeKind::Directory { 2 } else { 1 }),
            mode: AtomicU32::new(mode & 0o7777),
            rwlock: KRwLock::new(),
            parent: AtomicU64::new(parent),
            data: Mutex::new(NodeData { size: 0, payload }),
        })
    }

    fn blocks_count(&self) -> u64 {
        match &self.data.lock().payload {
            Payload::File(blocks) => blocks.len() as u64,
            _ => 0,
        }
    }
}

pub struct RamFs {
    flags: FsFlags,
    device_id: u32,
    /// Top-level lock for namespace mutations (the fs lock hooks)
    rwlock: KRwLock,
    next_inode: AtomicU64,
    inodes: Mutex<BTreeMap<VfsInode, Arc<RamfsInode>>>,
    self_ref: Once<Weak<RamFs>>,
}

impl RamFs {
    pub fn mount(flags: FsFlags) -> Arc<RamFs> {
        let fs = Arc::new(RamFs {
            flags,
            device_id: crate::vfs::new_device_id(),
            rwlock: KRwLock::new(),
            next_inode: AtomicU64::new(ROOT_INO + 1),
            inodes: Mutex::new(BTreeMap::new()),
            self_ref: Once::new(),
        });

        fs.self_ref.call_once(|| Arc::downgrade(&fs));

        let root = RamfsInode::new(ROOT_INO, InodeKind::Directory, 0o777, ROOT_INO);
        fs.inodes.lock().insert(ROOT_INO, root);

        info!("ramfs: mounted, device {}", fs.device_id);
        fs
    }

    fn alloc_ino(&self) -> VfsInode {
        self.next_inode.fetch_add(1, Ordering::SeqCst)
    }

    fn inode(&self, ino: VfsInode) -> Result<Arc<RamfsInode>> {
        self.inodes.lock().get(&ino).cloned().ok_or(Errno::ENOENT)
    }

    fn dir_lookup(&self, dir: &RamfsInode, name: &str) -> Result<Option<VfsInode>> {
        match &dir.data.lock().payload {
            Payload::Directory(entries) => Ok(entries.get(name).copied()),
            _ => Err(Errno::ENOTDIR),
        }
    }

    fn check_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Errno::EINVAL);
        }

        if name.len() > RAMFS_ENTRY_MAX_LEN {
            return Err(Errno::ENAMETOOLONG);
        }

        Ok(())
    }

    /// Insert a fresh inode below `dir`. Caller holds the fs exclusive lock.
    fn create_node(
        &self,
        dir: &RamfsInode,
        name: &str,
        kind: InodeKind,
        mode: u32,
    ) -> Result<Arc<RamfsInode>> {
        Self::check_name(name)?;

        let mut data = dir.data.lock();
        let entries = match &mut data.payload {
            Payload::Directory(entries) => entries,
            _ => return Err(Errno::ENOTDIR),
        };

        if entries.contains_key(name) {
            return Err(Errno::EEXIST);
        }

        let inode = RamfsInode::new(self.alloc_ino(), kind, mode, dir.ino);
        entries.insert(String::from(name), inode.ino);
        self.inodes.lock().insert(inode.ino, inode.clone());
        Ok(inode)
    }

    /// Drop an inode from the arena once nothing links to it and nobody
    /// holds it open
    fn maybe_reap(&self, inode: &RamfsInode) {
        if inode.nlink.load(Ordering::SeqCst) == 0
            && inode.refcount.load(Ordering::SeqCst) == 0
        {
            self.inodes.lock().remove(&inode.ino);
        }
    }

    fn do_truncate(&self, inode: &RamfsInode, len: u64) -> Result<()> {
        if inode.kind != InodeKind::File {
            return Err(Errno::EISDIR);
        }

        inode.rwlock.exlock();
        let mut data = inode.data.lock();

        let size = data.size;
        if let Payload::File(blocks) = &mut data.payload {
            if len < size {
                blocks.retain(|&off, _| off < len);

                // zero the tail of the last kept page, so growing the file
                // again reads zeroes
                let page = len & !(PAGE_SIZE as u64 - 1);
                let in_page = (len - page) as usize;

                if in_page > 0 {
                    if let Some(block) = blocks.get_mut(&page) {
                        block[in_page..].fill(0);
                    }
                }
            }
        }

        data.size = len;
        drop(data);
        inode.rwlock.exunlock();
        Ok(())
    }

    /// Create a symbolic link. Exposed on the mount, not through the VFS
    /// vtable.
    pub fn create_symlink(&self, dir: VfsInode, name: &str, target: &str) -> Result<VfsInode> {
        self.rwlock.exlock();

        let res = (|| {
            let dir = self.inode(dir)?;
            let inode = self.create_node(&dir, name, InodeKind::Symlink, 0o777)?;
            let mut data = inode.data.lock();
            data.size = target.len() as u64;
            data.payload = Payload::Symlink(String::from(target));
            Ok(inode.ino)
        })();

        self.rwlock.exunlock();
        res
    }

    #[cfg(test)]
    fn inode_count(&self) -> usize {
        self.inodes.lock().len()
    }

    #[cfg(test)]
    fn refcount_of(&self, ino: VfsInode) -> u32 {
        self.inode(ino).unwrap().refcount.load(Ordering::SeqCst)
    }
}

impl Filesystem for RamFs {
    fn fs_type_name(&self) -> &'static str {
        "ramfs"
    }

    fn flags(&self) -> FsFlags {
        self.flags
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn get_entry(&self, dir_inode: Option<VfsInode>, name: Option<&str>) -> Result<ResolvedEntry> {
        let dir_ino = dir_inode.unwrap_or(ROOT_INO);

        let Some(name) = name else {
            let inode = self.inode(dir_ino)?;
            return Ok(ResolvedEntry {
                inode: Some(dir_ino),
                dir_inode: dir_ino,
                name: None,
                etype: inode.kind.entry_type(),
            });
        };

        let dir = self.inode(dir_ino)?;

        let target = match name {
            "." => Some(dir_ino),
            ".." => Some(dir.parent.load(Ordering::SeqCst)),
            _ => self.dir_lookup(&dir, name)?,
        };

        match target {
            Some(ino) => {
                let inode = self.inode(ino)?;
                Ok(ResolvedEntry {
                    inode: Some(ino),
                    dir_inode: dir_ino,
                    name: Some(String::from(name)),
                    etype: inode.kind.entry_type(),
                })
            }
            None => Ok(ResolvedEntry {
                inode: None,
                dir_inode: dir_ino,
                name: Some(String::from(name)),
                etype: VfsEntryType::None,
            }),
        }
    }

    fn open(
        &self,
        entry: &ResolvedEntry,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Box<dyn FileHandle>> {
        let ramfs = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("ramfs: open on an unmounted filesystem");

        let inode = match entry.inode {
            Some(ino) => {
                if flags.contains(OpenFlags::O_CREAT) && flags.contains(OpenFlags::O_EXCL) {
                    return Err(Errno::EEXIST);
                }

                let inode = self.inode(ino)?;

                if inode.kind == InodeKind::Directory && flags.is_writable() {
                    return Err(Errno::EISDIR);
                }

                if flags.contains(OpenFlags::O_TRUNC) && flags.is_writable() {
                    if !self.is_rw() {
                        return Err(Errno::EROFS);
                    }

                    self.rwlock.exlock();
                    let res = self.do_truncate(&inode, 0);
                    self.rwlock.exunlock();
                    res?;
                }

                inode
            }
            None => {
                if !flags.contains(OpenFlags::O_CREAT) {
                    return Err(Errno::ENOENT);
                }

                if !self.is_rw() {
                    return Err(Errno::EROFS);
                }

                let name = entry.name.as_deref().ok_or(Errno::EINVAL)?;

                self.rwlock.exlock();
                let res = (|| {
                    let dir = self.inode(entry.dir_inode)?;
                    self.create_node(&dir, name, InodeKind::File, mode)
                })();
                self.rwlock.exunlock();
                res?
            }
        };

        if flags.is_writable() && !self.is_rw() {
            return Err(Errno::EROFS);
        }

        inode.refcount.fetch_add(1, Ordering::SeqCst);
        let fs_dyn: FsRef = ramfs.clone();

        Ok(Box::new(RamfsHandle {
            base: HandleBase {
                fs: fs_dyn,
                flags,
                pos: 0,
            },
            ramfs,
            inode,
        }))
    }

    fn stat(&self, ino: VfsInode) -> Result<Stat64> {
        let inode = self.inode(ino)?;
        let size = inode.data.lock().size;

        let kind_bits = match inode.kind {
            InodeKind::File => S_IFREG,
            InodeKind::Directory => S_IFDIR,
            InodeKind::Symlink => S_IFLNK,
        };

        Ok(Stat64 {
            st_dev: self.device_id as u64,
            st_ino: ino,
            st_mode: kind_bits | inode.mode.load(Ordering::SeqCst),
            st_nlink: inode.nlink.load(Ordering::SeqCst),
            st_size: size as i64,
            st_blksize: PAGE_SIZE as i64,
            st_blocks: inode.blocks_count() as i64 * (PAGE_SIZE as i64 / 512),
            ..Stat64::default()
        })
    }

    fn symlink_target(&self, ino: VfsInode) -> Result<String> {
        let inode = self.inode(ino)?;
        let data = inode.data.lock();

        match &data.payload {
            Payload::Symlink(target) => Ok(target.clone()),
            _ => Err(Errno::EINVAL),
        }
    }

    fn mkdir(&self, dir: VfsInode, name: &str, mode: u32) -> Result<()> {
        if !self.is_rw() {
            return Err(Errno::EROFS);
        }

        self.rwlock.exlock();
        let res = (|| {
            let dir = self.inode(dir)?;
            self.create_node(&dir, name, InodeKind::Directory, mode)?;
            Ok(())
        })();
        self.rwlock.exunlock();
        res
    }

    fn rmdir(&self, dir: VfsInode, name: &str) -> Result<()> {
        if !self.is_rw() {
            return Err(Errno::EROFS);
        }

        self.rwlock.exlock();
        let res = (|| {
            let dir = self.inode(dir)?;
            let target_ino = self.dir_lookup(&dir, name)?.ok_or(Errno::ENOENT)?;
            let target = self.inode(target_ino)?;

            if target.kind != InodeKind::Directory {
                return Err(Errno::ENOTDIR);
            }

            if target_ino == ROOT_INO {
                return Err(Errno::EBUSY);
            }

            if let Payload::Directory(entries) = &target.data.lock().payload {
                if !entries.is_empty() {
                    return Err(Errno::ENOTEMPTY);
                }
            }

            if let Payload::Directory(entries) = &mut dir.data.lock().payload {
                entries.remove(name);
            }

            target.nlink.store(0, Ordering::SeqCst);
            self.maybe_reap(&target);
            Ok(())
        })();
        self.rwlock.exunlock();
        res
    }

    fn unlink(&self, dir: VfsInode, name: &str) -> Result<()> {
        if !self.is_rw() {
            return Err(Errno::EROFS);
        }

        self.rwlock.exlock();
        let res = (|| {
            let dir = self.inode(dir)?;
            let target_ino = self.dir_lookup(&dir, name)?.ok_or(Errno::ENOENT)?;
            let target = self.inode(target_ino)?;

            if target.kind == InodeKind::Directory {
                return Err(Errno::EISDIR);
            }

            if let Payload::Directory(entries) = &mut dir.data.lock().payload {
                entries.remove(name);
            }

            target.nlink.fetch_sub(1, Ordering::SeqCst);
            self.maybe_reap(&target);
            Ok(())
        })();
        self.rwlock.exunlock();
        res
    }

    fn link(&self, ino: VfsInode, dir: VfsInode, name: &str) -> Result<()> {
        if !self.is_rw() {
            return Err(Errno::EROFS);
        }

        self.rwlock.exlock();
        let res = (|| {
            Self::check_name(name)?;
            let target = self.inode(ino)?;

            if target.kind == InodeKind::Directory {
                return Err(Errno::EPERM);
            }

            let dir = self.inode(dir)?;
            let mut data = dir.data.lock();
            let entries = match &mut data.payload {
                Payload::Directory(entries) => entries,
                _ => return Err(Errno::ENOTDIR),
            };

            if entries.contains_key(name) {
                return Err(Errno::EEXIST);
            }

            entries.insert(String::from(name), ino);
            target.nlink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })();
        self.rwlock.exunlock();
        res
    }

    fn rename(
        &self,
        old_dir: VfsInode,
        old_name: &str,
        new_dir: VfsInode,
        new_name: &str,
    ) -> Result<()> {
        if !self.is_rw() {
            return Err(Errno::EROFS);
        }

        self.rwlock.exlock();
        let res = (|| {
            Self::check_name(new_name)?;
            let old_dir = self.inode(old_dir)?;
            let new_dir = self.inode(new_dir)?;

            let target_ino = self.dir_lookup(&old_dir, old_name)?.ok_or(Errno::ENOENT)?;

            {
                let mut data = new_dir.data.lock();
                let entries = match &mut data.payload {
                    Payload::Directory(entries) => entries,
                    _ => return Err(Errno::ENOTDIR),
                };

                if entries.contains_key(new_name) {
                    return Err(Errno::EEXIST);
                }

                entries.insert(String::from(new_name), target_ino);
            }

            if let Payload::Directory(entries) = &mut old_dir.data.lock().payload {
                entries.remove(old_name);
            }

            self.inode(target_ino)?
                .parent
                .store(new_dir.ino, Ordering::SeqCst);
            Ok(())
        })();
        self.rwlock.exunlock();
        res
    }

    fn truncate(&self, ino: VfsInode, len: u64) -> Result<()> {
        if !self.is_rw() {
            return Err(Errno::EROFS);
        }

        self.rwlock.exlock();
        let res = self.inode(ino).and_then(|inode| self.do_truncate(&inode, len));
        self.rwlock.exunlock();
        res
    }

    fn chmod(&self, ino: VfsInode, mode: u32) -> Result<()> {
        if !self.is_rw() {
            return Err(Errno::EROFS);
        }

        self.rwlock.exlock();
        let res = self.inode(ino).map(|inode| {
            inode.mode.store(mode & 0o7777, Ordering::SeqCst);
        });
        self.rwlock.exunlock();
        res
    }

    fn retain_inode(&self, ino: VfsInode) -> u32 {
        match self.inode(ino) {
            Ok(inode) => inode.refcount.fetch_add(1, Ordering::SeqCst) + 1,
            Err(_) => 0,
        }
    }

    fn release_inode(&self, ino: VfsInode) -> u32 {
        match self.inode(ino) {
            Ok(inode) => {
                let now = inode.refcount.fetch_sub(1, Ordering::SeqCst) - 1;

                if now == 0 {
                    self.maybe_reap(&inode);
                }

                now
            }
            Err(_) => 0,
        }
    }

    fn fs_exlock(&self) {
        if !self.is_rw() {
            return; // read-only: no lock is needed
        }

        self.rwlock.exlock();
    }

    fn fs_exunlock(&self) {
        if !self.is_rw() {
            return;
        }

        self.rwlock.exunlock();
    }

    fn fs_shlock(&self) {
        if !self.is_rw() {
            return;
        }

        self.rwlock.shlock();
    }

    fn fs_shunlock(&self) {
        if !self.is_rw() {
            return;
        }

        self.rwlock.shunlock();
    }
}

struct RamfsHandle {
    base: HandleBase,
    ramfs: Arc<RamFs>,
    inode: Arc<RamfsInode>,
}

impl Drop for RamfsHandle {
    fn drop(&mut self) {
        self.ramfs.release_inode(self.inode.ino);
    }
}

impl FileHandle for RamfsHandle {
    fn base(&self) -> &HandleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandleBase {
        &mut self.base
    }

    fn inode(&self) -> VfsInode {
        self.inode.ino
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.inode.kind == InodeKind::Directory {
            return Err(Errno::EISDIR);
        }

        let data = self.inode.data.lock();
        let size = data.size;

        if self.base.pos >= size {
            return Ok(0);
        }

        let blocks = match &data.payload {
            Payload::File(blocks) => blocks,
            _ => return Err(Errno::EINVAL),
        };

        let to_read = (buf.len() as u64).min(size - self.base.pos) as usize;
        let mut done = 0usize;

        while done < to_read {
            let pos = self.base.pos + done as u64;
            let page = pos & !(PAGE_SIZE as u64 - 1);
            let in_page = (pos - page) as usize;
            let n = (PAGE_SIZE - in_page).min(to_read - done);

            match blocks.get(&page) {
                Some(block) => {
                    buf[done..done + n].copy_from_slice(&block[in_page..in_page + n]);
                }
                None => buf[done..done + n].fill(0), // hole
            }

            done += n;
        }

        drop(data);
        self.base.pos += to_read as u64;
        Ok(to_read)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.base.fs.is_rw() {
            return Err(Errno::EBADF);
        }

        if self.inode.kind == InodeKind::Directory {
            return Err(Errno::EISDIR);
        }

        let mut data = self.inode.data.lock();

        if self.base.flags.contains(OpenFlags::O_APPEND) {
            self.base.pos = data.size;
        }

        let pos0 = self.base.pos;
        let blocks = match &mut data.payload {
            Payload::File(blocks) => blocks,
            _ => return Err(Errno::EINVAL),
        };

        let mut done = 0usize;

        while done < buf.len() {
            let pos = pos0 + done as u64;
            let page = pos & !(PAGE_SIZE as u64 - 1);
            let in_page = (pos - page) as usize;
            let n = (PAGE_SIZE - in_page).min(buf.len() - done);

            let block = blocks
                .entry(page)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            block[in_page..in_page + n].copy_from_slice(&buf[done..done + n]);

            done += n;
        }

        let end = pos0 + buf.len() as u64;

        if end > data.size {
            data.size = end;
        }

        drop(data);
        self.base.pos = end;
        Ok(buf.len())
    }

    fn seek(&mut self, off: i64, whence: Whence) -> Result<u64> {
        let size = self.inode.data.lock().size as i64;
        let curr = self.base.pos as i64;

        let new_pos = match whence {
            Whence::Set => off,
            Whence::Cur => curr + off,
            Whence::End => size + off,
        };

        if new_pos < 0 {
            return Err(Errno::EINVAL);
        }

        self.base.pos = new_pos as u64;
        Ok(self.base.pos)
    }

    fn getdents(&mut self, cb: GetdentsCb) -> Result<u32> {
        if self.inode.kind != InodeKind::Directory {
            return Err(Errno::ENOTDIR);
        }

        // snapshot names and inos, so the callback runs without the inode
        // data lock held
        let listing: Vec<(String, VfsInode)> = {
            let data = self.inode.data.lock();
            match &data.payload {
                Payload::Directory(entries) => entries
                    .iter()
                    .map(|(name, &ino)| (name.clone(), ino))
                    .collect(),
                _ => return Err(Errno::ENOTDIR),
            }
        };

        for (name, ino) in &listing {
            let etype = self
                .ramfs
                .inode(*ino)
                .map(|i| i.kind.entry_type())
                .unwrap_or(VfsEntryType::File);

            let dent = VfsDent {
                ino: *ino,
                etype,
                name,
            };

            if let ControlFlow::Break(n) = cb(&dent)? {
                return Ok(n);
            }
        }

        Ok(0)
    }

    fn dup(&self) -> Result<Box<dyn FileHandle>> {
        self.inode.refcount.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(RamfsHandle {
            base: HandleBase {
                fs: self.base.fs.clone(),
                flags: self.base.flags,
                pos: self.base.pos,
            },
            ramfs: self.ramfs.clone(),
            inode: self.inode.clone(),
        }))
    }

    fn exlock(&self) {
        if !self.base.fs.is_rw() {
            return;
        }

        self.inode.rwlock.exlock();
    }

    fn exunlock(&self) {
        if !self.base.fs.is_rw() {
            return;
        }

        self.inode.rwlock.exunlock();
    }

    fn shlock(&self) {
        if !self.base.fs.is_rw() {
            return;
        }

        self.inode.rwlock.shlock();
    }

    fn shunlock(&self) {
        if !self.base.fs.is_rw() {
            return;
        }

        self.inode.rwlock.shunlock();
    }
}
