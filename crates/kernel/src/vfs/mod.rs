//! Virtual File System layer
//!
//! Back-ends plug in through two trait vtables: [`Filesystem`] (per-mount
//! operations, namespace mutations, the four fs-scoped lock hooks) and
//! [`FileHandle`] (per-open-file operations and the four handle-scoped lock
//! hooks). The entry points here add the lock discipline on top and forward
//! back-end errors unchanged.

pub mod stat;

use crate::error::{Errno, Result};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::ops::ControlFlow;
use core::sync::atomic::{AtomicU32, Ordering};

pub use stat::{vfs_fstat64, vfs_getdents64, Stat64};

/// File type mask and type bits for `st_mode`
pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFIFO: u32 = 0o010000;

bitflags! {
    /// Per-filesystem capability flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsFlags: u32 {
        const READ_WRITE = 1 << 0;
    }
}

bitflags! {
    /// POSIX file-status flags carried by every handle
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const O_RDONLY = 0o0;
        const O_WRONLY = 0o1;
        const O_RDWR = 0o2;
        const O_CREAT = 0o100;
        const O_EXCL = 0o200;
        const O_TRUNC = 0o1000;
        const O_APPEND = 0o2000;
        const O_DIRECTORY = 0o200000;
    }
}

impl OpenFlags {
    pub fn is_readable(&self) -> bool {
        (*self & OpenFlags::O_WRONLY).is_empty()
    }

    pub fn is_writable(&self) -> bool {
        self.intersects(OpenFlags::O_WRONLY | OpenFlags::O_RDWR)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsEntryType {
    None,
    File,
    Dir,
    Symlink,
    CharDev,
    BlockDev,
    Pipe,
}

/// Back-end-opaque inode identifier. FAT uses the byte offset of the
/// directory entry within the volume image; ramfs uses its inode numbers.
pub type VfsInode = u64;

/// One directory entry produced by a back-end `getdents`
#[derive(Debug)]
pub struct VfsDent<'a> {
    pub ino: VfsInode,
    pub etype: VfsEntryType,
    pub name: &'a str,
}

/// Callback fed by back-end `getdents`: `Continue` to keep walking,
/// `Break(n)` to stop having produced `n` bytes.
pub type GetdentsCb<'a> = &'a mut dyn FnMut(&VfsDent) -> Result<ControlFlow<u32>>;

/// Result of resolving one path component in a back-end
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    /// The resolved inode, or None when the component does not exist
    pub inode: Option<VfsInode>,
    /// Directory the lookup ran in
    pub dir_inode: VfsInode,
    /// Final component name (used by O_CREAT paths)
    pub name: Option<String>,
    pub etype: VfsEntryType,
}

pub type FsRef = Arc<dyn Filesystem>;

/// Per-mount operations table.
///
/// Namespace mutations default to EROFS so read-only back-ends only
/// implement what they support; the lock hooks must stay in the vtable even
/// when they short-circuit on a read-only mount.
pub trait Filesystem: Send + Sync {
    fn fs_type_name(&self) -> &'static str;
    fn flags(&self) -> FsFlags;
    fn device_id(&self) -> u32;

    fn is_rw(&self) -> bool {
        self.flags().contains(FsFlags::READ_WRITE)
    }

    /// Resolve `name` inside `dir_inode`. Both `None` resolves the root
    /// directory itself.
    fn get_entry(&self, dir_inode: Option<VfsInode>, name: Option<&str>) -> Result<ResolvedEntry>;

    fn open(
        &self,
        entry: &ResolvedEntry,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<Box<dyn FileHandle>>;

    fn stat(&self, inode: VfsInode) -> Result<Stat64>;

    /// Read a symlink target (back-ends with symlink support only)
    fn symlink_target(&self, _inode: VfsInode) -> Result<String> {
        Err(Errno::EINVAL)
    }

    fn mkdir(&self, _dir: VfsInode, _name: &str, _mode: u32) -> Result<()> {
        Err(Errno::EROFS)
    }

    fn rmdir(&self, _dir: VfsInode, _name: &str) -> Result<()> {
        Err(Errno::EROFS)
    }

    fn unlink(&self, _dir: VfsInode, _name: &str) -> Result<()> {
        Err(Errno::EROFS)
    }

    fn link(&self, _inode: VfsInode, _dir: VfsInode, _name: &str) -> Result<()> {
        Err(Errno::EROFS)
    }

    fn rename(
        &self,
        _old_dir: VfsInode,
        _old_name: &str,
        _new_dir: VfsInode,
        _new_name: &str,
    ) -> Result<()> {
        Err(Errno::EROFS)
    }

    fn truncate(&self, _inode: VfsInode, _len: u64) -> Result<()> {
        Err(Errno::EROFS)
    }

    fn chmod(&self, _inode: VfsInode, _mode: u32) -> Result<()> {
        Err(Errno::EROFS)
    }

    /// Bump the open-handle reference on an inode
    fn retain_inode(&self, inode: VfsInode) -> u32;
    /// Drop the open-handle reference on an inode
    fn release_inode(&self, inode: VfsInode) -> u32;

    // Filesystem-scoped locks. Read-only mounts implement these as no-ops.
    fn fs_exlock(&self);
    fn fs_exunlock(&self);
    fn fs_shlock(&self);
    fn fs_shunlock(&self);
}

/// Common prefix of every back-end handle
pub struct HandleBase {
    pub fs: FsRef,
    pub flags: OpenFlags,
    /// File cursor; for directories, the index of the next entry
    pub pos: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl Whence {
    pub fn from_i32(v: i32) -> Result<Self> {
        match v {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// Per-open-file operations table
pub trait FileHandle: Send {
    fn base(&self) -> &HandleBase;
    fn base_mut(&mut self) -> &mut HandleBase;
    fn inode(&self) -> VfsInode;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn seek(&mut self, off: i64, whence: Whence) -> Result<u64>;

    fn getdents(&mut self, cb: GetdentsCb) -> Result<u32>;

    fn ioctl(&mut self, _request: u32, _argp: *mut u8) -> Result<i32> {
        Err(Errno::EINVAL)
    }

    fn fcntl(&mut self, _cmd: i32, _arg: i32) -> Result<i32> {
        Err(Errno::EINVAL)
    }

    fn dup(&self) -> Result<Box<dyn FileHandle>>;

    // Handle-scoped locks. Read-only mounts implement these as no-ops.
    fn exlock(&self);
    fn exunlock(&self);
    fn shlock(&self);
    fn shunlock(&self);
}

impl core::fmt::Debug for dyn FileHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FileHandle")
            .field("inode", &self.inode())
            .field("pos", &self.base().pos)
            .field("flags", &self.base().flags)
            .finish()
    }
}

static NEXT_DEVICE_ID: AtomicU32 = AtomicU32::new(1);

/// Device id for a freshly mounted filesystem
pub fn new_device_id() -> u32 {
    NEXT_DEVICE_ID.fetch_add(1, Ordering::SeqCst)
}

/// How many chained symlinks a path walk will follow
const MAX_SYMLINK_DEPTH: u32 = 8;

/// A mounted filesystem tree rooted at a single back-end
pub struct Vfs {
    root: FsRef,
}

impl Vfs {
    pub fn new(root: FsRef) -> Self {
        Self { root }
    }

    pub fn root_fs(&self) -> &FsRef {
        &self.root
    }

    /// Resolve an absolute path down to its final component.
    ///
    /// Intermediate components must exist and be directories; the final
    /// component may be missing (`inode == None`), which `O_CREAT` paths
    /// rely on. Symlinks are followed up to a fixed depth.
    pub fn resolve(&self, path: &str) -> Result<ResolvedEntry> {
        if !path.starts_with('/') {
            return Err(Errno::EINVAL);
        }

        let mut entry = self.root.get_entry(None, None)?;
        let mut components: Vec<String> = path
            .split('/')
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        components.reverse();

        let mut link_depth = 0;

        while let Some(comp) = components.pop() {
            let dir = entry.inode.ok_or(Errno::ENOENT)?;

            if entry.etype != VfsEntryType::Dir {
                return Err(Errno::ENOTDIR);
            }

            entry = self.root.get_entry(Some(dir), Some(&comp))?;

            if entry.etype == VfsEntryType::Symlink {
                if let Some(ino) = entry.inode {
                    link_depth += 1;

                    if link_depth > MAX_SYMLINK_DEPTH {
                        return Err(Errno::ELOOP);
                    }

                    let target = self.root.symlink_target(ino)?;

                    entry = if target.starts_with('/') {
                        self.root.get_entry(None, None)?
                    } else {
                        // keep walking from the symlink's directory
                        ResolvedEntry {
                            inode: Some(dir),
                            dir_inode: dir,
                            name: None,
                            etype: VfsEntryType::Dir,
                        }
                    };

                    for c in target.split('/').filter(|c| !c.is_empty()).rev() {
                        components.push(String::from(c));
                    }
                }
            }
        }

        Ok(entry)
    }

    /// Open a path. Back-ends enforce their own O_CREAT/O_EXCL/EROFS rules.
    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn FileHandle>> {
        let entry = self.resolve(path)?;

        if flags.contains(OpenFlags::O_DIRECTORY)
            && entry.inode.is_some()
            && entry.etype != VfsEntryType::Dir
        {
            return Err(Errno::ENOTDIR);
        }

        self.root.open(&entry, flags, mode)
    }

    /// Stat by path: open read-only, fstat, close
    pub fn stat64(&self, path: &str) -> Result<Stat64> {
        let mut h = self.open(path, OpenFlags::O_RDONLY, 0)?;
        let st = vfs_fstat64(h.as_mut())?;
        vfs_close(h);
        Ok(st)
    }
}

/// Read from a handle. Takes the exclusive handle lock: the cursor moves.
pub fn vfs_read(h: &mut dyn FileHandle, buf: &mut [u8]) -> Result<usize> {
    if !h.base().flags.is_readable() {
        return Err(Errno::EBADF);
    }

    h.exlock();
    let res = h.read(buf);
    h.exunlock();
    res
}

/// Write to a handle under the exclusive handle lock
pub fn vfs_write(h: &mut dyn FileHandle, buf: &[u8]) -> Result<usize> {
    if !h.base().flags.is_writable() {
        return Err(Errno::EBADF);
    }

    h.exlock();
    let res = h.write(buf);
    h.exunlock();
    res
}

pub fn vfs_seek(h: &mut dyn FileHandle, off: i64, whence: i32) -> Result<u64> {
    let whence = Whence::from_i32(whence)?;
    h.exlock();
    let res = h.seek(off, whence);
    h.exunlock();
    res
}

pub fn vfs_dup(h: &dyn FileHandle) -> Result<Box<dyn FileHandle>> {
    h.dup()
}

pub fn vfs_ioctl(h: &mut dyn FileHandle, request: u32, argp: *mut u8) -> Result<i32> {
    h.ioctl(request, argp)
}

pub fn vfs_fcntl(h: &mut dyn FileHandle, cmd: i32, arg: i32) -> Result<i32> {
    h.fcntl(cmd, arg)
}

/// Close a handle. Back-end `Drop` impls release their inode references.
pub fn vfs_close(h: Box<dyn FileHandle>) {
    drop(h);
}
