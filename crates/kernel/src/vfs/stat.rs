//! `stat64` / `getdents64` entry points

use super::{FileHandle, VfsDent, VfsEntryType};
use crate::error::{Errno, Result};
use crate::uaccess::copy_to_user;
use core::ops::ControlFlow;

/// Directory entry types, as reported in `linux_dirent64.d_type`
pub const DT_UNKNOWN: u8 = 0;
pub const DT_FIFO: u8 = 1;
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stat64 {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u64,
    pub st_size: i64,
    pub st_blksize: i64,
    pub st_blocks: i64,
    pub st_atime: i64,
    pub st_mtime: i64,
    pub st_ctime: i64,
}

/// Fixed prefix of a `linux_dirent64` record. The NUL-terminated name
/// starts right after `d_type`; the record is padded to `d_reclen`.
/// Only the layout matters here; records are serialized field by field.
#[repr(C)]
#[allow(dead_code)]
struct LinuxDirent64 {
    d_ino: u64,
    d_off: u64,
    d_reclen: u16,
    d_type: u8,
}

const DIRENT_HEADER_SIZE: usize = core::mem::size_of::<LinuxDirent64>();
const DIRENT_NAME_OFFSET: usize = core::mem::offset_of!(LinuxDirent64, d_type) + 1;

fn vfs_type_to_dirent_type(t: VfsEntryType) -> u8 {
    match t {
        VfsEntryType::None => DT_UNKNOWN,
        VfsEntryType::File => DT_REG,
        VfsEntryType::Dir => DT_DIR,
        VfsEntryType::Symlink => DT_LNK,
        VfsEntryType::CharDev => DT_CHR,
        VfsEntryType::BlockDev => DT_BLK,
        VfsEntryType::Pipe => DT_FIFO,
    }
}

/// Stat an open handle, under the shared handle lock
pub fn vfs_fstat64(h: &mut dyn FileHandle) -> Result<Stat64> {
    let fs = h.base().fs.clone();
    let inode = h.inode();

    h.shlock();
    let res = fs.stat(inode);
    h.shunlock();
    res
}

/// Enumerate a directory into a userspace buffer.
///
/// The handle position is an entry index: entries already returned by
/// earlier calls are skipped by counting callbacks from zero. This resume
/// scheme kinda works but is O(n^2) over long enumerations and can return
/// an entry twice if a concurrent creation sorts ahead of the saved
/// position; it is kept as the specified behavior.
pub fn vfs_getdents64(
    h: &mut dyn FileHandle,
    user_dirp: *mut u8,
    buf_size: u32,
) -> Result<u32> {
    let fs = h.base().fs.clone();

    let mut offset: u32 = 0;
    let mut curr_index: u64 = 0;
    let mut pos = h.base().pos;

    let rc = {
        let mut cb = |dent: &VfsDent| -> Result<ControlFlow<u32>> {
            if curr_index < pos {
                curr_index += 1;
                return Ok(ControlFlow::Continue(()));
            }

            let name_len = dent.name.len();
            let entry_size = (DIRENT_HEADER_SIZE + name_len + 1) as u32;

            if offset + entry_size > buf_size {
                if offset == 0 {
                    // the buffer cannot even hold the first entry
                    return Err(Errno::EINVAL);
                }

                return Ok(ControlFlow::Break(offset));
            }

            let mut header = [0u8; DIRENT_HEADER_SIZE];
            header[0..8].copy_from_slice(&dent.ino.to_ne_bytes());
            header[8..16].copy_from_slice(&((offset + entry_size) as u64).to_ne_bytes());
            header[16..18].copy_from_slice(&(entry_size as u16).to_ne_bytes());
            header[18] = vfs_type_to_dirent_type(dent.etype);

            // header first, then name + NUL right after d_type
            let ent_ptr = unsafe { user_dirp.add(offset as usize) };
            copy_to_user(ent_ptr, &header)?;

            let name_ptr = unsafe { ent_ptr.add(DIRENT_NAME_OFFSET) };
            copy_to_user(name_ptr, dent.name.as_bytes())?;
            copy_to_user(unsafe { name_ptr.add(name_len) }, &[0u8])?;

            offset += entry_size;
            curr_index += 1;
            pos += 1;
            Ok(ControlFlow::Continue(()))
        };

        // See the lock discipline: getdents runs under the fs shared lock
        fs.fs_shlock();
        let rc = h.getdents(&mut cb);
        fs.fs_shunlock();
        rc
    };

    h.base_mut().pos = pos;

    match rc {
        Ok(0) => Ok(offset),
        other => other,
    }
}
