//! Read-only FAT12/16/32 back-end over a RAM disk image
//!
//! Inodes are the byte offset of the 32-byte directory entry within the
//! mapped image (stable for the lifetime of the mount); inode 0 is the
//! synthetic root entry. All lock hooks short-circuit on the read-write
//! flag, which a FAT mount never has.

pub mod disk;

use crate::error::{Errno, Result};
use crate::vfs::{
    FileHandle, Filesystem, FsFlags, FsRef, GetdentsCb, HandleBase, OpenFlags, ResolvedEntry,
    Stat64, VfsDent, VfsEntryType, VfsInode, Whence, S_IFDIR, S_IFREG,
};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::ops::ControlFlow;
use spin::Once;
use disk::{
    datetime_to_timestamp, decode_datetime, fat_read_entry, is_bad_cluster, is_end_of_chain,
    synthesize_root_entry, walk_directory, Bpb, DirEnt, FatType, WalkCtx, DIRENT_SIZE,
    INVALID_CLUSTER,
};

/// Inode of the root directory (no on-disk entry describes it)
pub const FAT_ROOT_INODE: VfsInode = 0;

pub struct FatFs {
    img: Arc<[u8]>,
    bpb: Bpb,
    ftype: FatType,
    cluster_size: u32,
    root_entry: [u8; DIRENT_SIZE],
    root_cluster: u32,
    flags: FsFlags,
    device_id: u32,
    /// Back-reference handed to handles; set once right after mount
    self_ref: Once<Weak<FatFs>>,
}

impl FatFs {
    /// Mount a FAT volume image living in RAM.
    ///
    /// Read-write mounts are not supported; asking for one is a caller bug.
    pub fn mount_ramdisk(img: Arc<[u8]>, flags: FsFlags) -> Result<Arc<FatFs>> {
        if flags.contains(FsFlags::READ_WRITE) {
            panic!("fat: r/w mode is not supported");
        }

        let bpb = Bpb::parse(&img)?;
        let ftype = bpb.fat_type();

        let root_cluster = match ftype {
            FatType::Fat32 => bpb.root_clus,
            _ => 0,
        };

        let fs = Arc::new(FatFs {
            cluster_size: bpb.cluster_size(),
            root_entry: synthesize_root_entry(root_cluster),
            root_cluster,
            img,
            bpb,
            ftype,
            flags,
            device_id: crate::vfs::new_device_id(),
            self_ref: Once::new(),
        });

        fs.self_ref.call_once(|| Arc::downgrade(&fs));

        info!(
            "fat: mounted {:?} volume, cluster size {}",
            fs.ftype, fs.cluster_size
        );
        Ok(fs)
    }

    fn entry(&self, inode: VfsInode) -> DirEnt<'_> {
        if inode == FAT_ROOT_INODE {
            DirEnt::from_raw(&self.root_entry)
        } else {
            DirEnt::at(&self.img, inode as usize)
        }
    }

    /// First data cluster of an entry. Works for the root too: on FAT12/16
    /// this is 0 because the root is not a cluster chain.
    fn first_cluster_generic(&self, inode: VfsInode) -> u32 {
        if inode == FAT_ROOT_INODE {
            self.root_cluster
        } else {
            self.entry(inode).first_cluster(self.ftype)
        }
    }

    fn root_resolved(&self) -> ResolvedEntry {
        ResolvedEntry {
            inode: Some(FAT_ROOT_INODE),
            dir_inode: FAT_ROOT_INODE,
            name: None,
            etype: VfsEntryType::Dir,
        }
    }

    fn walk_dir_of(&self, dir_inode: VfsInode, cb: disk::WalkCb) -> Result<u32> {
        let mut ctx = WalkCtx::default();
        let start_cluster = self.first_cluster_generic(dir_inode);
        walk_directory(&mut ctx, &self.img, &self.bpb, self.ftype, start_cluster, cb)
    }

    /// Number of entries in a directory
    fn count_dirents(&self, dir_inode: VfsInode) -> Result<u64> {
        let mut count = 0u64;
        self.walk_dir_of(dir_inode, &mut |_, _, _| {
            count += 1;
            Ok(ControlFlow::Continue(()))
        })?;
        Ok(count)
    }
}

impl Filesystem for FatFs {
    fn fs_type_name(&self) -> &'static str {
        "fat"
    }

    fn flags(&self) -> FsFlags {
        self.flags
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn get_entry(&self, dir_inode: Option<VfsInode>, name: Option<&str>) -> Result<ResolvedEntry> {
        let (dir, name) = match (dir_inode, name) {
            (None, None) => return Ok(self.root_resolved()),
            (dir, Some(name)) => (dir.unwrap_or(FAT_ROOT_INODE), name),
            (Some(dir), None) => {
                // the directory itself
                let e = self.entry(dir);
                return Ok(ResolvedEntry {
                    inode: Some(dir),
                    dir_inode: dir,
                    name: None,
                    etype: if e.is_directory() {
                        VfsEntryType::Dir
                    } else {
                        VfsEntryType::File
                    },
                });
            }
        };

        if !self.entry(dir).is_directory() {
            return Err(Errno::ENOTDIR);
        }

        if dir == FAT_ROOT_INODE && (name == "." || name == "..") {
            return Ok(self.root_resolved());
        }

        let mut found: Option<(VfsInode, bool, u32)> = None;

        self.walk_dir_of(dir, &mut |off, ent, long_name| {
            let matches = match long_name {
                Some(ln) => ln.eq_ignore_ascii_case(name),
                None => false,
            } || ent.short_name().eq_ignore_ascii_case(name);

            if matches {
                found = Some((off, ent.is_directory(), ent.first_cluster(self.ftype)));
                return Ok(ControlFlow::Break(0));
            }

            Ok(ControlFlow::Continue(()))
        })?;

        let entry = match found {
            Some((off, is_dir, first_cluster)) => {
                // a directory entry pointing at cluster 0 or the root
                // cluster canonicalizes to the root
                if is_dir && (first_cluster == 0 || first_cluster == self.root_cluster) {
                    self.root_resolved()
                } else {
                    ResolvedEntry {
                        inode: Some(off),
                        dir_inode: dir,
                        name: Some(String::from(name)),
                        etype: if is_dir {
                            VfsEntryType::Dir
                        } else {
                            VfsEntryType::File
                        },
                    }
                }
            }
            None => ResolvedEntry {
                inode: None,
                dir_inode: dir,
                name: Some(String::from(name)),
                etype: VfsEntryType::None,
            },
        };

        Ok(entry)
    }

    fn open(
        &self,
        entry: &ResolvedEntry,
        flags: OpenFlags,
        _mode: u32,
    ) -> Result<Box<dyn FileHandle>> {
        let Some(inode) = entry.inode else {
            if flags.contains(OpenFlags::O_CREAT) && !self.is_rw() {
                return Err(Errno::EROFS);
            }

            return Err(Errno::ENOENT);
        };

        if flags.contains(OpenFlags::O_CREAT) && flags.contains(OpenFlags::O_EXCL) {
            return Err(Errno::EEXIST);
        }

        if !self.is_rw() && flags.is_writable() {
            return Err(Errno::EROFS);
        }

        let fatfs = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("fat: open on an unmounted filesystem");

        let curr_cluster = self.first_cluster_generic(inode);
        let fs_dyn: FsRef = fatfs.clone();

        Ok(Box::new(FatHandle {
            base: HandleBase {
                fs: fs_dyn,
                flags,
                pos: 0,
            },
            fatfs,
            inode,
            curr_cluster,
        }))
    }

    fn stat(&self, inode: VfsInode) -> Result<Stat64> {
        let e = self.entry(inode);

        let mut st = Stat64 {
            st_dev: self.device_id as u64,
            st_ino: inode,
            st_mode: 0o555,
            st_nlink: 1,
            st_size: e.file_size() as i64,
            st_blksize: 4096,
            st_blocks: e.file_size() as i64 / 512,
            ..Stat64::default()
        };

        if e.is_directory() || e.is_volume_id() {
            st.st_mode |= S_IFDIR;
        } else {
            st.st_mode |= S_IFREG;
        }

        let crt = decode_datetime(e.crt_date(), e.crt_time(), e.crt_time_tenth());
        let wrt = decode_datetime(e.wrt_date(), e.wrt_time(), 0);

        st.st_ctime = datetime_to_timestamp(crt);
        st.st_mtime = datetime_to_timestamp(wrt);
        st.st_atime = st.st_mtime;
        Ok(st)
    }

    fn retain_inode(&self, _inode: VfsInode) -> u32 {
        // entries are borrowed pointers into the image; their lifetime is
        // the mount's
        1
    }

    fn release_inode(&self, _inode: VfsInode) -> u32 {
        1
    }

    // Filesystem-scoped lock hooks. The mount is always read-only, so
    // there is nothing to serialize; the hooks stay in the vtable.
    fn fs_exlock(&self) {}

    fn fs_exunlock(&self) {}

    fn fs_shlock(&self) {}

    fn fs_shunlock(&self) {}
}

impl Drop for FatFs {
    fn drop(&mut self) {
        debug!("fat: unmounted device {}", self.device_id);
    }
}

struct FatHandle {
    base: HandleBase,
    fatfs: Arc<FatFs>,
    inode: VfsInode,
    curr_cluster: u32,
}

impl FatHandle {
    fn rewind(&mut self) {
        self.base.pos = 0;
        self.curr_cluster = self.fatfs.first_cluster_generic(self.inode);
    }

    /// Move the cursor `dist` bytes forward, following the cluster chain.
    /// Seeking past the end of the file is allowed; the current cluster
    /// then becomes invalid and reads return 0.
    fn seek_forward(&mut self, dist: u64) -> Result<u64> {
        let fs = self.fatfs.clone();
        let fsize = fs.entry(self.inode).file_size() as u64;
        let cluster_size = fs.cluster_size as u64;

        if dist == 0 {
            return Ok(self.base.pos);
        }

        if self.base.pos + dist > fsize {
            self.base.pos += dist;
            self.curr_cluster = INVALID_CLUSTER;
            return Ok(self.base.pos);
        }

        let mut moved = 0u64;

        loop {
            let file_rem = fsize - self.base.pos;
            let dist_rem = dist - moved;
            let cluster_off = self.base.pos % cluster_size;
            let cluster_rem = cluster_size - cluster_off;
            let to_move = cluster_rem.min(dist_rem).min(file_rem);

            moved += to_move;
            self.base.pos += to_move;

            if to_move < cluster_rem {
                break;
            }

            let next = fat_read_entry(&fs.img, &fs.bpb, fs.ftype, self.curr_cluster);

            if is_end_of_chain(fs.ftype, next) {
                debug_assert_eq!(self.base.pos, fsize);
                break;
            }

            assert!(!is_bad_cluster(fs.ftype, next), "bad cluster in chain");
            self.curr_cluster = next;
        }

        Ok(self.base.pos)
    }

    fn seek_dir(&mut self, off: i64, whence: Whence) -> Result<u64> {
        if whence != Whence::Set {
            return Err(Errno::EINVAL);
        }

        if off < 0 || off as u64 > self.fatfs.count_dirents(self.inode)? {
            return Err(Errno::EINVAL);
        }

        self.base.pos = off as u64;
        Ok(self.base.pos)
    }
}

impl FileHandle for FatHandle {
    fn base(&self) -> &HandleBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut HandleBase {
        &mut self.base
    }

    fn inode(&self) -> VfsInode {
        self.inode
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let fs = self.fatfs.clone();
        let fsize = fs.entry(self.inode).file_size() as u64;
        let cluster_size = fs.cluster_size as u64;

        if self.base.pos >= fsize {
            // cursor at or past the end: nothing to read
            return Ok(0);
        }

        let mut written = 0usize;

        loop {
            let data = fs.bpb.cluster_offset(self.curr_cluster);

            let file_rem = fsize - self.base.pos;
            let buf_rem = (buf.len() - written) as u64;
            let cluster_off = self.base.pos % cluster_size;
            let cluster_rem = cluster_size - cluster_off;
            let to_read = cluster_rem.min(buf_rem).min(file_rem) as usize;

            let src = data + cluster_off as usize;
            buf[written..written + to_read].copy_from_slice(&fs.img[src..src + to_read]);
            written += to_read;
            self.base.pos += to_read as u64;

            if (to_read as u64) < cluster_rem {
                // buf or file exhausted mid-cluster: cannot continue
                break;
            }

            let next = fat_read_entry(&fs.img, &fs.bpb, fs.ftype, self.curr_cluster);

            if is_end_of_chain(fs.ftype, next) {
                debug_assert_eq!(self.base.pos, fsize);
                break;
            }

            assert!(!is_bad_cluster(fs.ftype, next), "bad cluster in chain");
            self.curr_cluster = next;
        }

        Ok(written)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        // read-only file system: can't write
        Err(Errno::EBADF)
    }

    fn seek(&mut self, off: i64, whence: Whence) -> Result<u64> {
        let fs = self.fatfs.clone();

        if fs.entry(self.inode).is_directory() || self.inode == FAT_ROOT_INODE {
            return self.seek_dir(off, whence);
        }

        let fsize = fs.entry(self.inode).file_size() as i64;
        let curr_pos = self.base.pos as i64;

        let dist = match whence {
            Whence::Set => {
                if off < 0 {
                    return Err(Errno::EINVAL); // invalid negative offset
                }

                self.rewind();
                off
            }
            Whence::End => {
                if off >= 0 {
                    // seeking past the end through SEEK_END leaves the
                    // position unchanged
                    return Ok(self.base.pos);
                }

                let off = fsize + off;

                if off < 0 {
                    return Err(Errno::EINVAL);
                }

                self.rewind();
                off
            }
            Whence::Cur => {
                if off < 0 {
                    let off = curr_pos + off;

                    if off < 0 {
                        return Err(Errno::EINVAL);
                    }

                    self.rewind();
                    off
                } else {
                    off
                }
            }
        };

        self.seek_forward(dist as u64)
    }

    fn getdents(&mut self, cb: GetdentsCb) -> Result<u32> {
        let fs = self.fatfs.clone();
        let e = fs.entry(self.inode);

        if !e.is_directory() && !e.is_volume_id() {
            return Err(Errno::ENOTDIR);
        }

        fs.walk_dir_of(self.inode, &mut |off, ent, long_name| {
            let short;
            let name = match long_name {
                Some(ln) => ln,
                None => {
                    short = ent.short_name();
                    short.as_str()
                }
            };

            let dent = VfsDent {
                ino: off,
                etype: if ent.is_directory() {
                    VfsEntryType::Dir
                } else {
                    VfsEntryType::File
                },
                name,
            };

            cb(&dent)
        })
    }

    fn dup(&self) -> Result<Box<dyn FileHandle>> {
        Ok(Box::new(FatHandle {
            base: HandleBase {
                fs: self.base.fs.clone(),
                flags: self.base.flags,
                pos: self.base.pos,
            },
            fatfs: self.fatfs.clone(),
            inode: self.inode,
            curr_cluster: self.curr_cluster,
        }))
    }

    // Handle-scoped lock hooks: no-ops under the read-only invariant
    fn exlock(&self) {}

    fn exunlock(&self) {}

    fn shlock(&self) {}

    fn shunlock(&self) {}
}

#[cfg(test)]
mod tests;
