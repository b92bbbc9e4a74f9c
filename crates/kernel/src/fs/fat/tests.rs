//! FAT back-end tests over synthetic volume images

use super::disk::*;
use super::*;
use crate::vfs::{vfs_getdents64, OpenFlags, Vfs};
use alloc::collections::BTreeMap;
use alloc::string::ToString;
use alloc::vec;
use alloc::vec::Vec;

/// Builds small FAT volumes in memory, one sector at a time
struct ImageBuilder {
    img: Vec<u8>,
    ftype: FatType,
    root_slots_used: usize,
    cluster_slots_used: BTreeMap<u32, usize>,
}

impl ImageBuilder {
    /// FAT12: 512-byte sectors, 8 sectors per cluster (4096-byte clusters),
    /// 40 data clusters
    fn fat12() -> Self {
        Self::build(FatType::Fat12, 512, 8, 1, 1, 32, 1, 324, 0)
    }

    /// FAT16: 4100 single-sector clusters
    fn fat16() -> Self {
        Self::build(FatType::Fat16, 512, 1, 1, 1, 32, 17, 4120, 0)
    }

    /// FAT32: 70000 single-sector clusters, root chain starting at 2
    fn fat32() -> Self {
        Self::build(FatType::Fat32, 512, 1, 32, 1, 0, 548, 70580, 2)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        ftype: FatType,
        bps: u32,
        spc: u32,
        resvd: u32,
        nfats: u32,
        root_ent_cnt: u32,
        fat_sz: u32,
        tot_sec: u32,
        root_clus: u32,
    ) -> Self {
        let mut img = vec![0u8; (tot_sec * bps) as usize];

        img[11..13].copy_from_slice(&(bps as u16).to_le_bytes());
        img[13] = spc as u8;
        img[14..16].copy_from_slice(&(resvd as u16).to_le_bytes());
        img[16] = nfats as u8;
        img[17..19].copy_from_slice(&(root_ent_cnt as u16).to_le_bytes());

        if ftype == FatType::Fat32 {
            img[32..36].copy_from_slice(&tot_sec.to_le_bytes());
            img[36..40].copy_from_slice(&fat_sz.to_le_bytes());
            img[44..48].copy_from_slice(&root_clus.to_le_bytes());
        } else {
            img[19..21].copy_from_slice(&(tot_sec as u16).to_le_bytes());
            img[22..24].copy_from_slice(&(fat_sz as u16).to_le_bytes());
        }

        let mut b = Self {
            img,
            ftype,
            root_slots_used: 0,
            cluster_slots_used: BTreeMap::new(),
        };

        if ftype == FatType::Fat32 {
            b.set_fat(root_clus, 0x0FFF_FFFF); // root chain: single cluster
        }

        b
    }

    fn bpb(&self) -> Bpb {
        Bpb::parse(&self.img).unwrap()
    }

    fn set_fat(&mut self, cluster: u32, val: u32) {
        let fat = self.bpb().fat_offset();
        let c = cluster as usize;

        match self.ftype {
            FatType::Fat12 => {
                let idx = fat + c + c / 2;
                if c & 1 == 0 {
                    self.img[idx] = (val & 0xFF) as u8;
                    self.img[idx + 1] = (self.img[idx + 1] & 0xF0) | ((val >> 8) & 0x0F) as u8;
                } else {
                    self.img[idx] = (self.img[idx] & 0x0F) | (((val & 0x0F) as u8) << 4);
                    self.img[idx + 1] = ((val >> 4) & 0xFF) as u8;
                }
            }
            FatType::Fat16 => {
                self.img[fat + c * 2..fat + c * 2 + 2]
                    .copy_from_slice(&(val as u16).to_le_bytes());
            }
            FatType::Fat32 => {
                self.img[fat + c * 4..fat + c * 4 + 4].copy_from_slice(&val.to_le_bytes());
            }
        }
    }

    fn eoc(&self) -> u32 {
        match self.ftype {
            FatType::Fat12 => 0xFFF,
            FatType::Fat16 => 0xFFFF,
            FatType::Fat32 => 0x0FFF_FFFF,
        }
    }

    /// Link the clusters into a chain terminated by end-of-chain
    fn chain(&mut self, clusters: &[u32]) {
        for w in clusters.windows(2) {
            self.set_fat(w[0], w[1]);
        }

        if let Some(&last) = clusters.last() {
            self.set_fat(last, self.eoc());
        }
    }

    /// Fill a file's clusters with the identification pattern
    /// `byte = file_offset % 251`
    fn write_file_pattern(&mut self, clusters: &[u32], size: usize) {
        let bpb = self.bpb();
        let csize = bpb.cluster_size() as usize;

        for (i, &c) in clusters.iter().enumerate() {
            let off = bpb.cluster_offset(c);
            let start = i * csize;
            let n = csize.min(size.saturating_sub(start));

            for k in 0..n {
                self.img[off + k] = ((start + k) % 251) as u8;
            }
        }
    }

    fn expected_pattern(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    fn dirent(name83: &[u8; 11], attrs: FatAttrs, cluster: u32, size: u32) -> [u8; 32] {
        let mut e = [0u8; 32];
        e[0..11].copy_from_slice(name83);
        e[11] = attrs.bits();
        // 2003-09-15 13:45:30 (+0.4s on creation)
        let date: u16 = 15 | (9 << 5) | (23 << 9);
        let time: u16 = 15 | (45 << 5) | (13 << 11);
        e[13] = 4; // tenths of a second: 4 -> +0 whole seconds
        e[14..16].copy_from_slice(&time.to_le_bytes());
        e[16..18].copy_from_slice(&date.to_le_bytes());
        e[20..22].copy_from_slice(&((cluster >> 16) as u16).to_le_bytes());
        e[22..24].copy_from_slice(&time.to_le_bytes());
        e[24..26].copy_from_slice(&date.to_le_bytes());
        e[26..28].copy_from_slice(&(cluster as u16).to_le_bytes());
        e[28..32].copy_from_slice(&size.to_le_bytes());
        e
    }

    /// Append a raw 32-byte entry to the root directory; returns its inode
    fn add_root_raw(&mut self, raw: [u8; 32]) -> u64 {
        let bpb = self.bpb();

        let off = if self.ftype == FatType::Fat32 {
            let root = bpb.root_clus;
            let slot = self.cluster_slots_used.entry(root).or_insert(0);
            let off = bpb.cluster_offset(root) + *slot * 32;
            *slot += 1;
            off
        } else {
            let off = bpb.root_dir_offset() + self.root_slots_used * 32;
            self.root_slots_used += 1;
            off
        };

        self.img[off..off + 32].copy_from_slice(&raw);
        off as u64
    }

    fn add_root_file(&mut self, name83: &[u8; 11], clusters: &[u32], size: u32) -> u64 {
        self.chain(clusters);
        self.write_file_pattern(clusters, size as usize);
        self.add_root_raw(Self::dirent(
            name83,
            FatAttrs::ARCHIVE,
            clusters[0],
            size,
        ))
    }

    fn add_root_dir(&mut self, name83: &[u8; 11], cluster: u32) -> u64 {
        if cluster != 0 {
            self.chain(&[cluster]);
        }

        self.add_root_raw(Self::dirent(name83, FatAttrs::DIRECTORY, cluster, 0))
    }

    /// Append an entry into a subdirectory's (single) cluster
    fn add_entry_in_dir(&mut self, dir_cluster: u32, raw: [u8; 32]) -> u64 {
        let bpb = self.bpb();
        let slot = self.cluster_slots_used.entry(dir_cluster).or_insert(0);
        let off = bpb.cluster_offset(dir_cluster) + *slot * 32;
        *slot += 1;
        self.img[off..off + 32].copy_from_slice(&raw);
        off as u64
    }

    /// Write VFAT long-name entries followed by their short entry
    fn add_root_lfn_file(
        &mut self,
        long_name: &str,
        name83: &[u8; 11],
        clusters: &[u32],
        size: u32,
    ) -> u64 {
        self.chain(clusters);
        self.write_file_pattern(clusters, size as usize);

        let mut sum: u8 = 0;
        for &b in name83.iter() {
            sum = ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(b);
        }

        let mut units: Vec<u16> = long_name.encode_utf16().collect();
        units.push(0x0000);
        while units.len() % 13 != 0 {
            units.push(0xFFFF);
        }

        let n_entries = units.len() / 13;

        for seq in (1..=n_entries).rev() {
            let mut e = [0u8; 32];
            e[0] = seq as u8 | if seq == n_entries { 0x40 } else { 0 };
            e[11] = ATTR_LONG_NAME;
            e[13] = sum;

            let part = &units[(seq - 1) * 13..seq * 13];
            let ranges: [(usize, usize, usize); 3] = [(1, 0, 5), (14, 5, 6), (28, 11, 2)];

            for (dst, src, count) in ranges {
                for k in 0..count {
                    e[dst + 2 * k..dst + 2 * k + 2]
                        .copy_from_slice(&part[src + k].to_le_bytes());
                }
            }

            self.add_root_raw(e);
        }

        self.add_root_raw(Self::dirent(name83, FatAttrs::ARCHIVE, clusters[0], size))
    }

    fn mount(self) -> Arc<FatFs> {
        FatFs::mount_ramdisk(Arc::from(self.img.into_boxed_slice()), FsFlags::empty()).unwrap()
    }
}

fn open_root_child(fs: &Arc<FatFs>, name: &str) -> Box<dyn FileHandle> {
    let entry = fs.get_entry(Some(FAT_ROOT_INODE), Some(name)).unwrap();
    fs.open(&entry, OpenFlags::O_RDONLY, 0).unwrap()
}

/// Concrete handle, so tests can watch the cluster cursor
fn raw_handle(fs: &Arc<FatFs>, name: &str) -> FatHandle {
    let entry = fs.get_entry(Some(FAT_ROOT_INODE), Some(name)).unwrap();
    let inode = entry.inode.unwrap();
    let fs_dyn: FsRef = fs.clone();

    FatHandle {
        base: HandleBase {
            fs: fs_dyn,
            flags: OpenFlags::O_RDONLY,
            pos: 0,
        },
        fatfs: fs.clone(),
        inode,
        curr_cluster: fs.first_cluster_generic(inode),
    }
}

#[test]
fn test_mount_detects_geometry() {
    let fs = ImageBuilder::fat12().mount();
    assert_eq!(fs.ftype, FatType::Fat12);
    assert_eq!(fs.cluster_size, 4096);
    assert_eq!(fs.root_cluster, 0);

    let fs = ImageBuilder::fat16().mount();
    assert_eq!(fs.ftype, FatType::Fat16);
    assert_eq!(fs.cluster_size, 512);

    let fs = ImageBuilder::fat32().mount();
    assert_eq!(fs.ftype, FatType::Fat32);
    assert_eq!(fs.root_cluster, 2);
}

#[test]
#[should_panic(expected = "r/w mode is not supported")]
fn test_rw_mount_panics() {
    let b = ImageBuilder::fat12();
    let _ = FatFs::mount_ramdisk(
        Arc::from(b.img.into_boxed_slice()),
        FsFlags::READ_WRITE,
    );
}

#[test]
fn test_read_across_cluster_boundary() {
    // S5: cluster size 4096, file size 10000, position 4000, read(200):
    // 96 bytes from the first cluster + 104 from the second
    let mut b = ImageBuilder::fat12();
    b.add_root_file(b"DATA    BIN", &[2, 3, 4], 10000);
    let fs = b.mount();

    let mut h = raw_handle(&fs, "DATA.BIN");
    assert_eq!(h.seek(4000, Whence::Set).unwrap(), 4000);
    assert_eq!(h.curr_cluster, 2); // offset 4000 is still in the first cluster

    let mut buf = [0u8; 200];
    assert_eq!(h.read(&mut buf).unwrap(), 200);

    let expect = ImageBuilder::expected_pattern(10000);
    assert_eq!(&buf[..], &expect[4000..4200]);
    assert_eq!(h.base().pos, 4200);
    assert_eq!(h.curr_cluster, 3); // the cursor followed the chain
}

#[test]
fn test_read_whole_file_then_eof() {
    // P6: reading S bytes from position 0 returns exactly S; the next read
    // returns 0
    let mut b = ImageBuilder::fat12();
    b.add_root_file(b"DATA    BIN", &[2, 3, 4], 10000);
    let fs = b.mount();

    let mut h = open_root_child(&fs, "DATA.BIN");
    let mut buf = vec![0u8; 16384];
    assert_eq!(h.read(&mut buf).unwrap(), 10000);
    assert_eq!(&buf[..10000], &ImageBuilder::expected_pattern(10000)[..]);
    assert_eq!(h.read(&mut buf).unwrap(), 0);
}

#[test]
fn test_seek_then_read_matches_sequential_read() {
    // P7 for a few representative offsets, including cluster boundaries
    let mut b = ImageBuilder::fat12();
    b.add_root_file(b"DATA    BIN", &[2, 3, 4], 10000);
    let fs = b.mount();

    let expect = ImageBuilder::expected_pattern(10000);

    for k in [0u64, 1, 4095, 4096, 4097, 8191, 8192, 9999] {
        let mut h = open_root_child(&fs, "DATA.BIN");
        assert_eq!(h.seek(k as i64, Whence::Set).unwrap(), k);

        let mut buf = [0u8; 300];
        let n = h.read(&mut buf).unwrap();
        let want = 300usize.min(10000 - k as usize);
        assert_eq!(n, want, "offset {}", k);
        assert_eq!(&buf[..n], &expect[k as usize..k as usize + n]);
    }
}

#[test]
fn test_sparse_seek_past_eof() {
    // S6: seeking past EOF parks the handle on the invalid cluster and
    // reads return 0
    let mut b = ImageBuilder::fat12();
    b.add_root_file(b"DATA    BIN", &[2, 3, 4], 10000);
    let fs = b.mount();

    let mut h = raw_handle(&fs, "DATA.BIN");
    assert_eq!(h.seek(10100, Whence::Set).unwrap(), 10100);
    assert_eq!(h.curr_cluster, INVALID_CLUSTER);

    let mut buf = [0u8; 64];
    assert_eq!(h.read(&mut buf).unwrap(), 0);
    assert_eq!(h.base().pos, 10100);
    assert_eq!(h.curr_cluster, INVALID_CLUSTER);
}

#[test]
fn test_seek_end_and_cur_semantics() {
    let mut b = ImageBuilder::fat12();
    b.add_root_file(b"DATA    BIN", &[2, 3, 4], 10000);
    let fs = b.mount();

    let mut h = open_root_child(&fs, "DATA.BIN");
    assert_eq!(h.seek(100, Whence::Set).unwrap(), 100);

    // SEEK_END with a non-negative offset leaves the position unchanged
    assert_eq!(h.seek(500, Whence::End).unwrap(), 100);
    assert_eq!(h.seek(0, Whence::End).unwrap(), 100);

    // SEEK_END with a negative offset measures from the file size
    assert_eq!(h.seek(-100, Whence::End).unwrap(), 9900);
    assert_eq!(h.seek(-10001, Whence::End).unwrap_err(), Errno::EINVAL);

    // SEEK_CUR back and forth reduces to rewind + forward
    assert_eq!(h.seek(0, Whence::Set).unwrap(), 0);
    assert_eq!(h.seek(5000, Whence::Cur).unwrap(), 5000);
    assert_eq!(h.seek(-1000, Whence::Cur).unwrap(), 4000);
    assert_eq!(h.seek(-4001, Whence::Cur).unwrap_err(), Errno::EINVAL);

    assert_eq!(h.seek(-1, Whence::Set).unwrap_err(), Errno::EINVAL);
}

#[test]
fn test_directory_seek_is_index_based() {
    let mut b = ImageBuilder::fat12();
    b.add_root_file(b"A       TXT", &[2], 10);
    b.add_root_file(b"B       TXT", &[3], 10);
    let fs = b.mount();

    let entry = fs.get_entry(None, None).unwrap();
    let mut h = fs.open(&entry, OpenFlags::O_RDONLY, 0).unwrap();

    assert_eq!(h.seek(1, Whence::Set).unwrap(), 1);
    assert_eq!(h.seek(2, Whence::Set).unwrap(), 2); // == dirent count, allowed
    assert_eq!(h.seek(3, Whence::Set).unwrap_err(), Errno::EINVAL);
    assert_eq!(h.seek(-1, Whence::Set).unwrap_err(), Errno::EINVAL);
    assert_eq!(h.seek(0, Whence::Cur).unwrap_err(), Errno::EINVAL);
}

#[test]
fn test_get_entry_resolution_and_canonicalization() {
    let mut b = ImageBuilder::fat12();
    b.add_root_file(b"DATA    BIN", &[2], 100);
    let sub = b.add_root_dir(b"SUB        ", 5);
    // a directory entry whose first cluster is 0 canonicalizes to the root
    b.add_root_dir(b"WEIRD      ", 0);
    let fs = b.mount();

    // dot and dotdot at the root resolve to the root
    for name in [".", ".."] {
        let e = fs.get_entry(Some(FAT_ROOT_INODE), Some(name)).unwrap();
        assert_eq!(e.inode, Some(FAT_ROOT_INODE));
        assert_eq!(e.etype, VfsEntryType::Dir);
    }

    // names are case-insensitive
    let e = fs.get_entry(Some(FAT_ROOT_INODE), Some("data.bin")).unwrap();
    assert!(e.inode.is_some());
    assert_eq!(e.etype, VfsEntryType::File);

    let e = fs.get_entry(Some(FAT_ROOT_INODE), Some("SUB")).unwrap();
    assert_eq!(e.inode, Some(sub));
    assert_eq!(e.etype, VfsEntryType::Dir);

    let e = fs.get_entry(Some(FAT_ROOT_INODE), Some("WEIRD")).unwrap();
    assert_eq!(e.inode, Some(FAT_ROOT_INODE));

    let e = fs.get_entry(Some(FAT_ROOT_INODE), Some("MISSING")).unwrap();
    assert_eq!(e.inode, None);
    assert_eq!(e.etype, VfsEntryType::None);
}

#[test]
fn test_open_error_paths() {
    let mut b = ImageBuilder::fat12();
    b.add_root_file(b"DATA    BIN", &[2], 100);
    let fs = b.mount();

    let missing = fs.get_entry(Some(FAT_ROOT_INODE), Some("NOPE")).unwrap();
    assert_eq!(
        fs.open(&missing, OpenFlags::O_RDONLY, 0).unwrap_err(),
        Errno::ENOENT
    );
    assert_eq!(
        fs.open(&missing, OpenFlags::O_CREAT, 0).unwrap_err(),
        Errno::EROFS
    );

    let existing = fs.get_entry(Some(FAT_ROOT_INODE), Some("DATA.BIN")).unwrap();
    assert_eq!(
        fs.open(&existing, OpenFlags::O_CREAT | OpenFlags::O_EXCL, 0)
            .unwrap_err(),
        Errno::EEXIST
    );
    assert_eq!(
        fs.open(&existing, OpenFlags::O_WRONLY, 0).unwrap_err(),
        Errno::EROFS
    );

    let mut h = fs.open(&existing, OpenFlags::O_RDONLY, 0).unwrap();
    assert_eq!(h.write(b"x").unwrap_err(), Errno::EBADF);
}

#[test]
fn test_stat_fields() {
    let mut b = ImageBuilder::fat12();
    let ino = b.add_root_file(b"DATA    BIN", &[2, 3, 4], 10000);
    let fs = b.mount();

    let st = fs.stat(ino).unwrap();
    assert_eq!(st.st_ino, ino);
    assert_eq!(st.st_mode, 0o555 | S_IFREG);
    assert_eq!(st.st_nlink, 1);
    assert_eq!(st.st_size, 10000);
    assert_eq!(st.st_blksize, 4096);
    assert_eq!(st.st_blocks, 10000 / 512);
    assert_eq!(st.st_dev, fs.device_id() as u64);

    // 2003-09-15 13:45:30 UTC
    assert_eq!(st.st_mtime, 1063633530);
    assert_eq!(st.st_atime, st.st_mtime);
    assert_eq!(st.st_ctime, st.st_mtime); // tenths add no whole second here

    let st = fs.stat(FAT_ROOT_INODE).unwrap();
    assert_eq!(st.st_mode, 0o555 | S_IFDIR);
}

#[test]
fn test_long_filenames_roundtrip() {
    let mut b = ImageBuilder::fat12();
    b.add_root_lfn_file("A Long Filename.txt", b"ALONGF~1TXT", &[2], 64);
    let fs = b.mount();

    // lookup by long name is case-insensitive
    let e = fs
        .get_entry(Some(FAT_ROOT_INODE), Some("a long filename.TXT"))
        .unwrap();
    assert!(e.inode.is_some());

    // the short alias resolves too
    let e2 = fs
        .get_entry(Some(FAT_ROOT_INODE), Some("ALONGF~1.TXT"))
        .unwrap();
    assert_eq!(e2.inode, e.inode);

    // enumeration reports the long name
    let entry = fs.get_entry(None, None).unwrap();
    let mut h = fs.open(&entry, OpenFlags::O_RDONLY, 0).unwrap();

    let mut names = Vec::new();
    h.getdents(&mut |d| {
        names.push(d.name.to_string());
        Ok(core::ops::ControlFlow::Continue(()))
    })
    .unwrap();

    assert_eq!(names, vec!["A Long Filename.txt".to_string()]);
}

#[test]
fn test_subdirectory_walk_through_vfs() {
    let mut b = ImageBuilder::fat12();
    b.add_root_dir(b"SUB        ", 5);
    let file_raw = ImageBuilder::dirent(b"INNER   TXT", FatAttrs::ARCHIVE, 6, 26);
    b.add_entry_in_dir(5, file_raw);
    b.chain(&[6]);
    let bpb = b.bpb();
    let off = bpb.cluster_offset(6);
    b.img[off..off + 26].copy_from_slice(b"abcdefghijklmnopqrstuvwxyz");
    let fs = b.mount();

    let root: FsRef = fs;
    let vfs = Vfs::new(root);

    let mut h = vfs.open("/SUB/INNER.TXT", OpenFlags::O_RDONLY, 0).unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(h.read(&mut buf).unwrap(), 26);
    assert_eq!(&buf[..26], b"abcdefghijklmnopqrstuvwxyz");

    assert_eq!(
        vfs.open("/SUB/MISSING", OpenFlags::O_RDONLY, 0).unwrap_err(),
        Errno::ENOENT
    );
    assert_eq!(
        vfs.open("/NOSUCH/INNER.TXT", OpenFlags::O_RDONLY, 0)
            .unwrap_err(),
        Errno::ENOENT
    );

    let st = vfs.stat64("/SUB/INNER.TXT").unwrap();
    assert_eq!(st.st_size, 26);
}

#[test]
fn test_getdents64_enumerates_root_exactly_once() {
    // P8 over the FAT root with mixed short and long names
    let mut b = ImageBuilder::fat12();
    b.add_root_file(b"ALPHA   TXT", &[2], 4);
    b.add_root_lfn_file("second file.dat", b"SECOND~1DAT", &[3], 4);
    b.add_root_file(b"GAMMA   TXT", &[4], 4);
    let fs = b.mount();

    let entry = fs.get_entry(None, None).unwrap();
    let mut h = fs.open(&entry, OpenFlags::O_RDONLY, 0).unwrap();

    let mut names = Vec::new();
    let mut buf = vec![0u8; 512];

    loop {
        let n = vfs_getdents64(h.as_mut(), buf.as_mut_ptr(), buf.len() as u32).unwrap();
        if n == 0 {
            break;
        }

        let mut off = 0usize;
        while off < n as usize {
            let reclen =
                u16::from_le_bytes([buf[off + 16], buf[off + 17]]) as usize;
            let name_start = off + 19;
            let name_end = buf[name_start..off + reclen]
                .iter()
                .position(|&c| c == 0)
                .unwrap()
                + name_start;
            names.push(
                core::str::from_utf8(&buf[name_start..name_end])
                    .unwrap()
                    .to_string(),
            );
            off += reclen;
        }
    }

    assert_eq!(
        names,
        vec![
            "ALPHA.TXT".to_string(),
            "second file.dat".to_string(),
            "GAMMA.TXT".to_string()
        ]
    );
}

#[test]
fn test_fat16_read() {
    let mut b = ImageBuilder::fat16();
    // a file spanning three 512-byte clusters
    b.add_root_file(b"WIDE    BIN", &[2, 3, 4], 1200);
    let fs = b.mount();

    let mut h = open_root_child(&fs, "WIDE.BIN");
    let mut buf = vec![0u8; 2048];
    assert_eq!(h.read(&mut buf).unwrap(), 1200);
    assert_eq!(&buf[..1200], &ImageBuilder::expected_pattern(1200)[..]);
}

#[test]
fn test_fat32_root_chain_and_high_cluster_bits() {
    let mut b = ImageBuilder::fat32();
    // cluster 70000 needs the high 16 bits of the cluster number
    b.add_root_file(b"BIG     BIN", &[70000, 70001], 700);
    b.add_root_dir(b"LOOP       ", 2); // first cluster == root cluster
    let fs = b.mount();

    let mut h = open_root_child(&fs, "BIG.BIN");
    let mut buf = vec![0u8; 1024];
    assert_eq!(h.read(&mut buf).unwrap(), 700);
    assert_eq!(&buf[..700], &ImageBuilder::expected_pattern(700)[..]);

    // a subdirectory pointing at the root cluster canonicalizes to root
    let e = fs.get_entry(Some(FAT_ROOT_INODE), Some("LOOP")).unwrap();
    assert_eq!(e.inode, Some(FAT_ROOT_INODE));
}

#[test]
fn test_getdents_on_file_is_enotdir() {
    let mut b = ImageBuilder::fat12();
    b.add_root_file(b"DATA    BIN", &[2], 10);
    let fs = b.mount();

    let mut h = open_root_child(&fs, "DATA.BIN");
    let err = h
        .getdents(&mut |_| Ok(core::ops::ControlFlow::Continue(())))
        .unwrap_err();
    assert_eq!(err, Errno::ENOTDIR);
}
