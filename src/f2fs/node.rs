use std::mem::size_of;

use static_assertions::const_assert_eq;

use crate::device::BLOCK_SIZE;

pub const F2FS_NAME_LEN: usize = 255;
pub const DEF_ADDRS_PER_INODE: usize = 923;
pub const NR_DENTRY_IN_BLOCK: usize = 214;
pub const DENTRY_NAME_LEN: usize = 8;
const DENTRY_BITMAP_SIZE: usize = 27;
const DENTRY_RESERVED_SIZE: usize = 3;

pub const F2FS_FT_DIR: u8 = 2;

/// A contiguous extent cached in the inode.
#[repr(C, packed)]
#[derive(Copy, Clone, Default)]
pub struct Extent {
    pub fofs: u32,
    pub blk_addr: u32,
    pub len: u32,
}

/// On-disk inode record, stored at the head of a node block.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct Inode {
    pub i_mode: u16,
    pub i_advise: u8,
    pub i_inline: u8,
    pub i_uid: u32,
    pub i_gid: u32,
    pub i_links: u32,
    pub i_size: u64,
    pub i_blocks: u64,
    pub i_atime: u64,
    pub i_ctime: u64,
    pub i_mtime: u64,
    pub i_atime_nsec: u32,
    pub i_ctime_nsec: u32,
    pub i_mtime_nsec: u32,
    pub i_generation: u32,
    pub i_current_depth: u32,
    pub i_xattr_nid: u32,
    pub i_flags: u32,
    pub i_pino: u32,
    pub i_namelen: u32,
    pub i_name: [u8; F2FS_NAME_LEN],
    pub i_dir_level: u8,
    pub i_ext: Extent,
    pub i_addr: [u32; DEF_ADDRS_PER_INODE],
    pub i_nid: [u32; 5],
}

const_assert_eq!(size_of::<Inode>(), 4072);

/// Trailer of every node block, linking it to its inode and checkpoint version.
#[repr(C, packed)]
#[derive(Copy, Clone, Default)]
pub struct NodeFooter {
    pub nid: u32,
    pub ino: u32,
    pub flag: u32,
    pub cp_ver: u64,
    pub next_blkaddr: u32,
}

const_assert_eq!(size_of::<NodeFooter>(), 24);

/// A whole 4 KiB node block. Only the inode form is ever built here; direct and indirect node
/// forms share the same footer layout.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct Node {
    pub i: Inode,
    pub footer: NodeFooter,
}

const_assert_eq!(size_of::<Node>(), BLOCK_SIZE);

impl Node {
    pub fn new() -> Self {
        // SAFETY: all-zero bytes are a valid Node
        unsafe { std::mem::zeroed() }
    }
}

/// One directory entry; its name lives in the parallel `filename` table of the dentry block.
#[repr(C, packed)]
#[derive(Copy, Clone, Default)]
pub struct DirEntry {
    pub hash_code: u32,
    pub ino: u32,
    pub name_len: u16,
    pub file_type: u8,
}

const_assert_eq!(size_of::<DirEntry>(), 11);

/// A 4 KiB block of directory entries with their occupancy bitmap and name table.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct DentryBlock {
    pub dentry_bitmap: [u8; DENTRY_BITMAP_SIZE],
    pub reserved: [u8; DENTRY_RESERVED_SIZE],
    pub dentry: [DirEntry; NR_DENTRY_IN_BLOCK],
    pub filename: [[u8; DENTRY_NAME_LEN]; NR_DENTRY_IN_BLOCK],
}

const_assert_eq!(size_of::<DentryBlock>(), BLOCK_SIZE);

impl DentryBlock {
    pub fn new() -> Self {
        // SAFETY: all-zero bytes are a valid DentryBlock
        unsafe { std::mem::zeroed() }
    }

    /// Fills entry `slot` and marks it in the bitmap.
    pub fn add_entry(&mut self, slot: usize, ino: u32, name: &[u8], file_type: u8) {
        assert!(name.len() <= DENTRY_NAME_LEN);
        self.dentry[slot] = DirEntry {
            hash_code: 0,
            ino,
            name_len: name.len() as u16,
            file_type,
        };
        self.filename[slot][..name.len()].copy_from_slice(name);
        crate::f2fs::set_bit_le(&mut self.dentry_bitmap, slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::f2fs::struct_block;

    #[test]
    fn root_dentries_occupy_the_first_two_slots() {
        let mut dent = DentryBlock::new();
        dent.add_entry(0, 3, b".", F2FS_FT_DIR);
        dent.add_entry(1, 3, b"..", F2FS_FT_DIR);

        assert_eq!({ dent.dentry_bitmap }[0], 0b11);
        // SAFETY: DentryBlock is a packed plain-data record
        let block = unsafe { struct_block(&dent) };
        // entry 0 starts after bitmap and reserved bytes
        let dentry0 = DENTRY_BITMAP_SIZE + DENTRY_RESERVED_SIZE;
        assert_eq!(&block[dentry0 + 4..dentry0 + 8], &[3, 0, 0, 0]);
        assert_eq!(block[dentry0 + 10], F2FS_FT_DIR);
        // the name table follows all dentries
        let names = dentry0 + NR_DENTRY_IN_BLOCK * size_of::<DirEntry>();
        assert_eq!(block[names], b'.');
        assert_eq!(&block[names + 8..names + 10], b"..");
    }
}
