use std::convert::TryInto;

use static_assertions::const_assert_eq;

use crate::alfs::Pba;
use crate::device::BLOCK_SIZE;

/// Number of logical→physical entries per mapping block. Together with the four header fields this
/// fills a 4 KiB block exactly.
pub const NR_MAPPING_ROOMS: usize = 1020;

const MAP_BLK_MAGIC: u32 = 0xEF;
const NO_MAPPING: u32 = u32::MAX;
const HEADER_FIELDS: usize = 4;

const_assert_eq!((HEADER_FIELDS + NR_MAPPING_ROOMS) * 4, BLOCK_SIZE);

/// One 4 KiB record of the persistent mapping table: four little-endian u32 header fields followed
/// by `NR_MAPPING_ROOMS` little-endian u32 entries. An entry of 0xFFFFFFFF means "no mapping".
/// The on-disk copy with the highest `ver` wins on load; `dirty` marks an in-memory copy that
/// diverged from disk.
#[derive(Clone, PartialEq, Eq)]
pub struct MapBlk {
    pub magic: u32,
    pub ver: u32,
    pub index: u32,
    pub dirty: u32,
    pub mapping: [u32; NR_MAPPING_ROOMS],
}

impl MapBlk {
    /// An empty mapping block covering logical blocks `[slot * 1020, (slot + 1) * 1020)`. It
    /// starts out dirty: nothing on disk matches it yet.
    pub fn new(slot: u32) -> Self {
        Self {
            magic: MAP_BLK_MAGIC,
            ver: 0,
            index: slot * NR_MAPPING_ROOMS as u32,
            dirty: 1,
            mapping: [NO_MAPPING; NR_MAPPING_ROOMS],
        }
    }

    pub fn decode(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), BLOCK_SIZE);
        let word = |idx: usize| u32::from_le_bytes(bytes[idx * 4..idx * 4 + 4].try_into().unwrap());

        let mut mapping = [NO_MAPPING; NR_MAPPING_ROOMS];
        for (room, entry) in mapping.iter_mut().enumerate() {
            *entry = word(HEADER_FIELDS + room);
        }
        Self {
            magic: word(0),
            ver: word(1),
            index: word(2),
            dirty: word(3),
            mapping,
        }
    }

    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut bytes = [0u8; BLOCK_SIZE];
        let header = [self.magic, self.ver, self.index, self.dirty];
        let words = header.iter().chain(self.mapping.iter());
        for (idx, word) in words.enumerate() {
            bytes[idx * 4..idx * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// A block whose magic does not match is free space or garbage and is skipped on load.
    pub fn is_valid(&self) -> bool {
        self.magic == MAP_BLK_MAGIC
    }

    pub fn entry(&self, room: usize) -> Option<Pba> {
        match self.mapping[room] {
            NO_MAPPING => None,
            pba => Some(pba),
        }
    }

    pub fn set_entry(&mut self, room: usize, pba: Pba) {
        assert_ne!(pba, NO_MAPPING);
        self.mapping[room] = pba;
        self.dirty = 1;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty != 0
    }

    pub fn entries(&self) -> impl Iterator<Item = Pba> + '_ {
        self.mapping.iter().copied().filter(|&entry| entry != NO_MAPPING)
    }
}
