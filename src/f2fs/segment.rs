use std::mem::size_of;

use static_assertions::const_assert_eq;

use crate::device::BLOCK_SIZE;
use crate::f2fs::checkpoint::Checkpoint;
use crate::f2fs::nat::NatEntry;
use crate::f2fs::superblock::SuperBlock;
use crate::f2fs::{
    set_bit_msb, struct_block, CURSEG_COLD_DATA, CURSEG_COLD_NODE, CURSEG_HOT_DATA, CURSEG_HOT_NODE,
    CURSEG_WARM_DATA, CURSEG_WARM_NODE,
};

pub const ENTRIES_IN_SUM: usize = 512;
pub const SUMMARY_SIZE: usize = 7;
const SUM_FOOTER_SIZE: usize = 5;
/// Bytes of one journal image inside a summary block: everything not taken by the summary entries
/// and the footer, halved between the NAT and SIT journals in the compact layout.
pub const SUM_JOURNAL_SIZE: usize = BLOCK_SIZE - SUM_FOOTER_SIZE - ENTRIES_IN_SUM * SUMMARY_SIZE;

const NAT_JOURNAL_ENTRIES: usize = (SUM_JOURNAL_SIZE - 2) / size_of::<NatJournalEntry>();
const NAT_JOURNAL_RESERVED: usize = SUM_JOURNAL_SIZE - 2 - NAT_JOURNAL_ENTRIES * size_of::<NatJournalEntry>();
const SIT_JOURNAL_ENTRIES: usize = (SUM_JOURNAL_SIZE - 2) / size_of::<SitJournalEntry>();
const SIT_JOURNAL_RESERVED: usize = SUM_JOURNAL_SIZE - 2 - SIT_JOURNAL_ENTRIES * size_of::<SitJournalEntry>();

pub const SUM_TYPE_DATA: u8 = 0;
pub const SUM_TYPE_NODE: u8 = 1;

pub const SIT_VBLOCKS_SHIFT: u16 = 10;

/// Summary of one block in the main area: the node it belongs to and where inside it.
#[repr(C, packed)]
#[derive(Copy, Clone, Default)]
pub struct Summary {
    pub nid: u32,
    pub version: u8,
    pub ofs_in_node: u16,
}

const_assert_eq!(size_of::<Summary>(), SUMMARY_SIZE);

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct SummaryFooter {
    pub entry_type: u8,
    pub check_sum: u32,
}

const_assert_eq!(size_of::<SummaryFooter>(), SUM_FOOTER_SIZE);

/// One segment-info-table entry as journaled in a summary block.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct SitEntry {
    pub vblocks: u16,
    pub valid_map: [u8; 64],
    pub mtime: u64,
}

const_assert_eq!(size_of::<SitEntry>(), 74);

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct NatJournalEntry {
    pub nid: u32,
    pub ne: NatEntry,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct SitJournalEntry {
    pub segno: u32,
    pub se: SitEntry,
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct NatJournal {
    pub n_nats: u16,
    pub entries: [NatJournalEntry; NAT_JOURNAL_ENTRIES],
    pub reserved: [u8; NAT_JOURNAL_RESERVED],
}

#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct SitJournal {
    pub n_sits: u16,
    pub entries: [SitJournalEntry; SIT_JOURNAL_ENTRIES],
    pub reserved: [u8; SIT_JOURNAL_RESERVED],
}

const_assert_eq!(size_of::<NatJournal>(), SUM_JOURNAL_SIZE);
const_assert_eq!(size_of::<SitJournal>(), SUM_JOURNAL_SIZE);

/// Builds the summary block of one node log: all entries empty except, for the hot node log, the
/// root inode in slot 0.
pub fn node_summary_block(root_nid: Option<u32>) -> [u8; BLOCK_SIZE] {
    let mut block = [0u8; BLOCK_SIZE];
    if let Some(nid) = root_nid {
        let entry = Summary { nid, version: 0, ofs_in_node: 0 };
        // SAFETY: Summary is a packed plain-data record
        let bytes = unsafe { struct_block(&entry) };
        block[..SUMMARY_SIZE].copy_from_slice(&bytes[..SUMMARY_SIZE]);
    }
    block[BLOCK_SIZE - SUM_FOOTER_SIZE] = SUM_TYPE_NODE;
    block
}

/// Builds the compact summary block covering all three data logs:
///
/// ```text
/// +-------------------+
/// | nat journal       |
/// +-------------------+
/// | sit journal       |
/// +-------------------+
/// | hot data summary  |
/// | warm data summary |
/// | cold data summary |
/// +-------------------+
/// ```
///
/// The NAT journal seeds the root inode's address, the SIT journal the occupancy of all six
/// starting segments.
pub fn compact_data_summary_block(sb: &SuperBlock, cp: &Checkpoint) -> [u8; BLOCK_SIZE] {
    let root_node_addr = sb.main_blkaddr + { cp.cur_node_segno }[0] * sb.blks_per_seg();

    // SAFETY: all-zero bytes are valid journal records
    let mut nat_journal: NatJournal = unsafe { std::mem::zeroed() };
    nat_journal.n_nats = 1;
    nat_journal.entries[0] = NatJournalEntry {
        nid: sb.root_ino,
        ne: NatEntry {
            version: 0,
            ino: sb.root_ino,
            block_addr: root_node_addr,
        },
    };

    // SAFETY: as above
    let mut sit_journal: SitJournal = unsafe { std::mem::zeroed() };
    sit_journal.n_sits = 6;
    let logs = [
        (0, { cp.cur_node_segno }[0], CURSEG_HOT_NODE, 1u16),
        (1, { cp.cur_node_segno }[1], CURSEG_WARM_NODE, 0),
        (2, { cp.cur_node_segno }[2], CURSEG_COLD_NODE, 0),
        (3, { cp.cur_data_segno }[0], CURSEG_HOT_DATA, 1),
        (4, { cp.cur_data_segno }[1], CURSEG_WARM_DATA, 0),
        (5, { cp.cur_data_segno }[2], CURSEG_COLD_DATA, 0),
    ];
    for (slot, segno, curseg_type, used_blocks) in logs {
        let mut entry = SitJournalEntry {
            segno,
            se: SitEntry {
                vblocks: ((curseg_type as u16) << SIT_VBLOCKS_SHIFT) | used_blocks,
                valid_map: [0; 64],
                mtime: 0,
            },
        };
        if used_blocks != 0 {
            let mut valid_map = [0u8; 64];
            set_bit_msb(&mut valid_map, 0);
            entry.se.valid_map = valid_map;
        }
        sit_journal.entries[slot] = entry;
    }

    let mut block = [0u8; BLOCK_SIZE];
    // SAFETY: NatJournal and SitJournal are packed plain-data records
    let nat_bytes = unsafe { struct_block(&nat_journal) };
    let sit_bytes = unsafe { struct_block(&sit_journal) };
    block[..SUM_JOURNAL_SIZE].copy_from_slice(&nat_bytes[..SUM_JOURNAL_SIZE]);
    block[SUM_JOURNAL_SIZE..2 * SUM_JOURNAL_SIZE].copy_from_slice(&sit_bytes[..SUM_JOURNAL_SIZE]);

    // hot data summary: the root dentry block; warm and cold stay empty
    let root_summary = Summary {
        nid: sb.root_ino,
        version: 0,
        ofs_in_node: 0,
    };
    // SAFETY: Summary is a packed plain-data record
    let summary_bytes = unsafe { struct_block(&root_summary) };
    block[2 * SUM_JOURNAL_SIZE..2 * SUM_JOURNAL_SIZE + SUMMARY_SIZE].copy_from_slice(&summary_bytes[..SUMMARY_SIZE]);
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::f2fs::{FormatParams, DEFAULT_SECTOR_SIZE};

    #[test]
    fn journal_capacities_match_the_block_budget() {
        assert_eq!(SUM_JOURNAL_SIZE, 507);
        assert_eq!(NAT_JOURNAL_ENTRIES, 38);
        assert_eq!(SIT_JOURNAL_ENTRIES, 6);
    }

    #[test]
    fn node_summary_carries_the_root_in_slot_zero() {
        let block = node_summary_block(Some(3));
        assert_eq!(&block[..4], &[3, 0, 0, 0]);
        assert_eq!(block[BLOCK_SIZE - SUM_FOOTER_SIZE], SUM_TYPE_NODE);

        let empty = node_summary_block(None);
        assert!(empty[..4].iter().all(|&byte| byte == 0));
        assert_eq!(empty[BLOCK_SIZE - SUM_FOOTER_SIZE], SUM_TYPE_NODE);
    }

    #[test]
    fn compact_summary_seeds_root_nat_and_sit() {
        let (sb, layout) =
            SuperBlock::prepare(&FormatParams::default(), 256 * 1024 * 1024 / DEFAULT_SECTOR_SIZE).unwrap();
        let cp = Checkpoint::build(&sb, &layout, 5.0);
        let block = compact_data_summary_block(&sb, &cp);

        // nat journal: one entry for the root inode
        assert_eq!(&block[..2], &[1, 0]);
        assert_eq!(&block[2..6], &[3, 0, 0, 0]);
        // sit journal: six entries
        assert_eq!(&block[SUM_JOURNAL_SIZE..SUM_JOURNAL_SIZE + 2], &[6, 0]);
        // hot data summary names the root inode
        assert_eq!(&block[2 * SUM_JOURNAL_SIZE..2 * SUM_JOURNAL_SIZE + 4], &[3, 0, 0, 0]);
    }
}
