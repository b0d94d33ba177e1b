use std::convert::TryInto;
use std::mem::size_of;

use log::info;
use static_assertions::const_assert_eq;

use crate::device::BLOCK_SIZE;
use crate::f2fs::superblock::{MainLayout, SuperBlock};
use crate::f2fs::{
    cal_crc32, struct_block, struct_from_bytes, CHECKSUM_OFFSET, CP_COMPACT_SUM_FLAG, CP_UMOUNT_FLAG,
    CURSEG_COLD_DATA, CURSEG_COLD_NODE, CURSEG_HOT_DATA, CURSEG_HOT_NODE, CURSEG_WARM_DATA, CURSEG_WARM_NODE,
};

const MAX_ACTIVE_NODE_LOGS: usize = 8;
const MAX_ACTIVE_DATA_LOGS: usize = 8;
const MAX_ACTIVE_LOGS: usize = 16;

/// On-disk checkpoint record. It occupies the head of a 4 KiB block whose tail carries a CRC at a
/// fixed offset; the space in between belongs to the version bitmaps.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct Checkpoint {
    pub checkpoint_ver: u64,
    pub user_block_count: u64,
    pub valid_block_count: u64,
    pub rsvd_segment_count: u32,
    pub overprov_segment_count: u32,
    pub free_segment_count: u32,
    pub cur_node_segno: [u32; MAX_ACTIVE_NODE_LOGS],
    pub cur_node_blkoff: [u16; MAX_ACTIVE_NODE_LOGS],
    pub cur_data_segno: [u32; MAX_ACTIVE_DATA_LOGS],
    pub cur_data_blkoff: [u16; MAX_ACTIVE_DATA_LOGS],
    pub ckpt_flags: u32,
    pub cp_pack_total_block_count: u32,
    pub cp_pack_start_sum: u32,
    pub valid_node_count: u32,
    pub valid_inode_count: u32,
    pub next_free_nid: u32,
    pub sit_ver_bitmap_bytesize: u32,
    pub nat_ver_bitmap_bytesize: u32,
    pub checksum_offset: u32,
    pub elapsed_time: u64,
    pub alloc_type: [u8; MAX_ACTIVE_LOGS],
    pub sit_nat_version_bitmap: [u8; 1],
}

const_assert_eq!(size_of::<Checkpoint>(), 193);

impl Checkpoint {
    /// The checkpoint a fresh format carries: version 1, the root directory as the only payload,
    /// and all six active logs sitting on their starting segments.
    pub fn build(sb: &SuperBlock, layout: &MainLayout, overprovision: f64) -> Self {
        // SAFETY: all-zero bytes are a valid Checkpoint
        let mut cp: Self = unsafe { std::mem::zeroed() };
        cp.checkpoint_ver = 1;
        cp.cur_node_segno[0] = layout.cur_seg[CURSEG_HOT_NODE];
        cp.cur_node_segno[1] = layout.cur_seg[CURSEG_WARM_NODE];
        cp.cur_node_segno[2] = layout.cur_seg[CURSEG_COLD_NODE];
        cp.cur_data_segno[0] = layout.cur_seg[CURSEG_HOT_DATA];
        cp.cur_data_segno[1] = layout.cur_seg[CURSEG_WARM_DATA];
        cp.cur_data_segno[2] = layout.cur_seg[CURSEG_COLD_DATA];
        for idx in 3..MAX_ACTIVE_NODE_LOGS {
            cp.cur_node_segno[idx] = u32::MAX;
            cp.cur_data_segno[idx] = u32::MAX;
        }

        // one node block and one dentry block exist: the root directory
        cp.cur_node_blkoff[0] = 1;
        cp.cur_data_blkoff[0] = 1;
        cp.valid_block_count = 2;
        cp.rsvd_segment_count = layout.reserved_segments;
        cp.overprov_segment_count = ((sb.segment_count_main - cp.rsvd_segment_count) as f64 * overprovision
            / 100.0) as u32
            + cp.rsvd_segment_count;

        info!("overprovision ratio = {:.3}%", overprovision);
        info!(
            "overprovision segments = {} (GC reserved = {})",
            { cp.overprov_segment_count },
            { cp.rsvd_segment_count }
        );

        // main segments minus the six logs currently in use
        cp.free_segment_count = sb.segment_count_main - 6;
        cp.user_block_count =
            u64::from(cp.free_segment_count + 6 - cp.overprov_segment_count) * u64::from(sb.blks_per_seg());
        // checkpoint head and tail, one compact data summary, three node summaries
        cp.cp_pack_total_block_count = 6 + sb.cp_payload;
        cp.ckpt_flags = CP_UMOUNT_FLAG | CP_COMPACT_SUM_FLAG;
        cp.cp_pack_start_sum = 1 + sb.cp_payload;
        cp.valid_node_count = 1;
        cp.valid_inode_count = 1;
        cp.next_free_nid = sb.root_ino + 1;
        cp.sit_ver_bitmap_bytesize = ((sb.segment_count_sit / 2) << sb.log_blocks_per_seg) / 8;
        cp.nat_ver_bitmap_bytesize = ((sb.segment_count_nat / 2) << sb.log_blocks_per_seg) / 8;
        cp.checksum_offset = CHECKSUM_OFFSET as u32;
        cp
    }

    /// Serializes the checkpoint into its block, stamping the CRC over everything before the
    /// checksum offset.
    pub fn to_block(&self) -> [u8; BLOCK_SIZE] {
        // SAFETY: Checkpoint is a packed plain-data record
        let mut block = unsafe { struct_block(self) };
        let crc = cal_crc32(&block[..CHECKSUM_OFFSET]);
        block[CHECKSUM_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        block
    }

    /// Deserializes and CRC-checks a checkpoint block; None when the block is torn or was never
    /// written.
    pub fn parse(block: &[u8]) -> Option<Self> {
        assert_eq!(block.len(), BLOCK_SIZE);
        let stored = u32::from_le_bytes(block[CHECKSUM_OFFSET..].try_into().unwrap());
        if stored != cal_crc32(&block[..CHECKSUM_OFFSET]) {
            return None;
        }
        // SAFETY: Checkpoint is a packed plain-data record and any bit pattern is a value
        Some(unsafe { struct_from_bytes(block) })
    }
}
