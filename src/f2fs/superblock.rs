use std::convert::TryFrom;
use std::mem::size_of;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use static_assertions::const_assert_eq;
use uuid::Uuid;

use crate::device::{Device, BLOCK_SIZE};
use crate::error::AlfsError;
use crate::f2fs::format::FormatParams;
use crate::f2fs::{
    struct_from_bytes, Checkpoint, CHECKSUM_OFFSET, CURSEG_COLD_DATA, CURSEG_COLD_NODE, CURSEG_HOT_DATA,
    CURSEG_HOT_NODE, CURSEG_WARM_DATA, CURSEG_WARM_NODE, DEFAULT_BLOCKS_PER_SEGMENT, DEFAULT_SECTOR_SIZE,
    F2FS_MAGIC, F2FS_MAJOR_VERSION, F2FS_MINOR_VERSION, F2FS_SUPER_OFFSET, MAX_SIT_BITMAP_SIZE, META_INO,
    NAT_ENTRY_PER_BLOCK, NODE_INO, NR_CHECKPOINT_PACKS, NR_CURSEG_TYPE, ROOT_INO, SIT_ENTRY_PER_BLOCK,
};
use crate::geometry::{Geometry, NR_MAPPING_SECS, NR_METALOG_TIMES, NR_SUPERBLK_SECS};

pub const MAX_VOLUME_NAME: usize = 512;
pub const MAX_EXTENSIONS: usize = 64;
pub const EXTENSION_LEN: usize = 8;
pub const VERSION_LEN: usize = 256;

/// On-disk superblock of the base FS, little-endian throughout. Emitted twice at the device start;
/// the indirection core only ever reads the geometry fields out of it.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct SuperBlock {
    pub magic: u32,
    pub major_ver: u16,
    pub minor_ver: u16,
    pub log_sectorsize: u32,
    pub log_sectors_per_block: u32,
    pub log_blocksize: u32,
    pub log_blocks_per_seg: u32,
    pub segs_per_sec: u32,
    pub secs_per_zone: u32,
    pub checksum_offset: u32,
    pub block_count: u64,
    pub section_count: u32,
    pub segment_count: u32,
    pub segment_count_ckpt: u32,
    pub segment_count_sit: u32,
    pub segment_count_nat: u32,
    pub segment_count_ssa: u32,
    pub segment_count_main: u32,
    pub segment0_blkaddr: u32,
    pub cp_blkaddr: u32,
    pub sit_blkaddr: u32,
    pub nat_blkaddr: u32,
    pub ssa_blkaddr: u32,
    pub main_blkaddr: u32,
    pub root_ino: u32,
    pub node_ino: u32,
    pub meta_ino: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u16; MAX_VOLUME_NAME],
    pub extension_count: u32,
    pub extension_list: [[u8; EXTENSION_LEN]; MAX_EXTENSIONS],
    pub cp_payload: u32,
    pub version: [u8; VERSION_LEN],
    pub init_version: [u8; VERSION_LEN],
    pub feature: u32,
    pub encryption_level: u8,
    pub encrypt_pw_salt: [u8; 16],
    pub reserved: [u8; 871],
}

const_assert_eq!(size_of::<SuperBlock>(), 3072);

/// Placement decisions for the main area that the formatter needs beyond the superblock fields:
/// where each active log starts and how much is held back.
pub struct MainLayout {
    pub cur_seg: [u32; NR_CURSEG_TYPE],
    pub total_zones: u32,
    pub reserved_segments: u32,
}

/// Default media file extensions marked for cold separation.
const MEDIA_EXTENSIONS: [&str; 23] = [
    "jpg", "gif", "png", "avi", "divx", "mp4", "mp3", "3gp", "wmv", "wma", "mpeg", "mkv", "mov", "asx", "asf",
    "wm", "mpg", "mpe", "rm", "ogg", "jpeg", "video", "apk",
];

impl SuperBlock {
    /// Derives the whole on-device layout from the device size and the format options: the meta
    /// area segment counts, the over-provisioned meta-log shift of the main area, and the active
    /// log placement. Fails when the device cannot hold a usable filesystem.
    pub fn prepare(params: &FormatParams, total_sectors: u64) -> Result<(Self, MainLayout)> {
        let blks_per_seg = DEFAULT_BLOCKS_PER_SEGMENT;
        let segs_per_sec = params.segs_per_sec;
        let secs_per_zone = params.secs_per_zone;
        if segs_per_sec == 0 || secs_per_zone == 0 {
            return Err(AlfsError::Configuration(
                "segments per section and sections per zone must not be zero".to_string(),
            )
            .into());
        }
        let segs_per_zone = segs_per_sec * secs_per_zone;
        let segment_size_bytes = u64::from(blks_per_seg) * BLOCK_SIZE as u64;

        // SAFETY: This allows us to skip initializing a ton of fields to zero, but
        // CAUTION: some initialization steps rely on other fields already having been set,
        // so pay attention when refactoring/reordering steps.
        let mut sb: Self = unsafe { std::mem::zeroed() };
        sb.magic = F2FS_MAGIC;
        sb.major_ver = F2FS_MAJOR_VERSION;
        sb.minor_ver = F2FS_MINOR_VERSION;
        sb.log_sectorsize = 9;
        sb.log_sectors_per_block = 3;
        sb.log_blocksize = 12;
        sb.log_blocks_per_seg = 9;
        sb.segs_per_sec = segs_per_sec;
        sb.secs_per_zone = secs_per_zone;
        sb.checksum_offset = 0;

        // the superblock and mapping sections push the first segment back; everything before
        // segment 0 belongs to the indirection layer
        let zone_align_start_offset = segment_size_bytes * u64::from(segs_per_sec * (NR_SUPERBLK_SECS + NR_MAPPING_SECS));

        let device_bytes = total_sectors * DEFAULT_SECTOR_SIZE;
        if device_bytes <= zone_align_start_offset {
            return Err(AlfsError::Configuration(format!(
                "device of {} sectors ends inside the indirection regions",
                total_sectors
            ))
            .into());
        }
        let segment_count = u32::try_from(
            (device_bytes - zone_align_start_offset) / segment_size_bytes / u64::from(segs_per_zone)
                * u64::from(segs_per_zone),
        )
        .context("Device too large, its segment count does not fit into a u32")?;
        sb.segment_count = segment_count;
        sb.segment0_blkaddr = u32::try_from(zone_align_start_offset / BLOCK_SIZE as u64).unwrap();
        sb.block_count = u64::from(segment_count) * u64::from(blks_per_seg);
        info!("zone aligned segment0 blkaddr: {}", { sb.segment0_blkaddr });

        sb.cp_blkaddr = sb.segment0_blkaddr;
        sb.segment_count_ckpt = NR_CHECKPOINT_PACKS;

        sb.sit_blkaddr = sb.segment0_blkaddr + sb.segment_count_ckpt * blks_per_seg;
        let blocks_for_sit = ceil_div(segment_count, SIT_ENTRY_PER_BLOCK);
        sb.segment_count_sit = ceil_div(blocks_for_sit, blks_per_seg) * 2;

        sb.nat_blkaddr = sb.sit_blkaddr + sb.segment_count_sit * blks_per_seg;
        let meta_so_far = sb.segment_count_ckpt + sb.segment_count_sit;
        if segment_count <= meta_so_far {
            return Err(AlfsError::Configuration("device too small for SIT and checkpoint areas".to_string()).into());
        }
        let valid_blks_available = (segment_count - meta_so_far) * blks_per_seg;
        let blocks_for_nat = ceil_div(valid_blks_available, NAT_ENTRY_PER_BLOCK as u32);
        sb.segment_count_nat = ceil_div(blocks_for_nat, blks_per_seg);

        let max_nat_segments = sb.cap_nat_bitmaps();
        if sb.segment_count_nat > max_nat_segments {
            sb.segment_count_nat = max_nat_segments;
        }
        sb.segment_count_nat *= 2;

        sb.ssa_blkaddr = sb.nat_blkaddr + sb.segment_count_nat * blks_per_seg;
        let meta_so_far = meta_so_far + sb.segment_count_nat;
        if segment_count <= meta_so_far {
            return Err(AlfsError::Configuration("device too small for the NAT area".to_string()).into());
        }
        let valid_blks_available = (segment_count - meta_so_far) * blks_per_seg;
        let blocks_for_ssa = valid_blks_available / blks_per_seg + 1;
        sb.segment_count_ssa = ceil_div(blocks_for_ssa, blks_per_seg);

        // the whole meta area must fill whole zones; the slack goes to the SSA
        let mut total_meta_segments =
            sb.segment_count_ckpt + sb.segment_count_sit + sb.segment_count_nat + sb.segment_count_ssa;
        let diff = total_meta_segments % segs_per_zone;
        if diff != 0 {
            sb.segment_count_ssa += segs_per_zone - diff;
            total_meta_segments += segs_per_zone - diff;
        }
        let total_meta_zones = total_meta_segments / segs_per_zone;

        // the meta-log keeps NR_METALOG_TIMES physical images of the meta area; the extra copies
        // sit between the meta area and main
        let meta_logging_segments = total_meta_segments * (NR_METALOG_TIMES - 1);
        let meta_logging_zones = total_meta_zones * (NR_METALOG_TIMES - 1);
        let meta_logging_blks = meta_logging_segments * blks_per_seg;
        debug!(
            "meta segments: {}, meta-log over-provisioning: {} blocks",
            total_meta_segments, meta_logging_blks
        );

        sb.main_blkaddr =
            sb.segment0_blkaddr + total_meta_zones * segs_per_zone * blks_per_seg + meta_logging_blks;

        let total_zones = (segment_count / segs_per_zone)
            .checked_sub(total_meta_zones + meta_logging_zones)
            .unwrap_or(0);
        if total_zones <= 6 {
            return Err(AlfsError::Configuration(format!(
                "{} zones: need more zones by shrinking zone size",
                total_zones
            ))
            .into());
        }
        sb.section_count = total_zones * secs_per_zone;
        sb.segment_count_main = sb.section_count * segs_per_sec;

        let reserved_segments = segs_per_sec * 2;
        if sb.segment_count_main - 2 < reserved_segments {
            return Err(AlfsError::Configuration(format!(
                "device size is not sufficient for an F2FS volume, {} more segments needed",
                reserved_segments - (sb.segment_count_main - 2)
            ))
            .into());
        }

        sb.uuid = *Uuid::new_v4().as_bytes();
        sb.set_volume_name(&params.label)?;
        sb.node_ino = NODE_INO;
        sb.meta_ino = META_INO;
        sb.root_ino = ROOT_INO;
        sb.configure_extension_list(&params.extensions);
        sb.feature = params.features;

        let cur_seg = Self::place_active_logs(params.heap, total_zones, segs_per_sec, segs_per_zone);
        Ok((sb, MainLayout { cur_seg, total_zones, reserved_segments }))
    }

    /// The NAT bitmap has to share the checkpoint block with the SIT bitmap; shrink the NAT area
    /// until both fit. Returns the NAT segment cap (before doubling) and fixes `cp_payload` when
    /// an oversized SIT bitmap has to spill out of the checkpoint block.
    fn cap_nat_bitmaps(&mut self) -> u32 {
        let sit_bitmap_size = ((self.segment_count_sit / 2) << self.log_blocks_per_seg) / 8;
        let sit_bitmap_size = sit_bitmap_size.min(MAX_SIT_BITMAP_SIZE);
        let budget = (CHECKSUM_OFFSET - size_of::<Checkpoint>() + 1) as u32;

        let max_nat_bitmap_size = if sit_bitmap_size > budget - 64 {
            self.cp_payload = ceil_div(sit_bitmap_size, BLOCK_SIZE as u32);
            budget
        } else {
            self.cp_payload = 0;
            budget - sit_bitmap_size
        };
        (max_nat_bitmap_size * 8) >> self.log_blocks_per_seg
    }

    /// Picks the starting segment of each active log. Heap-style allocation grows node logs from
    /// the device end and data logs from the front; otherwise all six logs line up at the front.
    fn place_active_logs(heap: bool, total_zones: u32, segs_per_sec: u32, segs_per_zone: u32) -> [u32; NR_CURSEG_TYPE] {
        let mut cur_seg = [0u32; NR_CURSEG_TYPE];
        if heap {
            let last_section = |zone: u32| zone * segs_per_zone + (segs_per_zone - segs_per_sec);
            cur_seg[CURSEG_HOT_NODE] = last_section(total_zones - 1);
            cur_seg[CURSEG_WARM_NODE] = cur_seg[CURSEG_HOT_NODE] - segs_per_zone;
            cur_seg[CURSEG_COLD_NODE] = cur_seg[CURSEG_WARM_NODE] - segs_per_zone;
            cur_seg[CURSEG_HOT_DATA] = cur_seg[CURSEG_COLD_NODE] - segs_per_zone;
            cur_seg[CURSEG_COLD_DATA] = 0;
            cur_seg[CURSEG_WARM_DATA] = segs_per_zone;
        } else {
            cur_seg[CURSEG_HOT_NODE] = 0;
            cur_seg[CURSEG_WARM_NODE] = segs_per_zone;
            cur_seg[CURSEG_COLD_NODE] = 2 * segs_per_zone;
            cur_seg[CURSEG_HOT_DATA] = 3 * segs_per_zone;
            cur_seg[CURSEG_COLD_DATA] = 4 * segs_per_zone;
            cur_seg[CURSEG_WARM_DATA] = 5 * segs_per_zone;
        }
        cur_seg
    }

    fn set_volume_name(&mut self, label: &str) -> Result<()> {
        let encoded: Vec<u16> = label.encode_utf16().collect();
        if encoded.len() > MAX_VOLUME_NAME {
            return Err(AlfsError::Configuration(format!(
                "volume label must encode to at most {} UTF-16 units",
                MAX_VOLUME_NAME
            ))
            .into());
        }
        // assigned as a whole: the packed field cannot be borrowed for an in-place copy
        let mut name = [0u16; MAX_VOLUME_NAME];
        name[..encoded.len()].copy_from_slice(&encoded);
        self.volume_name = name;
        Ok(())
    }

    fn configure_extension_list(&mut self, extra: &[String]) {
        let defaults = MEDIA_EXTENSIONS.iter().copied();
        let mut count = 0;
        for ext in defaults.chain(extra.iter().map(String::as_str)) {
            if count == MAX_EXTENSIONS || ext.len() > EXTENSION_LEN {
                break;
            }
            self.extension_list[count][..ext.len()].copy_from_slice(ext.as_bytes());
            count += 1;
        }
        self.extension_count = count as u32;
    }

    pub fn blks_per_seg(&self) -> u32 {
        1 << self.log_blocks_per_seg
    }

    /// The geometry the indirection core runs on, read back out of the superblock fields.
    pub fn geometry(&self) -> crate::error::Result<Geometry> {
        Geometry::new(
            self.blks_per_seg(),
            self.segs_per_sec,
            self.segment_count_ckpt,
            self.segment_count_sit,
            self.segment_count_nat,
            self.segment_count_ssa,
        )
    }

    /// Reads a superblock from one of its two copies at the device start.
    pub fn read_from(dev: &Device) -> Result<Self> {
        for copy in 0..2u32 {
            let block = dev.block(copy)?;
            // SAFETY: SuperBlock is a packed plain-data record and any bit pattern is a value
            let sb: Self = unsafe { struct_from_bytes(&block[F2FS_SUPER_OFFSET..]) };
            if { sb.magic } == F2FS_MAGIC {
                return Ok(sb);
            }
            debug!("superblock copy {} has a bad magic", copy);
        }
        bail!("no valid superblock in the first two blocks");
    }
}

fn ceil_div(value: u32, divisor: u32) -> u32 {
    (value + divisor - 1) / divisor
}
