use std::convert::TryFrom;

use anyhow::{bail, Result};
use chrono::Utc;
use log::{debug, info};
use nix::unistd::{getgid, getuid};

use std::mem::size_of;

use crate::alfs::Alfs;
use crate::device::{Device, BLOCK_SIZE};
use crate::f2fs::node::{DentryBlock, Node, NodeFooter, F2FS_FT_DIR};
use crate::f2fs::segment::{compact_data_summary_block, node_summary_block};
use crate::f2fs::superblock::MainLayout;
use crate::f2fs::{
    nat::NatBlock, struct_block, struct_from_bytes, Checkpoint, SuperBlock, CURSEG_HOT_DATA, CURSEG_HOT_NODE,
    CURSEG_WARM_NODE, DEFAULT_SECTOR_SIZE, F2FS_FEATURE_HMSMR, F2FS_SUPER_OFFSET,
};

/// Options of a format run, straight from the command line.
pub struct FormatParams {
    pub label: String,
    pub heap: bool,
    pub segs_per_sec: u32,
    pub secs_per_zone: u32,
    pub overprovision: f64,
    pub extensions: Vec<String>,
    pub features: u32,
    pub trim: bool,
    pub total_sectors: Option<u64>,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            label: String::new(),
            heap: true,
            segs_per_sec: 1,
            secs_per_zone: 1,
            overprovision: 5.0,
            extensions: Vec::new(),
            features: 0,
            trim: true,
            total_sectors: None,
        }
    }
}

/// Formats the device: lays out the regions, pushes every meta block through the append log, and
/// finishes by persisting the mapping table.
pub fn format_device(dev: &mut Device, params: &FormatParams) -> Result<()> {
    let device_sectors = dev.len() as u64 / DEFAULT_SECTOR_SIZE;
    let total_sectors = params.total_sectors.unwrap_or(device_sectors);
    if total_sectors > device_sectors {
        bail!("requested {} sectors but the device only has {}", total_sectors, device_sectors);
    }

    let (sb, layout) = SuperBlock::prepare(params, total_sectors)?;
    let geometry = sb.geometry()?;
    let mut alfs = Alfs::format(geometry);

    if params.trim {
        dev.trim();
    }

    init_sit_area(&sb);
    init_nat_area(&sb);

    write_root_inode(dev, &sb, &layout)?;
    discard_obsolete_dnode(dev, &sb, &layout)?;
    update_nat_root(dev, &mut alfs, &sb, &layout)?;
    add_default_dentry_root(dev, &sb, &layout)?;

    let cp = write_checkpoint_pack(dev, &mut alfs, &sb, &layout, params.overprovision)?;
    write_super_block(dev, &sb)?;
    alfs.flush_mapping(dev)?;
    dev.flush()?;

    info!(
        "format successful: {} main segments, {} user blocks",
        { sb.segment_count_main },
        { cp.user_block_count }
    );
    Ok(())
}

/// The SIT area needs to read as zeroes. Unwritten logical meta blocks already do, so nothing is
/// emitted; only the extent is reported.
fn init_sit_area(sb: &SuperBlock) {
    debug!(
        "SIT area at block {}, {} segments, zeroed by unmapped reads",
        { sb.sit_blkaddr },
        sb.segment_count_sit / 2
    );
}

fn init_nat_area(sb: &SuperBlock) {
    debug!(
        "NAT area at block {}, {} segments, zeroed by unmapped reads",
        { sb.nat_blkaddr },
        sb.segment_count_nat / 2
    );
}

/// The root inode lives in the main area at the head of the hot node log; the main area is not
/// meta-logged, so this is a plain device write.
fn write_root_inode(dev: &mut Device, sb: &SuperBlock, layout: &MainLayout) -> Result<()> {
    let mut node = Node::new();
    node.footer.nid = sb.root_ino;
    node.footer.ino = sb.root_ino;
    node.footer.cp_ver = 1;
    node.footer.next_blkaddr = sb.main_blkaddr + layout.cur_seg[CURSEG_HOT_NODE] * sb.blks_per_seg() + 1;

    let now = u64::try_from(Utc::now().timestamp()).unwrap();
    node.i.i_mode = 0o040755;
    node.i.i_links = 2;
    node.i.i_uid = getuid().as_raw();
    node.i.i_gid = getgid().as_raw();
    node.i.i_size = BLOCK_SIZE as u64; // one dentry block
    node.i.i_blocks = 2;
    node.i.i_atime = now;
    node.i.i_ctime = now;
    node.i.i_mtime = now;
    node.i.i_current_depth = 1;

    let data_blk = sb.main_blkaddr + layout.cur_seg[CURSEG_HOT_DATA] * sb.blks_per_seg();
    node.i.i_addr[0] = data_blk;

    let node_blk = sb.main_blkaddr + layout.cur_seg[CURSEG_HOT_NODE] * sb.blks_per_seg();
    debug!("writing root inode (hot node) at block {}", node_blk);
    // SAFETY: Node is a packed plain-data record
    let block = unsafe { struct_block(&node) };
    dev.write_block(&block, u64::from(node_blk) * BLOCK_SIZE as u64)?;
    Ok(())
}

/// Walks the stale direct-node chain left at the warm node log by an earlier life of the device
/// and zeroes every link; mount-time roll-forward recovery would otherwise chase it. Each wiped
/// block reads back with a zero `next_blkaddr`, so the walk terminates even on a cyclic chain.
fn discard_obsolete_dnode(dev: &mut Device, sb: &SuperBlock, layout: &MainLayout) -> Result<()> {
    if sb.feature & F2FS_FEATURE_HMSMR != 0 {
        return Ok(());
    }
    let main_blkaddr = sb.main_blkaddr;
    let fs_end = u64::from(main_blkaddr) + { sb.block_count };
    let mut offset = main_blkaddr + layout.cur_seg[CURSEG_WARM_NODE] * sb.blks_per_seg();

    let mut page = [0u8; BLOCK_SIZE];
    loop {
        if offset < main_blkaddr || u64::from(offset) >= fs_end {
            break;
        }
        dev.read_block(&mut page, offset)?;
        // SAFETY: NodeFooter is a packed plain-data record and any bit pattern is a value
        let footer: NodeFooter = unsafe { struct_from_bytes(&page[BLOCK_SIZE - size_of::<NodeFooter>()..]) };

        debug!("discarding obsolete dnode at block {}", offset);
        dev.write_block(&[0u8; BLOCK_SIZE], u64::from(offset) * BLOCK_SIZE as u64)?;
        offset = footer.next_blkaddr;
    }
    Ok(())
}

/// Seeds the NAT with the three reserved inodes. This is the first meta block pushed through the
/// indirection layer.
fn update_nat_root(dev: &mut Device, alfs: &mut Alfs, sb: &SuperBlock, layout: &MainLayout) -> Result<()> {
    let mut nat = NatBlock::new();
    let root_node_blk = sb.main_blkaddr + layout.cur_seg[CURSEG_HOT_NODE] * sb.blks_per_seg();
    nat.set_entry(sb.root_ino, sb.root_ino, root_node_blk);
    nat.set_entry(sb.node_ino, sb.node_ino, 1);
    nat.set_entry(sb.meta_ino, sb.meta_ino, 1);

    debug!("writing nat root at logical block {}", { sb.nat_blkaddr });
    // SAFETY: NatBlock is a packed plain-data record
    let block = unsafe { struct_block(&nat) };
    alfs.write_meta_block(dev, &block, sb.nat_blkaddr)?;
    Ok(())
}

fn add_default_dentry_root(dev: &mut Device, sb: &SuperBlock, layout: &MainLayout) -> Result<()> {
    let mut dent = DentryBlock::new();
    dent.add_entry(0, sb.root_ino, b".", F2FS_FT_DIR);
    dent.add_entry(1, sb.root_ino, b"..", F2FS_FT_DIR);

    let data_blk = sb.main_blkaddr + layout.cur_seg[CURSEG_HOT_DATA] * sb.blks_per_seg();
    debug!("writing default dentry root at block {}", data_blk);
    // SAFETY: DentryBlock is a packed plain-data record
    let block = unsafe { struct_block(&dent) };
    dev.write_block(&block, u64::from(data_blk) * BLOCK_SIZE as u64)?;
    Ok(())
}

/// Emits both checkpoint packs through the indirection layer. Pack 1 carries version 1 and the
/// segment summaries; pack 2 carries version 0, so pack 1 wins on mount. The payload blocks in
/// between stay unwritten and read back as zeroes.
fn write_checkpoint_pack(
    dev: &mut Device,
    alfs: &mut Alfs,
    sb: &SuperBlock,
    layout: &MainLayout,
    overprovision: f64,
) -> Result<Checkpoint> {
    let cp = Checkpoint::build(sb, layout, overprovision);

    let mut lba = sb.cp_blkaddr;
    debug!("writing checkpoint pack 1 at logical block {}", lba);
    alfs.write_meta_block(dev, &cp.to_block(), lba)?;

    lba += sb.cp_payload;
    lba += 1;
    alfs.write_meta_block(dev, &compact_data_summary_block(sb, &cp), lba)?;
    lba += 1;
    alfs.write_meta_block(dev, &node_summary_block(Some(sb.root_ino)), lba)?;
    lba += 1;
    alfs.write_meta_block(dev, &node_summary_block(None), lba)?;
    lba += 1;
    alfs.write_meta_block(dev, &node_summary_block(None), lba)?;
    lba += 1;
    alfs.write_meta_block(dev, &cp.to_block(), lba)?;

    let mut pack2 = cp;
    pack2.checkpoint_ver = 0;
    let pack2_lba = sb.segment0_blkaddr + sb.blks_per_seg();
    debug!("writing checkpoint pack 2 at logical block {}", pack2_lba);
    alfs.write_meta_block(dev, &pack2.to_block(), pack2_lba)?;
    alfs.write_meta_block(dev, &pack2.to_block(), pack2_lba + cp.cp_pack_total_block_count - 1)?;

    Ok(cp)
}

/// Two identical superblock copies land in the first two device blocks, each at the conventional
/// byte offset inside its block.
fn write_super_block(dev: &mut Device, sb: &SuperBlock) -> Result<()> {
    let mut block = [0u8; BLOCK_SIZE];
    // SAFETY: SuperBlock is a packed plain-data record
    let bytes = unsafe { struct_block(sb) };
    block[F2FS_SUPER_OFFSET..].copy_from_slice(&bytes[..BLOCK_SIZE - F2FS_SUPER_OFFSET]);

    debug!("writing super block at block 0");
    for copy in 0..2u64 {
        dev.write_block(&block, copy * BLOCK_SIZE as u64)?;
    }
    Ok(())
}
