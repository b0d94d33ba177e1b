use anyhow::{bail, Result};
use log::{info, warn};

use crate::alfs::Alfs;
use crate::device::{Device, BLOCK_SIZE};
use crate::f2fs::{Checkpoint, SuperBlock};

/// Mount-time check of a formatted device: rebuilds the indirection state from the mapping
/// region, cross-checks it against the summary, and verifies that a valid checkpoint is reachable
/// through the translation path.
pub fn check_device(dev: &Device) -> Result<()> {
    let sb = SuperBlock::read_from(dev)?;
    let geometry = sb.geometry()?;
    info!(
        "meta-log: {} logical / {} physical blocks starting at block {}",
        geometry.nr_metalog_logi_blks(),
        geometry.nr_metalog_phys_blks(),
        geometry.metalog_blkofs()
    );

    let alfs = Alfs::load(dev, geometry)?;

    let violations = alfs.verify_summary();
    if violations > 0 {
        bail!("the summary and mapping tables disagree in {} places", violations);
    }

    let cp = latest_checkpoint(dev, &alfs, &sb)?;
    info!(
        "checkpoint version {}, {} user blocks, {} free segments",
        { cp.checkpoint_ver },
        { cp.user_block_count },
        { cp.free_segment_count }
    );
    info!(
        "free blocks: {} in the mapping region, {} in the meta-log",
        alfs.mapping_free_blks()?,
        alfs.metalog_free_blks()?
    );
    Ok(())
}

/// Reads the head of both checkpoint packs through the translation and picks the newer valid one.
fn latest_checkpoint(dev: &Device, alfs: &Alfs, sb: &SuperBlock) -> Result<Checkpoint> {
    let mut page = [0u8; BLOCK_SIZE];
    let mut latest: Option<Checkpoint> = None;

    for pack in 0..2u32 {
        let lba = sb.cp_blkaddr + pack * sb.blks_per_seg();
        alfs.read_meta_block(dev, &mut page, lba)?;
        match Checkpoint::parse(&page) {
            Some(cp) => {
                if latest.map_or(true, |best| { best.checkpoint_ver } < { cp.checkpoint_ver }) {
                    latest = Some(cp);
                }
            }
            None => warn!("checkpoint pack {} has no valid head at logical block {}", pack + 1, lba),
        }
    }

    latest.ok_or_else(|| anyhow::anyhow!("neither checkpoint pack holds a valid checkpoint"))
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;
    use crate::f2fs::{format_device, FormatParams};

    fn formatted_device() -> (NamedTempFile, Device) {
        let tmp_file = NamedTempFile::new().unwrap();
        tmp_file.as_file().set_len(128 * 1024 * 1024).unwrap();
        let mut device = Device::open(tmp_file.path()).unwrap();
        format_device(&mut device, &FormatParams::default()).unwrap();
        (tmp_file, device)
    }

    #[test]
    fn passes_on_a_freshly_formatted_device() {
        let (_tmp_file, dev) = formatted_device();
        check_device(&dev).unwrap();
    }

    #[test]
    fn fails_on_a_blank_device() {
        let tmp_file = NamedTempFile::new().unwrap();
        tmp_file.as_file().set_len(16 * 1024 * 1024).unwrap();
        let dev = Device::open(tmp_file.path()).unwrap();
        assert!(check_device(&dev).is_err());
    }

    #[test]
    fn picks_the_newer_checkpoint_pack() {
        let (_tmp_file, dev) = formatted_device();
        let sb = SuperBlock::read_from(&dev).unwrap();
        let alfs = Alfs::load(&dev, sb.geometry().unwrap()).unwrap();

        let cp = latest_checkpoint(&dev, &alfs, &sb).unwrap();
        assert_eq!({ cp.checkpoint_ver }, 1);
    }

    #[test]
    fn fails_when_the_superblock_is_gone() {
        let (tmp_file, dev) = formatted_device();
        drop(dev);

        // wipe both superblock copies
        let mut device = Device::open(tmp_file.path()).unwrap();
        device.write_block(&[0u8; 2 * BLOCK_SIZE], 0).unwrap();
        assert!(check_device(&device).is_err());
    }
}
