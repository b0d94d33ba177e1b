mod map_blk;
mod mapping;
mod metalog;
mod ring;
mod summary;

pub use self::map_blk::{MapBlk, NR_MAPPING_ROOMS};
pub use self::mapping::MappingTable;
pub use self::metalog::MetaLog;
pub use self::summary::{BlockState, SummaryTable};

use log::{debug, info, warn};

use crate::device::{Device, BLOCK_SIZE};
use crate::error::{AlfsError, Region, Result};
use crate::geometry::Geometry;

/// Logical block address in meta-log logical space.
pub type Lba = u32;
/// Physical block address on the device.
pub type Pba = u32;
/// Block offset relative to a region base.
pub type BlkOfs = u32;

/// The address-logging indirection core. In-place updates of base-FS meta blocks arrive tagged
/// with a logical address and leave as appends to the meta-log; the mapping table records where
/// each logical block currently lives. One instance is owned by exactly one writer (the formatter
/// or the checker) for the duration of an operation.
pub struct Alfs {
    geometry: Geometry,
    mapping: MappingTable,
    metalog: MetaLog,
}

impl Alfs {
    /// State for a fresh format: an empty mapping table and an all-free meta-log.
    pub fn format(geometry: Geometry) -> Self {
        info!(
            "meta-log at block {}, {} logical / {} physical blocks",
            geometry.metalog_blkofs(),
            geometry.nr_metalog_logi_blks(),
            geometry.nr_metalog_phys_blks()
        );
        Self {
            mapping: MappingTable::format(&geometry),
            metalog: MetaLog::format(&geometry),
            geometry,
        }
    }

    /// Reconstructs the state of a previously formatted device: the newest mapping from the
    /// mapping region, the validity summary derived from it, and the free windows of both regions.
    pub fn load(dev: &Device, geometry: Geometry) -> Result<Self> {
        let mapping = MappingTable::load(dev, &geometry)?;
        let metalog = MetaLog::rebuild(&geometry, &mapping)?;
        info!(
            "mapping window [{}, {}), meta-log window [{}, {})",
            metalog.sblkofs(),
            metalog.eblkofs(),
            mapping.sblkofs(),
            mapping.eblkofs()
        );
        Ok(Self { geometry, mapping, metalog })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn mapping(&self) -> &MappingTable {
        &self.mapping
    }

    pub fn metalog(&self) -> &MetaLog {
        &self.metalog
    }

    /// Translates a logical meta address to the physical block holding its live copy. Unmapped
    /// addresses yield None (the caller zero-fills); so do mapped addresses whose target
    /// contradicts the summary, which is logged as a consistency problem but does not fail the
    /// operation.
    pub fn lookup(&self, lba: Lba) -> Result<Option<Pba>> {
        if !self.metalog.contains_lba(lba) {
            return Err(AlfsError::InvalidAddress { region: Region::Metalog, addr: lba });
        }

        let pba = match self.mapping.entry(lba - self.metalog.blkofs()) {
            Some(pba) => pba,
            None => return Ok(None),
        };
        if !self.metalog.contains_pba(pba) {
            warn!("mapping for lba {:#x} points outside the meta-log ({:#x})", lba, pba);
            return Ok(None);
        }
        if self.metalog.state(pba) != BlockState::Valid {
            warn!(
                "summary disagrees with the mapping: lba {:#x} maps to {:#x} which is {:?}",
                lba,
                pba,
                self.metalog.state(pba)
            );
            return Ok(None);
        }
        Ok(Some(pba))
    }

    /// Records a run of `length` logical→physical mappings starting at `lba`. With a physical
    /// base the run is taken as contiguous from it; without one every block gets a fresh slot at
    /// the append cursor. Superseded physical copies are invalidated as they are replaced. The
    /// run is not atomic: a failure part-way leaves the earlier entries committed.
    pub fn map_l2p(&mut self, lba: Lba, pba: Option<Pba>, length: u32) -> Result<()> {
        for idx in 0..length {
            let cur_lba = lba + idx;
            if !self.metalog.contains_lba(cur_lba) {
                return Err(AlfsError::InvalidAddress { region: Region::Metalog, addr: cur_lba });
            }
            let cur_pba = match pba {
                Some(base) => base + idx,
                None => self.metalog.alloc_pba()?,
            };

            let blk_off = cur_lba - self.metalog.blkofs();
            if let Some(prev_pba) = self.mapping.entry(blk_off) {
                if self.metalog.contains_pba(prev_pba) {
                    self.metalog.invalidate(prev_pba);
                } else {
                    warn!("stale mapping for lba {:#x} pointed outside the meta-log ({:#x})", cur_lba, prev_pba);
                }
            }

            self.mapping.set_entry(blk_off, cur_pba);
            self.metalog.mark_valid(cur_pba);
            self.metalog.advance_end();
        }
        Ok(())
    }

    /// Appends one 4 KiB meta block and records where it went. The block lands on the device
    /// before the mapping entry changes, so a crash in between costs only the new mapping, never
    /// the old data.
    pub fn write_meta_block(&mut self, dev: &mut Device, buf: &[u8], lba: Lba) -> Result<()> {
        assert_eq!(buf.len(), BLOCK_SIZE);
        if self.metalog.needs_gc() && !self.metalog_gc(dev)? {
            debug!("meta-log crowded but nothing reclaimable yet");
        }

        let pba = self.metalog.alloc_pba()?;
        dev.write_block(buf, pba as u64 * BLOCK_SIZE as u64)?;
        self.map_l2p(lba, Some(pba), 1)
    }

    /// Reads the meta block at `lba` through the translation. Logical blocks that were never
    /// written read back as a zero page without touching the device.
    pub fn read_meta_block(&self, dev: &Device, page: &mut [u8], lba: Lba) -> Result<()> {
        assert_eq!(page.len(), BLOCK_SIZE);
        match self.lookup(lba)? {
            Some(pba) => dev.read_block(page, pba),
            None => {
                page.fill(0);
                Ok(())
            }
        }
    }

    /// Persists the mapping table. Called once at the end of a format or checkpoint flush; until
    /// then all mapping changes are memory-only.
    pub fn flush_mapping(&mut self, dev: &mut Device) -> Result<()> {
        self.mapping.flush(dev)
    }

    pub fn metalog_free_blks(&self) -> Result<u32> {
        self.metalog.free_blks()
    }

    pub fn mapping_free_blks(&self) -> Result<u32> {
        self.mapping.free_blks()
    }

    /// One meta-log reclaim step: the used section with the most stale blocks is emptied by
    /// relocating its surviving blocks through the translation path, then freed. Returns false
    /// when no used section has anything stale.
    pub fn metalog_gc(&mut self, dev: &mut Device) -> Result<bool> {
        let section_start = match self.metalog.victim_section() {
            Some(section_start) => section_start,
            None => return Ok(false),
        };
        let blks_per_sec = self.geometry.blks_per_sec();
        debug!("reclaiming meta-log section at region offset {}", section_start);

        // reverse index of the victim's live blocks; the mapping is the only record of ownership
        let metalog_blkofs = self.metalog.blkofs();
        let mut owner = vec![None; blks_per_sec as usize];
        for blk_off in 0..self.metalog.nr_logi_blks() {
            if let Some(pba) = self.mapping.entry(blk_off) {
                let region_ofs = pba.wrapping_sub(metalog_blkofs);
                if region_ofs >= section_start && region_ofs < section_start + blks_per_sec {
                    owner[(region_ofs - section_start) as usize] = Some(metalog_blkofs + blk_off);
                }
            }
        }

        let mut page = [0u8; BLOCK_SIZE];
        for idx in 0..blks_per_sec {
            let region_ofs = section_start + idx;
            if self.metalog.state(metalog_blkofs + region_ofs) != BlockState::Valid {
                continue;
            }
            let lba = match owner[idx as usize] {
                Some(lba) => lba,
                None => {
                    warn!("valid meta-log block at region offset {} has no mapping entry", region_ofs);
                    continue;
                }
            };

            dev.read_block(&mut page, metalog_blkofs + region_ofs)?;
            let new_pba = self.metalog.alloc_pba()?;
            dev.write_block(&page, new_pba as u64 * BLOCK_SIZE as u64)?;
            self.map_l2p(lba, Some(new_pba), 1)?;
        }

        self.metalog.finish_reclaim(section_start);
        Ok(true)
    }

    /// Cross-checks the mapping table against the summary: every mapping entry must reference a
    /// distinct valid block and every valid block must be referenced. Returns the number of
    /// violations, each of which is logged.
    pub fn verify_summary(&self) -> u32 {
        let metalog_blkofs = self.metalog.blkofs();
        let mut referenced = vec![false; self.metalog.nr_phys_blks() as usize];
        let mut violations = 0;

        for blk_off in 0..self.metalog.nr_logi_blks() {
            let pba = match self.mapping.entry(blk_off) {
                Some(pba) => pba,
                None => continue,
            };
            if !self.metalog.contains_pba(pba) {
                warn!("mapping entry for lba {:#x} references {:#x} outside the meta-log", metalog_blkofs + blk_off, pba);
                violations += 1;
                continue;
            }
            if self.metalog.state(pba) != BlockState::Valid {
                warn!(
                    "mapping entry for lba {:#x} references {:#x} which is {:?}",
                    metalog_blkofs + blk_off,
                    pba,
                    self.metalog.state(pba)
                );
                violations += 1;
            }
            let region_ofs = (pba - metalog_blkofs) as usize;
            if referenced[region_ofs] {
                warn!("physical block {:#x} is referenced by more than one mapping entry", pba);
                violations += 1;
            }
            referenced[region_ofs] = true;
        }

        for (region_ofs, _) in referenced.iter().enumerate().filter(|(_, &seen)| !seen) {
            if self.metalog.summary().state(region_ofs as u32) == BlockState::Valid {
                warn!("valid block at region offset {} is referenced by no mapping entry", region_ofs);
                violations += 1;
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;

    const METALOG_BLKOFS: u32 = 2048;
    const BLKS_PER_SEC: u32 = 512;

    fn test_geometry() -> Geometry {
        Geometry::new(512, 1, 2, 2, 2, 2).unwrap()
    }

    fn test_device() -> (NamedTempFile, Device) {
        let geometry = test_geometry();
        let tmp_file = NamedTempFile::new().unwrap();
        let blocks = geometry.main_blkofs() as u64;
        tmp_file.as_file().set_len(blocks * BLOCK_SIZE as u64).unwrap();
        let device = Device::open(tmp_file.path()).unwrap();
        (tmp_file, device)
    }

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE]
    }

    #[test]
    fn first_write_takes_the_first_physical_slot() {
        let (_tmp_file, mut dev) = test_device();
        let mut alfs = Alfs::format(test_geometry());

        alfs.write_meta_block(&mut dev, &page_of(0xA1), METALOG_BLKOFS).unwrap();

        assert_eq!(alfs.mapping().entry(0), Some(METALOG_BLKOFS));
        assert_eq!(alfs.metalog().state(METALOG_BLKOFS), BlockState::Valid);
        assert_eq!(alfs.metalog().eblkofs(), 1);
    }

    #[test]
    fn overwrite_invalidates_the_old_copy() {
        let (_tmp_file, mut dev) = test_device();
        let mut alfs = Alfs::format(test_geometry());

        alfs.write_meta_block(&mut dev, &page_of(0xA1), METALOG_BLKOFS).unwrap();
        alfs.write_meta_block(&mut dev, &page_of(0xB2), METALOG_BLKOFS).unwrap();

        assert_eq!(alfs.mapping().entry(0), Some(METALOG_BLKOFS + 1));
        assert_eq!(alfs.metalog().state(METALOG_BLKOFS), BlockState::Invalid);
        assert_eq!(alfs.metalog().state(METALOG_BLKOFS + 1), BlockState::Valid);

        let mut page = page_of(0);
        alfs.read_meta_block(&dev, &mut page, METALOG_BLKOFS).unwrap();
        assert_eq!(page, page_of(0xB2));
    }

    #[test]
    fn writes_cross_mapping_block_boundaries() {
        let (_tmp_file, mut dev) = test_device();
        let mut alfs = Alfs::format(test_geometry());

        alfs.write_meta_block(&mut dev, &page_of(0xC3), METALOG_BLKOFS + 1020).unwrap();

        assert_eq!(alfs.mapping().map_blks()[1].entry(0), Some(METALOG_BLKOFS));
        assert_eq!(alfs.mapping().map_blks()[0].entry(0), None);
        assert!(alfs.mapping().map_blks()[1].is_dirty());
    }

    #[test]
    fn unmapped_reads_return_a_zero_page() {
        let (_tmp_file, mut dev) = test_device();
        let mut alfs = Alfs::format(test_geometry());
        alfs.write_meta_block(&mut dev, &page_of(0xA1), METALOG_BLKOFS).unwrap();

        let mut page = page_of(0xFF);
        alfs.read_meta_block(&dev, &mut page, METALOG_BLKOFS + 5).unwrap();
        assert_eq!(page, page_of(0));
    }

    #[test]
    fn rejects_addresses_outside_the_logical_space() {
        let (_tmp_file, mut dev) = test_device();
        let mut alfs = Alfs::format(test_geometry());

        assert!(matches!(
            alfs.lookup(METALOG_BLKOFS - 1),
            Err(AlfsError::InvalidAddress { .. })
        ));
        assert!(matches!(
            alfs.lookup(METALOG_BLKOFS + 4096),
            Err(AlfsError::InvalidAddress { .. })
        ));
        assert!(matches!(
            alfs.write_meta_block(&mut dev, &page_of(0), METALOG_BLKOFS + 4096),
            Err(AlfsError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn multi_block_runs_allocate_consecutive_slots() {
        let (_tmp_file, mut dev) = test_device();
        let mut alfs = Alfs::format(test_geometry());
        alfs.write_meta_block(&mut dev, &page_of(1), METALOG_BLKOFS + 100).unwrap();

        alfs.map_l2p(METALOG_BLKOFS + 200, None, 3).unwrap();
        assert_eq!(alfs.mapping().entry(200), Some(METALOG_BLKOFS + 1));
        assert_eq!(alfs.mapping().entry(201), Some(METALOG_BLKOFS + 2));
        assert_eq!(alfs.mapping().entry(202), Some(METALOG_BLKOFS + 3));
        assert_eq!(alfs.metalog().eblkofs(), 4);
    }

    #[test]
    fn round_trips_through_flush_and_load() {
        let (_tmp_file, mut dev) = test_device();
        let mut alfs = Alfs::format(test_geometry());

        alfs.write_meta_block(&mut dev, &page_of(0xA1), METALOG_BLKOFS).unwrap();
        alfs.write_meta_block(&mut dev, &page_of(0xB2), METALOG_BLKOFS + 1020).unwrap();
        alfs.write_meta_block(&mut dev, &page_of(0xC3), METALOG_BLKOFS + 4095).unwrap();
        alfs.flush_mapping(&mut dev).unwrap();

        let reloaded = Alfs::load(&dev, test_geometry()).unwrap();
        for (lba, byte) in [(METALOG_BLKOFS, 0xA1), (METALOG_BLKOFS + 1020, 0xB2), (METALOG_BLKOFS + 4095, 0xC3)] {
            let mut page = page_of(0);
            reloaded.read_meta_block(&dev, &mut page, lba).unwrap();
            assert_eq!(page, page_of(byte), "lba {:#x}", lba);
        }
        assert_eq!(reloaded.verify_summary(), 0);

        // every entry that was live at format time survived the reload
        for blk_off in 0..4096 {
            assert_eq!(reloaded.mapping().entry(blk_off), alfs.mapping().entry(blk_off));
        }
    }

    #[test]
    fn reload_keeps_cursors_section_aligned() {
        let (_tmp_file, mut dev) = test_device();
        let mut alfs = Alfs::format(test_geometry());
        for idx in 0..5 {
            alfs.write_meta_block(&mut dev, &page_of(idx as u8), METALOG_BLKOFS + idx).unwrap();
        }
        alfs.flush_mapping(&mut dev).unwrap();

        let reloaded = Alfs::load(&dev, test_geometry()).unwrap();
        assert_eq!(reloaded.metalog().sblkofs() % BLKS_PER_SEC, 0);
        assert_eq!(reloaded.metalog().eblkofs() % BLKS_PER_SEC, 0);
        assert_eq!(reloaded.mapping().sblkofs() % BLKS_PER_SEC, 0);
        assert_eq!(reloaded.mapping().eblkofs() % BLKS_PER_SEC, 0);
    }

    #[test]
    fn versions_never_move_backwards_across_reloads() {
        let (_tmp_file, mut dev) = test_device();

        let mut alfs = Alfs::format(test_geometry());
        alfs.write_meta_block(&mut dev, &page_of(1), METALOG_BLKOFS).unwrap();
        alfs.flush_mapping(&mut dev).unwrap();
        let first_vers: Vec<u32> = alfs.mapping().map_blks().iter().map(|blk| blk.ver).collect();

        let mut reloaded = Alfs::load(&dev, test_geometry()).unwrap();
        reloaded.write_meta_block(&mut dev, &page_of(2), METALOG_BLKOFS).unwrap();
        reloaded.flush_mapping(&mut dev).unwrap();

        let reread = Alfs::load(&dev, test_geometry()).unwrap();
        for (blk, &first_ver) in reread.mapping().map_blks().iter().zip(&first_vers) {
            assert!(blk.ver >= first_ver);
        }
    }

    #[test]
    fn gc_relocates_survivors_and_frees_the_victim() {
        let (_tmp_file, mut dev) = test_device();
        let mut alfs = Alfs::format(test_geometry());

        // fill section 0 of the meta-log: one block stays live, the rest gets overwritten into
        // section 1 and becomes stale
        alfs.write_meta_block(&mut dev, &page_of(0x55), METALOG_BLKOFS).unwrap();
        for _ in 0..511 {
            alfs.write_meta_block(&mut dev, &page_of(0x66), METALOG_BLKOFS + 1).unwrap();
        }
        assert_eq!(alfs.metalog().summary().invalid_blks_in_section(0), 510);

        assert!(alfs.metalog_gc(&mut dev).unwrap());

        // the survivor moved and still reads back, the victim section is free again
        let moved_to = alfs.mapping().entry(0).unwrap();
        assert!(moved_to >= METALOG_BLKOFS + 512);
        assert_eq!(alfs.metalog().summary().invalid_blks_in_section(0), 0);
        assert_eq!(alfs.metalog().sblkofs() % BLKS_PER_SEC, 0);
        assert_eq!(alfs.verify_summary(), 0);

        let mut page = page_of(0);
        alfs.read_meta_block(&dev, &mut page, METALOG_BLKOFS).unwrap();
        assert_eq!(page, page_of(0x55));
    }

    #[test]
    fn verify_summary_flags_inconsistencies() {
        let (_tmp_file, mut dev) = test_device();
        let mut alfs = Alfs::format(test_geometry());
        alfs.write_meta_block(&mut dev, &page_of(1), METALOG_BLKOFS).unwrap();
        assert_eq!(alfs.verify_summary(), 0);

        alfs.metalog.invalidate(METALOG_BLKOFS);
        assert_eq!(alfs.verify_summary(), 1);
        // a lookup through the inconsistent entry warns and zero-fills instead of failing
        let mut page = page_of(0xFF);
        alfs.read_meta_block(&dev, &mut page, METALOG_BLKOFS).unwrap();
        assert_eq!(page, page_of(0));
    }
}
