use log::{debug, warn};

use crate::alfs::map_blk::{MapBlk, NR_MAPPING_ROOMS};
use crate::alfs::ring::GcWindow;
use crate::alfs::{BlkOfs, Pba};
use crate::device::{Device, BLOCK_SIZE};
use crate::error::{AlfsError, Region, Result};
use crate::geometry::{Geometry, NR_MAPPING_SECS};

/// The in-memory logical→physical mapping table together with its persistence window. Whole
/// mapping blocks are appended to the on-device mapping region; several on-disk versions of the
/// same slot may coexist and the highest `ver` wins on the next load.
pub struct MappingTable {
    /// Device block at which the mapping region starts.
    blkofs: u32,
    blks_per_sec: u32,
    map_blks: Vec<MapBlk>,
    /// Region-relative block of the newest on-disk copy per slot, if any.
    disk_ofs: Vec<Option<BlkOfs>>,
    win: GcWindow,
}

impl MappingTable {
    /// An empty table for a fresh format: nothing is mapped and nothing is on disk yet.
    pub fn format(geometry: &Geometry) -> Self {
        let nr_slots = geometry.nr_map_blks();
        Self {
            blkofs: geometry.mapping_blkofs(),
            blks_per_sec: geometry.blks_per_sec(),
            map_blks: (0..nr_slots).map(MapBlk::new).collect(),
            disk_ofs: vec![None; nr_slots as usize],
            win: GcWindow::fresh(Region::Mapping, geometry.nr_mapping_phys_blks(), geometry.blks_per_sec()),
        }
    }

    /// Rebuilds the table from the on-device mapping region. Every block of the region is scanned
    /// section-major; a block is accepted when its magic matches and its version is at least as
    /// new as what the slot currently holds, so of several copies the highest version survives and
    /// ties go to the later copy. The first section that contributed nothing becomes the free
    /// window; without one the region is unusable.
    pub fn load(dev: &Device, geometry: &Geometry) -> Result<Self> {
        let nr_slots = geometry.nr_map_blks();
        let blks_per_sec = geometry.blks_per_sec();
        let mut map_blks: Vec<MapBlk> = (0..nr_slots).map(MapBlk::new).collect();
        let mut disk_ofs = vec![None; nr_slots as usize];
        let mut first_dead_section = None;

        let mut page = [0u8; BLOCK_SIZE];
        for section in 0..NR_MAPPING_SECS {
            let mut is_dead_section = true;

            for blk in 0..blks_per_sec {
                let region_ofs = section * blks_per_sec + blk;
                dev.read_block(&mut page, geometry.mapping_blkofs() + region_ofs)?;

                let candidate = MapBlk::decode(&page);
                if !candidate.is_valid() {
                    continue;
                }
                let slot = (candidate.index / NR_MAPPING_ROOMS as u32) as usize;
                if slot >= map_blks.len() || candidate.index % NR_MAPPING_ROOMS as u32 != 0 {
                    warn!(
                        "mapping block at region offset {} carries a bogus index {}",
                        region_ofs, candidate.index
                    );
                    continue;
                }
                if map_blks[slot].ver <= candidate.ver {
                    map_blks[slot] = candidate;
                    disk_ofs[slot] = Some(region_ofs);
                    is_dead_section = false;
                }
            }

            if is_dead_section {
                debug!("dead mapping section detected: {}", section);
                if first_dead_section.is_none() {
                    first_dead_section = Some(section);
                }
            }
        }

        let first_dead_section = first_dead_section.ok_or(AlfsError::NoFreeSpace(Region::Mapping))?;
        Ok(Self {
            blkofs: geometry.mapping_blkofs(),
            blks_per_sec,
            map_blks,
            disk_ofs,
            win: GcWindow::from_dead_section(
                Region::Mapping,
                geometry.nr_mapping_phys_blks(),
                blks_per_sec,
                first_dead_section,
            ),
        })
    }

    /// Looks up the physical address recorded for the logical meta block `blk_off` (relative to
    /// the meta-log base).
    pub fn entry(&self, blk_off: BlkOfs) -> Option<Pba> {
        let slot = blk_off as usize / NR_MAPPING_ROOMS;
        self.map_blks[slot].entry(blk_off as usize % NR_MAPPING_ROOMS)
    }

    /// Records `blk_off → pba` and marks the owning mapping block dirty.
    pub fn set_entry(&mut self, blk_off: BlkOfs, pba: Pba) {
        let slot = blk_off as usize / NR_MAPPING_ROOMS;
        self.map_blks[slot].set_entry(blk_off as usize % NR_MAPPING_ROOMS, pba);
    }

    pub fn map_blks(&self) -> &[MapBlk] {
        &self.map_blks
    }

    pub fn nr_logi_blks(&self) -> u32 {
        (self.map_blks.len() * NR_MAPPING_ROOMS) as u32
    }

    pub fn free_blks(&self) -> Result<u32> {
        self.win.free_blks()
    }

    pub fn sblkofs(&self) -> BlkOfs {
        self.win.sblkofs()
    }

    pub fn eblkofs(&self) -> BlkOfs {
        self.win.eblkofs()
    }

    /// Appends every dirty mapping block to the mapping region, bumping its version first. Runs a
    /// reclaim step whenever the free run shrinks to one section.
    pub fn flush(&mut self, dev: &mut Device) -> Result<()> {
        for slot in 0..self.map_blks.len() {
            if !self.map_blks[slot].is_dirty() {
                continue;
            }
            if self.win.needs_gc() {
                self.reclaim_section(dev)?;
            }
            self.map_blks[slot].dirty = 0;
            self.append_slot(dev, slot)?;
        }
        Ok(())
    }

    /// Discards the section at the reclaim cursor. Slots whose only on-disk copy lives in that
    /// section are re-appended first so no slot loses its last copy, and the section is wiped so
    /// its stale blocks read back as unoccupied on the next load.
    fn reclaim_section(&mut self, dev: &mut Device) -> Result<()> {
        let section_start = self.win.sblkofs();
        let section = section_start..section_start + self.blks_per_sec;
        debug!("reclaiming mapping section at region offset {}", section_start);
        self.win.reclaim_section();

        for slot in 0..self.map_blks.len() {
            let lives_in_section = self.disk_ofs[slot].map_or(false, |ofs| section.contains(&ofs));
            // dirty slots are about to be appended anyway
            if lives_in_section && !self.map_blks[slot].is_dirty() {
                self.append_slot(dev, slot)?;
            }
        }

        let zero_page = [0u8; BLOCK_SIZE];
        for region_ofs in section {
            dev.write_block(&zero_page, (self.blkofs + region_ofs) as u64 * BLOCK_SIZE as u64)?;
        }
        Ok(())
    }

    fn append_slot(&mut self, dev: &mut Device, slot: usize) -> Result<()> {
        let region_ofs = self.win.eblkofs();
        self.map_blks[slot].ver += 1;
        let bytes = self.map_blks[slot].encode();
        dev.write_block(&bytes, (self.blkofs + region_ofs) as u64 * BLOCK_SIZE as u64)?;
        self.disk_ofs[slot] = Some(region_ofs);
        self.win.advance_end();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;

    fn test_geometry() -> Geometry {
        Geometry::new(512, 1, 2, 2, 2, 2).unwrap()
    }

    fn empty_device(geometry: &Geometry) -> (NamedTempFile, Device) {
        let tmp_file = NamedTempFile::new().unwrap();
        let blocks = geometry.metalog_blkofs() as u64;
        tmp_file.as_file().set_len(blocks * BLOCK_SIZE as u64).unwrap();
        let device = Device::open(tmp_file.path()).unwrap();
        (tmp_file, device)
    }

    fn write_map_blk(dev: &mut Device, geometry: &Geometry, region_ofs: u32, blk: &MapBlk) {
        let byte_offset = (geometry.mapping_blkofs() + region_ofs) as u64 * BLOCK_SIZE as u64;
        dev.write_block(&blk.encode(), byte_offset).unwrap();
    }

    #[test]
    fn fresh_table_is_unmapped() {
        let table = MappingTable::format(&test_geometry());
        assert_eq!(table.map_blks().len(), 5);
        assert_eq!(table.entry(0), None);
        assert_eq!(table.entry(4095), None);
        assert_eq!(table.eblkofs(), 0);
        assert_eq!(table.sblkofs(), 1024);
    }

    #[test]
    fn set_entry_targets_the_right_slot() {
        let mut table = MappingTable::format(&test_geometry());
        table.set_entry(1020, 2048);
        assert_eq!(table.map_blks()[1].entry(0), Some(2048));
        assert!(table.map_blks()[1].is_dirty());
        assert_eq!(table.map_blks()[0].entry(0), None);
    }

    #[test]
    fn load_prefers_the_highest_version() {
        let geometry = test_geometry();
        let (_tmp_file, mut dev) = empty_device(&geometry);

        let mut old = MapBlk::new(0);
        old.ver = 3;
        old.set_entry(0, 2048);
        old.dirty = 0;
        write_map_blk(&mut dev, &geometry, 0, &old);

        let mut new = MapBlk::new(0);
        new.ver = 7;
        new.set_entry(0, 2049);
        new.dirty = 0;
        write_map_blk(&mut dev, &geometry, 1, &new);

        let table = MappingTable::load(&dev, &geometry).unwrap();
        assert_eq!(table.map_blks()[0].ver, 7);
        assert_eq!(table.entry(0), Some(2049));
    }

    #[test]
    fn load_breaks_version_ties_towards_the_later_copy() {
        let geometry = test_geometry();
        let (_tmp_file, mut dev) = empty_device(&geometry);

        let mut first = MapBlk::new(0);
        first.ver = 5;
        first.set_entry(0, 2048);
        first.dirty = 0;
        write_map_blk(&mut dev, &geometry, 0, &first);

        let mut second = MapBlk::new(0);
        second.ver = 5;
        second.set_entry(0, 2050);
        second.dirty = 0;
        write_map_blk(&mut dev, &geometry, 1, &second);

        let table = MappingTable::load(&dev, &geometry).unwrap();
        assert_eq!(table.entry(0), Some(2050));
    }

    #[test]
    fn load_derives_the_window_from_the_first_dead_section() {
        let geometry = test_geometry();
        let (_tmp_file, mut dev) = empty_device(&geometry);

        // only section 0 holds a live block, so section 1 starts the free window
        write_map_blk(&mut dev, &geometry, 17, &MapBlk::new(0));

        let table = MappingTable::load(&dev, &geometry).unwrap();
        assert_eq!(table.eblkofs(), 512);
        assert_eq!(table.sblkofs(), 1024);
    }

    #[test]
    fn load_fails_without_a_dead_section() {
        let geometry = test_geometry();
        let (_tmp_file, mut dev) = empty_device(&geometry);

        for section in 0..NR_MAPPING_SECS {
            write_map_blk(&mut dev, &geometry, section * 512, &MapBlk::new(0));
        }

        assert!(matches!(
            MappingTable::load(&dev, &geometry),
            Err(AlfsError::NoFreeSpace(Region::Mapping))
        ));
    }

    #[test]
    fn flush_appends_dirty_blocks_with_bumped_versions() {
        let geometry = test_geometry();
        let (_tmp_file, mut dev) = empty_device(&geometry);

        // a fresh table has nothing on disk, so the first flush persists every slot
        let mut table = MappingTable::format(&geometry);
        table.set_entry(0, 2048);
        table.set_entry(1020, 2049);
        table.flush(&mut dev).unwrap();
        assert_eq!(table.eblkofs(), 5);

        let reloaded = MappingTable::load(&dev, &geometry).unwrap();
        assert_eq!(reloaded.entry(0), Some(2048));
        assert_eq!(reloaded.entry(1020), Some(2049));
        assert_eq!(reloaded.entry(2040), None);
        assert!(reloaded.map_blks().iter().all(|blk| blk.ver == 1));

        // a second flush with nothing dirty writes nothing
        table.flush(&mut dev).unwrap();
        assert_eq!(table.eblkofs(), 5);
    }

    #[test]
    fn repeated_flushes_only_raise_versions() {
        let geometry = test_geometry();
        let (_tmp_file, mut dev) = empty_device(&geometry);

        let mut table = MappingTable::format(&geometry);
        let mut last_ver = 0;
        for round in 0..4u32 {
            table.set_entry(3, 2048 + round);
            table.flush(&mut dev).unwrap();

            let reloaded = MappingTable::load(&dev, &geometry).unwrap();
            assert_eq!(reloaded.entry(3), Some(2048 + round));
            assert!(reloaded.map_blks()[0].ver > last_ver);
            last_ver = reloaded.map_blks()[0].ver;
        }
    }

    #[test]
    fn reclaim_preserves_the_only_copy_of_a_slot() {
        let geometry = test_geometry();
        let (_tmp_file, mut dev) = empty_device(&geometry);

        let mut table = MappingTable::format(&geometry);
        table.set_entry(0, 2048);
        table.flush(&mut dev).unwrap();
        // slot 0's only on-disk copy now sits at region offset 0; keep appending until the window
        // wraps far enough that the first section has to be reclaimed
        let ver_before = table.map_blks()[0].ver;

        for _ in 0..1024 {
            table.set_entry(2040, 2050);
            table.flush(&mut dev).unwrap();
        }
        assert!(table.map_blks()[0].ver > ver_before);

        let reloaded = MappingTable::load(&dev, &geometry).unwrap();
        assert_eq!(reloaded.entry(0), Some(2048));
        assert_eq!(reloaded.entry(2040), Some(2050));
    }
}
