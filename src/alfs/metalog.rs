use log::{debug, warn};

use crate::alfs::mapping::MappingTable;
use crate::alfs::ring::GcWindow;
use crate::alfs::summary::{BlockState, SummaryTable};
use crate::alfs::{BlkOfs, Lba, Pba};
use crate::error::{AlfsError, Region, Result};
use crate::geometry::Geometry;

/// Append state of the physical meta-log region: the validity summary plus the circular window
/// the append and reclaim cursors move through. Translation and relocation live one level up,
/// where the mapping table is in reach.
pub struct MetaLog {
    /// Device block at which the meta-log region starts; also the first logical meta address.
    blkofs: u32,
    nr_logi_blks: u32,
    nr_phys_blks: u32,
    blks_per_sec: u32,
    summary: SummaryTable,
    win: GcWindow,
}

impl MetaLog {
    /// Meta-log state for a fresh format: everything is free and appends start at the region
    /// base.
    pub fn format(geometry: &Geometry) -> Self {
        Self {
            blkofs: geometry.metalog_blkofs(),
            nr_logi_blks: geometry.nr_metalog_logi_blks(),
            nr_phys_blks: geometry.nr_metalog_phys_blks(),
            blks_per_sec: geometry.blks_per_sec(),
            summary: SummaryTable::all_free(geometry.nr_metalog_phys_blks(), geometry.blks_per_sec()),
            win: GcWindow::fresh(Region::Metalog, geometry.nr_metalog_phys_blks(), geometry.blks_per_sec()),
        }
    }

    /// Rebuilds the summary from the loaded mapping table: every physical block some mapping entry
    /// points at is valid, everything else is stale. The first fully stale section is cleared and
    /// becomes the free window; without one the meta-log cannot accept appends.
    pub fn rebuild(geometry: &Geometry, mapping: &MappingTable) -> Result<Self> {
        let blkofs = geometry.metalog_blkofs();
        let nr_phys_blks = geometry.nr_metalog_phys_blks();
        let mut summary = SummaryTable::all_invalid(nr_phys_blks, geometry.blks_per_sec());

        for map_blk in mapping.map_blks() {
            for pba in map_blk.entries() {
                if pba < blkofs || pba - blkofs >= nr_phys_blks {
                    warn!("mapping entry references {:#x} outside the meta-log, ignoring", pba);
                    continue;
                }
                summary.set_state(pba - blkofs, BlockState::Valid);
            }
        }

        let free_section = summary.first_dead_section().ok_or(AlfsError::NoFreeSpace(Region::Metalog))?;
        debug!("dead meta-log section detected: {}", free_section);
        summary.clear_section(free_section);

        Ok(Self {
            blkofs,
            nr_logi_blks: geometry.nr_metalog_logi_blks(),
            nr_phys_blks,
            blks_per_sec: geometry.blks_per_sec(),
            summary,
            win: GcWindow::from_dead_section(Region::Metalog, nr_phys_blks, geometry.blks_per_sec(), free_section),
        })
    }

    pub fn blkofs(&self) -> u32 {
        self.blkofs
    }

    pub fn nr_logi_blks(&self) -> u32 {
        self.nr_logi_blks
    }

    pub fn nr_phys_blks(&self) -> u32 {
        self.nr_phys_blks
    }

    /// Whether `lba` lies in the logical meta address space.
    pub fn contains_lba(&self, lba: Lba) -> bool {
        lba >= self.blkofs && lba - self.blkofs < self.nr_logi_blks
    }

    /// Whether `pba` lies in the physical meta-log region.
    pub fn contains_pba(&self, pba: Pba) -> bool {
        pba >= self.blkofs && pba - self.blkofs < self.nr_phys_blks
    }

    pub fn summary(&self) -> &SummaryTable {
        &self.summary
    }

    pub fn state(&self, pba: Pba) -> BlockState {
        self.summary.state(pba - self.blkofs)
    }

    pub fn mark_valid(&mut self, pba: Pba) {
        self.summary.set_state(pba - self.blkofs, BlockState::Valid);
    }

    pub fn invalidate(&mut self, pba: Pba) {
        self.summary.set_state(pba - self.blkofs, BlockState::Invalid);
    }

    /// Hands out the physical block under the append cursor. The cursor block must be free; a
    /// non-free cursor means the region ran out of reclaimable space.
    pub fn alloc_pba(&self) -> Result<Pba> {
        let eblkofs = self.win.eblkofs();
        if self.summary.state(eblkofs) != BlockState::Free {
            warn!(
                "append cursor at region offset {} is not free ({:?})",
                eblkofs,
                self.summary.state(eblkofs)
            );
            return Err(AlfsError::NoFreeSpace(Region::Metalog));
        }
        Ok(self.blkofs + eblkofs)
    }

    pub fn advance_end(&mut self) {
        self.win.advance_end();
    }

    pub fn free_blks(&self) -> Result<u32> {
        self.win.free_blks()
    }

    pub fn needs_gc(&self) -> bool {
        self.win.needs_gc()
    }

    pub fn sblkofs(&self) -> BlkOfs {
        self.win.sblkofs()
    }

    pub fn eblkofs(&self) -> BlkOfs {
        self.win.eblkofs()
    }

    /// Picks the reclaim victim: the used section holding the most stale blocks. Returns its first
    /// region-relative block, or None when nothing is reclaimable.
    pub fn victim_section(&self) -> Option<BlkOfs> {
        let mut victim = None;
        let mut victim_invalid = 0;
        for section_start in self.win.used_sections() {
            let invalid = self.summary.invalid_blks_in_section(section_start / self.blks_per_sec);
            if invalid > victim_invalid {
                victim = Some(section_start);
                victim_invalid = invalid;
            }
        }
        victim
    }

    /// Marks a whole reclaimed section free and advances the reclaim cursor by one section.
    pub fn finish_reclaim(&mut self, section_start: BlkOfs) {
        self.summary.clear_section(section_start / self.blks_per_sec);
        self.win.reclaim_section();
    }
}
