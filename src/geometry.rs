use crate::alfs::NR_MAPPING_ROOMS;
use crate::error::{AlfsError, Result};

/// Number of sections reserved for the superblock region.
pub const NR_SUPERBLK_SECS: u32 = 1;
/// Number of sections reserved for the mapping region.
pub const NR_MAPPING_SECS: u32 = 3;
/// Over-provisioning factor of the meta-log: physical length = logical length × this. Must be even
/// so that the physical region splits into whole logical images.
pub const NR_METALOG_TIMES: u32 = 2;

/// Base-FS parameters the indirection layer derives its on-device layout from. All lengths are in
/// blocks unless stated otherwise; the region order on the device is superblock, mapping,
/// meta-log, main.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub blks_per_seg: u32,
    pub segs_per_sec: u32,
    pub segment_count_ckpt: u32,
    pub segment_count_sit: u32,
    pub segment_count_nat: u32,
    pub segment_count_ssa: u32,
}

impl Geometry {
    pub fn new(
        blks_per_seg: u32,
        segs_per_sec: u32,
        segment_count_ckpt: u32,
        segment_count_sit: u32,
        segment_count_nat: u32,
        segment_count_ssa: u32,
    ) -> Result<Self> {
        let geometry = Self {
            blks_per_seg,
            segs_per_sec,
            segment_count_ckpt,
            segment_count_sit,
            segment_count_nat,
            segment_count_ssa,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    fn validate(&self) -> Result<()> {
        if self.blks_per_seg == 0 || self.segs_per_sec == 0 {
            return Err(AlfsError::Configuration(format!(
                "a section must not be empty ({} blocks per segment, {} segments per section)",
                self.blks_per_seg, self.segs_per_sec
            )));
        }
        if NR_METALOG_TIMES % 2 != 0 || NR_METALOG_TIMES < 2 {
            return Err(AlfsError::Configuration(format!(
                "the meta-log over-provisioning factor must be even, got {}",
                NR_METALOG_TIMES
            )));
        }
        if self.nr_meta_segments() == 0 {
            return Err(AlfsError::Configuration(
                "the meta area contains no segments, the meta-log would be empty".to_string(),
            ));
        }
        if self.nr_metalog_phys_blks() < 2 * self.blks_per_sec() {
            return Err(AlfsError::Configuration(format!(
                "the physical meta-log ({} blocks) is smaller than two sections, leaving no room to append",
                self.nr_metalog_phys_blks()
            )));
        }
        if self.nr_metalog_phys_blks() % self.blks_per_sec() != 0 {
            return Err(AlfsError::Configuration(format!(
                "the physical meta-log ({} blocks) is not a whole number of sections ({} blocks each)",
                self.nr_metalog_phys_blks(),
                self.blks_per_sec()
            )));
        }
        Ok(())
    }

    pub fn blks_per_sec(&self) -> u32 {
        self.segs_per_sec * self.blks_per_seg
    }

    fn nr_meta_segments(&self) -> u32 {
        self.segment_count_ckpt + self.segment_count_sit + self.segment_count_nat + self.segment_count_ssa
    }

    /// First block of the mapping region.
    pub fn mapping_blkofs(&self) -> u32 {
        self.blks_per_sec() * NR_SUPERBLK_SECS
    }

    /// First block of the meta-log region; also the first logical meta address.
    pub fn metalog_blkofs(&self) -> u32 {
        self.blks_per_sec() * (NR_SUPERBLK_SECS + NR_MAPPING_SECS)
    }

    pub fn nr_mapping_phys_blks(&self) -> u32 {
        NR_MAPPING_SECS * self.blks_per_sec()
    }

    pub fn nr_metalog_logi_blks(&self) -> u32 {
        self.nr_meta_segments() * self.blks_per_seg
    }

    pub fn nr_metalog_phys_blks(&self) -> u32 {
        self.nr_metalog_logi_blks() * NR_METALOG_TIMES
    }

    /// First block of the main area, right behind the over-provisioned meta-log.
    pub fn main_blkofs(&self) -> u32 {
        self.metalog_blkofs() + self.nr_metalog_phys_blks()
    }

    /// Number of mapping blocks needed to cover every logical meta block.
    pub fn nr_map_blks(&self) -> u32 {
        let rooms = NR_MAPPING_ROOMS as u32;
        (self.nr_metalog_logi_blks() + rooms - 1) / rooms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // the geometry used throughout the core tests: S = 512, L_meta = 4096, P = 8192
    fn test_geometry() -> Geometry {
        Geometry::new(512, 1, 2, 2, 2, 2).unwrap()
    }

    #[test]
    fn derives_region_layout() {
        let geometry = test_geometry();
        assert_eq!(geometry.blks_per_sec(), 512);
        assert_eq!(geometry.mapping_blkofs(), 512);
        assert_eq!(geometry.nr_mapping_phys_blks(), 1536);
        assert_eq!(geometry.metalog_blkofs(), 2048);
        assert_eq!(geometry.nr_metalog_logi_blks(), 4096);
        assert_eq!(geometry.nr_metalog_phys_blks(), 8192);
        assert_eq!(geometry.main_blkofs(), 10240);
    }

    #[test]
    fn rounds_mapping_block_count_up() {
        // 4096 logical blocks need ceil(4096 / 1020) = 5 mapping blocks
        assert_eq!(test_geometry().nr_map_blks(), 5);
        let exact = Geometry::new(1020, 1, 1, 1, 1, 1).unwrap();
        assert_eq!(exact.nr_map_blks(), 4);
    }

    #[test]
    fn rejects_empty_section() {
        assert!(matches!(
            Geometry::new(0, 1, 2, 2, 2, 2),
            Err(AlfsError::Configuration(_))
        ));
        assert!(matches!(
            Geometry::new(512, 0, 2, 2, 2, 2),
            Err(AlfsError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_empty_meta_area() {
        assert!(matches!(
            Geometry::new(512, 1, 0, 0, 0, 0),
            Err(AlfsError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_unaligned_metalog() {
        // 5 meta segments of 2 blocks each: 20 physical meta-log blocks in 6-block sections
        assert!(matches!(
            Geometry::new(2, 3, 2, 1, 1, 1),
            Err(AlfsError::Configuration(_))
        ));
    }

    #[test]
    fn rejects_a_metalog_below_two_sections() {
        // 3 meta segments of one block each: 6 physical meta-log blocks, section size 4
        assert!(matches!(
            Geometry::new(1, 4, 1, 1, 1, 0),
            Err(AlfsError::Configuration(_))
        ));
    }
}
