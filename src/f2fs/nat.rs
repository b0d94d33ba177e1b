use std::mem::size_of;

use static_assertions::const_assert_eq;

use crate::f2fs::NAT_ENTRY_PER_BLOCK;

/// One node-address-table entry: where the node with this entry's nid currently lives.
#[repr(C, packed)]
#[derive(Copy, Clone, Default)]
pub struct NatEntry {
    pub version: u8,
    pub ino: u32,
    pub block_addr: u32,
}

const_assert_eq!(size_of::<NatEntry>(), 9);

/// A block of NAT entries. One byte short of a full block; the formatter zero-pads it on write.
#[repr(C, packed)]
#[derive(Copy, Clone)]
pub struct NatBlock {
    pub entries: [NatEntry; NAT_ENTRY_PER_BLOCK],
}

const_assert_eq!(size_of::<NatBlock>(), 4095);

impl NatBlock {
    pub fn new() -> Self {
        // SAFETY: all-zero bytes are a valid NatBlock
        unsafe { std::mem::zeroed() }
    }

    pub fn set_entry(&mut self, nid: u32, ino: u32, block_addr: u32) {
        self.entries[nid as usize] = NatEntry { version: 0, ino, block_addr };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BLOCK_SIZE;
    use crate::f2fs::struct_block;

    #[test]
    fn entries_land_at_nine_byte_strides() {
        let mut nat = NatBlock::new();
        nat.set_entry(3, 3, 0x11223344);

        // SAFETY: NatBlock is a packed plain-data record
        let block = unsafe { struct_block(&nat) };
        assert_eq!(block.len(), BLOCK_SIZE);
        // entry 3 starts at byte 27: version, then ino, then block_addr
        assert_eq!(block[27], 0);
        assert_eq!(&block[28..32], &[3, 0, 0, 0]);
        assert_eq!(&block[32..36], &[0x44, 0x33, 0x22, 0x11]);
        // the trailing pad byte stays zero
        assert_eq!(block[4095], 0);
    }
}
