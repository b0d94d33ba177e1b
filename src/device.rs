use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use log::debug;
use memmap::{MmapMut, MmapOptions};
use nix::ioctl_read;

use crate::error;

/// All device I/O happens in whole blocks of this size.
pub const BLOCK_SIZE: usize = 4096;

// TODO macos support
pub struct Device {
    mmap: MmapMut,
}

impl Device {
    pub fn open<P: AsRef<Path>>(device_path: P) -> Result<Self> {
        let device_path = device_path.as_ref().canonicalize()?;
        let file = OpenOptions::new().read(true).write(true).create(false).open(&device_path)?;
        if file.metadata()?.file_type().is_block_device() && Self::is_mounted(device_path.as_path())? {
            bail!("Device is already mounted");
        }
        // the lock is only advisory, other processes may still access the file
        // the lock is automatically released after both file and mmap are dropped
        file.try_lock_exclusive()?;

        let size = Self::get_file_size(&file)?;
        if size < 2 * BLOCK_SIZE {
            bail!("Device is too small to hold even a superblock");
        }
        // SAFETY: We assume that no other process is modifying the device
        let mmap = unsafe { MmapOptions::new().len(size - size % BLOCK_SIZE).map_mut(&file)? };
        Ok(Self { mmap })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn block_count(&self) -> u32 {
        (self.len() / BLOCK_SIZE).try_into().unwrap_or(u32::MAX)
    }

    /// Reads the 4 KiB block at the absolute physical block number `pba` into `page`.
    pub fn read_block(&self, page: &mut [u8], pba: u32) -> error::Result<()> {
        assert_eq!(page.len(), BLOCK_SIZE);
        let range = self.block_range(pba)?;
        page.copy_from_slice(&self.mmap[range]);
        Ok(())
    }

    /// Borrows the 4 KiB block at `pba` without copying.
    pub fn block(&self, pba: u32) -> error::Result<&[u8]> {
        let range = self.block_range(pba)?;
        Ok(&self.mmap[range])
    }

    /// Writes `buf` (a whole number of blocks) at an absolute byte offset.
    pub fn write_block(&mut self, buf: &[u8], byte_offset: u64) -> error::Result<()> {
        assert_eq!(buf.len() % BLOCK_SIZE, 0);
        let start = usize::try_from(byte_offset)
            .map_err(|_| self.out_of_range_error(byte_offset))?;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.len())
            .ok_or_else(|| self.out_of_range_error(byte_offset))?;
        self.mmap[start..end].copy_from_slice(buf);
        Ok(())
    }

    /// Discards the whole device. Memory-mapped writes have no real discard, so the device is
    /// zero-filled instead, which reads back the same.
    pub fn trim(&mut self) {
        debug!("trimming {} blocks", self.block_count());
        self.mmap.iter_mut().for_each(|byte| *byte = 0);
    }

    pub fn flush(&mut self) -> error::Result<()> {
        self.mmap.flush()?;
        Ok(())
    }

    fn block_range(&self, pba: u32) -> error::Result<std::ops::Range<usize>> {
        let start = pba as usize * BLOCK_SIZE;
        if start + BLOCK_SIZE > self.len() {
            return Err(self.out_of_range_error(start as u64));
        }
        Ok(start..start + BLOCK_SIZE)
    }

    fn out_of_range_error(&self, byte_offset: u64) -> error::AlfsError {
        error::AlfsError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("access at byte {} is beyond the device end ({} bytes)", byte_offset, self.len()),
        ))
    }

    fn get_file_size(file: &File) -> Result<usize> {
        let metadata = file.metadata()?;
        let filetype = metadata.file_type();
        let len = if filetype.is_file() {
            metadata.len()
        } else if filetype.is_block_device() {
            Self::get_block_device_size(file)?
        } else {
            bail!("Expected path to a file or a block device")
        };

        len.try_into()
            .with_context(|| format!("File size {} does not fit into a usize", len))
    }

    fn is_mounted(device_path: &Path) -> Result<bool> {
        let path_str = device_path.to_str().context("Device path is not valid UTF-8")?;
        let output_bytes = Command::new("mount").output()?.stdout;
        let output = String::from_utf8(output_bytes).context("mount output is not valid UTF-8")?;
        Ok(output.lines().any(|line| line.starts_with(path_str)))
    }

    // declared in linux/fs.h
    // The type is declared as size_t due to a bug that cannot be fixed due to backwards compatibility. If I understand
    // correctly, passing u64 instead of usize should work even on 32bit systems, I haven't had a chance to test it
    // though. cfr. https://lists.debian.org/debian-glibc/2005/12/msg00069.html
    #[cfg(target_os = "linux")]
    ioctl_read!(block_device_size, 0x12, 114, u64);

    /// PANICS: Panics if `file` is not a block device.
    #[cfg(target_os = "linux")]
    fn get_block_device_size(file: &File) -> Result<u64> {
        assert!(file.metadata()?.file_type().is_block_device());
        let mut size = 0;
        // SAFETY: the nix crate provides no safety documentation, so we must just assume that this is safe.
        unsafe {
            Self::block_device_size(file.as_raw_fd(), &mut size)?;
        }
        Ok(size)
    }
}
