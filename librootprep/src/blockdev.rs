use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use failure::ResultExt;
use libc;

use crate::{ErrorKind, Result};

pub const SECTOR_SIZE: usize = 512;

// O_DIRECT transfers must use memory aligned to the logical block size.
const REQUIRED_ALIGNMENT: usize = 4096;

ioctl_read!(blk_getsize64, 0x12, 114, u64);

/// A byte buffer whose accessible region starts on a physical address
/// aligned for direct block device I/O.
pub struct AlignedBuffer {
    buffer: Vec<u8>,
    offset: usize,
    size: usize,
}

impl AlignedBuffer {
    pub fn new(size: usize) -> AlignedBuffer {
        let buffer = vec![0u8; size + REQUIRED_ALIGNMENT];
        let addr = buffer.as_ptr() as usize;
        let offset = REQUIRED_ALIGNMENT - (addr & (REQUIRED_ALIGNMENT - 1));
        AlignedBuffer { buffer, offset, size }
    }

    pub fn from_slice(bytes: &[u8]) -> AlignedBuffer {
        let mut ab = AlignedBuffer::new(bytes.len());
        ab.as_mut().copy_from_slice(bytes);
        ab
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buffer[self.offset..self.offset + self.size]
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.offset..self.offset + self.size]
    }
}

/// A block device open for direct I/O.
pub struct BlockDev {
    file: File,
}

impl BlockDev {
    pub fn open_ro(path: impl AsRef<Path>) -> Result<BlockDev> {
        BlockDev::open(path.as_ref(), false)
    }

    pub fn open_rw(path: impl AsRef<Path>) -> Result<BlockDev> {
        BlockDev::open(path.as_ref(), true)
    }

    fn open(path: &Path, write: bool) -> Result<BlockDev> {
        let mut oo = OpenOptions::new();
        oo.read(true);
        oo.write(write);
        oo.custom_flags(libc::O_DIRECT | libc::O_SYNC);
        let file = oo.open(path).context(ErrorKind::Io)?;
        Ok(BlockDev { file })
    }

    /// Size of the device in bytes, from the BLKGETSIZE64 ioctl.
    pub fn size(&self) -> Result<u64> {
        let mut sz = 0u64;
        unsafe {
            blk_getsize64(self.file.as_raw_fd(), &mut sz)
                .context(ErrorKind::Io)?;
        }
        Ok(sz)
    }

    /// Number of 512 byte sectors on the device.
    pub fn nsectors(&self) -> Result<u64> {
        Ok(self.size()? >> 9)
    }

    fn seek_sector(&mut self, sector: u64, len: usize) -> Result<()> {
        if len % SECTOR_SIZE != 0 {
            fail!(ErrorKind::Internal, "buffer length {} is not a multiple of the sector size", len);
        }
        let count = (len / SECTOR_SIZE) as u64;
        if sector + count > self.nsectors()? {
            fail!(ErrorKind::Io, "sector range {}+{} is past end of device", sector, count);
        }
        self.file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
        Ok(())
    }

    /// Read whole sectors starting at `sector` into an aligned buffer.
    pub fn read_sectors(&mut self, sector: u64, buffer: &mut AlignedBuffer) -> Result<()> {
        self.seek_sector(sector, buffer.as_ref().len())?;
        self.file.read_exact(buffer.as_mut())?;
        Ok(())
    }

    /// Write whole sectors from an aligned buffer starting at `sector`.
    pub fn write_sectors(&mut self, sector: u64, buffer: &AlignedBuffer) -> Result<()> {
        self.seek_sector(sector, buffer.as_ref().len())?;
        self.file.write_all(buffer.as_ref())?;
        Ok(())
    }

    /// Read the final `len` bytes of the device. `len` must be a multiple of
    /// the sector size.
    pub fn read_tail(&mut self, len: usize) -> Result<Vec<u8>> {
        let nsectors = self.nsectors()?;
        let count = (len / SECTOR_SIZE) as u64;
        if nsectors < count {
            fail!(ErrorKind::Io, "device is too short ({} sectors) to hold a {} byte trailer", nsectors, len);
        }
        let mut buffer = AlignedBuffer::new(len);
        self.read_sectors(nsectors - count, &mut buffer)?;
        Ok(buffer.as_ref().to_vec())
    }

    /// Overwrite the final `len` bytes of the device.
    pub fn write_tail(&mut self, bytes: &[u8]) -> Result<()> {
        let nsectors = self.nsectors()?;
        let count = (bytes.len() / SECTOR_SIZE) as u64;
        if nsectors < count {
            fail!(ErrorKind::Io, "device is too short ({} sectors) to hold a {} byte trailer", nsectors, bytes.len());
        }
        let buffer = AlignedBuffer::from_slice(bytes);
        self.write_sectors(nsectors - count, &buffer)
    }
}
