// Disk images for the floppy and SCSI paths. Both controllers see the same
// interface: a byte blob addressed by offset, identified across checkpoints by
// its filename. File-backed images load fully into memory and are written back
// on flush; the in-memory variant backs the tests.

use crate::error::Error;
use crate::logging::Cat;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

pub const FLOPPY_400K: usize = 400 * 1024;
pub const FLOPPY_800K: usize = 800 * 1024;
pub const FLOPPY_720K: usize = 720 * 1024;
pub const FLOPPY_1440K: usize = 1440 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FloppyKind {
    // GCR media
    SingleSided,
    DoubleSided,
    // MFM media, readable through the SWIM only
    Mfm720,
    Mfm1440,
}

impl FloppyKind {
    pub fn sides(&self) -> usize {
        match *self {
            FloppyKind::SingleSided => 1,
            _ => 2,
        }
    }

    pub fn is_gcr(&self) -> bool {
        match *self {
            FloppyKind::SingleSided | FloppyKind::DoubleSided => true,
            _ => false,
        }
    }

    pub fn mfm_sectors_per_track(&self) -> Option<usize> {
        match *self {
            FloppyKind::Mfm720 => Some(9),
            FloppyKind::Mfm1440 => Some(18),
            _ => None,
        }
    }
}

pub trait DiskImage {
    fn read(&self, offset: usize, buf: &mut [u8]) -> usize;
    fn write(&mut self, offset: usize, buf: &[u8]);
    fn size(&self) -> usize;
    fn filename(&self) -> &str;
    fn writable(&self) -> bool;
    fn flush(&mut self);
}

pub fn floppy_kind(image: &dyn DiskImage) -> Result<FloppyKind, Error> {
    match image.size() {
        FLOPPY_400K => Ok(FloppyKind::SingleSided),
        FLOPPY_800K => Ok(FloppyKind::DoubleSided),
        FLOPPY_720K => Ok(FloppyKind::Mfm720),
        FLOPPY_1440K => Ok(FloppyKind::Mfm1440),
        n => Err(Error::DiskFormat { filename: image.filename().to_string(), size: n }),
    }
}

pub struct FileImage {
    path: PathBuf,
    name: String,
    content: Vec<u8>,
    writable: bool,
    dirty: bool,
}

impl FileImage {
    pub fn open(path: &str, writable: bool) -> Result<Self, Error> {
        let content = fs::read(path)?;
        let name = PathBuf::from(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        Ok(FileImage { path: PathBuf::from(path), name, content, writable, dirty: false })
    }
}

impl DiskImage for FileImage {
    fn read(&self, offset: usize, buf: &mut [u8]) -> usize {
        if offset >= self.content.len() {
            return 0;
        }
        let n = buf.len().min(self.content.len() - offset);
        buf[..n].copy_from_slice(&self.content[offset..offset + n]);
        n
    }
    fn write(&mut self, offset: usize, buf: &[u8]) {
        if !self.writable || offset >= self.content.len() {
            return;
        }
        let n = buf.len().min(self.content.len() - offset);
        self.content[offset..offset + n].copy_from_slice(&buf[..n]);
        self.dirty = true;
    }
    fn size(&self) -> usize {
        self.content.len()
    }
    fn filename(&self) -> &str {
        &self.name
    }
    fn writable(&self) -> bool {
        self.writable
    }
    fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        match fs::write(&self.path, &self.content) {
            Ok(()) => self.dirty = false,
            Err(e) => maclog!(Cat::Iwm, Error, "writeback of {} failed: {}", self.name, e),
        }
    }
}

impl Drop for FileImage {
    fn drop(&mut self) {
        self.flush();
    }
}

pub struct MemImage {
    name: String,
    content: Vec<u8>,
    writable: bool,
}

impl MemImage {
    pub fn new(name: &str, content: Vec<u8>, writable: bool) -> Self {
        MemImage { name: name.to_string(), content, writable }
    }
    pub fn blank(name: &str, size: usize) -> Self {
        MemImage::new(name, vec![0; size], true)
    }
    pub fn content(&self) -> &[u8] {
        &self.content
    }
}

impl DiskImage for MemImage {
    fn read(&self, offset: usize, buf: &mut [u8]) -> usize {
        if offset >= self.content.len() {
            return 0;
        }
        let n = buf.len().min(self.content.len() - offset);
        buf[..n].copy_from_slice(&self.content[offset..offset + n]);
        n
    }
    fn write(&mut self, offset: usize, buf: &[u8]) {
        if !self.writable || offset >= self.content.len() {
            return;
        }
        let n = buf.len().min(self.content.len() - offset);
        self.content[offset..offset + n].copy_from_slice(&buf[..n]);
    }
    fn size(&self) -> usize {
        self.content.len()
    }
    fn filename(&self) -> &str {
        &self.name
    }
    fn writable(&self) -> bool {
        self.writable
    }
    fn flush(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_image_bounds() {
        let mut img = MemImage::blank("scratch", 1024);
        img.write(1000, &[0xAA; 64]);
        let mut buf = [0u8; 64];
        assert_eq!(img.read(1000, &mut buf), 24);
        assert_eq!(&buf[..24], &[0xAA; 24]);
        assert_eq!(img.read(2048, &mut buf), 0);
    }

    #[test]
    fn kind_by_size() {
        let img = MemImage::blank("a.img", FLOPPY_400K);
        assert_eq!(floppy_kind(&img).unwrap(), FloppyKind::SingleSided);
        let img = MemImage::blank("b.img", FLOPPY_800K);
        assert_eq!(floppy_kind(&img).unwrap(), FloppyKind::DoubleSided);
        let img = MemImage::blank("c.img", 1234);
        assert!(floppy_kind(&img).is_err());
    }
}
