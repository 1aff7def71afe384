// Image file reader/writer
use prost::Message;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SplitError};
use crate::proto::StateImage;

/// "SPLT"
pub const IMAGE_MAGIC: u32 = 0x53504c54;
pub const IMAGE_TYPE_STATE: u32 = 1;
pub const STATE_IMAGE: &str = "splitproc.img";

const HEADER_LEN: usize = 12;

pub struct ImageDir {
    path: PathBuf,
}

impl ImageDir {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(SplitError::ImageNotFound {
                path: path.display().to_string(),
            });
        }
        Ok(ImageDir { path })
    }

    /// Open `path`, creating it first if needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(path.as_ref())?;
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_image_file(&self, filename: &str, image_type: u32) -> Result<Vec<u8>> {
        let img_path = self.path.join(filename);
        let mut file = File::open(&img_path).map_err(|_| SplitError::ImageNotFound {
            path: img_path.display().to_string(),
        })?;

        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        // Image format:
        // - 4 bytes: magic number
        // - 4 bytes: image type identifier
        // - 4 bytes: payload size (little-endian u32)
        // - N bytes: protobuf data

        if buffer.len() < HEADER_LEN {
            return Err(SplitError::InvalidImage {
                reason: format!("{} is too small (< {} bytes)", filename, HEADER_LEN),
            });
        }
        let word = |i: usize| u32::from_le_bytes([buffer[i], buffer[i + 1], buffer[i + 2], buffer[i + 3]]);
        let (magic, kind, size) = (word(0), word(4), word(8) as usize);
        if magic != IMAGE_MAGIC {
            return Err(SplitError::InvalidImage {
                reason: format!("{}: bad magic 0x{:08x}", filename, magic),
            });
        }
        if kind != image_type {
            return Err(SplitError::InvalidImage {
                reason: format!("{}: image type {} (expected {})", filename, kind, image_type),
            });
        }
        if buffer.len() - HEADER_LEN != size {
            return Err(SplitError::InvalidImage {
                reason: format!(
                    "{}: payload is {} bytes, header says {}",
                    filename,
                    buffer.len() - HEADER_LEN,
                    size
                ),
            });
        }

        buffer.drain(..HEADER_LEN);
        Ok(buffer)
    }

    fn write_image_file(&self, filename: &str, image_type: u32, payload: &[u8]) -> Result<()> {
        let size = u32::try_from(payload.len()).map_err(|_| SplitError::InvalidImage {
            reason: format!("{}: payload of {} bytes is too large", filename, payload.len()),
        })?;

        // Write to a sibling and rename so a crash never leaves a torn image.
        let img_path = self.path.join(filename);
        let tmp_path = self.path.join(format!(".{}.tmp", filename));
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&IMAGE_MAGIC.to_le_bytes())?;
            file.write_all(&image_type.to_le_bytes())?;
            file.write_all(&size.to_le_bytes())?;
            file.write_all(payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &img_path)?;
        Ok(())
    }

    /// Read splitproc.img
    pub fn read_state(&self) -> Result<StateImage> {
        let data = self.read_image_file(STATE_IMAGE, IMAGE_TYPE_STATE)?;
        let state = StateImage::decode(&data[..]).map_err(|e| SplitError::InvalidImage {
            reason: format!("Failed to decode state: {}", e),
        })?;
        Ok(state)
    }

    pub fn write_state(&self, state: &StateImage) -> Result<()> {
        self.write_image_file(STATE_IMAGE, IMAGE_TYPE_STATE, &state.encode_to_vec())?;
        log::debug!(
            "Wrote {} ({} handles, {} records)",
            self.path.join(STATE_IMAGE).display(),
            state.handles.len(),
            state.records.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::HandleEntry;

    #[test]
    fn test_write_then_read_state() {
        let dir = tempfile::tempdir().unwrap();
        let img = ImageDir::create(dir.path()).unwrap();
        let state = StateImage {
            version: 1,
            handles: vec![HandleEntry {
                handle: 0x2000_0004,
                tombstoned: true,
            }],
            next_serials: vec![1, 5, 1, 1, 1, 1],
            next_seq: 9,
            records: vec![],
        };
        img.write_state(&state).unwrap();
        assert_eq!(img.read_state().unwrap(), state);
    }

    #[test]
    fn test_missing_dir_and_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageDir::open(dir.path().join("nope")),
            Err(SplitError::ImageNotFound { .. })
        ));
        let img = ImageDir::open(dir.path()).unwrap();
        assert!(matches!(img.read_state(), Err(SplitError::ImageNotFound { .. })));
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let img = ImageDir::open(dir.path()).unwrap();

        fs::write(dir.path().join(STATE_IMAGE), [0u8; 4]).unwrap();
        assert!(matches!(img.read_state(), Err(SplitError::InvalidImage { .. })));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
        bytes.extend_from_slice(&IMAGE_TYPE_STATE.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        fs::write(dir.path().join(STATE_IMAGE), &bytes).unwrap();
        assert!(matches!(img.read_state(), Err(SplitError::InvalidImage { .. })));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&IMAGE_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&IMAGE_TYPE_STATE.to_le_bytes());
        bytes.extend_from_slice(&10u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 3]);
        fs::write(dir.path().join(STATE_IMAGE), &bytes).unwrap();
        assert!(matches!(img.read_state(), Err(SplitError::InvalidImage { .. })));
    }
}
