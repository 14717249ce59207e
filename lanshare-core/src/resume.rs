//! Receiver-side resume bookkeeping: a bincode sidecar next to the partial file.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::bitmap::ChunkBitmap;

/// Suffix of the partial download and of its sidecar.
pub const PART_SUFFIX: &str = ".part";
pub const RESUME_SUFFIX: &str = ".resume";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub session_id: [u8; 16],
    pub total_bytes: u64,
    pub chunk_size: u32,
    pub bitmap: ChunkBitmap,
}

/// `<dest>.part`
pub fn part_path(dest: &Path) -> PathBuf {
    with_suffix(dest, PART_SUFFIX)
}

/// `<dest>.part.resume`
pub fn sidecar_path(dest: &Path) -> PathBuf {
    with_suffix(&part_path(dest), RESUME_SUFFIX)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

impl ResumeRecord {
    /// Whether this record describes the same transfer layout.
    pub fn matches(&self, session_id: [u8; 16], total_bytes: u64, chunk_size: u32) -> bool {
        self.session_id == session_id
            && self.total_bytes == total_bytes
            && self.chunk_size == chunk_size
    }

    /// Write atomically: temp file then rename.
    pub async fn save(&self, path: &Path) -> io::Result<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = with_suffix(path, ".tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await
    }

    /// `Ok(None)` if there is no sidecar; a corrupt sidecar is an error.
    pub async fn load(path: &Path) -> io::Result<Option<Self>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let record = bincode::deserialize(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(record))
    }

    /// Remove a sidecar; missing is fine.
    pub async fn remove(path: &Path) -> io::Result<()> {
        match tokio::fs::remove_file(path).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_append_suffixes() {
        let dest = Path::new("/downloads/movie.mp4");
        assert_eq!(part_path(dest), PathBuf::from("/downloads/movie.mp4.part"));
        assert_eq!(
            sidecar_path(dest),
            PathBuf::from("/downloads/movie.mp4.part.resume")
        );
    }

    #[tokio::test]
    async fn save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = sidecar_path(&dir.path().join("a.bin"));
        assert_eq!(ResumeRecord::load(&path).await.unwrap(), None);

        let mut bitmap = ChunkBitmap::new(4);
        bitmap.set(1);
        bitmap.set(3);
        let record = ResumeRecord {
            session_id: [9; 16],
            total_bytes: 100,
            chunk_size: 30,
            bitmap,
        };
        record.save(&path).await.unwrap();
        let loaded = ResumeRecord::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(loaded.matches([9; 16], 100, 30));
        assert!(!loaded.matches([9; 16], 101, 30));

        ResumeRecord::remove(&path).await.unwrap();
        ResumeRecord::remove(&path).await.unwrap();
        assert_eq!(ResumeRecord::load(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_sidecar_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.resume");
        tokio::fs::write(&path, b"\x01").await.unwrap();
        assert!(ResumeRecord::load(&path).await.is_err());
    }
}
