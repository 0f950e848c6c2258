use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{BuildError, Result};

/// Archives every materialized object's raw bytes before placement, one
/// sequentially numbered file per object. Observational only; nothing
/// downstream reads these back.
#[derive(Debug)]
pub struct ObjectArchive {
    dir: PathBuf,
    count: usize,
}

impl ObjectArchive {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|source| BuildError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(ObjectArchive {
            dir: dir.to_path_buf(),
            count: 0,
        })
    }

    /// Writes the object verbatim and returns its sequence index.
    pub fn archive(&mut self, bytes: &[u8]) -> Result<usize> {
        let index = self.count;
        let path = self.dir.join(format!("object_{index}.bin"));
        fs::write(&path, bytes).map_err(|source| BuildError::Io { path: path.clone(), source })?;
        info!(path = %path.display(), size = bytes.len(), "archived object");
        self.count += 1;
        Ok(index)
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objects_are_numbered_sequentially() {
        let dir = tempfile::tempdir().unwrap();
        let mut archive = ObjectArchive::new(dir.path()).unwrap();

        assert_eq!(archive.archive(&[1, 2, 3]).unwrap(), 0);
        assert_eq!(archive.archive(&[4]).unwrap(), 1);

        assert_eq!(fs::read(dir.path().join("object_0.bin")).unwrap(), [1, 2, 3]);
        assert_eq!(fs::read(dir.path().join("object_1.bin")).unwrap(), [4]);
    }
}
