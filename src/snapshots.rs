use anyhow::{Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};

pub const MAX_SNAPSHOT_BYTES: u64 = 10 * 1024 * 1024;

/// Snapshot images served under `/snapshots/<file>`.
#[derive(Clone, Debug)]
pub struct SnapshotDirectory {
    root: PathBuf,
}

#[derive(Debug, PartialEq, Eq)]
pub struct SnapshotImage {
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

impl SnapshotDirectory {
    /// Creates the directory if it does not exist yet.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create snapshot directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `None` for anything that is not a plain, readable image file name.
    pub fn load(&self, name: &str) -> Option<SnapshotImage> {
        let content_type = image_content_type(name)?;
        let path = self.root.join(name);
        let file = std::fs::File::open(&path).ok()?;
        let meta = file.metadata().ok()?;
        if !meta.is_file() || meta.len() > MAX_SNAPSHOT_BYTES {
            return None;
        }
        let mut bytes = Vec::with_capacity(meta.len() as usize);
        if let Err(err) = file.take(MAX_SNAPSHOT_BYTES).read_to_end(&mut bytes) {
            log::warn!("failed to read snapshot {}: {}", path.display(), err);
            return None;
        }
        Some(SnapshotImage {
            content_type,
            bytes,
        })
    }
}

fn image_content_type(name: &str) -> Option<&'static str> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.starts_with('.')
    {
        return None;
    }
    let (_, ext) = name.rsplit_once('.')?;
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        _ => None,
    }
}
