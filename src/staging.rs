use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Placeholder substituted by [`render_file_name`]
pub const FILE_STUB_PLACEHOLDER: &str = "{file_stub}";

pub const DEFAULT_FILE_PATTERN: &str = "{file_stub}.png";

const STAGING_PREFIX: &str = "omero-staging-";

/// Scratch directory for files produced just before an upload
///
/// Removed when dropped, so the cleanup happens even when the upload fails.
pub struct StagingArea {
    dir: TempDir,
}

impl StagingArea {
    pub fn new() -> std::io::Result<Self> {
        Self::create(tempfile::Builder::new().prefix(STAGING_PREFIX).tempdir()?)
    }

    /// Create the staging area inside `base` instead of the system temp dir
    pub fn new_in(base: &Path) -> std::io::Result<Self> {
        Self::create(tempfile::Builder::new().prefix(STAGING_PREFIX).tempdir_in(base)?)
    }

    fn create(dir: TempDir) -> std::io::Result<Self> {
        debug!("Created staging area {}", dir.path().display());
        Ok(StagingArea { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `data` into the staging area under the final component of `name`
    pub async fn write(&self, name: &str, data: &[u8]) -> std::io::Result<PathBuf> {
        let file_name = Path::new(name).file_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("'{}' is not a file name", name),
            )
        })?;
        let path = self.dir.path().join(file_name);
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    /// Remove the directory now, reporting any failure
    pub fn close(self) -> std::io::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        debug!("Removed staging area {}", path.display());
        Ok(())
    }
}

/// Fill `{file_stub}` in an output file pattern
pub fn render_file_name(pattern: &str, file_stub: &str) -> String {
    pattern.replace(FILE_STUB_PLACEHOLDER, file_stub)
}
