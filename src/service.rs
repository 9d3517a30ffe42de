// # Remote service seams
//
// Every remote call goes through these traits so the resolve/upload/retrieve
// logic can run against the web gateway or an in-memory server:
//
// - DirectoryService: containers, links, annotations, file bytes, export
// - ImportService: turns a local fileset into image records
// - Session: one authenticated connection exposing both services
// - Connector: opens sessions from credentials

use crate::config::Credentials;
use crate::error::ServiceError;
use crate::model::{
    Annotation, AnnotationId, Dataset, DatasetId, FileId, Image, ImageId, Project, ProjectId,
};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Largest byte range the server hands out per read
pub const DEFAULT_MAX_READ_SIZE: u64 = 1_048_576;

pub const DEFAULT_MIMETYPE: &str = "application/octet-stream";

#[async_trait::async_trait]
pub trait DirectoryService: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<Project>, ServiceError>;
    async fn list_datasets(&self) -> Result<Vec<Dataset>, ServiceError>;
    async fn list_project_datasets(&self, project: ProjectId)
        -> Result<Vec<Dataset>, ServiceError>;
    async fn list_dataset_images(&self, dataset: DatasetId) -> Result<Vec<Image>, ServiceError>;

    async fn create_project(&self, name: &str) -> Result<ProjectId, ServiceError>;
    async fn create_dataset(&self, name: &str) -> Result<DatasetId, ServiceError>;

    async fn link_project_dataset(
        &self,
        project: ProjectId,
        dataset: DatasetId,
    ) -> Result<(), ServiceError>;
    async fn link_dataset_image(&self, dataset: DatasetId, image: ImageId)
        -> Result<(), ServiceError>;

    /// Load an image as an object that annotations can be linked to
    async fn get_image(&self, image: ImageId) -> Result<Image, ServiceError>;

    /// Upload a local file and wrap it in a file annotation
    async fn create_file_annotation(
        &self,
        path: &Path,
        mimetype: &str,
        namespace: &str,
    ) -> Result<AnnotationId, ServiceError>;
    async fn link_image_annotation(
        &self,
        image: &Image,
        annotation: AnnotationId,
    ) -> Result<(), ServiceError>;
    async fn list_image_annotations(
        &self,
        image: ImageId,
        namespace: Option<&str>,
    ) -> Result<Vec<Annotation>, ServiceError>;

    /// Read `length` bytes of a stored file starting at `offset`
    async fn read_file(
        &self,
        file: FileId,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, ServiceError>;

    fn max_read_size(&self) -> u64 {
        DEFAULT_MAX_READ_SIZE
    }

    /// Export an image as OME-TIFF, delivered as a sequence of buffers
    async fn export_ome_tiff(&self, image: ImageId) -> Result<Vec<Vec<u8>>, ServiceError>;
}

#[async_trait::async_trait]
pub trait ImportService: Send + Sync {
    /// Import a fileset, returning `None` when the server reports no result
    async fn import_fileset(
        &self,
        fileset: &Fileset,
        settings: &ImportSettings,
    ) -> Result<Option<ImportResult>, ServiceError>;
}

/// An authenticated connection scoped to a single operation
#[async_trait::async_trait]
pub trait Session: DirectoryService + ImportService {
    async fn close(self: Box<Self>) -> Result<(), ServiceError>;
}

#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Session>, ServiceError>;
}

/// How long an import may block waiting for server-side completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportWait {
    #[default]
    Indefinite,
    Seconds(u64),
}

impl ImportWait {
    /// Values <= 0 wait indefinitely, positive values are a ceiling in seconds
    pub fn from_raw(wait: i64) -> Self {
        if wait <= 0 {
            ImportWait::Indefinite
        } else {
            ImportWait::Seconds(wait as u64)
        }
    }

    pub fn as_raw(self) -> i64 {
        match self {
            ImportWait::Indefinite => -1,
            ImportWait::Seconds(seconds) => seconds as i64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSettings {
    /// Remote display name; the server picks one when absent
    pub name: Option<String>,
    pub wait: ImportWait,
}

/// A local file queued for import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilesetEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    /// Hex-encoded SHA-256 of the file contents
    pub sha256: String,
}

/// The unit submitted to the import service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fileset {
    pub entries: Vec<FilesetEntry>,
}

impl Fileset {
    /// Build a fileset, hashing each file on the blocking pool
    pub async fn from_paths(paths: &[PathBuf]) -> Result<Self, ServiceError> {
        let mut entries = Vec::with_capacity(paths.len());
        for path in paths {
            let owned = path.clone();
            let entry = tokio::task::spawn_blocking(move || describe_file(&owned))
                .await
                .map_err(|e| ServiceError::Io(std::io::Error::other(e)))??;
            entries.push(entry);
        }
        Ok(Fileset { entries })
    }
}

fn describe_file(path: &Path) -> Result<FilesetEntry, ServiceError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    Ok(FilesetEntry {
        path: path.to_path_buf(),
        file_name: file_name_of(path),
        size,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// Final path component as a string, or the whole path when there is none
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Hex-encoded SHA-256 of an in-memory buffer
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Outcome of a completed import
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResult {
    /// Image backing each imported pixel set, in server order
    pub pixels: Vec<ImageId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_import_wait_from_raw() {
        assert_eq!(ImportWait::from_raw(-1), ImportWait::Indefinite);
        assert_eq!(ImportWait::from_raw(0), ImportWait::Indefinite);
        assert_eq!(ImportWait::from_raw(30), ImportWait::Seconds(30));
        assert_eq!(ImportWait::Seconds(30).as_raw(), 30);
        assert_eq!(ImportWait::Indefinite.as_raw(), -1);
    }

    #[tokio::test]
    async fn test_fileset_hashes_contents() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("snapshot.png");
        std::fs::write(&path, b"abc").unwrap();

        let fileset = Fileset::from_paths(&[path.clone()]).await.unwrap();
        let entry = &fileset.entries[0];

        assert_eq!(entry.file_name, "snapshot.png");
        assert_eq!(entry.size, 3);
        assert_eq!(
            entry.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(entry.sha256, sha256_hex(b"abc"));
    }

    #[tokio::test]
    async fn test_fileset_missing_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = Fileset::from_paths(&[temp_dir.path().join("absent.png")])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Io(_)));
    }
}
