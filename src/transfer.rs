// # Transfer Orchestrator
//
// Pushes one image file (plus optional side files) into a dataset:
//
// 0. Check every local file and hash the image
// 1. Resolve the target dataset (creating project/dataset as needed)
// 2. Import the file as a single-file fileset
// 3. Link the first resulting image into the dataset
// 4. Upload each attachment as a file annotation and link it to the image
//
// Steps run strictly in order on one session. Nothing is retried or rolled
// back: a failure part way through leaves whatever was already created.

use crate::error::{Result, TransferError};
use crate::model::ImageId;
use crate::resolver::{resolve_dataset, UnlinkedDatasetPolicy};
use crate::service::{file_name_of, Fileset, ImportSettings, ImportWait, Session, DEFAULT_MIMETYPE};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Namespace attached to uploaded localization files
pub const DEFAULT_NAMESPACE: &str = "pyme.localizations";

/// Everything needed to push one image into the server
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file: PathBuf,
    pub dataset: String,
    pub project: Option<String>,
    pub attachments: Vec<PathBuf>,
    pub namespace: String,
    pub mimetype: String,
    pub wait: ImportWait,
    /// Name the remote image after the local file's base name
    pub name_from_file: bool,
    pub unlinked_policy: UnlinkedDatasetPolicy,
}

impl UploadRequest {
    pub fn new(file: impl Into<PathBuf>, dataset: impl Into<String>) -> Self {
        UploadRequest {
            file: file.into(),
            dataset: dataset.into(),
            project: None,
            attachments: Vec::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            mimetype: DEFAULT_MIMETYPE.to_string(),
            wait: ImportWait::Indefinite,
            name_from_file: true,
            unlinked_policy: UnlinkedDatasetPolicy::default(),
        }
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_attachment(mut self, path: impl Into<PathBuf>) -> Self {
        self.attachments.push(path.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_mimetype(mut self, mimetype: impl Into<String>) -> Self {
        self.mimetype = mimetype.into();
        self
    }

    pub fn with_wait(mut self, wait: ImportWait) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_unlinked_policy(mut self, policy: UnlinkedDatasetPolicy) -> Self {
        self.unlinked_policy = policy;
        self
    }
}

/// Run an upload on an already open session
pub async fn upload<S>(session: &S, request: &UploadRequest) -> Result<ImageId>
where
    S: Session + ?Sized,
{
    ensure_readable_file(&request.file).await?;
    for attachment in &request.attachments {
        ensure_readable_file(attachment).await?;
    }
    // hashed up front so a local read failure never leaves containers behind
    let fileset = Fileset::from_paths(&[request.file.clone()]).await?;

    let dataset_id = resolve_dataset(
        session,
        &request.dataset,
        request.project.as_deref(),
        request.unlinked_policy,
    )
    .await?;

    let image_id = import_file(
        session,
        &fileset,
        &request.file,
        request.wait,
        request.name_from_file,
    )
    .await?;

    session.link_dataset_image(dataset_id, image_id).await?;
    info!("Linked image {} into dataset {}", image_id, dataset_id);

    if !request.attachments.is_empty() {
        let image = session.get_image(image_id).await?;
        for attachment in &request.attachments {
            let annotation = session
                .create_file_annotation(attachment, &request.mimetype, &request.namespace)
                .await?;
            session.link_image_annotation(&image, annotation).await?;
            debug!(
                "Attached {} to image {} as annotation {}",
                attachment.display(),
                image_id,
                annotation
            );
        }
        info!(
            "Attached {} file(s) to image {}",
            request.attachments.len(),
            image_id
        );
    }

    Ok(image_id)
}

/// Import an already hashed single-file fileset and return the image of its
/// first pixel set
pub async fn import_file<S>(
    session: &S,
    fileset: &Fileset,
    file: &Path,
    wait: ImportWait,
    name_from_file: bool,
) -> Result<ImageId>
where
    S: Session + ?Sized,
{
    let settings = ImportSettings {
        name: name_from_file.then(|| file_name_of(file)),
        wait,
    };

    info!("Importing {}", file.display());
    let result = session.import_fileset(fileset, &settings).await?;

    // multi-series filesets are not supported, only the first image is used
    let image_id = result
        .and_then(|r| r.pixels.first().copied())
        .ok_or_else(|| TransferError::EmptyImport {
            file: file.to_path_buf(),
        })?;

    info!("Imported image {} from {}", image_id, file.display());
    Ok(image_id)
}

/// A directory or a missing path counts as not found
async fn ensure_readable_file(path: &Path) -> Result<()> {
    let is_file = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(TransferError::NotFound(path.to_path_buf()));
    }
    tokio::fs::File::open(path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DatasetId;
    use crate::service::DirectoryService;
    use crate::test_support::MemoryServer;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_links_image_into_dataset() {
        let temp_dir = TempDir::new().unwrap();
        let image = write(&temp_dir, "img.png", b"png-bytes");
        let server = MemoryServer::new();
        let session = server.session();

        let image_id = upload(&session, &UploadRequest::new(&image, "D"))
            .await
            .unwrap();

        let dataset = session.list_datasets().await.unwrap()[0].clone();
        let images = session.list_dataset_images(dataset.id).await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].id, image_id);
        assert_eq!(images[0].name, "img.png");
        assert_eq!(server.image_bytes(image_id).unwrap(), b"png-bytes");
    }

    #[tokio::test]
    async fn test_attachments_are_linked_with_namespace() {
        let temp_dir = TempDir::new().unwrap();
        let image = write(&temp_dir, "img.png", b"png");
        let a = write(&temp_dir, "a.hdf", b"aaaa");
        let b = write(&temp_dir, "b.hdf", b"bb");
        let server = MemoryServer::new();
        let session = server.session();

        let request = UploadRequest::new(&image, "D")
            .with_attachment(&a)
            .with_attachment(&b)
            .with_namespace("test.ns");
        let image_id = upload(&session, &request).await.unwrap();

        let annotations = server.annotations_on(image_id);
        assert_eq!(annotations.len(), 2);
        assert!(annotations
            .iter()
            .all(|a| a.namespace() == Some("test.ns")));
        let names: Vec<_> = annotations
            .iter()
            .filter_map(|a| a.as_file())
            .map(|f| f.file.name.clone())
            .collect();
        assert_eq!(names, vec!["a.hdf", "b.hdf"]);
        assert!(annotations
            .iter()
            .filter_map(|a| a.as_file())
            .all(|f| f.file.mimetype == DEFAULT_MIMETYPE));
    }

    #[tokio::test]
    async fn test_mimetype_override() {
        let temp_dir = TempDir::new().unwrap();
        let image = write(&temp_dir, "img.png", b"png");
        let csv = write(&temp_dir, "locs.csv", b"x,y\n");
        let server = MemoryServer::new();
        let session = server.session();

        let request = UploadRequest::new(&image, "D")
            .with_attachment(&csv)
            .with_mimetype("text/csv");
        let image_id = upload(&session, &request).await.unwrap();

        let annotations = server.annotations_on(image_id);
        assert_eq!(annotations[0].as_file().unwrap().file.mimetype, "text/csv");
    }

    #[tokio::test]
    async fn test_empty_import_is_an_error_and_links_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let image = write(&temp_dir, "img.png", b"png");
        let attachment = write(&temp_dir, "a.hdf", b"a");
        let server = MemoryServer::new();
        server.empty_imports();
        let session = server.session();

        let request = UploadRequest::new(&image, "D").with_attachment(&attachment);
        let err = upload(&session, &request).await.unwrap_err();

        assert!(matches!(err, TransferError::EmptyImport { .. }));
        assert_eq!(server.dataset_image_link_count(), 0);
        assert_eq!(server.image_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_local_file_fails_before_remote_calls() {
        let temp_dir = TempDir::new().unwrap();
        let image = write(&temp_dir, "img.png", b"png");
        let server = MemoryServer::new();
        let session = server.session();

        let request = UploadRequest::new(&image, "D")
            .with_project("P")
            .with_attachment(temp_dir.path().join("missing.hdf"));
        let err = upload(&session, &request).await.unwrap_err();

        match err {
            TransferError::NotFound(path) => assert!(path.ends_with("missing.hdf")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(server.project_count(), 0);
        assert_eq!(server.dataset_count(), 0);
    }

    #[tokio::test]
    async fn test_directory_inputs_fail_before_remote_calls() {
        let temp_dir = TempDir::new().unwrap();
        let image = write(&temp_dir, "img.png", b"png");
        let folder = temp_dir.path().join("locs");
        std::fs::create_dir(&folder).unwrap();
        let server = MemoryServer::new();
        let session = server.session();

        let err = upload(&session, &UploadRequest::new(&folder, "D").with_project("P"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NotFound(ref path) if path == &folder));

        let request = UploadRequest::new(&image, "D")
            .with_project("P")
            .with_attachment(&folder);
        let err = upload(&session, &request).await.unwrap_err();
        assert!(matches!(err, TransferError::NotFound(ref path) if path == &folder));

        assert_eq!(server.project_count(), 0);
        assert_eq!(server.dataset_count(), 0);
        assert_eq!(server.image_count(), 0);
    }

    #[tokio::test]
    async fn test_only_first_pixel_set_is_linked() {
        let temp_dir = TempDir::new().unwrap();
        let image = write(&temp_dir, "multi.tif", b"tiff");
        let server = MemoryServer::new();
        server.set_pixels_per_import(3);
        let session = server.session();

        let image_id = upload(&session, &UploadRequest::new(&image, "D"))
            .await
            .unwrap();

        assert_eq!(server.image_count(), 3);
        assert_eq!(server.dataset_image_link_count(), 1);
        let images = session.list_dataset_images(DatasetId(1)).await.unwrap();
        assert_eq!(images[0].id, image_id);
    }

    #[tokio::test]
    async fn test_upload_with_project_places_dataset_under_it() {
        let temp_dir = TempDir::new().unwrap();
        let image = write(&temp_dir, "img.png", b"png");
        let server = MemoryServer::new();
        let session = server.session();

        let request = UploadRequest::new(&image, "D").with_project("P");
        upload(&session, &request).await.unwrap();

        let project = session.list_projects().await.unwrap()[0].clone();
        assert_eq!(project.name, "P");
        let children = session.list_project_datasets(project.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "D");
    }
}
