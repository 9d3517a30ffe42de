use crate::config::Config;
use crate::error::{Result, TransferError};
use crate::model::{DatasetId, ImageId};
use crate::resolver::{self, UnlinkedDatasetPolicy};
use crate::retrieval;
use crate::service::{Connector, Session};
use crate::staging::{render_file_name, StagingArea};
use crate::transfer::{self, UploadRequest};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Entry point for resolve, upload and retrieval operations
///
/// Every operation opens its own session and closes it before returning,
/// whether or not the operation succeeded.
#[derive(Clone)]
pub struct OmeroClient {
    config: Config,
    connector: Arc<dyn Connector>,
    staging_dir: Option<PathBuf>,
}

impl std::fmt::Debug for OmeroClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OmeroClient")
            .field("config", &self.config)
            .field("connector", &"<dyn Connector>")
            .field("staging_dir", &self.staging_dir)
            .finish()
    }
}

/// Rendered image bytes plus named side files to stage and upload
#[derive(Debug, Clone)]
pub struct StagedUpload {
    /// Output pattern such as `{file_stub}.png`
    pub file_pattern: String,
    pub file_stub: String,
    pub image: Vec<u8>,
    /// `(file name, contents)` for each attachment
    pub attachments: Vec<(String, Vec<u8>)>,
}

impl OmeroClient {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        OmeroClient {
            config,
            connector,
            staging_dir: None,
        }
    }

    /// Stage [`OmeroClient::upload_bytes`] files under `dir` rather than the
    /// system temp dir
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn open(&self) -> Result<Box<dyn Session>> {
        let credentials = &self.config.credentials;
        debug!(
            "Opening session with {}",
            credentials.redacted_login_args().join(" ")
        );
        Ok(self.connector.connect(credentials).await?)
    }

    async fn finish<T>(session: Box<dyn Session>, result: Result<T>) -> Result<T> {
        if let Err(e) = session.close().await {
            warn!("Failed to close session: {}", e);
        }
        result
    }

    pub async fn resolve_dataset(
        &self,
        dataset: &str,
        project: Option<&str>,
        policy: UnlinkedDatasetPolicy,
    ) -> Result<DatasetId> {
        let session = self.open().await?;
        let result = resolver::resolve_dataset(session.as_ref(), dataset, project, policy)
            .await
            .map_err(TransferError::from);
        Self::finish(session, result).await
    }

    pub async fn upload(&self, request: &UploadRequest) -> Result<ImageId> {
        let session = self.open().await?;
        let result = transfer::upload(session.as_ref(), request).await;
        Self::finish(session, result).await
    }

    /// Stage in-memory image and attachment bytes, then upload them
    ///
    /// `template` supplies dataset, project and annotation settings; its file
    /// and attachment paths are replaced by the staged files.
    pub async fn upload_bytes(
        &self,
        staged: &StagedUpload,
        template: &UploadRequest,
    ) -> Result<ImageId> {
        let staging = match &self.staging_dir {
            Some(base) => StagingArea::new_in(base)?,
            None => StagingArea::new()?,
        };

        let image_name = render_file_name(&staged.file_pattern, &staged.file_stub);
        let image_path = staging.write(&image_name, &staged.image).await?;

        let mut attachments = Vec::with_capacity(staged.attachments.len());
        for (name, data) in &staged.attachments {
            attachments.push(staging.write(name, data).await?);
        }

        let request = UploadRequest {
            file: image_path,
            attachments,
            ..template.clone()
        };
        let result = self.upload(&request).await;

        if let Err(e) = staging.close() {
            warn!("Failed to remove staging area: {}", e);
        }
        result
    }

    pub async fn locate_attachments(
        &self,
        link: &str,
        dest: &Path,
        preferred_namespace: Option<&str>,
    ) -> Result<Vec<PathBuf>> {
        retrieval::parse_image_id(link)?;
        let session = self.open().await?;
        let result =
            retrieval::locate_attachments(session.as_ref(), link, dest, preferred_namespace).await;
        Self::finish(session, result).await
    }

    pub async fn export_image(&self, link: &str, dest: &Path) -> Result<PathBuf> {
        retrieval::parse_image_id(link)?;
        let session = self.open().await?;
        let result = retrieval::export_image(session.as_ref(), link, dest).await;
        Self::finish(session, result).await
    }
}
