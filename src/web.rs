//! JSON-over-HTTP transport for the directory and import services.
//!
//! Sessions are cookie based. A CSRF token is fetched before login and sent
//! as `X-CSRFToken` on every mutating request.

use crate::config::Credentials;
use crate::error::ServiceError;
use crate::model::{
    Annotation, AnnotationId, Dataset, DatasetId, FileAnnotation, FileId, Image, ImageId,
    OriginalFile, Project, ProjectId,
};
use crate::service::{
    file_name_of, Connector, DirectoryService, Fileset, ImportResult, ImportService,
    ImportSettings, Session, DEFAULT_MAX_READ_SIZE,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

const CSRF_HEADER: &str = "X-CSRFToken";
const CHECKSUM_HEADER: &str = "X-Checksum-SHA256";
const SCHEMA_PREFIX: &str = "http://www.openmicroscopy.org/Schemas/OME/2016-06#";

/// Opens sessions against a web gateway
#[derive(Debug, Clone)]
pub struct WebGateway {
    timeout: Duration,
    server_id: u32,
    max_read_size: u64,
}

impl Default for WebGateway {
    fn default() -> Self {
        WebGateway {
            timeout: Duration::from_secs(60),
            server_id: 1,
            max_read_size: DEFAULT_MAX_READ_SIZE,
        }
    }
}

impl WebGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Server entry to log into when the gateway fronts several servers
    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_max_read_size(mut self, max: u64) -> Self {
        self.max_read_size = max;
        self
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Deserialize)]
struct JsonObject {
    #[serde(rename = "@id")]
    id: i64,
    #[serde(rename = "Name", default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct JsonFile {
    #[serde(rename = "@id")]
    id: i64,
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    mimetype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonAnnotation {
    #[serde(rename = "@id")]
    id: i64,
    #[serde(rename = "@type", default)]
    kind: String,
    #[serde(default)]
    ns: Option<String>,
    #[serde(default)]
    file: Option<JsonFile>,
}

impl From<JsonAnnotation> for Annotation {
    fn from(json: JsonAnnotation) -> Self {
        let id = AnnotationId(json.id);
        match json.file {
            Some(file) => Annotation::File(FileAnnotation {
                id,
                namespace: json.ns,
                file: OriginalFile {
                    id: FileId(file.id),
                    name: file.name,
                    size: file.size,
                    mimetype: file
                        .mimetype
                        .unwrap_or_else(|| crate::service::DEFAULT_MIMETYPE.to_string()),
                },
            }),
            None => Annotation::Other {
                id,
                kind: json
                    .kind
                    .rsplit('#')
                    .next()
                    .unwrap_or_default()
                    .to_string(),
                namespace: json.ns,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonPixels {
    image: JsonObject,
}

#[derive(Debug, Deserialize)]
struct JsonImport {
    #[serde(default)]
    pixels: Vec<JsonPixels>,
}

#[derive(Debug, Serialize)]
struct LinkEnd {
    #[serde(rename = "@type")]
    kind: &'static str,
    #[serde(rename = "@id")]
    id: i64,
}

#[derive(Debug, Serialize)]
struct LinkRequest {
    parent: LinkEnd,
    child: LinkEnd,
}

#[async_trait::async_trait]
impl Connector for WebGateway {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Session>, ServiceError> {
        let client = Client::builder()
            .cookie_store(true)
            .timeout(self.timeout)
            .build()?;
        let base_url = credentials.base_url();
        if credentials.web_url.is_none() {
            warn!(
                "No web_url configured, trying {} (set web_url if the gateway runs elsewhere)",
                base_url
            );
        }

        let token: Envelope<String> =
            handle_json(client.get(format!("{}/api/v0/token/", base_url)).send().await?).await?;

        let server = self.server_id.to_string();
        let response = client
            .post(format!("{}/api/v0/login/", base_url))
            .header(CSRF_HEADER, &token.data)
            .form(&[
                ("username", credentials.user.as_str()),
                ("password", credentials.password.as_str()),
                ("server", server.as_str()),
            ])
            .send()
            .await?;
        let login: LoginResponse = handle_json(response).await?;
        if !login.success {
            return Err(ServiceError::Unauthorized);
        }

        info!("Logged in to {} as {}", base_url, credentials.user);
        Ok(Box::new(WebSession {
            client,
            base_url,
            csrf_token: token.data,
            max_read_size: self.max_read_size,
        }))
    }
}

/// Authenticated session on a web gateway
pub struct WebSession {
    client: Client,
    base_url: String,
    csrf_token: String,
    max_read_size: u64,
}

impl WebSession {
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(self.url(path))
            .header(CSRF_HEADER, &self.csrf_token)
    }

    async fn get_data<T: DeserializeOwned>(&self, path: &str) -> Result<T, ServiceError> {
        let envelope: Envelope<T> = handle_json(self.get(path).send().await?).await?;
        Ok(envelope.data)
    }

    async fn save(&self, kind: &str, name: &str) -> Result<i64, ServiceError> {
        let body = json!({
            "@type": format!("{}{}", SCHEMA_PREFIX, kind),
            "Name": name,
        });
        let response = self.post("/api/v0/m/save/").json(&body).send().await?;
        let saved: Envelope<JsonObject> = handle_json(response).await?;
        debug!("Saved {} '{}' as {}", kind, name, saved.data.id);
        Ok(saved.data.id)
    }

    async fn link(
        &self,
        parent: (&'static str, i64),
        child: (&'static str, i64),
    ) -> Result<(), ServiceError> {
        let body = LinkRequest {
            parent: LinkEnd {
                kind: parent.0,
                id: parent.1,
            },
            child: LinkEnd {
                kind: child.0,
                id: child.1,
            },
        };
        let response = self.post("/api/v0/m/links/").json(&body).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

fn projects_from(objects: Vec<JsonObject>) -> Vec<Project> {
    objects
        .into_iter()
        .map(|o| Project {
            id: ProjectId(o.id),
            name: o.name,
        })
        .collect()
}

fn datasets_from(objects: Vec<JsonObject>) -> Vec<Dataset> {
    objects
        .into_iter()
        .map(|o| Dataset {
            id: DatasetId(o.id),
            name: o.name,
        })
        .collect()
}

#[async_trait::async_trait]
impl DirectoryService for WebSession {
    async fn list_projects(&self) -> Result<Vec<Project>, ServiceError> {
        Ok(projects_from(self.get_data("/api/v0/m/projects/").await?))
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>, ServiceError> {
        Ok(datasets_from(self.get_data("/api/v0/m/datasets/").await?))
    }

    async fn list_project_datasets(
        &self,
        project: ProjectId,
    ) -> Result<Vec<Dataset>, ServiceError> {
        let path = format!("/api/v0/m/projects/{}/datasets/", project);
        Ok(datasets_from(self.get_data(&path).await?))
    }

    async fn list_dataset_images(&self, dataset: DatasetId) -> Result<Vec<Image>, ServiceError> {
        let path = format!("/api/v0/m/datasets/{}/images/", dataset);
        let objects: Vec<JsonObject> = self.get_data(&path).await?;
        Ok(objects
            .into_iter()
            .map(|o| Image {
                id: ImageId(o.id),
                name: o.name,
            })
            .collect())
    }

    async fn create_project(&self, name: &str) -> Result<ProjectId, ServiceError> {
        self.save("Project", name).await.map(ProjectId)
    }

    async fn create_dataset(&self, name: &str) -> Result<DatasetId, ServiceError> {
        self.save("Dataset", name).await.map(DatasetId)
    }

    async fn link_project_dataset(
        &self,
        project: ProjectId,
        dataset: DatasetId,
    ) -> Result<(), ServiceError> {
        self.link(("Project", project.0), ("Dataset", dataset.0)).await
    }

    async fn link_dataset_image(
        &self,
        dataset: DatasetId,
        image: ImageId,
    ) -> Result<(), ServiceError> {
        self.link(("Dataset", dataset.0), ("Image", image.0)).await
    }

    async fn get_image(&self, image: ImageId) -> Result<Image, ServiceError> {
        let object: JsonObject = self.get_data(&format!("/api/v0/m/images/{}/", image)).await?;
        Ok(Image {
            id: ImageId(object.id),
            name: object.name,
        })
    }

    async fn create_file_annotation(
        &self,
        path: &Path,
        mimetype: &str,
        namespace: &str,
    ) -> Result<AnnotationId, ServiceError> {
        let data = tokio::fs::read(path).await?;
        let name = file_name_of(path);
        let response = self
            .post("/api/v0/m/annotations/file/")
            .query(&[("name", name.as_str()), ("mimetype", mimetype), ("ns", namespace)])
            .body(data)
            .send()
            .await?;
        let created: Envelope<JsonObject> = handle_json(response).await?;
        Ok(AnnotationId(created.data.id))
    }

    async fn link_image_annotation(
        &self,
        image: &Image,
        annotation: AnnotationId,
    ) -> Result<(), ServiceError> {
        self.link(("Image", image.id.0), ("FileAnnotation", annotation.0))
            .await
    }

    async fn list_image_annotations(
        &self,
        image: ImageId,
        namespace: Option<&str>,
    ) -> Result<Vec<Annotation>, ServiceError> {
        let mut request = self.get(&format!("/api/v0/m/images/{}/annotations/", image));
        if let Some(ns) = namespace {
            request = request.query(&[("ns", ns)]);
        }
        let envelope: Envelope<Vec<JsonAnnotation>> = handle_json(request.send().await?).await?;
        Ok(envelope.data.into_iter().map(Annotation::from).collect())
    }

    async fn read_file(
        &self,
        file: FileId,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, ServiceError> {
        if length > self.max_read_size {
            return Err(ServiceError::ReadLimit {
                requested: length,
                max: self.max_read_size,
            });
        }
        let response = self
            .get(&format!("/api/v0/m/files/{}/", file))
            .query(&[("offset", offset), ("length", length)])
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    fn max_read_size(&self) -> u64 {
        self.max_read_size
    }

    async fn export_ome_tiff(&self, image: ImageId) -> Result<Vec<Vec<u8>>, ServiceError> {
        let response = self
            .get(&format!("/api/v0/m/images/{}/export/ome-tiff/", image))
            .send()
            .await?;
        let mut response = check_status(response).await?;

        let mut buffers = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            buffers.push(chunk.to_vec());
        }
        Ok(buffers)
    }
}

#[async_trait::async_trait]
impl ImportService for WebSession {
    async fn import_fileset(
        &self,
        fileset: &Fileset,
        settings: &ImportSettings,
    ) -> Result<Option<ImportResult>, ServiceError> {
        let entry = fileset
            .entries
            .first()
            .ok_or_else(|| ServiceError::InvalidResponse("empty fileset".to_string()))?;
        let data = tokio::fs::read(&entry.path).await?;

        let name = settings.name.as_deref().unwrap_or(&entry.file_name);
        let wait = settings.wait.as_raw().to_string();
        let response = self
            .post("/api/v0/m/import/")
            .query(&[("name", name), ("wait", wait.as_str())])
            .header(CHECKSUM_HEADER, &entry.sha256)
            .body(data)
            .send()
            .await?;

        let envelope: Envelope<Option<JsonImport>> = handle_json(response).await?;
        Ok(envelope.data.map(|import| ImportResult {
            pixels: import
                .pixels
                .into_iter()
                .map(|p| ImageId(p.image.id))
                .collect(),
        }))
    }
}

#[async_trait::async_trait]
impl Session for WebSession {
    async fn close(self: Box<Self>) -> Result<(), ServiceError> {
        let response = self.post("/webclient/logout/").send().await?;
        check_status(response).await?;
        debug!("Logged out of {}", self.base_url);
        Ok(())
    }
}

async fn check_status(response: Response) -> Result<Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::Unauthorized,
        StatusCode::NOT_FOUND => ServiceError::NotFound(body),
        _ => ServiceError::Remote {
            status: status.as_u16(),
            body,
        },
    })
}

async fn handle_json<T: DeserializeOwned>(response: Response) -> Result<T, ServiceError> {
    let response = check_status(response).await?;
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ServiceError::InvalidResponse(e.to_string()))
}
