// Test support utilities for both unit and integration tests

use crate::config::Credentials;
use crate::error::ServiceError;
use crate::model::{
    Annotation, AnnotationId, Dataset, DatasetId, FileAnnotation, FileId, Image, ImageId,
    OriginalFile, Project, ProjectId,
};
use crate::service::{
    Connector, DirectoryService, Fileset, ImportResult, ImportService, ImportSettings, Session,
    DEFAULT_MAX_READ_SIZE,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

const EXPORT_BUFFER_SIZE: usize = 1024;

struct StoredImage {
    image: Image,
    data: Vec<u8>,
}

struct ServerState {
    next_id: i64,
    projects: Vec<Project>,
    datasets: Vec<Dataset>,
    images: Vec<StoredImage>,
    annotations: Vec<Annotation>,
    files: HashMap<FileId, Vec<u8>>,
    project_links: Vec<(ProjectId, DatasetId)>,
    dataset_links: Vec<(DatasetId, ImageId)>,
    image_links: Vec<(ImageId, AnnotationId)>,
    login: Option<(String, String)>,
    fail_dataset_creation: bool,
    empty_imports: bool,
    pixels_per_import: usize,
    max_read_size: u64,
    read_length_cap: Option<u64>,
    largest_read: u64,
    sessions_opened: usize,
    sessions_closed: usize,
}

impl Default for ServerState {
    fn default() -> Self {
        ServerState {
            next_id: 0,
            projects: Vec::new(),
            datasets: Vec::new(),
            images: Vec::new(),
            annotations: Vec::new(),
            files: HashMap::new(),
            project_links: Vec::new(),
            dataset_links: Vec::new(),
            image_links: Vec::new(),
            login: None,
            fail_dataset_creation: false,
            empty_imports: false,
            pixels_per_import: 1,
            max_read_size: DEFAULT_MAX_READ_SIZE,
            read_length_cap: None,
            largest_read: 0,
            sessions_opened: 0,
            sessions_closed: 0,
        }
    }
}

impl ServerState {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn image(&self, id: ImageId) -> Result<&StoredImage, ServiceError> {
        self.images
            .iter()
            .find(|stored| stored.image.id == id)
            .ok_or_else(|| ServiceError::NotFound(format!("Image {}", id)))
    }
}

/// In-memory image server for testing
///
/// Keeps containers, images and annotations in process instead of talking
/// to a real server. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<Mutex<ServerState>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept sessions for this user/password pair
    pub fn with_login(self, user: &str, password: &str) -> Self {
        self.state.lock().unwrap().login = Some((user.to_string(), password.to_string()));
        self
    }

    /// A session on this server, skipping authentication
    pub fn session(&self) -> MemorySession {
        self.state.lock().unwrap().sessions_opened += 1;
        MemorySession {
            state: self.state.clone(),
        }
    }

    pub fn seed_project(&self, name: &str) -> ProjectId {
        let mut state = self.state.lock().unwrap();
        let id = ProjectId(state.allocate());
        state.projects.push(Project {
            id,
            name: name.to_string(),
        });
        id
    }

    pub fn seed_dataset(&self, name: &str) -> DatasetId {
        let mut state = self.state.lock().unwrap();
        let id = DatasetId(state.allocate());
        state.datasets.push(Dataset {
            id,
            name: name.to_string(),
        });
        id
    }

    pub fn seed_project_link(&self, project: ProjectId, dataset: DatasetId) {
        self.state
            .lock()
            .unwrap()
            .project_links
            .push((project, dataset));
    }

    pub fn seed_image(&self, name: &str, data: &[u8]) -> ImageId {
        let mut state = self.state.lock().unwrap();
        let id = ImageId(state.allocate());
        state.images.push(StoredImage {
            image: Image {
                id,
                name: name.to_string(),
            },
            data: data.to_vec(),
        });
        id
    }

    pub fn seed_file_annotation(
        &self,
        image: ImageId,
        name: &str,
        data: &[u8],
        namespace: Option<&str>,
    ) -> AnnotationId {
        let mut state = self.state.lock().unwrap();
        let file_id = FileId(state.allocate());
        let id = AnnotationId(state.allocate());
        state.files.insert(file_id, data.to_vec());
        state.annotations.push(Annotation::File(FileAnnotation {
            id,
            namespace: namespace.map(str::to_string),
            file: OriginalFile {
                id: file_id,
                name: name.to_string(),
                size: data.len() as u64,
                mimetype: crate::service::DEFAULT_MIMETYPE.to_string(),
            },
        }));
        state.image_links.push((image, id));
        id
    }

    pub fn seed_other_annotation(
        &self,
        image: ImageId,
        kind: &str,
        namespace: Option<&str>,
    ) -> AnnotationId {
        let mut state = self.state.lock().unwrap();
        let id = AnnotationId(state.allocate());
        state.annotations.push(Annotation::Other {
            id,
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
        });
        state.image_links.push((image, id));
        id
    }

    /// Make every subsequent dataset creation fail
    pub fn fail_dataset_creation(&self) {
        self.state.lock().unwrap().fail_dataset_creation = true;
    }

    /// Make every subsequent import report no result
    pub fn empty_imports(&self) {
        self.state.lock().unwrap().empty_imports = true;
    }

    /// Number of pixel sets (and images) produced per import
    pub fn set_pixels_per_import(&self, count: usize) {
        self.state.lock().unwrap().pixels_per_import = count;
    }

    pub fn set_max_read_size(&self, max: u64) {
        self.state.lock().unwrap().max_read_size = max;
    }

    /// Serve at most `cap` bytes per read, below what the client asked for
    pub fn cap_read_length(&self, cap: u64) {
        self.state.lock().unwrap().read_length_cap = Some(cap);
    }

    /// Drop stored bytes past `len` while the annotation keeps its declared size
    pub fn truncate_stored_file(&self, annotation: AnnotationId, len: usize) {
        let mut state = self.state.lock().unwrap();
        let file_id = state
            .annotations
            .iter()
            .find(|a| a.id() == annotation)
            .and_then(Annotation::as_file)
            .map(|f| f.file.id)
            .expect("file annotation");
        if let Some(data) = state.files.get_mut(&file_id) {
            data.truncate(len);
        }
    }

    pub fn largest_read(&self) -> u64 {
        self.state.lock().unwrap().largest_read
    }

    pub fn project_count(&self) -> usize {
        self.state.lock().unwrap().projects.len()
    }

    pub fn dataset_count(&self) -> usize {
        self.state.lock().unwrap().datasets.len()
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }

    pub fn project_dataset_link_count(&self) -> usize {
        self.state.lock().unwrap().project_links.len()
    }

    pub fn dataset_image_link_count(&self) -> usize {
        self.state.lock().unwrap().dataset_links.len()
    }

    /// Annotations linked to an image, in link order
    pub fn annotations_on(&self, image: ImageId) -> Vec<Annotation> {
        let state = self.state.lock().unwrap();
        linked_annotations(&state, image)
    }

    /// Contents of a stored file
    pub fn file_bytes(&self, file: FileId) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(&file).cloned()
    }

    pub fn image_bytes(&self, image: ImageId) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state.image(image).ok().map(|stored| stored.data.clone())
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.lock().unwrap().sessions_opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.lock().unwrap().sessions_closed
    }
}

fn linked_annotations(state: &ServerState, image: ImageId) -> Vec<Annotation> {
    state
        .image_links
        .iter()
        .filter(|(linked, _)| *linked == image)
        .filter_map(|(_, annotation)| {
            state
                .annotations
                .iter()
                .find(|candidate| candidate.id() == *annotation)
                .cloned()
        })
        .collect()
}

#[async_trait::async_trait]
impl Connector for MemoryServer {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Session>, ServiceError> {
        if let Some((user, password)) = &self.state.lock().unwrap().login {
            if *user != credentials.user || *password != credentials.password {
                return Err(ServiceError::Unauthorized);
            }
        }
        Ok(Box::new(self.session()))
    }
}

/// Session handed out by [`MemoryServer`]
pub struct MemorySession {
    state: Arc<Mutex<ServerState>>,
}

#[async_trait::async_trait]
impl DirectoryService for MemorySession {
    async fn list_projects(&self) -> Result<Vec<Project>, ServiceError> {
        Ok(self.state.lock().unwrap().projects.clone())
    }

    async fn list_datasets(&self) -> Result<Vec<Dataset>, ServiceError> {
        Ok(self.state.lock().unwrap().datasets.clone())
    }

    async fn list_project_datasets(
        &self,
        project: ProjectId,
    ) -> Result<Vec<Dataset>, ServiceError> {
        let state = self.state.lock().unwrap();
        if !state.projects.iter().any(|p| p.id == project) {
            return Err(ServiceError::NotFound(format!("Project {}", project)));
        }
        Ok(state
            .project_links
            .iter()
            .filter(|(parent, _)| *parent == project)
            .filter_map(|(_, child)| state.datasets.iter().find(|d| d.id == *child).cloned())
            .collect())
    }

    async fn list_dataset_images(&self, dataset: DatasetId) -> Result<Vec<Image>, ServiceError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .dataset_links
            .iter()
            .filter(|(parent, _)| *parent == dataset)
            .filter_map(|(_, child)| state.image(*child).ok().map(|s| s.image.clone()))
            .collect())
    }

    async fn create_project(&self, name: &str) -> Result<ProjectId, ServiceError> {
        let mut state = self.state.lock().unwrap();
        let id = ProjectId(state.allocate());
        state.projects.push(Project {
            id,
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn create_dataset(&self, name: &str) -> Result<DatasetId, ServiceError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_dataset_creation {
            return Err(ServiceError::Remote {
                status: 500,
                body: "dataset creation disabled".to_string(),
            });
        }
        let id = DatasetId(state.allocate());
        state.datasets.push(Dataset {
            id,
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn link_project_dataset(
        &self,
        project: ProjectId,
        dataset: DatasetId,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        if !state.projects.iter().any(|p| p.id == project) {
            return Err(ServiceError::NotFound(format!("Project {}", project)));
        }
        if !state.datasets.iter().any(|d| d.id == dataset) {
            return Err(ServiceError::NotFound(format!("Dataset {}", dataset)));
        }
        state.project_links.push((project, dataset));
        Ok(())
    }

    async fn link_dataset_image(
        &self,
        dataset: DatasetId,
        image: ImageId,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        if !state.datasets.iter().any(|d| d.id == dataset) {
            return Err(ServiceError::NotFound(format!("Dataset {}", dataset)));
        }
        state.image(image)?;
        state.dataset_links.push((dataset, image));
        Ok(())
    }

    async fn get_image(&self, image: ImageId) -> Result<Image, ServiceError> {
        let state = self.state.lock().unwrap();
        Ok(state.image(image)?.image.clone())
    }

    async fn create_file_annotation(
        &self,
        path: &Path,
        mimetype: &str,
        namespace: &str,
    ) -> Result<AnnotationId, ServiceError> {
        let data = tokio::fs::read(path).await?;
        let mut state = self.state.lock().unwrap();
        let file_id = FileId(state.allocate());
        let id = AnnotationId(state.allocate());
        state.annotations.push(Annotation::File(FileAnnotation {
            id,
            namespace: Some(namespace.to_string()),
            file: OriginalFile {
                id: file_id,
                name: crate::service::file_name_of(path),
                size: data.len() as u64,
                mimetype: mimetype.to_string(),
            },
        }));
        state.files.insert(file_id, data);
        Ok(id)
    }

    async fn link_image_annotation(
        &self,
        image: &Image,
        annotation: AnnotationId,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.image(image.id)?;
        if !state.annotations.iter().any(|a| a.id() == annotation) {
            return Err(ServiceError::NotFound(format!("Annotation {}", annotation)));
        }
        state.image_links.push((image.id, annotation));
        Ok(())
    }

    async fn list_image_annotations(
        &self,
        image: ImageId,
        namespace: Option<&str>,
    ) -> Result<Vec<Annotation>, ServiceError> {
        let state = self.state.lock().unwrap();
        state.image(image)?;
        Ok(linked_annotations(&state, image)
            .into_iter()
            .filter(|a| namespace.is_none() || a.namespace() == namespace)
            .collect())
    }

    async fn read_file(
        &self,
        file: FileId,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, ServiceError> {
        let mut state = self.state.lock().unwrap();
        if length > state.max_read_size {
            return Err(ServiceError::ReadLimit {
                requested: length,
                max: state.max_read_size,
            });
        }
        state.largest_read = state.largest_read.max(length);

        let data = state
            .files
            .get(&file)
            .ok_or_else(|| ServiceError::NotFound(format!("File {}", file)))?;
        let served = state.read_length_cap.map_or(length, |cap| cap.min(length));
        let start = (offset as usize).min(data.len());
        let end = (start + served as usize).min(data.len());
        Ok(data[start..end].to_vec())
    }

    fn max_read_size(&self) -> u64 {
        self.state.lock().unwrap().max_read_size
    }

    async fn export_ome_tiff(&self, image: ImageId) -> Result<Vec<Vec<u8>>, ServiceError> {
        let state = self.state.lock().unwrap();
        let stored = state.image(image)?;
        Ok(stored
            .data
            .chunks(EXPORT_BUFFER_SIZE)
            .map(<[u8]>::to_vec)
            .collect())
    }
}

#[async_trait::async_trait]
impl ImportService for MemorySession {
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
        if crate::service::sha256_hex(&data) != entry.sha256 {
            return Err(ServiceError::ChecksumMismatch(entry.file_name.clone()));
        }

        let mut state = self.state.lock().unwrap();
        if state.empty_imports {
            return Ok(None);
        }

        let name = settings
            .name
            .clone()
            .unwrap_or_else(|| entry.file_name.clone());
        let mut pixels = Vec::new();
        for _ in 0..state.pixels_per_import {
            let id = ImageId(state.allocate());
            state.images.push(StoredImage {
                image: Image {
                    id,
                    name: name.clone(),
                },
                data: data.clone(),
            });
            pixels.push(id);
        }
        Ok(Some(ImportResult { pixels }))
    }
}

#[async_trait::async_trait]
impl Session for MemorySession {
    async fn close(self: Box<Self>) -> Result<(), ServiceError> {
        self.state.lock().unwrap().sessions_closed += 1;
        Ok(())
    }
}
