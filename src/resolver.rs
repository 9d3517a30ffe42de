//! Find-or-create resolution of project and dataset containers.
//!
//! Resolution is list-then-create and is not atomic against the server: two
//! callers resolving the same new name at the same time can both miss and
//! both create, leaving duplicate containers. Later lookups take the first
//! match. Client-side locking would not help, since other clients of the
//! server are not bound by it.

use crate::error::ServiceError;
use crate::model::{DatasetId, ProjectId};
use crate::service::DirectoryService;
use tracing::{debug, info};

/// What to do with a same-named dataset that no project owns when a project
/// is requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnlinkedDatasetPolicy {
    /// Leave the orphan alone and create a fresh dataset under the project
    #[default]
    CreateNew,
    /// Link the first orphan with the requested name to the project
    Relink,
}

/// Resolve a dataset by name, optionally under a project, creating whatever
/// is missing
pub async fn resolve_dataset<D>(
    dir: &D,
    dataset_name: &str,
    project_name: Option<&str>,
    policy: UnlinkedDatasetPolicy,
) -> Result<DatasetId, ServiceError>
where
    D: DirectoryService + ?Sized,
{
    let Some(project_name) = project_name else {
        return get_or_create_dataset_id(dir, dataset_name).await;
    };

    let project_id = get_or_create_project_id(dir, project_name).await?;

    let children = dir.list_project_datasets(project_id).await?;
    if let Some(dataset) = children.iter().find(|d| d.name == dataset_name) {
        debug!(
            "Found dataset '{}' ({}) in project '{}' ({})",
            dataset_name, dataset.id, project_name, project_id
        );
        return Ok(dataset.id);
    }

    if policy == UnlinkedDatasetPolicy::Relink {
        if let Some(orphan) = find_orphan_dataset(dir, dataset_name).await? {
            dir.link_project_dataset(project_id, orphan).await?;
            info!(
                "Linked existing dataset '{}' ({}) to project '{}' ({})",
                dataset_name, orphan, project_name, project_id
            );
            return Ok(orphan);
        }
    }

    let dataset_id = create_dataset(dir, dataset_name).await?;
    dir.link_project_dataset(project_id, dataset_id).await?;
    info!(
        "Linked new dataset '{}' ({}) to project '{}' ({})",
        dataset_name, dataset_id, project_name, project_id
    );
    Ok(dataset_id)
}

pub async fn get_or_create_project_id<D>(dir: &D, name: &str) -> Result<ProjectId, ServiceError>
where
    D: DirectoryService + ?Sized,
{
    let projects = dir.list_projects().await?;
    if let Some(project) = projects.iter().find(|p| p.name == name) {
        debug!("Found project '{}' ({})", name, project.id);
        return Ok(project.id);
    }

    let id = dir.create_project(name).await?;
    info!("Created project '{}' ({})", name, id);
    Ok(id)
}

pub async fn get_or_create_dataset_id<D>(dir: &D, name: &str) -> Result<DatasetId, ServiceError>
where
    D: DirectoryService + ?Sized,
{
    let datasets = dir.list_datasets().await?;
    if let Some(dataset) = datasets.iter().find(|d| d.name == name) {
        debug!("Found dataset '{}' ({})", name, dataset.id);
        return Ok(dataset.id);
    }

    create_dataset(dir, name).await
}

/// Create a dataset unconditionally
pub async fn create_dataset<D>(dir: &D, name: &str) -> Result<DatasetId, ServiceError>
where
    D: DirectoryService + ?Sized,
{
    let id = dir.create_dataset(name).await?;
    info!("Created dataset '{}' ({})", name, id);
    Ok(id)
}

/// First dataset called `name` that is not a child of any project
async fn find_orphan_dataset<D>(dir: &D, name: &str) -> Result<Option<DatasetId>, ServiceError>
where
    D: DirectoryService + ?Sized,
{
    let candidates: Vec<DatasetId> = dir
        .list_datasets()
        .await?
        .into_iter()
        .filter(|d| d.name == name)
        .map(|d| d.id)
        .collect();
    if candidates.is_empty() {
        return Ok(None);
    }

    let mut owned = Vec::new();
    for project in dir.list_projects().await? {
        owned.extend(
            dir.list_project_datasets(project.id)
                .await?
                .into_iter()
                .map(|d| d.id),
        );
    }

    Ok(candidates.into_iter().find(|id| !owned.contains(id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryServer;

    #[tokio::test]
    async fn test_dataset_without_project_is_created_once() {
        let server = MemoryServer::new();
        let session = server.session();

        let first = resolve_dataset(&session, "D", None, Default::default())
            .await
            .unwrap();
        let second = resolve_dataset(&session, "D", None, Default::default())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(server.dataset_count(), 1);
        assert_eq!(server.project_count(), 0);
    }

    #[tokio::test]
    async fn test_dataset_name_match_is_case_sensitive() {
        let server = MemoryServer::new();
        let existing = server.seed_dataset("Dataset");
        let session = server.session();

        let id = resolve_dataset(&session, "dataset", None, Default::default())
            .await
            .unwrap();

        assert_ne!(id, existing);
        assert_eq!(server.dataset_count(), 2);
    }

    #[tokio::test]
    async fn test_resolution_with_project_is_idempotent() {
        let server = MemoryServer::new();
        let session = server.session();

        let first = resolve_dataset(&session, "D", Some("P"), Default::default())
            .await
            .unwrap();
        let second = resolve_dataset(&session, "D", Some("P"), Default::default())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(server.project_count(), 1);
        assert_eq!(server.dataset_count(), 1);
        assert_eq!(server.project_dataset_link_count(), 1);
    }

    #[tokio::test]
    async fn test_orphan_dataset_is_not_reused_by_default() {
        let server = MemoryServer::new();
        let orphan = server.seed_dataset("D");
        let session = server.session();

        let id = resolve_dataset(&session, "D", Some("P"), UnlinkedDatasetPolicy::CreateNew)
            .await
            .unwrap();

        assert_ne!(id, orphan);
        assert_eq!(server.dataset_count(), 2);
        let project = session.list_projects().await.unwrap()[0].id;
        let children = session.list_project_datasets(project).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, id);
    }

    #[tokio::test]
    async fn test_orphan_dataset_relinked_when_requested() {
        let server = MemoryServer::new();
        let orphan = server.seed_dataset("D");
        let session = server.session();

        let id = resolve_dataset(&session, "D", Some("P"), UnlinkedDatasetPolicy::Relink)
            .await
            .unwrap();

        assert_eq!(id, orphan);
        assert_eq!(server.dataset_count(), 1);
        assert_eq!(server.project_dataset_link_count(), 1);
    }

    #[tokio::test]
    async fn test_relink_ignores_datasets_owned_by_other_projects() {
        let server = MemoryServer::new();
        let other = server.seed_project("Other");
        let owned = server.seed_dataset("D");
        server.seed_project_link(other, owned);
        let session = server.session();

        let id = resolve_dataset(&session, "D", Some("P"), UnlinkedDatasetPolicy::Relink)
            .await
            .unwrap();

        assert_ne!(id, owned);
        assert_eq!(server.dataset_count(), 2);
    }

    #[tokio::test]
    async fn test_existing_project_is_reused() {
        let server = MemoryServer::new();
        let project = server.seed_project("P");
        let session = server.session();

        let found = get_or_create_project_id(&session, "P").await.unwrap();

        assert_eq!(found, project);
        assert_eq!(server.project_count(), 1);
    }

    #[tokio::test]
    async fn test_directory_failure_propagates_without_rollback() {
        let server = MemoryServer::new();
        server.fail_dataset_creation();
        let session = server.session();

        let err = resolve_dataset(&session, "D", Some("P"), Default::default())
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Remote { .. }));
        // the project created before the failure stays behind
        assert_eq!(server.project_count(), 1);
        assert_eq!(server.dataset_count(), 0);
    }
}
