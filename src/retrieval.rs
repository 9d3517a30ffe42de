use crate::error::{Result, ServiceError, TransferError};
use crate::model::{Annotation, FileAnnotation, ImageId, OriginalFile};
use crate::service::DirectoryService;
use reqwest::Url;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Extensions stripped from a remote image name before `.ome.tif` is added
const IMAGE_EXTENSIONS: &[&str] = &[
    ".ome.tiff",
    ".ome.tif",
    ".tiff",
    ".tif",
    ".png",
    ".jpg",
    ".jpeg",
];

const EXPORT_EXTENSION: &str = ".ome.tif";

/// Extract the image id from a shared link such as
/// `https://host/webclient/?show=image-482`
pub fn parse_image_id(link: &str) -> Result<ImageId> {
    let invalid = || TransferError::InvalidLink(link.to_string());

    let url = Url::parse(link).map_err(|_| invalid())?;
    let show = url
        .query_pairs()
        .find(|(key, _)| key == "show")
        .map(|(_, value)| value.into_owned())
        .ok_or_else(invalid)?;

    let digits = show.rsplit('-').next().unwrap_or_default();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    digits.parse::<i64>().map(ImageId).map_err(|_| invalid())
}

/// Download every file attachment of the linked image into `dest`
///
/// With a preferred namespace only matching annotations are used, unless
/// none match, in which case all annotations are considered.
pub async fn locate_attachments<D>(
    dir: &D,
    link: &str,
    dest: &Path,
    preferred_namespace: Option<&str>,
) -> Result<Vec<PathBuf>>
where
    D: DirectoryService + ?Sized,
{
    let image_id = parse_image_id(link)?;

    let mut annotations = match preferred_namespace {
        Some(namespace) => dir.list_image_annotations(image_id, Some(namespace)).await?,
        None => Vec::new(),
    };
    if annotations.is_empty() {
        if let Some(namespace) = preferred_namespace {
            debug!(
                "No annotations in namespace '{}' on image {}, using all",
                namespace, image_id
            );
        }
        annotations = dir.list_image_annotations(image_id, None).await?;
    }

    let mut paths = Vec::new();
    let mut used_names = HashSet::new();
    for annotation in &annotations {
        let Some(file_annotation) = annotation.as_file() else {
            if let Annotation::Other { id, kind, .. } = annotation {
                debug!("Skipping {} annotation {} without a file", kind, id);
            }
            continue;
        };

        let name = attachment_file_name(file_annotation, &mut used_names);
        let target = dest.join(name);
        download_original_file(dir, &file_annotation.file, &target).await?;
        paths.push(target);
    }

    info!(
        "Downloaded {} attachment(s) of image {} to {}",
        paths.len(),
        image_id,
        dest.display()
    );
    Ok(paths)
}

/// Export the linked image as OME-TIFF into `dest`
pub async fn export_image<D>(dir: &D, link: &str, dest: &Path) -> Result<PathBuf>
where
    D: DirectoryService + ?Sized,
{
    let image_id = parse_image_id(link)?;
    let image = dir.get_image(image_id).await?;
    let target = dest.join(export_file_name(&image.name));

    let buffers = dir.export_ome_tiff(image_id).await?;
    let mut file = tokio::fs::File::create(&target).await?;
    let mut written = 0usize;
    for buffer in &buffers {
        file.write_all(buffer).await?;
        written += buffer.len();
    }
    file.flush().await?;

    info!(
        "Exported image {} ({} bytes) to {}",
        image_id,
        written,
        target.display()
    );
    Ok(target)
}

/// Copy a stored file to `target`, reading at most `max_read_size` bytes per
/// request
///
/// Reads continue until the declared file size is reached, so a server that
/// returns fewer bytes than requested is followed up rather than treated as
/// end of file. The data lands in a `.part` sibling first and is renamed into
/// place once complete.
pub async fn download_original_file<D>(dir: &D, file: &OriginalFile, target: &Path) -> Result<u64>
where
    D: DirectoryService + ?Sized,
{
    let partial = partial_path(target);
    let written = match copy_chunks(dir, file, &partial).await {
        Ok(written) => written,
        Err(e) => {
            if let Err(remove_err) = tokio::fs::remove_file(&partial).await {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        "Failed to remove partial download {}: {}",
                        partial.display(),
                        remove_err
                    );
                }
            }
            return Err(e);
        }
    };
    tokio::fs::rename(&partial, target).await?;

    debug!(
        "Downloaded file {} ({} bytes) to {}",
        file.id,
        written,
        target.display()
    );
    Ok(written)
}

async fn copy_chunks<D>(dir: &D, file: &OriginalFile, path: &Path) -> Result<u64>
where
    D: DirectoryService + ?Sized,
{
    let chunk_size = dir.max_read_size().max(1);
    let mut output = tokio::fs::File::create(path).await?;
    let mut offset = 0u64;

    while offset < file.size {
        let length = chunk_size.min(file.size - offset);
        let chunk = dir.read_file(file.id, offset, length).await?;
        if chunk.is_empty() {
            return Err(ServiceError::InvalidResponse(format!(
                "File {} ended after {} of {} bytes",
                file.id, offset, file.size
            ))
            .into());
        }
        if chunk.len() as u64 > length {
            return Err(ServiceError::InvalidResponse(format!(
                "File {} returned {} bytes for a read of {}",
                file.id,
                chunk.len(),
                length
            ))
            .into());
        }
        output.write_all(&chunk).await?;
        offset += chunk.len() as u64;
    }
    output.flush().await?;

    Ok(offset)
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

/// Local name for an attachment, prefixed with the annotation id when an
/// earlier attachment of the same image already took the name
fn attachment_file_name(annotation: &FileAnnotation, used: &mut HashSet<String>) -> String {
    let name = safe_file_name(&annotation.file.name);
    if used.insert(name.clone()) {
        return name;
    }

    let renamed = format!("{}_{}", annotation.id, name);
    warn!(
        "Attachment name '{}' is used more than once, saving annotation {} as '{}'",
        name, annotation.id, renamed
    );
    used.insert(renamed.clone());
    renamed
}

/// Remote image name with any image extension swapped for `.ome.tif`
pub fn export_file_name(remote_name: &str) -> String {
    let base = safe_file_name(remote_name);
    let lower = base.to_ascii_lowercase();
    let stem = IMAGE_EXTENSIONS
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .map(|ext| &base[..base.len() - ext.len()])
        .unwrap_or(&base);

    let stem = if stem.is_empty() { "image" } else { stem };
    format!("{}{}", stem, EXPORT_EXTENSION)
}

/// Keep only the final path component of a server-supplied name
fn safe_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    match base {
        "" | "." | ".." => {
            warn!("Remote file name '{}' has no usable component", name);
            "attachment".to_string()
        }
        other => other.to_string(),
    }
}
