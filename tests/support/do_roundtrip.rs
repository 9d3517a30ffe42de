#![cfg(feature = "test-utils")]

use omero_transfer::model::ImageId;
use omero_transfer::test_support::MemoryServer;
use omero_transfer::{Config, Credentials, OmeroClient, UploadRequest};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;

pub const TEST_USER: &str = "tester";
pub const TEST_PASSWORD: &str = "secret";

/// Client wired to an in-memory server that only accepts the test login
pub fn memory_client() -> (OmeroClient, MemoryServer) {
    let server = MemoryServer::new().with_login(TEST_USER, TEST_PASSWORD);
    let config = Config::from_credentials(Credentials::new(TEST_USER, TEST_PASSWORD, "localhost"))
        .expect("valid credentials");
    let client = OmeroClient::new(config, Arc::new(server.clone()));
    (client, server)
}

/// Parameterized upload-then-retrieve runner
///
/// Writes the image and attachments to disk, uploads them with the request
/// built by `customize`, downloads the attachments back through the shared
/// link and hands everything to `verify`.
pub async fn do_roundtrip<F, G>(
    test_name: &str,
    image: &[u8],
    attachments: &[(&str, Vec<u8>)],
    customize: F,
    verify: G,
) where
    F: FnOnce(UploadRequest) -> UploadRequest,
    G: FnOnce(&MemoryServer, ImageId, &[PathBuf]),
{
    info!("\n=== {} ===\n", test_name);

    let temp_root = TempDir::new().expect("Failed to create temp root");
    let source_dir = temp_root.path().join("source");
    let download_dir = temp_root.path().join("download");
    std::fs::create_dir_all(&source_dir).expect("Failed to create source dir");
    std::fs::create_dir_all(&download_dir).expect("Failed to create download dir");

    let image_path = source_dir.join("snapshot.png");
    std::fs::write(&image_path, image).expect("Failed to write image");

    let mut request = UploadRequest::new(&image_path, "roundtrip");
    for (name, data) in attachments {
        let path = source_dir.join(name);
        std::fs::write(&path, data).expect("Failed to write attachment");
        request = request.with_attachment(path);
    }
    let request = customize(request);

    let (client, server) = memory_client();
    let image_id = client.upload(&request).await.expect("Upload failed");
    info!("Uploaded image {}", image_id);

    let link = format!("https://omero.example.org/webclient/?show=image-{}", image_id);
    let downloaded = client
        .locate_attachments(&link, &download_dir, Some(&request.namespace))
        .await
        .expect("Download failed");

    for (name, data) in attachments {
        let path = download_dir.join(name);
        assert_eq!(
            &std::fs::read(&path).expect("attachment missing"),
            data,
            "attachment {} differs after roundtrip",
            name
        );
    }

    verify(&server, image_id, &downloaded);
}
