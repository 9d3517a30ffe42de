// Library exports for the CLI and integration tests

pub mod client;
pub mod config;
pub mod error;
pub mod model;
pub mod resolver;
pub mod retrieval;
pub mod service;
pub mod staging;
pub mod transfer;
pub mod web;

// Test support (only available with test-utils feature)
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use client::{OmeroClient, StagedUpload};
pub use config::{Config, Credentials};
pub use error::{ConfigError, Result, ServiceError, TransferError};
pub use resolver::UnlinkedDatasetPolicy;
pub use transfer::UploadRequest;
pub use web::WebGateway;
