use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! remote_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn value(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

remote_id!(
    /// Server-assigned project identifier
    ProjectId
);
remote_id!(
    /// Server-assigned dataset identifier
    DatasetId
);
remote_id!(
    /// Server-assigned image identifier
    ImageId
);
remote_id!(AnnotationId);
remote_id!(
    /// Identifier of the original file wrapped by a file annotation
    FileId
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: ImageId,
    pub name: String,
}

/// The stored side-file behind a file annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalFile {
    pub id: FileId,
    pub name: String,
    pub size: u64,
    pub mimetype: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAnnotation {
    pub id: AnnotationId,
    pub namespace: Option<String>,
    pub file: OriginalFile,
}

/// Annotation linked to an image
///
/// Servers attach many annotation kinds (tags, comments, key-value maps).
/// Only file annotations carry downloadable content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Annotation {
    File(FileAnnotation),
    Other {
        id: AnnotationId,
        kind: String,
        namespace: Option<String>,
    },
}

impl Annotation {
    pub fn id(&self) -> AnnotationId {
        match self {
            Annotation::File(file) => file.id,
            Annotation::Other { id, .. } => *id,
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            Annotation::File(file) => file.namespace.as_deref(),
            Annotation::Other { namespace, .. } => namespace.as_deref(),
        }
    }

    pub fn has_file(&self) -> bool {
        matches!(self, Annotation::File(_))
    }

    pub fn as_file(&self) -> Option<&FileAnnotation> {
        match self {
            Annotation::File(file) => Some(file),
            Annotation::Other { .. } => None,
        }
    }
}
