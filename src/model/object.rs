use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ql::Expression;

/// Version sentinel selecting every version of an object on delete.
pub const ALL_VERSIONS: &str = "*";

pub type ObjectMetadata = HashMap<String, String>;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageClass {
    Hot,
    Cool,
    Cold,
    Archive,
}

impl FromStr for StorageClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hot" => Ok(StorageClass::Hot),
            "cool" => Ok(StorageClass::Cool),
            "cold" => Ok(StorageClass::Cold),
            "archive" => Ok(StorageClass::Archive),
            _ => Err(format!("unknown storage class: {s}")),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectKey {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
}

impl ObjectKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
        }
    }

    pub fn with_version(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: Some(version.into()),
        }
    }

    pub fn is_all_versions(&self) -> bool {
        self.version.as_deref() == Some(ALL_VERSIONS)
    }
}

impl From<&str> for ObjectKey {
    fn from(id: &str) -> Self {
        ObjectKey::new(id)
    }
}

impl From<String> for ObjectKey {
    fn from(id: String) -> Self {
        ObjectKey::new(id)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ObjectProperties {
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_length: Option<u64>,
    pub content_md5: Option<String>,
    pub content_type: Option<String>,
    pub crc32c: Option<String>,
    pub expires: Option<f64>,
    pub last_modified: Option<f64>,
    pub etag: Option<String>,
    pub storage_class: Option<StorageClass>,
}

impl ObjectProperties {
    /// Field-wise merge: overlay fields win when set, base fields survive
    /// otherwise.
    pub fn merged(base: &ObjectProperties, overlay: &ObjectProperties) -> ObjectProperties {
        macro_rules! pick {
            ($field:ident) => {
                overlay.$field.clone().or_else(|| base.$field.clone())
            };
        }
        ObjectProperties {
            cache_control: pick!(cache_control),
            content_disposition: pick!(content_disposition),
            content_encoding: pick!(content_encoding),
            content_language: pick!(content_language),
            content_length: overlay.content_length.or(base.content_length),
            content_md5: pick!(content_md5),
            content_type: pick!(content_type),
            crc32c: pick!(crc32c),
            expires: overlay.expires.or(base.expires),
            last_modified: overlay.last_modified.or(base.last_modified),
            etag: pick!(etag),
            storage_class: overlay.storage_class.or(base.storage_class),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ObjectVersion {
    pub version: Option<String>,
    pub properties: Option<ObjectProperties>,
    pub metadata: Option<ObjectMetadata>,
    pub latest: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ObjectItem {
    pub key: ObjectKey,
    pub value: Option<Vec<u8>>,
    pub metadata: Option<ObjectMetadata>,
    pub properties: Option<ObjectProperties>,
    pub versions: Option<Vec<ObjectVersion>>,
    pub url: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ObjectList {
    pub items: Vec<ObjectItem>,
    pub continuation: Option<String>,
    pub prefixes: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ObjectCollectionConfig {
    pub acl: Option<String>,
    pub versioned: Option<bool>,
    pub nconfig: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ObjectTransferConfig {
    pub multipart: Option<bool>,
    pub chunksize: Option<u64>,
    pub concurrency: Option<u32>,
    pub nconfig: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ObjectQueryConfig {
    pub paging: Option<bool>,
    pub page_size: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObjectSource {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
}

impl ObjectSource {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
            collection: None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionStatus {
    Created,
    Exists,
    Dropped,
    NotExists,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectionResult {
    pub status: CollectionStatus,
}

impl CollectionResult {
    pub fn new(status: CollectionStatus) -> Self {
        Self { status }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignedUrlMethod {
    Get,
    Put,
    Delete,
}

/// Batch of homogeneous operations, currently restricted to deletes.
#[derive(Clone, Debug, Default)]
pub struct ObjectBatch {
    pub operations: Vec<BatchOperation>,
}

#[derive(Clone, Debug)]
pub enum BatchOperation {
    Delete {
        key: ObjectKey,
        condition: Option<Expression>,
    },
}

impl ObjectBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delete(mut self, key: impl Into<ObjectKey>) -> Self {
        self.operations.push(BatchOperation::Delete {
            key: key.into(),
            condition: None,
        });
        self
    }

    pub fn delete_where(mut self, key: impl Into<ObjectKey>, condition: Expression) -> Self {
        self.operations.push(BatchOperation::Delete {
            key: key.into(),
            condition: Some(condition),
        });
        self
    }
}
