use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::model::Response;
use crate::model::object::{
    BatchOperation, CollectionResult, ObjectBatch, ObjectCollectionConfig, ObjectItem, ObjectKey, ObjectList,
    ObjectMetadata, ObjectProperties, ObjectQueryConfig, ObjectSource, ObjectTransferConfig, SignedUrlMethod,
};
use crate::ql::Expression;

pub mod errors;
pub mod helper;
pub mod kv;
pub mod match_condition;

pub mod azure_blob_storage;
pub mod file_system;
pub mod google_cloud_storage;
pub mod s3;

use errors::ObjectStoreError;
use helper::QueryArgs;
use match_condition::MatchCondition;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Kind {
    FileSystem,
    S3,
    AzureBlobStorage,
    GoogleCloudStorage,
}

/// A `where` condition, either still textual or already parsed.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    Text(String),
    Expression(Expression),
}

impl Condition {
    pub fn expression(&self) -> Result<Expression, ObjectStoreError> {
        match self {
            Condition::Text(text) => {
                crate::ql::parse(text).map_err(|e| ObjectStoreError::bad_request(e.to_string()))
            }
            Condition::Expression(expr) => Ok(expr.clone()),
        }
    }
}

impl From<&str> for Condition {
    fn from(text: &str) -> Self {
        Condition::Text(text.to_string())
    }
}

impl From<String> for Condition {
    fn from(text: String) -> Self {
        Condition::Text(text)
    }
}

impl From<Expression> for Condition {
    fn from(expr: Expression) -> Self {
        Condition::Expression(expr)
    }
}

/// Bytes source for a put.
pub enum PutPayload {
    Bytes(Vec<u8>),
    File(PathBuf),
    Reader(Box<dyn Read + Send>),
}

impl From<Vec<u8>> for PutPayload {
    fn from(bytes: Vec<u8>) -> Self {
        PutPayload::Bytes(bytes)
    }
}

impl From<&[u8]> for PutPayload {
    fn from(bytes: &[u8]) -> Self {
        PutPayload::Bytes(bytes.to_vec())
    }
}

impl From<&str> for PutPayload {
    fn from(text: &str) -> Self {
        PutPayload::Bytes(text.as_bytes().to_vec())
    }
}

impl PutPayload {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        PutPayload::File(path.into())
    }

    pub fn from_reader(reader: impl Read + Send + 'static) -> Self {
        PutPayload::Reader(Box::new(reader))
    }
}

/// Download sink for a get; absent means "return the bytes in the item".
pub enum GetDestination {
    File(PathBuf),
    Writer(Box<dyn Write + Send>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Returning {
    New,
}

#[derive(Default)]
pub struct PutOptions {
    pub metadata: Option<ObjectMetadata>,
    pub properties: Option<ObjectProperties>,
    pub condition: Option<Condition>,
    pub config: Option<ObjectTransferConfig>,
    pub returning: Option<Returning>,
    pub collection: Option<String>,
}

#[derive(Default)]
pub struct GetOptions {
    pub destination: Option<GetDestination>,
    pub condition: Option<Condition>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub config: Option<ObjectTransferConfig>,
    pub collection: Option<String>,
}

#[derive(Default)]
pub struct UpdateOptions {
    pub metadata: Option<ObjectMetadata>,
    pub properties: Option<ObjectProperties>,
    pub condition: Option<Condition>,
    pub collection: Option<String>,
}

#[derive(Default)]
pub struct DeleteOptions {
    pub condition: Option<Condition>,
    pub collection: Option<String>,
}

#[derive(Default)]
pub struct CopyOptions {
    pub metadata: Option<ObjectMetadata>,
    pub properties: Option<ObjectProperties>,
    pub condition: Option<Condition>,
    pub collection: Option<String>,
}

#[derive(Default)]
pub struct QueryOptions {
    pub condition: Option<Condition>,
    pub limit: Option<u64>,
    pub continuation: Option<String>,
    pub config: Option<ObjectQueryConfig>,
    pub collection: Option<String>,
}

/// Normalized put arguments handed to providers.
pub struct PutArgs {
    pub id: String,
    pub payload: PutPayload,
    pub metadata: Option<ObjectMetadata>,
    pub properties: Option<ObjectProperties>,
    pub match_condition: MatchCondition,
    pub returning: Option<Returning>,
    pub config: Option<ObjectTransferConfig>,
    pub collection: String,
}

pub struct GetArgs {
    pub id: String,
    pub version: Option<String>,
    pub destination: Option<GetDestination>,
    pub match_condition: MatchCondition,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub config: Option<ObjectTransferConfig>,
    pub collection: String,
}

pub struct UpdateArgs {
    pub id: String,
    pub version: Option<String>,
    pub metadata: Option<ObjectMetadata>,
    pub properties: Option<ObjectProperties>,
    pub match_condition: MatchCondition,
    pub collection: String,
}

pub struct CopyArgs {
    pub id: String,
    pub source_id: String,
    pub source_version: Option<String>,
    pub source_collection: Option<String>,
    pub metadata: Option<ObjectMetadata>,
    pub properties: Option<ObjectProperties>,
    pub match_condition: MatchCondition,
    pub collection: String,
}

pub struct BatchDelete {
    pub id: String,
    pub version: Option<String>,
    pub match_condition: MatchCondition,
}

/// Uniform provider contract for the object store.
#[enum_dispatch]
pub trait ObjectStoreProvider {
    fn kind(&self) -> Kind;

    /// Provider-level default collection, if configured.
    fn default_collection(&self) -> Option<&str>;

    fn create_collection(
        &self,
        collection: &str,
        config: Option<&ObjectCollectionConfig>,
        exists: Option<bool>,
    ) -> Result<CollectionResult, ObjectStoreError>;

    fn drop_collection(&self, collection: &str, exists: Option<bool>) -> Result<CollectionResult, ObjectStoreError>;

    fn list_collections(&self) -> Result<Vec<String>, ObjectStoreError>;

    fn has_collection(&self, collection: &str) -> Result<bool, ObjectStoreError>;

    fn put(&self, args: PutArgs) -> Result<ObjectItem, ObjectStoreError>;

    fn get(&self, args: GetArgs) -> Result<ObjectItem, ObjectStoreError>;

    fn get_properties(
        &self,
        id: &str,
        version: Option<&str>,
        match_condition: &MatchCondition,
        collection: &str,
    ) -> Result<ObjectItem, ObjectStoreError>;

    fn get_versions(&self, id: &str, collection: &str) -> Result<ObjectItem, ObjectStoreError>;

    fn update(&self, args: UpdateArgs) -> Result<ObjectItem, ObjectStoreError>;

    fn delete(
        &self,
        id: &str,
        version: Option<&str>,
        match_condition: &MatchCondition,
        collection: &str,
    ) -> Result<(), ObjectStoreError>;

    fn copy(&self, args: CopyArgs) -> Result<ObjectItem, ObjectStoreError>;

    fn generate(
        &self,
        id: &str,
        version: Option<&str>,
        method: SignedUrlMethod,
        expiry: Duration,
        collection: &str,
    ) -> Result<ObjectItem, ObjectStoreError>;

    fn query(&self, args: &QueryArgs, collection: &str) -> Result<ObjectList, ObjectStoreError>;

    fn count(&self, args: &QueryArgs, collection: &str) -> Result<u64, ObjectStoreError>;

    fn batch(&self, deletes: Vec<BatchDelete>, collection: &str) -> Result<(), ObjectStoreError>;

    fn close(&self) -> Result<(), ObjectStoreError>;
}

#[enum_dispatch(ObjectStoreProvider)]
pub enum ObjectStoreBackend {
    FileSystem(file_system::FileSystem),
    S3(s3::S3),
    AzureBlobStorage(azure_blob_storage::AzureBlobStorage),
    GoogleCloudStorage(google_cloud_storage::GoogleCloudStorage),
}

/// Provider-agnostic object store component.
pub struct ObjectStore {
    backend: ObjectStoreBackend,
    collection: Option<String>,
}

impl ObjectStore {
    pub fn new(backend: impl Into<ObjectStoreBackend>) -> Self {
        Self {
            backend: backend.into(),
            collection: None,
        }
    }

    pub fn with_collection(backend: impl Into<ObjectStoreBackend>, collection: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            collection: Some(collection.into()),
        }
    }

    pub fn kind(&self) -> Kind {
        self.backend.kind()
    }

    /// Collection precedence: explicit argument, then provider config,
    /// then component default.
    fn resolve_collection(&self, explicit: Option<&str>) -> Result<String, ObjectStoreError> {
        explicit
            .map(str::to_string)
            .or_else(|| self.backend.default_collection().map(str::to_string))
            .or_else(|| self.collection.clone())
            .ok_or_else(|| ObjectStoreError::bad_request("Collection name should be specified"))
    }

    fn parse_condition(condition: Option<&Condition>) -> Result<Option<Expression>, ObjectStoreError> {
        condition.map(Condition::expression).transpose()
    }

    fn compile_match_condition(condition: Option<&Condition>) -> Result<MatchCondition, ObjectStoreError> {
        match Self::parse_condition(condition)? {
            Some(expr) => MatchCondition::from_expression(&expr),
            None => Ok(MatchCondition::default()),
        }
    }

    /// Collection-lifecycle conditions only support `exists()` and
    /// `not_exists()`.
    fn parse_where_exists(condition: Option<&Condition>) -> Result<Option<bool>, ObjectStoreError> {
        match Self::parse_condition(condition)? {
            None => Ok(None),
            Some(expr) => match expr.where_exists() {
                Some(exists) => Ok(Some(exists)),
                None => Err(ObjectStoreError::bad_request(
                    "Only exists() and not_exists() conditions are supported here",
                )),
            },
        }
    }

    pub fn create_collection(
        &self,
        collection: Option<&str>,
        config: Option<&ObjectCollectionConfig>,
        condition: Option<Condition>,
    ) -> Result<Response<CollectionResult>, ObjectStoreError> {
        let exists = Self::parse_where_exists(condition.as_ref())?;
        let collection = self.resolve_collection(collection)?;
        self.backend
            .create_collection(&collection, config, exists)
            .map(Response::new)
    }

    pub fn drop_collection(
        &self,
        collection: Option<&str>,
        condition: Option<Condition>,
    ) -> Result<Response<CollectionResult>, ObjectStoreError> {
        let exists = Self::parse_where_exists(condition.as_ref())?;
        let collection = self.resolve_collection(collection)?;
        self.backend.drop_collection(&collection, exists).map(Response::new)
    }

    pub fn list_collections(&self) -> Result<Response<Vec<String>>, ObjectStoreError> {
        self.backend.list_collections().map(Response::new)
    }

    pub fn has_collection(&self, collection: Option<&str>) -> Result<Response<bool>, ObjectStoreError> {
        let collection = self.resolve_collection(collection)?;
        self.backend.has_collection(&collection).map(Response::new)
    }

    pub fn put(
        &self,
        key: impl Into<ObjectKey>,
        payload: impl Into<PutPayload>,
        options: PutOptions,
    ) -> Result<Response<ObjectItem>, ObjectStoreError> {
        let key = key.into();
        let match_condition = Self::compile_match_condition(options.condition.as_ref())?;
        let collection = self.resolve_collection(options.collection.as_deref())?;
        self.backend
            .put(PutArgs {
                id: key.id,
                payload: payload.into(),
                metadata: options.metadata,
                properties: options.properties,
                match_condition,
                returning: options.returning,
                config: options.config,
                collection,
            })
            .map(Response::new)
    }

    pub fn get(
        &self,
        key: impl Into<ObjectKey>,
        options: GetOptions,
    ) -> Result<Response<ObjectItem>, ObjectStoreError> {
        let key = key.into();
        let match_condition = Self::compile_match_condition(options.condition.as_ref())?;
        let collection = self.resolve_collection(options.collection.as_deref())?;
        self.backend
            .get(GetArgs {
                id: key.id,
                version: key.version,
                destination: options.destination,
                match_condition,
                start: options.start,
                end: options.end,
                config: options.config,
                collection,
            })
            .map(Response::new)
    }

    pub fn get_metadata(
        &self,
        key: impl Into<ObjectKey>,
        condition: Option<Condition>,
        collection: Option<&str>,
    ) -> Result<Response<ObjectItem>, ObjectStoreError> {
        self.get_properties(key, condition, collection)
    }

    pub fn get_properties(
        &self,
        key: impl Into<ObjectKey>,
        condition: Option<Condition>,
        collection: Option<&str>,
    ) -> Result<Response<ObjectItem>, ObjectStoreError> {
        let key = key.into();
        let match_condition = Self::compile_match_condition(condition.as_ref())?;
        let collection = self.resolve_collection(collection)?;
        self.backend
            .get_properties(&key.id, key.version.as_deref(), &match_condition, &collection)
            .map(Response::new)
    }

    pub fn get_versions(
        &self,
        key: impl Into<ObjectKey>,
        collection: Option<&str>,
    ) -> Result<Response<ObjectItem>, ObjectStoreError> {
        let key = key.into();
        let collection = self.resolve_collection(collection)?;
        self.backend.get_versions(&key.id, &collection).map(Response::new)
    }

    pub fn update(
        &self,
        key: impl Into<ObjectKey>,
        options: UpdateOptions,
    ) -> Result<Response<ObjectItem>, ObjectStoreError> {
        let key = key.into();
        let match_condition = Self::compile_match_condition(options.condition.as_ref())?;
        let collection = self.resolve_collection(options.collection.as_deref())?;
        self.backend
            .update(UpdateArgs {
                id: key.id,
                version: key.version,
                metadata: options.metadata,
                properties: options.properties,
                match_condition,
                collection,
            })
            .map(Response::new)
    }

    pub fn delete(
        &self,
        key: impl Into<ObjectKey>,
        options: DeleteOptions,
    ) -> Result<Response<()>, ObjectStoreError> {
        let key = key.into();
        let match_condition = Self::compile_match_condition(options.condition.as_ref())?;
        let collection = self.resolve_collection(options.collection.as_deref())?;
        self.backend
            .delete(&key.id, key.version.as_deref(), &match_condition, &collection)
            .map(Response::new)
    }

    pub fn copy(
        &self,
        key: impl Into<ObjectKey>,
        source: ObjectSource,
        options: CopyOptions,
    ) -> Result<Response<ObjectItem>, ObjectStoreError> {
        let key = key.into();
        let match_condition = Self::compile_match_condition(options.condition.as_ref())?;
        let collection = self.resolve_collection(options.collection.as_deref())?;
        self.backend
            .copy(CopyArgs {
                id: key.id,
                source_id: source.id,
                source_version: source.version,
                source_collection: source.collection,
                metadata: options.metadata,
                properties: options.properties,
                match_condition,
                collection,
            })
            .map(Response::new)
    }

    pub fn generate(
        &self,
        key: impl Into<ObjectKey>,
        method: SignedUrlMethod,
        expiry_ms: u64,
        collection: Option<&str>,
    ) -> Result<Response<ObjectItem>, ObjectStoreError> {
        let key = key.into();
        let collection = self.resolve_collection(collection)?;
        self.backend
            .generate(
                &key.id,
                key.version.as_deref(),
                method,
                Duration::from_millis(expiry_ms),
                &collection,
            )
            .map(Response::new)
    }

    pub fn query(&self, options: QueryOptions) -> Result<Response<ObjectList>, ObjectStoreError> {
        let collection = self.resolve_collection(options.collection.as_deref())?;
        let where_expr = Self::parse_condition(options.condition.as_ref())?;
        let args = QueryArgs::from_parts(
            where_expr.as_ref(),
            options.limit,
            options.continuation.as_deref(),
            options.config.as_ref(),
        )?;
        self.backend.query(&args, &collection).map(Response::new)
    }

    pub fn count(&self, options: QueryOptions) -> Result<Response<u64>, ObjectStoreError> {
        let collection = self.resolve_collection(options.collection.as_deref())?;
        let where_expr = Self::parse_condition(options.condition.as_ref())?;
        let args = QueryArgs::from_parts(
            where_expr.as_ref(),
            options.limit,
            options.continuation.as_deref(),
            options.config.as_ref(),
        )?;
        self.backend.count(&args, &collection).map(Response::new)
    }

    pub fn batch(
        &self,
        batch: ObjectBatch,
        collection: Option<&str>,
    ) -> Result<Response<()>, ObjectStoreError> {
        let collection = self.resolve_collection(collection)?;
        let mut deletes = Vec::with_capacity(batch.operations.len());
        for operation in batch.operations {
            match operation {
                BatchOperation::Delete { key, condition } => {
                    let match_condition = match condition {
                        Some(expr) => MatchCondition::from_expression(&expr)?,
                        None => MatchCondition::default(),
                    };
                    deletes.push(BatchDelete {
                        id: key.id,
                        version: key.version,
                        match_condition,
                    });
                }
            }
        }
        self.backend.batch(deletes, &collection).map(Response::new)
    }

    pub fn close(&self) -> Result<Response<()>, ObjectStoreError> {
        self.backend.close().map(Response::new)
    }
}
