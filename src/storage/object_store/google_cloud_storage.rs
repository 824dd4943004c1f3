use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::buckets::Versioning;
use google_cloud_storage::http::buckets::delete::DeleteBucketRequest;
use google_cloud_storage::http::buckets::get::GetBucketRequest;
use google_cloud_storage::http::buckets::insert::{BucketCreationConfig, InsertBucketParam, InsertBucketRequest};
use google_cloud_storage::http::buckets::list::ListBucketsRequest;
use google_cloud_storage::http::objects::Object as GcpObject;
use google_cloud_storage::http::objects::delete::DeleteObjectRequest;
use google_cloud_storage::http::objects::download::Range;
use google_cloud_storage::http::objects::get::GetObjectRequest;
use google_cloud_storage::http::objects::list::ListObjectsRequest;
use google_cloud_storage::http::objects::rewrite::RewriteObjectRequest;
use google_cloud_storage::http::objects::upload::{UploadObjectRequest, UploadType};
use google_cloud_storage::sign::{SignedURLMethod, SignedURLOptions};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{RateLimiter, clock};

use crate::model::object::{
    CollectionResult, CollectionStatus, ObjectCollectionConfig, ObjectItem, ObjectKey, ObjectList, ObjectProperties,
    ObjectVersion, SignedUrlMethod, StorageClass,
};
use crate::runtime::block_on;
use crate::storage::object_store::errors::ObjectStoreError;
use crate::storage::object_store::helper::QueryArgs;
use crate::storage::object_store::match_condition::{MatchCondition, MatchTarget};
use crate::storage::object_store::{
    BatchDelete, CopyArgs, GetArgs, GetDestination, Kind, ObjectStoreProvider, PutArgs, PutPayload, Returning,
    UpdateArgs,
};

type WriteRateLimiter = RateLimiter<NotKeyed, InMemoryState, clock::DefaultClock, NoOpMiddleware>;

/// Object store on Google Cloud Storage. Versions map to generations.
pub struct GoogleCloudStorage {
    client: Client,
    project_id: String,
    folder: Option<String>,
    write_rate_limiter: Option<Arc<WriteRateLimiter>>,
}

impl GoogleCloudStorage {
    pub fn new(project_id: impl Into<String>) -> Result<GoogleCloudStorage, ObjectStoreError> {
        let config = block_on(ClientConfig::default().with_auth())
            .map_err(|e| ObjectStoreError::internal(format!("Cannot create object storage client: {e}")))?;
        Ok(GoogleCloudStorage {
            client: Client::new(config),
            project_id: project_id.into(),
            folder: None,
            write_rate_limiter: None,
        })
    }

    pub fn set_folder(&mut self, folder: impl Into<String>) {
        self.folder = Some(folder.into());
    }

    pub fn set_write_rate_limiter(&mut self, rate_limiter: Arc<WriteRateLimiter>) {
        self.write_rate_limiter = Some(rate_limiter);
    }

    fn wait_for_a_slot_in_admission_control(&self, timeout: Duration) -> Result<(), ObjectStoreError> {
        if let Some(rate_limiter) = &self.write_rate_limiter {
            let start = Instant::now();
            loop {
                if start.elapsed() > timeout {
                    return Err(ObjectStoreError::Timeout {
                        raw_error_message: "Admission control blocked after several tries".to_string(),
                    });
                }
                if rate_limiter.check().is_err() {
                    std::thread::sleep(Duration::from_secs(3));
                    continue;
                }
                break;
            }
        }
        Ok(())
    }

    fn object_name(id: &str) -> &str {
        id.trim_start_matches('/')
    }

    fn generation_of(version: Option<&str>) -> Result<Option<i64>, ObjectStoreError> {
        version
            .map(|v| {
                v.parse::<i64>()
                    .map_err(|_| ObjectStoreError::bad_request(format!("Invalid object generation: {v}")))
            })
            .transpose()
    }

    fn get_gcp_object(
        &self,
        bucket: &str,
        id: &str,
        version: Option<&str>,
    ) -> Result<Option<GcpObject>, ObjectStoreError> {
        let request = GetObjectRequest {
            bucket: bucket.to_string(),
            object: Self::object_name(id).to_string(),
            generation: Self::generation_of(version)?,
            ..Default::default()
        };
        match block_on(self.client.get_object(&request)) {
            Ok(object) => Ok(Some(object)),
            Err(e) => {
                let message = e.to_string();
                if message.contains("404") || message.to_ascii_lowercase().contains("not found") {
                    Ok(None)
                } else {
                    Err(ObjectStoreError::internal(format!("get_object failed: {message}")))
                }
            }
        }
    }

    fn object_item(&self, bucket: &str, id: &str, object: &GcpObject) -> ObjectItem {
        ObjectItem {
            key: ObjectKey {
                id: id.to_string(),
                version: Some(object.generation.to_string()),
            },
            value: None,
            metadata: object.metadata.clone().filter(|m| !m.is_empty()),
            properties: Some(object_properties(object)),
            versions: None,
            url: Some(format!("https://storage.googleapis.com/{bucket}/{}", object.name)),
        }
    }

    fn match_target(object: Option<&GcpObject>) -> Option<MatchTarget> {
        object.map(|object| MatchTarget {
            etag: Some(object.etag.clone()),
            last_modified: object.updated.map(|t| t.unix_timestamp() as f64),
            version: Some(object.generation.to_string()),
        })
    }

    fn payload_bytes(payload: &mut PutPayload) -> Result<Vec<u8>, ObjectStoreError> {
        match payload {
            PutPayload::Bytes(bytes) => Ok(bytes.clone()),
            PutPayload::File(path) => std::fs::read(path)
                .map_err(|e| ObjectStoreError::internal(format!("Cannot read upload file: {e}"))),
            PutPayload::Reader(reader) => {
                let mut bytes = Vec::new();
                reader
                    .read_to_end(&mut bytes)
                    .map_err(|e| ObjectStoreError::internal(format!("Cannot read upload stream: {e}")))?;
                Ok(bytes)
            }
        }
    }
}

fn object_properties(object: &GcpObject) -> ObjectProperties {
    ObjectProperties {
        cache_control: object.cache_control.clone(),
        content_disposition: object.content_disposition.clone(),
        content_encoding: object.content_encoding.clone(),
        content_language: object.content_language.clone(),
        content_length: Some(object.size as u64),
        content_md5: object.md5_hash.clone(),
        content_type: object.content_type.clone(),
        crc32c: object.crc32c.clone(),
        last_modified: object.updated.map(|t| t.unix_timestamp() as f64),
        etag: Some(object.etag.clone()),
        storage_class: from_gcs_storage_class(object.storage_class.as_deref()),
        ..Default::default()
    }
}

fn to_gcs_storage_class(storage_class: StorageClass) -> &'static str {
    match storage_class {
        StorageClass::Hot => "STANDARD",
        StorageClass::Cool => "NEARLINE",
        StorageClass::Cold => "COLDLINE",
        StorageClass::Archive => "ARCHIVE",
    }
}

fn from_gcs_storage_class(value: Option<&str>) -> Option<StorageClass> {
    match value {
        Some("STANDARD") => Some(StorageClass::Hot),
        Some("NEARLINE") => Some(StorageClass::Cool),
        Some("COLDLINE") => Some(StorageClass::Cold),
        Some("ARCHIVE") => Some(StorageClass::Archive),
        _ => None,
    }
}

impl ObjectStoreProvider for GoogleCloudStorage {
    fn kind(&self) -> Kind {
        Kind::GoogleCloudStorage
    }

    fn default_collection(&self) -> Option<&str> {
        self.folder.as_deref()
    }

    fn create_collection(
        &self,
        collection: &str,
        config: Option<&ObjectCollectionConfig>,
        exists: Option<bool>,
    ) -> Result<CollectionResult, ObjectStoreError> {
        if self.has_collection(collection)? {
            if exists == Some(false) {
                return Err(ObjectStoreError::conflict(format!(
                    "Bucket `{collection}` already exists"
                )));
            }
            return Ok(CollectionResult::new(CollectionStatus::Exists));
        }

        let versioned = config.and_then(|c| c.versioned).unwrap_or(false);
        let request = InsertBucketRequest {
            name: collection.to_string(),
            param: InsertBucketParam {
                project: self.project_id.clone(),
                ..Default::default()
            },
            bucket: BucketCreationConfig {
                versioning: versioned.then_some(Versioning { enabled: true }),
                ..Default::default()
            },
        };
        self.wait_for_a_slot_in_admission_control(Duration::from_secs(10 * 60))?;
        block_on(self.client.insert_bucket(&request))
            .map_err(|e| ObjectStoreError::internal(format!("insert_bucket failed: {e}")))?;
        Ok(CollectionResult::new(CollectionStatus::Created))
    }

    fn drop_collection(&self, collection: &str, exists: Option<bool>) -> Result<CollectionResult, ObjectStoreError> {
        if !self.has_collection(collection)? {
            if exists == Some(true) {
                return Err(ObjectStoreError::not_found(format!(
                    "Bucket `{collection}` does not exist"
                )));
            }
            return Ok(CollectionResult::new(CollectionStatus::NotExists));
        }

        // Buckets only delete once every generation is gone.
        loop {
            let response = block_on(self.client.list_objects(&ListObjectsRequest {
                bucket: collection.to_string(),
                versions: Some(true),
                max_results: Some(1000),
                ..Default::default()
            }))
            .map_err(|e| ObjectStoreError::internal(format!("list_objects failed: {e}")))?;
            let items = response.items.unwrap_or_default();
            if items.is_empty() {
                break;
            }
            for object in items {
                block_on(self.client.delete_object(&DeleteObjectRequest {
                    bucket: collection.to_string(),
                    object: object.name.clone(),
                    generation: Some(object.generation),
                    ..Default::default()
                }))
                .map_err(|e| ObjectStoreError::internal(format!("delete_object failed: {e}")))?;
            }
        }

        block_on(self.client.delete_bucket(&DeleteBucketRequest {
            bucket: collection.to_string(),
            ..Default::default()
        }))
        .map_err(|e| ObjectStoreError::internal(format!("delete_bucket failed: {e}")))?;
        Ok(CollectionResult::new(CollectionStatus::Dropped))
    }

    fn list_collections(&self) -> Result<Vec<String>, ObjectStoreError> {
        let mut buckets = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let response = block_on(self.client.list_buckets(&ListBucketsRequest {
                project: self.project_id.clone(),
                page_token: page_token.clone(),
                max_results: Some(1000),
                ..Default::default()
            }))
            .map_err(|e| ObjectStoreError::internal(format!("list_buckets failed: {e}")))?;
            buckets.extend(response.items.into_iter().map(|b| b.name));
            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(buckets)
    }

    fn has_collection(&self, collection: &str) -> Result<bool, ObjectStoreError> {
        match block_on(self.client.get_bucket(&GetBucketRequest {
            bucket: collection.to_string(),
            ..Default::default()
        })) {
            Ok(_) => Ok(true),
            Err(e) => {
                let message = e.to_string();
                if message.contains("404") || message.to_ascii_lowercase().contains("not found") {
                    Ok(false)
                } else {
                    Err(ObjectStoreError::internal(format!("get_bucket failed: {message}")))
                }
            }
        }
    }

    fn put(&self, mut args: PutArgs) -> Result<ObjectItem, ObjectStoreError> {
        if !args.match_condition.is_empty() {
            let current = self.get_gcp_object(&args.collection, &args.id, None)?;
            args.match_condition.evaluate(Self::match_target(current.as_ref()).as_ref())?;
        }

        let bytes = Self::payload_bytes(&mut args.payload)?;
        let upload_object = GcpObject {
            name: Self::object_name(&args.id).to_string(),
            content_type: args.properties.as_ref().and_then(|p| p.content_type.clone()),
            cache_control: args.properties.as_ref().and_then(|p| p.cache_control.clone()),
            content_disposition: args.properties.as_ref().and_then(|p| p.content_disposition.clone()),
            content_encoding: args.properties.as_ref().and_then(|p| p.content_encoding.clone()),
            content_language: args.properties.as_ref().and_then(|p| p.content_language.clone()),
            storage_class: args
                .properties
                .as_ref()
                .and_then(|p| p.storage_class)
                .map(|sc| to_gcs_storage_class(sc).to_string())
                .unwrap_or_default(),
            metadata: args.metadata.clone(),
            ..Default::default()
        };

        self.wait_for_a_slot_in_admission_control(Duration::from_secs(10 * 60))?;
        let uploaded = block_on(self.client.upload_object(
            &UploadObjectRequest {
                bucket: args.collection.clone(),
                ..Default::default()
            },
            bytes.clone(),
            &UploadType::Multipart(Box::new(upload_object)),
        ))
        .map_err(|e| ObjectStoreError::internal(format!("upload_object failed: {e}")))?;

        let mut item = self.object_item(&args.collection, &args.id, &uploaded);
        if args.returning == Some(Returning::New) {
            item.value = Some(bytes);
        }
        Ok(item)
    }

    fn get(&self, mut args: GetArgs) -> Result<ObjectItem, ObjectStoreError> {
        let object = self
            .get_gcp_object(&args.collection, &args.id, args.version.as_deref())?
            .ok_or_else(|| ObjectStoreError::not_found(format!("Object `{}` not found", args.id)))?;
        args.match_condition
            .evaluate(Self::match_target(Some(&object)).as_ref())?;

        let request = GetObjectRequest {
            bucket: args.collection.clone(),
            object: Self::object_name(&args.id).to_string(),
            generation: Self::generation_of(args.version.as_deref())?,
            ..Default::default()
        };
        // Inclusive byte range, matching the store contract.
        let range = Range(args.start, args.end);
        let data = block_on(self.client.download_object(&request, &range))
            .map_err(|e| ObjectStoreError::internal(format!("download_object failed: {e}")))?;

        let mut item = self.object_item(&args.collection, &args.id, &object);
        match args.destination.as_mut() {
            Some(GetDestination::File(path)) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| ObjectStoreError::internal(format!("Cannot create download folder: {e}")))?;
                }
                std::fs::write(path, &data)
                    .map_err(|e| ObjectStoreError::internal(format!("Cannot write download file: {e}")))?;
            }
            Some(GetDestination::Writer(writer)) => {
                writer
                    .write_all(&data)
                    .map_err(|e| ObjectStoreError::internal(format!("Cannot write download stream: {e}")))?;
            }
            None => item.value = Some(data),
        }
        Ok(item)
    }

    fn get_properties(
        &self,
        id: &str,
        version: Option<&str>,
        match_condition: &MatchCondition,
        collection: &str,
    ) -> Result<ObjectItem, ObjectStoreError> {
        let object = self
            .get_gcp_object(collection, id, version)?
            .ok_or_else(|| ObjectStoreError::not_found(format!("Object `{id}` not found")))?;
        match_condition.evaluate(Self::match_target(Some(&object)).as_ref())?;
        Ok(self.object_item(collection, id, &object))
    }

    fn get_versions(&self, id: &str, collection: &str) -> Result<ObjectItem, ObjectStoreError> {
        let name = Self::object_name(id).to_string();
        let response = block_on(self.client.list_objects(&ListObjectsRequest {
            bucket: collection.to_string(),
            prefix: Some(name.clone()),
            versions: Some(true),
            ..Default::default()
        }))
        .map_err(|e| ObjectStoreError::internal(format!("list_objects failed: {e}")))?;

        let mut generations: Vec<GcpObject> = response
            .items
            .unwrap_or_default()
            .into_iter()
            .filter(|o| o.name == name)
            .collect();
        if generations.is_empty() {
            return Err(ObjectStoreError::not_found(format!("Object `{id}` not found")));
        }
        generations.sort_by_key(|o| o.generation);
        let last_index = generations.len() - 1;
        let versions = generations
            .into_iter()
            .enumerate()
            .map(|(index, object)| ObjectVersion {
                version: Some(object.generation.to_string()),
                properties: Some(object_properties(&object)),
                metadata: object.metadata.clone(),
                latest: Some(index == last_index),
            })
            .collect();
        Ok(ObjectItem {
            key: ObjectKey::new(id),
            versions: Some(versions),
            url: Some(format!("https://storage.googleapis.com/{collection}/{name}")),
            ..Default::default()
        })
    }

    fn update(&self, args: UpdateArgs) -> Result<ObjectItem, ObjectStoreError> {
        let object = self
            .get_gcp_object(&args.collection, &args.id, args.version.as_deref())?
            .ok_or_else(|| ObjectStoreError::not_found(format!("Object `{}` not found", args.id)))?;
        args.match_condition
            .evaluate(Self::match_target(Some(&object)).as_ref())?;

        let patch = google_cloud_storage::http::objects::patch::PatchObjectRequest {
            bucket: args.collection.clone(),
            object: Self::object_name(&args.id).to_string(),
            generation: Self::generation_of(args.version.as_deref())?,
            metadata: Some(GcpObject {
                metadata: args.metadata.clone().or(object.metadata.clone()),
                content_type: args
                    .properties
                    .as_ref()
                    .and_then(|p| p.content_type.clone())
                    .or(object.content_type.clone()),
                cache_control: args
                    .properties
                    .as_ref()
                    .and_then(|p| p.cache_control.clone())
                    .or(object.cache_control.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.wait_for_a_slot_in_admission_control(Duration::from_secs(10 * 60))?;
        let updated = block_on(self.client.patch_object(&patch))
            .map_err(|e| ObjectStoreError::internal(format!("patch_object failed: {e}")))?;
        Ok(self.object_item(&args.collection, &args.id, &updated))
    }

    fn delete(
        &self,
        id: &str,
        version: Option<&str>,
        match_condition: &MatchCondition,
        collection: &str,
    ) -> Result<(), ObjectStoreError> {
        let current = self.get_gcp_object(collection, id, version.filter(|v| *v != "*"))?;
        if !match_condition.is_empty() {
            match_condition.evaluate(Self::match_target(current.as_ref()).as_ref())?;
        }
        if current.is_none() {
            return Err(ObjectStoreError::not_found(format!("Object `{id}` not found")));
        }

        let name = Self::object_name(id).to_string();
        match version {
            Some("*") => {
                let versions = self.get_versions(id, collection)?;
                for object_version in versions.versions.unwrap_or_default() {
                    if let Some(generation) = object_version.version {
                        block_on(self.client.delete_object(&DeleteObjectRequest {
                            bucket: collection.to_string(),
                            object: name.clone(),
                            generation: generation.parse::<i64>().ok(),
                            ..Default::default()
                        }))
                        .map_err(|e| ObjectStoreError::internal(format!("delete_object failed: {e}")))?;
                    }
                }
            }
            _ => {
                block_on(self.client.delete_object(&DeleteObjectRequest {
                    bucket: collection.to_string(),
                    object: name,
                    generation: Self::generation_of(version)?,
                    ..Default::default()
                }))
                .map_err(|e| ObjectStoreError::internal(format!("delete_object failed: {e}")))?;
            }
        }
        Ok(())
    }

    fn copy(&self, args: CopyArgs) -> Result<ObjectItem, ObjectStoreError> {
        if !args.match_condition.is_empty() {
            let destination = self.get_gcp_object(&args.collection, &args.id, None)?;
            args.match_condition
                .evaluate(Self::match_target(destination.as_ref()).as_ref())?;
        }

        let source_bucket = args.source_collection.clone().unwrap_or_else(|| args.collection.clone());
        let source = self
            .get_gcp_object(&source_bucket, &args.source_id, args.source_version.as_deref())?
            .ok_or_else(|| ObjectStoreError::not_found(format!("Source object `{}` not found", args.source_id)))?;

        let request = RewriteObjectRequest {
            source_bucket,
            source_object: source.name.clone(),
            destination_bucket: args.collection.clone(),
            destination_object: Self::object_name(&args.id).to_string(),
            source_generation: Self::generation_of(args.source_version.as_deref())?,
            ..Default::default()
        };
        self.wait_for_a_slot_in_admission_control(Duration::from_secs(10 * 60))?;
        block_on(self.client.rewrite_object(&request))
            .map_err(|e| ObjectStoreError::internal(format!("rewrite_object failed: {e}")))?;

        if args.metadata.is_some() || args.properties.is_some() {
            return self.update(UpdateArgs {
                id: args.id.clone(),
                version: None,
                metadata: args.metadata.clone(),
                properties: args.properties.clone(),
                match_condition: MatchCondition::default(),
                collection: args.collection.clone(),
            });
        }
        let object = self
            .get_gcp_object(&args.collection, &args.id, None)?
            .ok_or_else(|| ObjectStoreError::not_found(format!("Object `{}` not found", args.id)))?;
        Ok(self.object_item(&args.collection, &args.id, &object))
    }

    fn generate(
        &self,
        id: &str,
        version: Option<&str>,
        method: SignedUrlMethod,
        expiry: Duration,
        collection: &str,
    ) -> Result<ObjectItem, ObjectStoreError> {
        let options = SignedURLOptions {
            method: match method {
                SignedUrlMethod::Get => SignedURLMethod::GET,
                SignedUrlMethod::Put => SignedURLMethod::PUT,
                SignedUrlMethod::Delete => SignedURLMethod::DELETE,
            },
            expires: expiry,
            ..Default::default()
        };
        let url = block_on(self.client.signed_url(
            collection,
            Self::object_name(id),
            None,
            None,
            options,
        ))
        .map_err(|e| ObjectStoreError::internal(format!("signed_url failed: {e}")))?;
        Ok(ObjectItem {
            key: ObjectKey {
                id: id.to_string(),
                version: version.map(str::to_string),
            },
            url: Some(url),
            ..Default::default()
        })
    }

    fn query(&self, args: &QueryArgs, collection: &str) -> Result<ObjectList, ObjectStoreError> {
        let limit = args.effective_limit();
        let lower_bound = [args.continuation.as_deref(), args.start_after.as_deref()]
            .into_iter()
            .flatten()
            .max();

        let response = block_on(self.client.list_objects(&ListObjectsRequest {
            bucket: collection.to_string(),
            prefix: args.prefix.clone(),
            delimiter: args.delimiter.clone(),
            start_offset: lower_bound.map(str::to_string),
            end_offset: args.end_before.clone(),
            max_results: limit.map(|l| l as i32),
            ..Default::default()
        }))
        .map_err(|e| ObjectStoreError::internal(format!("list_objects failed: {e}")))?;

        let mut items = Vec::new();
        let mut continuation = None;
        for object in response.items.unwrap_or_default() {
            // start_offset is inclusive while continuation is exclusive.
            if let Some(bound) = lower_bound {
                if object.name.as_str() <= bound {
                    continue;
                }
            }
            continuation = Some(object.name.clone());
            items.push(ObjectItem {
                key: ObjectKey::new(object.name.clone()),
                properties: Some(object_properties(&object)),
                url: Some(format!("https://storage.googleapis.com/{collection}/{}", object.name)),
                ..Default::default()
            });
        }
        let mut prefixes = response.prefixes.unwrap_or_default();
        prefixes.sort();

        let mut continuation = if args.paging { continuation } else { None };
        if let Some(limit) = limit {
            if (items.len() + prefixes.len()) < limit as usize {
                continuation = None;
            }
        }
        Ok(ObjectList {
            items,
            continuation,
            prefixes,
        })
    }

    fn count(&self, args: &QueryArgs, collection: &str) -> Result<u64, ObjectStoreError> {
        let list = self.query(args, collection)?;
        Ok((list.items.len() + list.prefixes.len()) as u64)
    }

    fn batch(&self, deletes: Vec<BatchDelete>, collection: &str) -> Result<(), ObjectStoreError> {
        for delete in deletes {
            self.delete(&delete.id, delete.version.as_deref(), &delete.match_condition, collection)?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), ObjectStoreError> {
        Ok(())
    }
}
