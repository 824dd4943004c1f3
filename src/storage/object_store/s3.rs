use std::io::Read;
use std::io::Write;
use std::time::Duration;

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, BucketVersioningStatus, CompletedMultipartUpload, CompletedPart,
    CreateBucketConfiguration, Delete, MetadataDirective, ObjectIdentifier, VersioningConfiguration,
};

use crate::model::object::{
    CollectionResult, CollectionStatus, ObjectCollectionConfig, ObjectItem, ObjectKey, ObjectList, ObjectMetadata,
    ObjectProperties, ObjectVersion, SignedUrlMethod, StorageClass,
};
use crate::runtime::block_on;
use crate::storage::object_store::errors::ObjectStoreError;
use crate::storage::object_store::helper::QueryArgs;
use crate::storage::object_store::match_condition::{MatchCondition, MatchTarget};
use crate::storage::object_store::{
    BatchDelete, CopyArgs, GetArgs, GetDestination, Kind, ObjectStoreProvider, PutArgs, PutPayload, Returning,
    UpdateArgs,
};

const DEFAULT_MULTIPART_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Object store on Amazon S3.
pub struct S3 {
    client: aws_sdk_s3::Client,
    region: String,
    folder: Option<String>,
}

impl S3 {
    pub fn new(region: impl Into<String>) -> S3 {
        let region = region.into();
        let config = block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.clone()))
                .load(),
        );
        S3 {
            client: aws_sdk_s3::Client::new(&config),
            region,
            folder: None,
        }
    }

    pub fn with_credentials(
        region: impl Into<String>,
        access_key_id: &str,
        secret_access_key: &str,
        session_token: Option<&str>,
    ) -> S3 {
        let region = region.into();
        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            session_token.map(str::to_string),
            None,
            "nimbus-engine",
        );
        let config = block_on(
            aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(region.clone()))
                .credentials_provider(credentials)
                .load(),
        );
        S3 {
            client: aws_sdk_s3::Client::new(&config),
            region,
            folder: None,
        }
    }

    pub fn set_folder(&mut self, folder: impl Into<String>) {
        self.folder = Some(folder.into());
    }

    /// S3 object keys cannot carry the leading `/` the neutral model allows.
    fn object_key(id: &str) -> &str {
        id.trim_start_matches('/')
    }

    fn head_target(&self, bucket: &str, id: &str, version: Option<&str>) -> Result<Option<MatchTarget>, ObjectStoreError> {
        let mut request = self.client.head_object().bucket(bucket).key(Self::object_key(id));
        if let Some(version) = version {
            request = request.version_id(version);
        }
        match block_on(request.send()) {
            Ok(output) => Ok(Some(MatchTarget {
                etag: output.e_tag().map(normalize_etag),
                last_modified: output.last_modified().map(|t| t.as_secs_f64()),
                version: output.version_id().map(str::to_string),
            })),
            Err(err) => {
                if is_not_found(&err.to_string()) || err.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(ObjectStoreError::internal(format_sdk_error("head_object", &err)))
                }
            }
        }
    }

    fn head_item(&self, bucket: &str, id: &str, version: Option<&str>) -> Result<ObjectItem, ObjectStoreError> {
        let mut request = self.client.head_object().bucket(bucket).key(Self::object_key(id));
        if let Some(version) = version {
            request = request.version_id(version);
        }
        let output = block_on(request.send()).map_err(|err| {
            if is_not_found(&err.to_string()) || err.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                ObjectStoreError::not_found(format!("Object `{id}` not found"))
            } else {
                ObjectStoreError::internal(format_sdk_error("head_object", &err))
            }
        })?;
        let metadata: Option<ObjectMetadata> = output.metadata().map(|m| m.clone().into_iter().collect());
        Ok(ObjectItem {
            key: ObjectKey {
                id: id.to_string(),
                version: output.version_id().map(str::to_string),
            },
            value: None,
            metadata: metadata.filter(|m: &ObjectMetadata| !m.is_empty()),
            properties: Some(ObjectProperties {
                cache_control: output.cache_control().map(str::to_string),
                content_disposition: output.content_disposition().map(str::to_string),
                content_encoding: output.content_encoding().map(str::to_string),
                content_language: output.content_language().map(str::to_string),
                content_length: output.content_length().map(|l| l as u64),
                content_type: output.content_type().map(str::to_string),
                last_modified: output.last_modified().map(|t| t.as_secs_f64()),
                etag: output.e_tag().map(normalize_etag),
                storage_class: output
                    .storage_class()
                    .and_then(|sc| from_s3_storage_class(sc.as_str())),
                ..Default::default()
            }),
            versions: None,
            url: Some(self.object_url(bucket, id)),
        })
    }

    fn object_url(&self, bucket: &str, id: &str) -> String {
        format!(
            "https://{bucket}.s3.{region}.amazonaws.com/{key}",
            region = self.region,
            key = Self::object_key(id)
        )
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

    fn multipart_put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        chunk_size: u64,
        properties: Option<&ObjectProperties>,
        metadata: Option<&ObjectMetadata>,
    ) -> Result<(), ObjectStoreError> {
        let mut create = self.client.create_multipart_upload().bucket(bucket).key(key);
        if let Some(properties) = properties {
            if let Some(content_type) = &properties.content_type {
                create = create.content_type(content_type);
            }
        }
        if let Some(metadata) = metadata {
            for (k, v) in metadata {
                create = create.metadata(k, v);
            }
        }
        let upload = block_on(create.send())
            .map_err(|e| ObjectStoreError::internal(format_sdk_error("create_multipart_upload", &e)))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| ObjectStoreError::internal("Multipart upload id missing"))?
            .to_string();

        let mut completed_parts = Vec::new();
        let result: Result<(), ObjectStoreError> = (|| {
            for (index, chunk) in bytes.chunks(chunk_size as usize).enumerate() {
                let part_number = (index + 1) as i32;
                let part = block_on(
                    self.client
                        .upload_part()
                        .bucket(bucket)
                        .key(key)
                        .upload_id(&upload_id)
                        .part_number(part_number)
                        .body(ByteStream::from(chunk.to_vec()))
                        .send(),
                )
                .map_err(|e| ObjectStoreError::internal(format_sdk_error("upload_part", &e)))?;
                completed_parts.push(
                    CompletedPart::builder()
                        .set_e_tag(part.e_tag().map(str::to_string))
                        .part_number(part_number)
                        .build(),
                );
            }
            block_on(
                self.client
                    .complete_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(completed_parts.clone()))
                            .build(),
                    )
                    .send(),
            )
            .map_err(|e| ObjectStoreError::internal(format_sdk_error("complete_multipart_upload", &e)))?;
            Ok(())
        })();

        if result.is_err() {
            // Partial uploads must not linger after a failure.
            let _ = block_on(
                self.client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send(),
            );
        }
        result
    }

    fn list_version_identifiers(&self, bucket: &str, id: &str) -> Result<Vec<ObjectIdentifier>, ObjectStoreError> {
        let key = Self::object_key(id);
        let output = block_on(
            self.client
                .list_object_versions()
                .bucket(bucket)
                .prefix(key)
                .send(),
        )
        .map_err(|e| ObjectStoreError::internal(format_sdk_error("list_object_versions", &e)))?;

        let mut identifiers = Vec::new();
        for version in output.versions() {
            if version.key() == Some(key) {
                let mut builder = ObjectIdentifier::builder().key(key);
                if let Some(version_id) = version.version_id() {
                    builder = builder.version_id(version_id);
                }
                identifiers.push(
                    builder
                        .build()
                        .map_err(|e| ObjectStoreError::internal(e.to_string()))?,
                );
            }
        }
        for marker in output.delete_markers() {
            if marker.key() == Some(key) {
                let mut builder = ObjectIdentifier::builder().key(key);
                if let Some(version_id) = marker.version_id() {
                    builder = builder.version_id(version_id);
                }
                identifiers.push(
                    builder
                        .build()
                        .map_err(|e| ObjectStoreError::internal(e.to_string()))?,
                );
            }
        }
        Ok(identifiers)
    }
}

fn normalize_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

fn is_not_found(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("notfound")
        || lowered.contains("not found")
        || lowered.contains("nosuchkey")
        || lowered.contains("nosuchbucket")
}

fn format_sdk_error<E: std::fmt::Debug, R: std::fmt::Debug>(
    operation: &str,
    err: &aws_sdk_s3::error::SdkError<E, R>,
) -> String {
    format!("{operation} failed: {err:?}")
}

fn to_s3_storage_class(storage_class: StorageClass) -> aws_sdk_s3::types::StorageClass {
    match storage_class {
        StorageClass::Hot => aws_sdk_s3::types::StorageClass::Standard,
        StorageClass::Cool => aws_sdk_s3::types::StorageClass::StandardIa,
        StorageClass::Cold => aws_sdk_s3::types::StorageClass::Glacier,
        StorageClass::Archive => aws_sdk_s3::types::StorageClass::DeepArchive,
    }
}

fn from_s3_storage_class(value: &str) -> Option<StorageClass> {
    match value {
        "STANDARD" => Some(StorageClass::Hot),
        "STANDARD_IA" | "ONEZONE_IA" | "INTELLIGENT_TIERING" => Some(StorageClass::Cool),
        "GLACIER" | "GLACIER_IR" => Some(StorageClass::Cold),
        "DEEP_ARCHIVE" => Some(StorageClass::Archive),
        _ => None,
    }
}

impl ObjectStoreProvider for S3 {
    fn kind(&self) -> Kind {
        Kind::S3
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
        let already_exists = self.has_collection(collection)?;
        if already_exists {
            if exists == Some(false) {
                return Err(ObjectStoreError::conflict(format!(
                    "Bucket `{collection}` already exists"
                )));
            }
            return Ok(CollectionResult::new(CollectionStatus::Exists));
        }

        let mut request = self.client.create_bucket().bucket(collection);
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        block_on(request.send())
            .map_err(|e| ObjectStoreError::internal(format_sdk_error("create_bucket", &e)))?;

        if config.and_then(|c| c.versioned).unwrap_or(false) {
            block_on(
                self.client
                    .put_bucket_versioning()
                    .bucket(collection)
                    .versioning_configuration(
                        VersioningConfiguration::builder()
                            .status(BucketVersioningStatus::Enabled)
                            .build(),
                    )
                    .send(),
            )
            .map_err(|e| ObjectStoreError::internal(format_sdk_error("put_bucket_versioning", &e)))?;
        }
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

        // A bucket only deletes once every version and marker is gone.
        loop {
            let output = block_on(self.client.list_object_versions().bucket(collection).send())
                .map_err(|e| ObjectStoreError::internal(format_sdk_error("list_object_versions", &e)))?;
            let mut identifiers = Vec::new();
            for version in output.versions() {
                if let Some(key) = version.key() {
                    let mut builder = ObjectIdentifier::builder().key(key);
                    if let Some(version_id) = version.version_id() {
                        builder = builder.version_id(version_id);
                    }
                    identifiers.push(builder.build().map_err(|e| ObjectStoreError::internal(e.to_string()))?);
                }
            }
            for marker in output.delete_markers() {
                if let Some(key) = marker.key() {
                    let mut builder = ObjectIdentifier::builder().key(key);
                    if let Some(version_id) = marker.version_id() {
                        builder = builder.version_id(version_id);
                    }
                    identifiers.push(builder.build().map_err(|e| ObjectStoreError::internal(e.to_string()))?);
                }
            }
            if identifiers.is_empty() {
                break;
            }
            block_on(
                self.client
                    .delete_objects()
                    .bucket(collection)
                    .delete(
                        Delete::builder()
                            .set_objects(Some(identifiers))
                            .build()
                            .map_err(|e| ObjectStoreError::internal(e.to_string()))?,
                    )
                    .send(),
            )
            .map_err(|e| ObjectStoreError::internal(format_sdk_error("delete_objects", &e)))?;
        }

        block_on(self.client.delete_bucket().bucket(collection).send())
            .map_err(|e| ObjectStoreError::internal(format_sdk_error("delete_bucket", &e)))?;
        Ok(CollectionResult::new(CollectionStatus::Dropped))
    }

    fn list_collections(&self) -> Result<Vec<String>, ObjectStoreError> {
        let output = block_on(self.client.list_buckets().send())
            .map_err(|e| ObjectStoreError::internal(format_sdk_error("list_buckets", &e)))?;
        Ok(output
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    fn has_collection(&self, collection: &str) -> Result<bool, ObjectStoreError> {
        match block_on(self.client.head_bucket().bucket(collection).send()) {
            Ok(_) => Ok(true),
            Err(err) => {
                if is_not_found(&err.to_string()) {
                    Ok(false)
                } else {
                    Err(ObjectStoreError::internal(format_sdk_error("head_bucket", &err)))
                }
            }
        }
    }

    fn put(&self, mut args: PutArgs) -> Result<ObjectItem, ObjectStoreError> {
        let bucket = args.collection.clone();
        if !args.match_condition.is_empty() {
            let target = self.head_target(&bucket, &args.id, None)?;
            args.match_condition.evaluate(target.as_ref())?;
        }

        let bytes = Self::payload_bytes(&mut args.payload)?;
        let key = Self::object_key(&args.id).to_string();

        let multipart = args.config.as_ref().and_then(|c| c.multipart).unwrap_or(false);
        if multipart {
            let chunk_size = args
                .config
                .as_ref()
                .and_then(|c| c.chunksize)
                .unwrap_or(DEFAULT_MULTIPART_CHUNK_SIZE);
            self.multipart_put(
                &bucket,
                &key,
                &bytes,
                chunk_size,
                args.properties.as_ref(),
                args.metadata.as_ref(),
            )?;
        } else {
            let mut request = self
                .client
                .put_object()
                .bucket(&bucket)
                .key(&key)
                .body(ByteStream::from(bytes.clone()));
            if let Some(properties) = &args.properties {
                if let Some(content_type) = &properties.content_type {
                    request = request.content_type(content_type);
                }
                if let Some(cache_control) = &properties.cache_control {
                    request = request.cache_control(cache_control);
                }
                if let Some(content_disposition) = &properties.content_disposition {
                    request = request.content_disposition(content_disposition);
                }
                if let Some(content_encoding) = &properties.content_encoding {
                    request = request.content_encoding(content_encoding);
                }
                if let Some(content_language) = &properties.content_language {
                    request = request.content_language(content_language);
                }
                if let Some(storage_class) = properties.storage_class {
                    request = request.storage_class(to_s3_storage_class(storage_class));
                }
            }
            if let Some(metadata) = &args.metadata {
                for (k, v) in metadata {
                    request = request.metadata(k, v);
                }
            }
            block_on(request.send())
                .map_err(|e| ObjectStoreError::internal(format_sdk_error("put_object", &e)))?;
        }

        let mut item = self.head_item(&bucket, &args.id, None)?;
        if args.returning == Some(Returning::New) {
            item.value = Some(bytes);
        }
        Ok(item)
    }

    fn get(&self, mut args: GetArgs) -> Result<ObjectItem, ObjectStoreError> {
        let bucket = args.collection.clone();
        if !args.match_condition.is_empty() {
            let target = self.head_target(&bucket, &args.id, args.version.as_deref())?;
            if target.is_none() {
                return Err(ObjectStoreError::not_found(format!("Object `{}` not found", args.id)));
            }
            args.match_condition.evaluate(target.as_ref())?;
        }

        let mut request = self
            .client
            .get_object()
            .bucket(&bucket)
            .key(Self::object_key(&args.id));
        if let Some(version) = &args.version {
            request = request.version_id(version);
        }
        if args.start.is_some() || args.end.is_some() {
            let range = match (args.start, args.end) {
                (Some(start), Some(end)) => format!("bytes={start}-{end}"),
                (Some(start), None) => format!("bytes={start}-"),
                (None, Some(end)) => format!("bytes=0-{end}"),
                (None, None) => unreachable!(),
            };
            request = request.range(range);
        }

        let output = block_on(request.send()).map_err(|err| {
            if is_not_found(&err.to_string()) {
                ObjectStoreError::not_found(format!("Object `{}` not found", args.id))
            } else {
                ObjectStoreError::internal(format_sdk_error("get_object", &err))
            }
        })?;
        let version = output.version_id().map(str::to_string);
        let data = block_on(output.body.collect())
            .map_err(|e| ObjectStoreError::internal(format!("Cannot read object body: {e}")))?
            .into_bytes()
            .to_vec();

        let mut item = self.head_item(&bucket, &args.id, version.as_deref().or(args.version.as_deref()))?;
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
        let item = self.head_item(collection, id, version)?;
        if !match_condition.is_empty() {
            let target = MatchTarget {
                etag: item.properties.as_ref().and_then(|p| p.etag.clone()),
                last_modified: item.properties.as_ref().and_then(|p| p.last_modified),
                version: item.key.version.clone(),
            };
            match_condition.evaluate(Some(&target))?;
        }
        Ok(item)
    }

    fn get_versions(&self, id: &str, collection: &str) -> Result<ObjectItem, ObjectStoreError> {
        let key = Self::object_key(id);
        let output = block_on(
            self.client
                .list_object_versions()
                .bucket(collection)
                .prefix(key)
                .send(),
        )
        .map_err(|e| ObjectStoreError::internal(format_sdk_error("list_object_versions", &e)))?;

        let mut versions: Vec<ObjectVersion> = output
            .versions()
            .iter()
            .filter(|v| v.key() == Some(key))
            .map(|v| ObjectVersion {
                version: v.version_id().map(str::to_string),
                properties: Some(ObjectProperties {
                    etag: v.e_tag().map(normalize_etag),
                    last_modified: v.last_modified().map(|t| t.as_secs_f64()),
                    content_length: v.size().map(|s| s as u64),
                    ..Default::default()
                }),
                metadata: None,
                latest: Some(v.is_latest().unwrap_or(false)),
            })
            .collect();
        if versions.is_empty() {
            return Err(ObjectStoreError::not_found(format!("Object `{id}` not found")));
        }
        // Oldest first.
        versions.sort_by(|a, b| {
            let a_ts = a.properties.as_ref().and_then(|p| p.last_modified).unwrap_or_default();
            let b_ts = b.properties.as_ref().and_then(|p| p.last_modified).unwrap_or_default();
            a_ts.partial_cmp(&b_ts).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(ObjectItem {
            key: ObjectKey::new(id),
            versions: Some(versions),
            url: Some(self.object_url(collection, id)),
            ..Default::default()
        })
    }

    fn update(&self, args: UpdateArgs) -> Result<ObjectItem, ObjectStoreError> {
        let bucket = args.collection.clone();
        let current = self.head_item(&bucket, &args.id, args.version.as_deref())?;
        if !args.match_condition.is_empty() {
            let target = MatchTarget {
                etag: current.properties.as_ref().and_then(|p| p.etag.clone()),
                last_modified: current.properties.as_ref().and_then(|p| p.last_modified),
                version: current.key.version.clone(),
            };
            args.match_condition.evaluate(Some(&target))?;
        }

        // S3 has no in-place metadata update; self-copy with REPLACE does it.
        let key = Self::object_key(&args.id);
        let copy_source = match &args.version {
            Some(version) => format!("{bucket}/{key}?versionId={version}"),
            None => format!("{bucket}/{key}"),
        };
        let merged_properties = match (&current.properties, &args.properties) {
            (Some(base), Some(overlay)) => ObjectProperties::merged(base, overlay),
            (Some(base), None) => base.clone(),
            (None, Some(overlay)) => overlay.clone(),
            (None, None) => ObjectProperties::default(),
        };
        let merged_metadata = args.metadata.clone().or(current.metadata.clone());

        let mut request = self
            .client
            .copy_object()
            .bucket(&bucket)
            .key(key)
            .copy_source(&copy_source)
            .metadata_directive(MetadataDirective::Replace);
        if let Some(content_type) = &merged_properties.content_type {
            request = request.content_type(content_type);
        }
        if let Some(cache_control) = &merged_properties.cache_control {
            request = request.cache_control(cache_control);
        }
        if let Some(content_disposition) = &merged_properties.content_disposition {
            request = request.content_disposition(content_disposition);
        }
        if let Some(content_encoding) = &merged_properties.content_encoding {
            request = request.content_encoding(content_encoding);
        }
        if let Some(content_language) = &merged_properties.content_language {
            request = request.content_language(content_language);
        }
        if let Some(storage_class) = merged_properties.storage_class {
            request = request.storage_class(to_s3_storage_class(storage_class));
        }
        if let Some(metadata) = &merged_metadata {
            for (k, v) in metadata {
                request = request.metadata(k, v);
            }
        }
        block_on(request.send())
            .map_err(|e| ObjectStoreError::internal(format_sdk_error("copy_object", &e)))?;

        self.head_item(&bucket, &args.id, None)
    }

    fn delete(
        &self,
        id: &str,
        version: Option<&str>,
        match_condition: &MatchCondition,
        collection: &str,
    ) -> Result<(), ObjectStoreError> {
        let target = self.head_target(collection, id, version.filter(|v| *v != "*"))?;
        if !match_condition.is_empty() {
            match_condition.evaluate(target.as_ref())?;
        }
        if target.is_none() {
            return Err(ObjectStoreError::not_found(format!("Object `{id}` not found")));
        }

        let key = Self::object_key(id);
        match version {
            Some("*") => {
                let identifiers = self.list_version_identifiers(collection, id)?;
                if !identifiers.is_empty() {
                    block_on(
                        self.client
                            .delete_objects()
                            .bucket(collection)
                            .delete(
                                Delete::builder()
                                    .set_objects(Some(identifiers))
                                    .build()
                                    .map_err(|e| ObjectStoreError::internal(e.to_string()))?,
                            )
                            .send(),
                    )
                    .map_err(|e| ObjectStoreError::internal(format_sdk_error("delete_objects", &e)))?;
                }
            }
            Some(version) => {
                block_on(
                    self.client
                        .delete_object()
                        .bucket(collection)
                        .key(key)
                        .version_id(version)
                        .send(),
                )
                .map_err(|e| ObjectStoreError::internal(format_sdk_error("delete_object", &e)))?;
            }
            None => {
                block_on(self.client.delete_object().bucket(collection).key(key).send())
                    .map_err(|e| ObjectStoreError::internal(format_sdk_error("delete_object", &e)))?;
            }
        }
        Ok(())
    }

    fn copy(&self, args: CopyArgs) -> Result<ObjectItem, ObjectStoreError> {
        let bucket = args.collection.clone();
        let source_bucket = args.source_collection.as_deref().unwrap_or(&bucket);
        let source_key = Self::object_key(&args.source_id);

        if !args.match_condition.is_empty() {
            let target = self.head_target(&bucket, &args.id, None)?;
            args.match_condition.evaluate(target.as_ref())?;
        }

        let copy_source = match &args.source_version {
            Some(version) => format!("{source_bucket}/{source_key}?versionId={version}"),
            None => format!("{source_bucket}/{source_key}"),
        };
        let mut request = self
            .client
            .copy_object()
            .bucket(&bucket)
            .key(Self::object_key(&args.id))
            .copy_source(&copy_source);
        if let Some(metadata) = &args.metadata {
            request = request.metadata_directive(MetadataDirective::Replace);
            for (k, v) in metadata {
                request = request.metadata(k, v);
            }
        }
        block_on(request.send()).map_err(|err| {
            if is_not_found(&err.to_string()) {
                ObjectStoreError::not_found(format!("Source object `{}` not found", args.source_id))
            } else {
                ObjectStoreError::internal(format_sdk_error("copy_object", &err))
            }
        })?;

        self.head_item(&bucket, &args.id, None)
    }

    fn generate(
        &self,
        id: &str,
        version: Option<&str>,
        method: SignedUrlMethod,
        expiry: Duration,
        collection: &str,
    ) -> Result<ObjectItem, ObjectStoreError> {
        let key = Self::object_key(id);
        let presigning = PresigningConfig::expires_in(expiry)
            .map_err(|e| ObjectStoreError::bad_request(format!("Invalid expiry: {e}")))?;

        let url = match method {
            SignedUrlMethod::Get => {
                let mut request = self.client.get_object().bucket(collection).key(key);
                if let Some(version) = version {
                    request = request.version_id(version);
                }
                block_on(request.presigned(presigning))
                    .map_err(|e| ObjectStoreError::internal(format_sdk_error("presign get_object", &e)))?
                    .uri()
                    .to_string()
            }
            SignedUrlMethod::Put => block_on(
                self.client
                    .put_object()
                    .bucket(collection)
                    .key(key)
                    .presigned(presigning),
            )
            .map_err(|e| ObjectStoreError::internal(format_sdk_error("presign put_object", &e)))?
            .uri()
            .to_string(),
            SignedUrlMethod::Delete => block_on(
                self.client
                    .delete_object()
                    .bucket(collection)
                    .key(key)
                    .presigned(presigning),
            )
            .map_err(|e| ObjectStoreError::internal(format_sdk_error("presign delete_object", &e)))?
            .uri()
            .to_string(),
        };

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
        let mut request = self.client.list_objects_v2().bucket(collection);
        if let Some(prefix) = &args.prefix {
            request = request.prefix(prefix);
        }
        if let Some(delimiter) = &args.delimiter {
            request = request.delimiter(delimiter);
        }
        let start_after = [args.continuation.as_deref(), args.start_after.as_deref()]
            .into_iter()
            .flatten()
            .max();
        if let Some(start_after) = start_after {
            request = request.start_after(start_after);
        }
        if let Some(limit) = limit {
            request = request.max_keys(limit as i32);
        }

        let output = block_on(request.send())
            .map_err(|e| ObjectStoreError::internal(format_sdk_error("list_objects_v2", &e)))?;

        let mut items = Vec::new();
        let mut continuation = None;
        for object in output.contents() {
            let Some(key) = object.key() else { continue };
            if let Some(end_before) = &args.end_before {
                if key >= end_before.as_str() {
                    continue;
                }
            }
            continuation = Some(key.to_string());
            items.push(ObjectItem {
                key: ObjectKey::new(key),
                url: Some(self.object_url(collection, key)),
                properties: Some(ObjectProperties {
                    etag: object.e_tag().map(normalize_etag),
                    last_modified: object.last_modified().map(|t| t.as_secs_f64()),
                    content_length: object.size().map(|s| s as u64),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        let mut prefixes: Vec<String> = output
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();
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
        let mut identifiers = Vec::with_capacity(deletes.len());
        for delete in &deletes {
            if !delete.match_condition.is_empty() {
                let target = self.head_target(collection, &delete.id, delete.version.as_deref())?;
                delete.match_condition.evaluate(target.as_ref())?;
            }
            let mut builder = ObjectIdentifier::builder().key(Self::object_key(&delete.id));
            if let Some(version) = &delete.version {
                if version != "*" {
                    builder = builder.version_id(version);
                }
            }
            identifiers.push(builder.build().map_err(|e| ObjectStoreError::internal(e.to_string()))?);
        }
        if identifiers.is_empty() {
            return Ok(());
        }
        block_on(
            self.client
                .delete_objects()
                .bucket(collection)
                .delete(
                    Delete::builder()
                        .set_objects(Some(identifiers))
                        .build()
                        .map_err(|e| ObjectStoreError::internal(e.to_string()))?,
                )
                .send(),
        )
        .map_err(|e| ObjectStoreError::internal(format_sdk_error("delete_objects", &e)))?;
        Ok(())
    }

    fn close(&self) -> Result<(), ObjectStoreError> {
        Ok(())
    }
}
