use std::io::{Read, Write};
use std::time::Duration;

use azure_core::headers::{HeaderName, HeaderValue, Headers};
use azure_storage::StorageCredentials;
use azure_storage::shared_access_signature::service_sas::BlobSasPermissions;
use azure_storage_blobs::container::operations::BlobItem;
use azure_storage_blobs::prelude::*;
use futures::StreamExt;

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

// Metadata headers must carry this prefix to survive the SDK round-trip.
const AZURE_STORAGE_METADATA_PREFIX: &str = "x-ms-meta-";

/// Object store on Azure Blob Storage. Collections map to containers in
/// one storage account; object versions require versioning enabled on the
/// account.
pub struct AzureBlobStorage {
    account_name: String,
    access_key: String,
    folder: Option<String>,
}

impl AzureBlobStorage {
    pub fn new(account_name: impl Into<String>, access_key: impl Into<String>) -> AzureBlobStorage {
        AzureBlobStorage {
            account_name: account_name.into(),
            access_key: access_key.into(),
            folder: None,
        }
    }

    pub fn set_folder(&mut self, folder: impl Into<String>) {
        self.folder = Some(folder.into());
    }

    fn client(&self) -> ClientBuilder {
        let credentials = StorageCredentials::access_key(&self.account_name, self.access_key.to_string());
        ClientBuilder::new(&self.account_name, credentials)
    }

    fn blob_client(&self, collection: &str, id: &str) -> BlobClient {
        self.client()
            .container_client(collection)
            .blob_client(id.trim_start_matches('/'))
    }

    fn metadata_headers(metadata: &ObjectMetadata) -> Headers {
        let mut headers = Headers::new();
        for (key, value) in metadata {
            headers.insert(
                HeaderName::from(format!("{AZURE_STORAGE_METADATA_PREFIX}{key}")),
                HeaderValue::from(value.to_string()),
            );
        }
        headers
    }

    fn blob_item(&self, collection: &str, id: &str, version: Option<&str>) -> Result<ObjectItem, ObjectStoreError> {
        let blob_client = self.blob_client(collection, id);
        let mut request = blob_client.get_properties();
        if let Some(version) = version {
            request = request.version_id(version.to_string());
        }
        let response = block_on(request.into_future()).map_err(|e| map_azure_error("get_properties", id, e))?;
        let blob = response.blob;
        let properties = ObjectProperties {
            cache_control: blob.properties.cache_control.clone(),
            content_disposition: blob.properties.content_disposition.clone(),
            content_encoding: blob.properties.content_encoding.clone(),
            content_language: blob.properties.content_language.clone(),
            content_length: Some(blob.properties.content_length),
            content_md5: blob.properties.content_md5.as_ref().map(|md5| format!("{md5:?}")),
            content_type: Some(blob.properties.content_type.clone()),
            last_modified: Some(blob.properties.last_modified.unix_timestamp() as f64),
            etag: Some(blob.properties.etag.to_string()),
            storage_class: blob
                .properties
                .access_tier
                .as_ref()
                .and_then(|tier| from_access_tier(&format!("{tier:?}"))),
            ..Default::default()
        };
        Ok(ObjectItem {
            key: ObjectKey {
                id: id.to_string(),
                version: blob.version_id.clone().or(version.map(str::to_string)),
            },
            value: None,
            metadata: blob.metadata.clone().filter(|m| !m.is_empty()),
            properties: Some(properties),
            versions: None,
            url: blob_client.url().ok().map(|u| u.to_string()),
        })
    }

    fn match_target(&self, collection: &str, id: &str, version: Option<&str>) -> Result<Option<MatchTarget>, ObjectStoreError> {
        match self.blob_item(collection, id, version) {
            Ok(item) => Ok(Some(MatchTarget {
                etag: item.properties.as_ref().and_then(|p| p.etag.clone()),
                last_modified: item.properties.as_ref().and_then(|p| p.last_modified),
                version: item.key.version,
            })),
            Err(ObjectStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
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

    fn read_blob(&self, collection: &str, id: &str, version: Option<&str>) -> Result<Vec<u8>, ObjectStoreError> {
        let blob_client = self.blob_client(collection, id);
        let mut builder = blob_client.get();
        if let Some(version) = version {
            builder = builder.version_id(version.to_string());
        }
        let mut stream = builder.into_stream();
        let mut content = Vec::new();
        while let Some(chunk) = block_on(stream.next()) {
            let mut body = chunk.map_err(|e| map_azure_error("get", id, e))?.data;
            while let Some(bytes) = block_on(body.next()) {
                let bytes = bytes.map_err(|e| ObjectStoreError::internal(format!("Cannot read blob body: {e}")))?;
                content.extend(&bytes);
            }
        }
        Ok(content)
    }
}

fn map_azure_error(operation: &str, id: &str, e: azure_core::Error) -> ObjectStoreError {
    let message = e.to_string();
    if message.contains("404") || message.to_ascii_lowercase().contains("notfound") {
        ObjectStoreError::not_found(format!("Object `{id}` not found"))
    } else {
        ObjectStoreError::internal(format!("{operation} failed: {message}"))
    }
}

fn to_access_tier(storage_class: StorageClass) -> AccessTier {
    match storage_class {
        StorageClass::Hot => AccessTier::Hot,
        StorageClass::Cool => AccessTier::Cool,
        StorageClass::Cold => AccessTier::Cold,
        StorageClass::Archive => AccessTier::Archive,
    }
}

fn from_access_tier(tier: &str) -> Option<StorageClass> {
    match tier.to_ascii_lowercase().as_str() {
        "hot" => Some(StorageClass::Hot),
        "cool" => Some(StorageClass::Cool),
        "cold" => Some(StorageClass::Cold),
        "archive" => Some(StorageClass::Archive),
        _ => None,
    }
}

impl ObjectStoreProvider for AzureBlobStorage {
    fn kind(&self) -> Kind {
        Kind::AzureBlobStorage
    }

    fn default_collection(&self) -> Option<&str> {
        self.folder.as_deref()
    }

    fn create_collection(
        &self,
        collection: &str,
        _config: Option<&ObjectCollectionConfig>,
        exists: Option<bool>,
    ) -> Result<CollectionResult, ObjectStoreError> {
        let container_client = self.client().container_client(collection);
        let already_exists = block_on(container_client.exists())
            .map_err(|e| ObjectStoreError::internal(format!("exists failed: {e}")))?;
        if already_exists {
            if exists == Some(false) {
                return Err(ObjectStoreError::conflict(format!(
                    "Container `{collection}` already exists"
                )));
            }
            return Ok(CollectionResult::new(CollectionStatus::Exists));
        }
        // Versioning is an account-level toggle on Azure; the collection
        // config cannot change it here.
        block_on(
            container_client
                .create()
                .public_access(azure_storage_blobs::container::PublicAccess::None)
                .into_future(),
        )
        .map_err(|e| ObjectStoreError::internal(format!("create container failed: {e}")))?;
        Ok(CollectionResult::new(CollectionStatus::Created))
    }

    fn drop_collection(&self, collection: &str, exists: Option<bool>) -> Result<CollectionResult, ObjectStoreError> {
        let container_client = self.client().container_client(collection);
        let present = block_on(container_client.exists())
            .map_err(|e| ObjectStoreError::internal(format!("exists failed: {e}")))?;
        if !present {
            if exists == Some(true) {
                return Err(ObjectStoreError::not_found(format!(
                    "Container `{collection}` does not exist"
                )));
            }
            return Ok(CollectionResult::new(CollectionStatus::NotExists));
        }
        block_on(container_client.delete().into_future())
            .map_err(|e| ObjectStoreError::internal(format!("delete container failed: {e}")))?;
        Ok(CollectionResult::new(CollectionStatus::Dropped))
    }

    fn list_collections(&self) -> Result<Vec<String>, ObjectStoreError> {
        let service_client = self.client().blob_service_client();
        let mut stream = service_client.list_containers().into_stream();
        let mut collections = Vec::new();
        while let Some(page) = block_on(stream.next()) {
            let page = page.map_err(|e| ObjectStoreError::internal(format!("list containers failed: {e}")))?;
            collections.extend(page.containers.into_iter().map(|c| c.name));
        }
        Ok(collections)
    }

    fn has_collection(&self, collection: &str) -> Result<bool, ObjectStoreError> {
        let container_client = self.client().container_client(collection);
        block_on(container_client.exists()).map_err(|e| ObjectStoreError::internal(format!("exists failed: {e}")))
    }

    fn put(&self, mut args: PutArgs) -> Result<ObjectItem, ObjectStoreError> {
        if !args.match_condition.is_empty() {
            let target = self.match_target(&args.collection, &args.id, None)?;
            args.match_condition.evaluate(target.as_ref())?;
        }

        let bytes = Self::payload_bytes(&mut args.payload)?;
        let blob_client = self.blob_client(&args.collection, &args.id);
        let mut request = blob_client.put_block_blob(bytes.clone());
        if let Some(metadata) = &args.metadata {
            request = request.metadata(&Self::metadata_headers(metadata));
        }
        if let Some(properties) = &args.properties {
            if let Some(content_type) = &properties.content_type {
                request = request.content_type(content_type.to_string());
            }
            if let Some(access_tier) = properties.storage_class {
                request = request.access_tier(to_access_tier(access_tier));
            }
        }
        block_on(request.into_future()).map_err(|e| map_azure_error("put_block_blob", &args.id, e))?;

        let mut item = self.blob_item(&args.collection, &args.id, None)?;
        if args.returning == Some(Returning::New) {
            item.value = Some(bytes);
        }
        Ok(item)
    }

    fn get(&self, mut args: GetArgs) -> Result<ObjectItem, ObjectStoreError> {
        if !args.match_condition.is_empty() {
            let target = self.match_target(&args.collection, &args.id, args.version.as_deref())?;
            if target.is_none() {
                return Err(ObjectStoreError::not_found(format!("Object `{}` not found", args.id)));
            }
            args.match_condition.evaluate(target.as_ref())?;
        }

        let content = self.read_blob(&args.collection, &args.id, args.version.as_deref())?;
        // Inclusive range, served from the fetched bytes.
        let data = match (args.start, args.end) {
            (None, None) => content,
            (start, end) => {
                let start = start.unwrap_or(0) as usize;
                let end = end.map(|e| (e as usize) + 1).unwrap_or(content.len()).min(content.len());
                if start >= content.len() {
                    Vec::new()
                } else {
                    content[start..end].to_vec()
                }
            }
        };

        let mut item = self.blob_item(&args.collection, &args.id, args.version.as_deref())?;
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
        let item = self.blob_item(collection, id, version)?;
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
        let container_client = self.client().container_client(collection);
        let blob_name = id.trim_start_matches('/').to_string();
        let mut stream = container_client
            .list_blobs()
            .prefix(blob_name.clone())
            .include_versions(true)
            .into_stream();

        let mut versions: Vec<ObjectVersion> = Vec::new();
        while let Some(page) = block_on(stream.next()) {
            let page = page.map_err(|e| ObjectStoreError::internal(format!("list blobs failed: {e}")))?;
            for item in page.blobs.items {
                if let BlobItem::Blob(blob) = item {
                    if blob.name != blob_name {
                        continue;
                    }
                    versions.push(ObjectVersion {
                        version: blob.version_id.clone(),
                        properties: Some(ObjectProperties {
                            etag: Some(blob.properties.etag.to_string()),
                            last_modified: Some(blob.properties.last_modified.unix_timestamp() as f64),
                            content_length: Some(blob.properties.content_length),
                            content_type: Some(blob.properties.content_type.clone()),
                            ..Default::default()
                        }),
                        metadata: blob.metadata.clone(),
                        latest: Some(blob.is_current_version.unwrap_or(false)),
                    });
                }
            }
        }
        if versions.is_empty() {
            return Err(ObjectStoreError::not_found(format!("Object `{id}` not found")));
        }
        versions.sort_by(|a, b| {
            let a_ts = a.properties.as_ref().and_then(|p| p.last_modified).unwrap_or_default();
            let b_ts = b.properties.as_ref().and_then(|p| p.last_modified).unwrap_or_default();
            a_ts.partial_cmp(&b_ts).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(ObjectItem {
            key: ObjectKey::new(id),
            versions: Some(versions),
            url: self.blob_client(collection, id).url().ok().map(|u| u.to_string()),
            ..Default::default()
        })
    }

    fn update(&self, args: UpdateArgs) -> Result<ObjectItem, ObjectStoreError> {
        let current = self.blob_item(&args.collection, &args.id, args.version.as_deref())?;
        if !args.match_condition.is_empty() {
            let target = MatchTarget {
                etag: current.properties.as_ref().and_then(|p| p.etag.clone()),
                last_modified: current.properties.as_ref().and_then(|p| p.last_modified),
                version: current.key.version.clone(),
            };
            args.match_condition.evaluate(Some(&target))?;
        }

        let blob_client = self.blob_client(&args.collection, &args.id);
        if let Some(metadata) = &args.metadata {
            let request = blob_client.set_metadata().metadata(&Self::metadata_headers(metadata));
            block_on(request.into_future()).map_err(|e| map_azure_error("set_metadata", &args.id, e))?;
        }
        if let Some(properties) = &args.properties {
            // Tier changes ride a separate call; the caller never sees the
            // difference.
            if let Some(storage_class) = properties.storage_class {
                block_on(blob_client.set_blob_tier(to_access_tier(storage_class)).into_future())
                    .map_err(|e| map_azure_error("set_blob_tier", &args.id, e))?;
            }
        }
        self.blob_item(&args.collection, &args.id, None)
    }

    fn delete(
        &self,
        id: &str,
        version: Option<&str>,
        match_condition: &MatchCondition,
        collection: &str,
    ) -> Result<(), ObjectStoreError> {
        let target = self.match_target(collection, id, version.filter(|v| *v != "*"))?;
        if !match_condition.is_empty() {
            match_condition.evaluate(target.as_ref())?;
        }
        if target.is_none() {
            return Err(ObjectStoreError::not_found(format!("Object `{id}` not found")));
        }

        let blob_client = self.blob_client(collection, id);
        match version {
            Some("*") => {
                let versions = self.get_versions(id, collection)?;
                for object_version in versions.versions.unwrap_or_default() {
                    if let Some(version_id) = object_version.version {
                        let _ = block_on(blob_client.delete().version_id(version_id).into_future());
                    }
                }
                // Remove the current blob if a non-versioned copy remains.
                let _ = block_on(blob_client.delete().into_future());
            }
            Some(version) => {
                block_on(blob_client.delete().version_id(version.to_string()).into_future())
                    .map_err(|e| map_azure_error("delete", id, e))?;
            }
            None => {
                block_on(blob_client.delete().into_future()).map_err(|e| map_azure_error("delete", id, e))?;
            }
        }
        Ok(())
    }

    fn copy(&self, args: CopyArgs) -> Result<ObjectItem, ObjectStoreError> {
        if !args.match_condition.is_empty() {
            let target = self.match_target(&args.collection, &args.id, None)?;
            args.match_condition.evaluate(target.as_ref())?;
        }

        let source_collection = args.source_collection.as_deref().unwrap_or(&args.collection);
        let source_client = self.blob_client(source_collection, &args.source_id);
        let source_target = self.match_target(source_collection, &args.source_id, args.source_version.as_deref())?;
        if source_target.is_none() {
            return Err(ObjectStoreError::not_found(format!(
                "Source object `{}` not found",
                args.source_id
            )));
        }
        let source_url = source_client
            .url()
            .map_err(|e| ObjectStoreError::internal(format!("Cannot build source url: {e}")))?;

        let destination_client = self.blob_client(&args.collection, &args.id);
        block_on(destination_client.copy(source_url).into_future())
            .map_err(|e| map_azure_error("copy", &args.id, e))?;

        if args.metadata.is_some() || args.properties.is_some() {
            self.update(UpdateArgs {
                id: args.id.clone(),
                version: None,
                metadata: args.metadata.clone(),
                properties: args.properties.clone(),
                match_condition: MatchCondition::default(),
                collection: args.collection.clone(),
            })?;
        }
        self.blob_item(&args.collection, &args.id, None)
    }

    fn generate(
        &self,
        id: &str,
        version: Option<&str>,
        method: SignedUrlMethod,
        expiry: Duration,
        collection: &str,
    ) -> Result<ObjectItem, ObjectStoreError> {
        let blob_client = self.blob_client(collection, id);
        let permissions = match method {
            SignedUrlMethod::Get => BlobSasPermissions {
                read: true,
                ..Default::default()
            },
            SignedUrlMethod::Put => BlobSasPermissions {
                create: true,
                write: true,
                ..Default::default()
            },
            SignedUrlMethod::Delete => BlobSasPermissions {
                delete: true,
                ..Default::default()
            },
        };
        let expiry_time = time::OffsetDateTime::now_utc() + time::Duration::milliseconds(expiry.as_millis() as i64);
        let sas = block_on(blob_client.shared_access_signature(permissions, expiry_time))
            .map_err(|e| ObjectStoreError::internal(format!("Cannot build shared access signature: {e}")))?;
        let url = blob_client
            .generate_signed_blob_url(&sas)
            .map_err(|e| ObjectStoreError::internal(format!("Cannot build signed url: {e}")))?;
        Ok(ObjectItem {
            key: ObjectKey {
                id: id.to_string(),
                version: version.map(str::to_string),
            },
            url: Some(url.to_string()),
            ..Default::default()
        })
    }

    fn query(&self, args: &QueryArgs, collection: &str) -> Result<ObjectList, ObjectStoreError> {
        let container_client = self.client().container_client(collection);
        let mut builder = container_client.list_blobs();
        if let Some(prefix) = &args.prefix {
            builder = builder.prefix(prefix.to_string());
        }
        if let Some(delimiter) = &args.delimiter {
            builder = builder.delimiter(delimiter.to_string());
        }

        let lower_bound = [args.continuation.as_deref(), args.start_after.as_deref()]
            .into_iter()
            .flatten()
            .max();
        let limit = args.effective_limit();

        let mut stream = builder.into_stream();
        let mut items = Vec::new();
        let mut prefixes: Vec<String> = Vec::new();
        let mut continuation = None;
        let mut consumed: u64 = 0;

        'pages: while let Some(page) = block_on(stream.next()) {
            let page = page.map_err(|e| ObjectStoreError::internal(format!("list blobs failed: {e}")))?;
            for item in page.blobs.items {
                match item {
                    BlobItem::Blob(blob) => {
                        if let Some(bound) = lower_bound {
                            if blob.name.as_str() <= bound {
                                continue;
                            }
                        }
                        if let Some(end_before) = &args.end_before {
                            if blob.name.as_str() >= end_before.as_str() {
                                continue;
                            }
                        }
                        if let Some(limit) = limit {
                            if consumed >= limit {
                                break 'pages;
                            }
                        }
                        consumed += 1;
                        continuation = Some(blob.name.clone());
                        let url = self.blob_client(collection, &blob.name).url().ok().map(|u| u.to_string());
                        items.push(ObjectItem {
                            key: ObjectKey::new(blob.name.clone()),
                            properties: Some(ObjectProperties {
                                etag: Some(blob.properties.etag.to_string()),
                                last_modified: Some(blob.properties.last_modified.unix_timestamp() as f64),
                                content_length: Some(blob.properties.content_length),
                                ..Default::default()
                            }),
                            url,
                            ..Default::default()
                        });
                    }
                    BlobItem::BlobPrefix(blob_prefix) => {
                        if !prefixes.contains(&blob_prefix.name) {
                            prefixes.push(blob_prefix.name);
                        }
                    }
                }
            }
        }

        if !args.paging {
            continuation = None;
        }
        if let Some(limit) = limit {
            if consumed < limit {
                continuation = None;
            }
        }
        prefixes.sort();
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
