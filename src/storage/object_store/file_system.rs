use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::model::object::{
    CollectionResult, CollectionStatus, ObjectCollectionConfig, ObjectItem, ObjectKey, ObjectList, ObjectMetadata,
    ObjectProperties, ObjectVersion, SignedUrlMethod,
};
use crate::storage::object_store::errors::ObjectStoreError;
use crate::storage::object_store::helper::QueryArgs;
use crate::storage::object_store::kv::{KvStore, KvTransaction, now_epoch};
use crate::storage::object_store::match_condition::{MatchCondition, MatchTarget};
use crate::storage::object_store::{
    BatchDelete, CopyArgs, GetArgs, GetDestination, Kind, ObjectStoreProvider, PutArgs, PutPayload, Returning,
    UpdateArgs,
};

const DB_FILE_NAME: &str = "__db";
const CONFIG_ID: &str = "config";
const CONFIG_STORE: &str = "config";
const OBJECT_STORE: &str = "object";
const OBJECT_DOC_TYPE: &str = "object";
const VERSION_DOC_TYPE: &str = "version";

#[derive(Serialize, Deserialize, Clone, Debug)]
struct ObjectDocument {
    object_id: String,
    version: Option<String>,
    metadata: Option<ObjectMetadata>,
    properties: ObjectProperties,
    ts: f64,
    doc_type: String,
}

impl ObjectDocument {
    fn match_target(&self, etag: &str) -> MatchTarget {
        MatchTarget {
            etag: Some(etag.to_string()),
            last_modified: self.properties.last_modified,
            version: self.version.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct ConfigDocument {
    versioned: bool,
}

/// Object store over a plain directory tree.
///
/// Object bytes live at `{store_path}/{collection}/{id}`; on a versioned
/// collection each body lives at `{store_path}/{collection}/{version}/{id}`
/// and a symlink at the unversioned path points at the current version.
/// A per-collection SQLite database tracks the head record per object, one
/// record per version, and the collection config. The database row etag is
/// the object etag, and its transaction serializes conditional writes.
/// Bytes are written before the metadata commit; a crash in between leaves
/// an orphan file the metadata never points to.
pub struct FileSystem {
    store_path: PathBuf,
    folder: Option<String>,
    db_file_name: String,
    db_cache: Mutex<HashMap<String, Arc<KvStore>>>,
}

impl FileSystem {
    pub fn new(store_path: impl Into<PathBuf>) -> Result<FileSystem, ObjectStoreError> {
        let store_path = store_path.into();
        fs::create_dir_all(&store_path)
            .map_err(|e| ObjectStoreError::internal(format!("Cannot create store path: {e}")))?;
        Ok(FileSystem {
            store_path,
            folder: None,
            db_file_name: DB_FILE_NAME.to_string(),
            db_cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_folder(
        store_path: impl Into<PathBuf>,
        folder: impl Into<String>,
    ) -> Result<FileSystem, ObjectStoreError> {
        let mut provider = Self::new(store_path)?;
        provider.folder = Some(folder.into());
        Ok(provider)
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.store_path.join(collection)
    }

    fn get_db(&self, collection: &str) -> Result<Arc<KvStore>, ObjectStoreError> {
        let mut cache = self.db_cache.lock().expect("db cache mutex poisoned");
        if let Some(db) = cache.get(collection) {
            return Ok(db.clone());
        }
        let collection_path = self.collection_path(collection);
        if !collection_path.is_dir() {
            return Err(ObjectStoreError::not_found(format!(
                "Collection `{collection}` does not exist"
            )));
        }
        let db = Arc::new(KvStore::open(&collection_path.join(&self.db_file_name))?);
        cache.insert(collection.to_string(), db.clone());
        Ok(db)
    }

    fn is_versioned(&self, db: &KvStore) -> Result<bool, ObjectStoreError> {
        let record = db.get(CONFIG_STORE, CONFIG_ID)?;
        Ok(record
            .and_then(|r| serde_json::from_value::<ConfigDocument>(r.body).ok())
            .map(|config| config.versioned)
            .unwrap_or(false))
    }

    /// Byte and symlink locations for an object, leading `/` stripped from
    /// the id on disk but preserved in record ids.
    fn object_link_path(&self, collection: &str, id: &str, version: Option<&str>) -> (PathBuf, Option<PathBuf>) {
        let relative = id.trim_start_matches('/');
        match version {
            Some(version) => {
                let object_path = self.store_path.join(collection).join(version).join(relative);
                let link_path = self.store_path.join(collection).join(relative);
                (object_path, Some(link_path))
            }
            None => (self.store_path.join(collection).join(relative), None),
        }
    }

    fn object_doc_id(id: &str) -> String {
        format!("{OBJECT_DOC_TYPE}-{id}")
    }

    fn version_doc_id(id: &str, version: &str) -> String {
        format!("{VERSION_DOC_TYPE}-{id}-{version}")
    }

    fn version_doc_prefix(id: &str) -> String {
        format!("{VERSION_DOC_TYPE}-{id}-")
    }

    /// Head read resolving to the current version record when one exists.
    /// Returns the document plus the row etag the caller should treat as
    /// the object etag.
    fn db_get(
        tx: &KvTransaction,
        id: &str,
        version: Option<&str>,
    ) -> Result<Option<(ObjectDocument, String)>, ObjectStoreError> {
        let record_id = match version {
            Some(version) => Self::version_doc_id(id, version),
            None => Self::object_doc_id(id),
        };
        let record = match tx.get(OBJECT_STORE, &record_id)? {
            Some(record) => record,
            None => return Ok(None),
        };
        let doc = parse_doc(record.body)?;
        if version.is_none() {
            if let Some(current) = doc.version.clone() {
                if let Some(version_record) = tx.get(OBJECT_STORE, &Self::version_doc_id(id, &current))? {
                    let version_doc = parse_doc(version_record.body)?;
                    return Ok(Some((version_doc, version_record.etag)));
                }
            }
        }
        Ok(Some((doc, record.etag)))
    }

    fn file_url(&self, path: &Path) -> Option<String> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().ok()?.join(path)
        };
        Url::from_file_path(absolute).ok().map(|url| url.to_string())
    }

    /// Remove a file then prune now-empty parent directories up to the
    /// store root.
    fn delete_file(&self, path: &Path) {
        let _ = fs::remove_file(path);
        let store_abs = self.store_path.canonicalize().ok();
        let mut folder = path.parent().map(Path::to_path_buf);
        while let Some(current) = folder {
            match (current.canonicalize().ok(), &store_abs) {
                (Some(abs), Some(store)) if &abs == store => break,
                _ => {}
            }
            if fs::remove_dir(&current).is_err() {
                break;
            }
            folder = current.parent().map(Path::to_path_buf);
        }
    }

    fn write_payload(payload: &mut PutPayload, object_path: &Path) -> Result<(), ObjectStoreError> {
        if let Some(parent) = object_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ObjectStoreError::internal(format!("Cannot create object folder: {e}")))?;
        }
        match payload {
            PutPayload::Bytes(bytes) => fs::write(object_path, bytes)
                .map_err(|e| ObjectStoreError::internal(format!("Cannot write object: {e}"))),
            PutPayload::File(source) => fs::copy(source, object_path)
                .map(|_| ())
                .map_err(|e| ObjectStoreError::internal(format!("Cannot copy object: {e}"))),
            PutPayload::Reader(reader) => {
                let mut file = fs::File::create(object_path)
                    .map_err(|e| ObjectStoreError::internal(format!("Cannot create object: {e}")))?;
                std::io::copy(reader, &mut file)
                    .map(|_| ())
                    .map_err(|e| ObjectStoreError::internal(format!("Cannot stream object: {e}")))
            }
        }
    }

    fn versions_of(tx: &KvTransaction, id: &str) -> Result<Vec<(ObjectDocument, String)>, ObjectStoreError> {
        let records = tx.list(OBJECT_STORE, Some(&Self::version_doc_prefix(id)), None, None)?;
        let mut versions = Vec::with_capacity(records.len());
        for record in records {
            let doc = parse_doc(record.body)?;
            // The version prefix also matches ids that merely share a
            // prefix with this one; filter on the exact object id.
            if doc.object_id == id {
                versions.push((doc, record.etag));
            }
        }
        Ok(versions)
    }
}

fn parse_doc(body: serde_json::Value) -> Result<ObjectDocument, ObjectStoreError> {
    serde_json::from_value(body).map_err(|e| ObjectStoreError::internal(format!("Corrupt metadata record: {e}")))
}

fn doc_body(doc: &ObjectDocument) -> Result<serde_json::Value, ObjectStoreError> {
    serde_json::to_value(doc).map_err(|e| ObjectStoreError::internal(e.to_string()))
}

impl ObjectStoreProvider for FileSystem {
    fn kind(&self) -> Kind {
        Kind::FileSystem
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
        let folder_path = self.collection_path(collection);
        if folder_path.is_dir() {
            if exists == Some(false) {
                return Err(ObjectStoreError::conflict(format!(
                    "Collection `{collection}` already exists"
                )));
            }
            return Ok(CollectionResult::new(CollectionStatus::Exists));
        }
        fs::create_dir_all(&folder_path)
            .map_err(|e| ObjectStoreError::internal(format!("Cannot create collection folder: {e}")))?;
        let db = self.get_db(collection)?;
        let versioned = config.and_then(|c| c.versioned).unwrap_or(false);
        db.put(
            CONFIG_STORE,
            CONFIG_ID,
            &serde_json::to_value(ConfigDocument { versioned })
                .map_err(|e| ObjectStoreError::internal(e.to_string()))?,
        )?;
        Ok(CollectionResult::new(CollectionStatus::Created))
    }

    fn drop_collection(&self, collection: &str, exists: Option<bool>) -> Result<CollectionResult, ObjectStoreError> {
        let folder_path = self.collection_path(collection);
        if !folder_path.is_dir() {
            if exists == Some(true) {
                return Err(ObjectStoreError::not_found(format!(
                    "Collection `{collection}` does not exist"
                )));
            }
            return Ok(CollectionResult::new(CollectionStatus::NotExists));
        }
        self.db_cache.lock().expect("db cache mutex poisoned").remove(collection);
        fs::remove_dir_all(&folder_path)
            .map_err(|e| ObjectStoreError::internal(format!("Cannot drop collection folder: {e}")))?;
        Ok(CollectionResult::new(CollectionStatus::Dropped))
    }

    fn list_collections(&self) -> Result<Vec<String>, ObjectStoreError> {
        let entries = fs::read_dir(&self.store_path)
            .map_err(|e| ObjectStoreError::internal(format!("Cannot list collections: {e}")))?;
        let mut collections = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ObjectStoreError::internal(e.to_string()))?;
            if entry.path().is_dir() {
                collections.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(collections)
    }

    fn has_collection(&self, collection: &str) -> Result<bool, ObjectStoreError> {
        Ok(self.collection_path(collection).is_dir())
    }

    fn put(&self, mut args: PutArgs) -> Result<ObjectItem, ObjectStoreError> {
        let db = self.get_db(&args.collection)?;
        let versioned = self.is_versioned(&db)?;

        let version = if versioned {
            Some(Uuid::new_v4().to_string())
        } else {
            None
        };
        let (object_path, link_path) = self.object_link_path(&args.collection, &args.id, version.as_deref());

        // Cheap pre-check before touching the filesystem; the
        // authoritative check happens inside the commit transaction.
        db.transaction(|tx| {
            let current = Self::db_get(tx, &args.id, None)?;
            let target = current.as_ref().map(|(doc, etag)| doc.match_target(etag));
            args.match_condition.evaluate(target.as_ref())
        })?;

        Self::write_payload(&mut args.payload, &object_path)?;

        let content_length = fs::metadata(&object_path).map(|m| m.len()).unwrap_or_default();
        let last_modified = now_epoch();
        let mut properties = args.properties.clone().unwrap_or_default();
        properties.etag = None;
        properties.last_modified = Some(last_modified);
        properties.content_length = Some(content_length);

        let doc = ObjectDocument {
            object_id: args.id.clone(),
            version: version.clone(),
            metadata: args.metadata.clone(),
            properties,
            ts: last_modified,
            doc_type: OBJECT_DOC_TYPE.to_string(),
        };

        let etag = db.transaction(|tx| {
            let current = Self::db_get(tx, &args.id, None)?;
            let target = current.as_ref().map(|(doc, etag)| doc.match_target(etag));
            args.match_condition.evaluate(target.as_ref())?;

            let head = tx.put(OBJECT_STORE, &Self::object_doc_id(&args.id), &doc_body(&doc)?)?;
            match &version {
                Some(version) => {
                    let mut version_doc = doc.clone();
                    version_doc.doc_type = VERSION_DOC_TYPE.to_string();
                    let record = tx.put(
                        OBJECT_STORE,
                        &Self::version_doc_id(&args.id, version),
                        &doc_body(&version_doc)?,
                    )?;
                    Ok(record.etag)
                }
                None => Ok(head.etag),
            }
        })?;

        // The head symlink moves only once the metadata commit has won;
        // a refused conditional put leaves the current head untouched.
        if let Some(link_path) = &link_path {
            if let Some(parent) = link_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| ObjectStoreError::internal(format!("Cannot create object folder: {e}")))?;
            }
            if link_path.symlink_metadata().is_ok() {
                let _ = fs::remove_file(link_path);
            }
            std::os::unix::fs::symlink(&object_path, link_path)
                .map_err(|e| ObjectStoreError::internal(format!("Cannot link current version: {e}")))?;
        }

        let return_value = match (&args.returning, &args.payload) {
            (Some(Returning::New), PutPayload::Bytes(bytes)) => Some(bytes.clone()),
            _ => None,
        };
        let url_path = link_path.as_deref().unwrap_or(&object_path);
        Ok(ObjectItem {
            key: ObjectKey {
                id: args.id,
                version,
            },
            value: return_value,
            metadata: args.metadata,
            properties: Some(ObjectProperties {
                etag: Some(etag),
                last_modified: Some(last_modified),
                content_length: Some(content_length),
                ..Default::default()
            }),
            versions: None,
            url: self.file_url(url_path),
        })
    }

    fn get(&self, mut args: GetArgs) -> Result<ObjectItem, ObjectStoreError> {
        let db = self.get_db(&args.collection)?;
        let (object_path, link_path) = self.object_link_path(&args.collection, &args.id, args.version.as_deref());

        if !object_path.is_file() && object_path.symlink_metadata().is_err() {
            return Err(ObjectStoreError::not_found(format!("Object `{}` not found", args.id)));
        }

        let (doc, etag) = db
            .transaction(|tx| Self::db_get(tx, &args.id, args.version.as_deref()))?
            .ok_or_else(|| ObjectStoreError::not_found(format!("Object `{}` not found", args.id)))?;
        args.match_condition.evaluate(Some(&doc.match_target(&etag)))?;

        let mut file = fs::File::open(&object_path)
            .map_err(|e| ObjectStoreError::internal(format!("Cannot open object: {e}")))?;
        let data = match (args.start, args.end) {
            (None, None) => {
                let mut data = Vec::new();
                file.read_to_end(&mut data)
                    .map_err(|e| ObjectStoreError::internal(format!("Cannot read object: {e}")))?;
                data
            }
            (start, end) => {
                let start = start.unwrap_or(0);
                file.seek(SeekFrom::Start(start))
                    .map_err(|e| ObjectStoreError::internal(format!("Cannot seek object: {e}")))?;
                match end {
                    // Inclusive range per the store contract.
                    Some(end) => {
                        let len = end.saturating_sub(start) + 1;
                        let mut data = vec![0u8; len as usize];
                        let read = file
                            .read(&mut data)
                            .map_err(|e| ObjectStoreError::internal(format!("Cannot read object: {e}")))?;
                        data.truncate(read);
                        data
                    }
                    None => {
                        let mut data = Vec::new();
                        file.read_to_end(&mut data)
                            .map_err(|e| ObjectStoreError::internal(format!("Cannot read object: {e}")))?;
                        data
                    }
                }
            }
        };

        let mut value = None;
        match args.destination.as_mut() {
            Some(GetDestination::File(path)) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|e| ObjectStoreError::internal(format!("Cannot create download folder: {e}")))?;
                }
                fs::write(path, &data)
                    .map_err(|e| ObjectStoreError::internal(format!("Cannot write download file: {e}")))?;
            }
            Some(GetDestination::Writer(writer)) => {
                writer
                    .write_all(&data)
                    .map_err(|e| ObjectStoreError::internal(format!("Cannot write download stream: {e}")))?;
            }
            None => value = Some(data),
        }

        let mut properties = doc.properties.clone();
        properties.etag = Some(etag);
        let url_path = link_path.as_deref().unwrap_or(&object_path);
        Ok(ObjectItem {
            key: ObjectKey {
                id: args.id,
                version: doc.version,
            },
            value,
            metadata: doc.metadata,
            properties: Some(properties),
            versions: None,
            url: self.file_url(url_path),
        })
    }

    fn get_properties(
        &self,
        id: &str,
        version: Option<&str>,
        match_condition: &MatchCondition,
        collection: &str,
    ) -> Result<ObjectItem, ObjectStoreError> {
        let db = self.get_db(collection)?;
        let (object_path, link_path) = self.object_link_path(collection, id, version);
        let (doc, etag) = db
            .transaction(|tx| Self::db_get(tx, id, version))?
            .ok_or_else(|| ObjectStoreError::not_found(format!("Object `{id}` not found")))?;
        match_condition.evaluate(Some(&doc.match_target(&etag)))?;

        let mut properties = doc.properties.clone();
        properties.etag = Some(etag);
        let url_path = link_path.as_deref().unwrap_or(&object_path);
        Ok(ObjectItem {
            key: ObjectKey {
                id: id.to_string(),
                version: doc.version,
            },
            value: None,
            metadata: doc.metadata,
            properties: Some(properties),
            versions: None,
            url: self.file_url(url_path),
        })
    }

    fn get_versions(&self, id: &str, collection: &str) -> Result<ObjectItem, ObjectStoreError> {
        let db = self.get_db(collection)?;
        let (object_path, link_path) = self.object_link_path(collection, id, None);
        let mut versions = db.transaction(|tx| Self::versions_of(tx, id))?;
        if versions.is_empty() {
            return Err(ObjectStoreError::not_found(format!("Object `{id}` not found")));
        }

        // Ascending creation order with exactly one latest marker.
        versions.sort_by(|(a, _), (b, _)| a.ts.partial_cmp(&b.ts).unwrap_or(std::cmp::Ordering::Equal));
        let last_index = versions.len() - 1;
        let versions = versions
            .into_iter()
            .enumerate()
            .map(|(index, (doc, etag))| {
                let mut properties = doc.properties.clone();
                properties.etag = Some(etag);
                ObjectVersion {
                    version: doc.version,
                    properties: Some(properties),
                    metadata: doc.metadata,
                    latest: Some(index == last_index),
                }
            })
            .collect();

        let url_path = link_path.as_deref().unwrap_or(&object_path);
        Ok(ObjectItem {
            key: ObjectKey::new(id),
            value: None,
            metadata: None,
            properties: None,
            versions: Some(versions),
            url: self.file_url(url_path),
        })
    }

    fn update(&self, args: UpdateArgs) -> Result<ObjectItem, ObjectStoreError> {
        let db = self.get_db(&args.collection)?;
        let versioned = self.is_versioned(&db)?;
        let last_modified = now_epoch();

        let (doc, etag) = db.transaction(|tx| {
            let (head_doc, head_etag) = Self::db_get(tx, &args.id, None)?
                .ok_or_else(|| ObjectStoreError::not_found(format!("Object `{}` not found", args.id)))?;

            if versioned && head_doc.version.is_some() {
                let current_version = head_doc.version.clone().expect("checked above");
                let updating_current = match args.version.as_deref() {
                    None => true,
                    Some(version) => version == current_version,
                };
                let requested = if updating_current {
                    current_version.clone()
                } else {
                    args.version.clone().expect("non-current update requires a version")
                };

                let (mut version_doc, version_etag) = Self::db_get(tx, &args.id, Some(&requested))?
                    .ok_or_else(|| ObjectStoreError::not_found(format!("Version `{requested}` not found")))?;
                args.match_condition
                    .evaluate(Some(&version_doc.match_target(&version_etag)))?;

                apply_update(&mut version_doc, &args, last_modified);
                if updating_current {
                    let mut head_update = version_doc.clone();
                    head_update.doc_type = OBJECT_DOC_TYPE.to_string();
                    tx.put(OBJECT_STORE, &FileSystem::object_doc_id(&args.id), &doc_body(&head_update)?)?;
                }
                let record = tx.put(
                    OBJECT_STORE,
                    &FileSystem::version_doc_id(&args.id, &requested),
                    &doc_body(&version_doc)?,
                )?;
                Ok((version_doc, record.etag))
            } else {
                let mut head_doc = head_doc;
                args.match_condition.evaluate(Some(&head_doc.match_target(&head_etag)))?;

                apply_update(&mut head_doc, &args, last_modified);
                let record = tx.put(OBJECT_STORE, &FileSystem::object_doc_id(&args.id), &doc_body(&head_doc)?)?;
                Ok((head_doc, record.etag))
            }
        })?;

        let (object_path, link_path) = self.object_link_path(&args.collection, &args.id, doc.version.as_deref());
        let mut properties = doc.properties.clone();
        properties.etag = Some(etag);
        let url_path = link_path.as_deref().unwrap_or(&object_path);
        Ok(ObjectItem {
            key: ObjectKey {
                id: args.id,
                version: doc.version,
            },
            value: None,
            metadata: doc.metadata,
            properties: Some(properties),
            versions: None,
            url: self.file_url(url_path),
        })
    }

    fn delete(
        &self,
        id: &str,
        version: Option<&str>,
        match_condition: &MatchCondition,
        collection: &str,
    ) -> Result<(), ObjectStoreError> {
        let db = self.get_db(collection)?;
        let versioned = self.is_versioned(&db)?;

        let (files_to_delete, deletes_head) = db.transaction(|tx| {
            let current = Self::db_get(tx, id, version.filter(|v| *v != "*"))?;
            let target = current.as_ref().map(|(doc, etag)| doc.match_target(etag));
            match_condition.evaluate(target.as_ref())?;

            let mut files: Vec<(String, Option<String>)> = Vec::new();
            let mut deletes_head = true;
            if versioned {
                let head = tx
                    .get(OBJECT_STORE, &Self::object_doc_id(id))?
                    .ok_or_else(|| ObjectStoreError::not_found(format!("Object `{id}` not found")))?;
                let head_doc = parse_doc(head.body)?;
                deletes_head = match version {
                    None | Some("*") => true,
                    Some(version) => Some(version) == head_doc.version.as_deref(),
                };
                if deletes_head {
                    for (doc, _etag) in Self::versions_of(tx, id)? {
                        if let Some(doc_version) = &doc.version {
                            tx.delete(OBJECT_STORE, &Self::version_doc_id(id, doc_version))?;
                        }
                        files.push((doc.object_id, doc.version));
                    }
                    tx.delete(OBJECT_STORE, &Self::object_doc_id(id))?;
                } else {
                    let requested = version.expect("non-head delete requires a version");
                    let record = tx
                        .get(OBJECT_STORE, &Self::version_doc_id(id, requested))?
                        .ok_or_else(|| ObjectStoreError::not_found(format!("Version `{requested}` not found")))?;
                    let doc = parse_doc(record.body)?;
                    tx.delete(OBJECT_STORE, &Self::version_doc_id(id, requested))?;
                    files.push((doc.object_id, doc.version));
                }
            } else {
                let record = tx
                    .get(OBJECT_STORE, &Self::object_doc_id(id))?
                    .ok_or_else(|| ObjectStoreError::not_found(format!("Object `{id}` not found")))?;
                let doc = parse_doc(record.body)?;
                tx.delete(OBJECT_STORE, &Self::object_doc_id(id))?;
                files.push((doc.object_id, doc.version));
            }
            Ok((files, deletes_head))
        })?;

        for (object_id, object_version) in files_to_delete {
            let (object_path, link_path) = self.object_link_path(collection, &object_id, object_version.as_deref());
            if object_path.is_file() || object_path.symlink_metadata().is_ok() {
                self.delete_file(&object_path);
            }
            if deletes_head {
                if let Some(link_path) = link_path {
                    if link_path.symlink_metadata().is_ok() {
                        self.delete_file(&link_path);
                    }
                }
            }
        }
        Ok(())
    }

    fn copy(&self, args: CopyArgs) -> Result<ObjectItem, ObjectStoreError> {
        let source_collection = args.source_collection.as_deref().unwrap_or(&args.collection);
        let source_db = self.get_db(source_collection)?;

        let (source_object_path, _) =
            self.object_link_path(source_collection, &args.source_id, args.source_version.as_deref());
        if !source_object_path.is_file() && source_object_path.symlink_metadata().is_err() {
            return Err(ObjectStoreError::not_found(format!(
                "Source object `{}` not found",
                args.source_id
            )));
        }
        let (source_doc, _source_etag) = source_db
            .transaction(|tx| Self::db_get(tx, &args.source_id, args.source_version.as_deref()))?
            .ok_or_else(|| ObjectStoreError::not_found(format!("Source object `{}` not found", args.source_id)))?;

        let mut new_properties = match &args.properties {
            Some(overlay) => ObjectProperties::merged(&source_doc.properties, overlay),
            None => source_doc.properties.clone(),
        };
        new_properties.etag = None;
        new_properties.last_modified = None;

        let new_metadata = match (&source_doc.metadata, &args.metadata) {
            (None, None) => None,
            (source, overlay) => {
                let mut merged = source.clone().unwrap_or_default();
                if let Some(overlay) = overlay {
                    merged.extend(overlay.clone());
                }
                Some(merged)
            }
        };

        self.put(PutArgs {
            id: args.id,
            payload: PutPayload::File(source_object_path),
            metadata: new_metadata,
            properties: Some(new_properties),
            match_condition: args.match_condition,
            returning: None,
            config: None,
            collection: args.collection,
        })
    }

    fn generate(
        &self,
        id: &str,
        version: Option<&str>,
        _method: SignedUrlMethod,
        _expiry: Duration,
        collection: &str,
    ) -> Result<ObjectItem, ObjectStoreError> {
        // No signing locally; the file URL is already reachable.
        let (object_path, link_path) = self.object_link_path(collection, id, version);
        let url_path = link_path.as_deref().unwrap_or(&object_path);
        Ok(ObjectItem {
            key: ObjectKey {
                id: id.to_string(),
                version: version.map(str::to_string),
            },
            url: self.file_url(url_path),
            ..Default::default()
        })
    }

    fn query(&self, args: &QueryArgs, collection: &str) -> Result<ObjectList, ObjectStoreError> {
        let db = self.get_db(collection)?;

        let kv_prefix = format!("{}-{}", OBJECT_DOC_TYPE, args.prefix.as_deref().unwrap_or(""));
        let lower_bound = [args.continuation.as_deref(), args.start_after.as_deref()]
            .into_iter()
            .flatten()
            .max()
            .map(|bound| format!("{OBJECT_DOC_TYPE}-{bound}"));

        let records = db.list(OBJECT_STORE, Some(&kv_prefix), lower_bound.as_deref(), None)?;

        let limit = args.effective_limit();
        let mut items: Vec<ObjectItem> = Vec::new();
        let mut prefixes: Vec<String> = Vec::new();
        let mut continuation: Option<String> = None;
        let mut consumed: u64 = 0;

        for record in records {
            let doc = parse_doc(record.body)?;
            if let Some(end_before) = &args.end_before {
                if doc.object_id.as_str() >= end_before.as_str() {
                    break;
                }
            }
            if let Some(limit) = limit {
                if consumed >= limit {
                    break;
                }
            }
            consumed += 1;
            continuation = Some(doc.object_id.clone());

            if let Some(delimiter) = &args.delimiter {
                let relative = match &args.prefix {
                    Some(prefix) => doc.object_id[prefix.len()..].to_string(),
                    None => doc.object_id.clone(),
                };
                if let Some((first_segment, rest)) = relative.split_once(delimiter.as_str()) {
                    if !rest.is_empty() {
                        let grouped =
                            format!("{}{}{}", args.prefix.as_deref().unwrap_or(""), first_segment, delimiter);
                        if !prefixes.contains(&grouped) {
                            prefixes.push(grouped);
                        }
                        continue;
                    }
                }
            }

            let (object_path, link_path) = self.object_link_path(collection, &doc.object_id, doc.version.as_deref());
            let url_path = link_path.as_deref().unwrap_or(&object_path);
            items.push(ObjectItem {
                key: ObjectKey {
                    id: doc.object_id,
                    version: doc.version,
                },
                url: self.file_url(url_path),
                ..Default::default()
            });
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
        self.db_cache.lock().expect("db cache mutex poisoned").clear();
        Ok(())
    }
}

fn apply_update(doc: &mut ObjectDocument, args: &UpdateArgs, last_modified: f64) {
    doc.properties.last_modified = Some(last_modified);
    if let Some(properties) = &args.properties {
        doc.properties = ObjectProperties::merged(&doc.properties, properties);
        doc.properties.last_modified = Some(last_modified);
        doc.properties.etag = None;
    }
    if let Some(metadata) = &args.metadata {
        doc.metadata = Some(metadata.clone());
    }
}
