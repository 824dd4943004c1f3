use std::collections::HashMap;

use nimbus_engine::model::object::{
    CollectionStatus, ObjectBatch, ObjectCollectionConfig, ObjectKey, ObjectProperties, ObjectQueryConfig,
    ObjectSource, SignedUrlMethod,
};
use nimbus_engine::storage::object_store::errors::ObjectStoreError;
use nimbus_engine::storage::object_store::file_system::FileSystem;
use nimbus_engine::storage::object_store::{
    DeleteOptions, GetOptions, ObjectStore, PutOptions, QueryOptions, UpdateOptions,
};

fn store(dir: &tempfile::TempDir) -> ObjectStore {
    ObjectStore::new(FileSystem::new(dir.path()).unwrap())
}

fn create_collection(store: &ObjectStore, name: &str, versioned: bool) {
    let config = ObjectCollectionConfig {
        versioned: Some(versioned),
        ..Default::default()
    };
    let result = store.create_collection(Some(name), Some(&config), None).unwrap();
    assert_eq!(result.result.status, CollectionStatus::Created);
}

fn put_options(collection: &str) -> PutOptions {
    PutOptions {
        collection: Some(collection.to_string()),
        ..Default::default()
    }
}

fn get_options(collection: &str) -> GetOptions {
    GetOptions {
        collection: Some(collection.to_string()),
        ..Default::default()
    }
}

#[test]
fn collection_lifecycle_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);

    assert!(!store.has_collection(Some("docs")).unwrap().result);
    create_collection(&store, "docs", false);
    assert!(store.has_collection(Some("docs")).unwrap().result);
    assert!(store.list_collections().unwrap().result.contains(&"docs".to_string()));

    // Creating again reports EXISTS; with not_exists() it conflicts.
    let again = store.create_collection(Some("docs"), None, None).unwrap();
    assert_eq!(again.result.status, CollectionStatus::Exists);
    let conflict = store.create_collection(Some("docs"), None, Some("not_exists()".into()));
    assert!(matches!(conflict, Err(ObjectStoreError::Conflict { .. })));

    let dropped = store.drop_collection(Some("docs"), None).unwrap();
    assert_eq!(dropped.result.status, CollectionStatus::Dropped);
    let dropped_again = store.drop_collection(Some("docs"), None).unwrap();
    assert_eq!(dropped_again.result.status, CollectionStatus::NotExists);
    let strict = store.drop_collection(Some("docs"), Some("exists()".into()));
    assert!(matches!(strict, Err(ObjectStoreError::NotFound { .. })));
}

#[test]
fn versioned_put_get_update_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    create_collection(&store, "x8-test-versioned", true);
    let collection = "x8-test-versioned";

    let put = store
        .put("test4", b"Hello World Four".as_slice(), put_options(collection))
        .unwrap()
        .result;
    assert!(put.key.version.is_some());
    let etag = put.properties.as_ref().and_then(|p| p.etag.clone()).unwrap();
    assert!(!etag.is_empty());

    let got = store.get("test4", get_options(collection)).unwrap().result;
    assert_eq!(got.value.as_deref(), Some(b"Hello World Four".as_slice()));
    assert!(got.key.version.is_some());
    assert_eq!(got.properties.as_ref().and_then(|p| p.etag.clone()), Some(etag.clone()));

    let updated = store
        .update(
            "test4",
            UpdateOptions {
                metadata: Some(HashMap::from([("ustr".to_string(), "uvalue".to_string())])),
                collection: Some(collection.to_string()),
                ..Default::default()
            },
        )
        .unwrap()
        .result;
    let updated_etag = updated.properties.as_ref().and_then(|p| p.etag.clone()).unwrap();
    assert_ne!(updated_etag, etag);

    let properties = store.get_properties("test4", None, Some(collection)).unwrap().result;
    assert_eq!(
        properties.metadata.as_ref().and_then(|m| m.get("ustr")).map(String::as_str),
        Some("uvalue")
    );
    assert_eq!(properties.properties.as_ref().and_then(|p| p.etag.clone()), Some(updated_etag));

    store
        .delete(
            ObjectKey::with_version("test4", "*"),
            DeleteOptions {
                collection: Some(collection.to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    let gone = store.get("test4", get_options(collection));
    assert!(matches!(gone, Err(ObjectStoreError::NotFound { .. })));
    let versions = store.get_versions("test4", Some(collection));
    assert!(matches!(versions, Err(ObjectStoreError::NotFound { .. })));
}

#[test]
fn sequential_puts_build_an_ascending_version_history() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    create_collection(&store, "versioned", true);

    let mut etags = Vec::new();
    for value in [b"one".as_slice(), b"two".as_slice(), b"three".as_slice()] {
        let put = store.put("doc", value, put_options("versioned")).unwrap().result;
        etags.push(put.properties.unwrap().etag.unwrap());
    }
    // Every successful put bumps the etag.
    assert_eq!(etags.len(), 3);
    assert_ne!(etags[0], etags[1]);
    assert_ne!(etags[1], etags[2]);

    let versions = store.get_versions("doc", Some("versioned")).unwrap().result;
    let versions = versions.versions.unwrap();
    assert_eq!(versions.len(), 3);
    // Oldest first, exactly one latest marker on the newest entry.
    let timestamps: Vec<f64> = versions
        .iter()
        .map(|v| v.properties.as_ref().unwrap().last_modified.unwrap())
        .collect();
    let mut sorted = timestamps.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(timestamps, sorted);
    let latest_flags: Vec<bool> = versions.iter().map(|v| v.latest.unwrap()).collect();
    assert_eq!(latest_flags.iter().filter(|latest| **latest).count(), 1);
    assert!(latest_flags[2]);

    // The head serves the latest bytes; a named version serves its own.
    let head = store.get("doc", get_options("versioned")).unwrap().result;
    assert_eq!(head.value.as_deref(), Some(b"three".as_slice()));
    let first_version = versions[0].version.clone().unwrap();
    let old = store
        .get(ObjectKey::with_version("doc", first_version), get_options("versioned"))
        .unwrap()
        .result;
    assert_eq!(old.value.as_deref(), Some(b"one".as_slice()));
}

#[test]
fn etag_preconditions_guard_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    create_collection(&store, "cond", false);

    let mut options = put_options("cond");
    options.condition = Some("not_exists()".into());
    let put = store
        .put("test1", b"Hello World One".as_slice(), options)
        .unwrap()
        .result;
    let etag = put.properties.unwrap().etag.unwrap();

    // Same conditional put again: the object now exists.
    let mut options = put_options("cond");
    options.condition = Some("not_exists()".into());
    let repeat = store.put("test1", b"Hello World One".as_slice(), options);
    assert!(matches!(repeat, Err(ObjectStoreError::PreconditionFailed { .. })));

    let mut options = put_options("cond");
    options.condition = Some("$etag='bogus'".into());
    let stale = store.put("test1", b"nope".as_slice(), options);
    assert!(matches!(stale, Err(ObjectStoreError::PreconditionFailed { .. })));

    let mut options = put_options("cond");
    options.condition = Some(format!("$etag='{etag}'").as_str().into());
    let fresh = store.put("test1", b"Hello Again".as_slice(), options).unwrap().result;
    let new_etag = fresh.properties.unwrap().etag.unwrap();
    assert_ne!(new_etag, etag);

    // Wildcard matches any existing etag.
    let mut options = put_options("cond");
    options.condition = Some("$etag='*'".into());
    assert!(store.put("test1", b"Once More".as_slice(), options).is_ok());

    // if-none-match against the current etag reads as NotModified.
    let mut options = get_options("cond");
    options.condition = Some(format!("$etag!='{new_etag}'").as_str().into());
    let unchanged = store.get("test1", options);
    assert!(matches!(unchanged, Err(ObjectStoreError::NotModified)));
}

#[test]
fn range_reads_are_inclusive() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    create_collection(&store, "ranges", false);

    store
        .put("test1", b"Hello World One".as_slice(), put_options("ranges"))
        .unwrap();

    let mut options = get_options("ranges");
    options.start = Some(3);
    let tail = store.get("test1", options).unwrap().result;
    assert_eq!(tail.value.as_deref(), Some(b"lo World One".as_slice()));

    let mut options = get_options("ranges");
    options.start = Some(3);
    options.end = Some(7);
    let middle = store.get("test1", options).unwrap().result;
    assert_eq!(middle.value.as_deref(), Some(b"lo Wo".as_slice()));

    let mut options = get_options("ranges");
    options.end = Some(7);
    let head = store.get("test1", options).unwrap().result;
    assert_eq!(head.value.as_deref(), Some(b"Hello Wo".as_slice()));
}

const QUERY_IDS: &[&str] = &[
    "test00.txt",
    "test01.txt",
    "data/test02.txt",
    "data/test03.txt",
    "data/ab/test04.txt",
    "data/ab/test05.txt",
    "data/cd/test06.txt",
    "data/xy/test07.txt",
    "data/xy/test08.txt",
    "abc/test09.txt",
    "abc/test10.txt",
    "tzyx/test13.txt",
    "tzyx/test14.txt",
    "aaa.txt",
];

fn seed_query_collection(store: &ObjectStore, collection: &str) {
    create_collection(store, collection, false);
    for (index, id) in QUERY_IDS.iter().enumerate() {
        store
            .put(*id, format!("value{index}").as_bytes(), put_options(collection))
            .unwrap();
    }
}

#[test]
fn listing_orders_ids_binary_ascending() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    seed_query_collection(&store, "listing");

    let listed = store
        .query(QueryOptions {
            collection: Some("listing".to_string()),
            ..Default::default()
        })
        .unwrap()
        .result;
    let ids: Vec<&str> = listed.items.iter().map(|item| item.key.id.as_str()).collect();
    let mut expected: Vec<&str> = QUERY_IDS.to_vec();
    expected.sort();
    assert_eq!(ids, expected);
    assert!(listed.continuation.is_none());
    assert!(listed.prefixes.is_empty());

    let prefixed = store
        .query(QueryOptions {
            condition: Some("starts_with($id, 'data/')".into()),
            collection: Some("listing".to_string()),
            ..Default::default()
        })
        .unwrap()
        .result;
    assert_eq!(prefixed.items.len(), 7);
    assert!(prefixed.items.iter().all(|item| item.key.id.starts_with("data/")));

    let bounded = store
        .query(QueryOptions {
            condition: Some("$id > 'data/' AND $id < 'te'".into()),
            collection: Some("listing".to_string()),
            ..Default::default()
        })
        .unwrap()
        .result;
    assert!(bounded.items.iter().all(|item| item.key.id.as_str() > "data/"));
    assert!(bounded.items.iter().all(|item| item.key.id.as_str() < "te"));
}

#[test]
fn delimiter_listing_groups_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    seed_query_collection(&store, "grouped");

    let listed = store
        .query(QueryOptions {
            condition: Some("starts_with_delimited($id, 'data/', '/')".into()),
            collection: Some("grouped".to_string()),
            ..Default::default()
        })
        .unwrap()
        .result;
    let ids: Vec<&str> = listed.items.iter().map(|item| item.key.id.as_str()).collect();
    assert_eq!(ids, vec!["data/test02.txt", "data/test03.txt"]);
    assert_eq!(listed.prefixes, vec!["data/ab/", "data/cd/", "data/xy/"]);

    let count = store
        .count(QueryOptions {
            condition: Some("starts_with_delimited($id, 'data/', '/')".into()),
            collection: Some("grouped".to_string()),
            ..Default::default()
        })
        .unwrap()
        .result;
    assert_eq!(count, 5);

    // Root-level grouping collects the top folders and the bare files.
    let root = store
        .query(QueryOptions {
            condition: Some("starts_with_delimited($id, null, '/')".into()),
            collection: Some("grouped".to_string()),
            ..Default::default()
        })
        .unwrap()
        .result;
    let ids: Vec<&str> = root.items.iter().map(|item| item.key.id.as_str()).collect();
    assert_eq!(ids, vec!["aaa.txt", "test00.txt", "test01.txt"]);
    assert_eq!(root.prefixes, vec!["abc/", "data/", "tzyx/"]);
}

#[test]
fn paging_walks_the_listing_in_page_size_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    seed_query_collection(&store, "paged");

    let config = ObjectQueryConfig {
        paging: Some(true),
        page_size: Some(5),
    };
    let mut collected: Vec<String> = Vec::new();
    let mut continuation: Option<String> = None;
    let mut page_sizes = Vec::new();
    loop {
        let page = store
            .query(QueryOptions {
                config: Some(config.clone()),
                continuation: continuation.clone(),
                collection: Some("paged".to_string()),
                ..Default::default()
            })
            .unwrap()
            .result;
        page_sizes.push(page.items.len());
        collected.extend(page.items.iter().map(|item| item.key.id.clone()));
        continuation = page.continuation;
        if continuation.is_none() {
            break;
        }
    }
    assert_eq!(page_sizes, vec![5, 5, 4]);

    let mut expected: Vec<String> = QUERY_IDS.iter().map(|id| id.to_string()).collect();
    expected.sort();
    assert_eq!(collected, expected);
}

#[test]
fn copy_carries_bytes_metadata_and_properties() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    create_collection(&store, "source", false);
    create_collection(&store, "dest", false);

    let mut options = put_options("source");
    options.metadata = Some(HashMap::from([("origin".to_string(), "source".to_string())]));
    options.properties = Some(ObjectProperties {
        content_type: Some("text/plain".to_string()),
        ..Default::default()
    });
    store.put("original.txt", b"copy me".as_slice(), options).unwrap();

    let copied = store
        .copy(
            "copied.txt",
            ObjectSource {
                id: "original.txt".to_string(),
                version: None,
                collection: Some("source".to_string()),
            },
            nimbus_engine::storage::object_store::CopyOptions {
                metadata: Some(HashMap::from([("extra".to_string(), "value".to_string())])),
                collection: Some("dest".to_string()),
                ..Default::default()
            },
        )
        .unwrap()
        .result;
    assert_eq!(copied.key.id, "copied.txt");

    let fetched = store.get("copied.txt", get_options("dest")).unwrap().result;
    assert_eq!(fetched.value.as_deref(), Some(b"copy me".as_slice()));
    let metadata = fetched.metadata.unwrap();
    assert_eq!(metadata.get("origin").map(String::as_str), Some("source"));
    assert_eq!(metadata.get("extra").map(String::as_str), Some("value"));
    assert_eq!(
        fetched.properties.as_ref().and_then(|p| p.content_type.as_deref()),
        Some("text/plain")
    );

    let missing = store.copy(
        "nope.txt",
        ObjectSource::new("missing.txt"),
        nimbus_engine::storage::object_store::CopyOptions {
            collection: Some("dest".to_string()),
            ..Default::default()
        },
    );
    assert!(matches!(missing, Err(ObjectStoreError::NotFound { .. })));
}

#[test]
fn leading_slash_ids_are_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    create_collection(&store, "slashes", false);

    store
        .put("/c/d/test4.txt", b"Hello World Four".as_slice(), put_options("slashes"))
        .unwrap();
    let fetched = store.get("/c/d/test4.txt", get_options("slashes")).unwrap().result;
    assert_eq!(fetched.key.id, "/c/d/test4.txt");
    assert_eq!(fetched.value.as_deref(), Some(b"Hello World Four".as_slice()));

    let listed = store
        .query(QueryOptions {
            collection: Some("slashes".to_string()),
            ..Default::default()
        })
        .unwrap()
        .result;
    assert_eq!(listed.items[0].key.id, "/c/d/test4.txt");
}

#[test]
fn batch_delete_removes_every_named_object() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    create_collection(&store, "batch", false);

    for id in ["a.txt", "b.txt", "c.txt"] {
        store.put(id, b"data".as_slice(), put_options("batch")).unwrap();
    }
    let batch = ObjectBatch::new().delete("a.txt").delete("b.txt");
    store.batch(batch, Some("batch")).unwrap();

    assert!(matches!(
        store.get("a.txt", get_options("batch")),
        Err(ObjectStoreError::NotFound { .. })
    ));
    assert!(matches!(
        store.get("b.txt", get_options("batch")),
        Err(ObjectStoreError::NotFound { .. })
    ));
    assert!(store.get("c.txt", get_options("batch")).is_ok());
}

#[test]
fn generate_returns_a_reachable_file_url() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    create_collection(&store, "urls", false);

    store.put("file.txt", b"hello".as_slice(), put_options("urls")).unwrap();
    let generated = store
        .generate("file.txt", SignedUrlMethod::Get, 60_000, Some("urls"))
        .unwrap()
        .result;
    let url = generated.url.unwrap();
    assert!(url.starts_with("file://"));
    assert!(url.ends_with("urls/file.txt"));
}

#[test]
fn download_to_file_and_writer_destinations() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(&dir);
    create_collection(&store, "downloads", false);
    store
        .put("file.txt", b"streamed bytes".as_slice(), put_options("downloads"))
        .unwrap();

    let target = dir.path().join("out/download.txt");
    let mut options = get_options("downloads");
    options.destination = Some(nimbus_engine::storage::object_store::GetDestination::File(target.clone()));
    let item = store.get("file.txt", options).unwrap().result;
    assert!(item.value.is_none());
    assert_eq!(std::fs::read(&target).unwrap(), b"streamed bytes");
}
