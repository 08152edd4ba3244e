use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::manifest::VersionDescriptor;
use crate::runtime::ResolvedPaths;

const KV_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS kv_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at_unix INTEGER NOT NULL
);
"#;

/// Storage keys. A schema change bumps the suffix and abandons the old key.
pub mod keys {
    pub const DOWNLOADED_VERSIONS: &str = "downloaded_versions_v2";
    pub const VERSIONS_CACHE: &str = "versions_cache_v2";
    pub const LAST_URL_PREFIX: &str = "last_url_v1:";
    pub const BOOKMARKS_PREFIX: &str = "bookmarks_v1:";

    pub fn last_url(slug: &str) -> String {
        format!("{LAST_URL_PREFIX}{slug}")
    }

    pub fn bookmarks(slug: &str) -> String {
        format!("{BOOKMARKS_PREFIX}{slug}")
    }
}

/// String-keyed blob storage. No transactions across keys; last write wins.
pub trait KeyValueStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>>;
    fn set_raw(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

pub struct SqliteStore {
    connection: Connection,
}

impl SqliteStore {
    pub fn open(paths: &ResolvedPaths) -> Result<Self> {
        Self::open_at(&paths.db_path)
    }

    pub fn open_at(db_path: &Path) -> Result<Self> {
        ensure_parent_dir(db_path)?;
        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        connection
            .pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL journal mode")?;
        connection
            .execute_batch(KV_SCHEMA_SQL)
            .context("failed to initialize key-value schema")?;
        Ok(Self { connection })
    }
}

impl KeyValueStore for SqliteStore {
    fn get_raw(&self, key: &str) -> Result<Option<String>> {
        self.connection
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to read key {key}"))
    }

    fn set_raw(&self, key: &str, value: &str) -> Result<()> {
        let now = i64::try_from(unix_millis()? / 1000).context("timestamp overflow")?;
        self.connection
            .execute(
                "INSERT INTO kv_entries (key, value, updated_at_unix) VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at_unix = excluded.updated_at_unix",
                params![key, value, now],
            )
            .with_context(|| format!("failed to write key {key}"))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.connection
            .execute("DELETE FROM kv_entries WHERE key = ?1", [key])
            .with_context(|| format!("failed to delete key {key}"))?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut statement = self
            .connection
            .prepare("SELECT key FROM kv_entries WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key")
            .context("failed to prepare key listing")?;
        let rows = statement
            .query_map([prefix], |row| row.get::<_, String>(0))
            .context("failed to list keys")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode key row")?);
        }
        Ok(out)
    }
}

/// Reads a JSON record. Undecodable data is treated as absent.
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    let Some(raw) = store.get_raw(key)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            warn!(key, %error, "ignoring unreadable stored record");
            Ok(None)
        }
    }
}

pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)
        .with_context(|| format!("failed to serialize record for key {key}"))?;
    store.set_raw(key, &raw)
}

/// Record of one unpacked bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadedEntry {
    pub index_path: String,
    pub downloaded_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_sha256: Option<String>,
}

pub type DownloadedMap = BTreeMap<String, DownloadedEntry>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionsCache {
    pub saved_at: u64,
    pub versions: Vec<VersionDescriptor>,
}

pub fn load_downloaded_map(store: &dyn KeyValueStore) -> Result<DownloadedMap> {
    Ok(load_json(store, keys::DOWNLOADED_VERSIONS)?.unwrap_or_default())
}

pub fn save_downloaded_map(store: &dyn KeyValueStore, map: &DownloadedMap) -> Result<()> {
    save_json(store, keys::DOWNLOADED_VERSIONS, map)
}

/// Read-modify-write of one slug's entry.
pub fn record_download(store: &dyn KeyValueStore, slug: &str, entry: DownloadedEntry) -> Result<()> {
    let mut map = load_downloaded_map(store)?;
    map.insert(slug.to_string(), entry);
    save_downloaded_map(store, &map)
}

pub fn load_versions_cache(store: &dyn KeyValueStore) -> Result<Option<VersionsCache>> {
    load_json(store, keys::VERSIONS_CACHE)
}

pub fn save_versions_cache(
    store: &dyn KeyValueStore,
    versions: &[VersionDescriptor],
) -> Result<VersionsCache> {
    let cache = VersionsCache {
        saved_at: unix_millis()?,
        versions: versions.to_vec(),
    };
    save_json(store, keys::VERSIONS_CACHE, &cache)?;
    Ok(cache)
}

pub fn unix_millis() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before UNIX_EPOCH")
        .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn open_store(root: &Path) -> SqliteStore {
        SqliteStore::open_at(&root.join("data").join("docshelf.db")).expect("open store")
    }

    fn entry(index_path: &str) -> DownloadedEntry {
        DownloadedEntry {
            index_path: index_path.to_string(),
            downloaded_at: 1_700_000_000_000,
            zip_url: Some("https://x/y.zip".to_string()),
            etag: None,
            last_modified: None,
            sha: None,
            r#ref: None,
            archive_sha256: None,
        }
    }

    #[test]
    fn raw_values_round_trip_and_overwrite() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());

        assert_eq!(store.get_raw("missing").expect("get"), None);
        store.set_raw("k", "one").expect("set");
        store.set_raw("k", "two").expect("overwrite");
        assert_eq!(store.get_raw("k").expect("get").as_deref(), Some("two"));
        store.remove("k").expect("remove");
        assert_eq!(store.get_raw("k").expect("get"), None);
    }

    #[test]
    fn values_persist_across_reopen() {
        let temp = tempdir().expect("tempdir");
        {
            let store = open_store(temp.path());
            record_download(&store, "5.2", entry("/docs/5.2/index.html")).expect("record");
        }
        let reopened = open_store(temp.path());
        let map = load_downloaded_map(&reopened).expect("load");
        assert_eq!(map.len(), 1);
        assert_eq!(map["5.2"].index_path, "/docs/5.2/index.html");
    }

    #[test]
    fn record_download_merges_and_overwrites_by_slug() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        record_download(&store, "5.2", entry("/old/index.html")).expect("record");
        record_download(&store, "dev", entry("/dev/index.html")).expect("record");
        record_download(&store, "5.2", entry("/new/index.html")).expect("record");

        let map = load_downloaded_map(&store).expect("load");
        assert_eq!(map.keys().cloned().collect::<Vec<_>>(), vec!["5.2", "dev"]);
        assert_eq!(map["5.2"].index_path, "/new/index.html");
    }

    #[test]
    fn unreadable_json_is_treated_as_absent() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        store
            .set_raw(keys::DOWNLOADED_VERSIONS, "{not json")
            .expect("set");
        assert!(load_downloaded_map(&store).expect("load").is_empty());
        assert!(load_versions_cache(&store).expect("load").is_none());
    }

    #[test]
    fn downloaded_entry_uses_camel_case_and_omits_absent_fields() {
        let json = serde_json::to_value(entry("/a/index.html")).expect("serialize");
        assert_eq!(json["indexPath"], "/a/index.html");
        assert_eq!(json["zipUrl"], "https://x/y.zip");
        assert!(json.get("etag").is_none());
    }

    #[test]
    fn keys_with_prefix_lists_matching_keys_only() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        store.set_raw(&keys::bookmarks("5.2"), "[]").expect("set");
        store.set_raw(&keys::bookmarks("dev"), "[]").expect("set");
        store.set_raw(&keys::last_url("dev"), "\"file:///x\"").expect("set");

        let listed = store
            .keys_with_prefix(keys::BOOKMARKS_PREFIX)
            .expect("list");
        assert_eq!(listed, vec!["bookmarks_v1:5.2", "bookmarks_v1:dev"]);
    }

    #[test]
    fn versions_cache_replaces_wholesale() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let first = vec![VersionDescriptor::metadata_only("5.2", "https://d/en/5.2/")];
        let second = vec![VersionDescriptor::metadata_only("dev", "https://d/en/dev/")];
        save_versions_cache(&store, &first).expect("save");
        save_versions_cache(&store, &second).expect("save");
        let cache = load_versions_cache(&store).expect("load").expect("present");
        assert_eq!(cache.versions, second);
        assert!(cache.saved_at > 0);
    }
}
