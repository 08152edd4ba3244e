use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::config::Settings;
use crate::http::HttpTransport;
use crate::manifest::{ManifestClient, VersionDescriptor, compare_slugs};
use crate::store::{
    DownloadedMap, KeyValueStore, load_downloaded_map, load_versions_cache, save_versions_cache,
};
use crate::sync::ConnectivityProbe;

#[derive(Debug, Clone, Serialize)]
pub struct LibraryView {
    pub versions: Vec<VersionDescriptor>,
    pub downloaded: DownloadedMap,
    pub from_cache: bool,
    /// Offline with no cached list: only already-downloaded versions are shown.
    pub needs_internet: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LibraryRow {
    pub slug: String,
    pub downloaded: bool,
    pub downloadable: bool,
}

impl LibraryView {
    pub fn rows(&self) -> Vec<LibraryRow> {
        self.versions
            .iter()
            .map(|version| LibraryRow {
                slug: version.slug.clone(),
                downloaded: self.downloaded.contains_key(&version.slug),
                downloadable: version.zip_url.is_some(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty() && self.downloaded.is_empty()
    }

    pub fn find(&self, slug: &str) -> Option<&VersionDescriptor> {
        self.versions.iter().find(|version| version.slug == slug)
    }
}

/// Cache first; the network is only consulted when no list has ever been
/// cached.
pub fn load_library(
    client: &ManifestClient,
    http: &mut dyn HttpTransport,
    store: &dyn KeyValueStore,
    probe: &mut dyn ConnectivityProbe,
) -> Result<LibraryView> {
    let downloaded = load_downloaded_map(store)?;

    if let Some(cache) = load_versions_cache(store)?
        && !cache.versions.is_empty()
    {
        debug!(count = cache.versions.len(), "using cached version list");
        return Ok(LibraryView {
            versions: cache.versions,
            downloaded,
            from_cache: true,
            needs_internet: false,
        });
    }

    if !probe.current().is_online() {
        let versions = synthesize_offline_versions(client.settings(), &downloaded);
        return Ok(LibraryView {
            versions,
            downloaded,
            from_cache: false,
            needs_internet: true,
        });
    }

    let versions = client.fetch_versions(http)?;
    save_versions_cache(store, &versions)?;
    Ok(LibraryView {
        versions,
        downloaded,
        from_cache: false,
        needs_internet: false,
    })
}

/// Re-reads local state after a download or background sync. Never touches
/// the network; without a cached list the previous versions are kept.
pub fn refresh_library(store: &dyn KeyValueStore, current: &LibraryView) -> Result<LibraryView> {
    let downloaded = load_downloaded_map(store)?;
    match load_versions_cache(store)? {
        Some(cache) if !cache.versions.is_empty() => Ok(LibraryView {
            versions: cache.versions,
            downloaded,
            from_cache: true,
            needs_internet: false,
        }),
        _ => Ok(LibraryView {
            versions: current.versions.clone(),
            downloaded,
            from_cache: current.from_cache,
            needs_internet: current.needs_internet,
        }),
    }
}

/// Metadata-only descriptors for versions that are on disk.
pub fn synthesize_offline_versions(
    settings: &Settings,
    downloaded: &DownloadedMap,
) -> Vec<VersionDescriptor> {
    let mut slugs: Vec<&String> = downloaded.keys().collect();
    slugs.sort_by(|a, b| compare_slugs(a, b));
    slugs
        .into_iter()
        .map(|slug| VersionDescriptor::metadata_only(slug, &settings.page_url(slug)))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::tempdir;

    use super::*;
    use crate::manifest::tests::{MockHttp, manifest_json, settings};
    use crate::store::{DownloadedEntry, SqliteStore, record_download};
    use crate::sync::{Connectivity, FixedConnectivity};

    fn open_store(root: &Path) -> SqliteStore {
        SqliteStore::open_at(&root.join("docshelf.db")).expect("open store")
    }

    fn entry() -> DownloadedEntry {
        DownloadedEntry {
            index_path: "/docs/5.2/index.html".to_string(),
            downloaded_at: 1,
            zip_url: Some("https://x/y.zip".to_string()),
            etag: None,
            last_modified: None,
            sha: None,
            r#ref: None,
            archive_sha256: None,
        }
    }

    #[test]
    fn offline_first_run_with_nothing_downloaded_needs_internet() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let client = ManifestClient::new(&settings());
        let mut http = MockHttp::default();

        let view = load_library(
            &client,
            &mut http,
            &store,
            &mut FixedConnectivity(Connectivity::offline()),
        )
        .expect("load");
        assert!(view.versions.is_empty());
        assert!(view.needs_internet);
        assert!(view.is_empty());
        assert!(http.requested.is_empty());
    }

    #[test]
    fn offline_first_run_synthesizes_downloaded_versions() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        record_download(&store, "5.2", entry()).expect("record");
        let client = ManifestClient::new(&settings());

        let view = load_library(
            &client,
            &mut MockHttp::default(),
            &store,
            &mut FixedConnectivity(Connectivity::offline()),
        )
        .expect("load");
        assert!(view.needs_internet);
        assert_eq!(
            view.versions,
            vec![VersionDescriptor::metadata_only(
                "5.2",
                "https://docs.test/en/5.2/"
            )]
        );
        assert_eq!(
            view.rows(),
            vec![LibraryRow {
                slug: "5.2".to_string(),
                downloaded: true,
                downloadable: false,
            }]
        );
    }

    #[test]
    fn online_first_run_fetches_and_caches() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let settings = settings();
        let client = ManifestClient::new(&settings);
        let mut http = MockHttp::default().with_text(
            &settings.manifest_url,
            200,
            &manifest_json(&[("5.2", Some("https://x/y.zip"))]),
        );
        let mut probe = FixedConnectivity(Connectivity {
            is_connected: Some(true),
            is_internet_reachable: None,
        });

        let view = load_library(&client, &mut http, &store, &mut probe).expect("load");
        assert!(!view.from_cache);
        assert!(!view.needs_internet);
        assert_eq!(view.find("5.2").and_then(|v| v.zip_url.as_deref()), Some("https://x/y.zip"));
        assert!(load_versions_cache(&store).expect("cache").is_some());

        let again = load_library(&client, &mut http, &store, &mut probe).expect("reload");
        assert!(again.from_cache);
        assert_eq!(http.count(&settings.manifest_url), 1);
    }

    #[test]
    fn cached_list_is_used_even_when_offline() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        save_versions_cache(
            &store,
            &[VersionDescriptor::metadata_only("4.2", "https://docs.test/en/4.2/")],
        )
        .expect("seed");

        let view = load_library(
            &ManifestClient::new(&settings()),
            &mut MockHttp::default(),
            &store,
            &mut FixedConnectivity(Connectivity::offline()),
        )
        .expect("load");
        assert!(view.from_cache);
        assert!(!view.needs_internet);
        assert_eq!(view.versions.len(), 1);
    }

    #[test]
    fn refresh_picks_up_new_downloads_and_cache() {
        let temp = tempdir().expect("tempdir");
        let store = open_store(temp.path());
        let client = ManifestClient::new(&settings());
        let view = load_library(
            &client,
            &mut MockHttp::default(),
            &store,
            &mut FixedConnectivity(Connectivity::offline()),
        )
        .expect("load");
        assert!(view.is_empty());

        record_download(&store, "5.2", entry()).expect("record");
        let refreshed = refresh_library(&store, &view).expect("refresh");
        assert!(refreshed.downloaded.contains_key("5.2"));
        assert!(refreshed.needs_internet);

        save_versions_cache(
            &store,
            &[VersionDescriptor::metadata_only("5.2", "https://docs.test/en/5.2/")],
        )
        .expect("seed");
        let refreshed = refresh_library(&store, &refreshed).expect("refresh");
        assert!(refreshed.from_cache);
        assert!(!refreshed.needs_internet);
        assert_eq!(refreshed.rows()[0].slug, "5.2");
    }

    #[test]
    fn synthesized_versions_follow_slug_order() {
        let mut downloaded = DownloadedMap::new();
        for slug in ["4.2", "dev", "5.2"] {
            downloaded.insert(slug.to_string(), entry());
        }
        let slugs: Vec<_> = synthesize_offline_versions(&settings(), &downloaded)
            .into_iter()
            .map(|v| v.slug)
            .collect();
        assert_eq!(slugs, vec!["dev", "5.2", "4.2"]);
    }
}
