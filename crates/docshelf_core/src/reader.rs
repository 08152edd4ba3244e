use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::acquire::find_search_html;
use crate::error::Notice;
use crate::runtime::{ResolvedPaths, normalize_for_display};
use crate::store::{KeyValueStore, keys, load_downloaded_map, load_json, save_json, unix_millis};

pub const MAX_BOOKMARKS: usize = 200;

/// A saved page. The URL doubles as the identity, so bookmarking the same
/// page twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bookmark {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: u64,
}

impl Bookmark {
    pub fn new(url: &str, title: Option<&str>) -> Result<Self> {
        Ok(Self {
            id: url.to_string(),
            url: url.to_string(),
            title: title
                .map(str::trim)
                .filter(|title| !title.is_empty())
                .map(str::to_string),
            created_at: unix_millis()?,
        })
    }

    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

pub struct DocumentState<'a> {
    store: &'a dyn KeyValueStore,
}

impl<'a> DocumentState<'a> {
    pub fn new(store: &'a dyn KeyValueStore) -> Self {
        Self { store }
    }

    pub fn last_url(&self, slug: &str) -> Result<Option<String>> {
        load_json(self.store, &keys::last_url(slug))
    }

    pub fn set_last_url(&self, slug: &str, url: &str) -> Result<()> {
        save_json(self.store, &keys::last_url(slug), &url)
    }

    pub fn bookmarks(&self, slug: &str) -> Result<Vec<Bookmark>> {
        Ok(load_json(self.store, &keys::bookmarks(slug))?.unwrap_or_default())
    }

    pub fn add_bookmark(&self, slug: &str, bookmark: Bookmark) -> Result<bool> {
        let mut list = self.bookmarks(slug)?;
        if list.iter().any(|existing| existing.id == bookmark.id) {
            return Ok(false);
        }
        list.insert(0, bookmark);
        list.truncate(MAX_BOOKMARKS);
        save_json(self.store, &keys::bookmarks(slug), &list)?;
        Ok(true)
    }

    pub fn remove_bookmark(&self, slug: &str, id: &str) -> Result<bool> {
        let mut list = self.bookmarks(slug)?;
        let before = list.len();
        list.retain(|bookmark| bookmark.id != id);
        if list.len() == before {
            return Ok(false);
        }
        save_json(self.store, &keys::bookmarks(slug), &list)?;
        Ok(true)
    }

    pub fn is_bookmarked(&self, slug: &str, id: &str) -> Result<bool> {
        Ok(self.bookmarks(slug)?.iter().any(|bookmark| bookmark.id == id))
    }

    pub fn bookmarked_slugs(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .keys_with_prefix(keys::BOOKMARKS_PREFIX)?
            .into_iter()
            .filter_map(|key| key.strip_prefix(keys::BOOKMARKS_PREFIX).map(str::to_string))
            .collect())
    }
}

pub fn file_url(path: &Path) -> String {
    format!("file://{}", normalize_for_display(path))
}

pub struct ReaderSession<'a> {
    state: DocumentState<'a>,
    slug: String,
    index_path: PathBuf,
    version_dir: PathBuf,
    current_url: String,
    page_title: Option<String>,
}

impl<'a> ReaderSession<'a> {
    /// Start URL is `open_url` if given, else the stored last URL, else the
    /// bundle's entry page.
    pub fn open(
        paths: &ResolvedPaths,
        store: &'a dyn KeyValueStore,
        slug: &str,
        open_url: Option<&str>,
    ) -> Result<Self> {
        let version_dir = paths.version_dir(slug)?;
        let downloaded = load_downloaded_map(store)?;
        let entry = downloaded.get(slug).ok_or_else(|| Notice::NotDownloaded {
            slug: slug.to_string(),
        })?;
        let state = DocumentState::new(store);
        let index_path = PathBuf::from(&entry.index_path);
        let home_url = file_url(&index_path);

        let current_url = match open_url {
            Some(url) => url.to_string(),
            None => match state.last_url(slug) {
                Ok(last) => last.unwrap_or(home_url),
                Err(error) => {
                    warn!(slug, "failed to read last url: {error:#}");
                    home_url
                }
            },
        };

        Ok(Self {
            state,
            slug: slug.to_string(),
            index_path,
            version_dir,
            current_url,
            page_title: None,
        })
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn current_url(&self) -> &str {
        &self.current_url
    }

    pub fn page_title(&self) -> Option<&str> {
        self.page_title.as_deref()
    }

    pub fn home_url(&self) -> String {
        file_url(&self.index_path)
    }

    pub fn navigate(&mut self, url: &str) {
        self.current_url = url.to_string();
        self.page_title = None;
        if let Err(error) = self.state.set_last_url(&self.slug, url) {
            warn!(slug = %self.slug, "failed to store last url: {error:#}");
        }
    }

    pub fn record_title(&mut self, title: &str) {
        let title = title.trim();
        self.page_title = (!title.is_empty()).then(|| title.to_string());
    }

    pub fn go_home(&mut self) {
        let home = self.home_url();
        self.navigate(&home);
    }

    pub fn open_search(&mut self) -> Result<String> {
        let search = find_search_html(&self.version_dir)?.ok_or_else(|| {
            Notice::SearchPageMissing {
                slug: self.slug.clone(),
            }
        })?;
        let url = file_url(&search);
        self.navigate(&url);
        Ok(url)
    }

    pub fn is_bookmarked(&self) -> Result<bool> {
        self.state.is_bookmarked(&self.slug, &self.current_url)
    }

    /// Adds or removes the current page. Returns whether it is bookmarked now.
    pub fn toggle_bookmark(&mut self) -> Result<bool> {
        if self.is_bookmarked()? {
            self.state.remove_bookmark(&self.slug, &self.current_url)?;
            Ok(false)
        } else {
            let bookmark = Bookmark::new(&self.current_url, self.page_title.as_deref())?;
            self.state.add_bookmark(&self.slug, bookmark)?;
            Ok(true)
        }
    }
}
