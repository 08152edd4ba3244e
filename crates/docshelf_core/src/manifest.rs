use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::http::HttpTransport;

static VERSION_LINK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/en/([a-z0-9.\-]+)/").expect("version link regex"));
static RELEASE_SLUG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)$").expect("release slug regex"));
static ARCHIVE_LINK_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^"'\s<>]+?\.zip"#).expect("archive link regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionDescriptor {
    pub slug: String,
    pub page_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<String>,
}

impl VersionDescriptor {
    /// A descriptor with no archive provenance, as produced by scraping or
    /// synthesized from the downloaded map.
    pub fn metadata_only(slug: &str, page_url: &str) -> Self {
        Self {
            slug: slug.to_string(),
            page_url: page_url.to_string(),
            zip_url: None,
            sha: None,
            r#ref: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub generated_at: Option<String>,
    #[serde(default)]
    pub release_tag: Option<String>,
    #[serde(default)]
    pub manifest_url: Option<String>,
    #[serde(default)]
    pub versions: Vec<VersionDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveMetadata {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// One way of listing versions. Providers are ranked; the first non-empty
/// answer wins.
pub trait VersionProvider: Send {
    fn name(&self) -> &'static str;
    fn fetch_versions(&self, http: &mut dyn HttpTransport) -> Result<Vec<VersionDescriptor>>;
}

pub struct ManifestProvider {
    manifest_url: String,
}

impl ManifestProvider {
    pub fn new(manifest_url: &str) -> Self {
        Self {
            manifest_url: manifest_url.to_string(),
        }
    }

    pub fn fetch_manifest(&self, http: &mut dyn HttpTransport) -> Result<Manifest> {
        let response = http.get_text(&self.manifest_url)?;
        if !response.is_success() {
            bail!("manifest request failed with HTTP {}", response.status);
        }
        serde_json::from_str(&response.body)
            .with_context(|| format!("failed to parse manifest from {}", self.manifest_url))
    }
}

impl VersionProvider for ManifestProvider {
    fn name(&self) -> &'static str {
        "manifest"
    }

    fn fetch_versions(&self, http: &mut dyn HttpTransport) -> Result<Vec<VersionDescriptor>> {
        Ok(self.fetch_manifest(http)?.versions)
    }
}

pub struct ScrapeProvider {
    settings: Settings,
}

impl ScrapeProvider {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
        }
    }
}

impl VersionProvider for ScrapeProvider {
    fn name(&self) -> &'static str {
        "scrape"
    }

    fn fetch_versions(&self, http: &mut dyn HttpTransport) -> Result<Vec<VersionDescriptor>> {
        let response = http.get_text(&self.settings.docs_home)?;
        if !response.is_success() {
            bail!("docs landing page request failed with HTTP {}", response.status);
        }
        Ok(scrape_version_slugs(&response.body)
            .into_iter()
            .map(|slug| VersionDescriptor::metadata_only(&slug, &self.settings.page_url(&slug)))
            .collect())
    }
}

pub struct ManifestClient {
    settings: Settings,
    manifest: ManifestProvider,
    providers: Vec<Box<dyn VersionProvider>>,
}

impl ManifestClient {
    pub fn new(settings: &Settings) -> Self {
        let providers: Vec<Box<dyn VersionProvider>> = vec![
            Box::new(ManifestProvider::new(&settings.manifest_url)),
            Box::new(ScrapeProvider::new(settings)),
        ];
        Self::with_providers(settings, providers)
    }

    pub fn with_providers(settings: &Settings, providers: Vec<Box<dyn VersionProvider>>) -> Self {
        Self {
            settings: settings.clone(),
            manifest: ManifestProvider::new(&settings.manifest_url),
            providers,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn fetch_versions(&self, http: &mut dyn HttpTransport) -> Result<Vec<VersionDescriptor>> {
        let mut last_error = None;
        for provider in &self.providers {
            match provider.fetch_versions(http) {
                Ok(versions) if !versions.is_empty() => {
                    debug!(provider = provider.name(), count = versions.len(), "fetched versions");
                    return Ok(versions);
                }
                Ok(_) => debug!(provider = provider.name(), "provider returned no versions"),
                Err(error) => {
                    debug!(provider = provider.name(), error = %error, "provider failed");
                    last_error = Some(error.context(format!("{} provider failed", provider.name())));
                }
            }
        }
        match last_error {
            Some(error) => Err(error),
            None => Ok(Vec::new()),
        }
    }

    /// Manifest `zipUrl`, else first zip link on the version page, else the
    /// conventional URL for `<major>.<minor>` slugs. `None` is expected for
    /// rolling builds.
    pub fn fetch_archive_url(
        &self,
        http: &mut dyn HttpTransport,
        slug: &str,
    ) -> Result<Option<String>> {
        match self.manifest.fetch_manifest(http) {
            Ok(manifest) => {
                if let Some(zip_url) = manifest
                    .versions
                    .into_iter()
                    .find(|version| version.slug == slug)
                    .and_then(|version| version.zip_url)
                {
                    return Ok(Some(zip_url));
                }
            }
            Err(error) => debug!(slug, error = %error, "manifest lookup for archive failed"),
        }

        let page_url = self.settings.page_url(slug);
        let response = http.get_text(&page_url)?;
        if response.is_success() {
            if let Some(link) = first_archive_link(&response.body) {
                return Ok(Some(link));
            }
        } else {
            warn!(slug, status = response.status, "version page request failed");
        }

        if is_release_slug(slug) {
            return Ok(Some(self.settings.conventional_archive_url(slug)));
        }
        Ok(None)
    }

    pub fn fetch_archive_metadata(
        &self,
        http: &mut dyn HttpTransport,
        url: &str,
    ) -> Result<ArchiveMetadata> {
        let response = http.head(url)?;
        if !(200..300).contains(&response.status) {
            bail!("HEAD failed ({})", response.status);
        }
        Ok(ArchiveMetadata {
            etag: response.etag,
            last_modified: response.last_modified,
        })
    }
}

pub fn scrape_version_slugs(html: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut slugs: Vec<String> = VERSION_LINK_REGEX
        .captures_iter(html)
        .filter_map(|captures| captures.get(1))
        .map(|slug| slug.as_str().to_ascii_lowercase())
        .filter(|slug| slug == "dev" || is_release_slug(slug))
        .filter(|slug| seen.insert(slug.clone()))
        .collect();
    slugs.sort_by(|a, b| compare_slugs(a, b));
    slugs
}

/// `dev` first, then releases newest first, then anything else by name.
pub fn compare_slugs(a: &str, b: &str) -> Ordering {
    fn rank(slug: &str) -> (u8, u64, u64) {
        if slug == "dev" {
            return (0, 0, 0);
        }
        match release_numbers(slug) {
            Some((major, minor)) => (1, u64::MAX - major, u64::MAX - minor),
            None => (2, 0, 0),
        }
    }
    rank(a).cmp(&rank(b)).then_with(|| a.cmp(b))
}

pub fn is_release_slug(slug: &str) -> bool {
    release_numbers(slug).is_some()
}

fn release_numbers(slug: &str) -> Option<(u64, u64)> {
    let captures = RELEASE_SLUG_REGEX.captures(slug)?;
    let major = captures.get(1)?.as_str().parse().ok()?;
    let minor = captures.get(2)?.as_str().parse().ok()?;
    Some((major, minor))
}

pub fn first_archive_link(html: &str) -> Option<String> {
    ARCHIVE_LINK_REGEX
        .find(html)
        .map(|found| found.as_str().to_string())
}
