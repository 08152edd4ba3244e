use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::ZipArchive;

use crate::error::Notice;
use crate::http::HttpTransport;
use crate::manifest::{ArchiveMetadata, ManifestClient, VersionDescriptor};
use crate::runtime::{ResolvedPaths, normalize_for_display};
use crate::store::{DownloadedEntry, KeyValueStore, record_download, unix_millis};

pub const ARCHIVE_FILENAME: &str = "docs.zip";
pub const ENTRY_HTML: &str = "index.html";
pub const SEARCH_HTML: &str = "search.html";

/// Downloads, unpacks, and registers one version's bundle.
///
/// Every step must succeed before the next runs. The downloaded map is only
/// written as the final step, so a failed acquisition leaves it untouched.
/// The archive file is removed on failure; an unpacked partial bundle is not.
pub fn acquire(
    paths: &ResolvedPaths,
    client: &ManifestClient,
    http: &mut dyn HttpTransport,
    store: &dyn KeyValueStore,
    descriptor: &VersionDescriptor,
    progress: &mut dyn FnMut(f64),
) -> Result<DownloadedEntry> {
    let slug = descriptor.slug.as_str();
    let version_dir = paths.version_dir(slug)?;

    let zip_url = match descriptor.zip_url.clone() {
        Some(url) => url,
        None => client
            .fetch_archive_url(http, slug)
            .with_context(|| format!("failed to resolve archive for {slug}"))?
            .ok_or_else(|| Notice::ArchiveNotAvailable {
                slug: slug.to_string(),
            })?,
    };
    debug!(slug, %zip_url, "resolved archive url");

    let metadata = client
        .fetch_archive_metadata(http, &zip_url)
        .unwrap_or_else(|error| {
            debug!(slug, "archive metadata unavailable: {error:#}");
            ArchiveMetadata::default()
        });

    fs::create_dir_all(&version_dir)
        .with_context(|| format!("failed to create {}", version_dir.display()))?;
    let archive_path = version_dir.join(ARCHIVE_FILENAME);

    let unpacked = download_and_unpack(http, &zip_url, &archive_path, &version_dir, progress);
    let archive_sha256 = match unpacked {
        Ok(digest) => digest,
        Err(error) => {
            discard_archive(&archive_path);
            return Err(error).with_context(|| format!("failed to acquire {slug}"));
        }
    };
    discard_archive(&archive_path);

    let index_path = find_entry_html(&version_dir)?.ok_or_else(|| Notice::EntryHtmlNotFound {
        dir: version_dir.clone(),
    })?;

    let entry = DownloadedEntry {
        index_path: normalize_for_display(&index_path),
        downloaded_at: unix_millis()?,
        zip_url: Some(zip_url),
        etag: metadata.etag,
        last_modified: metadata.last_modified,
        sha: descriptor.sha.clone(),
        r#ref: descriptor.r#ref.clone(),
        archive_sha256,
    };
    record_download(store, slug, entry.clone())?;
    info!(slug, index_path = %entry.index_path, "version downloaded");
    Ok(entry)
}

fn download_and_unpack(
    http: &mut dyn HttpTransport,
    zip_url: &str,
    archive_path: &Path,
    version_dir: &Path,
    progress: &mut dyn FnMut(f64),
) -> Result<Option<String>> {
    let report = http.download_to_file(zip_url, archive_path, progress)?;
    if !report.is_success() {
        return Err(Notice::DownloadFailed {
            status: report.status,
        }
        .into());
    }
    debug!(bytes = report.bytes_written, "archive downloaded");

    let digest = match sha256_file(archive_path) {
        Ok(digest) => Some(digest),
        Err(error) => {
            warn!("failed to hash {}: {error:#}", archive_path.display());
            None
        }
    };
    extract_archive(archive_path, version_dir)?;
    Ok(digest)
}

pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive_path)
        .with_context(|| format!("failed to open {}", archive_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("failed to read zip {}", archive_path.display()))?;
    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    archive
        .extract(dest)
        .with_context(|| format!("failed to extract into {}", dest.display()))?;
    debug!(files = archive.len(), dest = %dest.display(), "archive extracted");
    Ok(())
}

/// `index.html` at the bundle root, else in one of its immediate subdirectories.
pub fn find_entry_html(root: &Path) -> Result<Option<PathBuf>> {
    find_in_bundle(root, ENTRY_HTML)
}

pub fn find_search_html(root: &Path) -> Result<Option<PathBuf>> {
    find_in_bundle(root, SEARCH_HTML)
}

fn find_in_bundle(root: &Path, filename: &str) -> Result<Option<PathBuf>> {
    let direct = root.join(filename);
    if direct.is_file() {
        return Ok(Some(direct));
    }

    let mut subdirs = Vec::new();
    for item in fs::read_dir(root).with_context(|| format!("failed to list {}", root.display()))? {
        let item = item.with_context(|| format!("failed to list {}", root.display()))?;
        if item.path().is_dir() {
            subdirs.push(item.path());
        }
    }
    subdirs.sort();
    Ok(subdirs
        .into_iter()
        .map(|dir| dir.join(filename))
        .find(|candidate| candidate.is_file()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BundleStats {
    pub files: usize,
    pub bytes: u64,
}

pub fn bundle_stats(dir: &Path) -> Result<BundleStats> {
    let mut stats = BundleStats::default();
    if !dir.exists() {
        return Ok(stats);
    }
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
        if entry.file_type().is_file() {
            stats.files += 1;
            stats.bytes += entry
                .metadata()
                .with_context(|| format!("failed to inspect {}", entry.path().display()))?
                .len();
        }
    }
    Ok(stats)
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let digest = hasher.finalize();
    let mut output = String::with_capacity(64);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    Ok(output)
}

fn discard_archive(path: &Path) {
    if let Err(error) = fs::remove_file(path)
        && error.kind() != io::ErrorKind::NotFound
    {
        debug!("failed to remove {}: {error}", path.display());
    }
}
