use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Notice {
    #[error("You're offline. Connect to the internet to {action}.")]
    Offline { action: String },

    #[error("No offline zip found for \"{slug}\".")]
    ArchiveNotAvailable { slug: String },

    #[error("index.html not found under {}", dir.display())]
    EntryHtmlNotFound { dir: PathBuf },

    #[error("Download failed: HTTP {status}")]
    DownloadFailed { status: u16 },

    #[error("Version \"{slug}\" is not downloaded yet.")]
    NotDownloaded { slug: String },

    #[error("This offline package for \"{slug}\" did not include search.html.")]
    SearchPageMissing { slug: String },

    #[error("\"{slug}\" is not a valid version name.")]
    InvalidSlug { slug: String },
}

impl Notice {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Offline { .. } => "Offline",
            Self::ArchiveNotAvailable { .. } => "Not available",
            Self::EntryHtmlNotFound { .. } | Self::DownloadFailed { .. } => "Download error",
            Self::NotDownloaded { .. } => "Not downloaded",
            Self::SearchPageMissing { .. } => "Search not found",
            Self::InvalidSlug { .. } => "Invalid version",
        }
    }
}

/// Returns the notice carried by `error`, if it is an expected failure.
pub fn notice_of(error: &anyhow::Error) -> Option<&Notice> {
    error.downcast_ref::<Notice>()
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn notice_survives_added_context() {
        let result: anyhow::Result<()> = Err(Notice::DownloadFailed { status: 500 }.into());
        let error = result.context("acquire 5.2").expect_err("must fail");
        assert_eq!(
            notice_of(&error),
            Some(&Notice::DownloadFailed { status: 500 })
        );
    }

    #[test]
    fn plain_errors_are_not_notices() {
        let error = anyhow::anyhow!("disk full");
        assert!(notice_of(&error).is_none());
    }

    #[test]
    fn messages_are_human_readable() {
        let notice = Notice::ArchiveNotAvailable {
            slug: "dev".to_string(),
        };
        assert_eq!(notice.to_string(), "No offline zip found for \"dev\".");
        assert_eq!(notice.title(), "Not available");
    }
}
