use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use regex::Regex;

use crate::error::Notice;

pub const CONFIG_FILENAME: &str = "config.toml";
pub const DB_FILENAME: &str = "docshelf.db";

static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("slug regex"));

pub const NO_MIGRATIONS_POLICY_MESSAGE: &str =
    "Stored state is keyed by schema version; older keys are abandoned, never migrated.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub home: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub platform_data_dir: Option<PathBuf>,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let platform_data_dir = ProjectDirs::from("org", "docshelf", "docshelf")
            .map(|dirs| dirs.data_dir().to_path_buf());
        Ok(Self {
            cwd,
            platform_data_dir,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub home_dir: PathBuf,
    pub docs_root: PathBuf,
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub home_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    /// Layout rooted at `home` with default sources, used by tests and embedders.
    pub fn under(home: &Path) -> Self {
        let data_dir = home.join("data");
        Self {
            home_dir: home.to_path_buf(),
            docs_root: home.join("docs"),
            db_path: data_dir.join(DB_FILENAME),
            data_dir,
            config_path: home.join(CONFIG_FILENAME),
            home_source: ValueSource::Default,
            config_source: ValueSource::Default,
        }
    }

    /// Directory a version's bundle is unpacked into. Slugs arrive from the
    /// remote manifest and the command line, so anything that is not a
    /// single plain name is rejected before it touches the filesystem.
    pub fn version_dir(&self, slug: &str) -> Result<PathBuf> {
        validate_slug(slug)?;
        Ok(self.docs_root.join(slug))
    }

    pub fn diagnostics(&self) -> String {
        format!(
            "home_dir={} ({})\ndocs_root={}\ndata_dir={}\ndb_path={}\nconfig_path={} ({})\npolicy={}",
            normalize_for_display(&self.home_dir),
            self.home_source.as_str(),
            normalize_for_display(&self.docs_root),
            normalize_for_display(&self.data_dir),
            normalize_for_display(&self.db_path),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
            NO_MIGRATIONS_POLICY_MESSAGE
        )
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub home_exists: bool,
    pub docs_root_exists: bool,
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let home_exists = paths.home_dir.exists();
    let docs_root_exists = paths.docs_root.exists();
    let config_exists = paths.config_path.exists();
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !docs_root_exists {
        warnings.push("docs/ is missing; no version has been downloaded yet".to_string());
    }
    if !db_exists {
        warnings.push("state database is missing; run `docshelf init` or `docshelf versions`".to_string());
    }

    Ok(RuntimeStatus {
        home_exists,
        docs_root_exists,
        db_exists,
        db_size_bytes,
        config_exists,
        warnings,
    })
}

#[derive(Debug, Clone)]
pub struct InitOptions {
    pub materialize_config: bool,
    pub force: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            materialize_config: true,
            force: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub created_dirs: Vec<PathBuf>,
    pub wrote_config: bool,
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (home_dir, home_source) = if let Some(path) = overrides.home.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = lookup_env("DOCSHELF_HOME").filter(|value| !value.trim().is_empty())
    {
        (
            absolutize(Path::new(value.trim()), &context.cwd),
            ValueSource::Env,
        )
    } else if let Some(dir) = context.platform_data_dir.as_deref() {
        (dir.to_path_buf(), ValueSource::Default)
    } else {
        (context.cwd.join(".docshelf"), ValueSource::Default)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &home_dir), ValueSource::Flag)
    } else if let Some(value) =
        lookup_env("DOCSHELF_CONFIG").filter(|value| !value.trim().is_empty())
    {
        (
            absolutize(Path::new(value.trim()), &home_dir),
            ValueSource::Env,
        )
    } else {
        (home_dir.join(CONFIG_FILENAME), ValueSource::Default)
    };

    let mut paths = ResolvedPaths::under(&home_dir);
    paths.home_source = home_source;
    paths.config_path = config_path;
    paths.config_source = config_source;
    Ok(paths)
}

pub fn init_layout(paths: &ResolvedPaths, options: &InitOptions) -> Result<InitReport> {
    let mut created_dirs = Vec::new();
    for dir in [&paths.home_dir, &paths.docs_root, &paths.data_dir] {
        if !dir.exists() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
            created_dirs.push(dir.clone());
        }
    }

    let wrote_config = if options.materialize_config {
        write_text_file(&paths.config_path, &render_materialized_config(), options.force)?
    } else {
        false
    };

    Ok(InitReport {
        created_dirs,
        wrote_config,
    })
}

pub fn render_materialized_config() -> String {
    format!(
        "# docshelf configuration (materialized by `docshelf init`)\n# Environment variables DOCSHELF_* override these values.\n\n[sources]\n# manifest_url = \"{}\"\n# docs_home = \"{}\"\n# archive_url_template = \"{}\"\n\n[http]\n# user_agent = \"{}\"\n# timeout_ms = {}\n# download_timeout_ms = {}\n\n[sync]\n# min_interval_secs = {}\n",
        crate::config::DEFAULT_MANIFEST_URL,
        crate::config::DEFAULT_DOCS_HOME,
        crate::config::DEFAULT_ARCHIVE_URL_TEMPLATE,
        crate::config::DEFAULT_USER_AGENT,
        crate::config::DEFAULT_TIMEOUT_MS,
        crate::config::DEFAULT_DOWNLOAD_TIMEOUT_MS,
        crate::config::DEFAULT_SYNC_INTERVAL_SECS,
    )
}

pub fn validate_slug(slug: &str) -> Result<()> {
    if SLUG_RE.is_match(slug) {
        Ok(())
    } else {
        Err(Notice::InvalidSlug {
            slug: slug.to_string(),
        }
        .into())
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn write_text_file(path: &Path, content: &str, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }

    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create parent directory {}", parent.display()))?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tempfile::tempdir;

    use super::*;

    fn context(cwd: &Path, platform: Option<&Path>) -> ResolutionContext {
        ResolutionContext {
            cwd: cwd.to_path_buf(),
            platform_data_dir: platform.map(Path::to_path_buf),
        }
    }

    fn lookup(values: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: BTreeMap<String, String> = values
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn flag_wins_over_env_and_platform_dir() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path();
        let paths = resolve_paths_with_lookup(
            &context(cwd, Some(&cwd.join("platform"))),
            &PathOverrides {
                home: Some(PathBuf::from("flagged")),
                config: None,
            },
            lookup(&[("DOCSHELF_HOME", "/from/env")]),
        )
        .expect("resolve");

        assert_eq!(paths.home_dir, cwd.join("flagged"));
        assert_eq!(paths.home_source, ValueSource::Flag);
        assert_eq!(paths.docs_root, cwd.join("flagged").join("docs"));
        assert_eq!(
            paths.db_path,
            cwd.join("flagged").join("data").join(DB_FILENAME)
        );
    }

    #[test]
    fn env_home_and_config_resolve_relative_paths() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path();
        let paths = resolve_paths_with_lookup(
            &context(cwd, None),
            &PathOverrides::default(),
            lookup(&[("DOCSHELF_HOME", " shelf "), ("DOCSHELF_CONFIG", "alt.toml")]),
        )
        .expect("resolve");

        assert_eq!(paths.home_dir, cwd.join("shelf"));
        assert_eq!(paths.home_source, ValueSource::Env);
        assert_eq!(paths.config_path, cwd.join("shelf").join("alt.toml"));
        assert_eq!(paths.config_source, ValueSource::Env);
    }

    #[test]
    fn falls_back_to_platform_dir_then_cwd() {
        let temp = tempdir().expect("tempdir");
        let cwd = temp.path();
        let platform = cwd.join("platform");

        let with_platform =
            resolve_paths_with_lookup(&context(cwd, Some(&platform)), &PathOverrides::default(), lookup(&[]))
                .expect("resolve");
        assert_eq!(with_platform.home_dir, platform);
        assert_eq!(with_platform.home_source, ValueSource::Default);

        let without_platform =
            resolve_paths_with_lookup(&context(cwd, None), &PathOverrides::default(), lookup(&[]))
                .expect("resolve");
        assert_eq!(without_platform.home_dir, cwd.join(".docshelf"));
    }

    #[test]
    fn init_layout_creates_dirs_and_keeps_existing_config() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::under(&temp.path().join("home"));

        let first = init_layout(&paths, &InitOptions::default()).expect("init");
        assert_eq!(first.created_dirs.len(), 3);
        assert!(first.wrote_config);
        assert!(paths.docs_root.is_dir());
        assert!(paths.data_dir.is_dir());

        fs::write(&paths.config_path, "[sync]\nmin_interval_secs = 5\n").expect("write config");
        let second = init_layout(&paths, &InitOptions::default()).expect("init again");
        assert!(second.created_dirs.is_empty());
        assert!(!second.wrote_config);
        let content = fs::read_to_string(&paths.config_path).expect("read config");
        assert!(content.contains("min_interval_secs = 5"));
    }

    #[test]
    fn materialized_config_parses_as_empty_config() {
        let parsed: crate::config::ShelfConfig =
            toml::from_str(&render_materialized_config()).expect("parse");
        assert_eq!(parsed, crate::config::ShelfConfig::default());
    }

    #[test]
    fn version_dir_stays_under_docs_root() {
        let paths = ResolvedPaths::under(Path::new("/shelf"));
        for slug in ["5.2", "dev", "4.2-lts", "v1_0"] {
            let dir = paths.version_dir(slug).expect("valid slug");
            assert_eq!(dir, paths.docs_root.join(slug));
        }
        for slug in ["", "..", ".", "../escaped", "a/b", "a\\b", "/abs", ".hidden", "5.2 "] {
            let error = paths.version_dir(slug).expect_err(slug);
            assert_eq!(
                crate::error::notice_of(&error),
                Some(&Notice::InvalidSlug {
                    slug: slug.to_string()
                })
            );
        }
    }

    #[test]
    fn inspect_runtime_warns_on_missing_layout() {
        let temp = tempdir().expect("tempdir");
        let paths = ResolvedPaths::under(&temp.path().join("missing"));
        let status = inspect_runtime(&paths).expect("inspect");
        assert!(!status.home_exists);
        assert!(!status.db_exists);
        assert_eq!(status.db_size_bytes, None);
        assert_eq!(status.warnings.len(), 2);
    }
}
