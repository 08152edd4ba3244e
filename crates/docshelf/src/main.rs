use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use docshelf_core::acquire::{acquire, bundle_stats};
use docshelf_core::config::{Settings, load_config};
use docshelf_core::error::{Notice, notice_of};
use docshelf_core::http::ReqwestTransport;
use docshelf_core::library::{LibraryView, load_library, refresh_library};
use docshelf_core::manifest::{ManifestClient, VersionDescriptor};
use docshelf_core::reader::{Bookmark, DocumentState, ReaderSession};
use docshelf_core::runtime::{
    InitOptions, NO_MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    init_layout, inspect_runtime, normalize_for_display, resolve_paths,
};
use docshelf_core::store::{SqliteStore, load_downloaded_map};
use docshelf_core::sync::{
    Connectivity, ConnectivityMonitor, ConnectivityProbe, FixedConnectivity, SyncCoordinator,
    SyncOutcome, TcpProbe,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(
    name = "docshelf",
    version,
    about = "Offline documentation shelf: list, download, and read versioned doc bundles"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    home: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[arg(long, global = true, help = "Behave as if there were no network")]
    offline: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    home: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
    offline: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            home: cli.home.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
            offline: cli.offline,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    #[command(about = "Show resolved paths, settings, and downloaded versions")]
    Status,
    #[command(about = "List available versions (cache first, network on first run)")]
    Versions(VersionsArgs),
    #[command(about = "Refresh the cached version list now")]
    Sync,
    #[command(about = "Watch connectivity and refresh the version list when it comes back")]
    Watch(WatchArgs),
    #[command(about = "Download and unpack one version")]
    Download(DownloadArgs),
    #[command(about = "Resolve the page to render for a downloaded version")]
    Open(OpenArgs),
    #[command(about = "Record a page the renderer displayed")]
    Visit(VisitArgs),
    #[command(about = "Go back to the version's entry page")]
    Home(SlugArgs),
    #[command(about = "Open the version's search page")]
    Search(SlugArgs),
    Bookmarks(BookmarksArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct VersionsArgs {
    #[arg(long, help = "Skip the background refresh after listing")]
    no_sync: bool,
    #[arg(long, help = "Print the library view as JSON, after any refresh")]
    json: bool,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[arg(long, default_value_t = 5, value_name = "SECS")]
    poll_secs: u64,
    #[arg(long, value_name = "N", help = "Stop after N connectivity polls")]
    max_polls: Option<u64>,
}

#[derive(Debug, Args)]
struct DownloadArgs {
    slug: String,
}

#[derive(Debug, Args)]
struct OpenArgs {
    slug: String,
    #[arg(long, help = "Open this URL instead of the last viewed page")]
    url: Option<String>,
}

#[derive(Debug, Args)]
struct VisitArgs {
    slug: String,
    url: String,
    #[arg(long)]
    title: Option<String>,
}

#[derive(Debug, Args)]
struct SlugArgs {
    slug: String,
}

#[derive(Debug, Args)]
struct BookmarksArgs {
    #[command(subcommand)]
    command: BookmarksSubcommand,
}

#[derive(Debug, Subcommand)]
enum BookmarksSubcommand {
    List {
        slug: Option<String>,
    },
    Add {
        slug: String,
        url: String,
        #[arg(long)]
        title: Option<String>,
    },
    Remove {
        slug: String,
        url: String,
    },
    #[command(about = "Bookmark or un-bookmark the last viewed page")]
    Toggle {
        slug: String,
        #[arg(long)]
        title: Option<String>,
    },
}

struct Shelf {
    paths: ResolvedPaths,
    settings: Settings,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    let result = match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Versions(args)) => run_versions(&runtime, args),
        Some(Commands::Sync) => run_sync(&runtime),
        Some(Commands::Watch(args)) => run_watch(&runtime, args),
        Some(Commands::Download(DownloadArgs { slug })) => run_download(&runtime, &slug),
        Some(Commands::Open(OpenArgs { slug, url })) => run_open(&runtime, &slug, url.as_deref()),
        Some(Commands::Visit(VisitArgs { slug, url, title })) => {
            run_visit(&runtime, &slug, &url, title.as_deref())
        }
        Some(Commands::Home(SlugArgs { slug })) => run_home(&runtime, &slug),
        Some(Commands::Search(SlugArgs { slug })) => run_search(&runtime, &slug),
        Some(Commands::Bookmarks(BookmarksArgs { command })) => match command {
            BookmarksSubcommand::List { slug } => run_bookmarks_list(&runtime, slug.as_deref()),
            BookmarksSubcommand::Add { slug, url, title } => {
                run_bookmarks_add(&runtime, &slug, &url, title.as_deref())
            }
            BookmarksSubcommand::Remove { slug, url } => {
                run_bookmarks_remove(&runtime, &slug, &url)
            }
            BookmarksSubcommand::Toggle { slug, title } => {
                run_bookmarks_toggle(&runtime, &slug, title.as_deref())
            }
        },
        None => {
            let mut command = Cli::command();
            command
                .print_help()
                .map(|()| println!())
                .map_err(anyhow::Error::from)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => match notice_of(&error) {
            Some(notice) => {
                eprintln!("{}: {notice}", notice.title());
                ExitCode::from(2)
            }
            None => {
                eprintln!("error: {error:#}");
                ExitCode::FAILURE
            }
        },
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "docshelf=debug,docshelf_core=debug,info"
    } else {
        "docshelf=info,docshelf_core=info,warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;
    SqliteStore::open(&paths)?;

    println!("Initialized docshelf home");
    println!("home_dir: {}", normalize_for_display(&paths.home_dir));
    println!("docs_root: {}", normalize_for_display(&paths.docs_root));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let paths = &shelf.paths;
    let status = inspect_runtime(paths)?;

    println!("runtime status");
    println!(
        "home_dir: {} ({})",
        normalize_for_display(&paths.home_dir),
        paths.home_source.as_str()
    );
    println!("home_exists: {}", format_flag(status.home_exists));
    println!("docs_root_exists: {}", format_flag(status.docs_root_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!(
        "config_path: {} ({})",
        normalize_for_display(&paths.config_path),
        paths.config_source.as_str()
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("settings.manifest_url: {}", shelf.settings.manifest_url);
    println!("settings.docs_home: {}", shelf.settings.docs_home);
    println!(
        "settings.archive_url_template: {}",
        shelf.settings.archive_url_template
    );
    println!("settings.timeout_ms: {}", shelf.settings.timeout_ms);
    println!(
        "settings.download_timeout_ms: {}",
        shelf.settings.download_timeout_ms
    );
    println!(
        "settings.sync_interval_secs: {}",
        shelf.settings.sync_interval.as_secs()
    );

    if status.db_exists {
        let store = SqliteStore::open(paths)?;
        let downloaded = load_downloaded_map(&store)?;
        println!("downloaded.count: {}", downloaded.len());
        for (slug, entry) in &downloaded {
            let stats = bundle_stats(&paths.version_dir(slug)?)?;
            println!("downloaded.{slug}.index_path: {}", entry.index_path);
            println!("downloaded.{slug}.downloaded_at_ms: {}", entry.downloaded_at);
            println!(
                "downloaded.{slug}.zip_url: {}",
                entry.zip_url.as_deref().unwrap_or("<none>")
            );
            println!("downloaded.{slug}.files: {}", stats.files);
            println!("downloaded.{slug}.bytes: {}", stats.bytes);
        }
        let bookmarked = DocumentState::new(&store).bookmarked_slugs()?;
        println!("bookmarks.slugs: {}", bookmarked.len());
    }

    if !status.warnings.is_empty() {
        println!("warnings:");
        for warning in &status.warnings {
            println!("  - {warning}");
        }
    }
    println!("policy: {NO_MIGRATIONS_POLICY_MESSAGE}");
    print_diagnostics(runtime, paths);
    Ok(())
}

fn run_versions(runtime: &RuntimeOptions, args: VersionsArgs) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let store = SqliteStore::open(&shelf.paths)?;
    let client = ManifestClient::new(&shelf.settings);
    let mut http = ReqwestTransport::new(&shelf.settings)?;
    let mut probe = connectivity_probe(runtime, &shelf.settings);

    let mut view = load_library(&client, &mut http, &store, probe.as_mut())?;
    if !args.json {
        print_library(&view);
    }

    // A cached list is shown as-is; the refresh runs behind it when online.
    if !args.no_sync && view.from_cache && probe.current().is_online() {
        let coordinator =
            SyncCoordinator::with_versions(shelf.settings.sync_interval, view.versions.clone());
        let background = coordinator.spawn_sync(
            ManifestClient::new(&shelf.settings),
            ReqwestTransport::new(&shelf.settings)?,
            shelf.paths.db_path.clone(),
        );
        let outcome = background.wait();
        if !args.json {
            print_sync_outcome(&outcome);
        }
        if matches!(outcome, SyncOutcome::Updated { .. }) {
            view = refresh_library(&store, &view)?;
            if !args.json {
                print_library(&view);
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }
    print_diagnostics(runtime, &shelf.paths);
    Ok(())
}

fn run_sync(runtime: &RuntimeOptions) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let mut probe = connectivity_probe(runtime, &shelf.settings);
    if !probe.current().is_online() {
        bail!(Notice::Offline {
            action: "refresh the version list".to_string(),
        });
    }

    let store = SqliteStore::open(&shelf.paths)?;
    let client = ManifestClient::new(&shelf.settings);
    let mut http = ReqwestTransport::new(&shelf.settings)?;
    let coordinator = SyncCoordinator::new(shelf.settings.sync_interval);
    let outcome = coordinator.sync_if_needed(&client, &mut http, &store, Instant::now());
    print_sync_outcome(&outcome);
    if let SyncOutcome::Failed { error } = outcome {
        bail!("version refresh failed: {error}");
    }
    print_diagnostics(runtime, &shelf.paths);
    Ok(())
}

fn run_watch(runtime: &RuntimeOptions, args: WatchArgs) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let coordinator = SyncCoordinator::new(shelf.settings.sync_interval);
    let mut probe = connectivity_probe(runtime, &shelf.settings);
    let mut monitor = ConnectivityMonitor::default();
    let mut pending = None;
    let interval = Duration::from_secs(args.poll_secs.max(1));

    println!("watching connectivity every {}s", interval.as_secs());
    let mut polls = 0u64;
    loop {
        let report = probe.current();
        debug!(online = report.is_online(), "connectivity poll");
        if monitor.observe(report) && pending.is_none() {
            info!("connectivity available; refreshing version list");
            pending = Some(coordinator.spawn_sync(
                ManifestClient::new(&shelf.settings),
                ReqwestTransport::new(&shelf.settings)?,
                shelf.paths.db_path.clone(),
            ));
        }
        if let Some(outcome) = pending.as_ref().and_then(|sync| sync.try_outcome()) {
            print_sync_outcome(&outcome);
            pending = None;
        }

        polls += 1;
        if args.max_polls.is_some_and(|max| polls >= max) {
            break;
        }
        thread::sleep(interval);
    }

    // Leaving with a refresh still running: let it finish but keep its result
    // out of the cache.
    if let Some(sync) = pending {
        sync.cancel();
        print_sync_outcome(&sync.wait());
    }
    Ok(())
}

fn run_download(runtime: &RuntimeOptions, slug: &str) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let mut probe = connectivity_probe(runtime, &shelf.settings);
    if !probe.current().is_online() {
        bail!(Notice::Offline {
            action: "download docs".to_string(),
        });
    }

    let store = SqliteStore::open(&shelf.paths)?;
    let client = ManifestClient::new(&shelf.settings);
    let mut http = ReqwestTransport::new(&shelf.settings)?;
    let view = load_library(&client, &mut http, &store, probe.as_mut())?;
    let descriptor = view.find(slug).cloned().unwrap_or_else(|| {
        debug!(slug, "slug not in version list; resolving archive by slug");
        VersionDescriptor::metadata_only(slug, &shelf.settings.page_url(slug))
    });

    let mut last_percent = None;
    let mut progress = |fraction: f64| {
        let percent = (fraction.clamp(0.0, 1.0) * 100.0).round() as u8;
        if last_percent != Some(percent) {
            last_percent = Some(percent);
            eprint!("\rdownloading {slug}: {percent:>3}%");
            let _ = io::stderr().flush();
        }
    };
    let result = acquire(
        &shelf.paths,
        &client,
        &mut http,
        &store,
        &descriptor,
        &mut progress,
    );
    if last_percent.is_some() {
        eprintln!();
    }
    let entry = result?;
    let stats = bundle_stats(&shelf.paths.version_dir(slug)?)?;

    println!("downloaded {slug}");
    println!("index_path: {}", entry.index_path);
    println!("zip_url: {}", entry.zip_url.as_deref().unwrap_or("<none>"));
    println!("etag: {}", entry.etag.as_deref().unwrap_or("<none>"));
    println!(
        "last_modified: {}",
        entry.last_modified.as_deref().unwrap_or("<none>")
    );
    println!(
        "archive_sha256: {}",
        entry.archive_sha256.as_deref().unwrap_or("<none>")
    );
    println!("files: {}", stats.files);
    println!("bytes: {}", stats.bytes);
    print_diagnostics(runtime, &shelf.paths);
    Ok(())
}

fn run_open(runtime: &RuntimeOptions, slug: &str, url: Option<&str>) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let store = SqliteStore::open(&shelf.paths)?;
    let mut session = ReaderSession::open(&shelf.paths, &store, slug, url)?;
    let start = session.current_url().to_string();
    session.navigate(&start);
    print_session(&session)?;
    print_diagnostics(runtime, &shelf.paths);
    Ok(())
}

fn run_visit(runtime: &RuntimeOptions, slug: &str, url: &str, title: Option<&str>) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let store = SqliteStore::open(&shelf.paths)?;
    let mut session = ReaderSession::open(&shelf.paths, &store, slug, Some(url))?;
    session.navigate(url);
    if let Some(title) = title {
        session.record_title(title);
    }
    print_session(&session)?;
    Ok(())
}

fn run_home(runtime: &RuntimeOptions, slug: &str) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let store = SqliteStore::open(&shelf.paths)?;
    let mut session = ReaderSession::open(&shelf.paths, &store, slug, None)?;
    session.go_home();
    print_session(&session)?;
    Ok(())
}

fn run_search(runtime: &RuntimeOptions, slug: &str) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let store = SqliteStore::open(&shelf.paths)?;
    let mut session = ReaderSession::open(&shelf.paths, &store, slug, None)?;
    session.open_search()?;
    print_session(&session)?;
    Ok(())
}

fn run_bookmarks_list(runtime: &RuntimeOptions, slug: Option<&str>) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let store = SqliteStore::open(&shelf.paths)?;
    let state = DocumentState::new(&store);
    let slugs = match slug {
        Some(slug) => vec![slug.to_string()],
        None => state.bookmarked_slugs()?,
    };

    if slugs.is_empty() {
        println!("bookmarks: <none>");
    }
    for slug in slugs {
        let bookmarks = state.bookmarks(&slug)?;
        println!("bookmarks.{slug}.count: {}", bookmarks.len());
        for bookmark in &bookmarks {
            print_bookmark(&slug, bookmark);
        }
    }
    Ok(())
}

fn run_bookmarks_add(
    runtime: &RuntimeOptions,
    slug: &str,
    url: &str,
    title: Option<&str>,
) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let store = SqliteStore::open(&shelf.paths)?;
    let bookmark = Bookmark::new(url, title)?;
    let added = DocumentState::new(&store).add_bookmark(slug, bookmark.clone())?;
    if added {
        print_bookmark(slug, &bookmark);
    } else {
        println!("already bookmarked: {url}");
    }
    Ok(())
}

fn run_bookmarks_remove(runtime: &RuntimeOptions, slug: &str, url: &str) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let store = SqliteStore::open(&shelf.paths)?;
    if DocumentState::new(&store).remove_bookmark(slug, url)? {
        println!("removed: {url}");
    } else {
        println!("not bookmarked: {url}");
    }
    Ok(())
}

fn run_bookmarks_toggle(runtime: &RuntimeOptions, slug: &str, title: Option<&str>) -> Result<()> {
    let shelf = open_shelf(runtime)?;
    let store = SqliteStore::open(&shelf.paths)?;
    let mut session = ReaderSession::open(&shelf.paths, &store, slug, None)?;
    if let Some(title) = title {
        session.record_title(title);
    }
    let bookmarked = session.toggle_bookmark()?;
    println!(
        "{}: {}",
        if bookmarked { "bookmarked" } else { "removed" },
        session.current_url()
    );
    Ok(())
}

fn print_library(view: &LibraryView) {
    println!("versions.count: {}", view.versions.len());
    println!("versions.from_cache: {}", format_flag(view.from_cache));
    if view.needs_internet {
        println!("versions.needs_internet: yes (connect once to load the full list)");
    }
    if view.is_empty() {
        println!("versions: <none>");
    }
    for row in view.rows() {
        let state = if row.downloaded {
            "downloaded"
        } else if row.downloadable {
            "available"
        } else {
            "not downloaded"
        };
        println!("version.{}: {state}", row.slug);
    }
}

fn print_sync_outcome(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Throttled => println!("sync: skipped (refreshed recently)"),
        SyncOutcome::AlreadyRunning => println!("sync: skipped (already running)"),
        SyncOutcome::Unchanged { count } => println!("sync: unchanged ({count} versions)"),
        SyncOutcome::Updated { versions } => println!("sync: updated ({} versions)", versions.len()),
        SyncOutcome::Failed { error } => println!("sync: failed, kept cached list ({error})"),
        SyncOutcome::Cancelled => println!("sync: cancelled"),
    }
}

fn print_session(session: &ReaderSession<'_>) -> Result<()> {
    println!("slug: {}", session.slug());
    println!("render: {}", session.current_url());
    println!("home: {}", session.home_url());
    if let Some(title) = session.page_title() {
        println!("title: {title}");
    }
    println!("bookmarked: {}", format_flag(session.is_bookmarked()?));
    Ok(())
}

fn print_bookmark(slug: &str, bookmark: &Bookmark) {
    println!(
        "bookmarks.{slug}: {} <{}> at {}",
        bookmark.label(),
        bookmark.url,
        bookmark.created_at
    );
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn connectivity_probe(runtime: &RuntimeOptions, settings: &Settings) -> Box<dyn ConnectivityProbe> {
    if runtime.offline {
        Box::new(FixedConnectivity(Connectivity::offline()))
    } else {
        Box::new(TcpProbe::new(&settings.manifest_url, PROBE_TIMEOUT))
    }
}

fn open_shelf(runtime: &RuntimeOptions) -> Result<Shelf> {
    let paths = resolve_runtime_paths(runtime)?;
    let settings = load_config(&paths.config_path)?.resolve();
    Ok(Shelf { paths, settings })
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        home: runtime.home.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let home_env = initial.home_dir.join(".env");
    if home_env.exists() {
        let _ = dotenvy::from_path_override(&home_env);
    }

    resolve_paths(&context, &overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
