use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use super::bookmarks::{BookmarkStore, ChromeBookmarks, default_bookmarks_path, folders};
use super::cli::{CheckArgs, Cli, Command, ResultsArgs, SettingsArgs};
use super::data_io::{
    DataFormat, default_output_path, detect_data_format, report_records, write_report_file,
};
use super::lifecycle::{Services, Session, StartOutcome};
use super::persistence::PersistenceBridge;
use super::probe::{HttpProber, Probe};
use super::proxy::{EgressProxy, ProxyController};
use super::scheduler::Pacing;
use super::settings::SettingsStore;
use super::store::{FileStore, KeyValueStore, MemoryStore};
use super::tui::run_tui;
use super::types::{LogRenderer, Outcome, Renderer, UiEvent};

const STATE_FILE: &str = "storage.json";
const LOG_FILE: &str = "deadmark.log";

pub async fn run() -> io::Result<()> {
    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir.as_deref())?;
    let command = cli
        .command
        .clone()
        .unwrap_or_else(|| Command::Check(CheckArgs::default()));
    let uses_tui = matches!(&command, Command::Check(args) if !args.no_tui);
    init_tracing(&data_dir, uses_tui)?;

    let state_file = FileStore::new(data_dir.join(STATE_FILE));
    tracing::debug!(path = %state_file.path().display(), "using state file");
    let durable: Arc<dyn KeyValueStore> = Arc::new(state_file);
    let settings = SettingsStore::load(durable.clone());
    let app = App {
        bookmarks_path: cli.bookmarks.clone(),
        durable,
        settings,
    };

    match command {
        Command::Check(args) => app.check(args).await,
        Command::Results(args) => app.export_results(args),
        Command::Settings(args) => app.update_settings(args),
        Command::Folders => app.list_folders(),
        Command::Delete { url } => {
            let mut session = Session::attach(app.services(Arc::new(LogRenderer))?);
            let deleted = session.delete_result(&url);
            session.close().await;
            match deleted? {
                Some(_) => Ok(()),
                None => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no bookmark for {url}"),
                )),
            }
        }
        Command::Prune => {
            let mut session = Session::attach(app.services(Arc::new(LogRenderer))?);
            let deleted = session.delete_invalid();
            session.close().await;
            println!("deleted {deleted} invalid bookmarks");
            Ok(())
        }
        Command::Recheck { url, invalid } => {
            let mut session = Session::attach(app.services(Arc::new(LogRenderer))?);
            match url {
                Some(url) if !invalid => {
                    let available = session.recheck(&url).await;
                    println!("{url}: {}", if available { "available" } else { "unavailable" });
                }
                _ => {
                    let recovered = session.recheck_invalid().await;
                    println!("{recovered} invalid bookmarks are reachable again");
                }
            }
            session.close().await;
            Ok(())
        }
        Command::Add { url, title, folder } => {
            let store = ChromeBookmarks::create_empty(app.bookmarks_path()?)?;
            let title = title.unwrap_or_else(|| url.clone());
            let node = store.create(&folder, &title, Some(&url))?;
            println!(
                "added bookmark {} in folder {}",
                node.id,
                node.parent_id.as_deref().unwrap_or(&folder)
            );
            Ok(())
        }
    }
}

fn resolve_data_dir(flag: Option<&Path>) -> io::Result<PathBuf> {
    let dir = match flag {
        Some(dir) => dir.to_path_buf(),
        None => dirs::data_dir()
            .map(|dir| dir.join("deadmark"))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    "no data directory on this platform, pass --data-dir",
                )
            })?,
    };
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Logs go to stderr, or to a file while the TUI owns the terminal.
fn init_tracing(data_dir: &Path, to_file: bool) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let result = if to_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(data_dir.join(LOG_FILE))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init()
    };
    result.map_err(io::Error::other)
}

struct App {
    bookmarks_path: Option<PathBuf>,
    durable: Arc<dyn KeyValueStore>,
    settings: SettingsStore,
}

impl App {
    fn bookmarks_path(&self) -> io::Result<PathBuf> {
        self.bookmarks_path
            .clone()
            .or_else(default_bookmarks_path)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    "no default bookmark file, pass --bookmarks",
                )
            })
    }

    fn bookmarks(&self) -> io::Result<Arc<dyn BookmarkStore>> {
        let path = self.bookmarks_path()?;
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("bookmark file {} does not exist", path.display()),
            ));
        }
        let store = ChromeBookmarks::new(path);
        tracing::debug!(path = %store.path().display(), "using bookmark file");
        Ok(Arc::new(store))
    }

    fn services(&self, renderer: Arc<dyn Renderer>) -> io::Result<Services<HttpProber>> {
        let egress = Arc::new(EgressProxy::new());
        Ok(Services {
            prober: Arc::new(HttpProber::new(egress.clone())),
            proxy: Arc::new(ProxyController::new(egress)),
            persistence: Arc::new(PersistenceBridge::new(
                Arc::new(MemoryStore::new()),
                self.durable.clone(),
            )),
            bookmarks: self.bookmarks()?,
            renderer,
            settings: self.settings.clone(),
            pacing: Pacing::default(),
        })
    }

    async fn check(&self, args: CheckArgs) -> io::Result<()> {
        if args.no_tui {
            let session = Session::open(self.services(Arc::new(LogRenderer))?);
            return run_headless(session, args.folder.as_deref()).await;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<UiEvent>();
        let session = Session::open(self.services(Arc::new(tx))?);
        run_tui(session, self.settings.clone(), args.folder, &mut rx)
    }

    fn export_results(&self, args: ResultsArgs) -> io::Result<()> {
        let persistence = PersistenceBridge::new(Arc::new(MemoryStore::new()), self.durable.clone());
        let Some(state) = persistence.load_checkpoint() else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no check results yet, run `deadmark check` first",
            ));
        };

        let configured: DataFormat = args.format.into();
        let format = args
            .output
            .as_deref()
            .map(|path| detect_data_format(path, configured))
            .unwrap_or(configured);
        let output = args
            .output
            .clone()
            .unwrap_or_else(|| default_output_path(format));
        let records = report_records(&state, args.all);
        write_report_file(Path::new(&output), format, &records)?;
        if state.is_checking {
            tracing::warn!(
                checked = state.checked_count,
                total = state.total_count,
                "check still in progress, results are partial"
            );
        }
        println!("wrote {} results to {output}", records.len());
        Ok(())
    }

    fn update_settings(&self, args: SettingsArgs) -> io::Result<()> {
        let mut settings = self.settings.get();
        if !args.is_empty() {
            if let Some(enabled) = args.proxy_retry {
                settings.enable_proxy_retry = enabled;
            }
            if let Some(proxy_type) = args.proxy_type {
                settings.proxy_type = proxy_type;
            }
            if let Some(address) = args.proxy_address {
                settings.proxy_address = address;
            }
            if let Some(port) = args.proxy_port {
                settings.proxy_port = port;
            }
            if let Some(threads) = args.threads {
                settings.threads_per_batch = threads;
            }
            settings = self.settings.set(settings)?;
        }
        let pretty = serde_json::to_string_pretty(&settings).map_err(io::Error::other)?;
        println!("{pretty}");
        Ok(())
    }

    fn list_folders(&self) -> io::Result<()> {
        let tree = self.bookmarks()?.list_all()?;
        for folder in folders(&tree) {
            println!(
                "{:>6}  {}{}",
                folder.id,
                "  ".repeat(folder.depth),
                folder.title
            );
        }
        Ok(())
    }
}

async fn run_headless<P: Probe>(mut session: Session<P>, folder: Option<&str>) -> io::Result<()> {
    if session.is_running() {
        if let Some(folder) = folder {
            tracing::warn!(
                folder,
                "a saved check was resumed, --folder applies to the next new check"
            );
        }
    } else {
        match session.start_check(folder).await? {
            StartOutcome::Started { .. } => {}
            StartOutcome::NoBookmarks => return Ok(()),
            StartOutcome::Cancelling | StartOutcome::AlreadyCancelling => {
                session.wait().await;
                session.close().await;
                return Ok(());
            }
        }
    }

    let cancel = session.cancel_flag();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, cancelling check...");
            cancel.cancel();
        }
    });
    let outcome = session.wait().await;
    interrupt.abort();

    let state = session.snapshot();
    session.close().await;
    match outcome {
        Some(Outcome::Completed { invalid }) => {
            for (_, result) in state.invalid() {
                println!("{}\t{}", result.url, result.title);
            }
            eprintln!(
                "finished check: checked={} invalid={invalid}",
                state.checked_count
            );
            Ok(())
        }
        Some(Outcome::Cancelled) => {
            eprintln!(
                "check cancelled at {}/{}",
                state.checked_count, state.total_count
            );
            Ok(())
        }
        Some(Outcome::ProxyFailed) => Err(io::Error::other(
            "proxy setup failed, direct results were kept",
        )),
        None => Ok(()),
    }
}
