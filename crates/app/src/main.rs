use std::{future::Future, path::PathBuf, rc::Rc, time::Duration};

use acoustic_monitor_core::{
    display_volume_db, AppConfig, CaptureSession, CaptureSessionContext, Classifier, CpalDevice,
    FileStore, HistoryConfig, HistoryLedger, HistoryStore, LocalScheduler, MemoryStore,
    RestClassifier, SessionStatus, SimulatedClassifier,
};
use clap::{Parser, Subcommand};
use tokio::task::LocalSet;
use tracing_subscriber::EnvFilter;

const STATUS_PERIOD: Duration = Duration::from_secs(1);

fn main() -> acoustic_monitor_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let mut config = match cli.config.as_deref() {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Monitor {
            simulate,
            duration_secs,
            backend_url,
        } => {
            if let Some(url) = backend_url {
                config.backend.base_url = url;
            }
            config.validate()?;
            run_monitor(config, simulate, duration_secs.map(Duration::from_secs))
        }
        Commands::History { clear } => run_history(&config.history, clear),
        Commands::Health => run_backend_query(&config, Query::Health),
        Commands::ModelInfo => run_backend_query(&config, Query::ModelInfo),
    }
}

fn run_monitor(
    config: AppConfig,
    simulate: bool,
    duration: Option<Duration>,
) -> acoustic_monitor_core::Result<()> {
    tracing::info!(simulate, ?duration, backend = %config.backend.base_url, "starting monitor");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = LocalSet::new();
    local.block_on(&runtime, monitor(config, simulate, duration))
}

async fn monitor(
    config: AppConfig,
    simulate: bool,
    duration: Option<Duration>,
) -> acoustic_monitor_core::Result<()> {
    let classifier: Rc<dyn Classifier> = if simulate {
        Rc::new(SimulatedClassifier::new())
    } else {
        Rc::new(RestClassifier::new(&config.backend)?)
    };

    let context = CaptureSessionContext::new(open_history(&config.history));
    let restored = context.load_history();
    tracing::info!(entries = restored.len(), "history restored");

    let mut session = CaptureSession::new(
        Box::new(CpalDevice::new()),
        Rc::new(LocalScheduler::new()),
        classifier,
        context.clone(),
    )
    .with_audio_config(config.audio.clone())
    .with_session_config(config.session.clone());

    session.start()?;
    let exit = watch(&context, tokio::signal::ctrl_c(), duration).await;
    tracing::info!(?exit, "monitor finished");

    session.stop();
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Interrupted,
    DurationElapsed,
    SessionFailed,
}

/// Prints the status line every [`STATUS_PERIOD`] until `interrupt`
/// resolves, `duration` elapses or the capture fails.
async fn watch<F>(
    context: &CaptureSessionContext,
    interrupt: F,
    duration: Option<Duration>,
) -> Exit
where
    F: Future,
{
    let deadline = async {
        match duration {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline, interrupt);
    let mut status = tokio::time::interval(STATUS_PERIOD);

    loop {
        tokio::select! {
            _ = &mut interrupt => return Exit::Interrupted,
            _ = &mut deadline => return Exit::DurationElapsed,
            _ = status.tick() => {
                print_status(context);
                if let SessionStatus::Errored(kind) = context.status() {
                    tracing::error!(?kind, "capture session ended");
                    return Exit::SessionFailed;
                }
            }
        }
    }
}

fn print_status(context: &CaptureSessionContext) {
    let snapshot = context.snapshot();
    let prediction = context
        .current_prediction()
        .map(|result| {
            format!(
                "{} {:.1}%",
                result.class_label().display_name(),
                result.confidence() * 100.0
            )
        })
        .unwrap_or_else(|| "--".to_string());

    println!(
        "[{}] {:<14} {:>6.1} dB {:>8.1} Hz  {}{}",
        snapshot.elapsed_display(),
        snapshot.status_text,
        display_volume_db(snapshot.volume_db),
        snapshot.dominant_freq_hz,
        prediction,
        if snapshot.processing { "  (analysing)" } else { "" },
    );
}

fn open_history(config: &HistoryConfig) -> HistoryLedger {
    let store: Box<dyn HistoryStore> = match &config.directory {
        Some(directory) => Box::new(FileStore::new(directory)),
        None => Box::new(MemoryStore::new()),
    };
    HistoryLedger::with_capacity(store, config.capacity)
}

fn run_history(config: &HistoryConfig, clear: bool) -> acoustic_monitor_core::Result<()> {
    match &config.directory {
        Some(directory) => tracing::debug!(%directory, "reading history"),
        None => tracing::warn!("no history directory configured; history is not persisted"),
    }

    let context = CaptureSessionContext::new(open_history(config));
    if clear {
        context.clear_history()?;
        tracing::info!("history cleared");
        return Ok(());
    }

    let entries = context.load_history();
    if entries.is_empty() {
        println!("no detections recorded");
    }
    for entry in entries {
        println!(
            "{}  {:<14} {:.1}%",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.class_label.display_name(),
            entry.confidence * 100.0
        );
    }
    Ok(())
}

enum Query {
    Health,
    ModelInfo,
}

fn run_backend_query(config: &AppConfig, query: Query) -> acoustic_monitor_core::Result<()> {
    let backend = RestClassifier::new(&config.backend)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let body = runtime.block_on(async {
        match query {
            Query::Health => backend.health().await,
            Query::ModelInfo => backend.model_info().await,
        }
    })?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live acoustic event monitor", long_about = None)]
struct Cli {
    /// JSON configuration file. Built-in defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Capture from the default microphone and classify it periodically.
    Monitor {
        /// Use the built-in simulated classifier instead of the backend.
        #[arg(long)]
        simulate: bool,
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        duration_secs: Option<u64>,
        /// Override the backend base URL from the configuration.
        #[arg(long)]
        backend_url: Option<String>,
    },
    /// Print the persisted detection history.
    History {
        /// Remove the history instead of printing it.
        #[arg(long)]
        clear: bool,
    },
    /// Check that the classification backend is reachable.
    Health,
    /// Show metadata about the deployed model.
    ModelInfo,
}
