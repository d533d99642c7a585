use clap::ValueEnum;
use cli::Cli;
use pipeline::{PlateRecognizer, Recognize};
use server::{ServerConfig, ServiceResult, run_server};
use std::{future::Future, path::PathBuf, sync::OnceLock};
use tokio_util::sync::CancellationToken;
use tracing::{Level, info};
use worker::{RecognizerHandle, spawn_recognizer_initialization};

pub mod api;
pub mod camera;
pub mod cli;
pub mod detector;
pub mod image;
pub mod parking_slots;
pub mod pipeline;
pub mod plate;
pub mod server;
pub mod source;
pub mod system_info;
pub mod worker;

/// Builds the service future: models load in the background while the
/// server already answers `/health`.
pub fn platewatch_service(
    args: Cli,
) -> anyhow::Result<(impl Future<Output = ServiceResult>, CancellationToken)> {
    let recognizer_config = args.recognizer_config();

    log_available_gpus();

    let recognizer_init_receiver = spawn_recognizer_initialization(
        move || {
            let recognizer = PlateRecognizer::new(recognizer_config)?;
            Ok(Box::new(recognizer) as Box<dyn Recognize>)
        },
        args.worker_queue_size,
        args.save_image_path.clone(),
    );

    let cancel_token = CancellationToken::new();
    let server_future = run_server(
        ServerConfig::from_cli(&args),
        RecognizerHandle::default(),
        Some(recognizer_init_receiver),
        args.cameras,
        cancel_token.clone(),
    );

    Ok((server_future, cancel_token))
}

pub fn direct_ml_available() -> bool {
    #[cfg(not(windows))]
    {
        false
    }
    #[cfg(windows)]
    {
        let Ok(exe_path) = std::env::current_exe() else {
            return false;
        };
        let Some(exe_dir) = exe_path.parent() else {
            return false;
        };
        exe_dir.join("DirectML.dll").exists()
    }
}

pub fn log_available_gpus() {
    if direct_ml_available() {
        info!("DirectML is available for GPU inference");
    } else {
        info!("GPU acceleration not available - only CPU inference will be supported");
    }
}

static LOG_RELOAD_HANDLE: OnceLock<
    tracing_subscriber::reload::Handle<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>,
> = OnceLock::new();

pub fn init_logging(
    log_level: LogLevel,
    log_path: &mut Option<PathBuf>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, reload};

    setup_ansi_support();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(log_level)));

    let (env_filter, reload_handle) = reload::Layer::new(env_filter);

    LOG_RELOAD_HANDLE
        .set(reload_handle)
        .map_err(|_| anyhow::anyhow!("Failed to set log reload handle"))?;

    let guard = if let Some(path) = log_path.clone() {
        // Relative to the executable when given as ./logs
        let log_directory = if path.starts_with(".") {
            let stripped = path.strip_prefix(".").unwrap_or(&path).to_path_buf();
            std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|p| p.join(stripped.clone())))
                .unwrap_or(stripped)
        } else {
            path
        };

        *log_path = Some(log_directory.clone());

        let log_file = log_directory.join("platewatch.log");
        println!("Starting Platewatch, logging into: {}", log_file.display());

        let file_appender = tracing_appender::rolling::daily(&log_directory, "platewatch.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .try_init()
            .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

        None
    };

    info!(
        ?log_level,
        "Logging initialized with dynamic filtering support"
    );
    Ok(guard)
}

pub fn update_log_level(new_log_level: LogLevel) -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    let Some(reload_handle) = LOG_RELOAD_HANDLE.get() else {
        anyhow::bail!("Log reload handle not available");
    };
    reload_handle
        .reload(EnvFilter::new(level_to_filter_string(new_log_level)))
        .map_err(|e| anyhow::anyhow!("Failed to reload log filter: {}", e))?;

    info!(?new_log_level, "Log level updated dynamically");
    Ok(())
}

fn level_to_filter_string(log_level: LogLevel) -> String {
    match log_level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
    .to_string()
}

fn setup_ansi_support() {
    #[cfg(target_os = "windows")]
    if let Err(e) = ansi_term::enable_ansi_support() {
        eprintln!("Failed to enable ANSI support: {e}");
    }
}

#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    ValueEnum,
    Debug,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_map_to_filters() {
        assert_eq!(level_to_filter_string(LogLevel::Warn), "warn");
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn log_level_deserializes_from_variant_name() {
        let level: LogLevel = serde_json::from_str("\"Debug\"").unwrap();
        assert_eq!(level, LogLevel::Debug);
    }

    #[test]
    fn update_without_logging_reports_error() {
        // Tests never install the global subscriber
        assert!(update_log_level(LogLevel::Info).is_err());
    }
}
