//! Tracing setup shared by the assetfetch binaries.

use once_cell::sync::OnceCell;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FETCH_LOG_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Install the console subscriber (`RUST_LOG`, default `info`). With
/// `ASSETFETCH_LOG_ROLL=1` the `assetfetch::*` events are also written to a
/// rolling file under `ASSETFETCH_LOG_DIR` (default `logs`).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter));

    let Some(settings) = FileLog::from_env() else {
        let _ = registry.try_init();
        return;
    };
    if std::fs::create_dir_all(&settings.dir).is_err() {
        tracing::warn!(directory = %settings.dir, "failed to create fetch log directory");
    }
    let writer = RollingFileAppender::new(settings.rotation, &settings.dir, &settings.prefix);
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FETCH_LOG_GUARD.set(guard);
    let targets = Targets::new().with_target("assetfetch", settings.level);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(targets);
    let _ = registry.with(file_layer).try_init();
}

#[derive(Debug, PartialEq)]
struct FileLog {
    dir: String,
    prefix: String,
    rotation: Rotation,
    level: tracing::Level,
}

impl FileLog {
    fn from_env() -> Option<Self> {
        if std::env::var("ASSETFETCH_LOG_ROLL").ok().as_deref() != Some("1") {
            return None;
        }
        let dir = std::env::var("ASSETFETCH_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
        let prefix =
            std::env::var("ASSETFETCH_LOG_PREFIX").unwrap_or_else(|_| "assetfetch".into());
        let rotation = std::env::var("ASSETFETCH_LOG_ROTATION").unwrap_or_default();
        let level = std::env::var("ASSETFETCH_LOG_LEVEL")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(tracing::Level::DEBUG);
        Some(Self {
            dir,
            prefix,
            rotation: rotation_from(&rotation),
            level,
        })
    }
}

fn rotation_from(raw: &str) -> Rotation {
    match raw.trim().to_lowercase().as_str() {
        "hourly" => Rotation::HOURLY,
        "minutely" => Rotation::MINUTELY,
        "never" => Rotation::NEVER,
        _ => Rotation::DAILY,
    }
}
