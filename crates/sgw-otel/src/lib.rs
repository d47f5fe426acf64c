use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target the HTTP transport logs one line per request on.
pub const WIRE_TARGET: &str = "sgw.wire";

static WIRE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Daily,
    Hourly,
    Minutely,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireLog {
    pub dir: String,
    pub prefix: String,
    pub rotation: Rotation,
}

impl WireLog {
    /// Rolling wire log settings, present only when `SGW_WIRE_LOG_ROLL=1`.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Option<Self> {
        if get("SGW_WIRE_LOG_ROLL").as_deref() != Some("1") {
            return None;
        }
        let dir = get("SGW_WIRE_LOG_DIR").unwrap_or_else(|| "logs".to_string());
        let prefix = get("SGW_WIRE_LOG_PREFIX").unwrap_or_else(|| "sgw-wire".into());
        let rotation = match get("SGW_WIRE_LOG_ROTATION")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        };
        Some(Self {
            dir,
            prefix,
            rotation,
        })
    }
}

/// Installs the process subscriber: console output on stderr filtered by
/// `RUST_LOG` (default `info`), plus the rolling wire log when enabled.
/// Later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));
    if let Some(wire) = WireLog::from_env() {
        if std::fs::create_dir_all(&wire.dir).is_err() {
            tracing::warn!(directory = %wire.dir, "failed to create wire log directory");
        }
        let writer = match wire.rotation {
            Rotation::Hourly => tracing_appender::rolling::hourly(&wire.dir, &wire.prefix),
            Rotation::Minutely => tracing_appender::rolling::minutely(&wire.dir, &wire.prefix),
            Rotation::Daily => tracing_appender::rolling::daily(&wire.dir, &wire.prefix),
        };
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = WIRE_GUARD.set(guard);
        let targets = Targets::new().with_target(WIRE_TARGET, tracing::Level::DEBUG);
        let wire_layer = fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(nb)
            .with_filter(targets);
        let _ = registry.with(wire_layer).try_init();
    } else {
        let _ = registry.try_init();
    }
}
