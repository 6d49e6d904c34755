use std::sync::Once;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Whatever};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

pub const DEFAULT_LOG_DIR: &str = dxram_common::DXRAM_DEBUG_LOG_DIR;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingOptions {
    /// Directory for the rolling log file; stderr only when unset.
    pub dir: Option<String>,
    /// Used when `RUST_LOG` is not set.
    pub level: String,
    pub enable_ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            dir: None,
            level: DEFAULT_LOG_LEVEL.to_string(),
            enable_ansi: false,
        }
    }
}

/// Initializes the global subscriber: an [EnvFilter] built from `RUST_LOG`
/// or `opts.level`, a stderr layer, and a daily rolling file under `opts.dir`
/// when one is given.
///
/// The returned guards flush the file writer; keep them alive until exit.
pub fn init_global_logging(app: &str, opts: &LoggingOptions) -> Result<Vec<WorkerGuard>, Whatever> {
    let mut guards = vec![];

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&opts.level))
        .with_whatever_context(|_| format!("invalid log level {:?}", opts.level))?;

    let stderr_layer = fmt::layer()
        .with_ansi(opts.enable_ansi)
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = match &opts.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, app);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            guards.push(guard);
            Some(fmt::layer().with_ansi(false).with_writer(writer).boxed())
        }
        None => None,
    };

    Registry::default()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .with_whatever_context(|e| format!("failed to install global subscriber: {e}"))?;

    replace_panic_hook_with_tracing_panic_hook();
    tracing::info!(app, level = %opts.level, dir = ?opts.dir, "logging started");
    Ok(guards)
}

/// Pretty stdout logging for tests. Safe to call from every test.
pub fn install_fmt_log() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let stdout_log = fmt::layer().pretty().with_test_writer();
        let subscriber = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
            .with(stdout_log);
        // Another harness may already own the global default.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Routes panics through tracing so they land in the log file too.
pub fn replace_panic_hook_with_tracing_panic_hook() {
    std::panic::set_hook(Box::new(tracing_panic_hook));
}

fn tracing_panic_hook(info: &std::panic::PanicInfo) {
    let msg = match info.payload().downcast_ref::<&'static str>() {
        Some(s) => *s,
        None => match info.payload().downcast_ref::<String>() {
            Some(s) => &s[..],
            None => "Box<dyn Any>",
        },
    };

    let thread = std::thread::current();
    let thread = thread.name().unwrap_or("<unnamed>");
    let backtrace = std::backtrace::Backtrace::capture();

    match info.location() {
        Some(location) => tracing::error!(
            %thread,
            location = %format_args!("{}:{}:{}", location.file(), location.line(), location.column()),
            "panic: {msg}\n{backtrace}"
        ),
        None => tracing::error!(%thread, "panic: {msg}\n{backtrace}"),
    }
}
