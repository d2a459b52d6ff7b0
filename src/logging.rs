//! Log wiring for the keel binary.
//!
//! One [`LogSettings`] value, derived from the CLI flags, drives both
//! sinks: a console layer on stderr and a daily-rolling file layer under
//! the sync root's state directory. The file sink always captures one
//! verbosity step more than the console so a support bundle from a
//! non-verbose run still shows what the engine was doing. Panics are
//! routed through the same pipeline as engine errors before the process
//! aborts.

use std::io::{self, IsTerminal};
use std::panic;
use std::path::PathBuf;
use std::process;

use backtrace::Backtrace;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::cli::ColorMode;

/// Per-invocation logging configuration.
pub struct LogSettings {
    /// Number of `-v` flags on the command line.
    pub verbosity: u8,
    pub color: ColorMode,
    /// Directory for the rolling file log; `None` disables the file sink.
    pub file_dir: Option<PathBuf>,
    /// Prefix of the rolling log files, e.g. `keel-sync`.
    pub file_prefix: String,
}

impl LogSettings {
    /// Each `-v` opens up one more level for the engine crates; third
    /// party crates stay at `info` until `-vvv`.
    fn console_directives(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "info,libkeel=debug,watchfs=debug",
            2 => "info,libkeel=trace,watchfs=trace",
            _ => "trace",
        }
    }

    /// The file sink runs one step ahead of the console.
    fn file_directives(&self) -> &'static str {
        match self.verbosity {
            0 => "info,libkeel=debug,watchfs=debug",
            1 => "info,libkeel=trace,watchfs=trace",
            _ => "trace",
        }
    }

    fn ansi(&self) -> bool {
        match self.color {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => io::stderr().is_terminal(),
        }
    }
}

/// Keeps the non-blocking file writer alive; dropping it flushes the log.
pub struct LogGuard {
    _worker: Option<tracing_appender::non_blocking::WorkerGuard>,
}

pub fn init(settings: LogSettings) -> LogGuard {
    tracing_log::LogTracer::init().expect("log bridge installed twice");

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(settings.ansi())
        .without_time()
        .with_target(false)
        .with_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.console_directives())),
        );

    let mut worker = None;
    let file_layer = settings.file_dir.as_ref().and_then(|dir| {
        if let Err(err) = std::fs::create_dir_all(dir) {
            eprintln!(
                "keel: file logging disabled, cannot create {}: {err}",
                dir.display()
            );
            return None;
        }

        let appender = tracing_appender::rolling::Builder::new()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix(settings.file_prefix.as_str())
            .filename_suffix("log")
            .build(dir)
            .ok()?;
        let (writer, guard) = tracing_appender::non_blocking(appender);
        worker = Some(guard);

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339())
                .with_target(true)
                .with_thread_names(true)
                .with_filter(EnvFilter::new(settings.file_directives())),
        )
    });

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    install_panic_reporter();

    LogGuard { _worker: worker }
}

/// A panic anywhere in the process is a crash of the sync engine; report
/// it through the log pipeline (so it lands in the rolling file next to
/// the engine errors that may have preceded it) and abort.
fn install_panic_reporter() {
    panic::set_hook(Box::new(|info| {
        let detail = info
            .payload()
            .downcast_ref::<&str>()
            .map(|text| (*text).to_owned())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());

        match info.location() {
            Some(location) => log::error!(
                "keel {} panicked at {}:{}: {}",
                env!("CARGO_PKG_VERSION"),
                location.file(),
                location.line(),
                detail
            ),
            None => log::error!("keel {} panicked: {}", env!("CARGO_PKG_VERSION"), detail),
        }

        if std::env::var_os("RUST_BACKTRACE").is_some_and(|value| value == "1") {
            log::error!("{:?}", Backtrace::new());
        } else {
            log::error!("re-run with RUST_BACKTRACE=1 to capture a backtrace");
        }

        process::exit(2);
    }));
}
