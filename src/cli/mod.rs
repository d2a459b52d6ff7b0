//! Defines Keel's CLI through clap types.

mod status;
mod sync;
mod unlink;

use std::{
    borrow::Cow,
    env,
    path::{Path, PathBuf},
};

use clap::Parser;

use crate::logging::LogSettings;

pub use self::status::StatusCommand;
pub use self::sync::SyncCommand;
pub use self::unlink::UnlinkCommand;

/// Command line options that Keel accepts, defined using the clap crate.
#[derive(Debug, Parser)]
#[clap(name = "Keel", version, about)]
pub struct Options {
    #[clap(flatten)]
    pub global: GlobalOptions,

    /// Subcommand to run in this invocation.
    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

impl Options {
    pub fn run(self) -> anyhow::Result<()> {
        match self.subcommand {
            Subcommand::Sync(subcommand) => subcommand.run(),
            Subcommand::Status(subcommand) => subcommand.run(),
            Subcommand::Unlink(subcommand) => subcommand.run(),
        }
    }

    /// Logging configuration for this invocation. `KEEL_NO_FILE_LOG`
    /// suppresses the file sink regardless of the subcommand.
    pub fn log_settings(&self) -> LogSettings {
        let file_dir = if env::var_os("KEEL_NO_FILE_LOG").is_some() {
            None
        } else {
            self.subcommand.log_dir()
        };

        LogSettings {
            verbosity: self.global.verbose,
            color: self.global.color,
            file_dir,
            file_prefix: format!("keel-{}", self.subcommand.command_name()),
        }
    }
}

#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Increase log detail; repeat up to three times.
    #[clap(long, short = 'v', global(true), action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// When console output should be colorized.
    #[clap(long, global(true), value_enum, default_value = "auto")]
    pub color: ColorMode,
}

/// Console color behavior. Parsed by clap; consumed by the log setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    /// Run one sync pair against a remote drive until interrupted.
    Sync(SyncCommand),
    /// Show the configured syncs and their state.
    Status(StatusCommand),
    /// Stop synchronizing a directory and clear its virtual-file state.
    Unlink(UnlinkCommand),
}

impl Subcommand {
    pub fn command_name(&self) -> &'static str {
        match self {
            Subcommand::Sync(_) => "sync",
            Subcommand::Status(_) => "status",
            Subcommand::Unlink(_) => "unlink",
        }
    }

    /// Directory file logs should land in, when the subcommand has one.
    pub fn log_dir(&self) -> Option<PathBuf> {
        match self {
            Subcommand::Sync(cmd) => Some(resolve_path(&cmd.local_path).join(".keel/logs")),
            Subcommand::Status(_) | Subcommand::Unlink(_) => None,
        }
    }
}

pub fn resolve_path(path: &Path) -> Cow<'_, Path> {
    if path.is_absolute() {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(env::current_dir().unwrap().join(path))
    }
}
