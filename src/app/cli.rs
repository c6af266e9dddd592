use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use super::data_io::DataFormat;
use super::types::ProxyType;

#[derive(Debug, Parser, Clone)]
#[command(
    name = "deadmark",
    version,
    about = "Find and prune dead links in your browser bookmarks"
)]
pub struct Cli {
    /// Where check state, settings and logs are kept.
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Chromium `Bookmarks` file. Defaults to the Chrome default profile.
    #[arg(long, global = true, value_name = "FILE")]
    pub bookmarks: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Check every bookmark (the default).
    Check(CheckArgs),
    /// Export the last check's results.
    Results(ResultsArgs),
    /// Show or change the checker settings.
    Settings(SettingsArgs),
    /// List bookmark folders and their ids.
    Folders,
    /// Delete the bookmark behind a URL.
    Delete {
        #[arg(value_name = "URL")]
        url: String,
    },
    /// Delete every bookmark the last check found unavailable.
    Prune,
    /// Probe one URL again, or every unavailable one, and update the results.
    Recheck {
        #[arg(value_name = "URL", required_unless_present = "invalid")]
        url: Option<String>,

        /// Recheck every bookmark the last check found unavailable.
        #[arg(long, conflicts_with = "url")]
        invalid: bool,
    },
    /// Add a bookmark.
    Add {
        #[arg(value_name = "URL")]
        url: String,
        #[arg(long)]
        title: Option<String>,
        /// Folder id; defaults to the bookmarks bar.
        #[arg(long, value_name = "ID", default_value = "1")]
        folder: String,
    },
}

#[derive(Debug, clap::Args, Clone, Default)]
pub struct CheckArgs {
    #[arg(long, default_value_t = false)]
    pub no_tui: bool,

    /// Only check bookmarks below this folder id.
    #[arg(long, value_name = "ID")]
    pub folder: Option<String>,
}

#[derive(Debug, clap::Args, Clone)]
pub struct ResultsArgs {
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<String>,

    #[arg(long, value_enum, default_value_t = FileFormatArg::Csv)]
    pub format: FileFormatArg,

    /// Include available and unchecked links, not only dead ones.
    #[arg(long, default_value_t = false)]
    pub all: bool,
}

#[derive(Debug, clap::Args, Clone)]
pub struct SettingsArgs {
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    pub proxy_retry: Option<bool>,

    #[arg(long, value_enum)]
    pub proxy_type: Option<ProxyType>,

    #[arg(long, value_name = "HOST")]
    pub proxy_address: Option<String>,

    #[arg(long, value_name = "PORT")]
    pub proxy_port: Option<String>,

    #[arg(long, value_name = "N")]
    pub threads: Option<usize>,
}

impl SettingsArgs {
    pub fn is_empty(&self) -> bool {
        self.proxy_retry.is_none()
            && self.proxy_type.is_none()
            && self.proxy_address.is_none()
            && self.proxy_port.is_none()
            && self.threads.is_none()
    }
}

#[derive(Debug, Copy, Clone, ValueEnum, PartialEq, Eq)]
pub enum FileFormatArg {
    Csv,
    Json,
}

impl From<FileFormatArg> for DataFormat {
    fn from(value: FileFormatArg) -> Self {
        match value {
            FileFormatArg::Csv => DataFormat::Csv,
            FileFormatArg::Json => DataFormat::Json,
        }
    }
}
