use std::{env, ffi::OsString, path::PathBuf};

use clap::{Parser, Subcommand};

pub const NAME: &str = "profiled";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME)]
#[clap(about = "Activity dumps and security profiles")]
#[clap(version)]
pub struct ProfiledOpts {
    /// Log level, overridden by RUST_LOG when set
    #[clap(long, global = true)]
    pub log_level: Option<log::LevelFilter>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Run the activity dump daemon
    Run {
        /// Custom configuration file
        #[clap(long)]
        config_file: Option<PathBuf>,
    },

    /// Generate a security profile from a persisted activity dump
    GenerateProfile {
        /// Activity dump file
        activity_dump_file: PathBuf,

        /// Directory receiving the profile
        #[clap(long, default_value = "/tmp")]
        output_dir: PathBuf,
    },
}

pub fn parse_from_args() -> ProfiledOpts {
    parse_from(env::args_os())
}

pub fn parse_from<I, T>(args: I) -> ProfiledOpts
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    ProfiledOpts::try_parse_from(args).unwrap_or_else(|e| e.exit())
}

fn show_backtrace() -> bool {
    if log::max_level() >= log::LevelFilter::Debug {
        return true;
    }

    if let Ok(true) = env::var("RUST_BACKTRACE").map(|s| s == "1") {
        return true;
    }

    false
}

pub fn report_error(e: &anyhow::Error) {
    // One line with every cause, unless the user asked for more.
    if show_backtrace() {
        log::error!("{:?}", e);
    } else {
        log::error!("{:#}", e);
    }
}
