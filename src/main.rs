use anyhow::Result;
use profiled::cli::{self, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse cli and handle clap errors
    let options = cli::parse_from_args();

    profiled::init_logger(options.log_level);

    let result = match &options.command {
        Commands::Run { config_file } => profiled::daemon::run(config_file.as_deref()).await,
        Commands::GenerateProfile {
            activity_dump_file,
            output_dir,
        } => profiled::daemon::generate_profile(activity_dump_file, output_dir),
    };

    match result {
        Ok(_) => std::process::exit(0),
        Err(e) => {
            cli::report_error(&e);
            std::process::exit(1);
        }
    }
}
