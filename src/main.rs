//! dbrheo binary entry point.

use std::process::ExitCode;

use clap::Parser;

use dbrheo::cli::{self, Cli};
use dbrheo::logging;

#[tokio::main]
async fn main() -> ExitCode {
    // .env files are a convenience for API keys; absence is fine.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    if cli.headless() {
        logging::init_stderr_logging(cli.debug);
    } else {
        logging::init_file_logging(cli.debug);
    }

    match cli::run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}
