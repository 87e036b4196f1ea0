use std::fs;

use tracing_subscriber::EnvFilter;

use orchestra::cli::{self, Cli};
use orchestra::runtime;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = cli::parse_args();
    init_logging(&cli);
    cli::run(cli).await
}

fn init_logging(cli: &Cli) {
    let filter = if let Some(level) = cli.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let log_dir = runtime::log_dir();
    if let Err(err) = fs::create_dir_all(&log_dir) {
        eprintln!("failed to create log directory {log_dir:?}: {err}");
    }
    let log_path = log_dir.join("orchestra.log");

    let file = match fs::OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {log_path:?}: {err}");
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            return;
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(move || file.try_clone().expect("clone log file handle"))
        .with_ansi(false)
        .try_init();
}
