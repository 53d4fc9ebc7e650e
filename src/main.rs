use kindle_highlights::config::Config;
use kindle_highlights::sync;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "warn" };
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = format!("kindle_highlights={}", log_level).parse() {
        filter = filter.add_directive(directive);
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_logging(config.verbose);

    if config.dry_run {
        println!("Dry run: {}", config.notes_dir().display());
    } else if !config.list_only {
        println!("Vault: {}", config.notes_dir().display());
    }

    match sync::run(&config) {
        Ok(report) => {
            println!("{}", report);
            if report.has_failures() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
