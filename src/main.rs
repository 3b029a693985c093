//! snippet-pool command line entry point.
//!
//! ## Subcommands
//!
//! - `snippet-pool eval <CODE>...` - Evaluate snippets on a pool, one JSON result per line
//! - `snippet-pool worker` - Serve the worker protocol on stdin/stdout
//! - `snippet-pool config` - Print the effective configuration

use std::process::ExitCode;
use std::sync::Arc;

use snippet_pool::config::{self as pool_config, PoolConfig};
use snippet_pool::telemetry::{init_logging, LogConfig, LogFormat};
use snippet_pool::transport::ProcessTransportFactory;
use snippet_pool::{worker, EchoEvaluator, Pool, Task};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    match command {
        "eval" => run_eval(&args[2..]).await,
        "worker" => {
            // stdout carries the protocol, so nothing else may write to it.
            match worker::serve_stdio(Arc::new(EchoEvaluator::factory())) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Worker error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        "config" => match load_config(&args[2..]) {
            Ok(config) => {
                println!("{:#?}", config);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Configuration error: {}", e);
                ExitCode::from(2u8)
            }
        },
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("snippet-pool {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

/// `--config FILE` reads TOML; otherwise `SNIPPET_POOL_*` variables apply.
fn load_config(args: &[String]) -> Result<PoolConfig, pool_config::ConfigError> {
    match flag_value(args, "--config") {
        Some(path) => pool_config::load_file(path),
        None => {
            let config = pool_config::load();
            config.validate()?;
            Ok(config)
        }
    }
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1)).map(|s| s.as_str())
}

async fn run_eval(args: &[String]) -> ExitCode {
    let log = LogConfig {
        format: if args.iter().any(|a| a == "--pretty") { LogFormat::Pretty } else { LogFormat::Json },
        level: std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()),
        output_path: None,
    };
    if let Err(e) = init_logging(&log) {
        eprintln!("Logging setup failed: {}", e);
    }

    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(2u8);
        }
    };

    let snippets: Vec<Task> = code_args(args).map(Task::new).collect();
    if snippets.is_empty() {
        eprintln!("Nothing to evaluate");
        print_usage();
        return ExitCode::FAILURE;
    }

    let mut builder = Pool::builder(Arc::new(EchoEvaluator::factory())).config(config);
    if args.iter().any(|a| a == "--process") {
        match std::env::current_exe() {
            Ok(exe) => builder = builder.transport(Arc::new(ProcessTransportFactory::new(exe).arg("worker"))),
            Err(e) => {
                eprintln!("Cannot locate worker executable: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }
    let pool = match builder.build().await {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("Failed to start pool: {}", e);
            return ExitCode::from(2u8);
        }
    };

    let results = pool.eval_code_batch(snippets).await;
    let mut failed = false;
    for result in &results {
        let line = match result {
            Ok(value) => serde_json::json!({ "value": value }),
            Err(error) => {
                failed = true;
                serde_json::json!({ "error": error })
            }
        };
        println!("{}", line);
    }
    pool.dispose();

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Positional arguments, skipping flags and flag values.
fn code_args(args: &[String]) -> impl Iterator<Item = &str> {
    let mut skip_next = false;
    args.iter().filter_map(move |arg| {
        if skip_next {
            skip_next = false;
            return None;
        }
        match arg.as_str() {
            "--config" => {
                skip_next = true;
                None
            }
            "--process" | "--pretty" => None,
            code => Some(code),
        }
    })
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "snippet-pool v{}

USAGE:
    snippet-pool [COMMAND] [OPTIONS]

COMMANDS:
    eval <CODE>...   Evaluate each snippet on the pool, printing one JSON result per line
    worker           Serve the worker protocol on stdin/stdout
    config           Print the effective configuration
    version          Show version information
    help             Show this help message

OPTIONS:
    --config FILE    Load configuration from a TOML file
    --process        Run workers as child processes instead of threads
    --pretty         Human readable logs

ENVIRONMENT:
    SNIPPET_POOL_*   Pool configuration (see the config module docs)
    RUST_LOG         Log filter (default: warn)

EXIT CODES:
    0  Success
    1  A snippet failed
    2  Configuration error",
        version
    );
}
