use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process;
use std::thread;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pagedb::database::{Database, DatabaseConfig};
use pagedb::file::DEFAULT_CACHE_PAGES;
use pagedb::server;

/// Paged collection database server
#[derive(Debug, Parser)]
#[command(name = "pagedb", version)]
struct Args {
    /// Directory holding the catalog and collection files
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// TCP port to listen on
    #[arg(short, long, default_value_t = 9000)]
    port: u16,

    /// Maximum number of pages mapped at once
    #[arg(long, default_value_t = DEFAULT_CACHE_PAGES)]
    cache_pages: usize,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!(error = %e, "server failed");
        process::exit(1);
    }
}

fn run(args: Args) -> server::ServerResult<()> {
    let config = DatabaseConfig {
        data_dir: args.data_dir,
        cache_pages: args.cache_pages,
    };
    let database = Database::open(&config)?;
    let handle = server::start(("0.0.0.0", args.port), database)?;

    // `quit` on standard input stops the server cleanly. Without a console
    // the server runs until it is killed.
    let mut console_closed = true;
    for line in io::stdin().lock().lines() {
        let line = line?;
        match line.trim() {
            "quit" | "exit" => {
                console_closed = false;
                break;
            }
            "" => {}
            other => info!(command = other, "unknown console command; type quit to stop"),
        }
    }
    if console_closed {
        loop {
            thread::park();
        }
    }
    handle.shutdown()
}
