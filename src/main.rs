use clap::Parser;
mod cli;
mod error;
mod merkle;
mod repository;
mod tag;
mod tagbase;
mod util;

#[cfg(debug_assertions)]
const MAX_LEVEL: tracing::Level = tracing::Level::TRACE;
#[cfg(not(debug_assertions))]
const MAX_LEVEL: tracing::Level = tracing::Level::ERROR;

fn main() {
    tracing_subscriber::fmt().with_max_level(MAX_LEVEL).init();

    let cli = cli::Cli::parse();
    let json = cli.json;
    if let Err(e) = cli.run() {
        if json {
            println!("{}", serde_json::json!({ "error": e.to_string() }));
        } else {
            eprintln!("Error: {}", e);
        }
        std::process::exit(1);
    }
}
