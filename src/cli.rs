use clap::Parser;
use std::{
    path::{Path, PathBuf},
    process,
};

use crate::{browser, config::ServeConfig, server::Server};

const USAGE: &str = "Usage: servedir [--port N] [--open] [DIRECTORY]";

#[derive(Parser)]
#[command(name = "servedir", version, about = "Serve a directory over HTTP")]
struct Cli {
    /// Directory to serve (defaults to the current directory)
    #[arg(value_name = "DIRECTORY")]
    directory: Vec<PathBuf>,

    /// Port to listen on (0 for any free port)
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// Open the default browser once the server is listening
    #[arg(long)]
    open: bool,

    /// Enable debug logging
    #[arg(long)]
    verbose: bool,
}

pub fn execute() {
    let cli = Cli::parse();

    // logs go to stderr; stdout carries only the serving line
    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .init();

    if cli.directory.len() > 1 {
        println!("{USAGE}");
        process::exit(1);
    }

    let dir = cli
        .directory
        .into_iter()
        .next()
        .unwrap_or_else(|| PathBuf::from("."));
    let root_dir = absolute_dir(&dir);

    let config = ServeConfig::new(root_dir.clone(), cli.port, cli.open);

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Error creating listener: {e}");
            process::exit(1);
        }
    };

    let url = match server.url() {
        Ok(url) => url,
        Err(e) => {
            eprintln!("Error creating listener: {e}");
            process::exit(1);
        }
    };

    println!("Serving {} on {}", root_dir.display(), url);

    if cli.open {
        browser::open_delayed(url);
    }

    if let Err(e) = server.run() {
        eprintln!("Error starting server: {e}");
        process::exit(1);
    }
}

/// Resolves a possibly relative directory against the current working
/// directory, lexically. No existence check: a bad directory surfaces
/// per-request, not at startup.
fn absolute_dir(dir: &Path) -> PathBuf {
    std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf())
}
