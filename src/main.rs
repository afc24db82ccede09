mod cli;
mod codec;
mod config;
mod dispatch;
mod error;
mod logging;
mod net;
mod proxy;
mod pty;
mod signals;
mod socks;
mod state;
mod tty;

use clap::Parser;
use slog_scope::error;

use cli::Cli;

fn main() {
    println!("\npscl: interactive port forwarding over an existing PTY session\n");

    // -h and anything unrecognized both print usage and leave with status 0.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            std::process::exit(0);
        }
    };

    if std::env::var("SHELL").is_err() {
        println!("pscl: No $SHELL set in environment. Exiting.");
        std::process::exit(1);
    }

    match &cli.log_file {
        Some(path) => {
            if let Err(e) = logging::init_file(path, cli.verbose) {
                eprintln!("pscl: cannot open log file: {}", e);
                std::process::exit(1);
            }
        }
        None => logging::init_terminal(cli.verbose),
    }

    if let Err(e) = signals::install() {
        error!("signal_setup_failed"; "error" => e.to_string());
        std::process::exit(1);
    }

    let config = config::Config::from_cli(&cli);
    let listeners = config::bind_listeners(&config);

    println!("\npscl: Waiting for the remote session to appear ...");

    match proxy::run(listeners) {
        Ok(()) => println!("pscl: exiting"),
        Err(e) => {
            error!("session_failed"; "error" => e.to_string());
            eprintln!("pscl: {}", e);
            std::process::exit(1);
        }
    }
}
