use std::net::SocketAddr;

use clap::Parser;
use loanplan::api::{Cli, Command, run_http_server, run_plan_file};
use loanplan::telemetry;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = telemetry::init(&cli.log_level) {
        eprintln!("{e}");
        std::process::exit(2);
    }

    let engine = match cli.engine_config() {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "invalid solver configuration");
            std::process::exit(2);
        }
    };

    match &cli.command {
        Command::Serve { host, port } => {
            if let Err(e) = run_http_server(SocketAddr::new(*host, *port), engine).await {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        Command::Plan { input, pretty } => match run_plan_file(input, &engine, *pretty) {
            Ok(body) => println!("{body}"),
            Err(e) => {
                error!(error = %e, "planning failed");
                std::process::exit(e.exit_code());
            }
        },
    }
}
