//! Storefront Gateway - single entry point for the storefront services
//!
//! Validates bearer credentials, throttles authenticated clients and forwards
//! requests to the auth, catalog, cart and order services.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use storefront_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::{Gateway, RouteTable},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Routes) => run_routes(&cli),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Print the route registry and route table
fn run_routes(cli: &Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let table = match RouteTable::new(&config.services) {
        Ok(table) => table,
        Err(e) => {
            eprintln!("Invalid route table: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("Services:");
    for (name, address) in table.entries() {
        println!("  {name:<10} {address}");
    }

    println!("\nRoutes:");
    for route in &config.routes {
        let access = if route.protected { "protected" } else { "public" };
        let target = table.resolve(&route.service).unwrap_or("<unresolved>");
        println!(
            "  {:<7} {:<32} {:<10} -> {}{}",
            route.method, route.path, access, target, route.upstream
        );
    }

    ExitCode::SUCCESS
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        services = config.services.len(),
        routes = config.routes.len(),
        "Starting Storefront Gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
