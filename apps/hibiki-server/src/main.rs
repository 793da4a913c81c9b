//! Hibiki Server: the streaming server CLI
//!
//! ## Usage
//!
//! ```bash
//! # Default port 8888
//! hibiki-server
//!
//! # Custom port
//! hibiki-server 9999
//! hibiki-server --port 9999
//! ```
//!
//! Once running, an interactive prompt accepts `help`, `status`,
//! `stats`, `fullstats`, `conns`, `clear`, and `quit`/`exit`. SIGINT and
//! SIGTERM both trigger a graceful shutdown.

use std::process::ExitCode;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use hibiki::{AvServer, ServerConfig};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hibiki=info".parse().unwrap()),
        )
        .init();
}

/// Parse `[port]` / `--port <port>` from the command line.
fn parse_port(args: &[String]) -> Result<Option<u16>, String> {
    match args {
        [] => Ok(None),
        [arg] if arg == "--port" => Err("--port requires a value".to_string()),
        [arg] if !arg.starts_with('-') => arg
            .parse::<u16>()
            .map(Some)
            .map_err(|_| format!("invalid port number: {arg}")),
        [flag, value] if flag == "--port" => value
            .parse::<u16>()
            .map(Some)
            .map_err(|_| format!("invalid port number: {value}")),
        _ => Err(format!("unrecognized arguments: {}", args.join(" "))),
    }
}

fn show_help() {
    println!();
    println!("=== Hibiki Server Commands ===");
    println!("help       - Show this help message");
    println!("status     - Show server status (running/stopped)");
    println!("stats      - Show server statistics");
    println!("fullstats  - Show comprehensive statistics (all modules)");
    println!("conns      - Show current connection count");
    println!("clear      - Clear screen");
    println!("quit/exit  - Shutdown server gracefully");
    println!();
}

/// Handle one command line; returns false when the server should exit.
fn process_command(server: &AvServer, line: &str) -> bool {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => true,
        "help" => {
            show_help();
            true
        }
        "status" => {
            if server.is_running() {
                println!("[STATUS] Server is RUNNING");
            } else {
                println!("[STATUS] Server is STOPPED");
            }
            true
        }
        "stats" => {
            println!("\n{}", server.statistics());
            true
        }
        "fullstats" => {
            println!("\n{}", server.comprehensive_report());
            true
        }
        "conns" => {
            println!("[CONNS] Current connections: {}", server.connection_count());
            true
        }
        "clear" => {
            print!("\x1B[2J\x1B[1;1H");
            true
        }
        "quit" | "exit" => {
            println!("[QUIT] Shutting down server...");
            false
        }
        other => {
            println!("[ERROR] Unknown command: {other}");
            println!("[INFO] Type 'help' for available commands");
            true
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(_) => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = ServerConfig::default();
    match parse_port(&args) {
        Ok(Some(port)) => config.port = port,
        Ok(None) => {}
        Err(msg) => {
            eprintln!("error: {msg}");
            return ExitCode::FAILURE;
        }
    }

    info!(
        addr = %config.listen_addr,
        port = config.port,
        max_connections = config.max_connections,
        workers = config.thread_pool_size,
        "hibiki server starting"
    );

    let server = AvServer::new(config);
    if let Err(e) = server.start().await {
        error!(error = %e, "failed to start server");
        eprintln!("error: failed to start server: {e:#}");
        return ExitCode::FAILURE;
    }

    if let Some(addr) = server.local_addr() {
        println!("Listening on {addr}");
    }
    show_help();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        use std::io::Write;
        let _ = std::io::stdout().flush();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n[SIGNAL] Interrupt received, shutting down...");
                break;
            }
            _ = wait_for_sigterm() => {
                println!("\n[SIGNAL] Terminate received, shutting down...");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !process_command(&server, &line) {
                            break;
                        }
                    }
                    // stdin closed (e.g. running detached): wait on signals
                    Ok(None) => {
                        tokio::select! {
                            _ = tokio::signal::ctrl_c() => {}
                            _ = wait_for_sigterm() => {}
                        }
                        println!("\n[SIGNAL] Shutting down...");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "stdin error");
                        break;
                    }
                }
            }
        }
    }

    server.stop().await;
    println!("[SHUTDOWN] Server shutdown complete");
    ExitCode::SUCCESS
}
