//! peerwire-ctl — command-line interface for the peerwire daemon.

mod cmd;

use anyhow::{Context, Result};

use cmd::sessions::{cmd_session_drop, cmd_session_inspect, cmd_sessions};
use cmd::stats::{cmd_node_stats, cmd_stats};
use cmd::status::{cmd_capabilities, cmd_shutdown, cmd_status};

const DEFAULT_PORT: u16 = 9545;

fn print_usage() {
    println!("Usage: peerwire-ctl [--port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                Show daemon status");
    println!("  capabilities          List local sub-protocols and versions");
    println!("  sessions              List sessions");
    println!("  session <id>          Show one session");
    println!("  session drop <id>     Disconnect a session");
    println!("  stats                 List per-node handshake statistics");
    println!("  stats <node_id>       Show statistics for one node");
    println!("  shutdown              Stop the daemon");
    println!();
    println!("Options:");
    println!("  --port <port>   API port (default: {})", DEFAULT_PORT);
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut port = DEFAULT_PORT;
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--port" {
            i += 1;
            port = args
                .get(i)
                .context("--port requires a value")?
                .parse()
                .context("--port must be a number")?;
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    match remaining.as_slice() {
        ["status"] | []                => cmd_status(port).await,
        ["capabilities"]               => cmd_capabilities(port).await,
        ["sessions"]                   => cmd_sessions(port).await,
        ["session", "drop", id]        => cmd_session_drop(port, id).await,
        ["session", id]                => cmd_session_inspect(port, id).await,
        ["stats"]                      => cmd_stats(port).await,
        ["stats", node_id]             => cmd_node_stats(port, node_id).await,
        ["shutdown"]                   => cmd_shutdown(port).await,
        ["help"] | ["--help"] | ["-h"] => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
