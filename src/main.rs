use anyhow::Result;
use clap::{Parser, Subcommand};
use lux::{capabilities, config::Config, control::ControlClient, mcp, nix::NixExecutor, server::Server};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "lux",
    about = "LSP multiplexer — one editor-facing server, many language servers behind it",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Log filter (trace, debug, info, warn, error, or a tracing filter)
    #[arg(long, default_value = "info", env = "LUX_LOG")]
    log: String,
}

#[derive(Subcommand)]
enum Command {
    /// Serve LSP on stdio (default when no subcommand given)
    Serve,
    /// Serve MCP tools on stdio
    Mcp,
    /// Add an LSP from a nix flake, discovering its capabilities
    Add { flake: String },
    /// List configured LSPs
    List,
    /// Show status of LSPs in the running server
    Status,
    /// Eagerly start an LSP in the running server
    Start { name: String },
    /// Stop a running LSP to free resources
    Stop { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // stdout is the protocol channel in serve/mcp modes; all logging goes
    // to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(args.log.as_str())
        .with_writer(std::io::stderr)
        .compact()
        .init();

    match args.command {
        None | Some(Command::Serve) => {
            let config = Config::load()?;
            let server = Server::new(config).await?;
            server.run().await
        }
        Some(Command::Mcp) => {
            let config = Config::load()?;
            mcp::serve(config).await
        }
        Some(Command::Add { flake }) => {
            let name = capabilities::bootstrap(Arc::new(NixExecutor::new()), &flake).await?;
            println!("added {name}");
            Ok(())
        }
        Some(Command::List) => {
            let config = Config::load()?;
            if config.lsps.is_empty() {
                println!("No LSPs configured");
                return Ok(());
            }
            for lsp in &config.lsps {
                println!("{:<20} {}", lsp.name, lsp.flake);
                if !lsp.extensions.is_empty() {
                    println!("  extensions: {:?}", lsp.extensions);
                }
                if !lsp.patterns.is_empty() {
                    println!("  patterns:   {:?}", lsp.patterns);
                }
                if !lsp.language_ids.is_empty() {
                    println!("  languages:  {:?}", lsp.language_ids);
                }
            }
            Ok(())
        }
        Some(Command::Status) => {
            let config = Config::load()?;
            let mut client = ControlClient::connect(&config.socket_path()).await?;
            let status = client.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Some(Command::Start { name }) => {
            let config = Config::load()?;
            let mut client = ControlClient::connect(&config.socket_path()).await?;
            client.start(&name).await?;
            println!("started {name}");
            Ok(())
        }
        Some(Command::Stop { name }) => {
            let config = Config::load()?;
            let mut client = ControlClient::connect(&config.socket_path()).await?;
            client.stop(&name).await?;
            println!("stopped {name}");
            Ok(())
        }
    }
}
