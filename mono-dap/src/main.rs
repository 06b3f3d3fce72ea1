// Mono Debug Adapter - Debug Adapter Protocol bridge for Mono
//
// Serves one client over stdin/stdout, or many over TCP with --server

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mono_dap::engine::SoftDebuggerConnector;
use mono_dap::{serve, AdapterConfig, DebugSession, MessageSink, TraceLevel};
use std::fs::File;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEFAULT_SERVER_PORT: &str = "4711";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TraceArg {
    Request,
    Response,
}

#[derive(Debug, Parser)]
#[command(name = "mono-dap", version, about)]
struct Cli {
    /// Accept clients on a TCP port instead of stdin/stdout
    #[arg(
        long,
        value_name = "PORT",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = DEFAULT_SERVER_PORT
    )]
    server: Option<u16>,

    /// Log incoming requests; `--trace=response` also logs responses
    #[arg(
        long,
        value_enum,
        value_name = "WHAT",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "request"
    )]
    trace: Option<TraceArg>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH", env = "MONO_DEBUG_LOGFILE")]
    log_file: Option<PathBuf>,
}

impl Cli {
    fn trace_level(&self) -> TraceLevel {
        match self.trace {
            None => TraceLevel::Off,
            Some(TraceArg::Request) => TraceLevel::Requests,
            Some(TraceArg::Response) => TraceLevel::Responses,
        }
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env()
        .add_directive("mono_dap=info".parse()?)
        .add_directive("sdb_client=info".parse()?);

    // Never stdout: in stdio mode it carries the protocol
    match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot create log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

async fn run_session<R, W>(reader: R, writer: W, config: AdapterConfig)
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let trace = config.trace;
    let sink = MessageSink::new(writer, trace);
    let mut session = DebugSession::new(SoftDebuggerConnector, config, sink.clone());
    serve(reader, sink, &mut session, trace).await;
}

async fn run_server(port: u16, config: AdapterConfig) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot listen on {}", addr))?;
    info!("Waiting for debug clients on {}", addr);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed: {}", e);
                continue;
            }
        };

        info!("Client connected from {}", peer);
        stream.set_nodelay(true).ok();
        let config = config.clone();

        // Every client gets its own session
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            run_session(reader, writer, config).await;
            info!("Client {} done", peer);
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_file.as_deref())?;

    info!("Starting Mono debug adapter {}", env!("CARGO_PKG_VERSION"));

    let config = AdapterConfig {
        trace: cli.trace_level(),
        ..AdapterConfig::default()
    };

    match cli.server {
        Some(port) => run_server(port, config).await?,
        None => {
            run_session(tokio::io::stdin(), tokio::io::stdout(), config).await;
        }
    }

    info!("Mono debug adapter shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_server_flag() {
        let cli = Cli::try_parse_from(["mono-dap", "--server"]).unwrap();
        assert_eq!(cli.server, Some(4711));

        let cli = Cli::try_parse_from(["mono-dap", "--server=5000"]).unwrap();
        assert_eq!(cli.server, Some(5000));

        let cli = Cli::try_parse_from(["mono-dap"]).unwrap();
        assert_eq!(cli.server, None);
    }

    #[test]
    fn test_trace_flag() {
        let cli = Cli::try_parse_from(["mono-dap", "--trace"]).unwrap();
        assert_eq!(cli.trace_level(), TraceLevel::Requests);

        let cli = Cli::try_parse_from(["mono-dap", "--trace=response"]).unwrap();
        assert_eq!(cli.trace_level(), TraceLevel::Responses);

        let cli = Cli::try_parse_from(["mono-dap"]).unwrap();
        assert_eq!(cli.trace_level(), TraceLevel::Off);
    }
}
