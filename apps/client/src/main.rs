use std::io::Write;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use levias_client::{
    cli::{Cli, Mode},
    exit_code_byte,
    proxy::Proxy,
};
use levias_token::FileTokenSource;
use tokio::{net::TcpListener, process::Command};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let proxy = Proxy::new(&cli.url, FileTokenSource::new(cli.token_path.clone()))?;
    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("bind local engine endpoint {}", cli.listen))?;
    let local_addr = listener.local_addr()?;
    let docker_host = format!("tcp://{local_addr}");
    info!(upstream = %cli.url, docker_host = %docker_host, "local engine endpoint ready");

    let server = tokio::spawn(async move { axum::serve(listener, proxy.router()).await });

    match cli.mode() {
        Mode::Daemon => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "DOCKER_HOST={docker_host}")?;
            stdout.flush()?;
            drop(stdout);
            server.await??;
            Ok(ExitCode::SUCCESS)
        }
        Mode::Docker(args) => {
            let status = Command::new(&cli.docker_bin)
                .args(&args)
                .env("DOCKER_HOST", &docker_host)
                .status()
                .await
                .with_context(|| format!("run {}", cli.docker_bin))?;
            server.abort();
            std::io::stdout().flush()?;
            std::io::stderr().flush()?;
            Ok(ExitCode::from(exit_code_byte(status.code())))
        }
    }
}
