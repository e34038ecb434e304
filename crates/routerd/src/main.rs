use anyhow::Context;
use clap::{Parser, ValueEnum};
use mail_resolve::{ResolveContext, RuleRewriter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

mod config;
mod proto;

use config::RouterConfig;

/// Address resolution daemon.
///
/// Maps internalized recipient addresses to (transport, nexthop,
/// recipient, flags) tuples over the attribute protocol.
#[derive(Debug, Parser)]
#[command(about)]
struct Opt {
    /// Path to the router configuration file.
    #[arg(long, default_value = "/etc/routerd/routerd.toml")]
    config: PathBuf,

    /// Listen address for the resolver endpoint, overriding the
    /// configuration file.
    #[arg(long)]
    listen: Option<String>,

    /// How diagnostic logs render. full and compact are intended for
    /// human consumption; json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
enum DiagnosticFormat {
    Full,
    Compact,
    Json,
}

fn init_logging(diag_format: DiagnosticFormat) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_new(
        std::env::var("ROUTERD_LOG")
            .as_deref()
            .unwrap_or("routerd=info,mail_resolve=info"),
    )?;

    let layer = fmt::layer()
        .with_thread_names(true)
        .with_writer(std::io::stderr);
    let layer = match diag_format {
        DiagnosticFormat::Full => layer.boxed(),
        DiagnosticFormat::Compact => layer.compact().boxed(),
        DiagnosticFormat::Json => layer.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .init();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run(opts))
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    init_logging(opts.diag_format)?;

    let config = RouterConfig::load(&opts.config)?;
    let listen = opts.listen.clone().unwrap_or_else(|| config.listen.clone());
    let ctx = Arc::new(
        config
            .build_context()
            .context("building resolver context")?,
    );

    serve(&listen, ctx).await
}

async fn serve(listen: &str, ctx: Arc<ResolveContext>) -> anyhow::Result<()> {
    let rewriter = Arc::new(RuleRewriter::for_context(&ctx));
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding resolver endpoint {listen}"))?;
    tracing::info!("resolver service listening on {listen}");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM received, finishing current requests");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("interrupted, finishing current requests");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accepting resolver client")?;
                let ctx = ctx.clone();
                let rewriter = rewriter.clone();
                let shutdown = shutdown_rx.clone();
                connections.spawn(async move {
                    if let Err(err) =
                        proto::serve_connection(stream, &ctx, &*rewriter, shutdown).await
                    {
                        tracing::debug!("client {peer}: {err}");
                    }
                });
            }
            // Reap finished connections as we go.
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    // Stop accepting, let in-flight requests complete, then exit cleanly.
    drop(listener);
    shutdown_tx.send(true).ok();
    while connections.join_next().await.is_some() {}
    Ok(())
}
