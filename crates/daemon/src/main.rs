#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! `gitops-daemon`: reconciles this host with its git remotes and serves the
//! control surface.

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use gitops_core::api::GateKind;
use gitops_daemon::builder::BuilderOptions;
use gitops_daemon::config::Config;
use gitops_daemon::exec::CommandExecutor;
use gitops_daemon::git::{GitRepo, Repository};
use gitops_daemon::history::History;
use gitops_daemon::hooks::Hook;
use gitops_daemon::http;
use gitops_daemon::manager::{Components, Manager};
use gitops_daemon::selector::Selector;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gitops-daemon")]
struct Args {
    /// Configuration file (TOML).
    #[arg(long, default_value = "/etc/gitops/config.toml")]
    config: PathBuf,

    /// Listen address, overrides `listen` from the configuration.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (env-filter syntax).
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::load_from(&args.config)?;
    let listen = match args.listen {
        Some(addr) => addr,
        None => cfg
            .listen
            .parse()
            .with_context(|| format!("invalid listen address {}", cfg.listen))?,
    };

    let state_dir = cfg.state_dir();
    tokio::fs::create_dir_all(&state_dir)
        .await
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;

    let repo = GitRepo::open(cfg.repo_dir(), &cfg.remotes).await?;
    let repo_path = repo.path().to_path_buf();
    let hostname = cfg.hostname();
    let hook_timeout = Duration::from_secs(cfg.hooks.timeout_secs);
    let hook = |name, template: &Option<String>| {
        template
            .as_ref()
            .map(|t| Hook::new(name, t.clone(), hook_timeout))
    };

    let components = Components {
        hostname: hostname.clone(),
        selector: Selector::new(repo, cfg.remotes.clone(), cfg.signing_keys()),
        executor: Arc::new(CommandExecutor::new(&cfg.executor)),
        builder: BuilderOptions {
            hostname: hostname.clone(),
            repo_path,
            local_machine_id: cfg.local_machine_id(),
            eval_timeout: Duration::from_secs(cfg.executor.eval_timeout_secs),
            build_timeout: Duration::from_secs(cfg.executor.build_timeout_secs),
        },
        build_confirmation: cfg.confirm_mode(GateKind::Build)?,
        deploy_confirmation: cfg.confirm_mode(GateKind::Deploy)?,
        history: Arc::new(History::load(cfg.history_path(), cfg.history_capacity).await),
        liveliness_check: hook("liveliness check", &cfg.hooks.liveliness_check),
        post_deployment: hook("post-deployment hook", &cfg.hooks.post_deployment),
    };

    let manager = Manager::spawn(components).await;
    let app = http::router(manager.clone());

    tracing::info!(listen = %listen, %hostname, remotes = cfg.remotes.len(), "daemon starting");
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
