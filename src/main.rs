use std::{io::Write as _, sync::Arc};

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{EnvFilter, fmt};

use xsw::{
    config::{Cli, Command},
    domain::{PingResult, Server},
    endpoint_probe::{ProbeProgress, ProgressFn},
    manager::ServerManager,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = cli.config;
    let command = cli.command.unwrap_or(Command::List);
    if command.loads_subscription() {
        config.validate()?;
    } else {
        config.validate_config_path()?;
    }

    let manager = ServerManager::from_config(&config).context("init server manager")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    match command {
        Command::List => {
            let servers = manager.load(&cancel).await.context("load servers")?;
            for server in &servers {
                println!("{}", server_line(server));
            }
        }
        Command::Ping(args) => {
            manager.load(&cancel).await.context("load servers")?;
            let progress: Arc<ProgressFn> = Arc::new(|p: ProbeProgress| {
                let mut stderr = std::io::stderr().lock();
                let _ = write!(stderr, "\rprobed {}/{}", p.done, p.total);
                if p.done == p.total {
                    let _ = writeln!(stderr);
                }
            });
            let results = if args.top > 0 {
                manager.fastest(args.top, Some(progress), &cancel).await
            } else {
                manager.test_ping(Some(progress), &cancel).await
            }
            .context("probe servers")?;
            for result in &results {
                println!("{}", ping_line(result));
            }
        }
        Command::Switch(args) => {
            manager.load(&cancel).await.context("load servers")?;
            let server = manager
                .switch(&args.id)
                .await
                .with_context(|| format!("switch to {}", args.id))?;
            println!("switched to {}", server_line(&server));
        }
        Command::Current => {
            manager.load(&cancel).await.context("load servers")?;
            let server = manager
                .detect_current()
                .await
                .context("detect current server")?;
            println!("{}", server_line(&server));
        }
        Command::Status => {
            manager.load(&cancel).await.context("load servers")?;
            if let Err(err) = manager.detect_current().await {
                warn!(error = %err, "current server unknown");
            }
            let status = manager.status().await;
            println!("servers: {}", status.total);
            match status.current.as_ref() {
                Some(server) => println!("current: {}", server_line(server)),
                None => println!("current: unknown"),
            }
            match status.last_loaded_at {
                Some(at) => println!("last loaded: {}", at.to_rfc3339()),
                None => println!("last loaded: never"),
            }
        }
        Command::Refresh => {
            let servers = manager.refresh(&cancel).await.context("refresh servers")?;
            println!("loaded {} servers", servers.len());
        }
        Command::Restore => {
            let backup = manager
                .restore_latest()
                .await
                .context("restore xray config")?;
            println!("restored {}", backup.display());
        }
        Command::ShowConfig => {
            let current = manager
                .switcher()
                .get_current_config()
                .await
                .context("read xray config")?;
            println!("{}", serde_json::to_string_pretty(&current.as_value())?);
        }
    }

    Ok(())
}

fn server_line(server: &Server) -> String {
    format!(
        "{}\t{}\t{}:{}",
        server.id, server.name, server.address, server.port
    )
}

fn ping_line(result: &PingResult) -> String {
    match (result.available, result.error.as_ref()) {
        (true, _) => format!("{}\t{}ms", server_line(&result.server), result.latency_ms),
        (false, Some(err)) => format!("{}\tunavailable: {err}", server_line(&result.server)),
        (false, None) => format!("{}\tunavailable", server_line(&result.server)),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
