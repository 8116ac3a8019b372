use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tenant_secrets::{
    Config, CredentialChecker, CredentialLifecycle, ExpiryNotifier, MasterKey, Owner,
    OwnerRegistry, PostgresStorage, PreferenceStore, Result, VaultError,
};

struct CliArgs {
    generate_key: bool,
    help: bool,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    CliArgs {
        generate_key: args.iter().any(|a| a == "--generate-key" || a == "-g"),
        help: args.iter().any(|a| a == "--help" || a == "-h"),
    }
}

fn print_help() {
    eprintln!(
        r#"tenant-secrets - per-tenant secret and preference store

Runs the periodic credential expiry check against PostgreSQL.

USAGE:
    tenant-secrets [OPTIONS]

OPTIONS:
    -g, --generate-key   Print a fresh MASTER_KEY_BASE64 and exit
    -h, --help           Print this help

ENVIRONMENT VARIABLES:
    MASTER_KEY_BASE64                 base64 of 32 random bytes (required)
    DATABASE_URL                      PostgreSQL URL (required)
    SQL_TIMEOUT_MS                    per query timeout (default: 1000)
    CREDENTIAL_LEAD_WINDOW_SECS       expiring-soon window (default: 21600)
    CREDENTIAL_CHECK_INTERVAL_SECS    check interval (default: 300)
    CREDENTIAL_CHECK_MAX_JITTER_MS    max delay between users (default: 0)
    RUST_LOG                          log filter (default: tenant_secrets=info)
"#
    );
}

/// Notifier for the standalone service: records the event in the log. Chat
/// integrations plug in their own `ExpiryNotifier`.
struct LogNotifier;

#[async_trait]
impl ExpiryNotifier for LogNotifier {
    async fn notify_expired(&self, owner: &Owner) -> Result<()> {
        warn!(user = %owner.external_id, "credential expired, user must provide a new one");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = parse_args();

    if args.help {
        print_help();
        return ExitCode::SUCCESS;
    }

    if args.generate_key {
        println!("{}", MasterKey::generate().to_base64());
        return ExitCode::SUCCESS;
    }

    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tenant_secrets=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(VaultError::KeyMisconfigured(reason)) => {
            error!(%reason, "master key misconfigured");
            eprintln!("No valid MASTER_KEY_BASE64 configured. A fresh key was generated:");
            println!("{}", MasterKey::generate().to_base64());
            eprintln!("Store it as MASTER_KEY_BASE64 and restart. Keep it safe: data encrypted under it is lost without it.");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "service stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!(?config, "starting credential checker");

    let storage = Arc::new(PostgresStorage::connect(&config.database_url, config.sql_timeout).await?);
    storage.init_schema().await?;

    let lifecycle = CredentialLifecycle::new(
        PreferenceStore::new(Arc::clone(&storage)),
        config.lead_window()?,
    );
    let checker = CredentialChecker::new(
        OwnerRegistry::new(Arc::clone(&storage)),
        lifecycle,
        Arc::new(LogNotifier),
    )
    .with_jitter(config.check_max_jitter);

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut ticker = tokio::time::interval(config.check_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown_rx.changed() => break,
        }
        match checker.run_once(&config.master_key, &mut shutdown_rx).await {
            Ok(report) if report.interrupted => break,
            Ok(_) => {}
            Err(e) if e.is_transient() => warn!(error = %e, "credential check pass failed, retrying next interval"),
            Err(e) => return Err(e),
        }
    }

    storage.pool().close().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Graceful shutdown initiated");
}
