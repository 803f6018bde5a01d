//! nwcd: Nostr Wallet Connect daemon.
//!
//! Connects a Lightning node to a Nostr relay and serves NIP-47 wallet
//! requests from registered apps. App registration happens through the CLI;
//! the protocol engine only ever sees apps through the registry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nostr::{generate_secret_key, get_public_key_hex, WalletConnectUrl};
use nostr_client::{RelayClient, RelayConfig};
use nwcd::analytics::LogSink;
use nwcd::config::{LnBackendType, Settings};
use nwcd::db::{BudgetRenewal, Db, PermissionSpec};
use nwcd::lnclient::{AlbyClient, LnClient, LndClient};
use nwcd::service::Service;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "nwcd", author, version, about = "Nostr Wallet Connect daemon")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Connect to the relay and serve wallet requests.
    Serve,
    /// Register a connected app and print its pairing URL.
    CreateApp {
        /// Display name for the app.
        #[arg(long)]
        name: String,
        /// Existing app pubkey; a fresh keypair is generated when omitted.
        #[arg(long)]
        pubkey: Option<String>,
        /// Comma-separated method scopes to grant.
        #[arg(
            long,
            default_value = "pay_invoice,get_balance,get_info,make_invoice,lookup_invoice,list_transactions"
        )]
        scopes: String,
        /// Budget for the payment scope, in millisats (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        budget_msats: u64,
        /// Budget window: none, daily, weekly, monthly or yearly.
        #[arg(long, default_value = "none")]
        budget_renewal: String,
        /// Expiry as a unix timestamp in seconds.
        #[arg(long)]
        expires_at: Option<u64>,
    },
    /// List registered apps.
    ListApps,
    /// Delete an app by pubkey (its request history is kept).
    DeleteApp {
        pubkey: String,
    },
    /// List recent payments.
    ListPayments {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::from_env(&cli.env)?;
    let db = Db::open(&settings.database_uri)?;

    match cli.command {
        Commands::Serve => serve(settings, db).await,
        Commands::CreateApp {
            name,
            pubkey,
            scopes,
            budget_msats,
            budget_renewal,
            expires_at,
        } => create_app(
            &settings,
            &db,
            &name,
            pubkey,
            &scopes,
            budget_msats,
            &budget_renewal,
            expires_at,
        ),
        Commands::ListApps => {
            for app in db.list_apps()? {
                let scopes: Vec<String> = db
                    .app_permissions(app.id)?
                    .into_iter()
                    .map(|p| p.scope)
                    .collect();
                println!("{}  {}  [{}]", app.nostr_pubkey, app.name, scopes.join(", "));
            }
            Ok(())
        }
        Commands::DeleteApp { pubkey } => {
            let app = db
                .find_app_by_pubkey(&pubkey)?
                .with_context(|| format!("no app with pubkey {}", pubkey))?;
            db.delete_app(app.id)?;
            println!("deleted app {}", app.name);
            Ok(())
        }
        Commands::ListPayments { limit } => {
            for payment in db.list_payments(limit)? {
                println!(
                    "{}  app={}  {} msat  {}",
                    payment.created_at,
                    payment.app_id,
                    payment.amount_msats,
                    payment
                        .preimage
                        .as_deref()
                        .map(|_| "settled")
                        .unwrap_or("unknown"),
                );
            }
            Ok(())
        }
    }
}

async fn serve(settings: Settings, db: Db) -> Result<()> {
    let ln: Arc<dyn LnClient> = match settings.ln_backend {
        LnBackendType::Alby => Arc::new(AlbyClient::new(
            &settings.alby_api_url,
            settings.alby_access_token.as_deref().unwrap_or_default(),
        )),
        LnBackendType::Lnd => Arc::new(LndClient::new(
            settings.lnd_address.as_deref().unwrap_or_default(),
            settings.lnd_cert_file.as_deref(),
            settings.lnd_macaroon_file.as_deref().unwrap_or_default(),
        )?),
    };

    let relay = Arc::new(RelayClient::new(&settings.relay, RelayConfig::default())?);
    let service = Arc::new(Service::new(
        db,
        ln,
        Arc::new(LogSink),
        relay.clone(),
        settings.nostr_privkey,
        settings.handler_concurrency,
        Duration::from_secs(settings.ln_timeout_secs),
    )?);

    info!(pubkey = %service.identity_pubkey(), relay = %settings.relay, "starting nwcd");

    let signal_service = service.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down");
            signal_service.shutdown();
        }
    });

    service.run(relay, settings.subscription_grace_secs).await
}

#[allow(clippy::too_many_arguments)]
fn create_app(
    settings: &Settings,
    db: &Db,
    name: &str,
    pubkey: Option<String>,
    scopes: &str,
    budget_msats: u64,
    budget_renewal: &str,
    expires_at_secs: Option<u64>,
) -> Result<()> {
    let renewal = BudgetRenewal::parse(budget_renewal)
        .with_context(|| format!("invalid budget renewal: {}", budget_renewal))?;
    let expires_at = expires_at_secs.map(|secs| secs * 1_000);

    let permissions: Vec<PermissionSpec> = scopes
        .split(',')
        .map(str::trim)
        .filter(|scope| !scope.is_empty())
        .map(|scope| PermissionSpec {
            scope: scope.to_string(),
            max_amount_msats: if scope == "pay_invoice" { budget_msats } else { 0 },
            budget_renewal: renewal,
            expires_at,
        })
        .collect();

    // Without an existing pubkey we mint the app keypair and hand out its
    // secret in the pairing URL
    let (app_pubkey, app_secret) = match pubkey {
        Some(pubkey) => (pubkey, None),
        None => {
            let secret = generate_secret_key();
            (get_public_key_hex(&secret)?, Some(secret))
        }
    };

    let app = db.create_app(name, &app_pubkey, &permissions)?;
    println!("created app {} ({})", app.name, app.nostr_pubkey);

    if let Some(secret) = app_secret {
        let url = WalletConnectUrl {
            pubkey: get_public_key_hex(&settings.nostr_privkey)?,
            relay: settings.relay.clone(),
            secret: hex::encode(secret),
        };
        println!("pairing URL: {}", url);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("nwcd=info".parse()?)
                .add_directive("nostr_client=info".parse()?),
        )
        .init();

    run(Cli::parse()).await
}
