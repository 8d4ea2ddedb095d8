//! Site connector CLI
//!
//! Connects a site in one shot (discover, then confirm the suggested or the
//! given endpoints), changes settings, triggers syncs, and runs the
//! scheduled sync driver.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use site_sync::{
    format_last_sync, start_scheduler, Config, ConnectionConfig, ConnectionId, ConnectionService,
    ConnectorDeps, ExtractionMode, HttpImporter, HttpSiteDiscovery, PostgresConnectionStore, Role,
    StepKind, SyncInterval, SyncRunner, BaseConnectionStore,
};

#[derive(Parser)]
#[command(name = "site-sync")]
#[command(about = "Connect a CMS site and keep its community and property feeds synced")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover a site's endpoints and print the ranked suggestions
    Discover { url: String },

    /// Connect (or re-map) a site
    Connect {
        url: String,
        /// Reuse an existing connection id (re-map instead of creating a new one)
        #[arg(long)]
        id: Option<ConnectionId>,
        /// Community endpoint; defaults to the top suggestion
        #[arg(long)]
        community: Option<String>,
        /// Property endpoint; defaults to the top suggestion
        #[arg(long)]
        property: Option<String>,
        /// Don't sync communities
        #[arg(long, conflicts_with = "community")]
        no_community: bool,
        /// Don't sync properties
        #[arg(long, conflicts_with = "property")]
        no_property: bool,
    },

    /// List saved connections
    List,

    /// Show one connection
    Status { id: ConnectionId },

    /// Set the sync interval of a role (manual, hourly_1 .. hourly_12, daily)
    Interval {
        id: ConnectionId,
        role: Role,
        interval: SyncInterval,
    },

    /// Remap one role; omit the endpoint to stop syncing it
    Endpoint {
        id: ConnectionId,
        role: Role,
        rest_base: Option<String>,
    },

    /// Set the extraction mode (standard, ai)
    Mode { id: ConnectionId, mode: ExtractionMode },

    /// Sync one role now
    Sync {
        id: ConnectionId,
        role: Role,
        /// Drop and re-import everything
        #[arg(long)]
        full: bool,
    },

    /// Disconnect a site
    Disconnect {
        id: ConnectionId,
        /// Also delete every record synced through this connection
        #[arg(long)]
        delete_synced_data: bool,
        /// Confirmation word required with --delete-synced-data
        #[arg(long)]
        confirm: Option<String>,
    },

    /// Run the scheduled sync driver until interrupted
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,site_sync=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().context("Failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let store = Arc::new(PostgresConnectionStore::new(pool));
    let deps = ConnectorDeps::new(
        Arc::new(HttpSiteDiscovery::new(&config.discovery_service_url)?),
        Arc::new(HttpImporter::new(&config.import_service_url)?),
        store.clone(),
    )
    .with_timeouts(config.timeouts());

    match cli.command {
        Commands::Discover { url } => {
            let service = ConnectionService::new(deps, ConnectionId::new());
            service.submit_url(&url).await?;
            print_json(&service.snapshot().await)?;
        }

        Commands::Connect {
            url,
            id,
            community,
            property,
            no_community,
            no_property,
        } => {
            let service = match id {
                Some(id) => ConnectionService::load(deps, id).await?,
                None => ConnectionService::new(deps, ConnectionId::new()),
            };
            if service.step().await == StepKind::Connected {
                service.edit_connection().await?;
            }

            service.submit_url(&url).await?;

            let resolver_empty = service
                .snapshot()
                .await
                .rankings
                .map_or(true, |rankings| rankings.community.is_empty());

            let saved = if resolver_empty {
                println!("No custom content types found; connecting without sync.");
                service.confirm_without_sync().await?
            } else {
                let pick = |explicit: Option<String>, skip: bool, suggested: Option<String>| {
                    if skip {
                        None
                    } else {
                        explicit.or(suggested)
                    }
                };
                let selected = service
                    .snapshot()
                    .await
                    .selected
                    .unwrap_or_default();
                service
                    .confirm_mapping(
                        pick(community, no_community, selected.community),
                        pick(property, no_property, selected.property),
                    )
                    .await?
            };

            if saved.has_role_conflict() {
                println!("Warning: the same endpoint feeds both communities and properties.");
            }
            print_config(&saved);
        }

        Commands::List => {
            let now = Utc::now();
            for config in store.list().await? {
                println!(
                    "{}  {}  community: {} ({})  property: {} ({})",
                    config.connection_id,
                    config.site_url,
                    config.endpoint(Role::Community).unwrap_or("-"),
                    format_last_sync(config.last_sync(Role::Community), now),
                    config.endpoint(Role::Property).unwrap_or("-"),
                    format_last_sync(config.last_sync(Role::Property), now),
                );
            }
        }

        Commands::Status { id } => {
            let service = ConnectionService::load(deps, id).await?;
            print_json(&service.snapshot().await)?;
        }

        Commands::Interval { id, role, interval } => {
            let service = ConnectionService::load(deps, id).await?;
            print_config(&service.update_sync_interval(role, interval).await?);
        }

        Commands::Endpoint { id, role, rest_base } => {
            let service = ConnectionService::load(deps, id).await?;
            print_config(&service.update_endpoint(role, rest_base.as_deref()).await?);
        }

        Commands::Mode { id, mode } => {
            let service = ConnectionService::load(deps, id).await?;
            print_config(&service.update_extraction_mode(mode).await?);
        }

        Commands::Sync { id, role, full } => {
            let service = ConnectionService::load(deps, id).await?;
            let outcome = service.trigger_sync(role, full).await?;
            println!("Synced {} {} records", outcome.item_count, role);
        }

        Commands::Disconnect {
            id,
            delete_synced_data,
            confirm,
        } => {
            let service = ConnectionService::load(deps, id).await?;
            service
                .disconnect(delete_synced_data, confirm.as_deref())
                .await?;
            println!("Disconnected {}", id);
        }

        Commands::Run => {
            let runner = SyncRunner::new(deps);
            let mut scheduler = start_scheduler(runner, &config.sync_cron).await?;
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            tracing::info!("Shutting down sync scheduler");
            scheduler.shutdown().await?;
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_config(config: &ConnectionConfig) {
    let now = Utc::now();
    println!("Connection {} → {}", config.connection_id, config.site_url);
    println!("  extraction: {}", config.extraction_mode);
    for role in Role::ALL {
        println!(
            "  {:<9} endpoint: {:<16} interval: {:<14} last sync: {} ({} items)",
            role.as_str(),
            config.endpoint(role).unwrap_or("(don't sync)"),
            config.interval(role).label(),
            format_last_sync(config.last_sync(role), now),
            config.count(role),
        );
        if let Some(error) = &config.sync[role].last_error {
            println!("            last error: {}", error);
        }
    }
}
