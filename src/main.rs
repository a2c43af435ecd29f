use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod dashboard;
mod db;
mod error;
mod ingestion;
mod log_buffer;
mod picks;
mod scheduler;
mod scoreboard;
mod vault;

use config::{parse_leagues, Command, Config, DateArgs};
use dashboard::AppState;
use db::models::{League, ScoreboardGame};
use db::Database;
use ingestion::{today_in, Ingestor};
use log_buffer::LogBuffer;
use picks::{OpenAiPicks, PickGenerator, PickWorker};
use scheduler::{BackgroundTasks, Scheduler};
use scoreboard::{EspnScoreboard, ScoreboardGateway};
use vault::{resolve_secret, CredentialVault, SecretSource, PICKS_API_KEY};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging; the buffer feeds the activity log
    let logs = LogBuffer::default();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(logs.clone())
        .init();

    let config = Config::parse();
    config.validate()?;

    match config.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => {
            let db = open_database(&config)?;
            serve(config, db, logs).await
        }
        Command::Ingest(args) => run_ingest(&config, open_database(&config)?, &args).await,
        Command::Enqueue(args) => run_enqueue(&config, &open_database(&config)?, &args),
        Command::Probe { league, date } => {
            let games = run_probe(&config, league, date).await?;
            println!("{}", serde_json::to_string_pretty(&games)?);
            Ok(())
        }
        Command::SetApiKey { key } => set_api_key(&config, &open_database(&config)?, key),
        Command::Jobs { limit } => {
            let db = open_database(&config)?;
            match db.get_credential(PICKS_API_KEY)? {
                Some(stored) => println!("API key {} stored at {}", stored.name, stored.updated_at),
                None => println!("No API key stored; workers will idle"),
            }
            let snapshot = db.queue_snapshot()?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            println!("{}", serde_json::to_string_pretty(&db.list_jobs(limit)?)?);
            Ok(())
        }
    }
}

async fn serve(config: Config, db: Database, logs: LogBuffer) -> Result<()> {
    let secret = resolve_secret(config.app_secret.as_deref());
    let vault = Arc::new(CredentialVault::new(&secret));
    info!(
        "Credential vault ready (secret {:?}, fingerprint {})",
        secret.source(),
        vault.fingerprint()
    );
    if let Some(stored) = db.get_credential(PICKS_API_KEY)? {
        if vault.open(&stored).is_err() {
            warn!("Stored API key was sealed under a different secret; run `set-api-key` again");
        }
    }

    let leagues = config.leagues()?;
    let ingestor = Arc::new(build_ingestor(&config, db.clone())?);
    let generator: Arc<dyn PickGenerator> = Arc::new(OpenAiPicks::new(
        &config.openai_base_url,
        &config.openai_model,
        &config.openai_reasoning_effort,
        Duration::from_secs(config.pick_timeout_secs),
    )?);

    let mut tasks = BackgroundTasks::new();

    if config.auto_ingest_enabled {
        let scheduler = Scheduler::new(
            ingestor.clone(),
            leagues.clone(),
            config.ingest_interval(),
            config.utc_offset()?,
        );
        tasks.spawn("ingestion-scheduler", |cancel| scheduler.run(cancel));
    } else {
        info!("Auto-ingest disabled (AUTO_INGEST_ENABLED=false)");
    }

    for index in 0..config.auto_picks_concurrency {
        let worker = PickWorker::new(
            db.clone(),
            vault.clone(),
            generator.clone(),
            config.worker_settings(),
            index,
        );
        let name = worker.owner().to_string();
        tasks.spawn(name, |cancel| worker.run(cancel));
    }
    info!("Started {} background task(s)", tasks.len());

    let state = AppState {
        db: db.clone(),
        ingestor,
        logs,
        admin_secret: config.admin_secret.clone().unwrap_or_default(),
        leagues,
        utc_offset: config.utc_offset()?,
    };
    let app = dashboard::router(state);
    let addr: SocketAddr = config.dashboard_addr.parse()?;
    info!("Diagnostics API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Run the API server (blocks until a shutdown signal)
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, shutting down background tasks");
    tasks
        .shutdown(Duration::from_secs(config.shutdown_grace_secs))
        .await;
    if secret.source() == SecretSource::Ephemeral {
        warn!("Process ran with an ephemeral APP_SECRET; the stored API key will not be readable after restart");
    }
    info!("Shutdown complete");
    Ok(())
}

async fn run_ingest(config: &Config, db: Database, args: &DateArgs) -> Result<()> {
    let leagues = leagues_for(config, args)?;
    let date = target_date(config, if args.today { None } else { args.date })?;
    let ingestor = build_ingestor(config, db)?;
    let summary = ingestor.run(&leagues, date, "cli").await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.failed_leagues().len() == leagues.len() {
        bail!("Every league failed to ingest for {}", date);
    }
    Ok(())
}

/// Fetch one scoreboard without opening the database.
async fn run_probe(config: &Config, league: League, date: Option<NaiveDate>) -> Result<Vec<ScoreboardGame>> {
    let date = target_date(config, date)?;
    let gateway = build_gateway(config)?;
    let games = gateway
        .fetch(league, date)
        .await
        .with_context(|| format!("{} probe for {} failed", league, date))?;
    info!("{} returned {} {} game(s) for {}", gateway.name(), games.len(), league, date);
    Ok(games)
}

fn run_enqueue(config: &Config, db: &Database, args: &DateArgs) -> Result<()> {
    let leagues = leagues_for(config, args)?;
    let date = target_date(config, if args.today { None } else { args.date })?;
    let created = picks::policy::enqueue_for_date(
        db,
        date,
        &leagues,
        config.utc_offset()?,
        Utc::now(),
        config.pregame_window(),
    )?;
    info!("Enqueued {} pick job(s) for {}", created, date);
    println!("{}", created);
    Ok(())
}

fn set_api_key(config: &Config, db: &Database, key: Option<String>) -> Result<()> {
    let key = match key {
        Some(key) => key,
        None => {
            eprintln!("Paste the API key and press Enter:");
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("Failed to read API key from stdin")?;
            line
        }
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("API key is empty");
    }

    if config.app_secret.as_deref().map_or(true, |s| s.trim().is_empty()) {
        bail!("APP_SECRET must be set to store an API key; an ephemeral secret would make it unreadable");
    }
    let secret = resolve_secret(config.app_secret.as_deref());
    let vault = CredentialVault::new(&secret);
    vault.seal_into(db, PICKS_API_KEY, key)?;
    info!("API key stored (secret fingerprint {})", vault.fingerprint());
    Ok(())
}

fn open_database(config: &Config) -> Result<Database> {
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);
    Ok(db)
}

fn build_gateway(config: &Config) -> Result<EspnScoreboard> {
    EspnScoreboard::new(
        &config.espn_base_url,
        Duration::from_secs(config.scoreboard_timeout_secs),
    )
}

fn build_ingestor(config: &Config, db: Database) -> Result<Ingestor> {
    let gateway: Arc<dyn ScoreboardGateway> = Arc::new(build_gateway(config)?);
    Ok(Ingestor::new(db, gateway, config.retry_policy(), config.pregame_window()))
}

fn leagues_for(config: &Config, args: &DateArgs) -> Result<Vec<League>> {
    match &args.leagues {
        Some(raw) => parse_leagues(raw),
        None => config.leagues(),
    }
}

fn target_date(config: &Config, explicit: Option<NaiveDate>) -> Result<NaiveDate> {
    match explicit {
        Some(date) => Ok(date),
        None => Ok(today_in(config.utc_offset()?, Utc::now())),
    }
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
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
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl-C, starting graceful shutdown"),
        () = terminate => info!("Received SIGTERM, starting graceful shutdown"),
    }
}
