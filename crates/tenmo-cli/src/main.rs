//! Tenmo - provenance event queue and causality graph materializer
//!
//! `tenmo process` runs the long-lived side: workers that materialize events,
//! the lease reclaimer and the `LISTEN` subscription that wakes them. The
//! other subcommands are one-shot producers and readers.

mod input;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{FuturesUnordered, StreamExt};
use sqlx::postgres::PgPoolOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{error, info};

use tenmo::{
    Assert, Config, DotRenderer, EventId, EventStore, GraphStore, LeaseReclaimer, Renderer,
    WakeSignal, Worker,
};
use tenmo_postgres::{migrations, PgStore};

#[derive(Parser)]
#[command(name = "tenmo", version)]
#[command(about = "Durable provenance event queue and causality graph materializer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending schema migrations
    Migrate,
    /// Run workers and the lease reclaimer until Ctrl-C
    Process {
        /// Number of workers (overrides TENMO_WORKERS)
        #[arg(long, short)]
        workers: Option<usize>,
    },
    /// Append newline-delimited JSON events
    Submit {
        /// File to read; stdin when omitted
        path: Option<PathBuf>,
    },
    /// Render the materialized graph as Graphviz DOT
    Dot {
        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Show event counts per status
    Stats,
    /// Add an annotation edge between two graph nodes
    Annotate {
        source: String,
        target: String,
        comment: String,
    },
    /// Show one stored event and its queue bookkeeping
    Inspect { event_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Logs go to stderr so `tenmo dot` output stays clean
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("tenmo=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    let store = connect(&config).await?;

    let result = match cli.command {
        Commands::Migrate => {
            migrations::run(store.pool()).await?;
            info!("Migrations completed");
            Ok(())
        }
        Commands::Process { workers } => process(config, workers, store.clone()).await,
        Commands::Submit { path } => submit(&store, path).await,
        Commands::Dot { output } => dot(&store, output).await,
        Commands::Stats => stats(&store).await,
        Commands::Annotate {
            source,
            target,
            comment,
        } => annotate(&store, source, target, comment).await,
        Commands::Inspect { event_id } => inspect(&store, EventId::new(event_id)).await,
    };

    store.pool().close().await;
    result
}

async fn connect(config: &Config) -> Result<PgStore> {
    let pool = PgPoolOptions::new()
        // Workers, reclaimer and the listener each hold at most one connection.
        .max_connections(u32::try_from(config.workers + 4).unwrap_or(u32::MAX))
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;
    Ok(PgStore::new(pool))
}

async fn process(config: Config, workers: Option<usize>, store: PgStore) -> Result<()> {
    let workers = workers.unwrap_or(config.workers).max(1);

    info!("Running database migrations...");
    migrations::run(store.pool()).await?;

    let store = Arc::new(store);
    let wake = WakeSignal::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    store.subscribe(wake.clone(), shutdown_rx.clone()).await?;

    let mut tasks = FuturesUnordered::new();

    for i in 0..workers {
        let worker = Worker::new(
            format!("worker-{i}"),
            store.clone(),
            config.worker_config(),
            wake.clone(),
        );
        tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }

    let reclaimer = LeaseReclaimer::new(store.clone(), config.reclaimer_config());
    tasks.push(tokio::spawn(reclaimer.run(shutdown_rx)));

    info!(
        workers,
        max_attempts = config.max_attempts,
        consistency = %config.consistency,
        "Tenmo processing started"
    );

    // Any task exiting before Ctrl-C is fatal.
    let result: Result<()> = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down...");
            Ok(())
        }
        Some(joined) = tasks.next() => match joined {
            Ok(Ok(())) => Err(anyhow!("background task exited unexpectedly")),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(e.into()),
        },
    };

    let _ = shutdown_tx.send(true);
    while let Some(joined) = tasks.next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Task failed during shutdown"),
            Err(e) => error!(error = %e, "Task panicked during shutdown"),
        }
    }

    info!("Shutdown complete");
    result
}

async fn submit(store: &PgStore, path: Option<PathBuf>) -> Result<()> {
    let text = match &path {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            text
        }
    };

    let events = input::parse_events(&text)?;
    let ids = tenmo::submit(store, events).await?;
    info!(count = ids.len(), "Events submitted");

    let mut out = String::new();
    for id in &ids {
        out.push_str(id.as_str());
        out.push('\n');
    }
    tokio::io::stdout().write_all(out.as_bytes()).await?;
    Ok(())
}

async fn dot(store: &PgStore, output: Option<PathBuf>) -> Result<()> {
    let universe = store.load().await?;
    let rendered = DotRenderer::default().render(&universe);

    match output {
        Some(path) => tokio::fs::write(&path, &rendered)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&rendered).await?;
            stdout.flush().await?;
        }
    }

    info!(
        executions = universe.executions.len(),
        incarnations = universe.incarnations.len(),
        "Graph rendered"
    );
    Ok(())
}

async fn stats(store: &PgStore) -> Result<()> {
    let stats = store.stats().await?;
    let out = format!(
        "idle\t{}\nclaimed\t{}\nprocessed\t{}\nabandoned\t{}\ntotal\t{}\n",
        stats.idle,
        stats.claimed,
        stats.processed,
        stats.abandoned,
        stats.total()
    );
    tokio::io::stdout().write_all(out.as_bytes()).await?;
    Ok(())
}

async fn annotate(store: &PgStore, source: String, target: String, comment: String) -> Result<()> {
    let assert = Assert {
        source,
        target,
        comment,
    };
    if store.annotate(&assert).await? {
        info!(source = %assert.source, target = %assert.target, "Annotation added");
    } else {
        info!(source = %assert.source, target = %assert.target, "Annotation already present");
    }
    Ok(())
}

async fn inspect(store: &PgStore, event_id: EventId) -> Result<()> {
    let Some(stored) = store.get(&event_id).await? else {
        bail!("event '{event_id}' not found");
    };

    let mut out = format!(
        "event_id\t{}\nstatus\t{}\nattempts\t{}\nlast_modified\t{}\n",
        event_id,
        stored.status,
        stored.attempts,
        stored.last_modified.to_rfc3339()
    );
    if let Some(last_error) = &stored.last_error {
        out.push_str(&format!("last_error\t{last_error}\n"));
    }
    out.push_str(&serde_json::to_string_pretty(&stored.event)?);
    out.push('\n');

    tokio::io::stdout().write_all(out.as_bytes()).await?;
    Ok(())
}
