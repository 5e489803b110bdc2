use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use vault_api::{
    config::Config,
    db,
    global_stats::ALL_TIME_DAYS,
    spotify::{MusicApi, SpotifyClient},
    AppState,
};

#[derive(Parser)]
#[command(name = "vaultcli")]
#[command(about = "listening vault operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pull recent listening history from the upstream
    Ingest {
        /// User id to ingest, or all for all users
        #[arg(value_name = "USER")]
        user: String,

        /// Number of users ingested concurrently
        #[arg(short, long, default_value_t = 4)]
        parallelism: usize,
    },

    /// List every user with their minutes listened
    Users {
        /// Window in days
        #[arg(short, long, default_value_t = ALL_TIME_DAYS)]
        days: u32,
    },

    /// Minutes listened by one user
    Minutes {
        #[arg(value_name = "USER")]
        user: String,

        #[arg(short, long, default_value_t = 30)]
        days: u32,
    },

    /// Listening percentile of one user
    Percentile {
        #[arg(value_name = "USER")]
        user: String,

        #[arg(short, long, default_value_t = 30)]
        days: u32,
    },

    /// Heaviest listeners in a window
    TopUsers {
        #[arg(short, long, default_value_t = 30)]
        days: u32,

        #[arg(short, long, default_value_t = 5)]
        limit: usize,
    },

    /// Underground score of one user
    Underground {
        #[arg(value_name = "USER")]
        user: String,
    },
}

async fn connect() -> Result<AppState> {
    let config = Config::from_env()?;
    let pool = db::init_db(&config.database_url)
        .await
        .context("failed to initialize database")?;
    let store = Arc::new(db::PgStore::new(pool, config.retry));
    let api: Arc<dyn MusicApi> = Arc::new(SpotifyClient::new(&config.spotify)?);
    Ok(AppState::new(store, api, config.ingest, config.cron_secret))
}

async fn handle_ingest(state: &AppState, user: &str, parallelism: usize) -> Result<()> {
    if user == "all" {
        let report = state
            .ingestor
            .clone()
            .with_user_concurrency(parallelism)
            .run_for_all_users()
            .await?;
        for failure in &report.failed {
            tracing::warn!("{}: {}", failure.user_id, failure.reason);
        }
        println!(
            "ingested {} users, {} failed, {} new plays",
            report.completed.len(),
            report.failed.len(),
            report.inserted()
        );
        return Ok(());
    }

    let found = state
        .users
        .get_user(user)
        .await?
        .with_context(|| format!("user {user} not found"))?;

    let report = state.ingestor.run_for_user(&found).await?;
    for failure in &report.failures {
        tracing::warn!("{:?} {}: {}", failure.stage, failure.target, failure.reason);
    }
    println!(
        "{}: {} fetched, {} new, {} already recorded, {} item failures",
        report.user_id,
        report.fetched,
        report.inserted,
        report.duplicates,
        report.failures.len()
    );
    Ok(())
}

async fn handle_users(state: &AppState, days: u32) -> Result<()> {
    let ranked = state.global.minutes_for_all_users(days).await?;
    tracing::info!("Found {} users", ranked.len());
    for (index, entry) in ranked.iter().enumerate() {
        println!(
            "{:>4}. {:<28} {:>10.1} min  {}",
            index + 1,
            entry.user.id,
            entry.minutes,
            entry.user.display_name.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter("vaultcli=info,vault_api=info")
        .init();

    let cli = Cli::parse();
    let state = connect().await?;

    match cli.command {
        Commands::Ingest { user, parallelism } => handle_ingest(&state, &user, parallelism).await,
        Commands::Users { days } => handle_users(&state, days).await,
        Commands::Minutes { user, days } => {
            let minutes = state.stats.total_minutes_listened(&user, Some(days)).await?;
            println!("{user}: {minutes:.1} minutes in the last {days} days");
            Ok(())
        }
        Commands::Percentile { user, days } => {
            let data = state.global.listening_percentile(&user, days).await?;
            println!(
                "{user}: rank {}/{} (percentile {})",
                data.rank, data.total_users, data.percentile
            );
            Ok(())
        }
        Commands::TopUsers { days, limit } => {
            let top = state.global.top_users(days, limit).await?;
            for (index, entry) in top.iter().enumerate() {
                println!("{:>4}. {:<28} {:>10.1} min", index + 1, entry.user.id, entry.minutes);
            }
            Ok(())
        }
        Commands::Underground { user } => {
            let score = state.stats.underground_score(&user).await?;
            println!("{user}: underground score {score:.2}");
            Ok(())
        }
    }
}
