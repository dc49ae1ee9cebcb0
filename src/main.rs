use anyhow::Result;
use clap::{Parser, Subcommand};
use episode_merge_lib::commands;
use episode_merge_lib::config::{self, Config};
use episode_merge_lib::database::EpisodeSortMode;
use episode_merge_lib::{spawn_migrations, AppContext};
use std::path::PathBuf;

/// Command-line arguments for episode-merge
#[derive(Parser, Debug)]
#[command(name = "episode-merge")]
#[command(about = "Merged episode timelines across upstream sources")]
#[command(version)]
struct Args {
    /// Path to config.yaml
    #[arg(short, long, env = "EPISODE_MERGE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending data migrations
    Migrate,
    /// Print the resolved episode list of a merged group
    Episodes {
        #[arg(long)]
        group: i64,
        /// Skip deduplication and print every member episode
        #[arg(long)]
        raw: bool,
    },
    /// Print the member references of a merged group
    References {
        #[arg(long)]
        group: i64,
    },
    /// Merge existing entries into a new group
    Merge {
        #[arg(long)]
        title: String,
        /// Member entry ids, most preferred first
        #[arg(required = true, num_args = 2..)]
        entries: Vec<i64>,
    },
    /// Change how a group reconciles duplicate episodes
    SortMode {
        #[arg(long)]
        group: i64,
        /// none | no_dedupe | priority | most_episodes | highest_episode_number
        mode: EpisodeSortMode,
    },
    /// Delete a merged group, keeping its member entries
    Dissolve {
        #[arg(long)]
        group: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = args.config.unwrap_or_else(config::default_config_path);
    let config = Config::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    tracing::info!("Starting episode-merge v{}", env!("CARGO_PKG_VERSION"));

    let app = AppContext::open(&config)?;

    // Migrations finish before any group is read.
    let report = spawn_migrations(app.migrations.clone()).await?;

    match args.command {
        Command::Migrate => {
            if let Some(report) = report {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Command::Episodes { group, raw } => {
            let episodes = commands::merged_episodes(&app.db, group, !raw)?;
            for episode in episodes {
                println!(
                    "{:>4}  {:>7}  entry {:<5} {}{}",
                    episode.source_order,
                    if episode.is_recognized_number() {
                        format!("{}", episode.episode_number)
                    } else {
                        "?".to_string()
                    },
                    episode.owner_entry_id,
                    episode.name,
                    if episode.read { "  (read)" } else { "" }
                );
            }
        }
        Command::References { group } => {
            let refs = app.db.get_references(group)?;
            println!("{}", serde_json::to_string_pretty(&refs)?);
        }
        Command::Merge { title, entries } => {
            let group = commands::merge_entries(&app.db, &title, &entries)?;
            println!("{}", group);
        }
        Command::SortMode { group, mode } => {
            commands::set_sort_mode(&app.db, group, mode)?;
        }
        Command::Dissolve { group } => {
            commands::dissolve_group(&app.db, group)?;
        }
    }

    Ok(())
}
