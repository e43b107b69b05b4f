use anyhow::{bail, Result};
use batch_changes::authz::Actor;
use batch_changes::config;
use batch_changes::db::{self, GetRewirerMappingsOpts, Store};
use batch_changes::rewirer::LimitOffset;
use batch_changes::search::{parse_text_search, ChangesetFilter};
use batch_changes::state::ChangesetState;
use clap::{Parser, Subcommand};
use serde_json::to_string_pretty;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending schema migrations
    Migrate,
    /// Delete expired changeset specs
    Gc,
    /// Print the rewirer mappings of applying a batch spec, as JSON
    Preview {
        #[arg(long)]
        batch_spec: i64,
        /// Batch change the batch spec would be applied to; omit for a new one
        #[arg(long, default_value_t = 0)]
        batch_change: i64,
        /// Only changesets in this state (e.g. OPEN, MERGED)
        #[arg(long)]
        state: Option<String>,
        /// Free-text search; prefix a term with '-' to exclude it
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// List branch specs of a batch spec that target the same branch
    Conflicts {
        #[arg(long)]
        batch_spec: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| cfg.default_database_url());
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;
    let store = Store::new(pool).with_settings(cfg.store);

    match args.command {
        Command::Migrate => info!("migrations applied"),
        Command::Gc => {
            let unattached = store.delete_unattached_expired_changeset_specs().await?;
            let expired = store.delete_expired_changeset_specs().await?;
            info!(unattached, expired, "changeset spec gc finished");
        }
        Command::Preview {
            batch_spec,
            batch_change,
            state,
            search,
            limit,
            offset,
        } => {
            let state = match state {
                Some(raw) => match ChangesetState::parse_state(&raw) {
                    Some(state) => Some(state),
                    None => bail!("unknown changeset state {raw:?}"),
                },
                None => None,
            };
            let opts = GetRewirerMappingsOpts {
                batch_spec_id: batch_spec,
                batch_change_id: batch_change,
                filter: ChangesetFilter {
                    state,
                    text_search: search.as_deref().map(parse_text_search).unwrap_or_default(),
                },
                page: LimitOffset { limit, offset },
            };
            let mappings = store.get_rewirer_mappings(&opts).await?;
            let hydrated = store
                .hydrate_rewirer_mappings(&Actor::Internal, &mappings)
                .await?;
            println!("{}", to_string_pretty(&hydrated)?);
        }
        Command::Conflicts { batch_spec } => {
            let conflicts = store
                .list_changeset_specs_with_conflicting_head_ref(batch_spec)
                .await?;
            if conflicts.is_empty() {
                println!("no conflicting head refs in batch spec {batch_spec}");
            }
            for spec in conflicts {
                println!(
                    "repo {} {} (changeset spec {})",
                    spec.repo_id,
                    spec.head_ref.as_deref().unwrap_or_default(),
                    spec.rand_id
                );
            }
        }
    }

    Ok(())
}
