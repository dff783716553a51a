//! NecroCode CLI entry point.

use clap::Parser;
use necrocode::cli::{
    commands::{events, init, pool as pool_cmd, run, sync, task, taskset},
    exit_code_for, Cli, Commands, EventCommands, PoolCommands, TaskCommands, TasksetCommands,
};
use necrocode::infrastructure::config::ConfigLoader;
use necrocode::infrastructure::logging::init_logging;
use necrocode::services::pool::RepoPoolManager;
use necrocode::services::registry::TaskRegistry;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(()) => {}
        Err(error) => {
            eprintln!("error: {error:#}");
            std::process::exit(exit_code_for(&error));
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Init runs before any configuration exists.
    if let Commands::Init { force } = &cli.command {
        return init::handle_init(*force, cli.json).await;
    }

    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    let _log_guard = init_logging(&config.logging)?;

    let registry = TaskRegistry::new(&config.registry);
    let pool = RepoPoolManager::new(config.pool.clone()).with_events(registry.event_log());

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Submit { spec_name, checklist } => {
            taskset::handle_submit(&registry, &spec_name, &checklist, cli.json).await
        }
        Commands::Taskset(cmd) => match cmd {
            TasksetCommands::List => taskset::handle_list(&registry, cli.json).await,
            TasksetCommands::Show { spec_name } => {
                taskset::handle_show(&registry, &spec_name, cli.json).await
            }
        },
        Commands::Task(cmd) => match cmd {
            TaskCommands::Show { spec_name, task_id } => {
                task::handle_show(&registry, &spec_name, &task_id, cli.json).await
            }
            TaskCommands::Cancel { spec_name, task_id } => {
                task::handle_cancel(&registry, &spec_name, &task_id, cli.json).await
            }
            TaskCommands::Retry { spec_name, task_id } => {
                task::handle_retry(&registry, &spec_name, &task_id, cli.json).await
            }
        },
        Commands::Graph { spec_name, format } => {
            events::handle_graph(&registry, &spec_name, &format, cli.json).await
        }
        Commands::Events(cmd) => match cmd {
            EventCommands::Query { spec_name, task, limit } => {
                events::handle_query(&registry, &spec_name, task.as_deref(), limit, cli.json).await
            }
            EventCommands::Prune { spec_name } => {
                events::handle_prune(&registry, &spec_name, cli.json).await
            }
        },
        Commands::Pool(cmd) => match cmd {
            PoolCommands::Create { repo_name, repo_url, slots, no_fetch_on_allocate } => {
                pool_cmd::handle_create(&pool, &repo_name, &repo_url, slots, no_fetch_on_allocate, cli.json)
                    .await
            }
            PoolCommands::Status { repo_name } => {
                pool_cmd::handle_status(&pool, &repo_name, cli.json).await
            }
            PoolCommands::Recover { release_long_allocated } => {
                pool_cmd::handle_recover(
                    &pool,
                    config.pool.max_allocation_hours,
                    release_long_allocated || config.dispatcher.auto_release_long_allocated,
                    cli.json,
                )
                .await
            }
            PoolCommands::AddSlot { repo_name } => {
                pool_cmd::handle_add_slot(&pool, &repo_name, cli.json).await
            }
            PoolCommands::RemoveSlot { slot_id, force } => {
                pool_cmd::handle_remove_slot(&pool, &slot_id, force, cli.json).await
            }
        },
        Commands::Sync { spec_name, doc, direction } => {
            sync::handle_sync(&registry, &spec_name, &doc, &direction, cli.json).await
        }
        Commands::Run { max_concurrency } => run::handle_run(config, max_concurrency).await,
    }
}
