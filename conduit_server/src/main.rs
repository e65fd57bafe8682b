use clap::Parser;
use conduit_core::{
    ConduitConfig, ConnectorRegistry, JobQuery, StateStore, TriggerType, o11y::init_tracing,
};
use conduit_server::backends::{App, ConnectorFile, build_app};
use conduit_server::cli::{Cli, Commands, ConnectorCommands, StateCommands};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = ConduitConfig::from_env()?;
    init_tracing(&config.log)?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }

    let app = build_app(config, cli.sink_dir).await?;
    let result = run(&app, cli.command.unwrap_or(Commands::Serve)).await;
    app.store.close().await;
    result
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tracing::instrument(level = "info", skip(app))]
async fn run(app: &App, cmd: Commands) -> anyhow::Result<()> {
    match cmd {
        Commands::Serve => {
            let recovered = app.scheduler.recover().await?;
            tracing::info!(recovered, "recovered interrupted jobs");

            let cancel = CancellationToken::new();
            let feed_task = app.log_feed(cancel.clone());
            let loop_cancel = cancel.clone();
            let scheduler = app.scheduler.clone();
            let cron_task = tokio::spawn(async move { scheduler.run_loop(loop_cancel).await });

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            cancel.cancel();
            cron_task.await??;
            app.scheduler.shutdown().await;
            let _ = feed_task.await;
        }
        Commands::Spec { connector_id } => {
            let connector = app.connector(&connector_id).await?;
            print_json(&app.executor.spec(&connector).await?)?;
        }
        Commands::Check { connector_id } => {
            let connector = app.connector(&connector_id).await?;
            let status = app.executor.check(&connector, &connector.config).await?;
            print_json(&status)?;
            if !status.succeeded() {
                anyhow::bail!("connection check failed");
            }
        }
        Commands::Discover { connector_id } => {
            let connector = app.connector(&connector_id).await?;
            print_json(&app.executor.discover(&connector, &connector.config).await?)?;
        }
        Commands::Trigger { connector_id } => {
            let job = app
                .scheduler
                .trigger(&connector_id, TriggerType::Manual)
                .await?;
            tracing::info!(job_id = %job.id, "sync job started");
            let done = tokio::select! {
                done = app.scheduler.wait(job.id) => done?,
                _ = tokio::signal::ctrl_c() => app.scheduler.cancel(job.id).await?,
            };
            // Let a scheduled retry (if any) stop with the process.
            app.scheduler.shutdown().await;
            print_json(&done)?;
        }
        Commands::Jobs {
            connector,
            status,
            limit,
        } => {
            let query = JobQuery {
                connector_id: connector,
                status,
                limit,
                ..JobQuery::default()
            };
            print_json(&app.scheduler.history(&query).await?)?;
        }
        Commands::Lineage { job_id } => {
            let chain = app.scheduler.lineage(job_id).await?;
            anyhow::ensure!(!chain.is_empty(), "unknown job: {job_id}");
            print_json(&chain)?;
        }
        Commands::State { command } => match command {
            StateCommands::Export { connector_id, out } => {
                let blob = app.store.export(&connector_id).await?;
                match out {
                    Some(path) => tokio::fs::write(&path, blob).await?,
                    None => println!("{blob}"),
                }
            }
            StateCommands::Import { connector_id, path } => {
                let blob = tokio::fs::read_to_string(&path).await?;
                let written = app.store.import(&connector_id, &blob).await?;
                println!("imported {written} checkpoint(s)");
            }
            StateCommands::Clear {
                connector_id,
                stream,
                namespace,
            } => {
                let removed = app
                    .store
                    .clear(&connector_id, stream.as_deref(), namespace.as_deref())
                    .await?;
                println!("cleared {removed} checkpoint(s)");
            }
        },
        Commands::Connector { command } => match command {
            ConnectorCommands::Put { path } => {
                let file = ConnectorFile::load(&path).await?;
                app.store.upsert_connector(&file.connector).await?;
                if let Some(schedule) = &file.schedule {
                    app.store.upsert_schedule(schedule).await?;
                }
                println!("saved connector {}", file.connector.id);
            }
            ConnectorCommands::List => {
                print_json(&app.store.list_connectors().await?)?;
            }
        },
    }
    Ok(())
}
