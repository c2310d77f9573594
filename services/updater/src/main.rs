// updater: mirrors the external stats database and rebuilds the rollups.

use sb_bus::{BusClient, BusConfig};
use sb_db::{Db, DbConfig, TableMeta};
use sb_proto::envelope::{listener_channel, Body, Envelope};
use tracing::{error, info};
use updater::{Runner, UpdateError, UpdaterConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "updater starting");

    let config = UpdaterConfig::from_env();
    let internal = match Db::connect(&DbConfig::internal_from_env()).await {
        Ok(db) => db,
        Err(err) => {
            eprintln!("FATAL: failed to connect to the internal database: {err}");
            std::process::exit(1);
        }
    };
    let external = match Db::connect(&DbConfig::source_from_env()).await {
        Ok(db) => db,
        Err(err) => {
            eprintln!("FATAL: failed to connect to the source database: {err}");
            std::process::exit(1);
        }
    };
    internal.spawn_keepalive();
    external.spawn_keepalive();

    let runner = Runner::new(internal, external, config);
    match run(&runner).await {
        Ok(()) => info!("update complete"),
        Err(err) => {
            error!(error = %err, "update run failed");
            std::process::exit(1);
        }
    }
}

async fn run(runner: &Runner) -> Result<(), UpdateError> {
    let player = TableMeta::introspect(&runner.internal, "player", true).await?;
    let tribe = TableMeta::introspect(&runner.internal, "tribe", true).await?;
    let member = TableMeta::introspect(&runner.internal, "member", true).await?;

    info!("start all");
    let (player_run, tribe_run, member_run) = tokio::join!(
        runner.extract(&player),
        runner.extract(&tribe),
        runner.extract(&member),
    );
    player_run?;
    tribe_run?;
    member_run?;

    updater::post_update::run(&runner.internal, &player, &tribe).await?;
    notify_update_done().await?;
    info!("end all");
    Ok(())
}

/// Tell the ranking service the mirror is fresh.
async fn notify_update_done() -> Result<(), UpdateError> {
    let (bus, _events) = BusClient::new(BusConfig::from_env());
    bus.start().await?;
    let envelope = Envelope {
        source: "updater".to_owned(),
        worker: 0,
        body: Body::UpdateDone,
    };
    bus.publish(&listener_channel("ranking", 0), envelope.to_json())
        .await?;
    Ok(())
}
