use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use nudge_common::config::AppConfig;
use nudge_common::db;
use nudge_dispatcher::build_coordinator;
use nudge_engine::ReminderScheduler;
use nudge_engine::ledger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "nudge_dispatcher=info,nudge_engine=info,nudge_notifier=info".into()
            }),
        )
        .json()
        .init();

    tracing::info!("Nudge dispatcher starting...");

    let config = AppConfig::from_env()?;
    let pool = db::create_pool(&config).await?;

    ledger::migrate(&pool).await?;

    let coordinator = Arc::new(build_coordinator(&config, pool)?);
    let cancel = CancellationToken::new();
    let scheduler = ReminderScheduler::new(coordinator, config.dispatch_interval(), cancel.clone())?;
    let mut scheduler_task = tokio::spawn(scheduler.run());

    tokio::select! {
        result = &mut scheduler_task => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Reminder scheduler exited unexpectedly");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            cancel.cancel();
            scheduler_task.await?;
        }
    }

    tracing::info!("Nudge dispatcher stopped.");
    Ok(())
}
