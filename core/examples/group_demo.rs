//! Simple demonstration of the process group supervisor
//!
//! Starts a two-rank subprocess group, watches its event stream, waits for
//! one rank to finish on its own and then closes the group gracefully.

use muster_core::{
    GroupConfig, PolicyCell, PolicyUpdate, ProcessGroup, RankCommand, Result, SubprocessGroup,
};
use std::collections::BTreeMap;
use tokio::time::{Duration, timeout};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    muster_core::utils::init_tracing("info")?;

    info!("🚀 Starting process group demo");

    // A short grace period keeps the demo snappy
    let policy = PolicyCell::default();
    policy
        .configure(PolicyUpdate::new().grace_period(Duration::from_secs(3)))
        .await;

    let mut config = GroupConfig::new("demo-group");
    config.policy = policy;

    // Rank 0 finishes quickly, rank 1 would run forever
    let commands = BTreeMap::from([
        (
            0,
            RankCommand::new("sh")
                .arg("-c")
                .arg("echo \"Hello from rank $LOCAL_RANK\"; sleep 1"),
        ),
        (
            1,
            RankCommand::new("sh")
                .arg("-c")
                .arg("echo \"Rank $LOCAL_RANK settling in\"; sleep 600"),
        ),
    ]);
    let group = SubprocessGroup::new(config, commands);

    // Monitor events in a separate task
    let mut event_rx = group.subscribe();
    let monitor_task = tokio::spawn(async move {
        info!("👁 Starting event monitor");
        while let Ok(event) = event_rx.recv().await {
            match event {
                muster_core::GroupEvent::GroupStarted { group, pids, .. } => {
                    info!("✅ Group '{}' started with PIDs {:?}", group, pids);
                }
                muster_core::GroupEvent::WorkerExited { group, rank, exit } => {
                    info!(
                        "❌ Worker exited in '{}' (rank {}, {})",
                        group,
                        rank,
                        exit.describe()
                    );
                }
                muster_core::GroupEvent::ShutdownRequested { group, signal, .. } => {
                    info!("🛑 Shutdown of '{}' requested via {}", group, signal);
                }
                muster_core::GroupEvent::GroupTerminated { group, failed, .. } => {
                    info!("🔚 Group '{}' terminated (failed: {})", group, failed);
                }
                _ => {}
            }
        }
    });

    info!("▶ Starting group...");
    group.start().await?;
    info!("📋 PIDs: {:?}", group.pids().await?);

    // Give rank 0 time to finish; rank 1 keeps running
    let partial = group.wait(Duration::from_secs(3)).await?;
    info!(
        "⏱ After 3s: {} of 2 ranks settled",
        partial.settled_ranks()
    );

    info!("🛑 Closing group...");
    group.close().await?;

    let result = group.wait(Duration::from_millis(10)).await?;
    for (rank, value) in &result.return_values {
        info!("✨ Rank {} succeeded with {}", rank, value);
    }
    for (rank, failure) in &result.failures {
        info!("💥 Rank {} failed: {}", rank, failure.message);
    }

    drop(group);
    if timeout(Duration::from_millis(500), monitor_task).await.is_err() {
        info!("Monitor task timed out, that's OK");
    }

    info!("✨ Demo completed successfully!");

    Ok(())
}
