//! `wdpost run`: 全コンポーネントを模擬 chain の上で動かす
//!
//! 模擬 chain は `epoch_ms` ごとに 1 epoch 進む。各 provider には 30 epoch
//! ごとの deadline があり、deadline `d` のセクター id は `d*100 + 1..=12`
//! （partition 0: 1..=8, partition 1: 9..=12）。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use wdpost_core::app::{AppBuilder, ChainScheduler, status};
use wdpost_core::config::ProviderConfig;
use wdpost_core::domain::{
    Address, ChainEpoch, DeadlineAssignment, DeadlineInfo, Partition, SectorId, WorkerId,
};
use wdpost_core::impls::{
    MemoryCursorStore, MemoryOutbox, MemoryTaskStore, SimChain, SimProver, SimSectorStorage,
};
use wdpost_core::message::MessageSender;
use wdpost_core::ports::{Clock, CursorStore, OutboxStore, SystemClock, TaskStore};
use wdpost_core::typed::Task;
use wdpost_core::wdpost::{
    AddressSelector, FaultTracker, WdPost, WdPostComputeHandler, WdPostRecover,
    WdPostRecoverHandler, WdPostScheduler, WdPostSubmit, WdPostSubmitHandler,
};

use crate::cli::RunCommand;

const DEADLINE_EPOCHS: ChainEpoch = 30;
const CHALLENGE_LEAD: ChainEpoch = 10;

struct Stores {
    tasks: Arc<dyn TaskStore>,
    outbox: Arc<dyn OutboxStore>,
    cursors: Arc<dyn CursorStore>,
}

impl Stores {
    fn memory() -> Self {
        Self {
            tasks: Arc::new(MemoryTaskStore::new()),
            outbox: Arc::new(MemoryOutbox::new()),
            cursors: Arc::new(MemoryCursorStore::new()),
        }
    }

    #[cfg(feature = "postgres")]
    fn postgres(url: &str) -> anyhow::Result<Self> {
        use wdpost_core::impls::pg::{PgBackend, PgCursorStore, PgOutbox, PgTaskStore};

        let backend = PgBackend::connect_lazy(url)?;
        Ok(Self {
            tasks: Arc::new(PgTaskStore::new(backend.clone())),
            outbox: Arc::new(PgOutbox::new(backend.clone())),
            cursors: Arc::new(PgCursorStore::new(backend)),
        })
    }

    fn from_command(cmd: &RunCommand) -> anyhow::Result<Self> {
        #[cfg(feature = "postgres")]
        if let Some(url) = &cmd.database_url {
            info!("using postgres stores");
            return Self::postgres(url);
        }
        let _ = cmd;
        Ok(Self::memory())
    }
}

/// Deadlines of one provider up to `horizon`.
fn sim_assignments(provider: &Address, horizon: ChainEpoch) -> Vec<DeadlineAssignment> {
    let mut assignments = Vec::new();
    let mut index = 0u64;
    loop {
        let open = DEADLINE_EPOCHS * (index as ChainEpoch + 1);
        if open - CHALLENGE_LEAD > horizon {
            break;
        }
        let base = index * 100;
        assignments.push(DeadlineAssignment {
            provider: provider.clone(),
            deadline: DeadlineInfo {
                index,
                period_start: 0,
                challenge: open - CHALLENGE_LEAD,
                open,
                close: open + DEADLINE_EPOCHS,
            },
            partitions: vec![
                Partition {
                    index: 0,
                    sectors: (base + 1..=base + 8).map(SectorId).collect(),
                    faulty: vec![],
                },
                Partition {
                    index: 1,
                    sectors: (base + 9..=base + 12).map(SectorId).collect(),
                    faulty: vec![],
                },
            ],
        });
        index += 1;
    }
    assignments
}

pub(crate) async fn run(cmd: RunCommand) -> anyhow::Result<()> {
    let config = match &cmd.config {
        Some(path) => ProviderConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ProviderConfig::default(),
    };
    if !config.subsystems.enable_window_post {
        warn!("window post is disabled in the config, nothing to run");
        return Ok(());
    }

    let mut providers = config.addresses.provider_addresses.clone();
    if providers.is_empty() {
        providers.push(Address::new("f01000"));
    }
    let mut submit_config = config.submit_config();
    if submit_config.senders.is_empty() {
        submit_config.senders.push(Address::new("f3sim-payer"));
    }

    let chain = Arc::new(SimChain::new(0));
    for provider in &providers {
        let horizon = cmd.epochs + config.proving.declare_lookahead_epochs;
        for assignment in sim_assignments(provider, horizon) {
            chain.add_assignment(assignment);
        }
    }
    chain.set_fee(submit_config.max_fee / 2);
    for sender in &submit_config.senders {
        chain.set_balance(sender, submit_config.max_fee.saturating_mul(1_000));
    }
    let storage = Arc::new(SimSectorStorage::new());
    storage.set_unreachable(cmd.unreachable.iter().copied().map(SectorId));

    let stores = Stores::from_command(&cmd)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let worker = WorkerId::generate("wdpost");

    let faults = Arc::new(FaultTracker::new(
        storage,
        clock.clone(),
        config.fault_tracker_config(),
    ));
    let sender = Arc::new(MessageSender::new(
        stores.outbox.clone(),
        chain.clone(),
        clock.clone(),
        config.sender_config(),
    ));

    let engine = AppBuilder::new()
        .register_with_limit::<WdPost, _>(
            WdPostComputeHandler::new(
                chain.clone(),
                Arc::new(SimProver::new()),
                faults.clone(),
                stores.tasks.clone(),
                clock.clone(),
                config.compute_config(),
            ),
            config.subsystems.window_post_max_tasks,
        )?
        .register::<WdPostSubmit, _>(WdPostSubmitHandler::new(
            chain.clone(),
            chain.clone(),
            AddressSelector::new(chain.clone()),
            sender.clone(),
            clock.clone(),
            submit_config.clone(),
        ))?
        .register::<WdPostRecover, _>(WdPostRecoverHandler::new(
            chain.clone(),
            chain.clone(),
            AddressSelector::new(chain.clone()),
            sender.clone(),
            faults,
            clock.clone(),
            submit_config,
        ))?
        .expect_tasks(&[WdPost::TYPE, WdPostSubmit::TYPE, WdPostRecover::TYPE])
        .clock(clock.clone())
        .config(config.engine_config())
        .build(worker.clone(), stores.tasks.clone())?;

    let mut scheduler = ChainScheduler::new(
        worker,
        chain.clone(),
        stores.cursors.clone(),
        clock.clone(),
        config.scheduler_config(),
    );
    scheduler.register(Arc::new(WdPostScheduler::new(
        providers,
        chain.clone(),
        stores.tasks.clone(),
        clock,
        config.compute_config(),
    )));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heads = chain.subscribe();
    let engine_task = {
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(rx).await })
    };
    let sender_task = {
        let rx = shutdown_rx.clone();
        let sender = Arc::clone(&sender);
        tokio::spawn(async move { sender.run(rx).await })
    };
    let scheduler_task = tokio::spawn(async move { scheduler.run(heads, shutdown_rx).await });

    info!(epochs = cmd.epochs, epoch_ms = cmd.epoch_ms, "simulated chain running");
    let mut ticker = tokio::time::interval(Duration::from_millis(cmd.epoch_ms.max(1)));
    for _ in 0..cmd.epochs {
        tokio::select! {
            _ = ticker.tick() => {
                chain.advance(1);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    info!(height = chain.head().height, "shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler_task.await? {
        warn!(error = %e, "chain scheduler stopped with an error");
    }
    if let Err(e) = engine_task.await? {
        warn!(error = %e, "task engine stopped with an error");
    }
    if let Err(e) = sender_task.await? {
        warn!(error = %e, "message sender stopped with an error");
    }

    status::report(stores.tasks.as_ref()).await?;
    info!(broadcasts = chain.broadcasts().len(), "done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_cover_the_horizon() {
        let provider = Address::new("f01000");
        let assignments = sim_assignments(&provider, 90);

        let challenges: Vec<ChainEpoch> =
            assignments.iter().map(|a| a.deadline.challenge).collect();
        assert_eq!(challenges, vec![20, 50, 80]);
        assert_eq!(assignments[1].sectors_of(&[1]), (109..=112).map(SectorId).collect::<Vec<_>>());
    }
}
