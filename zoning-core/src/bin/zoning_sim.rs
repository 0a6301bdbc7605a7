//! Zoning simulation binary
//!
//! Runs a fleet of in-process workers over the loopback runtime, lets the
//! first one build the virtual worker mapping, then hands entities over to
//! the worker a modulo placement strategy picks for them.

use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use zoning_core::connection::{drain_ops, LoopbackConnection, LoopbackRuntime, WorkerOp};
use zoning_core::metrics::gather_system_metrics;
use zoning_core::types::{AuthorityRole, EntityRef, VirtualWorkerId};
use zoning_core::world::InMemoryWorld;
use zoning_core::{LoadBalanceStrategy, WorkerZoning, ZoningConfig};

/// Places entity `n` on virtual worker `n % count + 1`
struct ModuloStrategy {
    num_virtual_workers: u32,
    local: Option<VirtualWorkerId>,
}

impl ModuloStrategy {
    fn new(num_virtual_workers: u32) -> Self {
        Self {
            num_virtual_workers,
            local: None,
        }
    }
}

impl LoadBalanceStrategy for ModuloStrategy {
    fn is_ready(&self) -> bool {
        self.local.is_some()
    }

    fn local_virtual_worker_id(&self) -> Option<VirtualWorkerId> {
        self.local
    }

    fn set_local_virtual_worker_id(&mut self, virtual_worker_id: VirtualWorkerId) {
        self.local = Some(virtual_worker_id);
    }

    fn should_have_authority(&self, entity: EntityRef) -> bool {
        self.local == Some(self.who_should_have_authority(entity))
    }

    fn who_should_have_authority(&self, entity: EntityRef) -> VirtualWorkerId {
        (entity.0 % self.num_virtual_workers.max(1) as u64) as VirtualWorkerId + 1
    }

    fn minimum_required_workers(&self) -> u32 {
        self.num_virtual_workers
    }
}

struct SimWorker {
    name: String,
    zoning: WorkerZoning<LoopbackConnection, ModuloStrategy>,
    mailbox: UnboundedReceiver<WorkerOp>,
    world: InMemoryWorld,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let base = ZoningConfig::from_env()?;
    let num_workers: u32 = env_or("ZONING_SIM_WORKERS", 3);
    let num_entities: u64 = env_or("ZONING_SIM_ENTITIES", 12);
    let ticks: u32 = env_or("ZONING_SIM_TICKS", 40);
    let tick_interval = Duration::from_millis(env_or("ZONING_SIM_TICK_MS", 50));

    info!(
        "Starting zoning simulation: {} workers, {} entities, {} ticks",
        num_workers, num_entities, ticks
    );

    let runtime = LoopbackRuntime::new();
    let mut fleet = Vec::new();
    for index in 0..num_workers {
        let name = format!("{}-{}", base.worker_name, index);
        let (connection, mailbox) = runtime.connect(name.clone());
        runtime.mark_ready(&name)?;

        let config = ZoningConfig {
            worker_name: name.clone(),
            ..base.clone()
        };
        fleet.push(SimWorker {
            name,
            zoning: WorkerZoning::new(config, connection, ModuloStrategy::new(num_workers)),
            mailbox,
            world: InMemoryWorld::new(),
        });
    }

    let Some(first) = fleet.first_mut() else {
        warn!("No workers configured, nothing to simulate");
        return Ok(());
    };
    let spawned_at = Instant::now();
    for n in 0..num_entities {
        first.world.spawn(1000 + n as i64, spawned_at);
    }
    runtime.delegate_translator_authority(&first.name)?;

    let mut interval = tokio::time::interval(tick_interval);
    for _ in 0..ticks {
        interval.tick().await;
        let now = Instant::now();
        let mut handoffs = Vec::new();

        for (index, worker) in fleet.iter_mut().enumerate() {
            let ops = drain_ops(&mut worker.mailbox);
            worker.zoning.process_ops(ops, now);

            let candidates = worker.world.authoritative_entities();
            let report = worker.zoning.tick(&mut worker.world, &candidates, now);
            handoffs.extend(report.applied.into_iter().map(|intent| (index, intent)));
        }

        // Deliver authority to the destination of every intent
        for (from, intent) in handoffs {
            let target = fleet[from]
                .zoning
                .map()
                .physical_worker_for(intent.target_virtual_worker_id)
                .map(str::to_owned);
            let Some(to) = target.and_then(|name| fleet.iter().position(|w| w.name == name)) else {
                warn!("No worker simulates virtual worker {}", intent.target_virtual_worker_id);
                continue;
            };
            if let Some(mut entity) = fleet[from].world.remove(intent.entity) {
                entity.authoritative = true;
                entity.role = AuthorityRole::Authority;
                entity.authority_received_at = Some(now);
                entity.authority_intent = Some(intent.target_virtual_worker_id);
                fleet[to].world.adopt(intent.entity, entity);
            }
        }
    }

    let mut misplaced = 0;
    for worker in &fleet {
        let owned = worker.world.authoritative_entities();
        let strategy = worker.zoning.strategy();
        misplaced += owned.iter().filter(|e| !strategy.should_have_authority(**e)).count();
        info!(
            "{} (virtual worker {:?}) owns {} entities",
            worker.name,
            worker.zoning.map().local_virtual_worker_id(),
            owned.len()
        );
    }
    info!("Simulation finished with {} misplaced entities", misplaced);

    println!("{}", gather_system_metrics());
    Ok(())
}
