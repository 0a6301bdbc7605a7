//! Stress tests for multi-worker zoning
//!
//! Run with: cargo test --release --test stress_simulation -- --nocapture

use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use zoning_core::connection::{drain_ops, LoopbackConnection, LoopbackRuntime, WorkerOp};
use zoning_core::types::{AuthorityRole, EntityRef, VirtualWorkerId};
use zoning_core::world::{EntityWorld, InMemoryWorld};
use zoning_core::{LoadBalanceStrategy, LockingPolicy, WorkerZoning, ZoningConfig};

const TICK: Duration = Duration::from_millis(100);

/// Places entity handle `n` on virtual worker `n % count + 1`
struct ModuloStrategy {
    count: u32,
    local: Option<VirtualWorkerId>,
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
        (entity.0 % self.count as u64) as VirtualWorkerId + 1
    }

    fn minimum_required_workers(&self) -> u32 {
        self.count
    }
}

struct SimWorker {
    name: String,
    zoning: WorkerZoning<LoopbackConnection, ModuloStrategy>,
    mailbox: UnboundedReceiver<WorkerOp>,
    world: InMemoryWorld,
}

struct Fleet {
    runtime: LoopbackRuntime,
    workers: Vec<SimWorker>,
    now: Instant,
    handoffs: usize,
}

impl Fleet {
    fn new(num_workers: usize, num_virtual_workers: u32, config: ZoningConfig) -> Self {
        let runtime = LoopbackRuntime::new();
        let workers = (0..num_workers)
            .map(|i| {
                let name = format!("sim-{}", i);
                let (connection, mailbox) = runtime.connect(name.clone());
                runtime.mark_ready(&name).unwrap();
                let strategy = ModuloStrategy {
                    count: num_virtual_workers,
                    local: None,
                };
                let config = ZoningConfig {
                    worker_name: name.clone(),
                    ..config.clone()
                };
                SimWorker {
                    name,
                    zoning: WorkerZoning::new(config, connection, strategy),
                    mailbox,
                    world: InMemoryWorld::new(),
                }
            })
            .collect();

        Self {
            runtime,
            workers,
            now: Instant::now(),
            handoffs: 0,
        }
    }

    fn step(&mut self) {
        self.now += TICK;
        let now = self.now;
        let mut moves = Vec::new();

        for (index, worker) in self.workers.iter_mut().enumerate() {
            let ops = drain_ops(&mut worker.mailbox);
            worker.zoning.process_ops(ops, now);
            let candidates = worker.world.authoritative_entities();
            let report = worker.zoning.tick(&mut worker.world, &candidates, now);
            moves.extend(report.applied.into_iter().map(|intent| (index, intent)));
        }

        for (from, intent) in moves {
            let destination = self.workers[from]
                .zoning
                .map()
                .physical_worker_for(intent.target_virtual_worker_id)
                .map(str::to_owned)
                .and_then(|name| self.workers.iter().position(|w| w.name == name));

            match destination {
                Some(to) => {
                    if let Some(mut entity) = self.workers[from].world.remove(intent.entity) {
                        entity.authoritative = true;
                        entity.role = AuthorityRole::Authority;
                        entity.authority_received_at = Some(now);
                        entity.authority_intent = Some(intent.target_virtual_worker_id);
                        self.workers[to].world.adopt(intent.entity, entity);
                        self.handoffs += 1;
                    }
                }
                // Nobody takes the entity, authority falls back to the sender
                None => self.workers[from].world.grant_authority(intent.entity, now),
            }
        }
    }

    fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            self.step();
        }
    }

    fn owned(&self) -> usize {
        self.workers.iter().map(|w| w.world.authoritative_entities().len()).sum()
    }

    fn misplaced(&self) -> usize {
        self.workers
            .iter()
            .map(|w| {
                let strategy = w.zoning.strategy();
                w.world
                    .authoritative_entities()
                    .into_iter()
                    .filter(|e| !strategy.should_have_authority(*e))
                    .count()
            })
            .sum()
    }
}

#[tokio::test]
async fn stress_fleet_converges() {
    const WORKERS: usize = 4;
    const ENTITIES: i64 = 400;

    let mut fleet = Fleet::new(WORKERS, WORKERS as u32, ZoningConfig::for_worker("unused"));
    let start = Instant::now();

    let spawned_at = fleet.now;
    for n in 0..ENTITIES {
        fleet.workers[0].world.spawn(10_000 + n, spawned_at);
    }
    fleet.runtime.delegate_translator_authority("sim-0").unwrap();

    fleet.run(30);
    let elapsed = start.elapsed();

    println!("\n=== Fleet Convergence ===");
    println!("Workers: {}, entities: {}", WORKERS, ENTITIES);
    println!("Hand-offs: {}", fleet.handoffs);
    println!("Elapsed: {:?}", elapsed);
    for w in &fleet.workers {
        println!(
            "  {} -> virtual worker {:?}, {} entities",
            w.name,
            w.zoning.map().local_virtual_worker_id(),
            w.world.authoritative_entities().len()
        );
    }

    assert!(fleet.workers.iter().all(|w| w.zoning.map().is_ready()));
    assert_eq!(fleet.owned(), ENTITIES as usize, "Every entity has exactly one authoritative worker");
    assert_eq!(fleet.misplaced(), 0);
    assert_eq!(fleet.handoffs, (ENTITIES as usize) * (WORKERS - 1) / WORKERS);
}

#[tokio::test]
async fn stress_hierarchies_move_as_one() {
    const ROOTS: i64 = 50;
    const CHILDREN: i64 = 4;

    let mut fleet = Fleet::new(3, 3, ZoningConfig::for_worker("unused"));
    let spawned_at = fleet.now;
    let mut roots = Vec::new();
    {
        let world = &mut fleet.workers[0].world;
        for r in 0..ROOTS {
            let root = world.spawn(20_000 + r * 10, spawned_at);
            for c in 1..=CHILDREN {
                let child = world.spawn(20_000 + r * 10 + c, spawned_at);
                world.set_owner(child, Some(root));
            }
            roots.push(root);
        }
    }
    fleet.runtime.delegate_translator_authority("sim-0").unwrap();

    fleet.run(30);

    println!("\n=== Hierarchy Migration ===");
    println!("Roots: {}, children per root: {}", ROOTS, CHILDREN);
    println!("Hand-offs: {}", fleet.handoffs);

    for root in roots {
        let holder = fleet
            .workers
            .iter()
            .find(|w| w.world.has_authority(root))
            .expect("root owned somewhere");
        for child in holder.world.children(root) {
            assert!(holder.world.has_authority(child), "Children stay with their root");
        }
        assert_eq!(holder.world.children(root).len(), CHILDREN as usize);
    }
    assert_eq!(fleet.owned(), (ROOTS * (CHILDREN + 1)) as usize);
}

#[tokio::test]
async fn stress_locked_entities_stay() {
    const ENTITIES: i64 = 120;

    let mut fleet = Fleet::new(3, 3, ZoningConfig::for_worker("unused"));
    let spawned_at = fleet.now;
    for n in 0..ENTITIES {
        fleet.workers[0].world.spawn(30_000 + n, spawned_at);
    }

    let mut locked = Vec::new();
    {
        let worker = &mut fleet.workers[0];
        for entity in worker.world.authoritative_entities().into_iter().step_by(4) {
            let token = worker.zoning.acquire_lock(&worker.world, entity, "stress");
            assert!(token.is_valid());
            locked.push((entity, token));
        }
    }
    fleet.runtime.delegate_translator_authority("sim-0").unwrap();
    fleet.run(20);

    println!("\n=== Locked Entities ===");
    println!("Locked: {}, hand-offs: {}", locked.len(), fleet.handoffs);

    for (entity, _) in &locked {
        assert!(fleet.workers[0].world.has_authority(*entity), "Locked entity must not move");
    }

    for (_, token) in &locked {
        assert!(fleet.workers[0].zoning.release_lock(*token));
    }
    let first = &fleet.workers[0];
    assert!(locked.iter().all(|(e, _)| !first.zoning.locks().is_locked(&first.world, *e)));
    assert_eq!(first.zoning.locks().outstanding_tokens(), 0);

    fleet.run(20);

    assert_eq!(fleet.misplaced(), 0);
    assert_eq!(fleet.owned(), ENTITIES as usize);
}

#[tokio::test]
async fn stress_departed_worker_replaced() {
    const ENTITIES: i64 = 90;

    let mut config = ZoningConfig::for_worker("unused");
    config.translation.roster_poll_interval = Duration::from_millis(500);
    config.load_balancing.migration_backoff = Duration::from_secs(3);

    // Four workers for three virtual workers: sim-3 is the spare
    let mut fleet = Fleet::new(4, 3, config);
    let spawned_at = fleet.now;
    for n in 0..ENTITIES {
        fleet.workers[0].world.spawn(40_000 + n, spawned_at);
    }
    fleet.runtime.delegate_translator_authority("sim-0").unwrap();
    fleet.run(20);

    assert_eq!(fleet.misplaced(), 0);
    assert_eq!(fleet.workers[3].zoning.map().local_virtual_worker_id(), None);
    let departed_vw = fleet.workers[2].zoning.map().local_virtual_worker_id();
    assert_eq!(departed_vw, Some(3));

    // sim-2 leaves; its entities fall back to sim-0
    let departed = fleet.workers.remove(2);
    fleet.runtime.disconnect(&departed.name).unwrap();
    let fallback_at = fleet.now;
    let mut departed_world = departed.world;
    for entity in departed_world.authoritative_entities() {
        if let Some(mut state) = departed_world.remove(entity) {
            state.authority_received_at = Some(fallback_at);
            fleet.workers[0].world.adopt(entity, state);
        }
    }

    fleet.run(80);

    let spare = &fleet.workers[2];
    println!("\n=== Worker Replacement ===");
    println!(
        "{} now simulates virtual worker {:?} with {} entities",
        spare.name,
        spare.zoning.map().local_virtual_worker_id(),
        spare.world.authoritative_entities().len()
    );
    println!("Mapping generation: {}", fleet.workers[0].zoning.manager().generation());

    assert_eq!(spare.name, "sim-3");
    assert_eq!(spare.zoning.map().local_virtual_worker_id(), departed_vw);
    assert_eq!(fleet.owned(), ENTITIES as usize);
    assert_eq!(fleet.misplaced(), 0);
    assert!(fleet.workers[0].zoning.manager().generation() >= 3);
}
