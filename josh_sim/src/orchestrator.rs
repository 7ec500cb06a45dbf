use crate::patch::Patch;
use crate::replicate::Replicate;
use crate::scope::ReplicateScope;
use crossbeam_channel::{unbounded, Sender};
use josh_core::entity::{FrozenEntity, MutableEntity};
use josh_core::error::{EngineError, Result};
use josh_core::geometry::IdentityKey;
use josh_core::handler::Event;
use josh_core::resolve;
#[cfg(feature = "par-step")]
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Tuning knobs for one simulation run.
#[derive(Clone, Debug)]
pub struct SimConfig {
    /// Worker threads for patch batches. `0` lets rayon size the pool;
    /// `1` forces sequential execution.
    pub threads: usize,
    /// How long a task waits for an entity lock before surfacing
    /// `ContentionError`.
    pub lock_timeout: Duration,
    /// Halt the replicate on the first handler error instead of recording
    /// it and moving to the next attribute.
    pub strict: bool,
    /// Seed for reproducible runs. `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> SimConfig {
        SimConfig {
            threads: 0,
            lock_timeout: Duration::from_secs(5),
            strict: false,
            seed: None,
        }
    }
}

/// One recorded handler failure: which entity, attribute, and substep.
#[derive(Clone, Debug)]
pub struct StepError {
    pub entity: IdentityKey,
    pub attribute: Option<Arc<str>>,
    pub substep: Event,
    pub error: EngineError,
}

/// Outcome of one time step (or of initialization).
#[derive(Clone, Debug, Default)]
pub struct StepReport {
    pub step: u64,
    pub errors: Vec<StepError>,
    pub cancelled: bool,
    pub halted: bool,
}

impl StepReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.cancelled && !self.halted
    }
}

/// Drives substeps across a replicate.
///
/// Per time step, each substep walks every patch (in parallel when the
/// pool is enabled), locks each entity for the duration of its substep,
/// resolves and runs handlers attribute-by-attribute in index order, and
/// freezes everything at the substep boundary. Entities spawned by
/// handlers are finished (constant/init substeps) and attached at the
/// same boundary.
pub struct Simulation {
    replicate: Arc<Replicate>,
    config: SimConfig,
    cancel: Arc<AtomicBool>,
    #[cfg(feature = "par-step")]
    pool: Option<rayon::ThreadPool>,
}

impl Simulation {
    pub fn new(replicate: Arc<Replicate>, config: SimConfig) -> Result<Simulation> {
        #[cfg(feature = "par-step")]
        let pool = if config.threads == 1 {
            None
        } else {
            let mut builder = rayon::ThreadPoolBuilder::new();
            if config.threads > 0 {
                builder = builder.num_threads(config.threads);
            }
            Some(builder.build().map_err(|e| EngineError::Program {
                detail: format!("could not build worker pool: {}", e),
            })?)
        };

        Ok(Simulation {
            replicate,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            #[cfg(feature = "par-step")]
            pool,
        })
    }

    pub fn replicate(&self) -> &Arc<Replicate> {
        &self.replicate
    }

    /// Token observed between entities; set it to stop the run at the next
    /// entity boundary. In-flight handlers always complete.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Runs the one-time `constant` and `init` substeps over the starting
    /// population, freezing after each so the first real step sees the
    /// results as prior values.
    pub fn initialize(&self) -> Result<StepReport> {
        let mut report = StepReport::default();
        for event in [Event::Constant, Event::Init].iter() {
            if self.cancelled() {
                report.cancelled = true;
                break;
            }
            let halted = self.run_substep(*event, &mut report.errors);
            self.freeze_all(&mut report.errors);
            self.finalize_spawned(&mut report.errors);
            if halted {
                report.halted = true;
                break;
            }
        }
        info!(errors = report.errors.len(), "replicate initialized");
        Ok(report)
    }

    /// Runs one time step: the `start`, `step`, and `end` substeps, each
    /// followed by a freeze boundary and spawn finalization.
    pub fn step(&self) -> Result<StepReport> {
        let step = self.replicate.advance_step();
        let mut report = StepReport {
            step,
            ..StepReport::default()
        };

        for event in Event::STEP_CYCLE.iter() {
            if self.cancelled() {
                report.cancelled = true;
                break;
            }
            debug!(step, substep = %event, "running substep");
            let halted = self.run_substep(*event, &mut report.errors);
            self.freeze_all(&mut report.errors);
            self.finalize_spawned(&mut report.errors);
            if halted {
                report.halted = true;
                break;
            }
        }
        Ok(report)
    }

    /// Runs `steps` time steps, stopping early on cancellation or a halt.
    pub fn run(&self, steps: u64) -> Result<Vec<StepReport>> {
        let mut reports = Vec::with_capacity(steps as usize);
        for _ in 0..steps {
            let report = self.step()?;
            let stop = report.cancelled || report.halted;
            reports.push(report);
            if stop {
                break;
            }
        }
        Ok(reports)
    }

    /// Destroys an entity: runs its `remove` substep, commits, and
    /// detaches it from the patch and the spatial index.
    pub fn remove_entity(
        &self,
        patch: &Arc<Patch>,
        entity: &Arc<MutableEntity>,
    ) -> Result<Vec<StepError>> {
        let mut errors = Vec::new();
        let halt = AtomicBool::new(false);
        let (tx, rx) = unbounded();
        self.process_entity(patch, entity, Event::Remove, &tx, &halt);
        drop(tx);
        errors.extend(rx.into_iter());

        if let Err(freeze_error) = entity.freeze() {
            errors.push(StepError {
                entity: entity.identity_key(),
                attribute: None,
                substep: Event::Remove,
                error: freeze_error,
            });
        }
        self.replicate.detach(patch, entity);

        if let Some(fatal) = errors.iter().find(|e| !e.error.is_recoverable()) {
            return Err(fatal.error.clone());
        }
        Ok(errors)
    }

    /// Immutable snapshots of every entity on the grid, patch-major.
    pub fn snapshots(&self) -> Vec<Arc<FrozenEntity>> {
        self.replicate
            .patches()
            .iter()
            .flat_map(|patch| patch.entities())
            .map(|entity| entity.snapshot())
            .collect()
    }

    fn for_each_patch<F>(&self, patches: &[Arc<Patch>], f: F)
    where
        F: Fn(&Arc<Patch>) + Send + Sync,
    {
        #[cfg(feature = "par-step")]
        {
            if let Some(pool) = &self.pool {
                pool.install(|| patches.par_iter().for_each(|patch| f(patch)));
                return;
            }
        }
        for patch in patches {
            f(patch);
        }
    }

    /// Runs one substep over every entity. Returns whether the replicate
    /// halted (strict mode or a fatal error).
    fn run_substep(&self, event: Event, errors: &mut Vec<StepError>) -> bool {
        let patches = self.replicate.patches();
        let halt = AtomicBool::new(false);
        let (tx, rx) = unbounded();

        self.for_each_patch(&patches, |patch| {
            if self.cancelled() || halt.load(Ordering::Relaxed) {
                return;
            }
            for entity in patch.entities() {
                // Cancellation is honored between entities only.
                if self.cancelled() || halt.load(Ordering::Relaxed) {
                    break;
                }
                self.process_entity(patch, &entity, event, &tx, &halt);
            }
        });

        drop(tx);
        errors.extend(rx.into_iter());
        halt.load(Ordering::Relaxed)
    }

    /// One entity, one substep: lock, walk attributes in index order,
    /// resolve and run handlers, unlock.
    fn process_entity(
        &self,
        patch: &Arc<Patch>,
        entity: &Arc<MutableEntity>,
        event: Event,
        tx: &Sender<StepError>,
        halt: &AtomicBool,
    ) {
        if let Err(lock_error) = entity.try_start_substep(event, self.config.lock_timeout) {
            warn!(entity = %entity.display_name(), error = %lock_error, "substep lock failed");
            let _ = tx.send(StepError {
                entity: entity.identity_key(),
                attribute: None,
                substep: event,
                error: lock_error,
            });
            if self.config.strict {
                halt.store(true, Ordering::Relaxed);
            }
            return;
        }

        let schema = entity.schema().clone();
        let mut scope = ReplicateScope::new(
            &self.replicate,
            patch.clone(),
            entity.clone(),
            self.config.seed,
            self.config.lock_timeout,
        );

        for index in 0..schema.attribute_count() as u32 {
            // The state attribute can change mid-substep; later attributes
            // resolve against the fresh value.
            let state = resolve::current_state(entity);
            match resolve::execute_attribute(&schema, index, event, state.as_deref(), &mut scope)
            {
                Ok(_) => {}
                Err(handler_error) => {
                    let fatal = !handler_error.is_recoverable();
                    if fatal {
                        error!(
                            entity = %entity.display_name(),
                            substep = %event,
                            error = %handler_error,
                            "fatal handler error"
                        );
                    }
                    let _ = tx.send(StepError {
                        entity: entity.identity_key(),
                        attribute: schema.attribute_name(index).cloned(),
                        substep: event,
                        error: handler_error,
                    });
                    if fatal || self.config.strict {
                        halt.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }

        if let Err(end_error) = entity.end_substep() {
            let _ = tx.send(StepError {
                entity: entity.identity_key(),
                attribute: None,
                substep: event,
                error: end_error,
            });
            halt.store(true, Ordering::Relaxed);
        }
    }

    /// Substep boundary: commits every entity. Freeze is the memory
    /// barrier between substeps; writes from substep `s` surface as prior
    /// values in `s + 1`.
    fn freeze_all(&self, errors: &mut Vec<StepError>) {
        let patches = self.replicate.patches();
        let (tx, rx) = unbounded();

        self.for_each_patch(&patches, |patch| {
            for entity in patch.entities() {
                if let Err(freeze_error) = entity.freeze() {
                    let _ = tx.send(StepError {
                        entity: entity.identity_key(),
                        attribute: None,
                        substep: entity.active_substep().unwrap_or(Event::End),
                        error: freeze_error,
                    });
                }
            }
        });

        drop(tx);
        errors.extend(rx.into_iter());
    }

    /// Finishes entities queued by `create` handlers: their one-time
    /// `constant` and `init` substeps run, they commit, and they join the
    /// patch and the index. Entities spawned while finishing are handled
    /// in the next round until the buckets drain.
    fn finalize_spawned(&self, errors: &mut Vec<StepError>) {
        loop {
            let pending = self.replicate.take_spawned();
            if pending.is_empty() {
                return;
            }
            let halt = AtomicBool::new(false);
            let (tx, rx) = unbounded();
            for (patch, members) in pending {
                for member in members {
                    self.process_entity(&patch, &member, Event::Constant, &tx, &halt);
                    self.process_entity(&patch, &member, Event::Init, &tx, &halt);
                    if let Err(freeze_error) = member.freeze() {
                        let _ = tx.send(StepError {
                            entity: member.identity_key(),
                            attribute: None,
                            substep: Event::Init,
                            error: freeze_error,
                        });
                    }
                    self.replicate.attach(&patch, member);
                }
            }
            drop(tx);
            errors.extend(rx.into_iter());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use josh_core::geometry::{GeometryFactory, Space};
    use josh_core::handler::{CompiledAction, EventHandler, EventKey};
    use josh_core::machine::EventMachine;
    use josh_core::schema::{EntitySchema, EntitySchemaBuilder};
    use josh_core::units::Units;
    use josh_core::value::Value;

    fn increment(attr: &'static str) -> CompiledAction {
        Arc::new(move |machine: &mut EventMachine| {
            machine.push_prior(attr)?;
            machine.push(Value::int(1, Units::count()));
            machine.add()
        })
    }

    fn aging_tree_schema() -> Arc<EntitySchema> {
        EntitySchemaBuilder::new("Tree")
            .initial_attribute("age", Value::int(0, Units::count()))
            .handler(EventHandler::new(
                EventKey::new("age", Event::Step),
                increment("age"),
            ))
            .build()
    }

    fn grid_replicate(rows: usize) -> Arc<Replicate> {
        let replicate = Replicate::new();
        replicate.register_schema(EntitySchemaBuilder::new("Patch").build());
        replicate.register_schema(aging_tree_schema());
        let factory = GeometryFactory::grid();
        for row in 0..rows {
            let geometry = Arc::new(
                factory
                    .square(0.0, row as f64, 1.0, Space::Grid)
                    .unwrap(),
            );
            replicate.add_patch("Patch", geometry).unwrap();
        }
        replicate
    }

    fn sequential() -> SimConfig {
        SimConfig {
            threads: 1,
            seed: Some(17),
            ..SimConfig::default()
        }
    }

    #[test]
    fn age_advances_once_per_step() {
        let replicate = grid_replicate(2);
        let patch = replicate.patch_at(0).unwrap();
        let tree = replicate.add_member(&patch, "Tree").unwrap();

        let sim = Simulation::new(replicate, sequential()).unwrap();
        sim.initialize().unwrap();

        for expected in 1..=3 {
            let report = sim.step().unwrap();
            assert!(report.is_clean(), "errors: {:?}", report.errors);
            assert_eq!(
                tree.get_attribute("age").unwrap(),
                Some(Value::int(expected, Units::count()))
            );
        }
    }

    #[test]
    fn parallel_and_sequential_agree() {
        let run = |threads: usize| {
            let replicate = grid_replicate(8);
            let mut trees = Vec::new();
            for position in 0..8 {
                let patch = replicate.patch_at(position).unwrap();
                trees.push(replicate.add_member(&patch, "Tree").unwrap());
            }
            let config = SimConfig {
                threads,
                seed: Some(17),
                ..SimConfig::default()
            };
            let sim = Simulation::new(replicate, config).unwrap();
            sim.initialize().unwrap();
            for _ in 0..4 {
                assert!(sim.step().unwrap().is_clean());
            }
            trees
                .iter()
                .map(|tree| tree.get_attribute("age").unwrap().unwrap())
                .collect::<Vec<_>>()
        };

        assert_eq!(run(1), run(4));
    }

    #[test]
    fn parallel_cross_entity_queries_do_not_deadlock() {
        let count_neighbors: CompiledAction = Arc::new(|machine: &mut EventMachine| {
            machine.push(Value::int(1, Units::count()));
            machine.execute_spatial_query("Patch")?;
            machine.count()
        });
        let watcher = EntitySchemaBuilder::new("Watcher")
            .initial_attribute("reachable", Value::int(0, Units::count()))
            .handler(EventHandler::new(
                EventKey::new("reachable", Event::Step),
                count_neighbors,
            ))
            .build();

        let replicate = Replicate::new();
        replicate.register_schema(EntitySchemaBuilder::new("Patch").build());
        replicate.register_schema(watcher);
        let factory = GeometryFactory::grid();
        let rows = 8;
        let mut watchers = Vec::new();
        for row in 0..rows {
            let geometry = Arc::new(
                factory
                    .square(0.0, row as f64, 1.0, Space::Grid)
                    .unwrap(),
            );
            let patch = replicate.add_patch("Patch", geometry).unwrap();
            watchers.push(replicate.add_member(&patch, "Watcher").unwrap());
        }

        let config = SimConfig {
            threads: 4,
            seed: Some(5),
            ..SimConfig::default()
        };
        let sim = Simulation::new(replicate, config).unwrap();
        sim.initialize().unwrap();
        for _ in 0..3 {
            let report = sim.step().unwrap();
            assert!(report.is_clean(), "errors: {:?}", report.errors);
        }

        // A radius-1 probe reaches the home square plus one or two
        // vertical neighbors depending on the row.
        for (row, watcher) in watchers.iter().enumerate() {
            let expected = if row == 0 || row == rows - 1 { 2 } else { 3 };
            assert_eq!(
                watcher.get_attribute("reachable").unwrap(),
                Some(Value::int(expected, Units::count()))
            );
        }
    }

    #[test]
    fn handler_errors_are_recorded_and_skipped() {
        let broken: CompiledAction = Arc::new(|machine: &mut EventMachine| {
            machine.push(Value::decimal(1.0, Units::of("m")));
            machine.push(Value::decimal(1.0, Units::of("s")));
            machine.add()
        });
        let schema = EntitySchemaBuilder::new("Tree")
            .initial_attribute("age", Value::int(0, Units::count()))
            .initial_attribute("broken", Value::decimal(0.0, Units::of("m")))
            .handler(EventHandler::new(EventKey::new("broken", Event::Step), broken))
            .handler(EventHandler::new(
                EventKey::new("age", Event::Step),
                increment("age"),
            ))
            .build();

        let replicate = Replicate::new();
        replicate.register_schema(EntitySchemaBuilder::new("Patch").build());
        replicate.register_schema(schema);
        let geometry = Arc::new(
            GeometryFactory::grid()
                .square(0.0, 0.0, 1.0, Space::Grid)
                .unwrap(),
        );
        let patch = replicate.add_patch("Patch", geometry).unwrap();
        let tree = replicate.add_member(&patch, "Tree").unwrap();

        let sim = Simulation::new(replicate, sequential()).unwrap();
        sim.initialize().unwrap();
        let report = sim.step().unwrap();

        // The unit error is recorded against (entity, attribute, substep)...
        assert_eq!(report.errors.len(), 1);
        let recorded = &report.errors[0];
        assert_eq!(recorded.attribute.as_deref(), Some("broken"));
        assert_eq!(recorded.substep, Event::Step);
        assert!(matches!(recorded.error, EngineError::Unit { .. }));
        assert!(!report.halted);

        // ...and the later attribute still ran.
        assert_eq!(
            tree.get_attribute("age").unwrap(),
            Some(Value::int(1, Units::count()))
        );
    }

    #[test]
    fn strict_mode_halts_on_the_first_error() {
        let broken: CompiledAction = Arc::new(|machine: &mut EventMachine| {
            machine.push(Value::int(1, Units::empty()));
            machine.push(Value::int(0, Units::empty()));
            machine.divide()
        });
        let schema = EntitySchemaBuilder::new("Tree")
            .initial_attribute("broken", Value::decimal(0.0, Units::empty()))
            .handler(EventHandler::new(EventKey::new("broken", Event::Step), broken))
            .build();

        let replicate = Replicate::new();
        replicate.register_schema(EntitySchemaBuilder::new("Patch").build());
        replicate.register_schema(schema);
        let geometry = Arc::new(
            GeometryFactory::grid()
                .square(0.0, 0.0, 1.0, Space::Grid)
                .unwrap(),
        );
        let patch = replicate.add_patch("Patch", geometry).unwrap();
        replicate.add_member(&patch, "Tree").unwrap();

        let config = SimConfig {
            strict: true,
            ..sequential()
        };
        let sim = Simulation::new(replicate, config).unwrap();
        sim.initialize().unwrap();
        let report = sim.step().unwrap();
        assert!(report.halted);
        assert!(!report.errors.is_empty());
    }

    #[test]
    fn cancellation_stops_between_steps() {
        let replicate = grid_replicate(2);
        let sim = Simulation::new(replicate, sequential()).unwrap();
        sim.initialize().unwrap();
        sim.cancel_token().store(true, Ordering::Relaxed);
        let reports = sim.run(10).unwrap();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].cancelled);
    }

    #[test]
    fn spawned_entities_join_at_the_boundary() {
        let spawn_one: CompiledAction = Arc::new(|machine: &mut EventMachine| {
            machine.push(Value::int(1, Units::count()));
            machine.create_entity("Seedling")?;
            // The handler still produces a value for its own attribute.
            machine.push(Value::bool(true));
            Ok(())
        });
        let parent = EntitySchemaBuilder::new("Tree")
            .initial_attribute("spawned", Value::bool(false))
            .handler(EventHandler::new(EventKey::new("spawned", Event::Step), spawn_one))
            .build();
        let seedling = EntitySchemaBuilder::new("Seedling")
            .initial_attribute("age", Value::int(0, Units::count()))
            .build();

        let replicate = Replicate::new();
        replicate.register_schema(EntitySchemaBuilder::new("Patch").build());
        replicate.register_schema(parent);
        replicate.register_schema(seedling);
        let geometry = Arc::new(
            GeometryFactory::grid()
                .square(0.0, 0.0, 1.0, Space::Grid)
                .unwrap(),
        );
        let patch = replicate.add_patch("Patch", geometry).unwrap();
        replicate.add_member(&patch, "Tree").unwrap();

        let sim = Simulation::new(replicate.clone(), sequential()).unwrap();
        sim.initialize().unwrap();
        let report = sim.step().unwrap();
        assert!(report.is_clean(), "errors: {:?}", report.errors);

        // Tree + one seedling per step-cycle substep drain.
        let members = patch.members();
        let seedlings = members
            .iter()
            .filter(|m| m.schema().name().as_ref() == "Seedling")
            .count();
        assert_eq!(seedlings, 1);
        assert_eq!(replicate.index().len(), 1 + members.len());
    }

    #[test]
    fn remove_entity_detaches_after_the_remove_substep() {
        let farewell: CompiledAction = Arc::new(|machine: &mut EventMachine| {
            machine.push(Value::string("gone"));
            Ok(())
        });
        let schema = EntitySchemaBuilder::new("Tree")
            .initial_attribute("epitaph", Value::string(""))
            .handler(EventHandler::new(
                EventKey::new("epitaph", Event::Remove),
                farewell,
            ))
            .build();

        let replicate = Replicate::new();
        replicate.register_schema(EntitySchemaBuilder::new("Patch").build());
        replicate.register_schema(schema);
        let geometry = Arc::new(
            GeometryFactory::grid()
                .square(0.0, 0.0, 1.0, Space::Grid)
                .unwrap(),
        );
        let patch = replicate.add_patch("Patch", geometry).unwrap();
        let tree = replicate.add_member(&patch, "Tree").unwrap();

        let sim = Simulation::new(replicate.clone(), sequential()).unwrap();
        sim.initialize().unwrap();

        let errors = sim.remove_entity(&patch, &tree).unwrap();
        assert!(errors.is_empty());
        assert_eq!(patch.member_count(), 0);
        assert_eq!(replicate.index().len(), 1);
        assert_eq!(
            tree.get_attribute("epitaph").unwrap(),
            Some(Value::string("gone"))
        );
    }
}
