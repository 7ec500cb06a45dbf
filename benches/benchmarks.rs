use criterion::{criterion_group, criterion_main, Criterion};
use josh::prelude::*;
use std::sync::Arc;

fn aging_replicate(rows: usize) -> Arc<Replicate> {
    let replicate = Replicate::new();
    replicate.register_schema(EntitySchemaBuilder::new("Patch").build());
    replicate.register_schema(
        EntitySchemaBuilder::new("Tree")
            .initial_attribute("age", Value::int(0, Units::count()))
            .handler(EventHandler::new(
                EventKey::new("age", Event::Step),
                Arc::new(|machine: &mut EventMachine| {
                    machine.push_prior("age")?;
                    machine.push(Value::int(1, Units::count()));
                    machine.add()
                }),
            ))
            .build(),
    );
    let factory = GeometryFactory::grid();
    for row in 0..rows {
        let geometry = Arc::new(
            factory
                .square(0.0, row as f64, 1.0, Space::Grid)
                .unwrap(),
        );
        let patch = replicate.add_patch("Patch", geometry).unwrap();
        replicate.add_member(&patch, "Tree").unwrap();
    }
    replicate
}

fn bench_step(c: &mut Criterion) {
    let config = SimConfig {
        threads: 1,
        seed: Some(1),
        ..SimConfig::default()
    };
    let sim = Simulation::new(aging_replicate(256), config).unwrap();
    sim.initialize().unwrap();
    c.bench_function("step_256_patches", |b| {
        b.iter(|| sim.step().unwrap());
    });
}

fn bench_freeze(c: &mut Criterion) {
    let replicate = aging_replicate(1);
    let patch = replicate.patch_at(0).unwrap();
    let tree = &patch.members()[0];
    c.bench_function("freeze_single_entity", |b| {
        b.iter(|| tree.freeze().unwrap());
    });
}

criterion_group!(benches, bench_step, bench_freeze);
criterion_main!(benches);
