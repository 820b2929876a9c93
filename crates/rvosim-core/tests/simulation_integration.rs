use rvosim_core::{
    AvoidanceMethod, Demographics, Personality, Simulation, SimulationConfig, SimulationSink,
    SpawnStyle, Tick, TickBatch, Vec2,
};
use std::sync::{Arc, Mutex};

fn head_on_config(method: AvoidanceMethod) -> SimulationConfig {
    SimulationConfig {
        bounds: Vec2::new(20.0, 20.0),
        num_agents: 2,
        method,
        rng_seed: Some(0xDEADBEEF),
        ..SimulationConfig::default()
    }
}

fn spawn_head_on_pair(simulation: &mut Simulation) {
    let personality = Personality::default();
    simulation
        .add_agent(0, Vec2::new(0.0, 0.0), Vec2::new(20.0, 0.0), personality)
        .expect("agent a");
    simulation
        .add_agent(1, Vec2::new(20.0, 0.0), Vec2::new(0.0, 0.0), personality)
        .expect("agent b");
}

#[test]
fn head_on_pair_stays_symmetric_and_arrives() {
    let mut simulation = Simulation::new(head_on_config(AvoidanceMethod::Rvo)).expect("simulation");
    spawn_head_on_pair(&mut simulation);

    let delta_time = 0.1;
    let mut arrived_at = None;
    for tick in 0..600 {
        simulation.step(delta_time);
        let columns = simulation.store().columns();
        let (pa, pb) = (columns.positions()[0], columns.positions()[1]);
        let (va, vb) = (columns.velocities()[0], columns.velocities()[1]);

        // While the pair is still outside visual range everything stays on
        // the axis and the mirror is exact.
        if tick < 70 {
            assert!((va.x + vb.x).abs() < 1e-5, "tick {tick}: va={va:?} vb={vb:?}");
            assert_eq!(va.y, 0.0);
            assert_eq!(vb.y, 0.0);
        } else {
            // Once avoidance kicks in, discretized tie-breaking may resolve
            // the two agents onto opposite lateral sides; the x components
            // stay mirrored and the lateral magnitudes stay matched up to
            // one sampling cell.
            assert!((va.x + vb.x).abs() < 0.45, "tick {tick}: va={va:?} vb={vb:?}");
            assert!(
                (va.y.abs() - vb.y.abs()).abs() < 0.45,
                "tick {tick}: va={va:?} vb={vb:?}"
            );
        }
        assert!(
            (pa.x + pb.x - 20.0).abs() < 0.15,
            "tick {tick}: pa={pa:?} pb={pb:?}"
        );
        assert!(
            (pa.y.abs() - pb.y.abs()).abs() < 0.15,
            "tick {tick}: pa={pa:?} pb={pb:?}"
        );

        let separation = (pb - pa).length();
        assert!(
            separation > 0.2,
            "tick {tick}: agents interpenetrated, separation {separation}"
        );

        if simulation.all_arrived() {
            arrived_at = Some(tick);
            break;
        }
    }
    assert!(arrived_at.is_some(), "pair never reached its destinations");
}

#[test]
fn head_on_pair_arrives_under_hrvo() {
    let mut simulation =
        Simulation::new(head_on_config(AvoidanceMethod::Hrvo)).expect("simulation");
    spawn_head_on_pair(&mut simulation);

    for _ in 0..600 {
        simulation.step(0.1);
        if simulation.all_arrived() {
            break;
        }
    }
    assert!(simulation.all_arrived());
    for position in simulation.store().columns().positions() {
        assert!(position.x.is_finite() && position.y.is_finite());
    }
}

#[test]
fn seeded_runs_are_deterministic() {
    let config = SimulationConfig {
        bounds: Vec2::new(20.0, 20.0),
        num_agents: 30,
        rng_seed: Some(42),
        ..SimulationConfig::default()
    };
    let demographics = Demographics::default();

    let run = |config: SimulationConfig| {
        let mut simulation = Simulation::generate(config, &demographics).expect("simulation");
        for _ in 0..20 {
            simulation.step(0.05);
        }
        simulation
            .store()
            .columns()
            .positions()
            .to_vec()
    };

    let positions_a = run(config.clone());
    let positions_b = run(config.clone());
    assert_eq!(
        positions_a, positions_b,
        "identical seeds should produce identical trajectories"
    );

    let mut different_seed = config;
    different_seed.rng_seed = Some(0xF00DF00D);
    let positions_c = run(different_seed);
    assert_ne!(
        positions_a, positions_c,
        "different seeds should place agents differently"
    );
}

#[test]
fn circular_population_crosses_and_arrives() {
    let config = SimulationConfig {
        bounds: Vec2::new(30.0, 30.0),
        num_agents: 3,
        spawn_style: SpawnStyle::Circular,
        bound_edge_buffer: 5.0,
        rng_seed: Some(9),
        ..SimulationConfig::default()
    };
    let mut simulation = Simulation::generate(config, &Demographics::default()).expect("simulation");

    let mut ticks = 0;
    while !simulation.all_arrived() && ticks < 1500 {
        simulation.step(0.1);
        ticks += 1;
    }
    assert!(
        simulation.all_arrived(),
        "ring population still moving after {ticks} ticks"
    );
}

#[derive(Clone, Default)]
struct SpySink {
    batches: Arc<Mutex<Vec<TickBatch>>>,
}

impl SimulationSink for SpySink {
    fn on_tick(&mut self, batch: &TickBatch) {
        self.batches.lock().unwrap().push(batch.clone());
    }
}

#[test]
fn sink_receives_batches_on_interval() {
    let config = SimulationConfig {
        bounds: Vec2::new(20.0, 20.0),
        num_agents: 2,
        summary_interval: 2,
        rng_seed: Some(1),
        ..SimulationConfig::default()
    };
    let spy = SpySink::default();
    let batches = spy.batches.clone();
    let mut simulation = Simulation::with_sink(config, Box::new(spy)).expect("simulation");
    spawn_head_on_pair(&mut simulation);

    for _ in 0..4 {
        simulation.step(0.1);
    }

    let batches = batches.lock().unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].summary.tick, Tick(2));
    assert_eq!(batches[1].summary.tick, Tick(4));
    assert_eq!(batches[0].agents.len(), 2);
    assert_eq!(batches[0].summary.active_count, 2);
}

#[test]
fn history_is_bounded_by_capacity() {
    let config = SimulationConfig {
        bounds: Vec2::new(20.0, 20.0),
        num_agents: 2,
        history_capacity: 4,
        rng_seed: Some(1),
        ..SimulationConfig::default()
    };
    let mut simulation = Simulation::new(config).expect("simulation");
    spawn_head_on_pair(&mut simulation);

    for _ in 0..6 {
        simulation.step(0.1);
    }

    let history: Vec<_> = simulation.history().collect();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].tick, Tick(3));
    assert_eq!(history[3].tick, Tick(6));
}

#[test]
fn deactivated_agents_are_invisible_to_planning() {
    let config = SimulationConfig {
        bounds: Vec2::new(20.0, 20.0),
        num_agents: 3,
        visual_radius: 10.0,
        rng_seed: Some(2),
        ..SimulationConfig::default()
    };
    let mut simulation = Simulation::new(config).expect("simulation");
    let personality = Personality::default();
    // Agent 1 sits directly on agent 0's straight-line path.
    simulation
        .add_agent(0, Vec2::new(2.0, 10.0), Vec2::new(18.0, 10.0), personality)
        .expect("runner");
    simulation
        .add_agent(1, Vec2::new(10.0, 10.0), Vec2::new(10.0, 10.0), personality)
        .expect("blocker");
    simulation
        .add_agent(2, Vec2::new(18.0, 2.0), Vec2::new(18.0, 18.0), personality)
        .expect("bystander");
    simulation.set_active(1, false).expect("toggle blocker off");

    simulation.step(0.1);

    // With the blocker excluded, the runner keeps its preferred velocity.
    let velocity = simulation.store().columns().velocities()[0];
    assert_eq!(velocity, Vec2::new(1.0, 0.0));
    assert!(simulation.neighbors().neighbors_of(0).is_empty());
}
