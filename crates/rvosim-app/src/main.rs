use anyhow::{Result, bail};
use rvosim_core::{AvoidanceMethod, Demographics, Simulation, SimulationConfig, SpawnStyle, Vec2};
use tracing::{info, warn};

fn main() -> Result<()> {
    init_tracing();
    let config = build_config()?;
    let max_ticks = env_parse("RVOSIM_MAX_TICKS", 20_000_u64);
    let delta_time = env_parse("RVOSIM_DELTA_TIME", 0.02_f32);
    if delta_time <= 0.0 {
        bail!("RVOSIM_DELTA_TIME must be positive");
    }

    info!(
        agents = config.num_agents,
        method = ?config.method,
        spawn = ?config.spawn_style,
        "Starting RVOSim headless run"
    );
    let mut simulation = Simulation::generate(config, &Demographics::default())?;

    loop {
        let summary = simulation.step(delta_time);
        if summary.tick.0.is_multiple_of(250) {
            info!(
                tick = summary.tick.0,
                active = summary.active_count,
                arrived = summary.arrived_count,
                "progress"
            );
        }
        if simulation.all_arrived() {
            info!(tick = summary.tick.0, "All agents reached their destinations");
            break;
        }
        if summary.tick.0 >= max_ticks {
            warn!(
                tick = summary.tick.0,
                arrived = summary.arrived_count,
                "Tick limit reached before all agents arrived"
            );
            break;
        }
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn build_config() -> Result<SimulationConfig> {
    let mut config = SimulationConfig {
        bounds: Vec2::new(
            env_parse("RVOSIM_BOUNDS_X", 40.0_f32),
            env_parse("RVOSIM_BOUNDS_Y", 40.0_f32),
        ),
        num_agents: env_parse("RVOSIM_AGENTS", 100_usize),
        bound_edge_buffer: env_parse("RVOSIM_EDGE_BUFFER", 5.0_f32),
        rng_seed: std::env::var("RVOSIM_SEED")
            .ok()
            .and_then(|s| s.parse::<u64>().ok()),
        ..SimulationConfig::default()
    };

    if let Ok(method) = std::env::var("RVOSIM_METHOD") {
        config.method = match method.to_ascii_lowercase().as_str() {
            "rvo" => AvoidanceMethod::Rvo,
            "hrvo" => AvoidanceMethod::Hrvo,
            other => bail!("unknown RVOSIM_METHOD {other:?}, expected rvo or hrvo"),
        };
    }
    if let Ok(spawn) = std::env::var("RVOSIM_SPAWN") {
        config.spawn_style = match spawn.to_ascii_lowercase().as_str() {
            "random" => SpawnStyle::Random,
            "rows" => SpawnStyle::Rows,
            "circular" => SpawnStyle::Circular,
            other => bail!("unknown RVOSIM_SPAWN {other:?}, expected random, rows, or circular"),
        };
    }
    config.validate()?;
    Ok(config)
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
