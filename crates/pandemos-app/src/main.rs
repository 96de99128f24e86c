mod config;

use crate::config::AppConfig;
use anyhow::Result;
use clap::Parser;
use pandemos_core::glam::Vec2;
use pandemos_core::{Community, Controls, Rect, Region, RegionId, Rgb, Simulation, World};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// Chart marker color for the distancing toggle.
const DISTANCING_EVENT: Rgb = Rgb::new(0, 255, 255);
/// Chart marker color for the travel toggle.
const TRAVELING_EVENT: Rgb = Rgb::new(255, 128, 0);

/// Side length of the square field, in world units.
const FIELD_SIZE: f32 = 1080.0;

#[derive(Debug, Parser)]
#[command(name = "pandemos", version, about = "Headless epidemic simulation driver")]
struct Cli {
    /// Optional TOML file with [simulation] and [controls] tables.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Persons seeded at startup.
    #[arg(long, default_value_t = 200)]
    population: usize,

    /// Persons infected at startup.
    #[arg(long, default_value_t = 1)]
    infect: usize,

    /// Simulated seconds to run before exiting.
    #[arg(long, default_value_t = 120.0)]
    duration: f64,

    /// Frame pacing target in frames per second.
    #[arg(long, default_value_t = 120)]
    framerate: u32,

    /// Override the RNG seed from the config file.
    #[arg(long)]
    seed: Option<u64>,

    /// Run unpaced with a fixed frametime instead of wall-clock pacing.
    #[arg(long)]
    turbo: bool,

    /// Enable the social distancing force at this simulated time.
    #[arg(long)]
    distancing_on_at: Option<f64>,

    /// Disable travel dispatches at this simulated time.
    #[arg(long)]
    travel_off_at: Option<f64>,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut app = AppConfig::load(cli.config.as_deref())?;
    if let Some(seed) = cli.seed {
        app.simulation.rng_seed = Some(seed);
    }
    let (sim, controls) = bootstrap(&cli, app)?;
    info!(
        duration = cli.duration,
        framerate = cli.framerate,
        turbo = cli.turbo,
        "starting pandemos driver"
    );
    run(sim, controls, &cli)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn bootstrap(cli: &Cli, app: AppConfig) -> Result<(Simulation, Controls)> {
    let controls = app.controls;
    let mut sim = Simulation::new(app.simulation)?;
    let region = build_layout(sim.world_mut());
    let seeded = sim.world_mut().add_people(cli.population, region, &controls);
    let mut infected = 0;
    for _ in 0..cli.infect {
        if sim.world_mut().infect_one().is_none() {
            break;
        }
        infected += 1;
    }
    info!(population = seeded, infected, "world seeded");
    Ok((sim, controls))
}

/// One field-spanning fallback region and four quadrant communities.
fn build_layout(world: &mut World) -> RegionId {
    let border = world.config().border_thickness;
    let hub = world.config().hub_size;
    let half = FIELD_SIZE * 0.5;
    let quarter = FIELD_SIZE * 0.25;
    let region = world.add_region(Region::new(
        "Field",
        Rect::new(Vec2::splat(half), Vec2::splat(FIELD_SIZE)),
        border,
    ));
    for (label, center) in [
        ("Northwest", Vec2::new(quarter, quarter)),
        ("Northeast", Vec2::new(FIELD_SIZE - quarter, quarter)),
        ("Southeast", Vec2::new(FIELD_SIZE - quarter, FIELD_SIZE - quarter)),
        ("Southwest", Vec2::new(quarter, FIELD_SIZE - quarter)),
    ] {
        world.add_community(Community::new(
            label,
            Rect::new(center, Vec2::splat(half)),
            border,
            hub,
        ));
    }
    region
}

fn run(mut sim: Simulation, mut controls: Controls, cli: &Cli) -> Result<()> {
    let frame_budget = Duration::from_secs_f64(1.0 / f64::from(cli.framerate.max(1)));
    let travel_interval = sim.world().config().travel_interval;
    let mut frametime = frame_budget.as_secs_f64();
    let mut next_travel = travel_interval;
    let mut next_status = 5.0;
    let mut peak_infected = 0;

    loop {
        let frame_start = Instant::now();
        let report = sim.advance(frametime, &controls);
        peak_infected = peak_infected.max(report.counts.infected);

        if let Some(at) = cli.distancing_on_at {
            if !controls.distancing_enabled && report.time >= at {
                controls.distancing_enabled = true;
                sim.chart_mut().mark_event(DISTANCING_EVENT);
                info!(time = report.time, "distancing force enabled");
            }
        }
        if let Some(at) = cli.travel_off_at {
            if controls.traveling_enabled && report.time >= at {
                controls.traveling_enabled = false;
                sim.chart_mut().mark_event(TRAVELING_EVENT);
                info!(time = report.time, "travel dispatches disabled");
            }
        }

        if controls.traveling_enabled
            && controls.communities_enabled
            && report.time >= next_travel
        {
            let _ = sim.world_mut().travel_one();
            next_travel += travel_interval;
        }

        if report.time >= next_status {
            info!(
                time = report.time,
                susceptible = report.counts.susceptible,
                infected = report.counts.infected,
                recovered = report.counts.recovered,
                deceased = report.counts.deceased,
                "status"
            );
            next_status += 5.0;
        }

        if report.time >= cli.duration {
            info!(
                ticks = report.tick,
                peak_infected,
                susceptible = report.counts.susceptible,
                recovered = report.counts.recovered,
                deceased = report.counts.deceased,
                "simulation finished"
            );
            return Ok(());
        }

        if !cli.turbo {
            let elapsed = frame_start.elapsed();
            if elapsed < frame_budget {
                thread::sleep(frame_budget - elapsed);
            }
            frametime = frame_start.elapsed().as_secs_f64();
        }
    }
}
