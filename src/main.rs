use std::io::Write;
use std::time::Instant;

use clap::Parser;
use env_logger::Builder;

use fedsim::config::{Algorithm, WorkloadConfig};
use fedsim::platform::Platform;
use fedsim::runner::FlSimulation;

/// Federated learning simulation with FedCompass and FedAvg scheduling
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Platform topology file (YAML)
    platform_file: String,

    /// Workload configuration: JSON file path or inline JSON string
    config: String,

    /// Scheduling algorithm: fedcompass or fedavg
    #[clap(long, default_value = "fedcompass")]
    algorithm: String,

    /// Simulation random seed
    #[clap(long, default_value_t = 123)]
    seed: u64,
}

fn main() {
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();

    let args = Args::parse();
    let algorithm = Algorithm::parse(&args.algorithm);
    let platform = Platform::from_file(&args.platform_file);
    let config = WorkloadConfig::load(&args.config);

    let mut sim = FlSimulation::new(args.seed, platform, config, algorithm);
    let t = Instant::now();
    sim.run();
    let elapsed = t.elapsed().as_secs_f64();

    println!("Simulation time: {:.3}s", sim.time());
    if let Some(stats) = sim.compass_stats() {
        println!(
            "Processed {} arrivals, reached global step {}",
            stats.iterations, stats.global_step
        );
        println!(
            "Groups created: {}, deadline aggregations: {}, late arrivals: {}",
            stats.groups_created, stats.deadline_aggregations, stats.late_arrivals
        );
    }
    if let Some(stats) = sim.fedavg_stats() {
        println!(
            "Completed {} rounds ({} sends, {} receives)",
            stats.rounds, stats.sends, stats.receives
        );
    }
    println!(
        "{}/{} clients terminated cleanly",
        sim.finished_clients(),
        sim.num_clients()
    );
    println!(
        "Processed {} events in {:.2}s ({:.0} events/s)",
        sim.event_count(),
        elapsed,
        sim.event_count() as f64 / elapsed
    );
}
