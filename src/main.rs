//! GeoQuorum - Geo-Distributed Replication Latency Modeling and Emulation
//!
//! Command line front end: prints modeled ping matrices and protocol
//! estimates, and shapes sandboxed peers to the modeled latencies.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use geoquorum::config::{Config, LoggingConfig};
use geoquorum::emulation::{
    DockerDirectory, DockerExecutor, EmulatedPeer, NetworkEmulationOrchestrator, PairResult,
};
use geoquorum::error::{Error, Result};
use geoquorum::estimate::{EstimateOptions, LatencyEstimate, Protocol, ProtocolLatencyEstimator};
use geoquorum::geo::{load_points, GeoLatencyModel, PeerSet};
use geoquorum::matrix::{nearest_neighbor_cdf, LatencyMatrix};

/// GeoQuorum - Geo-Distributed Replication Latency Modeling and Emulation
#[derive(Parser)]
#[command(name = "geoquorum")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "geoquorum.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the modeled ping matrix
    Matrix {
        /// Peer coordinate table (defaults to emulation.locations)
        #[arg(long)]
        locations: Option<PathBuf>,

        /// Only the first N peers
        #[arg(short, long)]
        nodes: Option<usize>,

        /// Also print the nearest-neighbour round trips
        #[arg(long)]
        cdf: bool,
    },

    /// Estimate protocol latency over a topology
    Estimate {
        /// Peer coordinate table (defaults to emulation.locations)
        #[arg(long)]
        locations: Option<PathBuf>,

        /// Protocol family (quorum, paxos, accord); all when omitted
        #[arg(short, long)]
        protocol: Option<Protocol>,

        /// Topology size
        #[arg(short, long)]
        nodes: usize,

        /// Quorum size replacing the majority
        #[arg(short, long)]
        quorum: Option<usize>,

        /// Weight of the best case in the reported mean
        #[arg(short, long)]
        weight: Option<f64>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Shape the first N sandboxed peers to their modeled latencies
    Emulate {
        /// Peer coordinate table (defaults to emulation.locations)
        #[arg(long)]
        locations: Option<PathBuf>,

        /// Number of peers
        #[arg(short, long)]
        nodes: usize,
    },

    /// Shape the paths of peer N+1 joining N already shaped peers
    AddPeer {
        /// Peer coordinate table (defaults to emulation.locations)
        #[arg(long)]
        locations: Option<PathBuf>,

        /// Number of peers already shaped
        #[arg(short, long)]
        existing: usize,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "geoquorum.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Validate and init must see the file as it is
    let config = match cli.command {
        Commands::Init { .. } | Commands::Validate => Config::default(),
        _ => load_config(&cli.config)?,
    };

    // Initialize logging
    init_logging(cli.log_level.as_deref(), &config.logging);

    match cli.command {
        Commands::Matrix { locations, nodes, cdf } => {
            run_matrix(&config, locations, nodes, cdf)
        }
        Commands::Estimate { locations, protocol, nodes, quorum, weight, json } => {
            run_estimate(&config, locations, protocol, nodes, quorum, weight, json)
        }
        Commands::Emulate { locations, nodes } => {
            run_emulate(config, locations, nodes).await
        }
        Commands::AddPeer { locations, existing } => {
            run_add_peer(config, locations, existing).await
        }
        Commands::Init { output } => {
            run_init(output)
        }
        Commands::Validate => {
            run_validate(cli.config)
        }
    }
}

/// Initialize logging
fn init_logging(level: Option<&str>, logging: &LoggingConfig) {
    let level = level.unwrap_or(&logging.level);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Load the configuration, falling back to defaults when the file is absent
fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::from_file(path)
    } else {
        Ok(Config::default())
    }
}

/// Load the coordinate table, preferring the command line path
fn load_locations(config: &Config, locations: Option<PathBuf>) -> Result<PeerSet> {
    let path = locations.unwrap_or_else(|| config.emulation.locations.clone());
    let peers = match load_points(&path) {
        Ok(peers) => peers,
        Err(e) => {
            tracing::error!("Failed to load peer locations from {:?}: {}", path, e);
            return Err(e);
        }
    };
    Ok(peers)
}

/// Check that the table covers the requested topology
fn require_peers(peers: &PeerSet, count: usize) -> Result<()> {
    if count > peers.len() {
        return Err(Error::Topology(format!(
            "{} peers requested but only {} locations are known",
            count,
            peers.len()
        )));
    }
    Ok(())
}

/// Print the modeled ping matrix
fn run_matrix(config: &Config, locations: Option<PathBuf>, nodes: Option<usize>, cdf: bool) -> Result<()> {
    let peers = load_locations(config, locations)?;
    let count = nodes.unwrap_or(peers.len());
    require_peers(&peers, count)?;

    let model = GeoLatencyModel::new(&config.model);
    let points = peers.prefix(count);
    print!("{}", LatencyMatrix::compute(points, &model));

    if cdf {
        println!();
        println!("Nearest-neighbour round trips (ms):");
        for (i, rtt) in nearest_neighbor_cdf(points, &model).iter().enumerate() {
            println!("  {:>5.1}%  {}", 100.0 * (i + 1) as f64 / count as f64, rtt);
        }
    }
    Ok(())
}

/// Estimate protocol latency
fn run_estimate(
    config: &Config,
    locations: Option<PathBuf>,
    protocol: Option<Protocol>,
    nodes: usize,
    quorum: Option<usize>,
    weight: Option<f64>,
    json: bool,
) -> Result<()> {
    let peers = load_locations(config, locations)?;
    let estimator = ProtocolLatencyEstimator::new(GeoLatencyModel::new(&config.model), config.estimator);
    let options = EstimateOptions {
        quorum_override: quorum,
        best_case_weight: weight.unwrap_or(config.estimator.best_case_weight),
    };

    let estimates = match protocol {
        Some(protocol) => vec![estimator.estimate(protocol, peers.points(), nodes, options)?],
        None => estimator.estimate_all(peers.points(), nodes, options)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&estimates)?);
        return Ok(());
    }

    for estimate in &estimates {
        print_estimate(estimate, &peers);
    }
    Ok(())
}

fn print_estimate(estimate: &LatencyEstimate, peers: &PeerSet) {
    let ms = |value: Option<f64>| value.map_or_else(|| "-".to_string(), |v| format!("{:.1}", v));

    println!("{} over {} peers", estimate.protocol, estimate.peers);
    println!("==========================");
    for slot in 0..estimate.peers {
        let label = peers.get(slot).map_or("(unknown)", |p| p.label.as_str());
        println!(
            "  {:<20} best {:>8}  worst {:>8}",
            label,
            ms(estimate.per_peer_best_ms[slot]),
            ms(estimate.per_peer_worst_ms[slot])
        );
    }
    println!("  Mean:          {}", ms(estimate.mean_ms));
    println!("  Mean best:     {}", ms(estimate.mean_best_ms));
    println!("  Mean worst:    {}", ms(estimate.mean_worst_ms));
    println!();
}

/// Build an orchestrator driving docker sandboxes, cancelled on Ctrl+C
fn docker_orchestrator(config: &Config) -> Result<Arc<NetworkEmulationOrchestrator>> {
    let orchestrator = Arc::new(NetworkEmulationOrchestrator::new(
        config.emulation.clone(),
        GeoLatencyModel::new(&config.model),
        Arc::new(DockerExecutor::default()),
        Arc::new(DockerDirectory::new(config.emulation.network_name.clone())),
    )?);

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, letting in-flight installs finish");
            cancel.cancel();
        }
    });

    Ok(orchestrator)
}

/// Shape the first N peers
async fn run_emulate(config: Config, locations: Option<PathBuf>, nodes: usize) -> Result<()> {
    let peers = load_locations(&config, locations)?;
    require_peers(&peers, nodes)?;

    let orchestrator = docker_orchestrator(&config)?;
    let emulated = EmulatedPeer::from_peer_set(&peers, nodes, &config.emulation);
    let results = orchestrator.emulate(&emulated).await;

    print_pairs(&results, &emulated);
    Ok(())
}

/// Shape the paths of one joining peer
async fn run_add_peer(config: Config, locations: Option<PathBuf>, existing: usize) -> Result<()> {
    let peers = load_locations(&config, locations)?;
    require_peers(&peers, existing + 1)?;

    let orchestrator = docker_orchestrator(&config)?;
    let mut emulated = EmulatedPeer::from_peer_set(&peers, existing + 1, &config.emulation);
    let Some(joining) = emulated.pop() else {
        return Ok(());
    };
    let results = orchestrator.add_peer(&joining, &emulated).await;

    emulated.push(joining);
    print_pairs(&results, &emulated);
    Ok(())
}

fn print_pairs(results: &[PairResult], peers: &[EmulatedPeer]) {
    let name = |slot: usize| peers.get(slot).map_or("?", |p| p.sandbox.as_str());

    for result in results {
        if result.ok {
            println!(
                "✓ {} <-> {}: {}ms",
                name(result.peer_a),
                name(result.peer_b),
                result.round_trip_ms()
            );
        } else {
            println!(
                "✗ {} <-> {}: {}",
                name(result.peer_a),
                name(result.peer_b),
                result.error.as_deref().unwrap_or("not installed")
            );
        }
    }

    let failed = results.iter().filter(|r| !r.ok).count();
    println!();
    println!("{} pairs shaped, {} failed", results.len() - failed, failed);
}

/// Initialize a new configuration file
fn run_init(output: PathBuf) -> Result<()> {
    let content = format!(
        "# GeoQuorum Configuration\n# Generated configuration file\n\n{}",
        Config::default().to_toml()?
    );

    std::fs::write(&output, content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to point emulation.locations at your coordinate table.");
    println!("Then run: geoquorum --config {} matrix", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match Config::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Fiber Speed:    {} km/ms", config.model.fiber_speed_km_per_ms);
            println!("  Earth Radius:   {} km", config.model.earth_radius_km);
            println!("  Emulation:      {}", if config.emulation.enabled { "enabled" } else { "disabled" });
            println!("  Device:         {}", config.emulation.device);
            println!("  Workers:        {}", config.emulation.workers);
            println!("  Locations:      {}", config.emulation.locations.display());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
