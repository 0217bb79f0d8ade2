use std::path::{Path, PathBuf};

use anyhow::Context as _;
use clap::Parser;
use log::{LevelFilter, error, info, warn};
use zkceremony::artifact::{ArtifactLayout, CircuitDescriptor, Power};
use zkceremony::config::{ChallengeConfig, PipelineConfig};
use zkceremony::entropy::RngEntropy;
use zkceremony::report::PipelineReport;
use zkceremony::sequencer::Sequencer;
use zkceremony::store::FsStore;

/// Compile a circom circuit and run its Groth16 trusted-setup ceremony.
///
/// Stages whose final artifact already exists are skipped, so an interrupted
/// run can simply be started again.
#[derive(Parser, Debug)]
#[command(name = "setup", version, about)]
struct Cli {
    /// Path to the circuit source, e.g. circuits/Demo.circom
    circuit: PathBuf,

    /// Ceremony exponent: supports circuits of up to 2^POWER constraints
    #[arg(value_parser = parse_power)]
    power: Power,

    /// TOML file with tool, beacon and challenge settings
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Where compiled circuit artifacts go
    #[arg(long, value_name = "DIR")]
    build_dir: Option<PathBuf>,

    /// Where ceremony parameters and keys go
    #[arg(long, value_name = "DIR")]
    ceremony_dir: Option<PathBuf>,

    /// Wait for an outside participant to answer each challenge
    #[arg(long)]
    external_challenge: bool,

    /// Keep intermediate ceremony files after each stage
    #[arg(long)]
    keep_intermediates: bool,

    /// Write a JSON summary of the run to FILE
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,

    /// Print the JSON summary of the run to stdout
    #[arg(long)]
    json: bool,
}

fn parse_power(value: &str) -> Result<Power, String> {
    value.parse::<Power>().map_err(|err| err.to_string())
}

fn init_logging() {
    let log_level = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);

    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();

    info!("Logging initialized with level: {}", log_level);
}

fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if let Some(dir) = &cli.build_dir {
        config.build_dir = dir.clone();
    }
    if let Some(dir) = &cli.ceremony_dir {
        config.ceremony_dir = dir.clone();
    }
    if cli.external_challenge && config.challenge == ChallengeConfig::Local {
        config.challenge = ChallengeConfig::External {
            response_timeout_secs: None,
        };
    }
    if cli.keep_intermediates {
        config.keep_intermediates = true;
    }

    config.build_dir = absolute(&config.build_dir)?;
    config.ceremony_dir = absolute(&config.ceremony_dir)?;
    config.working_dir = absolute(&config.working_dir)?;
    for tool in [&mut config.tools.circom, &mut config.tools.snarkjs] {
        tool.program = resolve_program(&tool.program)?;
    }
    config.validate()?;
    Ok(config)
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Failed to resolve {}", path.display()))
}

/// Tools run inside `working_dir`, so a program given as a relative path is
/// pinned to the directory the command was started from. Bare names are left
/// for the `PATH` search.
fn resolve_program(program: &str) -> anyhow::Result<String> {
    let path = Path::new(program);
    if path.is_absolute() || path.components().count() < 2 {
        return Ok(program.to_string());
    }
    Ok(absolute(path)?.display().to_string())
}

fn log_summary(report: &PipelineReport, layout: &ArtifactLayout) {
    for stage in report.reused() {
        info!("Reused {}", stage);
    }
    for stage in report.executed() {
        info!("Ran {}", stage);
    }
    info!("Constraint system:  {}", layout.r1cs().display());
    info!("Witness program:    {}", layout.wasm().display());
    info!("Phase-1 parameters: {}", layout.ptau_final().display());
    info!("Proving key:        {}", layout.zkey_final().display());
    info!("Verification key:   {}", layout.verification_key().display());
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let circuit = CircuitDescriptor::from_existing_source(absolute(&cli.circuit)?)?;
    let layout = ArtifactLayout::new(
        &config.build_dir,
        &config.ceremony_dir,
        &circuit,
        cli.power,
    );
    info!(
        "Circuit {} with exponent {} (build: {}, ceremony: {})",
        circuit.name(),
        cli.power,
        config.build_dir.display(),
        config.ceremony_dir.display()
    );
    if cli.power.get() < 8 {
        warn!("Exponent {} only supports tiny circuits", cli.power);
    }

    let mut sequencer = Sequencer::new(
        FsStore,
        config.gateway(),
        RngEntropy::os(),
        circuit,
        layout,
        config.sequencer_options()?,
    );

    let state = sequencer.probe();
    sequencer
        .gateway()
        .preflight(state.needs_compiler(), state.needs_prover())?;

    let report = sequencer.run(state).await?;

    if let Some(path) = &cli.report {
        report
            .save(path)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        info!("Report written to {}", path.display());
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    log_summary(&report, sequencer.layout());

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_logging();
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error!("Setup failed: {err:#}");
        return Err(err);
    }
    Ok(())
}
