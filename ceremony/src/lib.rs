//! # zkceremony - Resumable Groth16 trusted-setup ceremonies
//!
//! A Rust library that drives a circom circuit from source to a verification
//! key: it compiles the circuit, runs a phase-1 powers-of-tau ceremony, runs a
//! circuit-specific phase-2 ceremony, and exports the verification key. The
//! cryptography itself is delegated to the `circom` and `snarkjs` command-line
//! tools; this crate sequences them, mixes fresh entropy into every
//! contribution, verifies each chain before promoting its output and cleans up
//! after itself.
//!
//! ## Quick Start
//!
//! Add the following to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! zkceremony = "0.1.0"
//! tokio = { version = "1", features = ["full"] }
//! ```
//!
//! Both `circom` and `snarkjs` must be on `PATH` (or configured through
//! [`config::ToolsConfig`]).
//!
//! ## Basic Usage
//!
//! ### 1. Describe the run
//!
//! A run is fully determined by the circuit source, the ceremony exponent and
//! two output directories:
//!
//! ```rust,no_run
//! use zkceremony::artifact::{ArtifactLayout, CircuitDescriptor, Power};
//! use zkceremony::config::PipelineConfig;
//!
//! # fn main() -> Result<(), zkceremony::error::PipelineError> {
//! let config = PipelineConfig::default();
//! let circuit = CircuitDescriptor::from_existing_source("circuits/Demo.circom")?;
//! let layout = ArtifactLayout::new(
//!     &config.build_dir,
//!     &config.ceremony_dir,
//!     &circuit,
//!     Power::new(12)?,
//! );
//!
//! // ceremony/pot12_final.ptau, build/keys/Demo_final.zkey, ...
//! println!("{}", layout.zkey_final().display());
//! # Ok(())
//! # }
//! ```
//!
//! ### 2. Run the pipeline
//!
//! Stages whose terminal artifact already exists are skipped, so running the
//! same pipeline twice does no work the second time:
//!
//! ```rust,no_run
//! use zkceremony::artifact::{ArtifactLayout, CircuitDescriptor, Power};
//! use zkceremony::config::PipelineConfig;
//! use zkceremony::entropy::RngEntropy;
//! use zkceremony::sequencer::Sequencer;
//! use zkceremony::store::FsStore;
//!
//! # async fn run() -> Result<(), zkceremony::error::PipelineError> {
//! let config = PipelineConfig::default();
//! let circuit = CircuitDescriptor::from_existing_source("circuits/Demo.circom")?;
//! let layout = ArtifactLayout::new(
//!     &config.build_dir,
//!     &config.ceremony_dir,
//!     &circuit,
//!     Power::new(12)?,
//! );
//!
//! let mut sequencer = Sequencer::new(
//!     FsStore,
//!     config.gateway(),
//!     RngEntropy::os(),
//!     circuit,
//!     layout,
//!     config.sequencer_options()?,
//! );
//! let state = sequencer.probe();
//! sequencer
//!     .gateway()
//!     .preflight(state.needs_compiler(), state.needs_prover())?;
//! let report = sequencer.run(state).await?;
//! println!("{} stage(s) executed", report.executed().count());
//! # Ok(())
//! # }
//! ```
//!
//! ### 3. Hand the challenge to someone else
//!
//! By default the third contribution of each chain is made locally. With
//! [`chain::ChallengeMode::External`] the pipeline exports the challenge file
//! and waits for a participant to drop the matching response next to it:
//!
//! ```toml
//! [challenge]
//! mode = "external"
//! response_timeout_secs = 86400
//! ```
//!
//! ## Testing without the toolchain
//!
//! Everything that touches the outside world sits behind a trait:
//! [`gateway::ToolGateway`] for the tools, [`store::ArtifactStore`] for the
//! filesystem and [`entropy::EntropySource`] for randomness. Pair a recording
//! gateway with [`store::MemoryStore`] and a seeded RNG to exercise the full
//! sequencing logic in milliseconds.

pub mod artifact;
pub mod chain;
pub mod cleanup;
pub mod config;
pub mod entropy;
pub mod error;
pub mod gateway;
pub mod report;
pub mod sequencer;
pub mod store;
pub mod utils;
