//! Stage sequencing: compile, phase-1, phase-2, export.
//!
//! Resumability comes entirely from artifact presence. [`PipelineState`] is
//! probed once at startup and then threaded through the run; a stage whose
//! terminal artifact exists is skipped, even if its inputs have since changed.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::artifact::{staging_path, Artifact, ArtifactLayout, ArtifactRole, CircuitDescriptor};
use crate::chain::{Beacon, ChainOutcome, ChainPlan, ChallengeMode, ContributionChain, ContributionRecord};
use crate::cleanup::CleanupPolicy;
use crate::entropy::EntropySource;
use crate::error::{PipelineError, PipelineResult};
use crate::gateway::ToolGateway;
use crate::report::{PipelineReport, StageOutcome, StageReport};
use crate::store::ArtifactStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Compile,
    PowersOfTau,
    CircuitKey,
    ExportVerificationKey,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [
        Stage::Compile,
        Stage::PowersOfTau,
        Stage::CircuitKey,
        Stage::ExportVerificationKey,
    ];

    /// The artifact whose presence marks the stage complete.
    pub fn terminal(self, layout: &ArtifactLayout) -> PathBuf {
        match self {
            Stage::Compile => layout.r1cs(),
            Stage::PowersOfTau => layout.ptau_final(),
            Stage::CircuitKey => layout.zkey_final(),
            Stage::ExportVerificationKey => layout.verification_key(),
        }
    }

    pub fn depends_on(self) -> &'static [Stage] {
        match self {
            Stage::Compile | Stage::PowersOfTau => &[],
            Stage::CircuitKey => &[Stage::Compile, Stage::PowersOfTau],
            Stage::ExportVerificationKey => &[Stage::CircuitKey],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Compile => "compile",
            Stage::PowersOfTau => "phase-1 (powers of tau)",
            Stage::CircuitKey => "phase-2 (circuit key)",
            Stage::ExportVerificationKey => "export verification key",
        };
        f.write_str(name)
    }
}

/// Which stages are already complete, derived from terminal-artifact
/// presence. There is no state file.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineState {
    completed: BTreeSet<Stage>,
}

impl PipelineState {
    pub fn probe<S: ArtifactStore>(store: &S, layout: &ArtifactLayout) -> Self {
        let completed = Stage::ORDER
            .into_iter()
            .filter(|stage| store.exists(&stage.terminal(layout)))
            .collect();
        Self { completed }
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        self.completed.contains(&stage)
    }

    pub fn mark_complete(&mut self, stage: Stage) {
        self.completed.insert(stage);
    }

    pub fn pending(&self) -> Vec<Stage> {
        Stage::ORDER
            .into_iter()
            .filter(|stage| !self.is_complete(*stage))
            .collect()
    }

    pub fn needs_compiler(&self) -> bool {
        !self.is_complete(Stage::Compile)
    }

    /// Every stage, compile included, calls into snarkjs.
    pub fn needs_prover(&self) -> bool {
        !self.pending().is_empty()
    }
}

#[derive(Clone, Debug, Default)]
pub struct SequencerOptions {
    pub beacon: Beacon,
    pub challenge: ChallengeMode,
    pub cleanup: CleanupPolicy,
}

#[derive(Deserialize)]
struct VerificationKeyHeader {
    protocol: String,
    curve: String,
    #[serde(rename = "nPublic")]
    n_public: u64,
}

pub struct Sequencer<S, G, E> {
    store: S,
    gateway: G,
    entropy: E,
    circuit: CircuitDescriptor,
    layout: ArtifactLayout,
    options: SequencerOptions,
}

impl<S, G, E> Sequencer<S, G, E>
where
    S: ArtifactStore,
    G: ToolGateway,
    E: EntropySource,
{
    pub fn new(
        store: S,
        gateway: G,
        entropy: E,
        circuit: CircuitDescriptor,
        layout: ArtifactLayout,
        options: SequencerOptions,
    ) -> Self {
        Self {
            store,
            gateway,
            entropy,
            circuit,
            layout,
            options,
        }
    }

    pub fn probe(&self) -> PipelineState {
        PipelineState::probe(&self.store, &self.layout)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Runs every stage in order. The first error aborts the run; nothing
    /// is retried.
    pub async fn run(&mut self, mut state: PipelineState) -> PipelineResult<PipelineReport> {
        info!(
            "Starting ceremony for circuit {} with exponent {}",
            self.circuit.name(),
            self.layout.power()
        );
        let mut report = PipelineReport::new(&self.circuit, self.layout.power());
        for stage in Stage::ORDER {
            let stage_report = self.run_stage(stage, &mut state).await?;
            report.stages.push(stage_report);
        }
        info!(
            "Ceremony finished: {} stage(s) executed, {} reused",
            report.executed().count(),
            report.reused().count()
        );
        Ok(report)
    }

    pub async fn run_stage(
        &mut self,
        stage: Stage,
        state: &mut PipelineState,
    ) -> PipelineResult<StageReport> {
        let terminal = stage.terminal(&self.layout);
        if state.is_complete(stage) {
            info!("{stage}: reusing existing artifact {}", terminal.display());
            return Ok(StageReport {
                stage,
                outcome: StageOutcome::Reused { artifact: terminal },
            });
        }

        if let Some(missing) = stage
            .depends_on()
            .iter()
            .find(|dependency| !state.is_complete(**dependency))
        {
            return Err(PipelineError::MissingPrerequisite {
                stage,
                artifact: missing.terminal(&self.layout),
            });
        }

        info!("{stage}: starting");
        let started = Instant::now();
        let output = match stage {
            Stage::Compile => self.compile().await?,
            Stage::PowersOfTau => {
                let plan = ChainPlan::powers_of_tau(&self.layout);
                let outcome = self.run_chain(&plan).await?;
                StageOutput::chain(ArtifactRole::Ptau, stage, outcome)
            }
            Stage::CircuitKey => {
                let plan = ChainPlan::circuit_key(&self.layout);
                let outcome = self.run_chain(&plan).await?;
                StageOutput::chain(ArtifactRole::Zkey, stage, outcome)
            }
            Stage::ExportVerificationKey => self.export_verification_key().await?,
        };
        state.mark_complete(stage);

        let cleanup = self
            .options
            .cleanup
            .sweep(&self.store, &terminal, &output.intermediates)?;
        let elapsed = started.elapsed();
        info!("{stage}: completed in {:.1}s", elapsed.as_secs_f64());

        Ok(StageReport {
            stage,
            outcome: StageOutcome::Completed {
                artifact: terminal,
                elapsed_secs: elapsed.as_secs_f64(),
                produced: output.produced,
                contributions: output.contributions,
                cleanup,
            },
        })
    }

    async fn run_chain(&mut self, plan: &ChainPlan) -> PipelineResult<ChainOutcome> {
        let mut chain = ContributionChain::new(
            &self.store,
            &self.gateway,
            &mut self.entropy,
            &self.options.beacon,
            &self.options.challenge,
        );
        chain.run(plan).await
    }

    /// Compiles into a scratch directory, checks the constraint system with
    /// snarkjs and only then moves the outputs into place, the `.r1cs` last
    /// since its presence marks the stage complete.
    async fn compile(&self) -> PipelineResult<StageOutput> {
        let stage = Stage::Compile;
        let name = self.circuit.name();
        let staging = self.layout.compile_staging_dir();

        if self.store.exists(&staging) {
            self.store
                .remove(&staging)
                .map_err(|err| PipelineError::io(&staging, err))?;
        }
        self.store
            .ensure_dir(&staging)
            .map_err(|err| PipelineError::io(&staging, err))?;

        self.gateway
            .compile(self.circuit.source(), &staging)
            .await
            .map_err(|source| PipelineError::Tool { stage, source })?;

        let staged_r1cs = staging.join(format!("{name}.r1cs"));
        let staged_sym = staging.join(format!("{name}.sym"));
        let staged_wasm_dir = staging.join(format!("{name}_js"));
        let staged_wasm = staged_wasm_dir.join(format!("{name}.wasm"));

        for (path, what) in [(&staged_r1cs, "constraint system"), (&staged_wasm, "witness program")] {
            if !self.store.exists(path) {
                return Err(PipelineError::Malformed {
                    stage,
                    artifact: path.clone(),
                    reason: format!("compiler did not produce the {what}"),
                });
            }
        }

        self.gateway
            .r1cs_info(&staged_r1cs)
            .await
            .map_err(|source| PipelineError::Verification {
                stage,
                artifact: staged_r1cs.clone(),
                source,
            })?;

        let mut produced = vec![Artifact::terminal(ArtifactRole::Wasm, stage, self.layout.wasm())];
        let mut moves = vec![(staged_wasm_dir, self.layout.wasm_dir())];
        if self.store.exists(&staged_sym) {
            moves.push((staged_sym, self.layout.sym()));
            produced.push(Artifact::terminal(ArtifactRole::Sym, stage, self.layout.sym()));
        }
        moves.push((staged_r1cs, self.layout.r1cs()));
        produced.push(Artifact::terminal(ArtifactRole::R1cs, stage, self.layout.r1cs()));
        for (from, to) in moves {
            self.store
                .promote(&from, &to)
                .map_err(|err| PipelineError::io(&to, err))?;
        }
        info!("{stage}: {} is final", self.layout.r1cs().display());

        Ok(StageOutput {
            produced,
            intermediates: vec![Artifact::intermediate(ArtifactRole::R1cs, stage, staging)],
            ..StageOutput::default()
        })
    }

    /// Exports next to the target and promotes only a JSON key that names
    /// the groth16 protocol; a rejected candidate is deleted.
    async fn export_verification_key(&self) -> PipelineResult<StageOutput> {
        let stage = Stage::ExportVerificationKey;
        let zkey = self.layout.zkey_final();
        let target = self.layout.verification_key();
        let candidate = staging_path(&target);

        self.gateway
            .export_verification_key(&zkey, &candidate)
            .await
            .map_err(|source| PipelineError::Tool { stage, source })?;

        let header = match self.read_verification_key(stage, &candidate) {
            Ok(header) => header,
            Err(err) => {
                if let Err(remove_err) = self.store.remove(&candidate) {
                    warn!(
                        "Could not remove rejected verification key {}: {}",
                        candidate.display(),
                        remove_err
                    );
                }
                return Err(err);
            }
        };
        info!(
            "{stage}: {} key on {} with {} public input(s)",
            header.protocol, header.curve, header.n_public
        );

        self.store
            .promote(&candidate, &target)
            .map_err(|err| PipelineError::io(&target, err))?;
        Ok(StageOutput {
            produced: vec![Artifact::terminal(ArtifactRole::VerificationKey, stage, target)],
            ..StageOutput::default()
        })
    }

    fn read_verification_key(
        &self,
        stage: Stage,
        candidate: &Path,
    ) -> PipelineResult<VerificationKeyHeader> {
        let contents = self
            .store
            .read_to_string(candidate)
            .map_err(|err| PipelineError::io(candidate, err))?;
        let malformed = |reason: String| PipelineError::Malformed {
            stage,
            artifact: candidate.to_path_buf(),
            reason,
        };
        let header: VerificationKeyHeader = serde_json::from_str(&contents)
            .map_err(|err| malformed(format!("not a verification key: {err}")))?;
        if header.protocol != "groth16" {
            return Err(malformed(format!(
                "expected a groth16 key, found protocol {:?}",
                header.protocol
            )));
        }
        Ok(header)
    }
}

/// Final artifacts a stage promoted and the intermediates it left behind.
#[derive(Debug, Default)]
struct StageOutput {
    produced: Vec<Artifact>,
    intermediates: Vec<Artifact>,
    contributions: Vec<ContributionRecord>,
}

impl StageOutput {
    fn chain(role: ArtifactRole, stage: Stage, outcome: ChainOutcome) -> Self {
        Self {
            produced: vec![Artifact::terminal(role, stage, outcome.terminal)],
            intermediates: outcome.intermediates,
            contributions: outcome.records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn layout() -> ArtifactLayout {
        let circuit = CircuitDescriptor::from_source("Demo.circom").unwrap();
        ArtifactLayout::new("build", "ceremony", &circuit, crate::artifact::Power::new(12).unwrap())
    }

    #[test]
    fn probe_reflects_terminal_artifacts_only() {
        let layout = layout();
        let store = MemoryStore::new();
        store.write(layout.ptau_step(0), b"scratch".to_vec());
        assert_eq!(PipelineState::probe(&store, &layout).pending(), Stage::ORDER.to_vec());

        store.write(layout.ptau_final(), b"ptau".to_vec());
        store.write(layout.r1cs(), b"r1cs".to_vec());
        let state = PipelineState::probe(&store, &layout);
        assert!(state.is_complete(Stage::Compile));
        assert!(state.is_complete(Stage::PowersOfTau));
        assert!(!state.needs_compiler());
        assert!(state.needs_prover());
        assert_eq!(
            state.pending(),
            vec![Stage::CircuitKey, Stage::ExportVerificationKey]
        );
    }

    #[test]
    fn staged_terminals_do_not_count_as_complete() {
        let layout = layout();
        let store = MemoryStore::new();
        store.write(staging_path(&layout.zkey_final()), b"unverified".to_vec());
        let state = PipelineState::probe(&store, &layout);
        assert!(!state.is_complete(Stage::CircuitKey));
    }

    #[test]
    fn dependencies_follow_stage_order() {
        for stage in Stage::ORDER {
            for dependency in stage.depends_on() {
                assert!(dependency < &stage, "{stage} depends on later {dependency}");
            }
        }
    }

    #[test]
    fn fully_built_state_needs_no_tools() {
        let mut state = PipelineState::default();
        for stage in Stage::ORDER {
            state.mark_complete(stage);
        }
        assert!(!state.needs_compiler());
        assert!(!state.needs_prover());
    }
}
