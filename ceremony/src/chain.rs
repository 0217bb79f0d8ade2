//! The contribution chain shared by both ceremony phases.
//!
//! Order is load-bearing: every step consumes the file the previous step
//! produced, so the chain runs strictly one step at a time and aborts on the
//! first failure. A chain that fails verification cannot be repaired by
//! re-running a single step, because entropy already mixed in upstream cannot
//! be taken back.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::artifact::{staging_path, Artifact, ArtifactLayout, ArtifactRole, Power};
use crate::entropy::{EntropySource, EntropyToken};
use crate::error::{PipelineError, PipelineResult};
use crate::gateway::{GatewayError, Lineage, Phase, ToolGateway};
use crate::sequencer::Stage;
use crate::store::ArtifactStore;
use crate::utils::is_hex;

/// Publicly known beacon value used to close a chain. It is not a secret: any
/// verifier can replay it.
pub const DEFAULT_BEACON_HASH: &str =
    "0102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
/// The beacon is hashed `2^iterations_exp` times.
pub const DEFAULT_BEACON_ITERATIONS_EXP: u32 = 10;

const MAX_BEACON_BYTES: usize = 64;
const BEACON_ITERATIONS_RANGE: std::ops::RangeInclusive<u32> = 10..=63;
const RESPONSE_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub const FIRST_CONTRIBUTION: &str = "First contribution";
pub const SECOND_CONTRIBUTION: &str = "Second contribution";
pub const THIRD_CONTRIBUTION: &str = "Third contribution";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Beacon {
    hash: String,
    iterations_exp: u32,
}

impl Beacon {
    pub fn new(hash: impl Into<String>, iterations_exp: u32) -> PipelineResult<Self> {
        let hash = hash.into();
        if !is_hex(&hash) || hash.len() / 2 > MAX_BEACON_BYTES {
            return Err(PipelineError::InvalidBeacon(format!(
                "hash must be an even-length hex string of at most {MAX_BEACON_BYTES} bytes, got {hash:?}"
            )));
        }
        if !BEACON_ITERATIONS_RANGE.contains(&iterations_exp) {
            return Err(PipelineError::InvalidBeacon(format!(
                "iteration exponent must be within {}..={}, got {iterations_exp}",
                BEACON_ITERATIONS_RANGE.start(),
                BEACON_ITERATIONS_RANGE.end()
            )));
        }
        Ok(Self {
            hash,
            iterations_exp,
        })
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn iterations_exp(&self) -> u32 {
        self.iterations_exp
    }
}

impl Default for Beacon {
    fn default() -> Self {
        Self {
            hash: DEFAULT_BEACON_HASH.to_string(),
            iterations_exp: DEFAULT_BEACON_ITERATIONS_EXP,
        }
    }
}

/// How the challenge/response round obtains its response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum ChallengeMode {
    /// Contribute to the exported challenge locally with fresh entropy.
    #[default]
    Local,
    /// Export the challenge for an outside (e.g. air-gapped) participant and
    /// wait for their response file. `wait: None` waits indefinitely.
    External { wait: Option<Duration> },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionKind {
    Initialize,
    Contribution,
    ChallengeResponse,
    Beacon,
    PreparePhase2,
}

/// One link of the chain. The entropy used is kept only for the lifetime of
/// the run and is never serialized.
#[derive(Clone, Debug, Serialize)]
pub struct ContributionRecord {
    pub index: usize,
    pub kind: ContributionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<PathBuf>,
    pub output: PathBuf,
    #[serde(skip)]
    pub entropy: Option<EntropyToken>,
}

/// File names for one run of the chain.
#[derive(Clone, Debug)]
pub struct ChainPaths {
    /// `_0000` (initialized) through `_0003` (after the challenge round).
    pub steps: [PathBuf; 4],
    pub challenge: PathBuf,
    pub response: PathBuf,
    /// Phase 1 beacons into an intermediate that `prepare phase2` consumes;
    /// phase 2 beacons straight into the terminal artifact's staging path.
    pub beacon: Option<PathBuf>,
    pub terminal: PathBuf,
}

impl ChainPaths {
    pub fn powers_of_tau(layout: &ArtifactLayout) -> Self {
        Self {
            steps: [0, 1, 2, 3].map(|step| layout.ptau_step(step)),
            challenge: layout.ptau_challenge(3),
            response: layout.ptau_response(3),
            beacon: Some(layout.ptau_beacon()),
            terminal: layout.ptau_final(),
        }
    }

    pub fn circuit_key(layout: &ArtifactLayout) -> Self {
        Self {
            steps: [0, 1, 2, 3].map(|step| layout.zkey_step(step)),
            challenge: layout.zkey_challenge(3),
            response: layout.zkey_response(3),
            beacon: None,
            terminal: layout.zkey_final(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainPlan {
    pub stage: Stage,
    pub lineage: Lineage,
    pub power: Power,
    pub paths: ChainPaths,
}

impl ChainPlan {
    pub fn powers_of_tau(layout: &ArtifactLayout) -> Self {
        Self {
            stage: Stage::PowersOfTau,
            lineage: Lineage::PowersOfTau,
            power: layout.power(),
            paths: ChainPaths::powers_of_tau(layout),
        }
    }

    pub fn circuit_key(layout: &ArtifactLayout) -> Self {
        Self {
            stage: Stage::CircuitKey,
            lineage: Lineage::CircuitKey {
                r1cs: layout.r1cs(),
                ptau: layout.ptau_final(),
            },
            power: layout.power(),
            paths: ChainPaths::circuit_key(layout),
        }
    }

    fn phase(&self) -> Phase {
        self.lineage.phase()
    }

    fn parameter_role(&self) -> ArtifactRole {
        match self.phase() {
            Phase::PowersOfTau => ArtifactRole::Ptau,
            Phase::CircuitKey => ArtifactRole::Zkey,
        }
    }

    fn beacon_label(&self) -> &'static str {
        match self.phase() {
            Phase::PowersOfTau => "Final Beacon",
            Phase::CircuitKey => "Final Beacon phase2",
        }
    }

    /// Everything the chain writes besides its terminal artifact.
    pub fn intermediates(&self) -> Vec<Artifact> {
        let role = self.parameter_role();
        let paths = &self.paths;
        let mut artifacts: Vec<Artifact> = paths
            .steps
            .iter()
            .map(|step| Artifact::intermediate(role, self.stage, step.clone()))
            .collect();
        artifacts.push(Artifact::intermediate(
            ArtifactRole::Challenge,
            self.stage,
            paths.challenge.clone(),
        ));
        artifacts.push(Artifact::intermediate(
            ArtifactRole::Response,
            self.stage,
            paths.response.clone(),
        ));
        if let Some(beacon) = &paths.beacon {
            artifacts.push(Artifact::intermediate(role, self.stage, beacon.clone()));
        }
        artifacts
    }
}

#[derive(Debug)]
pub struct ChainOutcome {
    pub terminal: PathBuf,
    pub records: Vec<ContributionRecord>,
    pub intermediates: Vec<Artifact>,
}

pub struct ContributionChain<'a, S, G, E> {
    store: &'a S,
    gateway: &'a G,
    entropy: &'a mut E,
    beacon: &'a Beacon,
    challenge: &'a ChallengeMode,
}

impl<'a, S, G, E> ContributionChain<'a, S, G, E>
where
    S: ArtifactStore,
    G: ToolGateway,
    E: EntropySource,
{
    pub fn new(
        store: &'a S,
        gateway: &'a G,
        entropy: &'a mut E,
        beacon: &'a Beacon,
        challenge: &'a ChallengeMode,
    ) -> Self {
        Self {
            store,
            gateway,
            entropy,
            beacon,
            challenge,
        }
    }

    /// Runs the full chain and promotes the verified terminal artifact.
    /// Intermediates are left in place for the cleanup policy, and are never
    /// touched when the chain fails.
    pub async fn run(&mut self, plan: &ChainPlan) -> PipelineResult<ChainOutcome> {
        let stage = plan.stage;
        let phase = plan.phase();
        let paths = &plan.paths;
        let [initial, first, second, third] = &paths.steps;
        let candidate = staging_path(&paths.terminal);
        let mut records = Vec::new();

        for dir in [initial.parent(), candidate.parent()].into_iter().flatten() {
            self.store
                .ensure_dir(dir)
                .map_err(|err| PipelineError::io(dir, err))?;
        }

        info!("{stage}: initializing {}", initial.display());
        let input = match &plan.lineage {
            Lineage::PowersOfTau => {
                self.gateway
                    .new_parameters(plan.power, initial)
                    .await
                    .map_err(tool_failure(stage))?;
                None
            }
            Lineage::CircuitKey { r1cs, ptau } => {
                self.gateway
                    .setup(r1cs, ptau, initial)
                    .await
                    .map_err(tool_failure(stage))?;
                Some(r1cs.clone())
            }
        };
        push_record(&mut records, ContributionKind::Initialize, None, input, initial, None);

        for (label, input, output) in [
            (FIRST_CONTRIBUTION, initial, first),
            (SECOND_CONTRIBUTION, first, second),
        ] {
            info!("{stage}: {label}");
            let token = self.entropy.next_token();
            self.gateway
                .contribute(phase, input, output, label, &token)
                .await
                .map_err(tool_failure(stage))?;
            push_record(
                &mut records,
                ContributionKind::Contribution,
                Some(label),
                Some(input.clone()),
                output,
                Some(token),
            );
        }

        let token = self.challenge_round(plan, second, third).await?;
        push_record(
            &mut records,
            ContributionKind::ChallengeResponse,
            Some(THIRD_CONTRIBUTION),
            Some(second.clone()),
            third,
            token,
        );

        info!("{stage}: verifying contributions so far");
        self.verify(plan, third).await?;

        let beacon_out = paths.beacon.clone().unwrap_or_else(|| candidate.clone());
        info!("{stage}: applying beacon");
        self.gateway
            .beacon(phase, third, &beacon_out, self.beacon, plan.beacon_label())
            .await
            .map_err(tool_failure(stage))?;
        push_record(
            &mut records,
            ContributionKind::Beacon,
            Some(plan.beacon_label()),
            Some(third.clone()),
            &beacon_out,
            None,
        );

        if phase == Phase::PowersOfTau {
            info!("{stage}: preparing phase 2");
            self.gateway
                .prepare_phase2(&beacon_out, &candidate)
                .await
                .map_err(tool_failure(stage))?;
            push_record(
                &mut records,
                ContributionKind::PreparePhase2,
                None,
                Some(beacon_out.clone()),
                &candidate,
                None,
            );
        }

        info!("{stage}: verifying final artifact");
        self.verify(plan, &candidate).await?;

        self.store
            .promote(&candidate, &paths.terminal)
            .map_err(|err| PipelineError::io(&paths.terminal, err))?;
        info!("{stage}: {} is final", paths.terminal.display());

        Ok(ChainOutcome {
            terminal: paths.terminal.clone(),
            records,
            intermediates: plan.intermediates(),
        })
    }

    async fn challenge_round(
        &mut self,
        plan: &ChainPlan,
        input: &Path,
        output: &Path,
    ) -> PipelineResult<Option<EntropyToken>> {
        let stage = plan.stage;
        let phase = plan.phase();
        let challenge = &plan.paths.challenge;
        let response = &plan.paths.response;

        // A response left over from an aborted run must never be imported.
        if self.store.exists(response) {
            warn!("{stage}: discarding stale response {}", response.display());
            self.store
                .remove(response)
                .map_err(|err| PipelineError::io(response, err))?;
        }

        info!("{stage}: exporting challenge {}", challenge.display());
        self.gateway
            .export_challenge(phase, input, challenge)
            .await
            .map_err(tool_failure(stage))?;

        let token = match self.challenge {
            ChallengeMode::Local => {
                let token = self.entropy.next_token();
                self.gateway
                    .contribute_challenge(phase, challenge, response, &token)
                    .await
                    .map_err(tool_failure(stage))?;
                Some(token)
            }
            ChallengeMode::External { wait } => {
                info!(
                    "{stage}: waiting for an external participant to answer {} with {}",
                    challenge.display(),
                    response.display()
                );
                self.wait_for_response(response, *wait).await?;
                None
            }
        };

        info!("{stage}: importing response {}", response.display());
        self.gateway
            .import_response(phase, input, response, output, THIRD_CONTRIBUTION)
            .await
            .map_err(tool_failure(stage))?;
        Ok(token)
    }

    /// Returns once `response` is non-empty and its size is unchanged since
    /// the previous poll.
    async fn wait_for_response(&self, response: &Path, wait: Option<Duration>) -> PipelineResult<()> {
        let started = Instant::now();
        let mut last_size = None;
        loop {
            let size = if self.store.exists(response) {
                self.store.size(response).ok()
            } else {
                None
            };
            match (last_size, size) {
                (Some(before), Some(now)) if now > 0 && now == before => return Ok(()),
                (_, Some(now)) => debug!("{} has {now} byte(s) so far", response.display()),
                _ => {}
            }
            last_size = size;

            let pause = match wait {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        return Err(PipelineError::ResponseTimeout {
                            path: response.to_path_buf(),
                            waited_secs: elapsed.as_secs(),
                        });
                    }
                    RESPONSE_POLL_INTERVAL.min(limit - elapsed)
                }
                None => RESPONSE_POLL_INTERVAL,
            };
            tokio::time::sleep(pause).await;
        }
    }

    async fn verify(&self, plan: &ChainPlan, target: &Path) -> PipelineResult<()> {
        self.gateway
            .verify(&plan.lineage, target)
            .await
            .map(|_| ())
            .map_err(|source| PipelineError::Verification {
                stage: plan.stage,
                artifact: target.to_path_buf(),
                source,
            })
    }
}

fn tool_failure(stage: Stage) -> impl Fn(GatewayError) -> PipelineError {
    move |source| PipelineError::Tool { stage, source }
}

fn push_record(
    records: &mut Vec<ContributionRecord>,
    kind: ContributionKind,
    label: Option<&str>,
    input: Option<PathBuf>,
    output: &Path,
    entropy: Option<EntropyToken>,
) {
    records.push(ContributionRecord {
        index: records.len() + 1,
        kind,
        label: label.map(str::to_string),
        input,
        output: output.to_path_buf(),
        entropy,
    });
}
