use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::artifact::{Artifact, CircuitDescriptor, Power};
use crate::chain::ContributionRecord;
use crate::cleanup::CleanupReport;
use crate::error::{PipelineError, PipelineResult};
use crate::sequencer::Stage;

/// Summary of one pipeline run. Contribution entropy is never part of it.
#[derive(Debug, Serialize)]
pub struct PipelineReport {
    pub circuit: String,
    pub power: Power,
    pub started_at: String,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The terminal artifact already existed; nothing was run.
    Reused { artifact: PathBuf },
    Completed {
        artifact: PathBuf,
        elapsed_secs: f64,
        produced: Vec<Artifact>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        contributions: Vec<ContributionRecord>,
        cleanup: CleanupReport,
    },
}

impl PipelineReport {
    pub fn new(circuit: &CircuitDescriptor, power: Power) -> Self {
        Self {
            circuit: circuit.name().to_string(),
            power,
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            stages: Vec::new(),
        }
    }

    pub fn executed(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages
            .iter()
            .filter(|report| matches!(report.outcome, StageOutcome::Completed { .. }))
            .map(|report| report.stage)
    }

    pub fn reused(&self) -> impl Iterator<Item = Stage> + '_ {
        self.stages
            .iter()
            .filter(|report| matches!(report.outcome, StageOutcome::Reused { .. }))
            .map(|report| report.stage)
    }

    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| PipelineError::Config(format!("unable to encode report: {err}")))?;
        fs::write(path, json).map_err(|err| PipelineError::io(path, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactRole;
    use crate::chain::ContributionKind;
    use crate::entropy::EntropyToken;

    #[test]
    fn report_json_omits_entropy() {
        let circuit = CircuitDescriptor::from_source("Demo.circom").unwrap();
        let mut report = PipelineReport::new(&circuit, Power::new(12).unwrap());
        report.stages.push(StageReport {
            stage: Stage::Compile,
            outcome: StageOutcome::Reused {
                artifact: PathBuf::from("build/Demo.r1cs"),
            },
        });
        report.stages.push(StageReport {
            stage: Stage::PowersOfTau,
            outcome: StageOutcome::Completed {
                artifact: PathBuf::from("ceremony/pot12_final.ptau"),
                elapsed_secs: 1.5,
                produced: vec![Artifact::terminal(
                    ArtifactRole::Ptau,
                    Stage::PowersOfTau,
                    PathBuf::from("ceremony/pot12_final.ptau"),
                )],
                contributions: vec![ContributionRecord {
                    index: 2,
                    kind: ContributionKind::Contribution,
                    label: Some("First contribution".to_string()),
                    input: Some(PathBuf::from("ceremony/pot12_0000.ptau")),
                    output: PathBuf::from("ceremony/pot12_0001.ptau"),
                    entropy: Some(EntropyToken::from_bytes(&[0xfe; 20])),
                }],
                cleanup: CleanupReport::default(),
            },
        });

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["circuit"], "Demo");
        assert_eq!(json["power"], 12);
        assert_eq!(json["stages"][0]["outcome"], "reused");
        assert_eq!(json["stages"][1]["stage"], "powers_of_tau");
        assert_eq!(json["stages"][1]["produced"][0]["role"], "ptau");
        assert_eq!(json["stages"][1]["produced"][0]["retention"], "final");
        assert_eq!(json["stages"][1]["contributions"][0]["label"], "First contribution");
        assert!(!json.to_string().contains("fefefe"));

        assert_eq!(report.executed().collect::<Vec<_>>(), vec![Stage::PowersOfTau]);
        assert_eq!(report.reused().collect::<Vec<_>>(), vec![Stage::Compile]);
    }
}
