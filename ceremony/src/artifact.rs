use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::sequencer::Stage;

/// Largest exponent snarkjs accepts for bn128 powers-of-tau files.
pub const MAX_POWER: u32 = 28;

/// A circuit identified by the base name of its source file.
///
/// Every downstream artifact path is derived from `name`, so it is restricted
/// to a filesystem-safe token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitDescriptor {
    name: String,
    source: PathBuf,
}

impl CircuitDescriptor {
    pub fn from_source(source: impl Into<PathBuf>) -> PipelineResult<Self> {
        let source = source.into();
        let invalid = |reason: &str| PipelineError::InvalidCircuit {
            path: source.clone(),
            reason: reason.to_string(),
        };

        let name = source
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| invalid("cannot derive a circuit name from the file name"))?
            .to_string();
        if name.is_empty() {
            return Err(invalid("circuit name is empty"));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(invalid(&format!(
                "circuit name {name:?} contains {bad:?}; only ASCII letters, digits, '_' and '-' are allowed"
            )));
        }

        Ok(Self { name, source })
    }

    /// Like [`CircuitDescriptor::from_source`], but also requires the source
    /// file to exist.
    pub fn from_existing_source(source: impl Into<PathBuf>) -> PipelineResult<Self> {
        let descriptor = Self::from_source(source)?;
        if !descriptor.source.is_file() {
            return Err(PipelineError::InvalidCircuit {
                path: descriptor.source,
                reason: "source file does not exist".to_string(),
            });
        }
        Ok(descriptor)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

/// Ceremony exponent: the phase-1 output supports circuits of up to `2^power`
/// constraints and is shared by every circuit using the same exponent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Power(u32);

impl Power {
    pub fn new(value: u32) -> PipelineResult<Self> {
        if value > MAX_POWER {
            return Err(PipelineError::InvalidPower {
                input: value.to_string(),
                reason: format!("exponent must not exceed {MAX_POWER}"),
            });
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl FromStr for Power {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| PipelineError::InvalidPower {
            input: s.to_string(),
            reason: reason.to_string(),
        };
        if s.is_empty() {
            return Err(invalid("exponent is empty"));
        }
        if !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("exponent must be a plain non-negative integer"));
        }
        let value = s
            .parse::<u32>()
            .map_err(|_| invalid("exponent is out of range"))?;
        Power::new(value)
    }
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactRole {
    Ptau,
    R1cs,
    Wasm,
    Sym,
    Zkey,
    Challenge,
    Response,
    VerificationKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retention {
    /// Addressable by later stages and external consumers; never deleted here.
    Final,
    /// Deleted once the producing stage's terminal artifact is verified.
    Intermediate,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub role: ArtifactRole,
    pub stage: Stage,
    pub path: PathBuf,
    pub retention: Retention,
}

impl Artifact {
    pub fn intermediate(role: ArtifactRole, stage: Stage, path: PathBuf) -> Self {
        Self {
            role,
            stage,
            path,
            retention: Retention::Intermediate,
        }
    }

    pub fn terminal(role: ArtifactRole, stage: Stage, path: PathBuf) -> Self {
        Self {
            role,
            stage,
            path,
            retention: Retention::Final,
        }
    }
}

/// Deterministic on-disk layout. Paths are part of the external contract:
/// later manual steps and the verifier-derivation tooling read them directly.
#[derive(Clone, Debug)]
pub struct ArtifactLayout {
    build_dir: PathBuf,
    ceremony_dir: PathBuf,
    circuit: String,
    power: Power,
}

impl ArtifactLayout {
    pub fn new(
        build_dir: impl Into<PathBuf>,
        ceremony_dir: impl Into<PathBuf>,
        circuit: &CircuitDescriptor,
        power: Power,
    ) -> Self {
        Self {
            build_dir: build_dir.into(),
            ceremony_dir: ceremony_dir.into(),
            circuit: circuit.name().to_string(),
            power,
        }
    }

    pub fn build_dir(&self) -> &Path {
        &self.build_dir
    }

    pub fn ceremony_dir(&self) -> &Path {
        &self.ceremony_dir
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.build_dir.join("keys")
    }

    pub fn power(&self) -> Power {
        self.power
    }

    pub fn circuit_name(&self) -> &str {
        &self.circuit
    }

    // Phase 1

    pub fn ptau_final(&self) -> PathBuf {
        self.ceremony_dir
            .join(format!("pot{}_final.ptau", self.power))
    }

    pub fn ptau_step(&self, step: u32) -> PathBuf {
        self.ceremony_dir
            .join(format!("pot{}_{:04}.ptau", self.power, step))
    }

    pub fn ptau_challenge(&self, step: u32) -> PathBuf {
        self.ceremony_dir
            .join(format!("pot{}_challenge_{:04}", self.power, step))
    }

    pub fn ptau_response(&self, step: u32) -> PathBuf {
        self.ceremony_dir
            .join(format!("pot{}_response_{:04}", self.power, step))
    }

    pub fn ptau_beacon(&self) -> PathBuf {
        self.ceremony_dir
            .join(format!("pot{}_beacon.ptau", self.power))
    }

    // Compiler output

    pub fn r1cs(&self) -> PathBuf {
        self.build_dir.join(format!("{}.r1cs", self.circuit))
    }

    pub fn sym(&self) -> PathBuf {
        self.build_dir.join(format!("{}.sym", self.circuit))
    }

    pub fn wasm_dir(&self) -> PathBuf {
        self.build_dir.join(format!("{}_js", self.circuit))
    }

    pub fn wasm(&self) -> PathBuf {
        self.wasm_dir().join(format!("{}.wasm", self.circuit))
    }

    /// Scratch directory the compiler writes into before its output is
    /// promoted next to the other build artifacts.
    pub fn compile_staging_dir(&self) -> PathBuf {
        self.build_dir.join(format!(".staging-{}", self.circuit))
    }

    // Phase 2

    pub fn zkey_final(&self) -> PathBuf {
        self.keys_dir().join(format!("{}_final.zkey", self.circuit))
    }

    pub fn zkey_step(&self, step: u32) -> PathBuf {
        self.keys_dir()
            .join(format!("{}_{:04}.zkey", self.circuit, step))
    }

    pub fn zkey_challenge(&self, step: u32) -> PathBuf {
        self.keys_dir()
            .join(format!("{}_challenge_{:04}", self.circuit, step))
    }

    pub fn zkey_response(&self, step: u32) -> PathBuf {
        self.keys_dir()
            .join(format!("{}_response_{:04}", self.circuit, step))
    }

    pub fn verification_key(&self) -> PathBuf {
        self.keys_dir().join("verification_key.json")
    }
}

/// Temporary sibling used to write a terminal artifact before it is verified
/// and renamed into place: `pot12_final.ptau` -> `pot12_final.partial.ptau`.
pub fn staging_path(terminal: &Path) -> PathBuf {
    let stem = terminal
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match terminal.extension() {
        Some(ext) => format!("{stem}.partial.{}", ext.to_string_lossy()),
        None => format!("{stem}.partial"),
    };
    terminal.with_file_name(name)
}
