//! Gateway to the external toolchain: the circom compiler and the snarkjs
//! proving-system CLI. Each ceremony operation has a fixed argument grammar;
//! the gateway only forwards arguments, captures output and surfaces failures.
//! It never retries.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;

use crate::artifact::Power;
use crate::chain::Beacon;
use crate::entropy::EntropyToken;
use crate::error::{PipelineError, PipelineResult};
use crate::utils::{diagnostic_tail, find_on_path};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Compile,
    R1csInfo,
    NewParameters,
    Contribute,
    ExportChallenge,
    ContributeChallenge,
    ImportResponse,
    Verify,
    Beacon,
    PreparePhase2,
    Setup,
    ExportVerificationKey,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Compile => "compile",
            Operation::R1csInfo => "r1cs-info",
            Operation::NewParameters => "new-parameters",
            Operation::Contribute => "contribute",
            Operation::ExportChallenge => "export-challenge",
            Operation::ContributeChallenge => "contribute-challenge",
            Operation::ImportResponse => "import-response",
            Operation::Verify => "verify",
            Operation::Beacon => "beacon",
            Operation::PreparePhase2 => "prepare-phase-2",
            Operation::Setup => "setup",
            Operation::ExportVerificationKey => "export-verification-key",
        };
        f.write_str(name)
    }
}

/// Which parameter file family a contribution operates on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Circuit-agnostic powers of tau (`.ptau`).
    PowersOfTau,
    /// Circuit-specific proving key (`.zkey`).
    CircuitKey,
}

/// What a verification has to be checked against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lineage {
    PowersOfTau,
    CircuitKey { r1cs: PathBuf, ptau: PathBuf },
}

impl Lineage {
    pub fn phase(&self) -> Phase {
        match self {
            Lineage::PowersOfTau => Phase::PowersOfTau,
            Lineage::CircuitKey { .. } => Phase::CircuitKey,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    Plain(String),
    /// Passed to the child as `<flag><value>`, rendered as `<flag>***`
    /// everywhere else.
    Secret { flag: &'static str, value: String },
}

impl Arg {
    fn plain(value: impl Into<String>) -> Self {
        Arg::Plain(value.into())
    }

    fn path(path: &Path) -> Self {
        Arg::Plain(path.display().to_string())
    }

    fn to_os_arg(&self) -> String {
        match self {
            Arg::Plain(value) => value.clone(),
            Arg::Secret { flag, value } => format!("{flag}{value}"),
        }
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Plain(value) => f.write_str(value),
            Arg::Secret { flag, .. } => write!(f, "{flag}***"),
        }
    }
}

/// A program plus the leading arguments needed to reach it, e.g.
/// `npx snarkjs`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Invocation {
    pub operation: Operation,
    pub program: String,
    pub args: Vec<Arg>,
    pub workdir: PathBuf,
    pub timeout: Option<Duration>,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{operation} (`{invocation}`) exited with {status}: {}", diagnostic_tail(stdout, stderr))]
    Failed {
        operation: Operation,
        invocation: String,
        status: String,
        stdout: String,
        stderr: String,
    },
    #[error("{operation} could not start `{program}`: {source}")]
    Spawn {
        operation: Operation,
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{operation} timed out after {}s", after.as_secs())]
    TimedOut { operation: Operation, after: Duration },
}

impl GatewayError {
    pub fn operation(&self) -> Operation {
        match self {
            GatewayError::Failed { operation, .. }
            | GatewayError::Spawn { operation, .. }
            | GatewayError::TimedOut { operation, .. } => *operation,
        }
    }
}

pub type GatewayResult = Result<ToolOutput, GatewayError>;

/// One method per ceremony operation, so ceremony logic can be exercised
/// against a recording fake instead of the real toolchain.
#[allow(async_fn_in_trait)]
pub trait ToolGateway {
    async fn compile(&self, source: &Path, out_dir: &Path) -> GatewayResult;

    async fn r1cs_info(&self, r1cs: &Path) -> GatewayResult;

    async fn new_parameters(&self, power: Power, output: &Path) -> GatewayResult;

    async fn contribute(
        &self,
        phase: Phase,
        input: &Path,
        output: &Path,
        label: &str,
        entropy: &EntropyToken,
    ) -> GatewayResult;

    async fn export_challenge(&self, phase: Phase, input: &Path, challenge: &Path) -> GatewayResult;

    async fn contribute_challenge(
        &self,
        phase: Phase,
        challenge: &Path,
        response: &Path,
        entropy: &EntropyToken,
    ) -> GatewayResult;

    async fn import_response(
        &self,
        phase: Phase,
        input: &Path,
        response: &Path,
        output: &Path,
        label: &str,
    ) -> GatewayResult;

    async fn verify(&self, lineage: &Lineage, target: &Path) -> GatewayResult;

    async fn beacon(
        &self,
        phase: Phase,
        input: &Path,
        output: &Path,
        beacon: &Beacon,
        label: &str,
    ) -> GatewayResult;

    async fn prepare_phase2(&self, input: &Path, output: &Path) -> GatewayResult;

    async fn setup(&self, r1cs: &Path, ptau: &Path, output: &Path) -> GatewayResult;

    async fn export_verification_key(&self, zkey: &Path, output: &Path) -> GatewayResult;
}

/// Runs circom and snarkjs as subprocesses.
#[derive(Clone, Debug)]
pub struct CommandGateway {
    circom: ToolCommand,
    snarkjs: ToolCommand,
    workdir: PathBuf,
    timeout: Option<Duration>,
}

impl CommandGateway {
    pub fn new(circom: ToolCommand, snarkjs: ToolCommand, workdir: impl Into<PathBuf>) -> Self {
        Self {
            circom,
            snarkjs,
            workdir: workdir.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Checks that the tools the remaining stages need are installed before
    /// anything runs.
    pub fn preflight(&self, needs_compiler: bool, needs_prover: bool) -> PipelineResult<()> {
        let mut required = Vec::new();
        if needs_compiler {
            required.push((&self.circom, "compile"));
        }
        if needs_prover {
            required.push((&self.snarkjs, "the ceremony stages"));
        }
        for (tool, needed_by) in required {
            let resolved = find_on_path(&tool.program).ok_or_else(|| PipelineError::MissingTool {
                program: tool.program.clone(),
                needed_by,
            })?;
            debug!("Resolved {} to {}", tool.program, resolved.display());
        }
        Ok(())
    }

    fn invocation(&self, operation: Operation, tool: &ToolCommand, args: Vec<Arg>) -> Invocation {
        let mut full = tool.args.iter().map(Arg::plain).collect::<Vec<_>>();
        full.extend(args);
        Invocation {
            operation,
            program: tool.program.clone(),
            args: full,
            workdir: self.workdir.clone(),
            timeout: self.timeout,
        }
    }

    fn snarkjs(&self, operation: Operation, args: Vec<Arg>) -> Invocation {
        self.invocation(operation, &self.snarkjs, args)
    }

    pub async fn run(&self, invocation: Invocation) -> GatewayResult {
        info!("Running {}", invocation.operation);
        debug!("$ {} (in {})", invocation, invocation.workdir.display());

        let mut command = Command::new(&invocation.program);
        command
            .args(invocation.args.iter().map(Arg::to_os_arg))
            .current_dir(&invocation.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let pending = command.output();
        let output = match invocation.timeout {
            Some(after) => tokio::time::timeout(after, pending).await.map_err(|_| {
                GatewayError::TimedOut {
                    operation: invocation.operation,
                    after,
                }
            })?,
            None => pending.await,
        }
        .map_err(|source| GatewayError::Spawn {
            operation: invocation.operation,
            program: invocation.program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(GatewayError::Failed {
                operation: invocation.operation,
                invocation: invocation.to_string(),
                status: output.status.to_string(),
                stdout,
                stderr,
            });
        }
        debug!("{} finished: {}", invocation.operation, stdout.trim_end());
        Ok(ToolOutput { stdout, stderr })
    }
}

fn family(phase: Phase) -> &'static str {
    match phase {
        Phase::PowersOfTau => "powersoftau",
        Phase::CircuitKey => "zkey",
    }
}

fn entropy_arg(entropy: &EntropyToken) -> Arg {
    Arg::Secret {
        flag: "-e=",
        value: entropy.expose().to_string(),
    }
}

impl ToolGateway for CommandGateway {
    async fn compile(&self, source: &Path, out_dir: &Path) -> GatewayResult {
        let args = vec![
            Arg::path(source),
            Arg::plain("--r1cs"),
            Arg::plain("--wasm"),
            Arg::plain("--sym"),
            Arg::plain("-o"),
            Arg::path(out_dir),
        ];
        self.run(self.invocation(Operation::Compile, &self.circom, args))
            .await
    }

    async fn r1cs_info(&self, r1cs: &Path) -> GatewayResult {
        let args = vec![Arg::plain("r1cs"), Arg::plain("info"), Arg::path(r1cs)];
        self.run(self.snarkjs(Operation::R1csInfo, args)).await
    }

    async fn new_parameters(&self, power: Power, output: &Path) -> GatewayResult {
        let args = vec![
            Arg::plain("powersoftau"),
            Arg::plain("new"),
            Arg::plain("bn128"),
            Arg::plain(power.to_string()),
            Arg::path(output),
            Arg::plain("-v"),
        ];
        self.run(self.snarkjs(Operation::NewParameters, args)).await
    }

    async fn contribute(
        &self,
        phase: Phase,
        input: &Path,
        output: &Path,
        label: &str,
        entropy: &EntropyToken,
    ) -> GatewayResult {
        let args = vec![
            Arg::plain(family(phase)),
            Arg::plain("contribute"),
            Arg::path(input),
            Arg::path(output),
            Arg::plain(format!("--name={label}")),
            Arg::plain("-v"),
            entropy_arg(entropy),
        ];
        self.run(self.snarkjs(Operation::Contribute, args)).await
    }

    async fn export_challenge(&self, phase: Phase, input: &Path, challenge: &Path) -> GatewayResult {
        let mut args = match phase {
            Phase::PowersOfTau => vec![Arg::plain("powersoftau"), Arg::plain("export"), Arg::plain("challenge")],
            Phase::CircuitKey => vec![Arg::plain("zkey"), Arg::plain("export"), Arg::plain("bellman")],
        };
        args.extend([Arg::path(input), Arg::path(challenge)]);
        self.run(self.snarkjs(Operation::ExportChallenge, args)).await
    }

    async fn contribute_challenge(
        &self,
        phase: Phase,
        challenge: &Path,
        response: &Path,
        entropy: &EntropyToken,
    ) -> GatewayResult {
        let mut args = match phase {
            Phase::PowersOfTau => vec![Arg::plain("powersoftau"), Arg::plain("challenge"), Arg::plain("contribute")],
            Phase::CircuitKey => vec![Arg::plain("zkey"), Arg::plain("bellman"), Arg::plain("contribute")],
        };
        args.extend([
            Arg::plain("bn128"),
            Arg::path(challenge),
            Arg::path(response),
            entropy_arg(entropy),
        ]);
        self.run(self.snarkjs(Operation::ContributeChallenge, args))
            .await
    }

    async fn import_response(
        &self,
        phase: Phase,
        input: &Path,
        response: &Path,
        output: &Path,
        label: &str,
    ) -> GatewayResult {
        let mut args = match phase {
            Phase::PowersOfTau => vec![Arg::plain("powersoftau"), Arg::plain("import"), Arg::plain("response")],
            Phase::CircuitKey => vec![Arg::plain("zkey"), Arg::plain("import"), Arg::plain("bellman")],
        };
        args.extend([
            Arg::path(input),
            Arg::path(response),
            Arg::path(output),
            Arg::plain(format!("-n={label}")),
        ]);
        self.run(self.snarkjs(Operation::ImportResponse, args)).await
    }

    async fn verify(&self, lineage: &Lineage, target: &Path) -> GatewayResult {
        let args = match lineage {
            Lineage::PowersOfTau => vec![
                Arg::plain("powersoftau"),
                Arg::plain("verify"),
                Arg::path(target),
            ],
            Lineage::CircuitKey { r1cs, ptau } => vec![
                Arg::plain("zkey"),
                Arg::plain("verify"),
                Arg::path(r1cs),
                Arg::path(ptau),
                Arg::path(target),
            ],
        };
        self.run(self.snarkjs(Operation::Verify, args)).await
    }

    async fn beacon(
        &self,
        phase: Phase,
        input: &Path,
        output: &Path,
        beacon: &Beacon,
        label: &str,
    ) -> GatewayResult {
        let args = vec![
            Arg::plain(family(phase)),
            Arg::plain("beacon"),
            Arg::path(input),
            Arg::path(output),
            Arg::plain(beacon.hash()),
            Arg::plain(beacon.iterations_exp().to_string()),
            Arg::plain(format!("-n={label}")),
        ];
        self.run(self.snarkjs(Operation::Beacon, args)).await
    }

    async fn prepare_phase2(&self, input: &Path, output: &Path) -> GatewayResult {
        let args = vec![
            Arg::plain("powersoftau"),
            Arg::plain("prepare"),
            Arg::plain("phase2"),
            Arg::path(input),
            Arg::path(output),
            Arg::plain("-v"),
        ];
        self.run(self.snarkjs(Operation::PreparePhase2, args)).await
    }

    async fn setup(&self, r1cs: &Path, ptau: &Path, output: &Path) -> GatewayResult {
        let args = vec![
            Arg::plain("groth16"),
            Arg::plain("setup"),
            Arg::path(r1cs),
            Arg::path(ptau),
            Arg::path(output),
        ];
        self.run(self.snarkjs(Operation::Setup, args)).await
    }

    async fn export_verification_key(&self, zkey: &Path, output: &Path) -> GatewayResult {
        let args = vec![
            Arg::plain("zkey"),
            Arg::plain("export"),
            Arg::plain("verificationkey"),
            Arg::path(zkey),
            Arg::path(output),
        ];
        self.run(self.snarkjs(Operation::ExportVerificationKey, args))
            .await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn echo_gateway() -> CommandGateway {
        CommandGateway::new(ToolCommand::new("echo"), ToolCommand::new("echo"), ".")
    }

    #[tokio::test]
    async fn contribute_forwards_label_and_entropy() {
        let entropy = EntropyToken::from_bytes(&[0x11; 4]);
        let out = echo_gateway()
            .contribute(
                Phase::PowersOfTau,
                Path::new("pot12_0000.ptau"),
                Path::new("pot12_0001.ptau"),
                "First contribution",
                &entropy,
            )
            .await
            .unwrap();
        assert_eq!(
            out.stdout.trim_end(),
            "powersoftau contribute pot12_0000.ptau pot12_0001.ptau --name=First contribution -v -e=11111111"
        );
    }

    #[tokio::test]
    async fn phase_two_uses_bellman_round_trip() {
        let gateway = echo_gateway();
        let out = gateway
            .export_challenge(Phase::CircuitKey, Path::new("Demo_0002.zkey"), Path::new("Demo_challenge_0003"))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim_end(), "zkey export bellman Demo_0002.zkey Demo_challenge_0003");

        let out = gateway
            .import_response(
                Phase::CircuitKey,
                Path::new("Demo_0002.zkey"),
                Path::new("Demo_response_0003"),
                Path::new("Demo_0003.zkey"),
                "Third contribution",
            )
            .await
            .unwrap();
        assert_eq!(
            out.stdout.trim_end(),
            "zkey import bellman Demo_0002.zkey Demo_response_0003 Demo_0003.zkey -n=Third contribution"
        );
    }

    #[tokio::test]
    async fn circuit_key_verification_includes_lineage() {
        let lineage = Lineage::CircuitKey {
            r1cs: PathBuf::from("Demo.r1cs"),
            ptau: PathBuf::from("pot12_final.ptau"),
        };
        let out = echo_gateway()
            .verify(&lineage, Path::new("Demo_final.zkey"))
            .await
            .unwrap();
        assert_eq!(
            out.stdout.trim_end(),
            "zkey verify Demo.r1cs pot12_final.ptau Demo_final.zkey"
        );
    }

    #[tokio::test]
    async fn leading_tool_args_are_kept() {
        let gateway = CommandGateway::new(
            ToolCommand::new("echo"),
            ToolCommand {
                program: "echo".to_string(),
                args: vec!["snarkjs".to_string()],
            },
            ".",
        );
        let out = gateway.r1cs_info(Path::new("Demo.r1cs")).await.unwrap();
        assert_eq!(out.stdout.trim_end(), "snarkjs r1cs info Demo.r1cs");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_typed_failure_without_secrets() {
        let gateway = CommandGateway::new(ToolCommand::new("false"), ToolCommand::new("false"), ".");
        let entropy = EntropyToken::from_bytes(&[0xcd; 4]);
        let err = gateway
            .contribute_challenge(
                Phase::PowersOfTau,
                Path::new("challenge"),
                Path::new("response"),
                &entropy,
            )
            .await
            .unwrap_err();
        assert_eq!(err.operation(), Operation::ContributeChallenge);
        let message = err.to_string();
        assert!(message.contains("-e=***"), "{message}");
        assert!(!message.contains("cdcdcdcd"), "{message}");
    }

    #[tokio::test]
    async fn expired_invocation_times_out() {
        let slow = ToolCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 5".to_string(), "sh".to_string()],
        };
        let gateway = CommandGateway::new(slow.clone(), slow, ".")
            .with_timeout(Some(Duration::from_millis(100)));
        let err = gateway.r1cs_info(Path::new("Demo.r1cs")).await.unwrap_err();
        assert!(matches!(err, GatewayError::TimedOut { operation: Operation::R1csInfo, .. }));
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let gateway = CommandGateway::new(
            ToolCommand::new("definitely-not-a-real-circom"),
            ToolCommand::new("echo"),
            ".",
        );
        let err = gateway
            .compile(Path::new("Demo.circom"), Path::new("build"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Spawn { .. }));
    }

    #[test]
    fn preflight_reports_missing_tools() {
        let gateway = CommandGateway::new(
            ToolCommand::new("definitely-not-a-real-circom"),
            ToolCommand::new("sh"),
            ".",
        );
        assert!(gateway.preflight(false, true).is_ok());
        let err = gateway.preflight(true, true).unwrap_err();
        assert!(matches!(err, PipelineError::MissingTool { needed_by: "compile", .. }));
    }
}
