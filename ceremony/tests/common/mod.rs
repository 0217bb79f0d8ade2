#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::SeedableRng;
use zkceremony::artifact::{ArtifactLayout, CircuitDescriptor, Power};
use zkceremony::chain::Beacon;
use zkceremony::entropy::{EntropyToken, RngEntropy};
use zkceremony::gateway::{GatewayError, GatewayResult, Lineage, Operation, Phase, ToolGateway, ToolOutput};
use zkceremony::store::{ArtifactStore, MemoryStore};

pub const VERIFICATION_KEY: &str = r#"{"protocol":"groth16","curve":"bn128","nPublic":1,"vk_alpha_1":["1","2","1"]}"#;

/// One recorded gateway call.
#[derive(Clone, Debug)]
pub struct Call {
    pub operation: Operation,
    pub inputs: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    pub label: Option<String>,
    pub entropy: Option<String>,
}

#[derive(Clone, Debug)]
enum Backend {
    Memory(MemoryStore),
    Disk,
}

/// Stands in for circom and snarkjs: records every call, refuses to run when
/// an input file is missing or empty and writes a small placeholder for each
/// output.
#[derive(Clone, Debug)]
pub struct FakeGateway {
    backend: Backend,
    calls: Arc<Mutex<Vec<Call>>>,
    fail_on: Option<Operation>,
    rejected: BTreeSet<PathBuf>,
    verification_key: String,
}

impl FakeGateway {
    pub fn in_memory(store: &MemoryStore) -> Self {
        Self::with_backend(Backend::Memory(store.clone()))
    }

    pub fn on_disk() -> Self {
        Self::with_backend(Backend::Disk)
    }

    fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_on: None,
            rejected: BTreeSet::new(),
            verification_key: VERIFICATION_KEY.to_string(),
        }
    }

    /// Every call to `operation` exits non-zero.
    pub fn failing_on(mut self, operation: Operation) -> Self {
        self.fail_on = Some(operation);
        self
    }

    /// Verification of `target` fails.
    pub fn rejecting(mut self, target: impl Into<PathBuf>) -> Self {
        self.rejected.insert(target.into());
        self
    }

    pub fn exporting(mut self, verification_key: &str) -> Self {
        self.verification_key = verification_key.to_string();
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.calls().into_iter().map(|call| call.operation).collect()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn exists(&self, path: &Path) -> bool {
        match &self.backend {
            Backend::Memory(store) => store.exists(path),
            Backend::Disk => path.exists(),
        }
    }

    fn is_empty_file(&self, path: &Path) -> bool {
        match &self.backend {
            Backend::Memory(store) => store.read(path).is_some_and(|contents| contents.is_empty()),
            Backend::Disk => fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.len() == 0),
        }
    }

    fn put(&self, path: &Path, contents: &str) {
        match &self.backend {
            Backend::Memory(store) => store.write(path, contents.as_bytes().to_vec()),
            Backend::Disk => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).unwrap();
                }
                fs::write(path, contents).unwrap();
            }
        }
    }

    fn record(&self, call: Call) -> GatewayResult {
        self.calls.lock().unwrap().push(call.clone());
        let operation = call.operation;

        if self.fail_on == Some(operation) {
            return Err(failure(operation, "injected failure"));
        }
        if let Some(missing) = call.inputs.iter().find(|input| !self.exists(input)) {
            return Err(failure(
                operation,
                &format!("ENOENT: no such file {}", missing.display()),
            ));
        }
        if let Some(empty) = call.inputs.iter().find(|input| self.is_empty_file(input)) {
            return Err(failure(
                operation,
                &format!("[ERROR] snarkJS: Invalid file format {}", empty.display()),
            ));
        }
        if let Some(output) = &call.output {
            let sources: Vec<String> = call
                .inputs
                .iter()
                .map(|input| input.display().to_string())
                .collect();
            self.put(
                output,
                &format!(
                    "{operation} {} <- [{}]",
                    call.label.as_deref().unwrap_or("-"),
                    sources.join(", ")
                ),
            );
        }
        Ok(ToolOutput {
            stdout: format!("{operation} ok"),
            stderr: String::new(),
        })
    }
}

fn failure(operation: Operation, stderr: &str) -> GatewayError {
    GatewayError::Failed {
        operation,
        invocation: format!("fake {operation}"),
        status: "exit status: 1".to_string(),
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn call(operation: Operation, inputs: &[&Path], output: Option<&Path>) -> Call {
    Call {
        operation,
        inputs: inputs.iter().map(|path| path.to_path_buf()).collect(),
        output: output.map(Path::to_path_buf),
        label: None,
        entropy: None,
    }
}

impl ToolGateway for FakeGateway {
    async fn compile(&self, source: &Path, out_dir: &Path) -> GatewayResult {
        let result = self.record(call(Operation::Compile, &[], None));
        if result.is_ok() {
            let name = source
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.put(&out_dir.join(format!("{name}.r1cs")), "r1cs");
            self.put(&out_dir.join(format!("{name}.sym")), "sym");
            self.put(
                &out_dir.join(format!("{name}_js")).join(format!("{name}.wasm")),
                "wasm",
            );
        }
        result
    }

    async fn r1cs_info(&self, r1cs: &Path) -> GatewayResult {
        self.record(call(Operation::R1csInfo, &[r1cs], None))
    }

    async fn new_parameters(&self, _power: Power, output: &Path) -> GatewayResult {
        self.record(call(Operation::NewParameters, &[], Some(output)))
    }

    async fn contribute(
        &self,
        _phase: Phase,
        input: &Path,
        output: &Path,
        label: &str,
        entropy: &EntropyToken,
    ) -> GatewayResult {
        let mut call = call(Operation::Contribute, &[input], Some(output));
        call.label = Some(label.to_string());
        call.entropy = Some(entropy.expose().to_string());
        self.record(call)
    }

    async fn export_challenge(&self, _phase: Phase, input: &Path, challenge: &Path) -> GatewayResult {
        self.record(call(Operation::ExportChallenge, &[input], Some(challenge)))
    }

    async fn contribute_challenge(
        &self,
        _phase: Phase,
        challenge: &Path,
        response: &Path,
        entropy: &EntropyToken,
    ) -> GatewayResult {
        let mut call = call(Operation::ContributeChallenge, &[challenge], Some(response));
        call.entropy = Some(entropy.expose().to_string());
        self.record(call)
    }

    async fn import_response(
        &self,
        _phase: Phase,
        input: &Path,
        response: &Path,
        output: &Path,
        label: &str,
    ) -> GatewayResult {
        let mut call = call(Operation::ImportResponse, &[input, response], Some(output));
        call.label = Some(label.to_string());
        self.record(call)
    }

    async fn verify(&self, lineage: &Lineage, target: &Path) -> GatewayResult {
        let inputs: Vec<&Path> = match lineage {
            Lineage::PowersOfTau => vec![target],
            Lineage::CircuitKey { r1cs, ptau } => vec![r1cs.as_path(), ptau.as_path(), target],
        };
        let result = self.record(call(Operation::Verify, &inputs, None));
        if result.is_ok() && self.rejected.contains(target) {
            return Err(failure(Operation::Verify, "[ERROR] snarkJS: Invalid contribution"));
        }
        result
    }

    async fn beacon(
        &self,
        _phase: Phase,
        input: &Path,
        output: &Path,
        _beacon: &Beacon,
        label: &str,
    ) -> GatewayResult {
        let mut call = call(Operation::Beacon, &[input], Some(output));
        call.label = Some(label.to_string());
        self.record(call)
    }

    async fn prepare_phase2(&self, input: &Path, output: &Path) -> GatewayResult {
        self.record(call(Operation::PreparePhase2, &[input], Some(output)))
    }

    async fn setup(&self, r1cs: &Path, ptau: &Path, output: &Path) -> GatewayResult {
        self.record(call(Operation::Setup, &[r1cs, ptau], Some(output)))
    }

    async fn export_verification_key(&self, zkey: &Path, output: &Path) -> GatewayResult {
        let result = self.record(call(Operation::ExportVerificationKey, &[zkey], Some(output)));
        if result.is_ok() {
            self.put(output, &self.verification_key);
        }
        result
    }
}

pub fn demo_circuit() -> CircuitDescriptor {
    CircuitDescriptor::from_source("circuits/Demo.circom").unwrap()
}

pub fn demo_layout(root: &Path) -> ArtifactLayout {
    ArtifactLayout::new(
        root.join("build"),
        root.join("ceremony"),
        &demo_circuit(),
        Power::new(12).unwrap(),
    )
}

pub fn seeded_entropy(seed: u64) -> RngEntropy<StdRng> {
    RngEntropy::new(StdRng::seed_from_u64(seed))
}

/// Every file under `root`, relative to it.
pub fn files_under(root: &Path) -> BTreeSet<PathBuf> {
    fn walk(root: &Path, dir: &Path, found: &mut BTreeSet<PathBuf>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, found);
            } else {
                found.insert(path.strip_prefix(root).unwrap().to_path_buf());
            }
        }
    }
    let mut found = BTreeSet::new();
    walk(root, root, &mut found);
    found
}
