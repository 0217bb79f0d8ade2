use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chain::{Beacon, ChallengeMode, DEFAULT_BEACON_HASH, DEFAULT_BEACON_ITERATIONS_EXP};
use crate::cleanup::CleanupPolicy;
use crate::error::{PipelineError, PipelineResult};
use crate::gateway::{CommandGateway, ToolCommand};
use crate::sequencer::SequencerOptions;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub build_dir: PathBuf,
    pub ceremony_dir: PathBuf,
    /// Directory the external tools run in.
    pub working_dir: PathBuf,
    /// Wall-clock limit per tool invocation; `0` disables it.
    pub tool_timeout_secs: u64,
    pub keep_intermediates: bool,
    pub tools: ToolsConfig,
    pub challenge: ChallengeConfig,
    pub beacon: BeaconConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub circom: ToolCommand,
    pub snarkjs: ToolCommand,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", deny_unknown_fields)]
pub enum ChallengeConfig {
    #[default]
    Local,
    External {
        /// How long to wait for the participant's response; unset waits
        /// indefinitely.
        #[serde(default)]
        response_timeout_secs: Option<u64>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BeaconConfig {
    pub hash: String,
    pub iterations_exp: u32,
}

fn default_tool_timeout_secs() -> u64 {
    60 * 60
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from("build"),
            ceremony_dir: PathBuf::from("ceremony"),
            working_dir: PathBuf::from("."),
            tool_timeout_secs: default_tool_timeout_secs(),
            keep_intermediates: false,
            tools: ToolsConfig::default(),
            challenge: ChallengeConfig::default(),
            beacon: BeaconConfig::default(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            circom: ToolCommand::new("circom"),
            snarkjs: ToolCommand::new("snarkjs"),
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            hash: DEFAULT_BEACON_HASH.to_string(),
            iterations_exp: DEFAULT_BEACON_ITERATIONS_EXP,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| PipelineError::io(path, err))?;
        let config: Self = toml::from_str(&content).map_err(|err| {
            PipelineError::Config(format!("unable to parse {}: {err}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> PipelineResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).map_err(|err| PipelineError::io(parent, err))?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| PipelineError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded).map_err(|err| PipelineError::io(path, err))
    }

    pub fn validate(&self) -> PipelineResult<()> {
        for (name, tool) in [("circom", &self.tools.circom), ("snarkjs", &self.tools.snarkjs)] {
            if tool.program.trim().is_empty() {
                return Err(PipelineError::Config(format!(
                    "tools.{name}.program must not be empty"
                )));
            }
        }
        if self.build_dir.as_os_str().is_empty() || self.ceremony_dir.as_os_str().is_empty() {
            return Err(PipelineError::Config(
                "build_dir and ceremony_dir must not be empty".to_string(),
            ));
        }
        self.beacon()?;
        Ok(())
    }

    pub fn beacon(&self) -> PipelineResult<Beacon> {
        Beacon::new(self.beacon.hash.clone(), self.beacon.iterations_exp)
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        (self.tool_timeout_secs > 0).then(|| Duration::from_secs(self.tool_timeout_secs))
    }

    pub fn challenge_mode(&self) -> ChallengeMode {
        match &self.challenge {
            ChallengeConfig::Local => ChallengeMode::Local,
            ChallengeConfig::External {
                response_timeout_secs,
            } => ChallengeMode::External {
                wait: response_timeout_secs.map(Duration::from_secs),
            },
        }
    }

    pub fn sequencer_options(&self) -> PipelineResult<SequencerOptions> {
        Ok(SequencerOptions {
            beacon: self.beacon()?,
            challenge: self.challenge_mode(),
            cleanup: CleanupPolicy::new(self.keep_intermediates),
        })
    }

    pub fn gateway(&self) -> CommandGateway {
        CommandGateway::new(
            self.tools.circom.clone(),
            self.tools.snarkjs.clone(),
            &self.working_dir,
        )
        .with_timeout(self.tool_timeout())
    }
}
