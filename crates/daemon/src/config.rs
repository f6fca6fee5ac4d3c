use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use gitops_core::api::GateKind;
use gitops_core::model::RemoteSpec;
use serde::{Deserialize, Serialize};

use crate::confirm::ConfirmMode;
use crate::error::ConfigError;

/// Daemon configuration, read from TOML.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Defaults to the kernel hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Mirror and history live here.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Control surface address.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// File holding this host's machine id.
    #[serde(default = "default_machine_id_path")]
    pub machine_id_path: String,
    /// Finished deployments kept in the history.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Remotes in priority order.
    pub remotes: Vec<RemoteSpec>,

    /// Commit signature verification.
    #[serde(default)]
    pub signing: SigningConfig,
    /// Build and deploy gates.
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    /// Evaluate/build/deploy commands.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Liveliness check and post-deployment hook.
    #[serde(default)]
    pub hooks: HooksConfig,
}

/// `[signing]` section.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Armored public key files; a commit signed by any of them is accepted.
    #[serde(default)]
    pub keys: Vec<String>,
}

/// `[confirmation]` section.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfirmationConfig {
    /// `[confirmation.build]`.
    #[serde(default)]
    pub build: GateConfig,
    /// `[confirmation.deploy]`.
    #[serde(default)]
    pub deploy: GateConfig,
}

/// Confirmation mode as written in the file.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModeName {
    /// No confirmation.
    #[default]
    Without,
    /// Wait for an explicit confirm.
    Manual,
    /// Confirm after `auto_confirm_secs`.
    Auto,
}

/// One gate's settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GateConfig {
    /// Confirmation mode.
    #[serde(default)]
    pub mode: ModeName,
    /// Required, and positive, for `auto`.
    #[serde(default)]
    pub auto_confirm_secs: Option<u64>,
}

impl GateConfig {
    /// Resolves the mode; `auto` without a duration is rejected.
    pub fn confirm_mode(&self, gate: GateKind) -> Result<ConfirmMode, ConfigError> {
        match self.mode {
            ModeName::Without => Ok(ConfirmMode::Without),
            ModeName::Manual => Ok(ConfirmMode::Manual),
            ModeName::Auto => match self.auto_confirm_secs {
                Some(secs) if secs > 0 => Ok(ConfirmMode::Auto(Duration::from_secs(secs))),
                _ => Err(ConfigError::AutoWithoutDuration(gate)),
            },
        }
    }
}

/// `[executor]` section. Commands are `sh -c` templates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Must print `{"drv_path", "out_path", "machine_id"}` as its last stdout line.
    #[serde(default = "default_eval_command")]
    pub eval_command: String,
    /// Realises `${drv_path}`.
    #[serde(default = "default_build_command")]
    pub build_command: String,
    /// May print `{"restart_required", "profile_path"}` as its last stdout line.
    #[serde(default = "default_deploy_command")]
    pub deploy_command: String,
    /// Evaluation limit.
    #[serde(default = "default_eval_timeout_secs")]
    pub eval_timeout_secs: u64,
    /// Build limit.
    #[serde(default = "default_build_timeout_secs")]
    pub build_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            eval_command: default_eval_command(),
            build_command: default_build_command(),
            deploy_command: default_deploy_command(),
            eval_timeout_secs: default_eval_timeout_secs(),
            build_timeout_secs: default_build_timeout_secs(),
        }
    }
}

/// `[hooks]` section. Commands are `sh -c` templates.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Non-zero exit marks the deployment failed.
    #[serde(default)]
    pub liveliness_check: Option<String>,
    /// Run after every finished deployment; failures are only logged.
    #[serde(default)]
    pub post_deployment: Option<String>,
    /// Limit for either hook.
    #[serde(default = "default_hook_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            liveliness_check: None,
            post_deployment: None,
            timeout_secs: default_hook_timeout_secs(),
        }
    }
}

fn default_state_dir() -> String {
    "/var/lib/gitops".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:4243".to_string()
}

fn default_machine_id_path() -> String {
    "/etc/machine-id".to_string()
}

fn default_history_capacity() -> usize {
    100
}

fn default_eval_command() -> String {
    concat!(
        "nix eval --json ${flake_ref} --apply ",
        "'c: { drv_path = c.config.system.build.toplevel.drvPath; ",
        "out_path = c.config.system.build.toplevel.outPath; machine_id = null; }'"
    )
    .to_string()
}

fn default_build_command() -> String {
    "nix-store --realise ${drv_path}".to_string()
}

fn default_deploy_command() -> String {
    concat!(
        "if [ ${operation} = switch ]; then ",
        "nix-env --profile /nix/var/nix/profiles/system --set ${out_path}; fi && ",
        "${out_path}/bin/switch-to-configuration ${operation}"
    )
    .to_string()
}

fn default_eval_timeout_secs() -> u64 {
    30 * 60
}

fn default_build_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_hook_timeout_secs() -> u64 {
    60
}

impl Config {
    /// Reads, parses and validates `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::from_toml(&s).with_context(|| format!("load {}", path.display()))
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(s: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(s).context("parse config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks what serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remotes.is_empty() {
            return Err(ConfigError::NoRemotes);
        }
        let mut seen = HashSet::new();
        for r in &self.remotes {
            if r.name.trim().is_empty() {
                return Err(ConfigError::EmptyField {
                    remote: r.url.clone(),
                    what: "name",
                });
            }
            if !seen.insert(r.name.as_str()) {
                return Err(ConfigError::DuplicateRemote(r.name.clone()));
            }
            let empty = |what| ConfigError::EmptyField {
                remote: r.name.clone(),
                what,
            };
            if r.url.trim().is_empty() {
                return Err(empty("url"));
            }
            if r.main.trim().is_empty() {
                return Err(empty("main branch"));
            }
            if r.testing.as_deref().is_some_and(|t| t.trim().is_empty()) {
                return Err(empty("testing branch"));
            }
            if r.timeout_secs == 0 {
                return Err(ConfigError::ZeroTimeout("remote timeout_secs"));
            }
        }
        self.confirmation.build.confirm_mode(GateKind::Build)?;
        self.confirmation.deploy.confirm_mode(GateKind::Deploy)?;
        if self.executor.eval_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("executor eval_timeout_secs"));
        }
        if self.executor.build_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("executor build_timeout_secs"));
        }
        if self.hooks.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout("hooks timeout_secs"));
        }
        Ok(())
    }

    /// Configured hostname, else the kernel's, else `localhost`.
    pub fn hostname(&self) -> String {
        if let Some(h) = self.hostname.as_deref().filter(|h| !h.is_empty()) {
            return h.to_string();
        }
        std::fs::read_to_string("/proc/sys/kernel/hostname")
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string())
    }

    /// State directory with `~` expanded.
    pub fn state_dir(&self) -> PathBuf {
        expand(&self.state_dir)
    }

    /// Local mirror of the remotes.
    pub fn repo_dir(&self) -> PathBuf {
        self.state_dir().join("repository")
    }

    /// Persisted deployment history.
    pub fn history_path(&self) -> PathBuf {
        self.state_dir().join("history.json")
    }

    /// Key files with `~` expanded.
    pub fn signing_keys(&self) -> Vec<PathBuf> {
        self.signing.keys.iter().map(|k| expand(k)).collect()
    }

    /// Mode of one gate.
    pub fn confirm_mode(&self, gate: GateKind) -> Result<ConfirmMode, ConfigError> {
        match gate {
            GateKind::Build => self.confirmation.build.confirm_mode(gate),
            GateKind::Deploy => self.confirmation.deploy.confirm_mode(gate),
        }
    }

    /// Machine id of this host, `None` when it cannot be read.
    pub fn local_machine_id(&self) -> Option<String> {
        std::fs::read_to_string(expand(&self.machine_id_path))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}
