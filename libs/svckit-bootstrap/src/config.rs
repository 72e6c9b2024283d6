use anyhow::{bail, Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use svckit::operation::DEFAULT_VERIFICATION_TIMEOUT;
use svckit::{ProcessInfo, ProcessType, RunningMode};

use crate::paths::home_dir::resolve_home_dir;

/// Environment prefix; `APP__CONTAINER__VERIFICATION_TIMEOUT=5s` sets
/// `container.verification_timeout`.
pub const ENV_PREFIX: &str = "APP__";

const HOME_SUBDIR: &str = ".svckit";

/// Whole-process configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    /// `None` until YAML or env provides it; the binary then falls back to defaults.
    pub logging: Option<LoggingConfig>,
    /// Extra `<module>.yaml` files merged into `modules`.
    #[serde(default)]
    pub modules_dir: Option<String>,
    /// Raw per-module sections, keyed by module name.
    #[serde(default)]
    pub modules: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub name: String,
    /// Empty means `~/.svckit`; absolute after loading.
    pub home_dir: String,
    #[serde(default)]
    pub process_type: ProcessType,
    #[serde(default)]
    pub running_mode: RunningMode,
}

impl ServerConfig {
    pub fn process_info(&self) -> ProcessInfo {
        ProcessInfo::new(self.process_type, self.running_mode)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "mgmt-server".into(),
            home_dir: String::new(),
            process_type: ProcessType::default(),
            running_mode: RunningMode::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    /// Deadline for installed services to reach UP before an operation rolls back.
    #[serde(with = "humantime_serde")]
    pub verification_timeout: Duration,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            verification_timeout: DEFAULT_VERIFICATION_TIMEOUT,
        }
    }
}

/// Per-target log sections; `default` applies to everything else.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    /// trace | debug | info | warn | error | off
    pub console_level: String,
    /// Log file relative to the home dir; read from the `default` section only.
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_backups: Option<usize>,
    /// Age-based retention, used when `max_backups` is unset.
    #[serde(default)]
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

pub fn default_logging_config() -> LoggingConfig {
    HashMap::from([(
        "default".to_string(),
        Section {
            console_level: "info".into(),
            file: "logs/mgmt-server.log".into(),
            file_level: "debug".into(),
            max_backups: Some(3),
            max_age_days: None,
            max_size_mb: Some(100),
        },
    )])
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            container: ContainerConfig::default(),
            logging: Some(default_logging_config()),
            modules_dir: None,
            modules: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Defaults, then the YAML file, then `APP__*` environment variables.
    ///
    /// The home dir is resolved to an absolute path and created; `modules_dir` files are
    /// merged last.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        if !path.is_file() {
            bail!("config file not found: {}", path.display());
        }

        let seed = AppConfig {
            logging: None,
            ..AppConfig::default()
        };
        let mut config: AppConfig = Figment::from(Serialized::defaults(seed))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;

        config.resolve_home_dir()?;
        if let Some(dir) = config.modules_dir.clone() {
            merge_module_files(&mut config.modules, Path::new(&dir))?;
        }
        Ok(config)
    }

    /// [`AppConfig::load_layered`] when a path is given, built-in defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_layered(path);
        }
        let mut config = Self::default();
        config.resolve_home_dir()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("config is not representable as YAML")
    }

    /// `--admin-only` forces the running mode; each `-v` raises the default console level.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if args.admin_only {
            self.server.running_mode = RunningMode::AdminOnly;
        }

        let level = match args.verbose {
            0 => return,
            1 => "debug",
            _ => "trace",
        };
        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(section) = logging.get_mut("default") {
            section.console_level = level.to_string();
        }
    }

    pub fn home_dir(&self) -> PathBuf {
        PathBuf::from(&self.server.home_dir)
    }

    fn resolve_home_dir(&mut self) -> Result<()> {
        let configured = Some(self.server.home_dir.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let resolved = resolve_home_dir(configured, HOME_SUBDIR, true)
            .context("cannot resolve server.home_dir")?;
        self.server.home_dir = resolved.to_string_lossy().into_owned();
        Ok(())
    }
}

/// Command line flags that feed [`AppConfig::apply_cli_overrides`].
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub config: Option<String>,
    pub print_config: bool,
    pub verbose: u8,
    pub admin_only: bool,
}

/// `<dir>/<name>.yaml` replaces `modules.<name>`. A missing dir is not an error.
fn merge_module_files(modules: &mut HashMap<String, serde_json::Value>, dir: &Path) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    let entries =
        fs::read_dir(dir).with_context(|| format!("cannot list modules dir {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        let yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml")
        );
        let Some(module) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !yaml || !path.is_file() {
            continue;
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        let value: serde_json::Value = serde_yaml::from_str(&text)
            .with_context(|| format!("invalid YAML in {}", path.display()))?;
        modules.insert(module.to_string(), value);
    }
    Ok(())
}
