//! Configuration types for transfer sessions

use anyhow::{anyhow, Context};

/// Environment variable naming an explicit config file.
pub const CONFIG_FILE_ENV: &str = "BPGRID_CONFIG_FILE";
/// Config file consulted when the environment does not name one.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/bpgrid/transfer.conf";

/// Tuning knobs shared by the upload and download engines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Number of throttle checks between two queries of the network side's
    /// optimal concurrency
    pub concurrency_recheck_interval: u32,
    /// Block size override in bytes (None = use the network side's block size)
    pub block_size: Option<usize>,
    /// Sleep between two available-chunk polls while staging
    pub stage_poll_interval: std::time::Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency_recheck_interval: 100,
            block_size: None,
            stage_poll_interval: std::time::Duration::from_secs(1),
        }
    }
}

impl TransferConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency_recheck_interval == 0 {
            return Err("concurrency_recheck_interval must be at least 1".to_string());
        }
        if self.block_size == Some(0) {
            return Err("block_size must be greater than zero".to_string());
        }
        if self.stage_poll_interval.is_zero() {
            return Err("stage_poll_interval must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Loads the config file named by `BPGRID_CONFIG_FILE`, falling back to
    /// [`DEFAULT_CONFIG_FILE`] and then to the defaults.
    pub fn load() -> anyhow::Result<Self> {
        match resolve_config_file(
            std::env::var_os(CONFIG_FILE_ENV).map(std::path::PathBuf::from),
            std::path::Path::new(DEFAULT_CONFIG_FILE),
        )? {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {path:?}"))?;
        Self::parse(&text).with_context(|| format!("invalid config file {path:?}"))
    }

    /// Parses `Key Value` lines; `#` starts a comment.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut config = Self::default();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let mut words = line.split_whitespace();
            let (Some(key), Some(value), None) = (words.next(), words.next(), words.next())
            else {
                return Err(anyhow!("line {}: expected 'Key Value'", lineno + 1));
            };
            match key {
                "ConcurrencyRecheckInterval" => {
                    config.concurrency_recheck_interval = value
                        .parse()
                        .with_context(|| format!("line {}: bad interval", lineno + 1))?;
                }
                "BlockSize" => {
                    let size = value
                        .parse::<bytesize::ByteSize>()
                        .map_err(|err| anyhow!("line {}: bad block size: {err}", lineno + 1))?;
                    config.block_size = Some(
                        usize::try_from(size.as_u64())
                            .with_context(|| format!("line {}: block size too big", lineno + 1))?,
                    );
                }
                "StagePollInterval" => {
                    config.stage_poll_interval = humantime::parse_duration(value)
                        .with_context(|| format!("line {}: bad duration", lineno + 1))?;
                }
                _ => return Err(anyhow!("line {}: unknown key {key:?}", lineno + 1)),
            }
        }
        config.validate().map_err(|err| anyhow!(err))?;
        Ok(config)
    }
}

/// An explicitly configured file must exist; the default one is optional.
fn resolve_config_file(
    explicit: Option<std::path::PathBuf>,
    default: &std::path::Path,
) -> anyhow::Result<Option<std::path::PathBuf>> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(anyhow!(
                "could not open config file {path:?} defined in {CONFIG_FILE_ENV}"
            ));
        }
        return Ok(Some(path));
    }
    if default.is_file() {
        return Ok(Some(default.to_path_buf()));
    }
    tracing::debug!("no config file at {default:?}, using defaults");
    Ok(None)
}
