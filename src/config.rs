//! TOML configuration for `ddup`.
//!
//! Every section except `[db]` is optional and falls back to defaults.
//! See `config/ddup.example.toml` for a commented example.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use docdupe_core::minhash::{DEFAULT_MIN_WORD_COUNT, DEFAULT_NUM_PERM};
use docdupe_core::scoring::DEFAULT_FUZZY_SAMPLE_SIZE;
use docdupe_core::ConfidenceWeights;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    /// The `weight_*` settings used by confidence recalculation.
    #[serde(default)]
    pub weights: ConfidenceWeights,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub import: ImportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    #[serde(default = "default_num_perm")]
    pub minhash_num_perm: usize,
    #[serde(default = "default_lsh_threshold")]
    pub lsh_threshold: f64,
    /// Derived from `lsh_threshold` when omitted.
    #[serde(default)]
    pub lsh_num_bands: Option<usize>,
    /// Acceptance threshold for the full pairwise score.
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    #[serde(default = "default_min_word_count")]
    pub min_word_count: usize,
    #[serde(default = "default_fuzzy_sample_size")]
    pub fuzzy_sample_size: usize,
    #[serde(default = "default_true")]
    pub enable_fuzzy: bool,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            minhash_num_perm: default_num_perm(),
            lsh_threshold: default_lsh_threshold(),
            lsh_num_bands: None,
            fuzzy_threshold: default_fuzzy_threshold(),
            min_word_count: default_min_word_count(),
            fuzzy_sample_size: default_fuzzy_sample_size(),
            enable_fuzzy: true,
        }
    }
}

fn default_num_perm() -> usize {
    DEFAULT_NUM_PERM
}
fn default_lsh_threshold() -> f64 {
    0.5
}
fn default_fuzzy_threshold() -> f64 {
    0.8
}
fn default_min_word_count() -> usize {
    DEFAULT_MIN_WORD_COUNT
}
fn default_fuzzy_sample_size() -> usize {
    DEFAULT_FUZZY_SAMPLE_SIZE
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_progress_every")]
    pub progress_every: usize,
    #[serde(default = "default_yield_every")]
    pub yield_every: usize,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            progress_every: default_progress_every(),
            yield_every: default_yield_every(),
            checkpoint_every: default_checkpoint_every(),
            time_limit_secs: None,
        }
    }
}

fn default_progress_every() -> usize {
    100
}
fn default_yield_every() -> usize {
    50
}
fn default_checkpoint_every() -> usize {
    250
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.txt".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let d = &config.detection;
    if d.minhash_num_perm == 0 || d.minhash_num_perm > u16::MAX as usize {
        anyhow::bail!("detection.minhash_num_perm must be in 1..=65535");
    }
    if !(d.lsh_threshold > 0.0 && d.lsh_threshold < 1.0) {
        anyhow::bail!("detection.lsh_threshold must be in (0.0, 1.0)");
    }
    if let Some(bands) = d.lsh_num_bands {
        if bands == 0 || bands > d.minhash_num_perm {
            anyhow::bail!(
                "detection.lsh_num_bands must be in 1..={}",
                d.minhash_num_perm
            );
        }
    }
    if !(0.0..=1.0).contains(&d.fuzzy_threshold) {
        anyhow::bail!("detection.fuzzy_threshold must be in [0.0, 1.0]");
    }

    config
        .weights
        .validate()
        .with_context(|| "Invalid [weights] section")?;

    let a = &config.analysis;
    if a.progress_every == 0 {
        anyhow::bail!("analysis.progress_every must be > 0");
    }
    if a.yield_every == 0 {
        anyhow::bail!("analysis.yield_every must be > 0");
    }
    if a.checkpoint_every == 0 {
        anyhow::bail!("analysis.checkpoint_every must be > 0");
    }
    if a.time_limit_secs == Some(0) {
        anyhow::bail!("analysis.time_limit_secs must be > 0 when set");
    }

    if config.import.include_globs.is_empty() {
        anyhow::bail!("import.include_globs must not be empty");
    }
    Ok(())
}
