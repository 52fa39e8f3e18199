use std::{collections::HashSet, fmt, path::PathBuf};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// STL-10 has ten classes; every head projects onto exactly this many logits.
pub const NUM_CLASSES: usize = 10;

/// Pretrained backbone families available from torchvision.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum BackboneKind {
    ResNet18,
    ResNet50,
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResNet18 => write!(f, "resnet18"),
            Self::ResNet50 => write!(f, "resnet50"),
        }
    }
}

/// One entry of the comparison.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub name: String,
    pub backbone: BackboneKind,
    pub learning_rate: f64,
    /// Dropout probability applied to backbone features before the new linear layer.
    #[serde(default)]
    pub head_dropout: Option<f64>,
}

impl RunConfig {
    pub fn new(name: impl Into<String>, backbone: BackboneKind, learning_rate: f64) -> Self {
        Self {
            name: name.into(),
            backbone,
            learning_rate,
            head_dropout: None,
        }
    }

    pub fn with_head_dropout(mut self, prob: f64) -> Self {
        self.head_dropout = Some(prob);
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub seed: u64,
    pub epochs: usize,
    pub batch_size: usize,
    pub image_size: usize,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Download cache for the dataset and weights; `~/.cache/headtune` when unset.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    pub runs: Vec<RunConfig>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            seed: 1337,
            epochs: 5,
            batch_size: 32,
            image_size: 224,
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
            cache_dir: None,
            runs: default_runs(),
        }
    }
}

pub fn default_runs() -> Vec<RunConfig> {
    vec![
        RunConfig::new("ResNet18", BackboneKind::ResNet18, 1e-3),
        RunConfig::new("ResNet50_Dropout", BackboneKind::ResNet50, 1e-3).with_head_dropout(0.5),
        RunConfig::new("ResNet50_LR_Adjusted", BackboneKind::ResNet50, 1e-4),
    ]
}

impl ExperimentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            bail!("epochs must be at least 1");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.image_size == 0 {
            bail!("image_size must be at least 1");
        }
        if let Some(channel) = self.std.iter().position(|&s| s <= 0.0) {
            bail!("std for channel {} must be positive", channel);
        }
        if self.runs.is_empty() {
            bail!("no runs configured");
        }

        let mut names = HashSet::new();
        for run in &self.runs {
            if !names.insert(run.name.as_str()) {
                bail!("duplicate run name: {}", run.name);
            }
            if !(run.learning_rate > 0.0 && run.learning_rate.is_finite()) {
                bail!("run {} has invalid learning rate {}", run.name, run.learning_rate);
            }
            if let Some(prob) = run.head_dropout {
                if !(0.0..1.0).contains(&prob) {
                    bail!("run {} has dropout {} outside [0, 1)", run.name, prob);
                }
            }
        }

        Ok(())
    }

    /// Runs to execute: all of them, or those named on the command line in config order.
    pub fn select_runs(&self, names: &[String]) -> Result<Vec<RunConfig>> {
        if names.is_empty() {
            return Ok(self.runs.clone());
        }
        if let Some(unknown) = names
            .iter()
            .find(|name| !self.runs.iter().any(|run| &run.name == *name))
        {
            bail!("unknown run: {}", unknown);
        }

        Ok(self
            .runs
            .iter()
            .filter(|run| names.contains(&run.name))
            .cloned()
            .collect())
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        match &self.cache_dir {
            Some(dir) => Ok(dir.clone()),
            None => dirs::home_dir()
                .map(|home| home.join(".cache").join("headtune"))
                .ok_or_else(|| anyhow::anyhow!("could not determine home directory")),
        }
    }
}
