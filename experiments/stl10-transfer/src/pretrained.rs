use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use burn::{
    module::Module,
    record::{FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use burn_common::network::downloader::download_file_as_bytes;
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

use crate::{
    registry::BackboneKind,
    resnet::{ResNet, ResNetConfig, ResNetRecord},
};

const TORCHVISION_URL: &str = "https://download.pytorch.org/models/";

/// A torchvision ImageNet checkpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PretrainedWeights {
    pub file_name: &'static str,
    pub description: &'static str,
}

impl PretrainedWeights {
    pub fn url(&self) -> String {
        format!("{TORCHVISION_URL}{}", self.file_name)
    }
}

pub fn weights(kind: BackboneKind) -> PretrainedWeights {
    match kind {
        BackboneKind::ResNet18 => PretrainedWeights {
            file_name: "resnet18-f37072fd.pth",
            description: "ResNet-18 pretrained on ImageNet",
        },
        BackboneKind::ResNet50 => PretrainedWeights {
            file_name: "resnet50-0676ba61.pth",
            description: "ResNet-50 pretrained on ImageNet",
        },
    }
}

pub fn architecture(kind: BackboneKind) -> ResNetConfig {
    match kind {
        BackboneKind::ResNet18 => ResNetConfig::resnet18(),
        BackboneKind::ResNet50 => ResNetConfig::resnet50(),
    }
}

/// Path of the cached checkpoint, downloading it first when absent.
pub fn ensure_weights(kind: BackboneKind, cache_dir: &Path) -> Result<PathBuf> {
    let weights = weights(kind);
    let dir = cache_dir.join("weights");
    let path = dir.join(weights.file_name);
    if path.exists() {
        log::debug!("using cached {} at {}", weights.description, path.display());
        return Ok(path);
    }

    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;
    log::info!("downloading {} from {}", weights.description, weights.url());
    let bytes = download_file_as_bytes(&weights.url(), weights.file_name);

    // Rename into place so an interrupted download never looks cached.
    let partial = path.with_extension("pth.part");
    fs::write(&partial, &bytes)
        .with_context(|| format!("failed to write {}", partial.display()))?;
    fs::rename(&partial, &path)
        .with_context(|| format!("failed to move weights to {}", path.display()))?;

    Ok(path)
}

/// Checkpoint keys are remapped onto [`ResNet`]: the `downsample` Sequential indices become
/// named fields and everything but `fc` moves under `backbone`.
pub fn load_args(path: &Path) -> LoadArgs {
    LoadArgs::new(path.to_path_buf())
        .with_key_remap(
            r"^(layer[1-4])\.([0-9]+)\.downsample\.0\.",
            "${1}.${2}.downsample.conv.",
        )
        .with_key_remap(
            r"^(layer[1-4])\.([0-9]+)\.downsample\.1\.",
            "${1}.${2}.downsample.bn.",
        )
        .with_key_remap(r"^(conv1|bn1|layer[1-4])\.", "backbone.${1}.")
}

/// Build the torchvision architecture for `kind` and load its ImageNet weights.
pub fn load_pretrained<B: Backend>(
    kind: BackboneKind,
    cache_dir: &Path,
    device: &B::Device,
) -> Result<ResNet<B>> {
    let path = ensure_weights(kind, cache_dir)?;
    let record: ResNetRecord<B> = PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(load_args(&path), device)
        .map_err(|err| anyhow!("failed to load weights from {}: {err:?}", path.display()))?;
    log::info!("loaded {} weights from {}", kind, path.display());

    Ok(architecture(kind).init::<B>(device).load_record(record))
}
