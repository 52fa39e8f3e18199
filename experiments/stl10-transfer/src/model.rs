use std::path::Path;

use anyhow::{ensure, Result};
use burn::{
    module::{Module, ModuleVisitor, ParamId},
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    tensor::{backend::Backend, Tensor},
};

use crate::{
    pretrained::load_pretrained,
    registry::{RunConfig, NUM_CLASSES},
    resnet::{ResNet, ResNetBackbone},
};

/// Replacement classification layer: optional dropout, then a linear projection to the labels.
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub(crate) dropout: Option<Dropout>,
    pub(crate) linear: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn new(feature_width: usize, dropout: Option<f64>, device: &B::Device) -> Self {
        Self {
            dropout: dropout.map(|prob| DropoutConfig::new(prob).init()),
            linear: LinearConfig::new(feature_width, NUM_CLASSES).init(device),
        }
    }

    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let features = match &self.dropout {
            Some(dropout) => dropout.forward(features),
            None => features,
        };
        self.linear.forward(features)
    }

    pub fn input_dim(&self) -> usize {
        self.linear.weight.val().dims()[0]
    }

    pub fn output_dim(&self) -> usize {
        self.linear.weight.val().dims()[1]
    }

    pub fn has_dropout(&self) -> bool {
        self.dropout.is_some()
    }
}

/// Frozen pretrained feature extractor with a trainable head.
#[derive(Module, Debug)]
pub struct TransferClassifier<B: Backend> {
    pub(crate) backbone: ResNetBackbone<B>,
    pub(crate) head: ClassifierHead<B>,
}

impl<B: Backend> TransferClassifier<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    pub fn head(&self) -> &ClassifierHead<B> {
        &self.head
    }

    pub fn backbone_parameters(&self) -> ParameterSummary {
        ParameterSummary::of(&self.backbone)
    }

    pub fn head_parameters(&self) -> ParameterSummary {
        ParameterSummary::of(&self.head)
    }
}

/// Freeze every parameter of `pretrained` and swap its classification layer for a new head.
pub fn attach_head<B: Backend>(
    pretrained: ResNet<B>,
    run: &RunConfig,
    device: &B::Device,
) -> TransferClassifier<B> {
    let feature_width = pretrained.feature_width();
    let (backbone, _imagenet_fc) = pretrained.no_grad().split();

    TransferClassifier {
        backbone,
        head: ClassifierHead::new(feature_width, run.head_dropout, device),
    }
}

/// Download (if needed) and load the run's pretrained backbone, then attach a fresh head.
pub fn build_model<B: Backend>(
    run: &RunConfig,
    cache_dir: &Path,
    device: &B::Device,
) -> Result<TransferClassifier<B>> {
    let pretrained = load_pretrained::<B>(run.backbone, cache_dir, device)?;
    let model = attach_head(pretrained, run, device);
    ensure!(
        model.head().output_dim() == NUM_CLASSES,
        "head of {} projects onto {} classes, expected {}",
        run.name,
        model.head().output_dim(),
        NUM_CLASSES
    );

    let backbone = model.backbone_parameters();
    let head = model.head_parameters();
    log::info!(
        "{}: {} frozen backbone parameters, {} trainable head parameters (features {} -> {}, dropout: {})",
        run.name,
        backbone.frozen_elements,
        head.trainable_elements,
        model.head().input_dim(),
        model.head().output_dim(),
        model.head().has_dropout()
    );

    Ok(model)
}

/// Counts of float parameters by whether they track gradients.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ParameterSummary {
    pub trainable_tensors: usize,
    pub frozen_tensors: usize,
    pub trainable_elements: usize,
    pub frozen_elements: usize,
}

impl ParameterSummary {
    pub fn of<B: Backend, M: Module<B>>(module: &M) -> Self {
        let mut summary = Self::default();
        module.visit(&mut summary);
        summary
    }
}

impl<B: Backend> ModuleVisitor<B> for ParameterSummary {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        let elements = tensor.shape().num_elements();
        if tensor.is_require_grad() {
            self.trainable_tensors += 1;
            self.trainable_elements += elements;
        } else {
            self.frozen_tensors += 1;
            self.frozen_elements += elements;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        registry::{default_runs, BackboneKind},
        resnet::tests::tiny_config,
    };
    use burn_autodiff::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_pretrained(kind: BackboneKind) -> ResNet<TestBackend> {
        let bottleneck = kind == BackboneKind::ResNet50;
        tiny_config(bottleneck).init(&Default::default())
    }

    #[test]
    fn every_configuration_gets_a_ten_way_head() {
        let device = Default::default();
        for run in default_runs() {
            let model = attach_head(tiny_pretrained(run.backbone), &run, &device);
            assert_eq!(model.head().output_dim(), NUM_CLASSES, "{}", run.name);

            let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
            assert_eq!(model.forward(images).dims(), [2, NUM_CLASSES]);
        }
    }

    #[test]
    fn head_width_follows_the_replaced_classifier() {
        let device = Default::default();
        let run = RunConfig::new("wide", BackboneKind::ResNet50, 1e-3);
        let model = attach_head(tiny_pretrained(BackboneKind::ResNet50), &run, &device);
        assert_eq!(model.head().input_dim(), tiny_config(true).feature_width());
    }

    #[test]
    fn only_the_dropout_run_gets_a_dropout_stage() {
        let device = Default::default();
        let stages: Vec<_> = default_runs()
            .iter()
            .map(|run| {
                let model = attach_head(tiny_pretrained(run.backbone), run, &device);
                (run.name.clone(), model.head().has_dropout())
            })
            .collect();

        assert_eq!(
            stages,
            [
                ("ResNet18".to_string(), false),
                ("ResNet50_Dropout".to_string(), true),
                ("ResNet50_LR_Adjusted".to_string(), false),
            ]
        );
    }

    #[test]
    fn backbone_is_frozen_and_head_is_trainable() {
        let device = Default::default();
        for run in default_runs() {
            let pretrained = tiny_pretrained(run.backbone);
            assert!(ParameterSummary::of(&pretrained).trainable_tensors > 0);

            let model = attach_head(pretrained, &run, &device);
            let backbone = model.backbone_parameters();
            assert_eq!(backbone.trainable_tensors, 0, "{}", run.name);
            assert!(backbone.frozen_tensors > 0);

            let head = model.head_parameters();
            assert_eq!(head.frozen_tensors, 0);
            // Linear weight and bias.
            assert_eq!(head.trainable_tensors, 2);
            assert_eq!(
                head.trainable_elements,
                model.head().input_dim() * NUM_CLASSES + NUM_CLASSES
            );
        }
    }
}
