//! ResNet definitions laid out so torchvision checkpoints load into them.
//!
//! Block parameters use torchvision's names (`conv1`, `bn1`, ..., `downsample`), and the
//! stages are plain vectors so `layer2.1.conv1.weight` addresses the same tensor in both.
//! Everything except `fc` lives under `backbone`, which lets the classifier be split off.

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Linear, LinearConfig, PaddingConfig2d,
    },
    tensor::{activation::relu, backend::Backend, Tensor},
};

const BOTTLENECK_EXPANSION: usize = 4;

#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Residual blocks in each of the four stages.
    pub blocks: [usize; 4],
    /// Three-convolution bottleneck blocks (ResNet-50 and deeper) instead of basic blocks.
    pub bottleneck: bool,
    #[config(default = 64)]
    pub base_width: usize,
    #[config(default = 1000)]
    pub num_classes: usize,
}

impl ResNetConfig {
    pub fn resnet18() -> Self {
        Self::new([2, 2, 2, 2], false)
    }

    pub fn resnet50() -> Self {
        Self::new([3, 4, 6, 3], true)
    }

    fn expansion(&self) -> usize {
        if self.bottleneck {
            BOTTLENECK_EXPANSION
        } else {
            1
        }
    }

    /// Channels produced by the last stage, i.e. the classifier's input width.
    pub fn feature_width(&self) -> usize {
        self.base_width * 8 * self.expansion()
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNet<B> {
        let expansion = self.expansion();
        let mut in_channels = self.base_width;
        let mut next_stage = |stage: usize| -> Vec<Residual<B>> {
            let planes = self.base_width << stage;
            let stage_stride = if stage == 0 { 1 } else { 2 };
            (0..self.blocks[stage])
                .map(|index| {
                    let stride = if index == 0 { stage_stride } else { 1 };
                    let block = residual(in_channels, planes, stride, self.bottleneck, device);
                    in_channels = planes * expansion;
                    block
                })
                .collect()
        };

        let backbone = ResNetBackbone {
            conv1: conv(3, self.base_width, 7, 2, 3, device),
            bn1: BatchNormConfig::new(self.base_width).init(device),
            maxpool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            layer1: next_stage(0),
            layer2: next_stage(1),
            layer3: next_stage(2),
            layer4: next_stage(3),
        };

        ResNet {
            backbone,
            fc: LinearConfig::new(self.feature_width(), self.num_classes).init(device),
        }
    }
}

/// A complete ResNet image classifier.
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub backbone: ResNetBackbone<B>,
    pub fc: Linear<B>,
}

impl<B: Backend> ResNet<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.fc.forward(self.backbone.forward(images))
    }

    /// Input width of the classification layer.
    pub fn feature_width(&self) -> usize {
        self.fc.weight.val().dims()[0]
    }

    /// Separate the feature extractor from its classification layer.
    pub fn split(self) -> (ResNetBackbone<B>, Linear<B>) {
        (self.backbone, self.fc)
    }
}

/// Convolutional feature extractor: stem, four residual stages, global average pooling.
#[derive(Module, Debug)]
pub struct ResNetBackbone<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    maxpool: MaxPool2d,
    layer1: Vec<Residual<B>>,
    layer2: Vec<Residual<B>>,
    layer3: Vec<Residual<B>>,
    layer4: Vec<Residual<B>>,
}

impl<B: Backend> ResNetBackbone<B> {
    /// `[batch, 3, height, width]` images to `[batch, feature_width]` pooled features.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.bn1.forward(self.conv1.forward(images)));
        let x = self.maxpool.forward(x);
        let x = self
            .stages()
            .flatten()
            .fold(x, |x, block| block.forward(x));

        let [batch, channels, _, _] = x.dims();
        x.mean_dim(3).mean_dim(2).reshape([batch, channels])
    }

    fn stages(&self) -> impl Iterator<Item = &Vec<Residual<B>>> {
        [&self.layer1, &self.layer2, &self.layer3, &self.layer4].into_iter()
    }
}

/// Basic (two 3x3 convolutions) or bottleneck (1x1, 3x3, 1x1) residual block.
#[derive(Module, Debug)]
pub struct Residual<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Option<Conv2d<B>>,
    bn3: Option<BatchNorm<B, 2>>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Residual<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(input.clone()),
            None => input.clone(),
        };

        let out = relu(self.bn1.forward(self.conv1.forward(input)));
        let out = self.bn2.forward(self.conv2.forward(out));
        let out = match (&self.conv3, &self.bn3) {
            (Some(conv3), Some(bn3)) => bn3.forward(conv3.forward(relu(out))),
            _ => out,
        };

        relu(out + identity)
    }
}

/// Projection shortcut used when a block changes resolution or width.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(input))
    }
}

fn residual<B: Backend>(
    in_channels: usize,
    planes: usize,
    stride: usize,
    bottleneck: bool,
    device: &B::Device,
) -> Residual<B> {
    let expansion = if bottleneck { BOTTLENECK_EXPANSION } else { 1 };
    let out_channels = planes * expansion;
    let downsample = (stride != 1 || in_channels != out_channels).then(|| Downsample {
        conv: conv(in_channels, out_channels, 1, stride, 0, device),
        bn: BatchNormConfig::new(out_channels).init(device),
    });

    if bottleneck {
        // torchvision v1.5: the stride sits on the 3x3 convolution.
        Residual {
            conv1: conv(in_channels, planes, 1, 1, 0, device),
            bn1: BatchNormConfig::new(planes).init(device),
            conv2: conv(planes, planes, 3, stride, 1, device),
            bn2: BatchNormConfig::new(planes).init(device),
            conv3: Some(conv(planes, out_channels, 1, 1, 0, device)),
            bn3: Some(BatchNormConfig::new(out_channels).init(device)),
            downsample,
        }
    } else {
        Residual {
            conv1: conv(in_channels, planes, 3, stride, 1, device),
            bn1: BatchNormConfig::new(planes).init(device),
            conv2: conv(planes, planes, 3, 1, 1, device),
            bn2: BatchNormConfig::new(planes).init(device),
            conv3: None,
            bn3: None,
            downsample,
        }
    }
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .init(device)
}
