use std::path::Path;

use anyhow::{ensure, Result};
use burn::{
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use headtune_core::EpochMetrics;

use crate::{
    data::{ImageBatch, ImageTransform, Stl10Dataset, Stl10Loader},
    model::{build_model, ClassifierHead, TransferClassifier},
    registry::{ExperimentConfig, RunConfig},
};

/// Anything that can hand out one epoch of batches at a time.
pub trait BatchSource<B: Backend> {
    fn epoch(&mut self) -> Box<dyn Iterator<Item = ImageBatch<B>> + '_>;
}

/// A fixed list of batches replayed in the same order every epoch.
impl<B: Backend> BatchSource<B> for Vec<ImageBatch<B>> {
    fn epoch(&mut self) -> Box<dyn Iterator<Item = ImageBatch<B>> + '_> {
        Box::new(self.iter().cloned())
    }
}

/// Train only the head of `model` for `epochs` passes over `source`.
///
/// Returns the model and one [`EpochMetrics`] per epoch. Accuracy is measured on the
/// logits of the same forward pass that produced the loss, i.e. before that batch's update.
pub fn train_head<B, O, S>(
    mut model: TransferClassifier<B>,
    optimizer: &mut O,
    loss_fn: &CrossEntropyLoss<B>,
    learning_rate: f64,
    source: &mut S,
    epochs: usize,
) -> Result<(TransferClassifier<B>, Vec<EpochMetrics>)>
where
    B: AutodiffBackend,
    O: Optimizer<ClassifierHead<B>, B>,
    S: BatchSource<B>,
{
    let mut history = Vec::with_capacity(epochs);

    for epoch in 1..=epochs {
        let mut running_loss = 0.0f64;
        let mut batches = 0usize;
        let mut correct = 0usize;
        let mut total = 0usize;

        for batch in source.epoch() {
            let batch_total = batch.len();
            let logits = model.forward(batch.images);
            let loss = loss_fn.forward(logits.clone(), batch.targets.clone());
            let batch_correct = correct_predictions(logits, batch.targets);
            let loss_value = loss.clone().into_scalar().elem::<f32>();

            // Gradients are produced fresh by each backward pass; only the head's are kept.
            let mut grads = loss.backward();
            let grads = GradientsParams::from_module(&mut grads, &model.head);
            model.head = optimizer.step(learning_rate, model.head, grads);

            running_loss += loss_value as f64;
            batches += 1;
            correct += batch_correct;
            total += batch_total;
            log::debug!(
                "epoch {} batch {}: loss {:.4}, {}/{} correct",
                epoch,
                batches,
                loss_value,
                batch_correct,
                batch_total
            );
        }

        ensure!(batches > 0, "epoch {} produced no batches", epoch);

        let metrics = EpochMetrics {
            epoch,
            loss: (running_loss / batches as f64) as f32,
            accuracy: correct as f32 / total as f32,
        };
        println!(
            "Epoch {}, Loss: {:.4}, Accuracy: {:.4}",
            metrics.epoch, metrics.loss, metrics.accuracy
        );
        history.push(metrics);
    }

    Ok((model, history))
}

/// Build, train and discard the model for one configuration, returning its history.
pub fn run_configuration<B: AutodiffBackend>(
    run: &RunConfig,
    config: &ExperimentConfig,
    dataset: &Stl10Dataset,
    max_batches: Option<usize>,
    cache_dir: &Path,
    device: &B::Device,
) -> Result<Vec<EpochMetrics>> {
    B::seed(config.seed);

    let model = build_model::<B>(run, cache_dir, device)?;
    let mut optimizer = AdamConfig::new().init();
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut loader = Stl10Loader::<B>::new(
        dataset,
        ImageTransform::from_config(config),
        config.batch_size,
        device.clone(),
    )
    .shuffled(config.seed)
    .with_max_batches(max_batches);

    log::info!(
        "{}: {} batches of up to {} per epoch, learning rate {}",
        run.name,
        loader.num_batches(),
        config.batch_size,
        run.learning_rate
    );

    let (_model, history) = train_head(
        model,
        &mut optimizer,
        &loss_fn,
        run.learning_rate,
        &mut loader,
        config.epochs,
    )?;

    Ok(history)
}

fn correct_predictions<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    logits
        .argmax(1)
        .squeeze::<1>(1)
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}
