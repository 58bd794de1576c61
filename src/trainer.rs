use log::info;

use crate::checkpoint::CheckpointSink;
use crate::data::DataLoader;
use crate::loss::Loss;
use crate::metrics::{EpochMetrics, MetricsRecorder, MetricsSink};
use crate::model::ResNet;
use crate::optimizer::{OptimizationState, Optimizer};
use crate::{Error, Result};

/// One optimization pass over `loader`.
///
/// Returns the mean absolute error over every sample seen, computed as the
/// summed error divided by the sample count once the pass is over.
pub fn train_epoch<O: Optimizer>(
    model: &mut ResNet,
    optim: &mut OptimizationState<O>,
    loader: &DataLoader,
    epoch: usize,
    log_interval: usize,
) -> Result<f64> {
    if loader.num_samples() == 0 {
        return Err(Error::EmptyDataset("training"));
    }
    let loss_fn = Loss::MeanAbsoluteError;
    let total = loader.num_samples();
    let log_interval = log_interval.max(1);
    let mut sum_abs_error = 0.0;
    let mut seen = 0;

    for (batch_idx, batch) in loader.iter().enumerate() {
        batch.check()?;
        let predictions = model.forward(&batch.images)?;
        let loss = loss_fn.calculate(&predictions, &batch.targets);
        if !loss.is_finite() {
            return Err(Error::NonFiniteLoss { epoch, batch: batch_idx, loss });
        }
        sum_abs_error += loss_fn.sum(&predictions, &batch.targets);

        optim.zero_grad(model);
        model.backward(&loss_fn.gradient(&predictions, &batch.targets));
        optim.step(model)?;

        seen += batch.len();
        if batch_idx % log_interval == 0 {
            info!(
                "Train Epoch: {} [{}/{} ({:.0}%)]\tLoss: {:.6}",
                epoch,
                seen,
                total,
                100.0 * seen as f64 / total as f64,
                loss
            );
        }
    }

    Ok(sum_abs_error / total as f64)
}

/// Scores the model on `loader` without touching it.
pub fn evaluate(model: &ResNet, loader: &DataLoader, epoch: usize) -> Result<f64> {
    if loader.num_samples() == 0 {
        return Err(Error::EmptyDataset("test"));
    }
    let loss_fn = Loss::MeanAbsoluteError;
    let mut sum_abs_error = 0.0;

    for (batch_idx, batch) in loader.iter().enumerate() {
        batch.check()?;
        let predictions = model.infer(&batch.images)?;
        let batch_error = loss_fn.sum(&predictions, &batch.targets);
        if !batch_error.is_finite() {
            return Err(Error::NonFiniteLoss { epoch, batch: batch_idx, loss: batch_error });
        }
        sum_abs_error += batch_error;
    }

    let test_loss = sum_abs_error / loader.num_samples() as f64;
    info!("Test set: Average loss: {:.4}, samples: {}", test_loss, loader.num_samples());
    Ok(test_loss)
}

/// What a finished run hands back.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub epochs: Vec<EpochMetrics>,
    /// Learning rate the schedule had reached after the last epoch.
    pub final_learning_rate: f64,
    pub parameter_count: usize,
}

impl RunSummary {
    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }
}

/// Drives epochs over a model and its optimization state, then persists
/// the results.
pub struct Trainer<O: Optimizer = crate::optimizer::Adam> {
    pub model: ResNet,
    pub optim: OptimizationState<O>,
    pub epochs: usize,
    pub log_interval: usize,
    metrics: MetricsRecorder,
    sink: Option<Box<dyn MetricsSink>>,
    checkpoint: Option<CheckpointSink>,
}

impl<O: Optimizer> Trainer<O> {
    pub fn new(
        model: ResNet,
        optim: OptimizationState<O>,
        metrics: MetricsRecorder,
        epochs: usize,
        log_interval: usize,
    ) -> Self {
        Trainer {
            model,
            optim,
            epochs,
            log_interval,
            metrics,
            sink: None,
            checkpoint: None,
        }
    }

    pub fn with_sink(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Saves the model to `checkpoint` once the last epoch is done.
    pub fn with_checkpoint(mut self, checkpoint: CheckpointSink) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    pub fn metrics(&self) -> &MetricsRecorder {
        &self.metrics
    }

    pub fn run(&mut self, train: &DataLoader, test: &DataLoader) -> Result<RunSummary> {
        info!(
            "training {} parameters for {} epochs on {} samples, evaluating on {}",
            self.model.parameter_count(),
            self.epochs,
            train.num_samples(),
            test.num_samples()
        );

        for epoch in 1..=self.epochs {
            let train_loss = train_epoch(&mut self.model, &mut self.optim, train, epoch, self.log_interval)?;
            let test_loss = evaluate(&self.model, test, epoch)?;
            self.metrics.record(epoch, train_loss, test_loss)?;
            if let Some(sink) = self.sink.as_mut() {
                sink.record(epoch, "train", train_loss);
                sink.record(epoch, "test", test_loss);
            }
            self.optim.advance_schedule();
        }

        self.metrics.flush()?;
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.save(&self.model)?;
        }

        Ok(RunSummary {
            epochs: self.metrics.rows().to_vec(),
            final_learning_rate: self.optim.learning_rate(),
            parameter_count: self.model.parameter_count(),
        })
    }
}
