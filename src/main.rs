use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use htoa::{
    Architecture, CheckpointSink, Hyperparameters, LogSink, MetricsRecorder, OptimizationState,
    PreparedDataset, Trainer,
};

/// Side length of generated images for `--synthetic` runs.
const SYNTHETIC_SIDE: usize = 64;

/// Train a residual network to regress skeletal age from hand radiographs.
#[derive(Parser, Debug)]
#[command(name = "htoa", version)]
struct Cli {
    /// Architecture index (0-3) or name (resnet18, resnet34, resnet50, resnet101)
    architecture: Architecture,

    /// Input batch size for training [default: 128]
    #[arg(long)]
    batch_size: Option<usize>,

    /// Input batch size for testing [default: 1000]
    #[arg(long)]
    test_batch_size: Option<usize>,

    /// Number of epochs to train [default: 50]
    #[arg(long)]
    epochs: Option<usize>,

    /// Learning rate [default: 1.0]
    #[arg(long)]
    lr: Option<f64>,

    /// Learning rate step gamma [default: 0.7]
    #[arg(long)]
    gamma: Option<f64>,

    /// Disables accelerator training
    #[arg(long)]
    no_cuda: bool,

    /// Random seed [default: 1]
    #[arg(long)]
    seed: Option<u64>,

    /// How many batches to wait before logging training status [default: 2]
    #[arg(long)]
    log_interval: Option<usize>,

    /// Save the trained model
    #[arg(long)]
    save_model: bool,

    /// JSON file with run parameters; flags given here take precedence
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "FULLdata/train.json")]
    train_data: PathBuf,

    #[arg(long, default_value = "FULLdata/test.json")]
    test_data: PathBuf,

    /// Train on N generated samples instead of reading datasets
    #[arg(long, value_name = "N")]
    synthetic: Option<usize>,

    /// Start from the weights in this checkpoint
    #[arg(long)]
    resume: Option<PathBuf>,

    #[arg(long)]
    metrics_path: Option<PathBuf>,

    #[arg(long)]
    checkpoint_path: Option<PathBuf>,
}

impl Cli {
    fn hyperparameters(&self) -> Result<Hyperparameters> {
        let mut hp = match &self.config {
            Some(path) => Hyperparameters::load(path)
                .with_context(|| format!("Cannot read run configuration '{}'", path.display()))?,
            None => Hyperparameters::default(),
        };

        hp.architecture = self.architecture;
        hp.batch_size = self.batch_size.unwrap_or(hp.batch_size);
        hp.test_batch_size = self.test_batch_size.unwrap_or(hp.test_batch_size);
        hp.epochs = self.epochs.unwrap_or(hp.epochs);
        hp.learning_rate = self.lr.unwrap_or(hp.learning_rate);
        hp.gamma = self.gamma.unwrap_or(hp.gamma);
        hp.seed = self.seed.unwrap_or(hp.seed);
        hp.log_interval = self.log_interval.unwrap_or(hp.log_interval);
        hp.no_cuda |= self.no_cuda;
        hp.save_model |= self.save_model;
        if let Some(path) = &self.metrics_path {
            hp.metrics_path = path.clone();
        }
        if let Some(path) = &self.checkpoint_path {
            hp.checkpoint_path = path.clone();
        }

        hp.validate()?;
        Ok(hp)
    }

    fn datasets(&self, hp: &Hyperparameters) -> Result<(PreparedDataset, PreparedDataset)> {
        if let Some(n) = self.synthetic {
            let shape = [hp.model.input_channels, SYNTHETIC_SIDE, SYNTHETIC_SIDE];
            info!("generating {n} synthetic samples of shape {shape:?}");
            return Ok((
                PreparedDataset::synthetic(n, shape, hp.seed),
                PreparedDataset::synthetic((n / 4).max(1), shape, hp.seed.wrapping_add(1)),
            ));
        }

        let load = |path: &PathBuf| {
            PreparedDataset::load(path)
                .with_context(|| format!("Cannot load dataset '{}'", path.display()))
        };
        Ok((load(&self.train_data)?, load(&self.test_data)?))
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let hp = cli.hyperparameters()?;
    let device = hp.device();
    info!("architecture {}, device {}", hp.architecture, device);

    let mut model = hp.architecture.build(hp.model, hp.seed)?;
    if let Some(path) = &cli.resume {
        CheckpointSink::load(path, &mut model)
            .with_context(|| format!("Cannot resume from '{}'", path.display()))?;
    }

    let (train, test) = cli.datasets(&hp)?;
    let train = train.into_loader(hp.batch_size, Some(hp.seed))?;
    let test = test.into_loader(hp.test_batch_size, None)?;

    let metrics = MetricsRecorder::new(&hp.metrics_path)
        .with_context(|| format!("Cannot create metrics file '{}'", hp.metrics_path.display()))?;
    let optim = OptimizationState::adam(&model, hp.learning_rate, hp.gamma);

    let mut trainer = Trainer::new(model, optim, metrics, hp.epochs, hp.log_interval).with_sink(LogSink);
    if hp.save_model {
        let checkpoint = CheckpointSink::new(&hp.checkpoint_path);
        checkpoint.save_config(&hp)?;
        trainer = trainer.with_checkpoint(checkpoint);
    }

    let summary = trainer.run(&train, &test)?;
    if let Some(last) = summary.last() {
        info!(
            "finished after {} epochs: train loss {:.4}, test loss {:.4}, lr {:.6}",
            last.epoch, last.train_loss, last.test_loss, summary.final_learning_rate
        );
    }
    info!("metrics written to {}", hp.metrics_path.display());
    Ok(())
}
