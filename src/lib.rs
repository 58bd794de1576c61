pub mod activation;
pub mod block;
pub mod checkpoint;
pub mod data;
pub mod error;
pub mod hyperparameters;
pub mod layers;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod registry;
pub mod scheduler;
pub mod trainer;

pub use activation::ActivationType;
pub use block::BlockKind;
pub use checkpoint::{CheckpointHeader, CheckpointSink};
pub use data::{Batch, DataLoader, PreparedDataset, Sample};
pub use error::{Error, Result};
pub use hyperparameters::{Device, Hyperparameters};
pub use layers::Layer;
pub use loss::Loss;
pub use metrics::{EpochMetrics, LogSink, MetricsRecorder, MetricsSink};
pub use model::{ModelConfig, ResNet};
pub use optimizer::{Adam, OptimizationState, Optimizer};
pub use registry::{Architecture, ARCHITECTURES};
pub use scheduler::StepLR;
pub use trainer::{evaluate, train_epoch, RunSummary, Trainer};
