pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod distributed;
pub mod error;
pub mod evaluator;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod optimizer;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod trainer;

pub use checkpoint::{CheckpointManager, SaveOutcome, TrainingState};
pub use config::TrainingConfig;
pub use data::{Batch, DataLoader, Dataset, DistributedSampler, Partition};
pub use device::{DeviceRequest, ExecutionTarget};
pub use distributed::{Collective, DistributedContext};
pub use error::TrainingError;
pub use evaluator::{EvaluationSummary, Evaluator, MisclassificationReport};
pub use logging::TelemetrySink;
pub use loss::{CrossEntropyLoss, LossOutput};
pub use metrics::{AverageMeter, Summary};
pub use optimizer::{OptimizerState, Sgd, SgdConfig};
pub use progress::ProgressMeter;
pub use scheduler::{LRScheduler, SchedulerConfig, SchedulerState};
pub use session::{run, RunOutcome};
pub use trainer::{EpochSummary, Trainer};
