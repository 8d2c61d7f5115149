pub mod capabilities;
pub mod dispatcher;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod presets;
pub mod queue;
pub mod recipe;
pub mod runner;
pub mod scheduler;
pub mod validation;
pub mod video;

pub use capabilities::CapabilitySet;
pub use dispatcher::{Dispatcher, InferenceRequest, MemoryModel};
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use pipeline::{JobOutcome, PipelineSequencer};
pub use queue::{JobQueue, JobRequest};
pub use recipe::Recipe;
pub use runner::BatchRunner;
