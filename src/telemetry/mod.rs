pub mod pipeline;

pub use pipeline::{PipelineError, TelemetryPipeline};
