pub mod controller;
pub mod stream;

pub use controller::{
    run_all, ControllerOptions, IngestionController, PipelineDeps, PipelineState, RunSummary,
};
pub use stream::{FetchMode, StreamKind, Window};
