pub mod map_pipeline;
pub mod significance;
