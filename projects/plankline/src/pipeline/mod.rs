// Video segmentation pipeline: stages and the workers that run them

pub mod crop;
pub mod detection;
pub mod flatfield;
pub mod measure;
pub mod orchestrator;
pub mod reader;
pub mod segment_worker;
pub mod suppression;
pub mod types;
