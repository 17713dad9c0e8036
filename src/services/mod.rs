pub mod annotator;
pub mod archive;
pub mod detector;
pub mod job_store;
pub mod orchestrator;
pub mod realtime;
pub mod video;
