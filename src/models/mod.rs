pub mod analysis;
pub mod api;
pub mod detection;
pub mod job;
pub mod realtime;
pub mod result;
