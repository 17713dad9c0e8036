//! Obstacle Watch
//!
//! Video obstacle detection service: uploaded videos are analyzed by a bounded
//! pool of background workers into archived results (annotated video, risk
//! events, snapshots), and a shared live capture loop streams annotated frames
//! to any number of viewers.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
