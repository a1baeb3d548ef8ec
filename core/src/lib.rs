// Scheduling core shared by the scheduler binary and its tests

pub mod config;
pub mod db;
pub mod errors;
pub mod events;
pub mod lock;
pub mod models;
pub mod schedule;
pub mod scheduler;
pub mod telemetry;
