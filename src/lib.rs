pub mod types;
pub mod geo;
pub mod gps_filter;
pub mod stats;
pub mod payload;
pub mod sample_queue;
pub mod traits;
pub mod counter;
pub mod lorawan;
pub mod uplink;
pub mod controller;
pub mod status;
pub mod config;
