pub mod calibration;
pub mod calibration_fit;
pub mod config;
pub mod engine;
pub mod ensemble;
pub mod league_params;
pub mod markets;
pub mod odds;
pub mod pipeline;
pub mod rules;
pub mod scoreline;
pub mod simulation;
pub mod snapshot;
