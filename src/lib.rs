// Configuration (TOML file + env overrides)
pub mod config;

// SQLite helpers shared by the stores
pub mod storage;

// Entity state persistence and structural diff
pub mod state;

// Noise baselines and significance classification
pub mod noise;

// Two-stage change detection
pub mod detector;

// Debounced change batching
pub mod batcher;

// Detector → batcher glue
pub mod pipeline;
