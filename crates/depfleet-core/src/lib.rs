pub mod adapters;
pub mod config;
pub mod execution;
pub mod models;
pub mod orchestration;
pub mod persistence;
pub mod reconcile;
pub mod registry;
pub mod sqlite;
