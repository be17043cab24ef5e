pub mod connections;
pub mod models;
pub mod registry;
pub mod sweeper;
