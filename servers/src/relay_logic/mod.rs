pub mod config;
pub mod control;
pub mod logger;
pub mod model;
pub mod state;
