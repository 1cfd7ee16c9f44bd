pub mod decoder;
pub mod driver;
pub mod managed;
pub mod models;
pub mod monitor;
pub mod schedule;
pub mod settings;
