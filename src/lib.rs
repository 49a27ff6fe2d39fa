pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use application::{agent, bridge, catalog, session};
pub use domain::{conversation, types};
pub use infrastructure::{model, server};
