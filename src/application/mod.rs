pub mod agent;
pub mod bridge;
pub mod catalog;
pub mod session;
