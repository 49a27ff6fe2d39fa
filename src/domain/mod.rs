pub mod conversation;
pub mod types;
