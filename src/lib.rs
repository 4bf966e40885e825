pub mod config;
pub mod esc;
pub mod input;
pub mod messages;
pub mod runtime;
