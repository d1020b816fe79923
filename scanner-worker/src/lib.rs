pub mod config;
pub mod error;
pub mod forward;
pub mod handlers;
pub mod llm;
pub mod pipeline;
pub mod providers;
pub mod reconstruct;
pub mod source;
pub mod test_utils;
pub mod verify;
