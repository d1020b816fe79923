pub mod address;
pub mod candidate;
pub mod extract;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod store;
pub mod window;
