pub mod api;
pub mod config;
pub mod lifecycle;
pub mod plans;
pub mod shared;
pub mod store;
