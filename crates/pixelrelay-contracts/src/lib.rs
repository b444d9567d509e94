pub mod cache;
pub mod config;
pub mod events;
pub mod job;
pub mod output;
pub mod providers;
pub mod request;
