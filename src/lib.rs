pub mod app;
pub mod backend;
pub mod config;
pub mod contacts;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod event;
pub mod history;
pub mod signaling;
pub mod timer;
