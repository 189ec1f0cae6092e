pub mod config;
pub mod email;
pub mod error;
pub mod handler;
pub mod job;
pub mod mailer;
pub mod server;
pub mod service;
pub mod store;
pub mod validation;
pub mod worker;
