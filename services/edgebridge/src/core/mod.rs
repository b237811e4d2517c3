//! Core bridge components

pub mod bootstrap;
pub mod command;
pub mod config;
pub mod executor;
pub mod health;
pub mod health_check;
pub mod poller;
pub mod protocols;
pub mod queue;
pub mod transport;
