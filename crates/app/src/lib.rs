//! Control plane behind the `lk` command: stored projects, cloud
//! authentication, agent deployment and thin clients for the room, SIP,
//! phone number, replay, ingress and egress services.

pub mod agent;
pub mod auth;
pub mod cancel;
pub mod commands;
pub mod config;
pub mod error;
pub mod fanout;
pub mod output;
pub mod prompt;
pub mod resolver;
pub mod retry;
pub mod services;
pub mod settings;
pub mod templates;
pub mod token;
