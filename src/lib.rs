//! Ticket dispatch — chat-driven control plane for ephemeral coding workers.

pub mod broker;
pub mod bus;
pub mod channels;
pub mod config;
pub mod conversation;
pub mod error;
pub mod handler;
pub mod intent;
pub mod keys;
pub mod listener;
pub mod spawner;
pub mod tickets;
pub mod worker;
