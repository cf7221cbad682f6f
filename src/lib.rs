//! flowtap
//!
//! Passive tap that reassembles TCP (and TLS plaintext) traffic, dissects
//! HTTP, AMQP and Kafka, and emits matched request/response pairs.

pub mod api;
pub mod config;
pub mod extensions;
pub mod network;
pub mod tap;
pub mod tlstapper;
