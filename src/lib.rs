//! Identity verification pipeline
//!
//! Two queue-coupled stage workers: a document-validity stage that either
//! forwards a job to the biometric stage or rejects it, and a biometric
//! face-match stage that always answers on the response queue. Each worker
//! consumes one message at a time and survives broker outages by
//! reconnecting on a fixed interval.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;
