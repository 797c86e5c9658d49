//! FedCompass: semi-asynchronous group-of-arrival scheduling.

pub mod scheduler;
pub mod server;
