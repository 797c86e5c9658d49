//! Discrete-event simulation of federated learning training to study the
//! impact of client heterogeneity and scheduling policy on time-to-convergence.
//!
//! Two server-side schedulers are provided: the FedCompass adaptive
//! group-of-arrival scheduler, which estimates client speeds online and
//! aggregates per group on arrival or deadline, and the synchronous FedAvg
//! baseline. Clients and servers are cooperative actors over the
//! [simcore](https://crates.io/crates/simcore) virtual-time kernel; the
//! simulation emits a timestamped event trace through the logger.

pub mod client;
pub mod compass;
pub mod config;
pub mod events;
pub mod fedavg;
pub mod platform;
pub mod runner;
