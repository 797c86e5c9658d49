//! Events exchanged between the server and client actors.

use serde::Serialize;

/// Kicks off an actor's main loop.
#[derive(Clone, Serialize)]
pub struct Start {}

/// Server -> client: a new global model with the local-step budget for the
/// round. A negative `local_steps` is the termination sentinel.
#[derive(Clone, Serialize)]
pub struct GlobalModel {
    pub local_steps: i64,
}

/// Client -> server: a trained local update, posted to the shared server
/// inbox. The payload transfer time is modeled by the emit delay.
#[derive(Clone, Serialize)]
pub struct LocalUpdate {
    pub client_id: usize,
}
