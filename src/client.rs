//! Client actor: receives the global model, simulates local training and
//! posts the update back to the server inbox.

use std::cell::Cell;
use std::rc::Rc;

use rand_distr::Normal;

use simcore::async_mode::UnboundedQueue;
use simcore::{cast, log_debug, log_info, Event, Id, SimulationContext, StaticEventHandler};

use crate::config::SpeedControl;
use crate::events::{GlobalModel, LocalUpdate, Start};

/// Standard deviation of the compute-speed jitter draws.
const JITTER_STD_DEV: f64 = 0.12;

/// How the server reaches one client: destination component and transfer
/// times over the platform links.
pub struct ClientEndpoint {
    pub id: Id,
    /// Transfer time of a model payload.
    pub model_delay: f64,
    /// Transfer time of the zero-payload termination sentinel.
    pub sentinel_delay: f64,
}

pub struct ClientParams {
    pub id: usize,
    pub host_name: String,
    /// Nominal host speed in FLOPS.
    pub host_speed: f64,
    /// Dataload time in seconds, already scaled by the straggler multiplier.
    pub dataloader_cost: f64,
    /// Per-local-step training time in seconds, already scaled by the
    /// straggler multiplier.
    pub training_cost: f64,
    /// Model payload size reported in the trace.
    pub model_bytes: f64,
    /// Transfer time of a local update to the server.
    pub upload_delay: f64,
    pub control: SpeedControl,
}

pub struct Client {
    params: ClientParams,
    server_id: Id,
    jitter: Normal<f64>,
    inbox: UnboundedQueue<GlobalModel>,
    finished: Cell<bool>,
    ctx: SimulationContext,
}

impl Client {
    pub fn new(
        params: ClientParams,
        server_id: Id,
        inbox: UnboundedQueue<GlobalModel>,
        ctx: SimulationContext,
    ) -> Self {
        Self {
            params,
            server_id,
            jitter: Normal::new(0.0, JITTER_STD_DEV).unwrap(),
            inbox,
            finished: Cell::new(false),
            ctx,
        }
    }

    /// Whether the termination sentinel has been received.
    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    /// Time to execute `flops` on this client's host. The jitter draws may
    /// produce zero or negative amounts, which complete instantly.
    fn exec_time(&self, flops: f64) -> f64 {
        (flops / self.params.host_speed).max(0.0)
    }

    async fn run(self: Rc<Self>) {
        let p = &self.params;
        let mut speed = p.host_speed;
        if p.control == SpeedControl::PersistentSlowdown {
            speed *= self.ctx.sample_from_distribution(&self.jitter);
        }
        log_info!(
            self.ctx,
            "Running on host {}. Host speed is {:.0} FLOPS",
            p.host_name,
            speed
        );

        // dataload and partitioning
        self.ctx.sleep(self.exec_time(p.dataloader_cost * speed)).await;

        loop {
            let model = self.inbox.take().await;
            if model.local_steps < 0 {
                log_info!(self.ctx, "Client has finished all epochs. Now terminating.");
                self.finished.set(true);
                break;
            }
            log_info!(
                self.ctx,
                "Step 2.{:04}: Received new global model from server ({:.0} bytes) with {} step size",
                p.id,
                p.model_bytes,
                model.local_steps
            );
            let mut training = p.training_cost * model.local_steps as f64 * speed;
            if p.control != SpeedControl::Deterministic {
                training *= self.ctx.sample_from_distribution(&self.jitter);
            }
            self.ctx.sleep(self.exec_time(training)).await;
            log_debug!(
                self.ctx,
                "Finished local training with {} step size, sending local model to the server",
                model.local_steps
            );
            self.ctx
                .emit(LocalUpdate { client_id: p.id }, self.server_id, p.upload_delay);
            log_info!(
                self.ctx,
                "Step 3.{:04}: Client {} sent local model to the server",
                p.id,
                p.id
            );
        }
    }
}

impl StaticEventHandler for Client {
    fn on(self: Rc<Self>, event: Event) {
        cast!(match event.data {
            Start {} => {
                self.ctx.spawn(self.clone().run());
            }
            GlobalModel { local_steps } => {
                // mailbox semantics: models queue up until the client is ready
                self.inbox.put(GlobalModel { local_steps });
            }
        })
    }
}
