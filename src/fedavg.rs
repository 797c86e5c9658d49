//! Synchronous FedAvg baseline server: broadcast to all clients, wait for all
//! updates, repeat. No speed estimation and no groups.

use std::cell::Cell;
use std::rc::Rc;

use simcore::async_mode::UnboundedQueue;
use simcore::{cast, log_debug, log_info, Event, SimulationContext, StaticEventHandler};

use crate::client::ClientEndpoint;
use crate::config::WorkloadConfig;
use crate::events::{GlobalModel, LocalUpdate, Start};
use crate::platform::Host;

// Per-round book-keeping costs in seconds at nominal server speed.
const ROUND_SEND_COST: f64 = 0.05;
const ROUND_RECV_COST: f64 = 0.17;
const SENTINEL_SEND_COST: f64 = 0.03;

/// Counters exposed for experiment reports and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FedAvgStats {
    pub rounds: u64,
    pub sends: u64,
    pub receives: u64,
}

pub struct FedAvgServer {
    num_clients: usize,
    epochs: u64,
    dataloader_cost: f64,
    host_speed: f64,
    clients: Vec<ClientEndpoint>,
    inbox: UnboundedQueue<LocalUpdate>,
    rounds: Cell<u64>,
    sends: Cell<u64>,
    receives: Cell<u64>,
    ctx: SimulationContext,
}

impl FedAvgServer {
    pub fn new(
        config: &WorkloadConfig,
        host: &Host,
        clients: Vec<ClientEndpoint>,
        inbox: UnboundedQueue<LocalUpdate>,
        ctx: SimulationContext,
    ) -> Self {
        Self {
            num_clients: clients.len(),
            epochs: config.epochs,
            dataloader_cost: config.dataloader_cost,
            host_speed: host.speed,
            clients,
            inbox,
            rounds: Cell::new(0),
            sends: Cell::new(0),
            receives: Cell::new(0),
            ctx,
        }
    }

    pub fn stats(&self) -> FedAvgStats {
        FedAvgStats {
            rounds: self.rounds.get(),
            sends: self.sends.get(),
            receives: self.receives.get(),
        }
    }

    async fn execute(&self, flops: f64) {
        self.ctx.sleep((flops / self.host_speed).max(0.0)).await;
    }

    async fn run(self: Rc<Self>) {
        log_info!(
            self.ctx,
            "Server is running at {:.0} FLOPS. Got {} clients and {} epochs to process",
            self.host_speed,
            self.num_clients,
            self.epochs
        );

        // dataload and partitioning
        self.execute(self.dataloader_cost * self.host_speed).await;

        for round in 0..self.epochs {
            log_info!(self.ctx, "Starting epoch {} of {}", round + 1, self.epochs);
            for client in 0..self.num_clients {
                let endpoint = &self.clients[client];
                self.ctx
                    .emit(GlobalModel { local_steps: 1 }, endpoint.id, endpoint.model_delay);
                self.execute(ROUND_SEND_COST * self.host_speed).await;
                self.sends.set(self.sends.get() + 1);
                log_info!(self.ctx, "Step 1.{:04}: Server sent global model to client {}", client, client);
            }
            let mut arrived = 0;
            while arrived < self.num_clients {
                let update = self.inbox.take().await;
                self.execute(ROUND_RECV_COST * self.host_speed).await;
                arrived += 1;
                self.receives.set(self.receives.get() + 1);
                log_info!(
                    self.ctx,
                    "Step 4.{:04}: Received local model from client {}",
                    update.client_id,
                    update.client_id
                );
            }
            self.rounds.set(round + 1);
        }

        log_debug!(self.ctx, "All rounds have been completed. Requesting all clients to stop.");
        for client in 0..self.num_clients {
            let endpoint = &self.clients[client];
            self.ctx
                .emit(GlobalModel { local_steps: -1 }, endpoint.id, endpoint.sentinel_delay);
            self.execute(SENTINEL_SEND_COST * self.host_speed).await;
        }
        log_info!(self.ctx, "Exiting.");
    }
}

impl StaticEventHandler for FedAvgServer {
    fn on(self: Rc<Self>, event: Event) {
        cast!(match event.data {
            Start {} => {
                self.ctx.spawn(self.clone().run());
            }
            LocalUpdate { client_id } => {
                self.inbox.put(LocalUpdate { client_id });
            }
        })
    }
}
