//! Simulation assembly: places the server and client actors on the platform
//! hosts, wires the mailboxes and runs the simulation to completion.

use std::rc::Rc;

use sugars::rc;

use simcore::Simulation;

use crate::client::{Client, ClientEndpoint, ClientParams};
use crate::compass::server::{CompassServer, CompassStats};
use crate::config::{client_multipliers, Algorithm, WorkloadConfig};
use crate::events::Start;
use crate::fedavg::{FedAvgServer, FedAvgStats};
use crate::platform::Platform;

/// Host index for a client id: the server occupies one slot on the first
/// node, the remaining clients fill the nodes in order.
fn client_host(client: usize, clients_per_node: usize) -> usize {
    if client < clients_per_node - 1 {
        0
    } else {
        1 + (client - (clients_per_node - 1)) / clients_per_node
    }
}

/// A fully assembled federated-learning simulation.
///
/// Encapsulates the simulation kernel and the actors; exposes the counters
/// needed by experiment reports and tests.
pub struct FlSimulation {
    sim: Simulation,
    compass: Option<Rc<CompassServer>>,
    fedavg: Option<Rc<FedAvgServer>>,
    clients: Vec<Rc<Client>>,
}

impl FlSimulation {
    pub fn new(seed: u64, platform: Platform, config: WorkloadConfig, algorithm: Algorithm) -> Self {
        let num_clients = config.num_clients();
        assert!(
            platform.host_count() >= config.num_nodes,
            "Platform has {} hosts but the workload needs {}",
            platform.host_count(),
            config.num_nodes
        );
        let effects = client_multipliers(&config.stragglers, num_clients);

        // payload sizes of the model exchange, per algorithm
        let (down_bytes, up_bytes) = match algorithm {
            Algorithm::FedCompass => {
                let size = config
                    .model_size
                    .unwrap_or_else(|| panic!("Config key \"model_size\" is required for FedCompass"));
                (size, size)
            }
            Algorithm::FedAvg => {
                let comm = config
                    .comm_cost
                    .unwrap_or_else(|| panic!("Config key \"comm_cost\" is required for FedAvg"));
                (comm * 8.0, comm * 32.0)
            }
        };

        let mut sim = Simulation::new(seed);
        let admin = sim.create_context("admin");

        // the server lives on the first host
        let server_ctx = sim.create_context("server");
        let server_id = server_ctx.id();

        let mut endpoints = Vec::with_capacity(num_clients);
        let mut clients = Vec::with_capacity(num_clients);
        let mut client_ids = Vec::with_capacity(num_clients);
        for client in 0..num_clients {
            let host_idx = client_host(client, config.clients_per_node);
            let host = platform.host(host_idx);
            let name = format!("client-{}", client);
            let ctx = sim.create_context(&name);
            let inbox = sim.create_queue(format!("{}:inbox", name));
            let multiplier = effects.get(&client).copied().unwrap_or(1.0);
            let params = ClientParams {
                id: client,
                host_name: host.name.clone(),
                host_speed: host.speed,
                dataloader_cost: config.dataloader_cost * multiplier,
                training_cost: config.training_cost * multiplier,
                model_bytes: down_bytes,
                upload_delay: platform.transfer_time(host_idx, 0, up_bytes),
                control: config.control,
            };
            let actor = rc!(Client::new(params, server_id, inbox, ctx));
            let id = sim.add_static_handler(&name, actor.clone());
            endpoints.push(ClientEndpoint {
                id,
                model_delay: platform.transfer_time(0, host_idx, down_bytes),
                sentinel_delay: platform.transfer_time(0, host_idx, 0.0),
            });
            clients.push(actor);
            client_ids.push(id);
        }

        let server_host = platform.host(0);
        let (compass, fedavg) = match algorithm {
            Algorithm::FedCompass => {
                let inbox = sim.create_queue("server:inbox");
                let server = rc!(CompassServer::new(&config, server_host, endpoints, inbox, server_ctx));
                sim.add_static_handler("server", server.clone());
                (Some(server), None)
            }
            Algorithm::FedAvg => {
                let inbox = sim.create_queue("server:inbox");
                let server = rc!(FedAvgServer::new(&config, server_host, endpoints, inbox, server_ctx));
                sim.add_static_handler("server", server.clone());
                (None, Some(server))
            }
        };

        admin.emit_now(Start {}, server_id);
        for &id in &client_ids {
            admin.emit_now(Start {}, id);
        }

        Self {
            sim,
            compass,
            fedavg,
            clients,
        }
    }

    /// Runs the simulation until all actors have terminated.
    pub fn run(&mut self) {
        self.sim.step_until_no_events();
    }

    /// Current virtual time.
    pub fn time(&self) -> f64 {
        self.sim.time()
    }

    pub fn event_count(&self) -> u64 {
        self.sim.event_count()
    }

    pub fn compass_stats(&self) -> Option<CompassStats> {
        self.compass.as_ref().map(|server| server.stats())
    }

    pub fn fedavg_stats(&self) -> Option<FedAvgStats> {
        self.fedavg.as_ref().map(|server| server.stats())
    }

    /// Clients to which the server has sent a model not yet received back.
    pub fn pending_clients(&self) -> usize {
        self.compass.as_ref().map(|server| server.pending_count()).unwrap_or(0)
    }

    /// Number of clients that have received the termination sentinel.
    pub fn finished_clients(&self) -> usize {
        self.clients.iter().filter(|client| client.is_finished()).count()
    }

    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_placement() {
        // clients_per_node = 3: two clients share the server node, then
        // three per node
        assert_eq!(client_host(0, 3), 0);
        assert_eq!(client_host(1, 3), 0);
        assert_eq!(client_host(2, 3), 1);
        assert_eq!(client_host(4, 3), 1);
        assert_eq!(client_host(5, 3), 2);
        // clients_per_node = 1: the server node hosts no clients
        assert_eq!(client_host(0, 1), 1);
        assert_eq!(client_host(1, 1), 2);
    }
}
