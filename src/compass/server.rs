//! FedCompass server actor: receives local updates from the shared inbox one
//! at a time and drives the scheduler through speed estimation, group
//! assignment, deadline timers and semi-asynchronous group aggregation.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;

use simcore::async_mode::UnboundedQueue;
use simcore::{cast, log_debug, log_info, Event, SimulationContext, StaticEventHandler};

use crate::client::ClientEndpoint;
use crate::compass::scheduler::{Assignment, SchedulerState};
use crate::config::WorkloadConfig;
use crate::events::{GlobalModel, LocalUpdate, Start};
use crate::platform::Host;

// Book-keeping costs in seconds at nominal server speed, charged as
// cost * host_speed FLOPS.
const MODEL_SEND_COST: f64 = 0.047;
const MODEL_RECV_COST: f64 = 0.15;
const SINGLE_UPDATE_COST: f64 = 0.03;
const GRADIENT_BUFFER_COST: f64 = 0.01;
const GROUP_UPDATE_COST: f64 = 0.01;
const SENTINEL_SEND_COST: f64 = 0.03;

/// Aggregated-model book-keeping on the server side.
#[derive(Debug, Default)]
struct ModelState {
    global_step: u64,
    general_buffer_size: u64,
    /// Per-group buffered-gradient counters; reset on the first new arrival.
    group_gradients: BTreeMap<usize, u32>,
}

/// Counters exposed for experiment reports and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompassStats {
    /// Arrivals processed by the scheduler.
    pub iterations: u64,
    pub global_step: u64,
    pub groups_created: u64,
    /// Group aggregations triggered by a deadline timer.
    pub deadline_aggregations: u64,
    /// Arrivals past their group deadline, reclassified as single updates.
    pub late_arrivals: u64,
    /// Updates received during the termination drain.
    pub drained_updates: u64,
}

pub struct CompassServer {
    num_clients: usize,
    epochs: u64,
    max_local_steps: i64,
    model_size: f64,
    dataloader_cost: f64,
    validation_cost: f64,
    validation_flag: bool,
    host_speed: f64,
    clients: Vec<ClientEndpoint>,
    inbox: UnboundedQueue<LocalUpdate>,
    pending: RefCell<HashSet<usize>>,
    state: RefCell<SchedulerState>,
    model: RefCell<ModelState>,
    start_time: Cell<f64>,
    stats: RefCell<CompassStats>,
    ctx: SimulationContext,
}

impl CompassServer {
    pub fn new(
        config: &WorkloadConfig,
        host: &Host,
        clients: Vec<ClientEndpoint>,
        inbox: UnboundedQueue<LocalUpdate>,
        ctx: SimulationContext,
    ) -> Self {
        let max_local_steps = config
            .max_local_steps
            .unwrap_or_else(|| panic!("Config key \"max_local_steps\" is required for FedCompass"));
        let model_size = config
            .model_size
            .unwrap_or_else(|| panic!("Config key \"model_size\" is required for FedCompass"));
        let num_clients = clients.len();
        Self {
            num_clients,
            epochs: config.epochs,
            max_local_steps,
            model_size,
            dataloader_cost: config.dataloader_cost,
            validation_cost: config.validation_cost,
            validation_flag: config.validation_flag,
            host_speed: host.speed,
            clients,
            inbox,
            pending: RefCell::new(HashSet::new()),
            state: RefCell::new(SchedulerState::new(
                max_local_steps,
                num_clients,
                config.q_ratio,
                config.lambda,
            )),
            model: RefCell::new(ModelState::default()),
            start_time: Cell::new(0.0),
            stats: RefCell::new(CompassStats::default()),
            ctx,
        }
    }

    pub fn stats(&self) -> CompassStats {
        let mut stats = *self.stats.borrow();
        stats.iterations = self.state.borrow().iter;
        stats.global_step = self.model.borrow().global_step;
        stats
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Virtual time relative to the scheduler start.
    fn local_time(&self) -> f64 {
        self.ctx.time() - self.start_time.get()
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

        // bootstrap broadcast: every client starts with the full step budget
        for client in 0..self.num_clients {
            self.send_global_model(client, self.max_local_steps).await;
        }
        self.start_time.set(self.ctx.time());

        let mut processed = 0u64;
        loop {
            log_debug!(self.ctx, "Starting epoch {} of {}", processed + 1, self.epochs);
            self.clone().process_arrival().await;
            processed += 1;
            if self.validation_flag || processed == self.epochs {
                self.execute(self.validation_cost * self.host_speed).await;
                if processed == self.epochs {
                    break;
                }
            }
        }

        log_info!(
            self.ctx,
            "All rounds have been completed. Requesting all clients to stop. Current pending clients: {}",
            self.pending.borrow().len()
        );
        while !self.pending.borrow().is_empty() {
            let update = self.inbox.take().await;
            self.execute(MODEL_RECV_COST * self.host_speed).await;
            self.pending.borrow_mut().remove(&update.client_id);
            self.stats.borrow_mut().drained_updates += 1;
            log_info!(
                self.ctx,
                "Step 5.{:04}: Received client {} in cleanup",
                update.client_id,
                update.client_id
            );
        }
        for client in 0..self.num_clients {
            let endpoint = &self.clients[client];
            self.ctx
                .emit(GlobalModel { local_steps: -1 }, endpoint.id, endpoint.sentinel_delay);
            self.execute(SENTINEL_SEND_COST * self.host_speed).await;
        }
        log_info!(self.ctx, "Exiting.");
    }

    /// One scheduler cycle: dequeue an arrival, refresh the speed estimate and
    /// dispatch it down the single-update or group-update path.
    async fn process_arrival(self: Rc<Self>) {
        let update = self.inbox.take().await;
        self.execute(MODEL_RECV_COST * self.host_speed).await;
        let client = update.client_id;
        self.pending.borrow_mut().remove(&client);
        log_info!(
            self.ctx,
            "Step 4.{:04}: Received local model from Client {}. Current pending clients: {}",
            client,
            client,
            self.pending.borrow().len()
        );
        let now = self.local_time();
        let goa = {
            let mut state = self.state.borrow_mut();
            state.record_info(client, now);
            state.iter += 1;
            state.client(client).goa
        };
        match goa {
            None => self.clone().single_update(client, false).await,
            Some(group) => self.clone().group_update(client, group).await,
        }
    }

    /// Aggregates a lone arrival, either buffered (late reclassification) or
    /// as an immediate model update, then re-dispatches the client.
    async fn single_update(self: Rc<Self>, client: usize, buffered: bool) {
        if buffered {
            self.execute(GRADIENT_BUFFER_COST * self.host_speed).await;
            self.model.borrow_mut().general_buffer_size += 1;
        } else {
            self.execute(SINGLE_UPDATE_COST * self.host_speed).await;
            self.model.borrow_mut().global_step += 1;
        }
        let global_step = self.model.borrow().global_step;
        self.state.borrow_mut().set_step(client, global_step);
        self.clone().assign_group(client);
        let below_target = self.state.borrow().iter < self.epochs;
        if below_target {
            self.send_model(client).await;
        } else {
            self.update_all();
        }
    }

    async fn group_update(self: Rc<Self>, client: usize, group: usize) {
        let now = self.local_time();
        let latest = self.state.borrow().group(group).latest_arrival_time;
        if now >= latest {
            // the deadline has fired: fall back to the single-update path
            let dropped = self.state.borrow_mut().remove_late(client, group);
            if dropped {
                log_info!(
                    self.ctx,
                    "Client {} arrived (late) at group {} at time {:.3}",
                    client,
                    group,
                    now
                );
            }
            self.stats.borrow_mut().late_arrivals += 1;
            self.single_update(client, true).await;
        } else {
            self.state.borrow_mut().mark_arrived(client, group);
            log_info!(self.ctx, "Client {} arrived at group {} at time {:.3}", client, group, now);
            self.buffer_gradient(group).await;
            // re-check: the group may have been aggregated by its deadline
            // timer while the buffering cost was charged
            let ready = {
                let state = self.state.borrow();
                state.group_exists(group) && state.group(group).clients.is_empty()
            };
            if ready {
                self.group_aggregation(group).await;
            }
        }
    }

    fn assign_group(self: Rc<Self>, client: usize) {
        let now = self.local_time();
        let assignment = self.state.borrow_mut().assign_group(client, now);
        match assignment {
            Assignment::Joined { group, local_steps } => {
                log_info!(
                    self.ctx,
                    "Client {} - Join GOA {} - Local steps {} - At time {:.3}",
                    client,
                    group,
                    local_steps,
                    now
                );
            }
            Assignment::Created {
                group,
                local_steps,
                expected_arrival_time,
                deadline_delay,
            } => {
                log_info!(
                    self.ctx,
                    "Group {} created at {:.3} with expected arrival time {:.3}",
                    group,
                    now,
                    expected_arrival_time
                );
                log_info!(self.ctx, "Client {} joined group {} at time {:.3}", client, group, now);
                log_debug!(
                    self.ctx,
                    "Client {} - Create GOA {} - Local steps {} - At time {:.3}",
                    client,
                    group,
                    local_steps,
                    now
                );
                self.stats.borrow_mut().groups_created += 1;
                self.ctx.spawn(self.clone().group_deadline(group, deadline_delay));
            }
        }
    }

    /// Deadline timer task, armed once per created group.
    async fn group_deadline(self: Rc<Self>, group: usize, delay: f64) {
        self.ctx.sleep(delay).await;
        if self.state.borrow().group_exists(group) {
            log_debug!(
                self.ctx,
                "Deadline reached for group {} at time {:.3}",
                group,
                self.local_time()
            );
            self.stats.borrow_mut().deadline_aggregations += 1;
        }
        self.group_aggregation(group).await;
    }

    /// Aggregates the group's buffered gradients and re-dispatches its arrived
    /// clients, fastest first. A no-op if the group has already been
    /// aggregated and drained.
    async fn group_aggregation(self: Rc<Self>, group: usize) {
        if !self.state.borrow().group_exists(group) {
            return;
        }
        self.update_group_model(group).await;
        // the group may have been dissolved while the update cost was charged
        if !self.state.borrow().group_exists(group) {
            return;
        }
        let global_step = self.model.borrow().global_step;
        let roster = self.state.borrow_mut().aggregation_roster(group, global_step);
        self.state.borrow_mut().reset_group_times(group);
        for &client in &roster {
            self.clone().assign_group(client);
        }
        if self.state.borrow_mut().drop_group_if_idle(group) {
            log_info!(self.ctx, "Group {} is deleted at time {:.3}", group, self.local_time());
        }
        let below_target = self.state.borrow().iter < self.epochs;
        if below_target {
            for &client in &roster {
                self.send_model(client).await;
            }
        } else {
            self.update_all();
        }
    }

    async fn buffer_gradient(&self, group: usize) {
        {
            let mut model = self.model.borrow_mut();
            if let Some(counter) = model.group_gradients.get_mut(&group) {
                *counter = 0;
            }
        }
        self.execute(GRADIENT_BUFFER_COST * self.host_speed).await;
        *self.model.borrow_mut().group_gradients.entry(group).or_insert(0) += 1;
    }

    async fn update_group_model(&self, group: usize) {
        self.execute(GROUP_UPDATE_COST * self.host_speed).await;
        let mut model = self.model.borrow_mut();
        model.global_step += 1;
        model.general_buffer_size = 0;
        model.group_gradients.remove(&group);
    }

    fn update_all(&self) {
        self.model.borrow_mut().global_step += 1;
    }

    async fn send_model(&self, client: usize) {
        let (local_steps, total_steps) = self.state.borrow_mut().prepare_send(client);
        log_debug!(self.ctx, "Total number of steps for client {} is {}", client, total_steps);
        self.send_global_model(client, local_steps).await;
    }

    async fn send_global_model(&self, client: usize, local_steps: i64) {
        assert!(
            local_steps >= 1,
            "Dispatched step count for client {} must be at least 1 (got {})",
            client,
            local_steps
        );
        log_debug!(
            self.ctx,
            "New global model generated, now sending it to Client {} with {} step size ({:.0} bytes)",
            client,
            local_steps,
            self.model_size
        );
        let endpoint = &self.clients[client];
        self.ctx
            .emit(GlobalModel { local_steps }, endpoint.id, endpoint.model_delay);
        self.execute(MODEL_SEND_COST * self.host_speed).await;
        self.pending.borrow_mut().insert(client);
        log_info!(
            self.ctx,
            "Step 1.{:04}: New global model sent, starting next epoch. Current pending clients: {}",
            client,
            self.pending.borrow().len()
        );
    }
}

impl StaticEventHandler for CompassServer {
    fn on(self: Rc<Self>, event: Event) {
        cast!(match event.data {
            Start {} => {
                self.ctx.spawn(self.clone().run());
            }
            LocalUpdate { client_id } => {
                // shared inbound mailbox: arrivals are consumed one at a time
                self.inbox.put(LocalUpdate { client_id });
            }
        })
    }
}
