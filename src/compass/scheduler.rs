//! FedCompass scheduler state: online per-client speed estimates and the
//! group-of-arrival registry.
//!
//! All times are virtual seconds relative to the scheduler start. The state
//! itself never touches the simulation clock; the server actor passes the
//! current time into every call, which keeps the assignment logic directly
//! testable.

use std::collections::BTreeMap;

/// Weight of the most recent observation in the speed estimate.
pub const SPEED_MOMENTUM: f64 = 0.9;

/// Book-keeping for one client, created lazily on its first arrival.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Estimated seconds per local step.
    pub speed: f64,
    /// Global step at which this client was last synchronized.
    pub step: u64,
    /// Local steps assigned for the in-flight round (-1 when not dispatched).
    pub local_steps: i64,
    /// Cumulative local steps issued to this client.
    pub total_steps: i64,
    /// Group the client was assigned to on dispatch.
    pub goa: Option<usize>,
    /// Virtual time of the current dispatch.
    pub start_time: f64,
}

/// A cohort of clients expected to finish their rounds nearly simultaneously.
#[derive(Debug, Default)]
pub struct GroupOfArrival {
    /// Assigned clients that have not arrived yet.
    pub clients: Vec<usize>,
    /// Clients that arrived before the group deadline.
    pub arrived_clients: Vec<usize>,
    pub expected_arrival_time: f64,
    pub latest_arrival_time: f64,
}

/// Outcome of a group assignment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Assignment {
    Joined {
        group: usize,
        local_steps: i64,
    },
    /// A new group; the caller must arm its deadline timer.
    Created {
        group: usize,
        local_steps: i64,
        expected_arrival_time: f64,
        deadline_delay: f64,
    },
}

pub struct SchedulerState {
    /// Number of processed arrivals.
    pub iter: u64,
    group_counter: usize,
    max_local_steps: i64,
    min_local_steps: i64,
    max_local_steps_bound: i64,
    speed_momentum: f64,
    latest_time_factor: f64,
    clients: Vec<Option<ClientInfo>>,
    groups: BTreeMap<usize, GroupOfArrival>,
}

impl SchedulerState {
    pub fn new(max_local_steps: i64, num_clients: usize, q_ratio: f64, lambda: f64) -> Self {
        Self {
            iter: 0,
            group_counter: 0,
            max_local_steps,
            min_local_steps: ((q_ratio * max_local_steps as f64) as i64).max(1),
            max_local_steps_bound: (1.2 * max_local_steps as f64) as i64,
            speed_momentum: SPEED_MOMENTUM,
            latest_time_factor: lambda,
            clients: (0..num_clients).map(|_| None).collect(),
            groups: BTreeMap::new(),
        }
    }

    pub fn min_local_steps(&self) -> i64 {
        self.min_local_steps
    }

    pub fn max_local_steps_bound(&self) -> i64 {
        self.max_local_steps_bound
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn client(&self, client: usize) -> &ClientInfo {
        self.clients[client]
            .as_ref()
            .unwrap_or_else(|| panic!("Client {} has no recorded info", client))
    }

    fn client_mut(&mut self, client: usize) -> &mut ClientInfo {
        self.clients[client]
            .as_mut()
            .unwrap_or_else(|| panic!("Client {} has no recorded info", client))
    }

    pub fn group(&self, group: usize) -> &GroupOfArrival {
        self.groups
            .get(&group)
            .unwrap_or_else(|| panic!("Group {} is not in the registry", group))
    }

    pub fn group_exists(&self, group: usize) -> bool {
        self.groups.contains_key(&group)
    }

    fn speed_of(&self, client: usize) -> f64 {
        let speed = self.client(client).speed;
        assert!(
            speed > 0.0,
            "Client {} speed estimate must be positive (got {})",
            client,
            speed
        );
        speed
    }

    /// Updates the speed estimate of an arrived client. The first observation
    /// seeds the estimate using the full step budget as the denominator.
    pub fn record_info(&mut self, client: usize, now: f64) {
        let (start_time, steps) = match &self.clients[client] {
            Some(info) => (info.start_time, info.local_steps),
            None => (0.0, self.max_local_steps),
        };
        let observed = (now - start_time) / steps as f64;
        let momentum = self.speed_momentum;
        if let Some(info) = self.clients[client].as_mut() {
            info.speed = (1.0 - momentum) * info.speed + momentum * observed;
        } else {
            self.clients[client] = Some(ClientInfo {
                speed: observed,
                step: 0,
                local_steps: -1,
                total_steps: self.min_local_steps,
                goa: None,
                start_time: 0.0,
            });
        }
    }

    pub fn set_step(&mut self, client: usize, step: u64) {
        self.client_mut(client).step = step;
    }

    /// Assigns a group to the client: the bootstrap group when the registry is
    /// empty, otherwise an existing group if one fits, otherwise a new group.
    pub fn assign_group(&mut self, client: usize, now: f64) -> Assignment {
        if self.groups.is_empty() {
            let speed = self.speed_of(client);
            let local_steps = self.max_local_steps;
            let expected = now + local_steps as f64 * speed;
            // the bootstrap deadline scales a single step time, not the full budget
            let latest = now + speed * self.latest_time_factor;
            let group = self.insert_group(client, expected, latest);
            self.dispatch(client, group, local_steps, now);
            Assignment::Created {
                group,
                local_steps,
                expected_arrival_time: expected,
                deadline_delay: latest - now,
            }
        } else if let Some(assignment) = self.try_join_group(client, now) {
            assignment
        } else {
            self.create_group(client, now)
        }
    }

    /// Tries to place the client into an existing group so that it finishes by
    /// the group's expected arrival time. Among acceptable groups the one
    /// allowing the most local steps wins; ties go to the latest-scanned group.
    fn try_join_group(&mut self, client: usize, now: f64) -> Option<Assignment> {
        let speed = self.speed_of(client);
        let mut best: Option<(usize, i64)> = None;
        for (&group, goa) in self.groups.iter() {
            let remaining = goa.expected_arrival_time - now;
            let steps = (remaining / speed) as i64;
            if steps < self.min_local_steps || steps > self.max_local_steps_bound {
                continue;
            }
            if let Some((_, best_steps)) = best {
                if steps < best_steps {
                    continue;
                }
            }
            best = Some((group, steps));
        }
        let (group, local_steps) = best?;
        self.dispatch(client, group, local_steps, now);
        self.groups.get_mut(&group).unwrap().clients.push(client);
        Some(Assignment::Joined { group, local_steps })
    }

    /// Creates a new group for the client. The step count is chosen so that the
    /// group lines up with the next completion window of some live group; with
    /// no eligible reference group the full step budget is assigned.
    fn create_group(&mut self, client: usize, now: f64) -> Assignment {
        let speed = self.speed_of(client);
        let mut assigned: i64 = -1;
        for goa in self.groups.values() {
            if now < goa.latest_arrival_time {
                let fastest = goa
                    .clients
                    .iter()
                    .chain(goa.arrived_clients.iter())
                    .map(|&member| self.client(member).speed)
                    .fold(f64::INFINITY, f64::min);
                let est_arrival = goa.latest_arrival_time + fastest * self.max_local_steps as f64;
                let candidate = ((est_arrival - now) / speed) as i64;
                if candidate <= self.max_local_steps {
                    assigned = assigned.max(candidate);
                }
            }
        }
        if (0..self.min_local_steps).contains(&assigned) {
            assigned = self.min_local_steps;
        }
        if assigned < 0 {
            assigned = self.max_local_steps;
        }
        let expected = now + assigned as f64 * speed;
        let latest = now + assigned as f64 * speed * self.latest_time_factor;
        let group = self.insert_group(client, expected, latest);
        self.dispatch(client, group, assigned, now);
        Assignment::Created {
            group,
            local_steps: assigned,
            expected_arrival_time: expected,
            deadline_delay: latest - now,
        }
    }

    fn insert_group(&mut self, client: usize, expected: f64, latest: f64) -> usize {
        let group = self.group_counter;
        self.group_counter += 1;
        self.groups.insert(
            group,
            GroupOfArrival {
                clients: vec![client],
                arrived_clients: Vec::new(),
                expected_arrival_time: expected,
                latest_arrival_time: latest,
            },
        );
        group
    }

    fn dispatch(&mut self, client: usize, group: usize, local_steps: i64, now: f64) {
        let info = self.client_mut(client);
        info.goa = Some(group);
        info.local_steps = local_steps;
        info.start_time = now;
    }

    /// Removes a late client from its defunct group. Returns true if the group
    /// became empty and was dropped from the registry.
    pub fn remove_late(&mut self, client: usize, group: usize) -> bool {
        let goa = self
            .groups
            .get_mut(&group)
            .unwrap_or_else(|| panic!("Group {} referenced by client {} does not exist", group, client));
        goa.clients.retain(|&member| member != client);
        if goa.clients.is_empty() {
            self.groups.remove(&group);
            true
        } else {
            false
        }
    }

    /// Records an on-time arrival. Returns true when no assigned clients are
    /// outstanding, i.e. the group is ready to aggregate.
    pub fn mark_arrived(&mut self, client: usize, group: usize) -> bool {
        let goa = self
            .groups
            .get_mut(&group)
            .unwrap_or_else(|| panic!("Group {} referenced by client {} does not exist", group, client));
        goa.clients.retain(|&member| member != client);
        goa.arrived_clients.push(client);
        goa.clients.is_empty()
    }

    /// Snapshot of the group's arrived clients for aggregation: each one is
    /// synchronized to `global_step` and the result is sorted by ascending
    /// speed estimate, so the fastest client is re-assigned first.
    pub fn aggregation_roster(&mut self, group: usize, global_step: u64) -> Vec<usize> {
        let mut roster = self
            .groups
            .get(&group)
            .map(|goa| goa.arrived_clients.clone())
            .unwrap_or_default();
        for &client in &roster {
            self.client_mut(client).step = global_step;
        }
        roster.sort_by(|&a, &b| self.client(a).speed.partial_cmp(&self.client(b).speed).unwrap());
        roster
    }

    pub fn reset_group_times(&mut self, group: usize) {
        if let Some(goa) = self.groups.get_mut(&group) {
            goa.expected_arrival_time = 0.0;
            goa.latest_arrival_time = 0.0;
        }
    }

    /// Drops the group if it is no longer waiting for any client.
    pub fn drop_group_if_idle(&mut self, group: usize) -> bool {
        if self.groups.get(&group).is_some_and(|goa| goa.clients.is_empty()) {
            self.groups.remove(&group);
            true
        } else {
            false
        }
    }

    /// Accounts the dispatched steps and returns `(local_steps, total_steps)`.
    pub fn prepare_send(&mut self, client: usize) -> (i64, i64) {
        let info = self.client_mut(client);
        info.total_steps += info.local_steps;
        (info.local_steps, info.total_steps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(max_local_steps: i64) -> SchedulerState {
        SchedulerState::new(max_local_steps, 8, 0.2, 1.5)
    }

    fn seed_client(state: &mut SchedulerState, client: usize, speed: f64) {
        state.clients[client] = Some(ClientInfo {
            speed,
            step: 0,
            local_steps: -1,
            total_steps: state.min_local_steps,
            goa: None,
            start_time: 0.0,
        });
    }

    #[test]
    fn test_step_bounds() {
        let state = state(10);
        assert_eq!(state.min_local_steps(), 2);
        assert_eq!(state.max_local_steps_bound(), 12);
        // the minimum never drops below one step
        let small = SchedulerState::new(3, 2, 0.2, 1.5);
        assert_eq!(small.min_local_steps(), 1);
        assert_eq!(small.max_local_steps_bound(), 3);
    }

    #[test]
    fn test_first_observation_uses_full_budget() {
        let mut state = state(10);
        state.record_info(0, 5.0);
        let info = state.client(0);
        assert_eq!(info.speed, 0.5);
        assert_eq!(info.step, 0);
        assert_eq!(info.total_steps, 2);
        assert_eq!(info.local_steps, -1);
        assert!(info.goa.is_none());
    }

    #[test]
    fn test_speed_ema_favors_recent_observations() {
        let mut state = state(10);
        state.record_info(0, 5.0);
        assert_eq!(state.client(0).speed, 0.5);
        state.assign_group(0, 5.0);
        // second round dispatched at t=5 with 10 steps, arrives at t=9
        state.record_info(0, 9.0);
        let expected = (1.0 - SPEED_MOMENTUM) * 0.5 + SPEED_MOMENTUM * 0.4;
        assert!((state.client(0).speed - expected).abs() < 1e-12);
    }

    #[test]
    fn test_bootstrap_group_deadline_asymmetry() {
        let mut state = state(10);
        seed_client(&mut state, 0, 0.5);
        let assignment = state.assign_group(0, 5.0);
        match assignment {
            Assignment::Created {
                group,
                local_steps,
                expected_arrival_time,
                deadline_delay,
            } => {
                assert_eq!(group, 0);
                assert_eq!(local_steps, 10);
                assert_eq!(expected_arrival_time, 5.0 + 10.0 * 0.5);
                // one step time scaled by lambda, not expected * lambda
                assert_eq!(deadline_delay, 0.5 * 1.5);
            }
            other => panic!("expected group creation, got {:?}", other),
        }
        assert_eq!(state.client(0).goa, Some(0));
        assert_eq!(state.client(0).local_steps, 10);
    }

    #[test]
    fn test_join_existing_group() {
        let mut state = state(10);
        seed_client(&mut state, 0, 1.0);
        state.assign_group(0, 10.0); // group 0, expected = 20.0
        seed_client(&mut state, 1, 1.2);
        let assignment = state.assign_group(1, 12.0);
        // remaining 8.0 / 1.2 = 6.66 -> 6 steps, within [2, 12]
        assert_eq!(
            assignment,
            Assignment::Joined {
                group: 0,
                local_steps: 6
            }
        );
        assert_eq!(state.group(0).clients, vec![0, 1]);
    }

    #[test]
    fn test_join_tie_goes_to_last_group() {
        let mut state = state(10);
        seed_client(&mut state, 0, 1.0);
        seed_client(&mut state, 1, 1.0);
        seed_client(&mut state, 2, 1.0);
        state.groups.insert(
            0,
            GroupOfArrival {
                clients: vec![0],
                arrived_clients: vec![],
                expected_arrival_time: 20.0,
                latest_arrival_time: 25.0,
            },
        );
        state.groups.insert(
            1,
            GroupOfArrival {
                clients: vec![1],
                arrived_clients: vec![],
                expected_arrival_time: 20.0,
                latest_arrival_time: 25.0,
            },
        );
        state.group_counter = 2;
        let assignment = state.try_join_group(2, 10.0).unwrap();
        assert_eq!(
            assignment,
            Assignment::Joined {
                group: 1,
                local_steps: 10
            }
        );
    }

    #[test]
    fn test_join_rejects_out_of_bounds_candidates() {
        let mut state = state(10);
        seed_client(&mut state, 0, 1.0);
        state.assign_group(0, 0.0); // expected = 10.0
        // too fast: 10.0 / 0.1 = 100 steps > bound of 12
        seed_client(&mut state, 1, 0.1);
        assert!(state.try_join_group(1, 0.0).is_none());
        // too slow: 10.0 / 9.0 = 1 step < min of 2
        seed_client(&mut state, 2, 9.0);
        assert!(state.try_join_group(2, 0.0).is_none());
        // expected time already passed
        seed_client(&mut state, 3, 1.0);
        assert!(state.try_join_group(3, 15.0).is_none());
    }

    #[test]
    fn test_create_group_aligns_with_reference_group() {
        let mut state = state(10);
        seed_client(&mut state, 0, 1.0);
        state.groups.insert(
            0,
            GroupOfArrival {
                clients: vec![0],
                arrived_clients: vec![],
                expected_arrival_time: 20.0,
                latest_arrival_time: 30.0,
            },
        );
        state.group_counter = 1;
        // est = 30 + 1.0 * 10 = 40; (40 - 10) / 4.0 = 7 steps <= 10
        seed_client(&mut state, 1, 4.0);
        let assignment = state.create_group(1, 10.0);
        match assignment {
            Assignment::Created {
                group,
                local_steps,
                expected_arrival_time,
                deadline_delay,
            } => {
                assert_eq!(group, 1);
                assert_eq!(local_steps, 7);
                assert_eq!(expected_arrival_time, 10.0 + 7.0 * 4.0);
                // latest = expected + (expected - now) * (lambda - 1)
                assert!((deadline_delay - 7.0 * 4.0 * 1.5).abs() < 1e-12);
            }
            other => panic!("expected group creation, got {:?}", other),
        }
    }

    #[test]
    fn test_create_group_falls_back_to_full_budget() {
        let mut state = state(10);
        seed_client(&mut state, 0, 1.0);
        state.groups.insert(
            0,
            GroupOfArrival {
                clients: vec![0],
                arrived_clients: vec![],
                expected_arrival_time: 20.0,
                latest_arrival_time: 30.0,
            },
        );
        state.group_counter = 1;
        // candidate (40 - 10) / 2.0 = 15 > 10 steps, so no eligible reference
        seed_client(&mut state, 1, 2.0);
        let assignment = state.create_group(1, 10.0);
        match assignment {
            Assignment::Created { local_steps, .. } => assert_eq!(local_steps, 10),
            other => panic!("expected group creation, got {:?}", other),
        }
    }

    #[test]
    fn test_create_group_clamps_small_candidates_to_min() {
        let mut state = state(10);
        seed_client(&mut state, 0, 0.05);
        state.groups.insert(
            0,
            GroupOfArrival {
                clients: vec![0],
                arrived_clients: vec![],
                expected_arrival_time: 10.2,
                latest_arrival_time: 10.5,
            },
        );
        state.group_counter = 1;
        // est = 10.5 + 0.05 * 10 = 11; (11 - 10) / 2.0 = 0 steps -> clamped
        seed_client(&mut state, 1, 2.0);
        let assignment = state.create_group(1, 10.0);
        match assignment {
            Assignment::Created { local_steps, .. } => assert_eq!(local_steps, state.min_local_steps()),
            other => panic!("expected group creation, got {:?}", other),
        }
    }

    #[test]
    fn test_arrival_bookkeeping() {
        let mut state = state(10);
        seed_client(&mut state, 0, 1.0);
        seed_client(&mut state, 1, 1.0);
        state.assign_group(0, 0.0);
        state.try_join_group(1, 1.0).unwrap();
        assert!(!state.mark_arrived(0, 0));
        assert!(state.mark_arrived(1, 0));
        assert_eq!(state.group(0).arrived_clients, vec![0, 1]);
        assert!(state.group(0).clients.is_empty());
    }

    #[test]
    fn test_late_removal_drops_empty_group() {
        let mut state = state(10);
        seed_client(&mut state, 0, 1.0);
        state.assign_group(0, 0.0);
        assert!(state.remove_late(0, 0));
        assert!(!state.group_exists(0));
    }

    #[test]
    fn test_roster_sorted_fastest_first() {
        let mut state = state(10);
        seed_client(&mut state, 0, 1.0);
        seed_client(&mut state, 1, 2.0);
        seed_client(&mut state, 2, 3.0);
        state.groups.insert(
            0,
            GroupOfArrival {
                clients: vec![],
                arrived_clients: vec![2, 0, 1],
                expected_arrival_time: 5.0,
                latest_arrival_time: 7.5,
            },
        );
        state.group_counter = 1;
        let roster = state.aggregation_roster(0, 4);
        assert_eq!(roster, vec![0, 1, 2]);
        for client in 0..3 {
            assert_eq!(state.client(client).step, 4);
        }
    }
}
