//! Workload configuration and straggler rules.
//!
//! The configuration is a JSON document passed on the command line either as a
//! file path or as an inline string. Configuration errors are fatal: the
//! process aborts with a descriptive message and a non-zero exit code.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_Q_RATIO: f64 = 0.2;
pub const DEFAULT_LATEST_TIME_FACTOR: f64 = 1.5;

/// Federated learning algorithm driven by the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    FedCompass,
    FedAvg,
}

impl Algorithm {
    pub fn parse(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "fedcompass" | "compass" => Algorithm::FedCompass,
            "fedavg" => Algorithm::FedAvg,
            other => panic!("Unknown algorithm \"{}\" (expected fedcompass or fedavg)", other),
        }
    }
}

/// Per-client compute perturbation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedControl {
    /// No randomness, fully deterministic costs.
    Deterministic,
    /// A fresh jitter factor is drawn for every training round.
    TransientJitter,
    /// A slowdown factor is drawn once per client and applied to all its compute,
    /// in addition to the per-round jitter.
    PersistentSlowdown,
}

impl SpeedControl {
    fn from_code(code: i64) -> Self {
        match code {
            0 => SpeedControl::Deterministic,
            1 => SpeedControl::TransientJitter,
            2 => SpeedControl::PersistentSlowdown,
            other => panic!("Config key \"control\" must be 0, 1 or 2 (got {})", other),
        }
    }
}

/// Client range targeted by a straggler rule, either `[start, end]` or
/// `{start: .., end: ..}`. Both bounds are inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RangeSpec {
    Pair([i64; 2]),
    Bounds { start: i64, end: i64 },
}

impl RangeSpec {
    fn bounds(&self) -> (i64, i64) {
        match *self {
            RangeSpec::Pair([start, end]) => (start, end),
            RangeSpec::Bounds { start, end } => (start, end),
        }
    }
}

/// A single straggler rule: a cost multiplier and the clients it applies to.
/// All targeting clauses within one rule are unioned; effects for the same
/// client across rules are multiplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StragglerRule {
    pub effect: f64,
    #[serde(default)]
    pub client: Option<i64>,
    #[serde(default)]
    pub clients: Option<Vec<i64>>,
    #[serde(default)]
    pub range: Option<RangeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkloadConfigRaw {
    num_nodes: i64,
    clients_per_node: i64,
    epochs: i64,
    max_local_steps: Option<i64>,
    q_ratio: Option<f64>,
    lambda: Option<f64>,
    dataloader_cost: f64,
    aggregation_cost: f64,
    training_cost: f64,
    model_size: Option<f64>,
    comm_cost: Option<f64>,
    validation_cost: Option<f64>,
    validation_flag: Option<i64>,
    control: Option<i64>,
    stragglers: Option<Vec<StragglerRule>>,
}

/// Validated workload description.
///
/// `max_local_steps` and `model_size` are required only for FedCompass,
/// `comm_cost` only for FedAvg; the checks happen when the corresponding
/// server is built.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub num_nodes: usize,
    pub clients_per_node: usize,
    pub epochs: u64,
    pub max_local_steps: Option<i64>,
    pub q_ratio: f64,
    pub lambda: f64,
    pub dataloader_cost: f64,
    /// Parsed for interface compatibility, not charged by the scheduler body.
    pub aggregation_cost: f64,
    pub training_cost: f64,
    pub model_size: Option<f64>,
    pub comm_cost: Option<f64>,
    pub validation_cost: f64,
    pub validation_flag: bool,
    pub control: SpeedControl,
    pub stragglers: Vec<StragglerRule>,
}

impl WorkloadConfig {
    /// Loads the configuration from `arg`, which is tried first as a file path
    /// and then as an inline JSON string.
    pub fn load(arg: &str) -> Self {
        let content = std::fs::read_to_string(arg).unwrap_or_else(|_| arg.to_string());
        let raw: WorkloadConfigRaw = serde_json::from_str(&content)
            .unwrap_or_else(|e| panic!("Failed to parse configuration {}: {}", arg, e));
        Self::from_raw(raw)
    }

    fn from_raw(raw: WorkloadConfigRaw) -> Self {
        assert!(raw.num_nodes >= 1, "Config key \"num_nodes\" must be at least 1");
        assert!(
            raw.clients_per_node >= 1,
            "Config key \"clients_per_node\" must be at least 1"
        );
        assert!(raw.epochs >= 1, "Config key \"epochs\" must be at least 1");
        if let Some(q) = raw.max_local_steps {
            assert!(q >= 1, "Config key \"max_local_steps\" must be at least 1");
        }
        let q_ratio = raw.q_ratio.unwrap_or(DEFAULT_Q_RATIO);
        assert!(q_ratio > 0.0, "Config key \"q_ratio\" must be positive");
        let lambda = raw.lambda.unwrap_or(DEFAULT_LATEST_TIME_FACTOR);
        assert!(lambda >= 1.0, "Config key \"lambda\" must be at least 1.0");
        assert!(
            raw.dataloader_cost >= 0.0
                && raw.training_cost >= 0.0
                && raw.aggregation_cost >= 0.0
                && raw.validation_cost.unwrap_or(0.0) >= 0.0,
            "Cost config keys must be non-negative"
        );
        let config = Self {
            num_nodes: raw.num_nodes as usize,
            clients_per_node: raw.clients_per_node as usize,
            epochs: raw.epochs as u64,
            max_local_steps: raw.max_local_steps,
            q_ratio,
            lambda,
            dataloader_cost: raw.dataloader_cost,
            aggregation_cost: raw.aggregation_cost,
            training_cost: raw.training_cost,
            model_size: raw.model_size,
            comm_cost: raw.comm_cost,
            validation_cost: raw.validation_cost.unwrap_or(0.0),
            validation_flag: raw.validation_flag.unwrap_or(0) != 0,
            control: SpeedControl::from_code(raw.control.unwrap_or(0)),
            stragglers: raw.stragglers.unwrap_or_default(),
        };
        assert!(
            config.num_clients() >= 1,
            "Topology must produce at least one client (num_nodes * clients_per_node - 1 >= 1)"
        );
        config
    }

    /// Total number of clients; the server occupies one slot on the first node.
    pub fn num_clients(&self) -> usize {
        self.num_nodes * self.clients_per_node - 1
    }
}

/// Resolves straggler rules into a per-client cost-multiplier map.
/// Clients without an entry have an implicit multiplier of 1.0.
pub fn client_multipliers(rules: &[StragglerRule], num_clients: usize) -> HashMap<usize, f64> {
    let mut effects: HashMap<usize, f64> = HashMap::new();
    for rule in rules {
        assert!(
            rule.effect > 0.0,
            "Straggler effect must be positive (got {})",
            rule.effect
        );
        let mut targets: Vec<i64> = Vec::new();
        if let Some(client) = rule.client {
            targets.push(client);
        }
        if let Some(clients) = &rule.clients {
            targets.extend(clients.iter().copied());
        }
        if let Some(range) = &rule.range {
            let (start, end) = range.bounds();
            assert!(start <= end, "Straggler \"range\" start must be <= end");
            targets.extend(start..=end);
        }
        assert!(!targets.is_empty(), "Straggler rule must target at least one client");
        for client in targets {
            assert!(
                client >= 0 && (client as usize) < num_clients,
                "Invalid straggler client {} (valid range: 0-{})",
                client,
                num_clients - 1
            );
            *effects.entry(client as usize).or_insert(1.0) *= rule.effect;
        }
    }
    effects
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules_from_json(json: &str) -> Vec<StragglerRule> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_effects_compose_multiplicatively() {
        let rules = rules_from_json(r#"[{"effect": 2.0, "client": 3}, {"effect": 3.0, "client": 3}]"#);
        let effects = client_multipliers(&rules, 5);
        assert_eq!(effects[&3], 6.0);
        assert_eq!(effects.get(&0).copied().unwrap_or(1.0), 1.0);
    }

    #[test]
    fn test_range_forms() {
        let rules = rules_from_json(r#"[{"effect": 2.0, "range": [1, 3]}]"#);
        let effects = client_multipliers(&rules, 5);
        for client in 0..5 {
            let expected = if (1..=3).contains(&client) { 2.0 } else { 1.0 };
            assert_eq!(effects.get(&client).copied().unwrap_or(1.0), expected);
        }

        let rules = rules_from_json(r#"[{"effect": 2.0, "range": {"start": 1, "end": 3}}]"#);
        assert_eq!(client_multipliers(&rules, 5), effects);
    }

    #[test]
    fn test_clauses_are_unioned() {
        let rules = rules_from_json(r#"[{"effect": 2.0, "client": 0, "clients": [1, 2], "range": [3, 4]}]"#);
        let effects = client_multipliers(&rules, 5);
        for client in 0..5 {
            assert_eq!(effects[&client], 2.0);
        }
    }

    #[test]
    fn test_parsing_is_idempotent() {
        let json = r#"[{"effect": 2.5, "clients": [0, 2]}, {"effect": 4.0, "range": [2, 3]}]"#;
        let first = client_multipliers(&rules_from_json(json), 4);
        let second = client_multipliers(&rules_from_json(json), 4);
        assert_eq!(first, second);
        assert_eq!(first[&2], 10.0);
    }

    #[test]
    #[should_panic(expected = "positive")]
    fn test_non_positive_effect_is_fatal() {
        let rules = rules_from_json(r#"[{"effect": -1.0, "client": 0}]"#);
        client_multipliers(&rules, 2);
    }

    #[test]
    #[should_panic(expected = "target at least one client")]
    fn test_empty_rule_is_fatal() {
        let rules = rules_from_json(r#"[{"effect": 2.0}]"#);
        client_multipliers(&rules, 2);
    }

    #[test]
    #[should_panic(expected = "Invalid straggler client")]
    fn test_out_of_range_client_is_fatal() {
        let rules = rules_from_json(r#"[{"effect": 2.0, "client": 7}]"#);
        client_multipliers(&rules, 2);
    }

    #[test]
    #[should_panic(expected = "start must be <= end")]
    fn test_reversed_range_is_fatal() {
        let rules = rules_from_json(r#"[{"effect": 2.0, "range": [3, 1]}]"#);
        client_multipliers(&rules, 5);
    }

    #[test]
    fn test_config_defaults() {
        let config = WorkloadConfig::load(
            r#"{"num_nodes": 2, "clients_per_node": 2, "epochs": 3,
                "max_local_steps": 10, "dataloader_cost": 1.0,
                "aggregation_cost": 0.5, "training_cost": 0.1, "model_size": 1000.0}"#,
        );
        assert_eq!(config.num_clients(), 3);
        assert_eq!(config.q_ratio, DEFAULT_Q_RATIO);
        assert_eq!(config.lambda, DEFAULT_LATEST_TIME_FACTOR);
        assert_eq!(config.control, SpeedControl::Deterministic);
        assert!(!config.validation_flag);
        assert!(config.stragglers.is_empty());
    }

    #[test]
    #[should_panic(expected = "Failed to parse configuration")]
    fn test_unparseable_config_is_fatal() {
        WorkloadConfig::load("{not json");
    }
}
