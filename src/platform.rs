//! Cluster topology: hosts with compute speeds and a uniform link mesh.

use serde::{Deserialize, Serialize};

fn default_prefix() -> String {
    "Node".to_string()
}

fn one() -> u32 {
    1
}

/// A group of identical hosts, named `<name_prefix>-1 .. <name_prefix>-<count>`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodeGroup {
    #[serde(default = "default_prefix")]
    pub name_prefix: String,
    /// Host compute speed in FLOPS.
    pub speed: f64,
    #[serde(default = "one")]
    pub count: u32,
}

/// Bandwidth/latency pair describing either the shared mesh or the loopback.
#[derive(Debug, Serialize, Deserialize, Clone, Copy)]
pub struct LinkConfig {
    /// Bytes per second.
    pub bandwidth: f64,
    /// Seconds.
    pub latency: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct PlatformRaw {
    nodes: Vec<NodeGroup>,
    link: LinkConfig,
    loopback: Option<LinkConfig>,
}

/// A single simulated host.
#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    /// Compute speed in FLOPS.
    pub speed: f64,
}

impl Host {
    /// Time to execute the given amount of computation on this host.
    pub fn exec_time(&self, flops: f64) -> f64 {
        flops / self.speed
    }
}

/// Parsed platform description: every pair of distinct hosts is connected by
/// the shared link, transfers within one host go over the loopback.
#[derive(Debug, Clone)]
pub struct Platform {
    hosts: Vec<Host>,
    link: LinkConfig,
    loopback: LinkConfig,
}

impl Platform {
    /// Reads the platform from a YAML file.
    pub fn from_file(file_name: &str) -> Self {
        let content = std::fs::read_to_string(file_name)
            .unwrap_or_else(|_| panic!("Can't read platform file {}", file_name));
        Self::from_yaml(&content)
    }

    /// Parses the platform from a YAML string.
    pub fn from_yaml(content: &str) -> Self {
        let raw: PlatformRaw =
            serde_yaml::from_str(content).unwrap_or_else(|e| panic!("Can't parse platform YAML: {}", e));
        assert!(!raw.nodes.is_empty(), "Platform must define at least one node group");
        let mut hosts = Vec::new();
        for group in &raw.nodes {
            assert!(group.speed > 0.0, "Host speed must be positive (got {})", group.speed);
            assert!(group.count >= 1, "Node group count must be at least 1");
            for i in 1..=group.count {
                hosts.push(Host {
                    name: format!("{}-{}", group.name_prefix, i),
                    speed: group.speed,
                });
            }
        }
        let link = raw.link;
        assert!(
            link.bandwidth > 0.0 && link.latency >= 0.0,
            "Link must have positive bandwidth and non-negative latency"
        );
        let loopback = raw.loopback.unwrap_or(link);
        Self { hosts, link, loopback }
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn host(&self, idx: usize) -> &Host {
        &self.hosts[idx]
    }

    /// Transfer time for `size` bytes between two hosts (by index).
    pub fn transfer_time(&self, src: usize, dst: usize, size: f64) -> f64 {
        let link = if src == dst { &self.loopback } else { &self.link };
        link.latency + size / link.bandwidth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLATFORM: &str = r#"
nodes:
  - name_prefix: Node
    speed: 1000.0
    count: 3
link:
  bandwidth: 100.0
  latency: 0.5
loopback:
  bandwidth: 1000.0
  latency: 0.001
"#;

    #[test]
    fn test_hosts_and_names() {
        let platform = Platform::from_yaml(PLATFORM);
        assert_eq!(platform.host_count(), 3);
        assert_eq!(platform.host(0).name, "Node-1");
        assert_eq!(platform.host(2).name, "Node-3");
        assert_eq!(platform.host(1).exec_time(500.), 0.5);
    }

    #[test]
    fn test_transfer_time() {
        let platform = Platform::from_yaml(PLATFORM);
        assert_eq!(platform.transfer_time(0, 1, 200.), 0.5 + 2.0);
        // same host goes over the loopback
        assert_eq!(platform.transfer_time(1, 1, 200.), 0.001 + 0.2);
    }

    #[test]
    #[should_panic(expected = "positive")]
    fn test_bad_speed() {
        Platform::from_yaml(
            "nodes:\n  - speed: 0.0\n    count: 1\nlink:\n  bandwidth: 1.0\n  latency: 0.0\n",
        );
    }
}
