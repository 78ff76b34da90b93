use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// Knobs for making the simulated cloud misbehave.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Private links whose health query answers 500.
    pub failing_health: BTreeSet<String>,
    /// The first N source uploads answer 503.
    pub upload_failures: u32,
    /// Build logs end with an error frame.
    pub fail_build: bool,
    /// Claim polls answered "pending" before credentials are released.
    pub pending_claims: u32,
    /// Every claim is refused.
    pub deny_claims: bool,
}

/// Credentials released by a successful device claim.
pub const CLAIMED_KEY: &str = "APIsimulated";
pub const CLAIMED_SECRET: &str = "simulated-secret-that-is-long-enough";
pub const CLAIMED_PROJECT_ID: &str = "p_sim";
pub const CLAIMED_PROJECT_NAME: &str = "Simulated Project";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimAgent {
    pub agent_id: String,
    pub agent_name: String,
    /// Oldest first.
    pub versions: Vec<String>,
    pub current: String,
    pub replicas: u32,
    pub max_replicas: u32,
    pub cpu_req: String,
    pub regions: Vec<String>,
    pub secrets: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrivateLink {
    pub private_link_id: String,
    pub name: String,
    pub region: String,
    pub port: u32,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub agent_id: String,
    pub version: String,
    pub bytes: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Inner {
    pub base_url: String,
    pub faults: Faults,
    pub client_settings: BTreeMap<String, String>,
    pub agents: BTreeMap<String, SimAgent>,
    pub private_links: Vec<PrivateLink>,
    pub rooms: BTreeMap<String, Value>,
    pub inbound_trunks: Vec<Value>,
    pub dispatch_rules: Vec<Value>,
    pub phone_numbers: Vec<Value>,
    /// Device token to the number of claim polls seen so far.
    pub device_tokens: BTreeMap<String, u32>,
    pub revocations: usize,
    pub uploads: Vec<Upload>,
    pub calls: Vec<String>,
    pub rollbacks: Vec<(String, String)>,
    next_id: u64,
}

impl Inner {
    pub fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{:04}", self.next_id)
    }

    pub fn upload_url(&self, agent_id: &str, version: &str) -> String {
        format!("{}/uploads/{agent_id}/{version}", self.base_url)
    }
}

/// Shared handle on everything the simulator remembers. Tests use the
/// accessors to seed data and to inspect what the client did.
#[derive(Debug, Clone, Default)]
pub struct SimState {
    inner: Arc<Mutex<Inner>>,
}

impl SimState {
    pub fn new(base_url: &str, faults: Faults) -> Self {
        let client_settings = BTreeMap::from([
            ("python-min-sdk-version".to_string(), "1.0.0".to_string()),
            ("node-min-sdk-version".to_string(), "0.7.0".to_string()),
        ]);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                base_url: base_url.trim_end_matches('/').to_string(),
                faults,
                client_settings,
                ..Inner::default()
            })),
        }
    }

    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        f(&mut self.inner.lock())
    }

    pub fn base_url(&self) -> String {
        self.with(|inner| inner.base_url.clone())
    }

    pub fn set_client_setting(&self, key: &str, value: &str) {
        self.with(|inner| {
            inner
                .client_settings
                .insert(key.to_string(), value.to_string());
        });
    }

    /// Registers an agent that already went through some deploys. The last
    /// version is current.
    pub fn seed_agent(&self, name: &str, versions: &[&str]) -> String {
        self.with(|inner| {
            let agent_id = inner.next_id("CA");
            let versions: Vec<String> = versions.iter().map(|v| v.to_string()).collect();
            let current = versions.last().cloned().unwrap_or_default();
            inner.agents.insert(
                agent_id.clone(),
                SimAgent {
                    agent_id: agent_id.clone(),
                    agent_name: name.to_string(),
                    versions,
                    current,
                    replicas: 1,
                    max_replicas: 10,
                    cpu_req: "1".into(),
                    regions: vec!["us-east".into()],
                    secrets: BTreeSet::new(),
                },
            );
            agent_id
        })
    }

    pub fn seed_private_link(&self, name: &str, region: &str, port: u32, endpoint: &str) -> String {
        self.with(|inner| {
            let private_link_id = inner.next_id("PL");
            inner.private_links.push(PrivateLink {
                private_link_id: private_link_id.clone(),
                name: name.to_string(),
                region: region.to_string(),
                port,
                endpoint: endpoint.to_string(),
            });
            private_link_id
        })
    }

    pub fn fail_health_of(&self, private_link_id: &str) {
        self.with(|inner| {
            inner
                .faults
                .failing_health
                .insert(private_link_id.to_string());
        });
    }

    pub fn agent(&self, agent_id: &str) -> Option<SimAgent> {
        self.with(|inner| inner.agents.get(agent_id).cloned())
    }

    pub fn agent_named(&self, name: &str) -> Option<SimAgent> {
        self.with(|inner| {
            inner
                .agents
                .values()
                .find(|a| a.agent_name == name)
                .cloned()
        })
    }

    /// `Service/Method` of every RPC received, in order.
    pub fn calls(&self) -> Vec<String> {
        self.with(|inner| inner.calls.clone())
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.with(|inner| inner.uploads.clone())
    }

    /// `(agent_id, requested version)` of every accepted rollback.
    pub fn rollbacks(&self) -> Vec<(String, String)> {
        self.with(|inner| inner.rollbacks.clone())
    }

    pub fn revocations(&self) -> usize {
        self.with(|inner| inner.revocations)
    }
}
