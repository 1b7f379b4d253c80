//! Test fixtures for scheduler integration tests.

use kiln_scheduler::{WorkerKey, WorkerRegistration};
use std::net::IpAddr;

/// Builder for worker registrations as a worker handshake would produce.
pub struct WorkerBuilder {
    ip: IpAddr,
    port: u16,
    slots: u32,
    name: Option<String>,
    hostname: Option<String>,
    environments: Vec<String>,
}

impl WorkerBuilder {
    /// Creates a worker at `ip` on the default port with four slots.
    pub fn new(ip: &str) -> Self {
        Self {
            ip: ip.parse().unwrap(),
            port: 8096,
            slots: 4,
            name: None,
            hostname: None,
            environments: vec![],
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.hostname = Some(hostname.to_string());
        self
    }

    /// Sets the environments the worker claims on connect.
    pub fn with_environments(mut self, hashes: &[&str]) -> Self {
        self.environments = hashes.iter().map(|h| h.to_string()).collect();
        self
    }

    pub fn key(&self) -> WorkerKey {
        WorkerKey::new(self.ip, self.port)
    }

    pub fn build(self) -> WorkerRegistration {
        let mut registration = WorkerRegistration::new(WorkerKey::new(self.ip, self.port), self.slots);
        registration.name = self.name;
        registration.hostname = self.hostname;
        registration.system = Some("Linux x86_64".to_string());
        registration.version = Some("test".to_string());
        registration.environments = self.environments;
        registration
    }
}
