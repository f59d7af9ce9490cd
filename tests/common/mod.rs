//! Recording fake host shared by the integration tests.

#![allow(dead_code)]

use dns_override::{ForwarderProcess, Host, InterfaceAddress, Listener, OverrideConfig, ProcessExit};
use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Every host operation the orchestration performed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    InterfaceAddress(String),
    InterfaceAddresses,
    FindProcesses,
    Terminate(u32),
    FindListener(u16),
    ServiceActive(String),
    StopService(String),
    StartService(String),
    Settle(Duration),
    Spawn(String),
    StopForwarder,
}

/// What the fake forwarder does once spawned.
#[derive(Debug, Clone, Copy)]
pub enum Forwarder {
    /// Runs until stopped.
    RunsUntilStopped,
    /// Exits by itself after the delay with the given code.
    ExitsAfter(Duration, Option<i32>),
    /// Spawning fails with this error kind.
    SpawnFails(io::ErrorKind),
}

#[derive(Debug)]
struct Inner {
    prior: Vec<u32>,
    listener: Option<Listener>,
    resolver_active: bool,
    stop_failures: u32,
    stop_error: io::ErrorKind,
    stop_applies_on_failure: bool,
    listener_error: Option<io::ErrorKind>,
    start_failures: u32,
}

pub struct FakeHost {
    calls: Arc<Mutex<Vec<Call>>>,
    named: HashMap<String, Ipv4Addr>,
    all: Vec<InterfaceAddress>,
    forwarder: Forwarder,
    inner: Mutex<Inner>,
}

pub const RESOLVER: &str = "systemd-resolved.service";

impl FakeHost {
    /// `wlan0` at 192.168.1.50, free port, forwarder that runs until stopped.
    pub fn new() -> Self {
        Self {
            calls: Arc::default(),
            named: HashMap::from([("wlan0".to_string(), Ipv4Addr::new(192, 168, 1, 50))]),
            all: Vec::new(),
            forwarder: Forwarder::RunsUntilStopped,
            inner: Mutex::new(Inner {
                prior: Vec::new(),
                listener: None,
                resolver_active: false,
                stop_failures: 0,
                stop_error: io::ErrorKind::Other,
                stop_applies_on_failure: false,
                listener_error: None,
                start_failures: 0,
            }),
        }
    }

    pub fn without_interfaces(mut self) -> Self {
        self.named.clear();
        self.all.clear();
        self
    }

    pub fn with_named(mut self, name: &str, addr: Ipv4Addr) -> Self {
        self.named.insert(name.to_string(), addr);
        self
    }

    pub fn with_scanned(mut self, name: &str, addr: Ipv4Addr) -> Self {
        self.all.push(InterfaceAddress {
            name: name.to_string(),
            addr,
        });
        self
    }

    /// `systemd-resolved` active and holding port 53.
    pub fn with_resolver(self) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.resolver_active = true;
            inner.listener = Some(Listener {
                local: "127.0.0.53%lo:53".to_string(),
                process: Some("systemd-resolve".to_string()),
                pid: Some(612),
            });
        }
        self
    }

    pub fn with_listener(self, process: &str) -> Self {
        self.inner.lock().unwrap().listener = Some(Listener {
            local: "0.0.0.0:53".to_string(),
            process: Some(process.to_string()),
            pid: Some(900),
        });
        self
    }

    pub fn with_prior_instance(self, pid: u32) -> Self {
        self.inner.lock().unwrap().prior.push(pid);
        self
    }

    pub fn failing_stops(self, count: u32, kind: io::ErrorKind) -> Self {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.stop_failures = count;
            inner.stop_error = kind;
        }
        self
    }

    /// Failed stops still bring the service down, like a `systemctl stop`
    /// that times out after the unit already exited.
    pub fn stops_apply_anyway(self) -> Self {
        self.inner.lock().unwrap().stop_applies_on_failure = true;
        self
    }

    /// Listing socket owners fails with `kind`.
    pub fn failing_listener_lookup(self, kind: io::ErrorKind) -> Self {
        self.inner.lock().unwrap().listener_error = Some(kind);
        self
    }

    pub fn failing_starts(self, count: u32) -> Self {
        self.inner.lock().unwrap().start_failures = count;
        self
    }

    pub fn with_forwarder(mut self, forwarder: Forwarder) -> Self {
        self.forwarder = forwarder;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|&c| pred(c)).count()
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn resolver_active(&self) -> bool {
        self.inner.lock().unwrap().resolver_active
    }

    fn log(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Host for FakeHost {
    type Forwarder = FakeForwarder;

    fn interface_address(&self, name: &str) -> io::Result<Option<Ipv4Addr>> {
        self.log(Call::InterfaceAddress(name.to_string()));
        Ok(self.named.get(name).copied())
    }

    fn interface_addresses(&self) -> io::Result<Vec<InterfaceAddress>> {
        self.log(Call::InterfaceAddresses);
        Ok(self.all.clone())
    }

    fn find_processes(&self, _needles: &[&str]) -> io::Result<Vec<u32>> {
        self.log(Call::FindProcesses);
        Ok(self.inner.lock().unwrap().prior.clone())
    }

    async fn terminate_process(&self, pid: u32) -> io::Result<()> {
        self.log(Call::Terminate(pid));
        self.inner.lock().unwrap().prior.retain(|p| *p != pid);
        Ok(())
    }

    async fn find_listener(&self, port: u16) -> io::Result<Option<Listener>> {
        self.log(Call::FindListener(port));
        let inner = self.inner.lock().unwrap();
        if let Some(kind) = inner.listener_error {
            return Err(io::Error::new(kind, "ss: a password is required"));
        }
        Ok(inner.listener.clone())
    }

    async fn service_active(&self, service: &str) -> io::Result<bool> {
        self.log(Call::ServiceActive(service.to_string()));
        Ok(self.inner.lock().unwrap().resolver_active)
    }

    async fn stop_service(&self, service: &str) -> io::Result<()> {
        self.log(Call::StopService(service.to_string()));
        let mut inner = self.inner.lock().unwrap();
        if inner.stop_failures > 0 {
            inner.stop_failures -= 1;
            if inner.stop_applies_on_failure {
                inner.resolver_active = false;
                inner.listener = None;
            }
            return Err(io::Error::new(inner.stop_error, "stop refused"));
        }
        inner.resolver_active = false;
        inner.listener = None;
        Ok(())
    }

    async fn start_service(&self, service: &str) -> io::Result<()> {
        self.log(Call::StartService(service.to_string()));
        let mut inner = self.inner.lock().unwrap();
        if inner.start_failures > 0 {
            inner.start_failures -= 1;
            return Err(io::Error::other("start refused"));
        }
        inner.resolver_active = true;
        Ok(())
    }

    async fn settle(&self, interval: Duration) {
        self.log(Call::Settle(interval));
    }

    fn spawn_forwarder(&self, binary: &str, _args: &[String]) -> io::Result<FakeForwarder> {
        self.log(Call::Spawn(binary.to_string()));
        if let Forwarder::SpawnFails(kind) = self.forwarder {
            return Err(io::Error::new(kind, "spawn failed"));
        }
        Ok(FakeForwarder {
            calls: Arc::clone(&self.calls),
            behavior: self.forwarder,
            started: Instant::now(),
        })
    }
}

pub struct FakeForwarder {
    calls: Arc<Mutex<Vec<Call>>>,
    behavior: Forwarder,
    started: Instant,
}

impl ForwarderProcess for FakeForwarder {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        match self.behavior {
            Forwarder::ExitsAfter(after, code) => {
                tokio::time::sleep_until(self.started + after).await;
                Ok(ProcessExit { code })
            }
            _ => std::future::pending::<io::Result<ProcessExit>>().await,
        }
    }

    async fn stop(&mut self, _grace: Duration) -> io::Result<ProcessExit> {
        self.calls.lock().unwrap().push(Call::StopForwarder);
        Ok(ProcessExit { code: Some(0) })
    }
}

/// Test config rooted in `dir`, scenario hostname and upstreams.
pub fn config(dir: &Path) -> OverrideConfig {
    OverrideConfig::default()
        .with_work_dir(dir)
        .with_hostname("api.example.com")
        .with_upstreams(["8.8.8.8".parse().unwrap(), "8.8.4.4".parse().unwrap()])
}
