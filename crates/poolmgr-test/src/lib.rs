//! Helpers for testing the web server and service.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - The [`FakeOrchestrator`] never starts anything. Instances only exist as entries in its
//!    bookkeeping, and their addresses are not reachable.
//!
//!  - When using [`Server`], make sure that the server is held until all requests to it have
//!    been made. It stops serving when dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use poolmgr_service::error::ResolveError;
use poolmgr_service::metadata::MetadataStore;
use poolmgr_service::pool::{Instance, Orchestrator};
use poolmgr_service::types::{Environment, Function, Identity, PackageRef};
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the pool manager crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("poolmgr=trace,poolmgr_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates an environment running `image`.
pub fn environment(name: &str, uid: &str, image: &str) -> Environment {
    Environment {
        metadata: Identity::new(name, uid),
        image: image.to_owned(),
        resources: Default::default(),
    }
}

/// Creates a function in `environment`, with its package served from a made up location.
pub fn function(name: &str, uid: &str, environment: &Environment) -> Function {
    Function {
        metadata: Identity::new(name, uid),
        environment: environment.metadata.clone(),
        package: Some(PackageRef {
            url: format!("http://storage.test/packages/{name}-{uid}.zip"),
        }),
    }
}

/// A [`MetadataStore`] holding definitions in memory.
///
/// Counts fetches and can be switched to fail all requests, to simulate an outage.
#[derive(Debug, Default)]
pub struct InMemoryMetadataStore {
    functions: Mutex<HashMap<Identity, Function>>,
    environments: Mutex<HashMap<Identity, Environment>>,
    function_fetches: AtomicUsize,
    environment_fetches: AtomicUsize,
    offline: AtomicBool,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_environment(&self, environment: Environment) {
        self.environments
            .lock()
            .unwrap()
            .insert(environment.metadata.clone(), environment);
    }

    pub fn add_function(&self, function: Function) {
        self.functions
            .lock()
            .unwrap()
            .insert(function.metadata.clone(), function);
    }

    /// Makes all subsequent fetches fail with [`ResolveError::UpstreamUnavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// The number of function fetches, including failed ones.
    pub fn function_fetches(&self) -> usize {
        self.function_fetches.load(Ordering::SeqCst)
    }

    /// The number of environment fetches, including failed ones.
    pub fn environment_fetches(&self) -> usize {
        self.environment_fetches.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), ResolveError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ResolveError::UpstreamUnavailable(
                "metadata store is offline".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get_function(&self, function: &Identity) -> Result<Function, ResolveError> {
        self.function_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.functions
            .lock()
            .unwrap()
            .get(function)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(format!("function {function}")))
    }

    async fn get_environment(&self, environment: &Identity) -> Result<Environment, ResolveError> {
        self.environment_fetches.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        self.environments
            .lock()
            .unwrap()
            .get(environment)
            .cloned()
            .ok_or_else(|| ResolveError::NotFound(format!("environment {environment}")))
    }
}

/// A scriptable [`Orchestrator`].
///
/// Instances get sequential addresses `10.0.0.N:8888`, starting at the configured first host.
/// Latencies are slept with tokio's timer, so they are deterministic with a paused clock.
#[derive(Debug)]
pub struct FakeOrchestrator {
    next_host: AtomicUsize,
    create_latency: Duration,
    inject_latency: Duration,
    fail_create: AtomicBool,
    fail_inject: AtomicBool,
    fail_probe: AtomicBool,
    created: AtomicUsize,
    injected: Mutex<Vec<(Instance, Identity)>>,
    destroyed: Mutex<Vec<Instance>>,
}

impl Default for FakeOrchestrator {
    fn default() -> Self {
        Self {
            next_host: AtomicUsize::new(5),
            create_latency: Duration::ZERO,
            inject_latency: Duration::ZERO,
            fail_create: AtomicBool::new(false),
            fail_inject: AtomicBool::new(false),
            fail_probe: AtomicBool::new(false),
            created: AtomicUsize::new(0),
            injected: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
        }
    }
}

impl FakeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every instance creation.
    pub fn with_create_latency(mut self, latency: Duration) -> Self {
        self.create_latency = latency;
        self
    }

    /// Delays every injection.
    pub fn with_inject_latency(mut self, latency: Duration) -> Self {
        self.inject_latency = latency;
        self
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_inject(&self, fail: bool) {
        self.fail_inject.store(fail, Ordering::SeqCst);
    }

    pub fn fail_probe(&self, fail: bool) {
        self.fail_probe.store(fail, Ordering::SeqCst);
    }

    /// The number of successfully created instances.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// The number of attempted injections.
    pub fn injections(&self) -> usize {
        self.injected.lock().unwrap().len()
    }

    /// The functions injected so far, in order.
    pub fn injected_functions(&self) -> Vec<Identity> {
        let injected = self.injected.lock().unwrap();
        injected.iter().map(|(_, f)| f.clone()).collect()
    }

    /// The instances destroyed so far, in order.
    pub fn destroyed(&self) -> Vec<Instance> {
        self.destroyed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn create_instance(&self, environment: &Environment) -> anyhow::Result<Instance> {
        if !self.create_latency.is_zero() {
            tokio::time::sleep(self.create_latency).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            anyhow::bail!("cannot schedule {}", environment.image);
        }

        let host = self.next_host.fetch_add(1, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Instance {
            id: format!("{}-{host}", environment.metadata.name),
            address: format!("10.0.0.{host}:8888"),
        })
    }

    async fn inject(&self, instance: &Instance, function: &Function) -> anyhow::Result<()> {
        self.injected
            .lock()
            .unwrap()
            .push((instance.clone(), function.metadata.clone()));
        if !self.inject_latency.is_zero() {
            tokio::time::sleep(self.inject_latency).await;
        }
        if self.fail_inject.load(Ordering::SeqCst) {
            anyhow::bail!("fetcher failed to download package");
        }
        Ok(())
    }

    async fn probe(&self, _instance: &Instance) -> anyhow::Result<()> {
        if self.fail_probe.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        Ok(())
    }

    async fn destroy(&self, instance: &Instance) -> anyhow::Result<()> {
        self.destroyed.lock().unwrap().push(instance.clone());
        Ok(())
    }
}

/// Creates a store containing the `python` environment and the functions `hello@v1` and
/// `hello@v2`.
pub fn hello_world() -> Arc<InMemoryMetadataStore> {
    let store = InMemoryMetadataStore::new();
    let python = environment("python", "e1", "python-env:latest");
    store.add_function(function("hello", "v1", &python));
    store.add_function(function("hello", "v2", &python));
    store.add_environment(python);
    Arc::new(store)
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
