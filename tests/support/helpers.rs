use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use futures::future::BoxFuture;
use nodesweep::{
    Account, AccountService, AccountServiceFactory, AccountSource, BatchScheduler, EngineConfig,
    PointsSnapshot, ProxyRotator, RemoteStep, Telemetry, WorkerPool,
};
use once_cell::sync::Lazy;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub fn accounts(n: usize) -> Vec<Account> {
    (0..n)
        .map(|i| Account::new(address(i), format!("key-{i}")))
        .collect()
}

pub fn address(i: usize) -> String {
    format!("0x{i:04}")
}

/// In-memory account table with failure injection.
#[derive(Default)]
pub struct MemorySource {
    accounts: Mutex<Vec<Account>>,
    failing_offsets: Mutex<HashSet<u64>>,
    page_reads: Mutex<Vec<(u64, u64)>>,
    proof_writes: Mutex<Vec<(String, String)>>,
    fail_updates: AtomicBool,
    panic_on_count: AtomicBool,
    closed: AtomicBool,
}

impl MemorySource {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self {
            accounts: Mutex::new(accounts),
            ..Self::default()
        }
    }

    /// Every read starting at `offset` fails.
    pub fn fail_reads_at(&self, offset: u64) {
        self.failing_offsets.lock().unwrap().insert(offset);
    }

    pub fn fail_updates(&self) {
        self.fail_updates.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_count(&self) {
        self.panic_on_count.store(true, Ordering::SeqCst);
    }

    pub fn push(&self, account: Account) {
        self.accounts.lock().unwrap().push(account);
    }

    pub fn page_reads(&self) -> Vec<(u64, u64)> {
        self.page_reads.lock().unwrap().clone()
    }

    pub fn proof_writes(&self) -> Vec<(String, String)> {
        self.proof_writes.lock().unwrap().clone()
    }

    pub fn proof_of(&self, address: &str) -> Option<String> {
        self.accounts
            .lock()
            .unwrap()
            .iter()
            .find(|account| account.address == address)
            .and_then(|account| account.proof.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl AccountSource for MemorySource {
    fn count(&self) -> BoxFuture<'_, Result<u64>> {
        Box::pin(async move {
            if self.panic_on_count.load(Ordering::SeqCst) {
                panic!("account table vanished");
            }
            Ok(self.accounts.lock().unwrap().len() as u64)
        })
    }

    fn read_page(&self, offset: u64, limit: u64) -> BoxFuture<'_, Result<Vec<Account>>> {
        Box::pin(async move {
            self.page_reads.lock().unwrap().push((offset, limit));
            if self.failing_offsets.lock().unwrap().contains(&offset) {
                bail!("connection lost while reading offset {offset}");
            }
            let accounts = self.accounts.lock().unwrap();
            Ok(accounts
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect())
        })
    }

    fn update_proof<'a>(&'a self, address: &'a str, proof: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if self.fail_updates.load(Ordering::SeqCst) {
                bail!("update rejected");
            }
            self.proof_writes
                .lock()
                .unwrap()
                .push((address.to_owned(), proof.to_owned()));
            let mut accounts = self.accounts.lock().unwrap();
            let Some(account) = accounts.iter_mut().find(|a| a.address == address) else {
                return Ok(false);
            };
            let changed = account.proof.as_deref() != Some(proof);
            account.proof = Some(proof.to_owned());
            Ok(changed)
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
        })
    }
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed { running: bool },
    FailAt(RemoteStep, &'static str),
    /// Check-in takes this long before the sequence continues.
    Slow(Duration),
    Hang,
    Panic,
}

#[derive(Default)]
struct FactoryLog {
    calls: HashMap<String, Vec<&'static str>>,
    proxies: Vec<(String, Option<String>)>,
}

/// Service factory whose services follow a per-address script.
#[derive(Default)]
pub struct ScriptedFactory {
    behaviors: Mutex<HashMap<String, Behavior>>,
    proof: Option<String>,
    log: Arc<Mutex<FactoryLog>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proof(mut self, proof: &str) -> Self {
        self.proof = Some(proof.to_owned());
        self
    }

    pub fn behave(self, address: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(address.to_owned(), behavior);
        self
    }

    pub fn calls_for(&self, address: &str) -> Vec<&'static str> {
        self.log
            .lock()
            .unwrap()
            .calls
            .get(address)
            .cloned()
            .unwrap_or_default()
    }

    /// How many tasks reached check-in for `address`.
    pub fn check_ins(&self, address: &str) -> usize {
        self.calls_for(address)
            .iter()
            .filter(|op| **op == "check_in")
            .count()
    }

    pub fn proxy_for(&self, address: &str) -> Option<Option<String>> {
        self.log
            .lock()
            .unwrap()
            .proxies
            .iter()
            .rev()
            .find(|(addr, _)| addr == address)
            .map(|(_, proxy)| proxy.clone())
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl AccountServiceFactory for ScriptedFactory {
    type Service = ScriptedService;

    fn connect(&self, account: &Account, proxy: Option<&str>) -> Result<ScriptedService> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&account.address)
            .cloned()
            .unwrap_or(Behavior::Succeed { running: false });
        if let Behavior::FailAt(RemoteStep::Connect, message) = behavior {
            return Err(anyhow!(message));
        }
        self.log
            .lock()
            .unwrap()
            .proxies
            .push((account.address.clone(), proxy.map(str::to_owned)));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        Ok(ScriptedService {
            address: account.address.clone(),
            behavior,
            proof: self.proof.clone(),
            log: self.log.clone(),
            in_flight: self.in_flight.clone(),
            released: false,
        })
    }
}

pub struct ScriptedService {
    address: String,
    behavior: Behavior,
    proof: Option<String>,
    log: Arc<Mutex<FactoryLog>>,
    in_flight: Arc<AtomicUsize>,
    released: bool,
}

impl ScriptedService {
    fn record(&self, op: &'static str) {
        self.log
            .lock()
            .unwrap()
            .calls
            .entry(self.address.clone())
            .or_default()
            .push(op);
    }

    async fn step(&self, step: RemoteStep, op: &'static str) -> Result<()> {
        self.record(op);
        match &self.behavior {
            Behavior::FailAt(failing, message) if *failing == step => Err(anyhow!(*message)),
            Behavior::Slow(delay) if step == RemoteStep::CheckIn => {
                tokio::time::sleep(*delay).await;
                Ok(())
            }
            Behavior::Hang if step == RemoteStep::CheckIn => {
                futures::future::pending::<()>().await;
                Ok(())
            }
            Behavior::Panic if step == RemoteStep::CheckIn => panic!("scripted worker crash"),
            _ => Ok(()),
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for ScriptedService {
    fn drop(&mut self) {
        self.release();
    }
}

impl AccountService for ScriptedService {
    fn check_in(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.step(RemoteStep::CheckIn, "check_in"))
    }

    fn node_running(&mut self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            self.step(RemoteStep::QueryRunningState, "node_running")
                .await?;
            Ok(matches!(self.behavior, Behavior::Succeed { running: true }))
        })
    }

    fn stop_node(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.step(RemoteStep::Stop, "stop_node"))
    }

    fn connect_node(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.step(RemoteStep::Reconnect, "connect_node"))
    }

    fn node_points(&mut self) -> BoxFuture<'_, Result<PointsSnapshot>> {
        Box::pin(async move {
            self.step(RemoteStep::QueryPoints, "node_points").await?;
            Ok(PointsSnapshot {
                points: 100,
                referral_code: Some("REF".into()),
                referral_count: 2,
            })
        })
    }

    fn fetch_proof(&mut self) -> BoxFuture<'_, Result<Option<String>>> {
        Box::pin(async move {
            self.step(RemoteStep::FetchProof, "fetch_proof").await?;
            Ok(self.proof.clone())
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record("close");
            self.release();
        })
    }
}

/// A scheduler wired to a fresh pool, ready for `run_pass` once the pool is initialized.
pub struct Harness<F: AccountServiceFactory> {
    pub scheduler: BatchScheduler<MemorySource, F>,
    pub pool: Arc<WorkerPool<F>>,
    pub source: Arc<MemorySource>,
    pub factory: Arc<F>,
    pub telemetry: Arc<Telemetry>,
    pub shutdown: CancellationToken,
}

impl<F: AccountServiceFactory> Harness<F> {
    pub async fn start(
        config: EngineConfig,
        source: MemorySource,
        factory: F,
        proxies: &[&str],
    ) -> Result<Self> {
        let source = Arc::new(source);
        let factory = Arc::new(factory);
        let telemetry = Arc::new(Telemetry::default());
        let shutdown = CancellationToken::new();
        let pool = Arc::new(WorkerPool::from_config(
            factory.clone(),
            &config,
            telemetry.clone(),
            shutdown.child_token(),
        ));
        pool.initialize(config.worker_count()).await?;

        let scheduler = BatchScheduler::new(
            source.clone(),
            pool.clone(),
            ProxyRotator::new(proxies.iter().copied()),
            config,
            telemetry.clone(),
            shutdown.clone(),
        );

        Ok(Self {
            scheduler,
            pool,
            source,
            factory,
            telemetry,
            shutdown,
        })
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.pool.shutdown().await;
    }
}

pub fn fast_config(workers: usize) -> EngineConfig {
    EngineConfig::builder()
        .worker_count(workers)
        .task_timeout(Duration::from_secs(5))
        .without_delays()
        .build()
        .expect("valid test config")
}
