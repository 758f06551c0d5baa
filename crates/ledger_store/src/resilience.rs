//! Admission control, statement timeouts, retries and the circuit breaker.
//!
//! Every backend call made by the store goes through [`ResilienceController::run`]
//! (or `run_idempotent`). The controller knows nothing about SQL; it wraps any
//! future returning `LedgerResult`, which is what the tests drive with fake
//! executors and a [`ManualClock`].

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use permit_ledger_core::{
    BreakerSnapshot, BreakerState, LedgerError, LedgerResult, PoolHealth,
};

use crate::config::{BreakerSettings, PoolSettings};

const RETRY_BACKOFF_MAX_MS: u64 = 5_000;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Test clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        self.base + offset
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    settings: BreakerSettings,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

/// Admission granted by the breaker. Must be settled with the call outcome;
/// dropping an unsettled probe hands the probe slot to the next caller.
pub struct BreakerTicket<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl BreakerTicket<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn settle<T>(mut self, result: &LedgerResult<T>) {
        self.settled = true;
        match result {
            Err(err) if err.is_transient() => self.breaker.record_failure(self.probe),
            _ => self.breaker.record_success(self.probe),
        }
    }
}

impl Drop for BreakerTicket<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            let mut inner = self.breaker.lock();
            inner.probe_in_flight = false;
            inner.state = BreakerState::Open;
        }
    }
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn admit(&self) -> LedgerResult<BreakerTicket<'_>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let probe = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open | BreakerState::HalfOpen => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|opened| now.duration_since(opened) >= self.settings.cooldown);
                if !cooled || inner.probe_in_flight {
                    return Err(LedgerError::circuit_open(format!(
                        "backend unavailable after {} consecutive failures",
                        inner.failures.len()
                    )));
                }
                inner.state = BreakerState::HalfOpen;
                inner.probe_in_flight = true;
                true
            }
        };
        Ok(BreakerTicket {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn record_success(&self, probe: bool) {
        let mut inner = self.lock();
        if probe {
            log::info!("circuit breaker closed after successful probe");
            inner.probe_in_flight = false;
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
        }
        if inner.state == BreakerState::Closed {
            inner.failures.clear();
        }
    }

    fn record_failure(&self, probe: bool) {
        let now = self.clock.now();
        let mut inner = self.lock();
        if probe {
            log::warn!("circuit breaker probe failed; reopening");
            inner.probe_in_flight = false;
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
            return;
        }
        if inner.state != BreakerState::Closed {
            return;
        }
        inner.failures.push_back(now);
        let window = self.settings.window;
        while inner
            .failures
            .front()
            .is_some_and(|first| now.duration_since(*first) > window)
        {
            inner.failures.pop_front();
        }
        if inner.failures.len() as u32 >= self.settings.failure_threshold {
            log::warn!(
                "circuit breaker opened after {} failures within {:?}",
                inner.failures.len(),
                window
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.failures.len() as u32,
            failure_threshold: self.settings.failure_threshold,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lane {
    Read,
    Write,
}

/// Bounds concurrent backend work. Writers draw only from the shared slots;
/// readers may also use the reserved ones, so ingestion never starves reads.
pub struct AdmissionGate {
    shared: Arc<Semaphore>,
    reserved: Arc<Semaphore>,
    settings: PoolSettings,
}

pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(settings: PoolSettings) -> Self {
        let reserved = settings.read_reserved.min(settings.max_connections.saturating_sub(1));
        let shared = settings.max_connections - reserved;
        Self {
            shared: Arc::new(Semaphore::new(shared as usize)),
            reserved: Arc::new(Semaphore::new(reserved as usize)),
            settings: PoolSettings {
                read_reserved: reserved,
                ..settings
            },
        }
    }

    pub async fn acquire(&self, lane: Lane) -> LedgerResult<Admission> {
        let wait = self.settings.acquire_timeout;
        let permit = match lane {
            Lane::Write => tokio::time::timeout(wait, self.shared.clone().acquire_owned()).await,
            Lane::Read => {
                if let Ok(permit) = self.reserved.clone().try_acquire_owned() {
                    return Ok(Admission { _permit: permit });
                }
                let shared = self.shared.clone();
                let reserved = self.reserved.clone();
                tokio::time::timeout(wait, async move {
                    tokio::select! {
                        permit = shared.acquire_owned() => permit,
                        permit = reserved.acquire_owned() => permit,
                    }
                })
                .await
            }
        };
        match permit {
            Ok(Ok(permit)) => Ok(Admission { _permit: permit }),
            Ok(Err(_)) => Err(LedgerError::storage("connection pool is closed")),
            Err(_) => Err(LedgerError::timeout(format!(
                "no {lane:?} connection slot within {wait:?}"
            ))),
        }
    }

    pub fn close(&self) {
        self.shared.close();
        self.reserved.close();
    }

    pub fn health(&self) -> PoolHealth {
        let available =
            (self.shared.available_permits() + self.reserved.available_permits()) as u32;
        let max = self.settings.max_connections;
        PoolHealth {
            healthy: !self.shared.is_closed(),
            min: self.settings.min_connections,
            max,
            in_use: max.saturating_sub(available),
            available,
            read_reserved: self.settings.read_reserved,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_millis() as u64;
        if attempt <= 1 {
            return Duration::from_millis(base.min(RETRY_BACKOFF_MAX_MS));
        }
        let shift = (attempt - 1).min(10);
        let value = base.saturating_mul(1_u64 << shift);
        Duration::from_millis(value.min(RETRY_BACKOFF_MAX_MS))
    }
}

pub struct ResilienceController {
    gate: AdmissionGate,
    breaker: CircuitBreaker,
    statement_timeout: Duration,
    retry: RetryPolicy,
}

impl ResilienceController {
    pub fn new(
        pool: PoolSettings,
        breaker: BreakerSettings,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gate: AdmissionGate::new(pool),
            breaker: CircuitBreaker::new(breaker, clock),
            statement_timeout: pool.statement_timeout,
            retry,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn pool_health(&self) -> PoolHealth {
        self.gate.health()
    }

    pub fn close(&self) {
        self.gate.close();
    }

    /// One controlled call: breaker admission, a connection slot, and the
    /// statement timeout. Not retried.
    pub async fn run<T, F, Fut>(&self, lane: Lane, operation: &str, call: F) -> LedgerResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let ticket = self.breaker.admit()?;
        // Slot starvation is local back-pressure, not a backend failure.
        let admission = self.gate.acquire(lane).await?;
        let result = match tokio::time::timeout(self.statement_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::timeout(format!(
                "{operation} exceeded {:?}",
                self.statement_timeout
            ))),
        };
        drop(admission);
        ticket.settle(&result);
        result
    }

    /// Like [`run`](Self::run), retrying transient failures with exponential backoff.
    /// Only for operations that are safe to repeat.
    pub async fn run_idempotent<T, F, Fut>(
        &self,
        lane: Lane,
        operation: &str,
        mut call: F,
    ) -> LedgerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.run(lane, operation, &mut call).await {
                Err(err) if err.is_transient() && attempt < attempts => {
                    let delay = self.retry.backoff(attempt);
                    log::warn!(
                        "{operation} failed (attempt {attempt}/{attempts}), retrying in {delay:?}: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
