//! Backend multiplexer: registry, selection strategies, fallback, fan-out,
//! and a per-backend circuit breaker.
//!
//! The Router satisfies the backend contract itself, so a Bridge can hold a
//! Router wherever it would hold a concrete backend.

use crate::adapter::{BackendAdapter, ChunkStream};
use crate::capability::CapabilityDescriptor;
use crate::error::{ChatError, FailoverAttempts};
use crate::ir::{IrChatRequest, IrChatResponse};
use futures::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Request-metadata key carrying the caller's preferred backend
pub const PREFERRED_BACKEND_KEY: &str = "preferredBackend";
/// Request-metadata key carrying an explicit routing hint
pub const BACKEND_HINT_KEY: &str = "backend";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingStrategy {
    /// Always the configured default backend
    #[default]
    Default,
    /// Honor the request's routing hint
    Explicit,
    /// Exact model mapping first, then pattern list in order
    ModelBased,
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackStrategy {
    #[default]
    None,
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutMode {
    /// Await every backend and return all outcomes
    All,
    /// First success wins, the rest are cancelled
    Race,
    /// First N successes win, the rest are cancelled
    FastestN(usize),
}

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub name: String,
    pub default_backend: Option<String>,
    pub routing_strategy: RoutingStrategy,
    pub fallback_strategy: FallbackStrategy,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            name: "router".to_string(),
            default_backend: None,
            routing_strategy: RoutingStrategy::Default,
            fallback_strategy: FallbackStrategy::None,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-backend counters, readable while requests are in flight
#[derive(Debug, Clone, Default)]
pub struct BackendStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_latency_ms: Option<u64>,
    pub avg_latency_ms: Option<f64>,
}

/// Externally visible breaker phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Breaker {
    Closed,
    Open { until: Instant },
    HalfOpen { probing: bool },
}

impl Breaker {
    fn state(&self) -> BreakerState {
        match self {
            Breaker::Closed => BreakerState::Closed,
            Breaker::Open { .. } => BreakerState::Open,
            Breaker::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
}

/// Snapshot returned by `backend_info`
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub name: String,
    pub provider: String,
    pub capabilities: CapabilityDescriptor,
    pub stats: BackendStats,
    pub breaker_state: BreakerState,
}

/// One fan-out outcome, tagged with the backend that produced it
#[derive(Debug)]
pub struct FanOutResult {
    pub backend: String,
    pub result: Result<IrChatResponse, ChatError>,
    pub latency_ms: u64,
}

struct BackendEntry {
    name: String,
    adapter: Arc<dyn BackendAdapter>,
    stats: BackendStats,
    breaker: Breaker,
}

#[derive(Default)]
struct RouterState {
    backends: Vec<BackendEntry>,
    fallback_chain: Vec<String>,
    model_mapping: HashMap<String, String>,
    model_patterns: Vec<(Regex, String)>,
}

impl RouterState {
    fn entry(&self, name: &str) -> Option<&BackendEntry> {
        self.backends.iter().find(|e| e.name == name)
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut BackendEntry> {
        self.backends.iter_mut().find(|e| e.name == name)
    }

    /// Breaker-aware availability; expiry moves an open breaker to
    /// half-open, and selecting a half-open backend claims its single probe.
    fn claim(&mut self, name: &str, now: Instant) -> Option<Arc<dyn BackendAdapter>> {
        let entry = self.entry_mut(name)?;
        match entry.breaker {
            Breaker::Closed => Some(entry.adapter.clone()),
            Breaker::Open { until } if now >= until => {
                entry.breaker = Breaker::HalfOpen { probing: true };
                Some(entry.adapter.clone())
            }
            Breaker::Open { .. } => None,
            Breaker::HalfOpen { probing: false } => {
                entry.breaker = Breaker::HalfOpen { probing: true };
                Some(entry.adapter.clone())
            }
            Breaker::HalfOpen { probing: true } => None,
        }
    }

    fn is_available(&self, name: &str, now: Instant) -> bool {
        match self.entry(name).map(|e| e.breaker) {
            Some(Breaker::Closed) => true,
            Some(Breaker::Open { until }) => now >= until,
            Some(Breaker::HalfOpen { probing }) => !probing,
            None => false,
        }
    }
}

pub struct Router {
    state: Arc<RwLock<RouterState>>,
    config: RouterConfig,
    round_robin: Arc<AtomicUsize>,
    capabilities: CapabilityDescriptor,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(RouterState::default())),
            config,
            round_robin: Arc::new(AtomicUsize::new(0)),
            capabilities: CapabilityDescriptor::permissive(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// A new router over the same backend map with a reconfigured policy.
    pub fn clone_with<F>(&self, reconfigure: F) -> Self
    where
        F: FnOnce(&mut RouterConfig),
    {
        let mut config = self.config.clone();
        reconfigure(&mut config);
        Self {
            state: self.state.clone(),
            config,
            round_robin: self.round_robin.clone(),
            capabilities: CapabilityDescriptor::permissive(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, RouterState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, RouterState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // ========================= admin operations =========================

    pub fn register(
        &self,
        name: impl Into<String>,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Result<(), ChatError> {
        let name = name.into();
        let mut state = self.write();
        if state.entry(&name).is_some() {
            return Err(ChatError::validation(
                "duplicate_backend",
                format!("backend '{}' is already registered", name),
            ));
        }
        state.backends.push(BackendEntry {
            name,
            adapter,
            stats: BackendStats::default(),
            breaker: Breaker::Closed,
        });
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<(), ChatError> {
        let mut state = self.write();
        if state.entry(name).is_none() {
            return Err(ChatError::validation(
                "unknown_backend",
                format!("backend '{}' is not registered", name),
            ));
        }
        if self.config.default_backend.as_deref() == Some(name) {
            return Err(ChatError::validation(
                "cannot_remove_default",
                format!("backend '{}' is the default backend", name),
            ));
        }
        if state.backends.len() == 1 {
            return Err(ChatError::validation(
                "cannot_remove_last",
                "refusing to remove the only registered backend",
            ));
        }
        state.backends.retain(|e| e.name != name);
        state.fallback_chain.retain(|n| n != name);
        Ok(())
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.read().backends.iter().map(|e| e.name.clone()).collect()
    }

    pub fn set_model_mapping(&self, mapping: HashMap<String, String>) -> Result<(), ChatError> {
        let mut state = self.write();
        for backend in mapping.values() {
            if state.entry(backend).is_none() {
                return Err(ChatError::validation(
                    "unknown_backend",
                    format!("model mapping names unregistered backend '{}'", backend),
                ));
            }
        }
        state.model_mapping = mapping;
        Ok(())
    }

    pub fn set_model_patterns(&self, patterns: Vec<(String, String)>) -> Result<(), ChatError> {
        let mut compiled = Vec::with_capacity(patterns.len());
        {
            let state = self.read();
            for (pattern, backend) in &patterns {
                if state.entry(backend).is_none() {
                    return Err(ChatError::validation(
                        "unknown_backend",
                        format!("model pattern names unregistered backend '{}'", backend),
                    ));
                }
                let regex = Regex::new(pattern).map_err(|e| {
                    ChatError::validation(
                        "bad_pattern",
                        format!("invalid model pattern '{}': {}", pattern, e),
                    )
                })?;
                compiled.push((regex, backend.clone()));
            }
        }
        self.write().model_patterns = compiled;
        Ok(())
    }

    pub fn set_fallback_chain(&self, chain: Vec<String>) -> Result<(), ChatError> {
        let mut state = self.write();
        for name in &chain {
            if state.entry(name).is_none() {
                return Err(ChatError::validation(
                    "unknown_backend",
                    format!("fallback chain names unregistered backend '{}'", name),
                ));
            }
        }
        state.fallback_chain = chain;
        Ok(())
    }

    pub fn open_circuit_breaker(&self, name: &str) {
        if let Some(entry) = self.write().entry_mut(name) {
            entry.breaker = Breaker::Open {
                until: Instant::now() + self.config.circuit_breaker_timeout,
            };
        }
    }

    pub fn close_circuit_breaker(&self, name: &str) {
        if let Some(entry) = self.write().entry_mut(name) {
            entry.breaker = Breaker::Closed;
        }
    }

    pub fn reset_circuit_breaker(&self, name: &str) {
        if let Some(entry) = self.write().entry_mut(name) {
            entry.breaker = Breaker::Closed;
            entry.stats.consecutive_failures = 0;
        }
    }

    pub fn breaker_state(&self, name: &str) -> Option<BreakerState> {
        self.read().entry(name).map(|e| e.breaker.state())
    }

    pub fn get_stats(&self) -> HashMap<String, BackendStats> {
        self.read()
            .backends
            .iter()
            .map(|e| (e.name.clone(), e.stats.clone()))
            .collect()
    }

    pub fn backend_info(&self, name: &str) -> Option<BackendInfo> {
        let state = self.read();
        state.entry(name).map(|e| BackendInfo {
            name: e.name.clone(),
            provider: e.adapter.provider().to_string(),
            capabilities: e.adapter.capabilities().clone(),
            stats: e.stats.clone(),
            breaker_state: e.breaker.state(),
        })
    }

    pub async fn check_health(&self) -> HashMap<String, bool> {
        let adapters: Vec<(String, Arc<dyn BackendAdapter>)> = self
            .read()
            .backends
            .iter()
            .map(|e| (e.name.clone(), e.adapter.clone()))
            .collect();
        let checks = adapters.into_iter().map(|(name, adapter)| async move {
            let healthy = adapter.health_check().await;
            (name, healthy)
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }

    // ========================= selection =========================

    /// Pick a backend for the request, honoring preference, strategy, and
    /// breaker state. A half-open pick claims that breaker's single probe.
    pub fn select_backend(
        &self,
        request: &IrChatRequest,
    ) -> Result<(String, Arc<dyn BackendAdapter>), ChatError> {
        let now = Instant::now();
        let mut state = self.write();
        if state.backends.is_empty() {
            return Err(
                ChatError::no_available_backend("no backends registered")
                    .with_router(&self.config.name),
            );
        }

        // caller preference comes first and fails loudly on an open breaker
        if let Some(preferred) = request
            .metadata
            .custom
            .get(PREFERRED_BACKEND_KEY)
            .and_then(|v| v.as_str())
        {
            if state.entry(preferred).is_some() {
                return match state.claim(preferred, now) {
                    Some(adapter) => Ok((preferred.to_string(), adapter)),
                    None => {
                        Err(ChatError::circuit_open(preferred).with_router(&self.config.name))
                    }
                };
            }
        }

        match self.config.routing_strategy {
            RoutingStrategy::Explicit => {
                if let Some(hint) = request
                    .metadata
                    .custom
                    .get(BACKEND_HINT_KEY)
                    .and_then(|v| v.as_str())
                {
                    if state.entry(hint).is_some() {
                        return match state.claim(hint, now) {
                            Some(adapter) => Ok((hint.to_string(), adapter)),
                            None => Err(
                                ChatError::circuit_open(hint).with_router(&self.config.name)
                            ),
                        };
                    }
                    return Err(ChatError::no_available_backend(format!(
                        "routing hint names unregistered backend '{}'",
                        hint
                    ))
                    .with_router(&self.config.name));
                }
                self.select_default(&mut state, now)
            }
            RoutingStrategy::ModelBased => {
                if let Some(model) = request.parameters.model.as_deref() {
                    if let Some(target) = state.model_mapping.get(model).cloned() {
                        if let Some(adapter) = state.claim(&target, now) {
                            return Ok((target, adapter));
                        }
                    }
                    let pattern_hit = state
                        .model_patterns
                        .iter()
                        .find(|(regex, backend)| {
                            regex.is_match(model) && state.is_available(backend, now)
                        })
                        .map(|(_, backend)| backend.clone());
                    if let Some(target) = pattern_hit {
                        if let Some(adapter) = state.claim(&target, now) {
                            return Ok((target, adapter));
                        }
                    }
                }
                self.select_default(&mut state, now)
            }
            RoutingStrategy::RoundRobin => {
                let len = state.backends.len();
                let start = self.round_robin.fetch_add(1, Ordering::SeqCst) % len;
                for offset in 0..len {
                    let name = state.backends[(start + offset) % len].name.clone();
                    if let Some(adapter) = state.claim(&name, now) {
                        return Ok((name, adapter));
                    }
                }
                Err(
                    ChatError::no_available_backend("every backend has an open circuit")
                        .with_router(&self.config.name),
                )
            }
            RoutingStrategy::Default => self.select_default(&mut state, now),
        }
    }

    fn select_default(
        &self,
        state: &mut RouterState,
        now: Instant,
    ) -> Result<(String, Arc<dyn BackendAdapter>), ChatError> {
        let name = self.config.default_backend.clone().ok_or_else(|| {
            ChatError::no_available_backend("no default backend configured")
                .with_router(&self.config.name)
        })?;
        if state.entry(&name).is_none() {
            return Err(ChatError::no_available_backend(format!(
                "default backend '{}' is not registered",
                name
            ))
            .with_router(&self.config.name));
        }
        match state.claim(&name, now) {
            Some(adapter) => Ok((name, adapter)),
            None => Err(ChatError::circuit_open(&name).with_router(&self.config.name)),
        }
    }

    // ========================= stats & breaker updates =========================

    fn record_success(&self, name: &str, latency_ms: Option<u64>) {
        let mut state = self.write();
        if let Some(entry) = state.entry_mut(name) {
            entry.stats.total_requests += 1;
            entry.stats.success_count += 1;
            entry.stats.consecutive_failures = 0;
            if let Some(latency_ms) = latency_ms {
                entry.stats.last_latency_ms = Some(latency_ms);
                entry.stats.avg_latency_ms = Some(match entry.stats.avg_latency_ms {
                    Some(avg) => {
                        let n = entry.stats.success_count as f64;
                        (avg * (n - 1.0) + latency_ms as f64) / n
                    }
                    None => latency_ms as f64,
                });
            }
            entry.breaker = Breaker::Closed;
        }
    }

    fn record_failure(&self, name: &str) {
        let threshold = self.config.circuit_breaker_threshold;
        let timeout = self.config.circuit_breaker_timeout;
        let mut state = self.write();
        if let Some(entry) = state.entry_mut(name) {
            entry.stats.total_requests += 1;
            entry.stats.failure_count += 1;
            entry.stats.consecutive_failures += 1;
            let failed_probe = matches!(entry.breaker, Breaker::HalfOpen { .. });
            if failed_probe || entry.stats.consecutive_failures >= threshold {
                entry.breaker = Breaker::Open {
                    until: Instant::now() + timeout,
                };
            }
        }
    }

    /// Release a claimed half-open probe that never ran (selection succeeded
    /// but the attempt was abandoned, e.g. on cancellation).
    fn release_probe(&self, name: &str) {
        let mut state = self.write();
        if let Some(entry) = state.entry_mut(name) {
            if let Breaker::HalfOpen { probing: true } = entry.breaker {
                entry.breaker = Breaker::HalfOpen { probing: false };
            }
        }
    }

    async fn attempt(
        &self,
        name: &str,
        adapter: Arc<dyn BackendAdapter>,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<IrChatResponse, ChatError> {
        let started = Instant::now();
        match adapter.execute(request, cancel).await {
            Ok(mut response) => {
                let latency = started.elapsed().as_millis() as u64;
                self.record_success(name, Some(latency));
                response.metadata.provenance.router = Some(self.config.name.clone());
                Ok(response)
            }
            Err(err) => {
                if err.is_cancelled() {
                    // cancellations say nothing about backend health
                    self.release_probe(name);
                } else {
                    self.record_failure(name);
                }
                Err(err.with_router(&self.config.name))
            }
        }
    }

    // ========================= execution =========================

    pub async fn execute_request(
        &self,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<IrChatResponse, ChatError> {
        let (primary, adapter) = self.select_backend(request)?;
        let first_error = match self.attempt(&primary, adapter, request, cancel).await {
            Ok(response) => return Ok(response),
            Err(err) => err,
        };

        if !first_error.retryable
            || self.config.fallback_strategy == FallbackStrategy::None
        {
            return Err(first_error);
        }

        let chain: Vec<String> = self
            .read()
            .fallback_chain
            .iter()
            .filter(|name| **name != primary)
            .cloned()
            .collect();
        if chain.is_empty() {
            return Err(first_error);
        }

        match self.config.fallback_strategy {
            FallbackStrategy::Sequential => {
                self.fallback_sequential(chain, first_error, request, cancel)
                    .await
            }
            FallbackStrategy::Parallel => {
                self.fallback_parallel(chain, first_error, request, cancel)
                    .await
            }
            FallbackStrategy::None => unreachable!(),
        }
    }

    async fn fallback_sequential(
        &self,
        chain: Vec<String>,
        first_error: ChatError,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<IrChatResponse, ChatError> {
        let mut attempts = vec![first_error];
        for name in chain {
            let claimed = {
                let mut state = self.write();
                state.claim(&name, Instant::now())
            };
            let Some(adapter) = claimed else {
                attempts.push(ChatError::circuit_open(&name).with_router(&self.config.name));
                continue;
            };
            log::info!(
                "falling back id={} backend={}",
                request.metadata.request_id,
                name
            );
            match self.attempt(&name, adapter, request, cancel).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let stop = !err.retryable;
                    attempts.push(err);
                    if stop {
                        break;
                    }
                }
            }
        }
        Err(self.aggregate(attempts))
    }

    async fn fallback_parallel(
        &self,
        chain: Vec<String>,
        first_error: ChatError,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<IrChatResponse, ChatError> {
        let mut attempts = vec![first_error];
        let mut in_flight = FuturesUnordered::new();
        let mut child_tokens = Vec::new();

        for name in chain {
            let claimed = {
                let mut state = self.write();
                state.claim(&name, Instant::now())
            };
            let Some(adapter) = claimed else {
                attempts.push(ChatError::circuit_open(&name).with_router(&self.config.name));
                continue;
            };
            let child = cancel.child_token();
            child_tokens.push(child.clone());
            let request = request.clone();
            in_flight.push(async move {
                let result = self.attempt(&name, adapter, &request, &child).await;
                (name, result)
            });
        }

        while let Some((_, result)) = in_flight.next().await {
            match result {
                Ok(response) => {
                    // winner takes it; cancel the rest
                    for token in &child_tokens {
                        token.cancel();
                    }
                    return Ok(response);
                }
                Err(err) => attempts.push(err),
            }
        }
        Err(self.aggregate(attempts))
    }

    fn aggregate(&self, attempts: Vec<ChatError>) -> ChatError {
        let mut err = ChatError::no_available_backend(format!(
            "all {} attempted backends failed",
            attempts.len()
        ))
        .with_router(&self.config.name);
        err.cause = Some(Box::new(FailoverAttempts(attempts)));
        err
    }

    /// Fan a request out to several backends at once.
    pub async fn dispatch_parallel(
        &self,
        request: &IrChatRequest,
        backends: Option<Vec<String>>,
        mode: FanOutMode,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<Vec<FanOutResult>, ChatError> {
        let targets: Vec<String> = match backends {
            Some(names) => {
                let state = self.read();
                for name in &names {
                    if state.entry(name).is_none() {
                        return Err(ChatError::validation(
                            "unknown_backend",
                            format!("fan-out names unregistered backend '{}'", name),
                        ));
                    }
                }
                names
            }
            None => self.backend_names(),
        };
        if targets.is_empty() {
            return Err(ChatError::no_available_backend("nothing to fan out to")
                .with_router(&self.config.name));
        }

        let run = self.fan_out(targets, request, mode, cancel);
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(results) => results,
                Err(_) => {
                    cancel.cancel();
                    Err(ChatError::timeout(format!(
                        "fan-out exceeded {:?}",
                        limit
                    ))
                    .with_router(&self.config.name))
                }
            },
            None => run.await,
        }
    }

    async fn fan_out(
        &self,
        targets: Vec<String>,
        request: &IrChatRequest,
        mode: FanOutMode,
        cancel: &CancellationToken,
    ) -> Result<Vec<FanOutResult>, ChatError> {
        let mut in_flight = FuturesUnordered::new();
        let mut child_tokens = Vec::new();

        for name in targets {
            let adapter = {
                let mut state = self.write();
                state.claim(&name, Instant::now())
            };
            let child = cancel.child_token();
            child_tokens.push(child.clone());
            let request = request.clone();
            in_flight.push(async move {
                let started = Instant::now();
                let result = match adapter {
                    Some(adapter) => self.attempt(&name, adapter, &request, &child).await,
                    None => Err(ChatError::circuit_open(&name)),
                };
                FanOutResult {
                    backend: name,
                    latency_ms: started.elapsed().as_millis() as u64,
                    result,
                }
            });
        }

        let wanted = match mode {
            FanOutMode::All => usize::MAX,
            FanOutMode::Race => 1,
            FanOutMode::FastestN(n) => n.max(1),
        };

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        while let Some(outcome) = in_flight.next().await {
            if outcome.result.is_ok() {
                successes.push(outcome);
                if successes.len() >= wanted {
                    for token in &child_tokens {
                        token.cancel();
                    }
                    break;
                }
            } else {
                failures.push(outcome);
            }
        }

        match mode {
            FanOutMode::All => {
                successes.extend(failures);
                Ok(successes)
            }
            FanOutMode::Race | FanOutMode::FastestN(_) => {
                if successes.is_empty() {
                    let attempts = failures
                        .into_iter()
                        .map(|f| f.result.unwrap_err())
                        .collect();
                    Err(self.aggregate(attempts))
                } else {
                    Ok(successes)
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl BackendAdapter for Router {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider(&self) -> &str {
        "router"
    }

    fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    async fn execute(
        &self,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<IrChatResponse, ChatError> {
        self.execute_request(request, cancel).await
    }

    async fn execute_stream(
        &self,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ChatError> {
        let (name, adapter) = self.select_backend(request)?;
        match adapter.execute_stream(request, cancel).await {
            Ok(stream) => {
                // a successfully opened stream counts as one served request
                self.record_success(&name, None);
                Ok(stream)
            }
            Err(err) => {
                if err.is_cancelled() {
                    self.release_probe(&name);
                } else {
                    self.record_failure(&name);
                }
                Err(err.with_router(&self.config.name))
            }
        }
    }

    async fn health_check(&self) -> bool {
        self.check_health().await.values().any(|healthy| *healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TextStreamBackend;
    use crate::ir::{IrMessage, RequestMetadata};

    /// Always fails with a retryable server error.
    struct FailingBackend {
        name: String,
        capabilities: CapabilityDescriptor,
    }

    impl FailingBackend {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                capabilities: CapabilityDescriptor::default(),
            }
        }
    }

    #[async_trait::async_trait]
    impl BackendAdapter for FailingBackend {
        fn name(&self) -> &str {
            &self.name
        }

        fn provider(&self) -> &str {
            "mock"
        }

        fn capabilities(&self) -> &CapabilityDescriptor {
            &self.capabilities
        }

        async fn execute(
            &self,
            _request: &IrChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<IrChatResponse, ChatError> {
            Err(ChatError::server("backend down").with_backend(&self.name))
        }

        async fn execute_stream(
            &self,
            _request: &IrChatRequest,
            _cancel: &CancellationToken,
        ) -> Result<ChunkStream, ChatError> {
            Err(ChatError::server("backend down").with_backend(&self.name))
        }

        async fn health_check(&self) -> bool {
            false
        }
    }

    fn ok_backend(name: &str, reply: &str) -> Arc<dyn BackendAdapter> {
        Arc::new(TextStreamBackend::from_deltas(name, vec![reply]))
    }

    fn request() -> IrChatRequest {
        IrChatRequest::new(
            vec![IrMessage::user("hi")],
            RequestMetadata::stamped("test"),
        )
    }

    fn router(strategy: RoutingStrategy) -> Router {
        Router::new(RouterConfig {
            routing_strategy: strategy,
            ..RouterConfig::default()
        })
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let r = router(RoutingStrategy::Default);
        r.register("a", ok_backend("a", "x")).unwrap();
        let err = r.register("a", ok_backend("a", "x")).unwrap_err();
        assert_eq!(err.code, "duplicate_backend");
    }

    #[test]
    fn test_unregister_guards() {
        let r = Router::new(RouterConfig {
            default_backend: Some("a".to_string()),
            ..RouterConfig::default()
        });
        r.register("a", ok_backend("a", "x")).unwrap();
        r.register("b", ok_backend("b", "x")).unwrap();

        assert_eq!(r.unregister("a").unwrap_err().code, "cannot_remove_default");
        r.unregister("b").unwrap();
        assert_eq!(r.backend_names(), vec!["a"]);
        // also refuses to remove the last backend even when not the default
        let solo = router(RoutingStrategy::Default);
        solo.register("only", ok_backend("only", "x")).unwrap();
        assert_eq!(
            solo.unregister("only").unwrap_err().code,
            "cannot_remove_last"
        );
    }

    #[test]
    fn test_setters_validate_names() {
        let r = router(RoutingStrategy::ModelBased);
        r.register("a", ok_backend("a", "x")).unwrap();

        assert!(r
            .set_fallback_chain(vec!["missing".to_string()])
            .is_err());
        assert!(r
            .set_model_mapping(HashMap::from([(
                "gpt-4o".to_string(),
                "missing".to_string()
            )]))
            .is_err());
        assert!(r
            .set_model_patterns(vec![("^gpt-".to_string(), "missing".to_string())])
            .is_err());
        assert!(r
            .set_model_patterns(vec![("[invalid".to_string(), "a".to_string())])
            .is_err());

        assert!(r
            .set_model_mapping(HashMap::from([("gpt-4o".to_string(), "a".to_string())]))
            .is_ok());
        assert!(r
            .set_model_patterns(vec![("^gpt-".to_string(), "a".to_string())])
            .is_ok());
        assert!(r.set_fallback_chain(vec!["a".to_string()]).is_ok());
    }

    #[test]
    fn test_round_robin_visits_each_backend_once() {
        let r = router(RoutingStrategy::RoundRobin);
        for name in ["a", "b", "c"] {
            r.register(name, ok_backend(name, "x")).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (name, _) = r.select_backend(&request()).unwrap();
            seen.push(name);
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_skips_open_breaker() {
        let r = router(RoutingStrategy::RoundRobin);
        for name in ["a", "b"] {
            r.register(name, ok_backend(name, "x")).unwrap();
        }
        r.open_circuit_breaker("a");
        for _ in 0..4 {
            let (name, _) = r.select_backend(&request()).unwrap();
            assert_eq!(name, "b");
        }
    }

    #[test]
    fn test_model_based_selection() {
        let r = router(RoutingStrategy::ModelBased);
        r.register("openai", ok_backend("openai", "x")).unwrap();
        r.register("anthropic", ok_backend("anthropic", "x")).unwrap();
        r.set_model_mapping(HashMap::from([(
            "gpt-4o".to_string(),
            "openai".to_string(),
        )]))
        .unwrap();
        r.set_model_patterns(vec![("^claude-".to_string(), "anthropic".to_string())])
            .unwrap();

        let mut ir = request();
        ir.parameters.model = Some("gpt-4o".to_string());
        assert_eq!(r.select_backend(&ir).unwrap().0, "openai");

        ir.parameters.model = Some("claude-sonnet-4-20250514".to_string());
        assert_eq!(r.select_backend(&ir).unwrap().0, "anthropic");
    }

    #[test]
    fn test_preferred_backend_wins() {
        let r = Router::new(RouterConfig {
            default_backend: Some("a".to_string()),
            ..RouterConfig::default()
        });
        r.register("a", ok_backend("a", "x")).unwrap();
        r.register("b", ok_backend("b", "x")).unwrap();

        let mut ir = request();
        ir.metadata
            .custom
            .insert(PREFERRED_BACKEND_KEY.to_string(), serde_json::json!("b"));
        assert_eq!(r.select_backend(&ir).unwrap().0, "b");
    }

    #[test]
    fn test_preferred_open_backend_fails_with_circuit_open() {
        let r = router(RoutingStrategy::Default);
        r.register("a", ok_backend("a", "x")).unwrap();
        r.open_circuit_breaker("a");

        let mut ir = request();
        ir.metadata
            .custom
            .insert(PREFERRED_BACKEND_KEY.to_string(), serde_json::json!("a"));
        let err = r.select_backend(&ir).unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::CircuitOpen);
    }

    #[tokio::test]
    async fn test_sequential_fallback() {
        let r = Router::new(RouterConfig {
            default_backend: Some("b".to_string()),
            fallback_strategy: FallbackStrategy::Sequential,
            ..RouterConfig::default()
        });
        r.register("b", Arc::new(FailingBackend::new("b"))).unwrap();
        r.register("a", ok_backend("a", "saved")).unwrap();
        r.set_fallback_chain(vec!["b".to_string(), "a".to_string()])
            .unwrap();

        let response = r
            .execute_request(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.message.text(), "saved");
        assert_eq!(response.metadata.provenance.router.as_deref(), Some("router"));

        let stats = r.get_stats();
        assert_eq!(stats["b"].failure_count, 1);
        assert_eq!(stats["a"].success_count, 1);
    }

    #[tokio::test]
    async fn test_fallback_none_propagates() {
        let r = Router::new(RouterConfig {
            default_backend: Some("b".to_string()),
            ..RouterConfig::default()
        });
        r.register("b", Arc::new(FailingBackend::new("b"))).unwrap();
        r.register("a", ok_backend("a", "never")).unwrap();
        r.set_fallback_chain(vec!["a".to_string()]).unwrap();

        let err = r
            .execute_request(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::ServerError);
    }

    #[tokio::test]
    async fn test_exhausted_fallback_aggregates() {
        let r = Router::new(RouterConfig {
            default_backend: Some("b".to_string()),
            fallback_strategy: FallbackStrategy::Sequential,
            ..RouterConfig::default()
        });
        r.register("b", Arc::new(FailingBackend::new("b"))).unwrap();
        r.register("c", Arc::new(FailingBackend::new("c"))).unwrap();
        r.set_fallback_chain(vec!["c".to_string()]).unwrap();

        let err = r
            .execute_request(&request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::NoAvailableBackend);
        let cause = err.cause.unwrap();
        assert!(cause.to_string().contains("2 failed attempts"));
    }

    #[tokio::test]
    async fn test_circuit_breaker_lifecycle() {
        let r = Router::new(RouterConfig {
            default_backend: Some("b".to_string()),
            circuit_breaker_threshold: 2,
            circuit_breaker_timeout: Duration::from_millis(100),
            ..RouterConfig::default()
        });
        r.register("b", Arc::new(FailingBackend::new("b"))).unwrap();
        r.register("spare", ok_backend("spare", "x")).unwrap();

        let cancel = CancellationToken::new();
        // two consecutive failures trip the breaker
        for _ in 0..2 {
            r.execute_request(&request(), &cancel).await.unwrap_err();
        }
        assert_eq!(r.breaker_state("b"), Some(BreakerState::Open));

        // while open, forcing selection fails with circuit_open
        let mut preferred = request();
        preferred
            .metadata
            .custom
            .insert(PREFERRED_BACKEND_KEY.to_string(), serde_json::json!("b"));
        let err = r.select_backend(&preferred).unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::CircuitOpen);

        // after the cooldown a single probe is allowed
        tokio::time::sleep(Duration::from_millis(120)).await;
        let (name, _) = r.select_backend(&preferred).unwrap();
        assert_eq!(name, "b");
        // the probe is claimed; a second concurrent force-select is refused
        let err = r.select_backend(&preferred).unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::CircuitOpen);

        // a failed probe re-opens the breaker
        r.record_failure("b");
        assert_eq!(r.breaker_state("b"), Some(BreakerState::Open));

        // a successful probe closes it
        tokio::time::sleep(Duration::from_millis(120)).await;
        r.select_backend(&preferred).unwrap();
        r.record_success("b", Some(5));
        assert_eq!(r.breaker_state("b"), Some(BreakerState::Closed));
    }

    #[tokio::test]
    async fn test_dispatch_parallel_all() {
        let r = router(RoutingStrategy::Default);
        r.register("a", ok_backend("a", "from-a")).unwrap();
        r.register("b", ok_backend("b", "from-b")).unwrap();

        let results = r
            .dispatch_parallel(
                &request(),
                None,
                FanOutMode::All,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        let mut backends: Vec<_> = results.iter().map(|r| r.backend.clone()).collect();
        backends.sort();
        assert_eq!(backends, vec!["a", "b"]);
        assert!(results.iter().all(|r| r.result.is_ok()));
    }

    #[tokio::test]
    async fn test_dispatch_parallel_race_prefers_fast_backend() {
        let r = router(RoutingStrategy::Default);
        let fast = TextStreamBackend::new(
            "fast",
            Arc::new(|_req| {
                Box::pin(async_stream::stream! {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    yield Ok("fast wins".to_string());
                })
            }),
        );
        let slow = TextStreamBackend::new(
            "slow",
            Arc::new(|_req| {
                Box::pin(async_stream::stream! {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    yield Ok("slow loses".to_string());
                })
            }),
        );
        r.register("fast", Arc::new(fast)).unwrap();
        r.register("slow", Arc::new(slow)).unwrap();

        let started = Instant::now();
        let results = r
            .dispatch_parallel(
                &request(),
                None,
                FanOutMode::Race,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].backend, "fast");
        assert_eq!(
            results[0].result.as_ref().unwrap().message.text(),
            "fast wins"
        );
        // the slow sibling was cancelled rather than awaited
        assert!(started.elapsed() < Duration::from_millis(90));
    }

    #[tokio::test]
    async fn test_dispatch_parallel_race_all_failures() {
        let r = router(RoutingStrategy::Default);
        r.register("a", Arc::new(FailingBackend::new("a"))).unwrap();
        r.register("b", Arc::new(FailingBackend::new("b"))).unwrap();

        let err = r
            .dispatch_parallel(
                &request(),
                None,
                FanOutMode::Race,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::NoAvailableBackend);
    }

    #[tokio::test]
    async fn test_dispatch_parallel_timeout() {
        let r = router(RoutingStrategy::Default);
        let slow = TextStreamBackend::new(
            "slow",
            Arc::new(|_req| {
                Box::pin(async_stream::stream! {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    yield Ok("never".to_string());
                })
            }),
        );
        r.register("slow", Arc::new(slow)).unwrap();

        let err = r
            .dispatch_parallel(
                &request(),
                None,
                FanOutMode::All,
                Some(Duration::from_millis(20)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "timeout");
    }

    #[tokio::test]
    async fn test_dispatch_parallel_unknown_backend() {
        let r = router(RoutingStrategy::Default);
        r.register("a", ok_backend("a", "x")).unwrap();
        let err = r
            .dispatch_parallel(
                &request(),
                Some(vec!["nope".to_string()]),
                FanOutMode::All,
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "unknown_backend");
    }

    #[test]
    fn test_clone_shares_backends() {
        let r = Router::new(RouterConfig {
            default_backend: Some("a".to_string()),
            ..RouterConfig::default()
        });
        r.register("a", ok_backend("a", "x")).unwrap();

        let clone = r.clone_with(|config| {
            config.routing_strategy = RoutingStrategy::RoundRobin;
        });
        assert_eq!(clone.backend_names(), vec!["a"]);
        assert_eq!(clone.config().routing_strategy, RoutingStrategy::RoundRobin);
        // registrations through the clone are visible to the original
        clone.register("b", ok_backend("b", "y")).unwrap();
        assert_eq!(r.backend_names().len(), 2);
    }

    #[tokio::test]
    async fn test_router_is_a_backend() {
        let r = Router::new(RouterConfig {
            default_backend: Some("a".to_string()),
            ..RouterConfig::default()
        });
        r.register("a", ok_backend("a", "routed")).unwrap();

        let backend: &dyn BackendAdapter = &r;
        let response = backend
            .execute(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.message.text(), "routed");
        assert_eq!(response.metadata.provenance.router.as_deref(), Some("router"));
    }

    #[tokio::test]
    async fn test_backend_info_and_health() {
        let r = router(RoutingStrategy::Default);
        r.register("a", ok_backend("a", "x")).unwrap();
        r.register("down", Arc::new(FailingBackend::new("down")))
            .unwrap();

        let info = r.backend_info("a").unwrap();
        assert_eq!(info.name, "a");
        assert_eq!(info.breaker_state, BreakerState::Closed);
        assert!(r.backend_info("missing").is_none());

        let health = r.check_health().await;
        assert_eq!(health["a"], true);
        assert_eq!(health["down"], false);
    }
}
