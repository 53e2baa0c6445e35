//! Health-checked pool of LLM endpoints.
//!
//! Selection is round-robin over entries that are not unhealthy and have a
//! free concurrency slot. An entry turns unhealthy after `failure_threshold`
//! consecutive failures and sits out `cooldown`; the next acquire after the
//! cooldown launches a background probe and a successful probe makes it
//! healthy again. With probing disabled the entry is simply offered again
//! (half-open) once the cooldown has elapsed.
//!
//! Every [`Lease`] holds one slot until it is released. Dropping a lease
//! without calling [`Lease::release`] returns the slot without touching the
//! entry's health.

use futures::StreamExt;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{ChatChunk, ChatMessage, ChatStream, Completion, GenerateOptions, LlmClient, ToolDef};
use crate::config::{Config, PoolConfig};
use crate::error::{Error, ProviderError, Result};
use crate::scope::{Interrupted, Scope};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub probe: bool,
    pub max_retries: u32,
    pub acquire_timeout: Duration,
}

impl From<&PoolConfig> for PoolSettings {
    fn from(c: &PoolConfig) -> Self {
        Self {
            failure_threshold: c.failure_threshold.max(1),
            cooldown: Duration::from_secs(c.cooldown_secs),
            probe: c.probe,
            max_retries: c.max_retries,
            acquire_timeout: Duration::from_secs(c.acquire_timeout_secs),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Snapshot of one entry, as returned by [`ProviderPool::health`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub name: String,
    pub state: HealthState,
    pub in_flight: usize,
    pub max_concurrency: usize,
    pub consecutive_failures: u32,
}

/// How a leased call went, for health accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    /// Slot returned without affecting health (caller error, cancellation).
    Neutral,
}

#[derive(Debug, Default)]
struct EntryState {
    in_flight: usize,
    consecutive_failures: u32,
    unhealthy_since: Option<Instant>,
    probing: bool,
}

struct Entry {
    client: Arc<dyn LlmClient>,
    max_concurrency: usize,
    state: Mutex<EntryState>,
}

struct Shared {
    entries: Vec<Entry>,
    cursor: Mutex<usize>,
    notify: Notify,
    settings: PoolSettings,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

enum Selection {
    Leased(usize),
    /// Nothing selectable; the earliest instant a cooldown ends, if any.
    Wait(Option<Instant>),
}

impl Shared {
    fn select(self: &Arc<Self>, exclude: &[usize]) -> Selection {
        let mut cursor = lock(&self.cursor);
        let n = self.entries.len();
        let now = Instant::now();
        let mut wake: Option<Instant> = None;
        let threshold = self.settings.failure_threshold;

        if self.settings.probe {
            for (i, entry) in self.entries.iter().enumerate() {
                let mut st = lock(&entry.state);
                let cooled = st
                    .unhealthy_since
                    .map_or(true, |since| since + self.settings.cooldown <= now);
                if st.consecutive_failures >= threshold && cooled && !st.probing {
                    st.probing = true;
                    self.spawn_probe(i);
                }
            }
        }

        for offset in 0..n {
            let i = (*cursor + offset) % n;
            if exclude.contains(&i) {
                continue;
            }
            let entry = &self.entries[i];
            let mut st = lock(&entry.state);
            if st.in_flight >= entry.max_concurrency {
                continue;
            }
            if st.consecutive_failures >= threshold {
                let since = st.unhealthy_since.unwrap_or(now);
                let ready_at = since + self.settings.cooldown;
                if now < ready_at {
                    wake = Some(wake.map_or(ready_at, |w| w.min(ready_at)));
                    continue;
                }
                if self.settings.probe {
                    // Probe in flight; its completion notifies waiters.
                    continue;
                }
                // Half-open: offered again, one more failure restarts the cooldown.
            }
            st.in_flight += 1;
            *cursor = (i + 1) % n;
            return Selection::Leased(i);
        }
        Selection::Wait(wake)
    }

    fn spawn_probe(self: &Arc<Self>, i: usize) {
        let shared = Arc::clone(self);
        let client = Arc::clone(&self.entries[i].client);
        tracing::debug!(provider = client.name(), "probing after cooldown");
        tokio::spawn(async move {
            let result = match tokio::time::timeout(PROBE_TIMEOUT, client.probe()).await {
                Ok(r) => r,
                Err(_) => Err(ProviderError::Timeout {
                    provider: client.name().to_string(),
                    elapsed: PROBE_TIMEOUT,
                }),
            };
            {
                let mut st = lock(&shared.entries[i].state);
                st.probing = false;
                match &result {
                    Ok(()) => {
                        st.consecutive_failures = 0;
                        st.unhealthy_since = None;
                        tracing::info!(provider = client.name(), "probe succeeded, entry healthy");
                    }
                    Err(e) => {
                        st.unhealthy_since = Some(Instant::now());
                        tracing::warn!(provider = client.name(), error = %e, "probe failed");
                    }
                }
            }
            shared.notify.notify_waiters();
        });
    }

    fn finish(&self, i: usize, outcome: Outcome) {
        let entry = &self.entries[i];
        {
            let mut st = lock(&entry.state);
            st.in_flight = st.in_flight.saturating_sub(1);
            match outcome {
                Outcome::Success => {
                    st.consecutive_failures = 0;
                    st.unhealthy_since = None;
                }
                Outcome::Failure => {
                    st.consecutive_failures += 1;
                    if st.consecutive_failures >= self.settings.failure_threshold {
                        if st.consecutive_failures == self.settings.failure_threshold {
                            tracing::warn!(
                                provider = entry.client.name(),
                                failures = st.consecutive_failures,
                                "entry marked unhealthy"
                            );
                        }
                        st.unhealthy_since = Some(Instant::now());
                    }
                }
                Outcome::Neutral => {}
            }
        }
        self.notify.notify_waiters();
    }
}

/// One held concurrency slot on a pool entry.
pub struct Lease {
    shared: Arc<Shared>,
    index: usize,
    released: bool,
}

impl Lease {
    pub fn name(&self) -> &str {
        self.shared.entries[self.index].client.name()
    }

    pub fn client(&self) -> &Arc<dyn LlmClient> {
        &self.shared.entries[self.index].client
    }

    pub fn release(mut self, outcome: Outcome) {
        self.released = true;
        self.shared.finish(self.index, outcome);
    }

    pub async fn generate(
        &self,
        scope: &Scope,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<Completion> {
        self.generate_with_tools(scope, messages, &[], options).await
    }

    pub async fn generate_with_tools(
        &self,
        scope: &Scope,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerateOptions,
    ) -> Result<Completion> {
        options.validate()?;
        let started = Instant::now();
        let fut = self.client().chat(messages, tools, options);
        match scope.run(fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(e) => Err(self.interrupted(e, started)),
        }
    }

    pub async fn stream(
        &self,
        scope: &Scope,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<ChatStream> {
        self.stream_with_tools(scope, messages, &[], options).await
    }

    /// Open a stream. The scope bounds only the opening request; callers
    /// drive the returned stream under their own scope.
    pub async fn stream_with_tools(
        &self,
        scope: &Scope,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerateOptions,
    ) -> Result<ChatStream> {
        options.validate()?;
        let started = Instant::now();
        let fut = self.client().chat_stream(messages, tools, options);
        match scope.run(fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(e) => Err(self.interrupted(e, started)),
        }
    }

    fn interrupted(&self, e: Interrupted, started: Instant) -> Error {
        match e {
            Interrupted::Cancelled => Error::Cancelled,
            Interrupted::DeadlineExceeded => ProviderError::Timeout {
                provider: self.name().to_string(),
                elapsed: started.elapsed(),
            }
            .into(),
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            self.shared.finish(self.index, Outcome::Neutral);
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("provider", &self.name()).finish()
    }
}

/// Health outcome implied by an error returned over a lease.
pub fn outcome_for(err: &Error) -> Outcome {
    match err {
        Error::Provider(e) if e.counts_as_failure() => Outcome::Failure,
        _ => Outcome::Neutral,
    }
}

#[derive(Clone)]
pub struct ProviderPool {
    shared: Arc<Shared>,
}

impl ProviderPool {
    /// Build a pool over `(client, max_concurrency)` pairs.
    pub fn new(clients: Vec<(Arc<dyn LlmClient>, usize)>, settings: PoolSettings) -> Self {
        let entries = clients
            .into_iter()
            .map(|(client, max_concurrency)| Entry {
                client,
                max_concurrency: max_concurrency.max(1),
                state: Mutex::new(EntryState::default()),
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                entries,
                cursor: Mutex::new(0),
                notify: Notify::new(),
                settings,
            }),
        }
    }

    /// One OpenAI-compatible client per configured provider entry.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut clients: Vec<(Arc<dyn LlmClient>, usize)> = Vec::new();
        for p in &config.providers {
            let client = super::openai::OpenAiClient::new(p)?;
            clients.push((Arc::new(client), p.max_concurrency));
        }
        Ok(Self::new(clients, PoolSettings::from(&config.pool)))
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.shared.settings
    }

    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    /// Block until a slot is free on a selectable entry, the scope is
    /// cancelled, or its deadline passes (`NoProviderAvailable`).
    pub async fn acquire(&self, scope: &Scope) -> Result<Lease> {
        self.acquire_excluding(scope, &[]).await
    }

    async fn acquire_excluding(&self, scope: &Scope, exclude: &[usize]) -> Result<Lease> {
        if self.is_empty() {
            return Err(ProviderError::NoProviderAvailable.into());
        }
        let exclude = if exclude.len() >= self.len() { &[][..] } else { exclude };

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake = match self.shared.select(exclude) {
                Selection::Leased(index) => {
                    return Ok(Lease {
                        shared: Arc::clone(&self.shared),
                        index,
                        released: false,
                    })
                }
                Selection::Wait(wake) => wake,
            };

            if scope.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if scope.is_expired() {
                return Err(ProviderError::NoProviderAvailable.into());
            }
            let until = wake.map_or(scope.deadline(), |w| w.min(scope.deadline()));
            tokio::select! {
                _ = scope.token().cancelled() => return Err(Error::Cancelled),
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(until) => {}
            }
        }
    }

    pub fn health(&self) -> Vec<ProviderHealth> {
        let threshold = self.shared.settings.failure_threshold;
        self.shared
            .entries
            .iter()
            .map(|e| {
                let st = lock(&e.state);
                let state = if st.consecutive_failures >= threshold {
                    HealthState::Unhealthy
                } else if st.consecutive_failures > 0 {
                    HealthState::Degraded
                } else {
                    HealthState::Healthy
                };
                ProviderHealth {
                    name: e.client.name().to_string(),
                    state,
                    in_flight: st.in_flight,
                    max_concurrency: e.max_concurrency,
                    consecutive_failures: st.consecutive_failures,
                }
            })
            .collect()
    }

    /// One-shot generation: acquire, call with failover, release.
    pub async fn generate(
        &self,
        scope: &Scope,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerateOptions,
    ) -> Result<Completion> {
        let (lease, completion) = self.generate_on(scope, None, messages, tools, options).await?;
        lease.release(Outcome::Success);
        Ok(completion)
    }

    /// Generate on `lease` (or a freshly acquired one), failing over to
    /// another entry on retryable errors up to `max_retries` times. The
    /// returned lease is still held; a failed lease has already been
    /// released with the matching outcome.
    pub async fn generate_on(
        &self,
        scope: &Scope,
        lease: Option<Lease>,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerateOptions,
    ) -> Result<(Lease, Completion)> {
        options.validate()?;
        let mut held = lease;
        let mut tried: Vec<usize> = Vec::new();
        let mut attempt = 0u32;
        loop {
            let lease = match held.take() {
                Some(l) => l,
                None => self.acquire_excluding(scope, &tried).await?,
            };
            match lease.generate_with_tools(scope, messages, tools, options).await {
                Ok(c) => return Ok((lease, c)),
                Err(e) => {
                    if !self.should_retry(&e, attempt, scope) {
                        lease.release(outcome_for(&e));
                        return Err(e);
                    }
                    tracing::warn!(provider = lease.name(), attempt, error = %e, "retrying on another entry");
                    tried.push(lease.index);
                    lease.release(Outcome::Failure);
                    attempt += 1;
                }
            }
        }
    }

    /// Like [`generate_on`](Self::generate_on) for streams. Failover only
    /// covers opening the stream.
    pub async fn stream_on(
        &self,
        scope: &Scope,
        lease: Option<Lease>,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerateOptions,
    ) -> Result<(Lease, ChatStream)> {
        options.validate()?;
        let mut held = lease;
        let mut tried: Vec<usize> = Vec::new();
        let mut attempt = 0u32;
        loop {
            let lease = match held.take() {
                Some(l) => l,
                None => self.acquire_excluding(scope, &tried).await?,
            };
            match lease.stream_with_tools(scope, messages, tools, options).await {
                Ok(s) => return Ok((lease, s)),
                Err(e) => {
                    if !self.should_retry(&e, attempt, scope) {
                        lease.release(outcome_for(&e));
                        return Err(e);
                    }
                    tracing::warn!(provider = lease.name(), attempt, error = %e, "stream open failed, retrying");
                    tried.push(lease.index);
                    lease.release(Outcome::Failure);
                    attempt += 1;
                }
            }
        }
    }

    /// Stream that holds its lease until the final chunk or an error.
    pub async fn stream(
        &self,
        scope: &Scope,
        messages: &[ChatMessage],
        tools: &[ToolDef],
        options: &GenerateOptions,
    ) -> Result<ChatStream> {
        let (lease, inner) = self.stream_on(scope, None, messages, tools, options).await?;
        let stream = futures::stream::unfold((inner, Some(lease)), |(mut inner, mut lease)| async move {
            let item = inner.next().await?;
            match &item {
                Ok(ChatChunk::Done(_)) => {
                    if let Some(l) = lease.take() {
                        l.release(Outcome::Success);
                    }
                }
                Err(e) => {
                    if let Some(l) = lease.take() {
                        let outcome = if e.counts_as_failure() {
                            Outcome::Failure
                        } else {
                            Outcome::Neutral
                        };
                        l.release(outcome);
                    }
                }
                Ok(ChatChunk::Delta(_)) => {}
            }
            Some((item, (inner, lease)))
        });
        Ok(stream.boxed())
    }

    fn should_retry(&self, e: &Error, attempt: u32, scope: &Scope) -> bool {
        let retryable = matches!(e, Error::Provider(p) if p.is_retryable());
        retryable
            && attempt < self.shared.settings.max_retries
            && !scope.is_cancelled()
            && !scope.is_expired()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scriptable client: fails with `Overloaded` while `failing` is set.
    pub(crate) struct FakeClient {
        pub name: String,
        pub failing: AtomicBool,
        pub probe_ok: AtomicBool,
        pub calls: AtomicUsize,
        pub probes: AtomicUsize,
        pub reply: String,
    }

    impl FakeClient {
        pub(crate) fn new(name: &str, failing: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                failing: AtomicBool::new(failing),
                probe_ok: AtomicBool::new(true),
                calls: AtomicUsize::new(0),
                probes: AtomicUsize::new(0),
                reply: format!("reply from {}", name),
            })
        }
    }

    #[async_trait]
    impl LlmClient for FakeClient {
        fn name(&self) -> &str {
            &self.name
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDef],
            _options: &GenerateOptions,
        ) -> std::result::Result<Completion, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(ProviderError::Overloaded {
                    provider: self.name.clone(),
                    message: "HTTP 503".into(),
                });
            }
            Ok(Completion {
                content: self.reply.clone(),
                ..Default::default()
            })
        }

        async fn chat_stream(
            &self,
            messages: &[ChatMessage],
            tools: &[ToolDef],
            options: &GenerateOptions,
        ) -> std::result::Result<ChatStream, ProviderError> {
            let c = self.chat(messages, tools, options).await?;
            let items = vec![
                Ok(ChatChunk::Delta(c.content.clone())),
                Ok(ChatChunk::Done(c)),
            ];
            Ok(futures::stream::iter(items).boxed())
        }

        async fn probe(&self) -> std::result::Result<(), ProviderError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.probe_ok.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ProviderError::Unavailable {
                    provider: self.name.clone(),
                    message: "down".into(),
                })
            }
        }
    }

    fn settings(max_retries: u32, probe: bool) -> PoolSettings {
        PoolSettings {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            probe,
            max_retries,
            acquire_timeout: Duration::from_secs(5),
        }
    }

    fn pool_of(clients: &[Arc<FakeClient>], max: usize, s: PoolSettings) -> ProviderPool {
        let entries = clients
            .iter()
            .map(|c| (Arc::clone(c) as Arc<dyn LlmClient>, max))
            .collect();
        ProviderPool::new(entries, s)
    }

    fn state_of(pool: &ProviderPool, name: &str) -> HealthState {
        pool.health()
            .into_iter()
            .find(|h| h.name == name)
            .map(|h| h.state)
            .unwrap()
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_cooldown_and_probe() {
        let bad = FakeClient::new("bad", true);
        let good = FakeClient::new("good", false);
        let pool = pool_of(&[bad.clone(), good.clone()], 4, settings(0, true));
        let scope = Scope::new(Duration::from_secs(60));
        let msgs = [crate::provider::user_message("hi")];
        let opts = GenerateOptions::default();

        // Round-robin alternates until the bad entry hits the threshold.
        let mut failures = 0;
        for _ in 0..6 {
            if pool.generate(&scope, &msgs, &[], &opts).await.is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 3);
        assert_eq!(state_of(&pool, "bad"), HealthState::Unhealthy);
        assert_eq!(state_of(&pool, "good"), HealthState::Healthy);

        // While cooling down only the healthy entry is selected.
        for _ in 0..4 {
            let lease = pool.acquire(&scope).await.unwrap();
            assert_eq!(lease.name(), "good");
            lease.release(Outcome::Success);
        }
        assert_eq!(bad.calls.load(Ordering::SeqCst), 3);
        assert_eq!(bad.probes.load(Ordering::SeqCst), 0);

        // Just before the boundary: still no probe.
        tokio::time::advance(Duration::from_secs(29)).await;
        pool.acquire(&scope).await.unwrap().release(Outcome::Success);
        settle().await;
        assert_eq!(bad.probes.load(Ordering::SeqCst), 0);

        // After the cooldown the next acquire triggers a probe.
        tokio::time::advance(Duration::from_secs(2)).await;
        bad.failing.store(false, Ordering::SeqCst);
        let lease = pool.acquire(&scope).await.unwrap();
        assert_eq!(lease.name(), "good");
        lease.release(Outcome::Success);
        settle().await;
        assert_eq!(bad.probes.load(Ordering::SeqCst), 1);
        assert_eq!(state_of(&pool, "bad"), HealthState::Healthy);

        let names: Vec<String> = {
            let mut v = Vec::new();
            for _ in 0..2 {
                let l = pool.acquire(&scope).await.unwrap();
                v.push(l.name().to_string());
                l.release(Outcome::Success);
            }
            v
        };
        assert!(names.contains(&"bad".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_restarts_cooldown() {
        let bad = FakeClient::new("bad", true);
        bad.probe_ok.store(false, Ordering::SeqCst);
        let good = FakeClient::new("good", false);
        let pool = pool_of(&[bad.clone(), good], 4, settings(0, true));
        let scope = Scope::new(Duration::from_secs(600));

        for _ in 0..3 {
            let l = pool.acquire(&scope).await.unwrap();
            if l.name() == "bad" {
                l.release(Outcome::Failure);
            } else {
                l.release(Outcome::Success);
            }
        }
        // bad, good, bad -> two failures; one more.
        let l = pool.acquire(&scope).await.unwrap();
        let l2 = pool.acquire(&scope).await.unwrap();
        for l in [l, l2] {
            let failed = l.name() == "bad";
            l.release(if failed { Outcome::Failure } else { Outcome::Success });
        }
        assert_eq!(state_of(&pool, "bad"), HealthState::Unhealthy);

        tokio::time::advance(Duration::from_secs(31)).await;
        pool.acquire(&scope).await.unwrap().release(Outcome::Success);
        settle().await;
        assert_eq!(bad.probes.load(Ordering::SeqCst), 1);
        assert_eq!(state_of(&pool, "bad"), HealthState::Unhealthy);

        // Cooldown restarted at the failed probe.
        tokio::time::advance(Duration::from_secs(10)).await;
        pool.acquire(&scope).await.unwrap().release(Outcome::Success);
        settle().await;
        assert_eq!(bad.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_failure_only_degrades() {
        let a = FakeClient::new("a", false);
        let pool = pool_of(&[a], 1, settings(0, true));
        let scope = Scope::new(Duration::from_secs(5));
        pool.acquire(&scope).await.unwrap().release(Outcome::Failure);
        assert_eq!(state_of(&pool, "a"), HealthState::Degraded);
        pool.acquire(&scope).await.unwrap().release(Outcome::Success);
        assert_eq!(state_of(&pool, "a"), HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_prefers_other_entry() {
        let bad = FakeClient::new("bad", true);
        let good = FakeClient::new("good", false);
        let pool = pool_of(&[bad.clone(), good.clone()], 4, settings(2, true));
        let scope = Scope::new(Duration::from_secs(60));
        let c = pool
            .generate(&scope, &[crate::provider::user_message("x")], &[], &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(c.content, "reply from good");
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
        let h = pool.health();
        assert_eq!(h[0].consecutive_failures, 1);
        assert!(h.iter().all(|e| e.in_flight == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_saturated() {
        let a = FakeClient::new("a", false);
        let pool = pool_of(&[a], 1, settings(0, true));
        let held = pool.acquire(&Scope::new(Duration::from_secs(5))).await.unwrap();
        let err = pool.acquire(&Scope::new(Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::NoProviderAvailable)));
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_woken_on_release() {
        let a = FakeClient::new("a", false);
        let pool = pool_of(&[a], 1, settings(0, true));
        let held = pool.acquire(&Scope::new(Duration::from_secs(5))).await.unwrap();

        let p2 = pool.clone();
        let waiter = tokio::spawn(async move {
            let l = p2.acquire(&Scope::new(Duration::from_secs(10))).await?;
            Ok::<_, Error>(l.name().to_string())
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        held.release(Outcome::Success);
        assert_eq!(waiter.await.unwrap().unwrap(), "a");
        assert_eq!(pool.health()[0].in_flight, 0);
    }

    #[tokio::test]
    async fn test_acquire_cancelled() {
        let a = FakeClient::new("a", false);
        let pool = pool_of(&[a], 1, settings(0, true));
        let _held = pool.acquire(&Scope::new(Duration::from_secs(5))).await.unwrap();
        let scope = Scope::new(Duration::from_secs(30));
        scope.cancel();
        assert!(matches!(pool.acquire(&scope).await, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_without_probing() {
        let a = FakeClient::new("a", true);
        let pool = pool_of(&[a.clone()], 1, settings(0, false));
        let scope = Scope::new(Duration::from_secs(120));
        for _ in 0..3 {
            let _ = pool
                .generate(&scope, &[crate::provider::user_message("x")], &[], &GenerateOptions::default())
                .await;
        }
        assert_eq!(state_of(&pool, "a"), HealthState::Unhealthy);
        assert!(pool.acquire(&Scope::new(Duration::from_secs(1))).await.is_err());

        tokio::time::advance(Duration::from_secs(31)).await;
        let lease = pool.acquire(&scope).await.unwrap();
        lease.release(Outcome::Success);
        assert_eq!(state_of(&pool, "a"), HealthState::Healthy);
        assert_eq!(a.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stream_releases_lease_on_done() {
        let a = FakeClient::new("a", false);
        let pool = pool_of(&[a], 1, settings(0, true));
        let scope = Scope::new(Duration::from_secs(5));
        let mut s = pool
            .stream(&scope, &[crate::provider::user_message("x")], &[], &GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(pool.health()[0].in_flight, 1);
        let mut text = String::new();
        while let Some(item) = s.next().await {
            if let ChatChunk::Delta(d) = item.unwrap() {
                text.push_str(&d);
            }
        }
        assert_eq!(text, "reply from a");
        assert_eq!(pool.health()[0].in_flight, 0);
    }

    #[tokio::test]
    async fn test_empty_pool() {
        let pool = ProviderPool::new(Vec::new(), PoolSettings::default());
        assert!(matches!(
            pool.acquire(&Scope::new(Duration::from_secs(1))).await,
            Err(Error::Provider(ProviderError::NoProviderAvailable))
        ));
    }
}
