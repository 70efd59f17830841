//! Query router - cache hit or external fetch, with concurrent identical queries merged

use crate::answer_service::AnswerService;
use crate::config::Config;
use crate::context_engine::ContextBundle;
use crate::error::{RouterError, ServiceError, ValidationError};
use crate::knowledge::{KnowledgeEntry, KnowledgeMatch, KnowledgeStore, NewKnowledgeEntry};
use crate::metrics;
use crate::utils::TextUtils;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Cache,
    External,
    Fallback,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Cache => "cache",
            SourceTag::External => "external",
            SourceTag::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    Fast,
    Slow,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub text: String,
    pub source: SourceTag,
    pub latency: LatencyClass,
}

/// How a query was resolved.
#[derive(Debug, Clone)]
pub enum Resolution {
    Hit(KnowledgeMatch),
    Fetched {
        text: String,
        /// `None` when the answer could not be written back
        entry: Option<Arc<KnowledgeEntry>>,
    },
    Fallback {
        candidate: KnowledgeMatch,
        cause: ServiceError,
    },
    Unavailable(ServiceError),
}

impl Resolution {
    pub fn outcome(&self) -> &'static str {
        match self {
            Resolution::Hit(_) => "hit",
            Resolution::Fetched { .. } => "fetched",
            Resolution::Fallback { .. } => "fallback",
            Resolution::Unavailable(_) => "unavailable",
        }
    }

    pub fn into_answer(self, query: &str) -> Result<Answer, RouterError> {
        match self {
            Resolution::Hit(m) => Ok(Answer {
                text: m.entry.answer.clone(),
                source: SourceTag::Cache,
                latency: LatencyClass::Fast,
            }),
            Resolution::Fetched { text, .. } => Ok(Answer {
                text,
                source: SourceTag::External,
                latency: LatencyClass::Slow,
            }),
            Resolution::Fallback { candidate, .. } => Ok(Answer {
                text: candidate.entry.answer.clone(),
                source: SourceTag::Fallback,
                latency: LatencyClass::Slow,
            }),
            Resolution::Unavailable(cause) => Err(RouterError::NotAvailable {
                query: query.to_string(),
                cause,
            }),
        }
    }
}

/// Settings the router takes from [`Config`].
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub service_timeout: Duration,
    pub fetched_confidence: f32,
    pub fetched_category: String,
}

impl RouterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            service_timeout: config.service_timeout,
            fetched_confidence: config.fetched_confidence,
            fetched_category: config.fetched_category.clone(),
        }
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Default)]
struct RouterCounters {
    requests: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    joined: AtomicU64,
    service_calls: AtomicU64,
    fetched: AtomicU64,
    fallbacks: AtomicU64,
    unavailable: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub requests: u64,
    pub hits: u64,
    pub misses: u64,
    /// Callers that waited on a fetch started by someone else
    pub joined: u64,
    pub service_calls: u64,
    pub fetched: u64,
    pub fallbacks: u64,
    pub unavailable: u64,
}

type SharedResolution = Shared<BoxFuture<'static, Resolution>>;
type InFlight = DashMap<String, SharedResolution>;

/// Removes the in-flight registration when the fetch task ends, however it ends.
struct InFlightGuard {
    in_flight: Arc<InFlight>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

pub struct QueryRouter {
    knowledge: Arc<KnowledgeStore>,
    service: Arc<dyn AnswerService>,
    settings: RouterSettings,
    in_flight: Arc<InFlight>,
    counters: Arc<RouterCounters>,
}

impl QueryRouter {
    pub fn new(knowledge: Arc<KnowledgeStore>, service: Arc<dyn AnswerService>, settings: RouterSettings) -> Self {
        Self {
            knowledge,
            service,
            settings,
            in_flight: Arc::new(DashMap::new()),
            counters: Arc::new(RouterCounters::default()),
        }
    }

    pub async fn answer(&self, query: &str, context: &ContextBundle) -> Result<Answer, RouterError> {
        if query.trim().is_empty() {
            return Err(ValidationError::EmptyQuestion.into());
        }
        self.resolve(query, context).await.into_answer(query)
    }

    /// Resolves a query against the knowledge store, fetching from the answer
    /// service on a miss. Identical concurrent queries share one fetch.
    pub async fn resolve(&self, query: &str, context: &ContextBundle) -> Resolution {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let key = TextUtils::dedup_key(query);

        let existing = self.in_flight.get(&key).map(|e| e.value().clone());
        let resolution = match existing {
            Some(shared) => {
                debug!("Joining in-flight fetch for '{}'", key);
                self.count_join();
                shared.await
            }
            None => match self.knowledge.lookup(query, None).filter(|m| self.knowledge.is_hit(m)) {
                Some(hit) => Resolution::Hit(hit),
                None => self.fetch_shared(key, query, context).await,
            },
        };

        self.count_outcome(&resolution);
        if let Resolution::Hit(m) | Resolution::Fallback { candidate: m, .. } = &resolution {
            self.knowledge.record_access(&m.entry.id);
        }
        resolution
    }

    async fn fetch_shared(&self, key: String, query: &str, context: &ContextBundle) -> Resolution {
        let shared = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(e) => {
                self.count_join();
                e.get().clone()
            }
            Entry::Vacant(slot) => {
                let (registered_tx, registered_rx) = oneshot::channel::<()>();
                let shared = self.spawn_fetch(key, query.trim().to_string(), context.clone(), registered_rx);
                slot.insert(shared.clone());
                // The task may only release the key once it is actually registered
                let _ = registered_tx.send(());
                shared
            }
        };
        shared.await
    }

    fn spawn_fetch(
        &self,
        key: String,
        query: String,
        context: ContextBundle,
        registered: oneshot::Receiver<()>,
    ) -> SharedResolution {
        let knowledge = Arc::clone(&self.knowledge);
        let service = Arc::clone(&self.service);
        let settings = self.settings.clone();
        let counters = Arc::clone(&self.counters);
        let in_flight = Arc::clone(&self.in_flight);

        let task = tokio::spawn(async move {
            let _ = registered.await;
            let guard = InFlightGuard { in_flight, key };
            let resolution = fetch(&knowledge, service.as_ref(), &settings, &counters, &query, &context).await;
            drop(guard);
            resolution
        });

        async move {
            task.await.unwrap_or_else(|e| {
                warn!("Answer fetch task failed: {}", e);
                Resolution::Unavailable(ServiceError::Network(format!("answer task failed: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    fn count_join(&self) {
        self.counters.joined.fetch_add(1, Ordering::Relaxed);
        metrics::inc_dedup_join();
    }

    fn count_outcome(&self, resolution: &Resolution) {
        let c = &self.counters;
        let counter = match resolution {
            Resolution::Hit(_) => &c.hits,
            Resolution::Fetched { .. } => &c.fetched,
            Resolution::Fallback { .. } => &c.fallbacks,
            Resolution::Unavailable(_) => &c.unavailable,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if !matches!(resolution, Resolution::Hit(_)) {
            c.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::inc_route(resolution.outcome());
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.counters;
        RouterStats {
            requests: c.requests.load(Ordering::Relaxed),
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            joined: c.joined.load(Ordering::Relaxed),
            service_calls: c.service_calls.load(Ordering::Relaxed),
            fetched: c.fetched.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            unavailable: c.unavailable.load(Ordering::Relaxed),
        }
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

async fn fetch(
    knowledge: &KnowledgeStore,
    service: &dyn AnswerService,
    settings: &RouterSettings,
    counters: &RouterCounters,
    query: &str,
    context: &ContextBundle,
) -> Resolution {
    // A fetch that finished just before this one was registered may already have the answer
    let candidate = knowledge.lookup(query, None);
    if let Some(hit) = candidate.as_ref().filter(|m| knowledge.is_hit(m)) {
        return Resolution::Hit(hit.clone());
    }

    counters.service_calls.fetch_add(1, Ordering::Relaxed);
    let started = Instant::now();
    let result = match tokio::time::timeout(settings.service_timeout, service.generate(query, context)).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout(settings.service_timeout)),
    };
    metrics::observe_service_latency(started.elapsed().as_secs_f64());

    let result = result.and_then(|generated| {
        let text = generated.text.trim().to_string();
        if text.is_empty() {
            Err(ServiceError::InvalidResponse("empty answer".to_string()))
        } else {
            Ok(text)
        }
    });

    match result {
        Ok(text) => {
            let new = NewKnowledgeEntry::new(query, &text, service.source_tag(), settings.fetched_confidence)
                .with_category(settings.fetched_category.clone());
            let entry = match knowledge.insert(new).await {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Fetched answer for '{}' not stored: {}", query, e);
                    None
                }
            };
            info!(
                "Fetched answer for '{}' in {:.2}s",
                query,
                started.elapsed().as_secs_f64()
            );
            Resolution::Fetched { text, entry }
        }
        Err(cause) => {
            metrics::inc_service_error(cause.kind());
            warn!("Answer service failed for '{}': {}", query, cause);
            match candidate {
                Some(candidate) => Resolution::Fallback { candidate, cause },
                None => Resolution::Unavailable(cause),
            }
        }
    }
}
