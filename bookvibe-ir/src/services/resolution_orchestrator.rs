//! Batch resolution orchestration
//!
//! Fans a batch of location records out to concurrent per-record resolution
//! tasks and streams progress over the event bus. Each record runs the
//! strategy its kind selects:
//!
//! - real locations: stock photo search
//! - fictional locations: paid generation, then the staggered free cascade,
//!   then stock search, bottoming out in the deterministic placeholder
//!
//! The batch object is the authoritative state; events are advisory. A
//! record's terminal result is committed exactly once (first writer wins),
//! and `ResolveBatchCompleted` fires after the last record commits.

use crate::models::ResolutionBatch;
use crate::services::generative::GenerativeImageClient;
use crate::services::placeholder::placeholder_url;
use crate::services::stock_search::StockImageClient;
use bookvibe_common::config::{BookVibeConfig, StaggerConfig};
use bookvibe_common::events::{BookVibeEvent, EventBus};
use bookvibe_common::records::{LocationKind, LocationRecord};
use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Hard bound on one record's resolution, covering a full paid poll budget
/// plus the free cascade; a task past this deadline is abandoned and the
/// record committed as a placeholder fallback
const RECORD_DEADLINE: Duration = Duration::from_secs(600);

struct Outcome {
    url: String,
    fallback: bool,
}

/// Concurrent batch image resolver
pub struct ResolutionOrchestrator {
    stock: Arc<StockImageClient>,
    generative: Arc<GenerativeImageClient>,
    event_bus: EventBus,
    stagger: StaggerConfig,
    record_deadline: Duration,
}

impl ResolutionOrchestrator {
    pub fn new(config: &BookVibeConfig, event_bus: EventBus) -> Self {
        Self {
            stock: Arc::new(StockImageClient::new(config.stock.clone())),
            generative: Arc::new(GenerativeImageClient::from_config(
                &config.generation,
                &config.free,
            )),
            event_bus,
            stagger: config.stagger.clone(),
            record_deadline: RECORD_DEADLINE,
        }
    }

    /// Composition/test seam: explicit clients instead of config-built ones
    pub fn with_clients(
        stock: Arc<StockImageClient>,
        generative: Arc<GenerativeImageClient>,
        event_bus: EventBus,
        stagger: StaggerConfig,
    ) -> Self {
        Self {
            stock,
            generative,
            event_bus,
            stagger,
            record_deadline: RECORD_DEADLINE,
        }
    }

    /// Start resolving a batch; returns the live batch state immediately
    ///
    /// One task per record is spawned; progress and completion arrive on the
    /// event bus and in the returned batch.
    pub fn resolve_batch(self: &Arc<Self>, records: Vec<LocationRecord>) -> Arc<ResolutionBatch> {
        let batch = Arc::new(ResolutionBatch::new(records));
        let total = batch.len();

        tracing::info!(batch_id = %batch.id(), total, "Resolution batch started");
        let _ = self.event_bus.emit(BookVibeEvent::ResolveBatchStarted {
            batch_id: batch.id(),
            total,
            timestamp: Utc::now(),
        });

        let committed = Arc::new(AtomicUsize::new(0));
        for index in 0..total {
            let orchestrator = Arc::clone(self);
            let batch = Arc::clone(&batch);
            let committed = Arc::clone(&committed);
            tokio::spawn(async move {
                orchestrator.run_record(batch, index, committed).await;
            });
        }

        batch
    }

    /// Resolve one record outside any batch (regeneration requests)
    pub async fn resolve_single(&self, record: &LocationRecord) -> (String, bool) {
        let query = record.effective_image_query();
        let outcome = self.cascade(record, &query, 0, &mut |_| {}).await;
        (outcome.url, outcome.fallback)
    }

    async fn run_record(
        self: Arc<Self>,
        batch: Arc<ResolutionBatch>,
        index: usize,
        committed: Arc<AtomicUsize>,
    ) {
        let record = batch.record(index);
        let query = record.effective_image_query();

        let mut notify = {
            let batch = Arc::clone(&batch);
            let event_bus = self.event_bus.clone();
            move |stage: &str| {
                if batch.set_stage(index, stage) {
                    let _ = event_bus.emit(BookVibeEvent::ResolveProgress {
                        batch_id: batch.id(),
                        index,
                        stage: stage.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
        };

        let resolution = tokio::time::timeout(
            self.record_deadline,
            self.cascade(&record, &query, index, &mut notify),
        )
        .await;

        let outcome = match resolution {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    batch_id = %batch.id(),
                    index,
                    "Record resolution exceeded deadline, committing placeholder"
                );
                Outcome {
                    url: placeholder_url(&query),
                    fallback: true,
                }
            }
        };

        if batch.commit(index, &outcome.url, outcome.fallback) {
            let _ = self.event_bus.emit(BookVibeEvent::ResolveCompleted {
                batch_id: batch.id(),
                index,
                image_url: outcome.url,
                fallback: outcome.fallback,
                timestamp: Utc::now(),
            });

            let done = committed.fetch_add(1, Ordering::SeqCst) + 1;
            if done == batch.len() {
                let fallbacks = batch.fallback_count();
                tracing::info!(
                    batch_id = %batch.id(),
                    resolved = batch.len() - fallbacks,
                    fallbacks,
                    "Resolution batch completed"
                );
                let _ = self.event_bus.emit(BookVibeEvent::ResolveBatchCompleted {
                    batch_id: batch.id(),
                    resolved: batch.len() - fallbacks,
                    fallbacks,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    /// Strategy cascade for one record; total, always yields a URL
    async fn cascade(
        &self,
        record: &LocationRecord,
        query: &str,
        stagger_index: usize,
        notify: &mut (dyn FnMut(&str) + Send),
    ) -> Outcome {
        match record.kind {
            LocationKind::Real => {
                notify("searching");
                let result = self.stock.search(query).await;
                Outcome {
                    url: result.url,
                    fallback: result.fallback,
                }
            }
            LocationKind::Fictional => {
                if self.generative.paid_available() {
                    notify("generating via paid");
                    match self.generative.generate_paid(query).await {
                        Ok(url) => return Outcome { url, fallback: false },
                        Err(e) => {
                            tracing::warn!(error = %e, "Paid generation failed, trying free tier");
                        }
                    }
                }

                // Stagger records before they hit the shared free services so
                // a batch does not arrive as a burst
                let base_ms = rand::thread_rng()
                    .gen_range(self.stagger.base_min_ms..=self.stagger.base_max_ms);
                let delay = Duration::from_millis(base_ms * stagger_index as u64);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let mut on_attempt = |name: &str, _attempt: usize| {
                    notify(&format!("generating via free ({})", name));
                };
                if let Some(url) = self.generative.free_cascade(query, &mut on_attempt).await {
                    return Outcome { url, fallback: false };
                }

                // All generation exhausted; a stock photo still counts as
                // success, but a placeholder here means every tier failed
                notify("searching");
                let result = self.stock.search(query).await;
                let fallback = result.fallback || result.url == placeholder_url(query);
                Outcome {
                    url: result.url,
                    fallback,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResolutionStatus;
    use crate::services::generative::{
        FetchError, FreeProvider, GenerateError, ImageFetcher, PaidBackend,
    };
    use async_trait::async_trait;
    use bookvibe_common::config::{FreeProviderConfig, StockProviderKind};
    use bookvibe_common::records::PostcardMode;

    fn record(location: &str, kind: LocationKind) -> LocationRecord {
        LocationRecord {
            location: location.to_string(),
            location_en: location.to_string(),
            kind,
            quote: String::new(),
            image_query: format!("{} atmospheric", location),
            image_url: String::new(),
            mode: PostcardMode::Book,
        }
    }

    fn deterministic_stock() -> Arc<StockImageClient> {
        let mut config = BookVibeConfig::default().stock;
        config.provider = StockProviderKind::Deterministic;
        Arc::new(StockImageClient::new(config))
    }

    fn free_providers() -> Vec<FreeProvider> {
        vec![FreeProvider::from_config(&FreeProviderConfig {
            name: "test-free".to_string(),
            base_url: "https://free.example".to_string(),
        })]
    }

    struct AlwaysOkFetcher;

    #[async_trait]
    impl ImageFetcher for AlwaysOkFetcher {
        async fn fetch(&self, _url: &str) -> Result<(), FetchError> {
            Ok(())
        }
    }

    struct AlwaysFailFetcher;

    #[async_trait]
    impl ImageFetcher for AlwaysFailFetcher {
        async fn fetch(&self, _url: &str) -> Result<(), FetchError> {
            Err(FetchError::Status(503))
        }
    }

    /// Paid backend that never resolves; exercises the record deadline
    struct StalledBackend;

    #[async_trait]
    impl PaidBackend for StalledBackend {
        fn name(&self) -> &'static str {
            "stalled"
        }
        async fn generate(&self, _prompt: &str) -> Result<String, GenerateError> {
            std::future::pending().await
        }
    }

    fn orchestrator(
        paid: Option<Arc<dyn PaidBackend>>,
        fetcher: Arc<dyn ImageFetcher>,
        event_bus: EventBus,
    ) -> Arc<ResolutionOrchestrator> {
        let generative = GenerativeImageClient::with_parts(
            paid,
            free_providers(),
            fetcher,
            Duration::from_secs(30),
        );
        Arc::new(ResolutionOrchestrator::with_clients(
            deterministic_stock(),
            Arc::new(generative),
            event_bus,
            StaggerConfig {
                base_min_ms: 2000,
                base_max_ms: 5000,
            },
        ))
    }

    async fn drain_until_batch_completed(
        rx: &mut tokio::sync::broadcast::Receiver<BookVibeEvent>,
    ) -> Vec<BookVibeEvent> {
        let mut events = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            let done = matches!(event, BookVibeEvent::ResolveBatchCompleted { .. });
            events.push(event);
            if done {
                return events;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_resolves_every_record_and_emits_lifecycle_events() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let orchestrator = orchestrator(None, Arc::new(AlwaysOkFetcher), bus);

        let batch = orchestrator.resolve_batch(vec![
            record("Paris", LocationKind::Real),
            record("Macondo", LocationKind::Fictional),
        ]);

        let events = drain_until_batch_completed(&mut rx).await;

        assert!(batch.is_complete());
        let snap = batch.snapshot();
        assert_eq!(snap.total, 2);
        assert_eq!(snap.terminal, 2);
        // Every record carries a non-empty URL
        for slot in &snap.records {
            assert!(!slot.record.image_url.is_empty());
        }
        // Fictional record came from the free tier
        assert!(snap.records[1]
            .record
            .image_url
            .starts_with("https://free.example/prompt/"));

        assert!(matches!(events[0], BookVibeEvent::ResolveBatchStarted { total: 2, .. }));
        let completions = events
            .iter()
            .filter(|e| matches!(e, BookVibeEvent::ResolveCompleted { .. }))
            .count();
        assert_eq!(completions, 2);
        match events.last().unwrap() {
            BookVibeEvent::ResolveBatchCompleted { resolved, fallbacks, .. } => {
                assert_eq!(*resolved, 2);
                assert_eq!(*fallbacks, 0);
            }
            other => panic!("expected batch completion, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fictional_exhaustion_commits_placeholder_fallback() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let orchestrator = orchestrator(None, Arc::new(AlwaysFailFetcher), bus);

        let batch = orchestrator.resolve_batch(vec![record("Macondo", LocationKind::Fictional)]);
        let events = drain_until_batch_completed(&mut rx).await;

        let snap = batch.snapshot();
        let query = record("Macondo", LocationKind::Fictional).effective_image_query();
        assert_eq!(snap.records[0].record.image_url, placeholder_url(&query));
        assert!(matches!(
            snap.records[0].status,
            ResolutionStatus::Failed { .. }
        ));

        // Progress events named the free provider before the fallback
        assert!(events.iter().any(|e| matches!(
            e,
            BookVibeEvent::ResolveProgress { stage, .. } if stage == "generating via free (test-free)"
        )));
        match events.last().unwrap() {
            BookVibeEvent::ResolveBatchCompleted { resolved, fallbacks, .. } => {
                assert_eq!(*resolved, 0);
                assert_eq!(*fallbacks, 1);
            }
            other => panic!("expected batch completion, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fictional_cascade_order_paid_then_free_providers() {
        struct RefusingBackend;

        #[async_trait]
        impl PaidBackend for RefusingBackend {
            fn name(&self) -> &'static str {
                "refusing"
            }
            async fn generate(&self, _prompt: &str) -> Result<String, GenerateError> {
                Err(GenerateError::Api {
                    status: 402,
                    message: "quota exhausted".to_string(),
                })
            }
        }

        /// First provider fails, second serves the image
        struct SecondProviderFetcher;

        #[async_trait]
        impl ImageFetcher for SecondProviderFetcher {
            async fn fetch(&self, url: &str) -> Result<(), FetchError> {
                if url.contains("free-a.example") {
                    Err(FetchError::Status(503))
                } else {
                    Ok(())
                }
            }
        }

        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let generative = GenerativeImageClient::with_parts(
            Some(Arc::new(RefusingBackend)),
            vec![
                FreeProvider::from_config(&FreeProviderConfig {
                    name: "free-a".to_string(),
                    base_url: "https://free-a.example".to_string(),
                }),
                FreeProvider::from_config(&FreeProviderConfig {
                    name: "free-b".to_string(),
                    base_url: "https://free-b.example".to_string(),
                }),
            ],
            Arc::new(SecondProviderFetcher),
            Duration::from_secs(30),
        );
        let orchestrator = Arc::new(ResolutionOrchestrator::with_clients(
            deterministic_stock(),
            Arc::new(generative),
            bus,
            StaggerConfig {
                base_min_ms: 2000,
                base_max_ms: 5000,
            },
        ));

        let batch = orchestrator.resolve_batch(vec![record("Macondo", LocationKind::Fictional)]);
        let events = drain_until_batch_completed(&mut rx).await;

        let stages: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                BookVibeEvent::ResolveProgress { stage, .. } => Some(stage.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            stages,
            vec![
                "generating via paid",
                "generating via free (free-a)",
                "generating via free (free-b)",
            ]
        );

        let snap = batch.snapshot();
        assert!(snap.records[0]
            .record
            .image_url
            .starts_with("https://free-b.example/prompt/"));
        assert!(matches!(
            snap.records[0].status,
            ResolutionStatus::Succeeded { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_paid_backend_does_not_stall_the_batch() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let orchestrator = orchestrator(
            Some(Arc::new(StalledBackend)),
            Arc::new(AlwaysOkFetcher),
            bus,
        );

        let batch = orchestrator.resolve_batch(vec![record("Macondo", LocationKind::Fictional)]);
        let events = drain_until_batch_completed(&mut rx).await;

        // The deadline expired and the record still reached a terminal state
        assert!(batch.is_complete());
        let snap = batch.snapshot();
        assert!(matches!(
            snap.records[0].status,
            ResolutionStatus::Failed { .. }
        ));
        assert!(events
            .iter()
            .any(|e| matches!(e, BookVibeEvent::ResolveCompleted { fallback: true, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_records_complete_while_one_is_stalled() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        let orchestrator = orchestrator(
            Some(Arc::new(StalledBackend)),
            Arc::new(AlwaysOkFetcher),
            bus,
        );

        // Record 0 hangs in the paid backend; 1 and 2 resolve by search
        let batch = orchestrator.resolve_batch(vec![
            record("Macondo", LocationKind::Fictional),
            record("Paris", LocationKind::Real),
            record("Kyoto", LocationKind::Real),
        ]);

        // The two real records reach terminal status without waiting for
        // record 0's deadline
        let mut completed_indices = Vec::new();
        while completed_indices.len() < 2 {
            if let BookVibeEvent::ResolveCompleted { index, .. } = rx.recv().await.unwrap() {
                completed_indices.push(index);
            }
        }
        completed_indices.sort_unstable();
        assert_eq!(completed_indices, vec![1, 2]);

        let snap = batch.snapshot();
        assert_eq!(snap.terminal, 2);
        assert!(
            !snap.records[0].status.is_terminal(),
            "stalled record must still be pending while others complete"
        );

        // Record 0 eventually commits its deadline fallback
        let events = drain_until_batch_completed(&mut rx).await;
        assert!(events.iter().any(|e| matches!(
            e,
            BookVibeEvent::ResolveCompleted { index: 0, fallback: true, .. }
        )));
        assert!(batch.is_complete());
        assert!(matches!(
            batch.snapshot().records[0].status,
            ResolutionStatus::Failed { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_real_record_skips_generation_entirely() {
        let bus = EventBus::new(64);
        let mut rx = bus.subscribe();
        // Paid backend would hang if consulted; real records must not touch it
        let orchestrator = orchestrator(
            Some(Arc::new(StalledBackend)),
            Arc::new(AlwaysOkFetcher),
            bus,
        );

        let batch = orchestrator.resolve_batch(vec![record("Paris", LocationKind::Real)]);
        let events = drain_until_batch_completed(&mut rx).await;

        let snap = batch.snapshot();
        assert!(matches!(
            snap.records[0].status,
            ResolutionStatus::Succeeded { .. }
        ));
        assert!(events.iter().any(|e| matches!(
            e,
            BookVibeEvent::ResolveProgress { stage, .. } if stage == "searching"
        )));
        assert!(!events.iter().any(|e| matches!(
            e,
            BookVibeEvent::ResolveProgress { stage, .. } if stage.starts_with("generating")
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_tier_attempts_are_staggered_by_index() {
        let bus = EventBus::new(256);
        let mut rx = bus.subscribe();
        let orchestrator = orchestrator(None, Arc::new(AlwaysOkFetcher), bus);

        let start = tokio::time::Instant::now();
        let records: Vec<_> = (0..3)
            .map(|i| record(&format!("Fict-{}", i), LocationKind::Fictional))
            .collect();
        let batch = orchestrator.resolve_batch(records);
        drain_until_batch_completed(&mut rx).await;

        assert!(batch.is_complete());
        // Index 2 waited at least 2 * base_min_ms before its free attempt
        assert!(start.elapsed() >= Duration::from_millis(4000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_single_regenerates_without_batch_state() {
        let bus = EventBus::new(16);
        let orchestrator = orchestrator(None, Arc::new(AlwaysOkFetcher), bus);

        let (url, fallback) = orchestrator
            .resolve_single(&record("Macondo", LocationKind::Fictional))
            .await;
        assert!(url.starts_with("https://free.example/prompt/"));
        assert!(!fallback);

        let (url, fallback) = orchestrator
            .resolve_single(&record("Paris", LocationKind::Real))
            .await;
        assert!(url.starts_with("https://picsum.photos/seed/"));
        assert!(!fallback);
    }
}
