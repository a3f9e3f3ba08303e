use chrono::Utc;
use event_bus::EventHandler;
use starter_sync::events::{starter_event, StarterEventKind};
use starter_sync::models::Starter;
use starter_sync::repos::memory::{InMemoryNotificationStore, InMemoryStarterSource};
use starter_sync::search::InMemorySearchIndex;
use starter_sync::{ReindexError, ReindexService, SyncHandler};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn starters(count: usize) -> Vec<Starter> {
    (0..count)
        .map(|i| Starter {
            domain: format!("starter-{:05}", i),
            name: format!("Starter {}", i),
            email: format!("starter{}@example.com", i),
            department: if i % 2 == 0 { "engineering" } else { "sales" }.to_string(),
            title: None,
            start_date: None,
            updated_at: Utc::now(),
        })
        .collect()
}

#[tokio::test]
async fn test_reindex_reads_ceil_of_total_over_batch() {
    let cases = [
        (1usize, 100u32, 1usize),
        (99, 100, 1),
        (101, 100, 2),
        (1000, 100, 10),
        (7, 3, 3),
    ];
    for (rows, batch, expected_pages) in cases {
        let source = Arc::new(InMemoryStarterSource::with_starters(starters(rows)));
        let index = Arc::new(InMemorySearchIndex::new());
        let service = ReindexService::new(source.clone(), index.clone(), batch);

        let report = service.reindex_all(&CancellationToken::new()).await.unwrap();

        assert_eq!(source.list_calls(), expected_pages, "rows={} batch={}", rows, batch);
        assert_eq!(index.len(), rows);
        assert_eq!(report.documents, rows as u64);
    }
}

#[tokio::test]
async fn test_reindex_is_repeatable() {
    let source = Arc::new(InMemoryStarterSource::with_starters(starters(42)));
    let index = Arc::new(InMemorySearchIndex::new());
    let service = ReindexService::new(source, index.clone(), 10);

    service.reindex_all(&CancellationToken::new()).await.unwrap();
    service.reindex_all(&CancellationToken::new()).await.unwrap();

    assert_eq!(index.len(), 42);
}

#[tokio::test]
async fn test_failed_reindex_converges_through_events() {
    let all = starters(30);
    let source = Arc::new(InMemoryStarterSource::with_starters(all.clone()));
    let index = Arc::new(InMemorySearchIndex::new());
    let service = ReindexService::new(source.clone(), index.clone(), 10);

    index.fail_next(1);
    let failed = service.reindex_all(&CancellationToken::new()).await;
    assert!(matches!(failed, Err(ReindexError::Index(_))));
    assert!(index.is_empty());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let aborted = service.reindex_all(&cancel).await;
    assert!(matches!(aborted, Err(ReindexError::Cancelled { documents: 0 })));

    let cancel_never = CancellationToken::new();
    let handler = SyncHandler::new(
        source.clone(),
        index.clone(),
        Arc::new(InMemoryNotificationStore::new()),
    );
    for starter in &all {
        let event = starter_event(StarterEventKind::Index, starter).unwrap();
        handler.handle(&event, &cancel_never).await.unwrap();
    }

    assert_eq!(index.len(), 30);
}

#[tokio::test]
async fn test_reindex_if_empty_only_runs_once() {
    let source = Arc::new(InMemoryStarterSource::with_starters(starters(5)));
    let index = Arc::new(InMemorySearchIndex::new());
    let service = ReindexService::new(source.clone(), index.clone(), 2);

    let first = service
        .reindex_if_empty(&CancellationToken::new())
        .await
        .unwrap();
    let second = service
        .reindex_if_empty(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.map(|r| r.documents), Some(5));
    assert!(second.is_none());
    assert_eq!(source.list_calls(), 3);
}
