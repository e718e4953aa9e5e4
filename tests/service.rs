//! Integration tests for the query service surface.
//!
//! Each test builds a real collection in a temp dir (hash embedder, no
//! model download) and drives the service functions the HTTP handlers
//! delegate to — the same approach the handlers themselves take.

mod helpers;

use std::sync::Arc;

use helpers::TestService;
use pdfscope::api::{run_multi_query, run_query, run_reload};
use pdfscope::engine::MultiQueryRequest;
use pdfscope::error::Error;

fn multi_request(queries: &[&str], hashes: &[String]) -> MultiQueryRequest {
    MultiQueryRequest {
        queries: queries.iter().map(|q| q.to_string()).collect(),
        source_hashes: hashes.to_vec(),
        external_sources: Vec::new(),
        top_k_per_source: None,
        max_workers: None,
        timeout_secs: None,
    }
}

// ---------------------------------------------------------------------------
// Single-collection query path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cold_then_warm_query() {
    let service = TestService::with_files(&[(
        "voyage.txt",
        "The ship left harbor at dawn. The crew watched the coastline fade. \
         Provisions were stored below deck for the long voyage ahead.",
    )]);

    // Cold: the first query loads the index.
    let cold = run_query(&service.ctx, None, "ship voyage at dawn", Some(3)).await.unwrap();
    assert!(!cold.from_cache);
    assert!(!cold.sources.is_empty());
    assert!(cold.sources.len() <= 3);

    // Warm: same query hits the resident entry with zero load time.
    let warm = run_query(&service.ctx, None, "ship voyage at dawn", Some(3)).await.unwrap();
    assert!(warm.from_cache);
    assert_eq!(warm.load_time_seconds, 0.0);
    assert!(warm.retrieval_time_seconds < 0.5);

    // The answer is the deterministic rendering of the passages.
    assert!(warm.answer.starts_with("[voyage.txt] Page 1:\n"));
    for source in &warm.sources {
        assert_eq!(source.metadata.source, "voyage.txt");
        assert!(warm.answer.contains(&source.content));
    }
}

#[tokio::test]
async fn passages_are_ranked_by_descending_score() {
    let service = TestService::with_files(&[
        ("cooking.txt", "Slice the onions finely and brown them in butter over low heat."),
        ("sailing.txt", "Trim the mainsail when the wind shifts to a broad reach."),
        ("baking.txt", "Knead the dough until elastic, then let it rise for an hour."),
    ]);

    let resp = run_query(&service.ctx, None, "sail wind mainsail", Some(3)).await.unwrap();
    assert!(!resp.sources.is_empty());
    assert!(resp.sources[0].content.contains("mainsail"));
}

#[tokio::test]
async fn empty_question_is_rejected() {
    let service = TestService::with_files(&[("a.txt", "text")]);
    let err = run_query(&service.ctx, None, "   ", None).await.unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));
}

#[tokio::test]
async fn missing_directory_is_source_unavailable() {
    let service = TestService::with_files(&[("a.txt", "text")]);
    let err = run_query(
        &service.ctx,
        Some(std::path::Path::new("/no/such/collection")),
        "anything",
        None,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::SourceUnavailable { .. }));
}

#[tokio::test]
async fn unindexed_collection_builds_on_first_query() {
    // No prebuilt index: write sources only and query straight away.
    let dir = helpers::write_collection(&[("fresh.txt", "a freshly written document about rivers")]);
    let service = TestService::with_files(&[("seed.txt", "unrelated seed collection")]);

    let resp =
        run_query(&service.ctx, Some(dir.path()), "rivers", Some(2)).await.unwrap();
    assert!(!resp.from_cache);
    assert_eq!(resp.sources[0].metadata.source, "fresh.txt");
}

// ---------------------------------------------------------------------------
// Cache lifecycle through the service surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn evict_then_query_reloads() {
    let service = TestService::with_files(&[("a.txt", "evictable content")]);

    run_query(&service.ctx, None, "content", None).await.unwrap();
    assert_eq!(service.ctx.cache.len(), 1);

    assert!(service.ctx.cache.evict(service.root()));
    let resp = run_query(&service.ctx, None, "content", None).await.unwrap();
    assert!(!resp.from_cache);
}

#[tokio::test]
async fn reload_picks_up_new_documents() {
    let service = TestService::with_files(&[("a.txt", "the original lone document")]);

    let before = run_query(&service.ctx, None, "document", None).await.unwrap();
    assert!(!before.from_cache);

    std::fs::write(service.root().join("b.txt"), "a second document about falcons").unwrap();
    let reloaded = run_reload(&service.ctx, None).await.unwrap();
    assert_eq!(reloaded.docs_count, 2);
    assert!(reloaded.load_time_seconds > 0.0);

    let after = run_query(&service.ctx, None, "falcons", None).await.unwrap();
    assert!(after.from_cache);
    assert!(after.sources.iter().any(|s| s.metadata.source == "b.txt"));
}

#[tokio::test]
async fn stats_track_resident_entries() {
    let service = TestService::with_files(&[("a.txt", "alpha"), ("b.txt", "beta")]);
    assert!(service.ctx.cache.stats().is_empty());

    run_query(&service.ctx, None, "alpha", None).await.unwrap();
    let stats = service.ctx.cache.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].docs_count, 2);
}

// ---------------------------------------------------------------------------
// Multi-shard fan-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fan_out_over_all_shards_with_dedup() {
    let shared = "An identical paragraph that appears in two different books.";
    let mut files: Vec<(String, String)> = (0..10)
        .map(|i| (format!("book{i:02}.txt"), format!("Book number {i} discusses topic {i}.")))
        .collect();
    files.push(("dup_a.txt".to_string(), shared.to_string()));
    files.push(("dup_b.txt".to_string(), format!("{shared} ")));

    let refs: Vec<(&str, &str)> =
        files.iter().map(|(n, c)| (n.as_str(), c.as_str())).collect();
    let (service, hashes) = TestService::with_shards(&refs);
    assert_eq!(hashes.len(), 12);

    let resp = run_multi_query(
        &service.ctx,
        multi_request(&["identical paragraph in two books"], &hashes),
    )
    .await
    .unwrap();

    assert_eq!(resp.total_shards, 12);
    let result = &resp.results[0];
    assert_eq!(result.succeeded, 12);
    assert_eq!(result.failed, 0);

    // Scores are monotonically non-increasing.
    for pair in result.passages.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }

    // The duplicated paragraph appears once, attributed to both books.
    let dup: Vec<_> = result
        .passages
        .iter()
        .filter(|p| p.content.contains("identical paragraph"))
        .collect();
    assert_eq!(dup.len(), 1);
    assert_eq!(dup[0].sources.len(), 2);
    assert_eq!(dup[0].shards.len(), 2);

    // No two passages share a content key.
    let mut keys: Vec<&str> = result.passages.iter().map(|p| p.key.as_str()).collect();
    keys.sort();
    let before = keys.len();
    keys.dedup();
    assert_eq!(keys.len(), before);
}

#[tokio::test]
async fn bounded_workers_still_cover_every_shard() {
    let files: Vec<(String, String)> = (0..9)
        .map(|i| (format!("doc{i}.txt"), format!("Document {i} about subject {i}.")))
        .collect();
    let refs: Vec<(&str, &str)> =
        files.iter().map(|(n, c)| (n.as_str(), c.as_str())).collect();
    let (service, hashes) = TestService::with_shards(&refs);

    let mut req = multi_request(&["subject"], &hashes);
    req.max_workers = Some(2);
    req.top_k_per_source = Some(3);

    let resp = run_multi_query(&service.ctx, req).await.unwrap();
    let result = &resp.results[0];
    assert_eq!(result.succeeded, 9);
    // k=3 per shard, 9 shards: at most 27 passages before dedup.
    assert!(result.passages.len() <= 27);
}

#[tokio::test]
async fn shard_failure_is_isolated_and_reported() {
    let (service, hashes) = TestService::with_shards(&[
        ("a.txt", "healthy shard alpha"),
        ("b.txt", "healthy shard beta"),
        ("c.txt", "healthy shard gamma"),
        ("d.txt", "soon to be corrupted"),
    ]);

    // Corrupt one shard on disk.
    let victim = service.root().join(&hashes[0]).join("index.bin");
    std::fs::write(&victim, b"not an index").unwrap();

    let resp =
        run_multi_query(&service.ctx, multi_request(&["healthy shard"], &hashes)).await.unwrap();
    let result = &resp.results[0];
    assert_eq!(result.succeeded, 3);
    assert_eq!(result.failed, 1);

    let failure = result.shards.iter().find(|s| s.error.is_some()).unwrap();
    assert_eq!(failure.shard, hashes[0]);
    assert!(!result.passages.is_empty(), "successful shards still contribute");
}

#[tokio::test]
async fn all_shards_failing_is_a_composite_error() {
    let (service, _) = TestService::with_shards(&[("a.txt", "text")]);
    let bogus = vec!["0".repeat(32), "1".repeat(32)];

    let err = run_multi_query(&service.ctx, multi_request(&["q"], &bogus)).await.unwrap_err();
    match err {
        Error::AllShardsFailed { count, summary } => {
            assert_eq!(count, 2);
            assert!(!summary.is_empty());
        }
        other => panic!("expected AllShardsFailed, got {other}"),
    }
}

#[tokio::test]
async fn external_source_joins_the_fan_out() {
    let (service, hashes) = TestService::with_shards(&[("a.txt", "internal shard")]);

    // A second, separately built collection joins via external_sources.
    let external = TestService::with_files(&[("x.txt", "external knowledge about comets")]);

    let mut req = multi_request(&["comets"], &hashes);
    req.external_sources = vec![external.root().to_path_buf()];

    let resp = run_multi_query(&service.ctx, req).await.unwrap();
    let result = &resp.results[0];
    assert_eq!(result.succeeded, 2);
    assert!(result.passages.iter().any(|p| p.sources.contains(&"x.txt".to_string())));
}

// ---------------------------------------------------------------------------
// Reload atomicity under concurrent queries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn in_flight_query_survives_concurrent_reload() {
    let service = TestService::with_files(&[("a.txt", "stable content for racing queries")]);

    // Pin the pre-reload handle like an in-flight query would.
    let (old_entry, _) = service.ctx.cache.get_or_load(service.root()).await.unwrap();

    std::fs::write(service.root().join("b.txt"), "content added during the race").unwrap();
    let reload = run_reload(&service.ctx, None);
    let query = run_query(&service.ctx, None, "stable content", None);
    let (reload_result, query_result) = tokio::join!(reload, query);
    reload_result.unwrap();
    query_result.unwrap();

    // The old handle still searches the old index.
    assert_eq!(old_entry.doc_count(), 1);
    let (new_entry, hit) = service.ctx.cache.get_or_load(service.root()).await.unwrap();
    assert!(hit);
    assert_eq!(new_entry.doc_count(), 2);
    assert!(!Arc::ptr_eq(&old_entry, &new_entry));
}
