//! End-to-end search behavior against the in-memory test stores.

use assert_matches::assert_matches;
use data_types::{ChunkId, Record, ResumePosition, ResumeToken, StoreId, EXHAUSTED};
use grebe_query::{
    test::{TestCatalog, TestChunk, TestRecord, TestStore},
    Engine, Error, PlanAction, Query,
};
use grebe_time::Time;
use predicate::{CompareOp, Expr, Predicate};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn engine(catalog: &Arc<TestCatalog>) -> Engine {
    Engine::new(Arc::clone(catalog) as _)
}

fn secs(t: i64) -> Option<Time> {
    Some(Time::from_timestamp(t, 0))
}

fn raws(records: &[Record]) -> Vec<String> {
    records
        .iter()
        .map(|r| String::from_utf8_lossy(&r.raw).into_owned())
        .collect()
}

async fn run(engine: &Engine, query: &Query) -> Vec<Record> {
    engine
        .search(CancellationToken::new(), query, None)
        .await
        .unwrap()
        .collect()
        .await
        .unwrap()
}

#[tokio::test]
async fn forward_search_respects_bounds_and_exhausts() {
    test_helpers::maybe_start_logging();
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_raw("r1"),
        TestRecord::at(1).with_raw("r2"),
        TestRecord::at(2).with_raw("r3"),
        TestRecord::at(3).with_raw("r4"),
    ]));
    let engine = engine(&catalog);

    let query = Query {
        start: secs(1),
        end: secs(3),
        limit: Some(10),
        ..Default::default()
    };
    let mut results = engine
        .search(CancellationToken::new(), &query, None)
        .await
        .unwrap();
    let records = results.collect().await.unwrap();

    assert_eq!(raws(&records), vec!["r2", "r3"]);
    // everything in range was yielded: no continuation
    assert_eq!(results.resume_token(), None);
}

#[tokio::test]
async fn inverted_bounds_yield_reverse_order() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_raw("r1"),
        TestRecord::at(1).with_raw("r2"),
        TestRecord::at(2).with_raw("r3"),
        TestRecord::at(3).with_raw("r4"),
    ]));
    let engine = engine(&catalog);

    let query = Query {
        start: secs(4),
        end: secs(-1),
        ..Default::default()
    };
    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["r4", "r3", "r2", "r1"]);
}

#[tokio::test]
async fn or_expression_unions_index_positions() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_raw("error connect"),
        TestRecord::at(1).with_raw("warn connect"),
        TestRecord::at(2).with_raw("info retry"),
    ]));
    let engine = engine(&catalog);

    let query = Query {
        expr: Some(Expr::or(vec![
            Expr::pred(Predicate::token("error")),
            Expr::pred(Predicate::token("retry")),
        ])),
        ..Default::default()
    };

    let plan = engine.explain(&query).await.unwrap();
    assert_eq!(plan.chunks.len(), 1);
    assert_eq!(plan.chunks[0].action, PlanAction::Positional { positions: 2 });

    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["error connect", "info retry"]);
}

#[tokio::test]
async fn resume_across_chunks() {
    let (catalog, store) = TestCatalog::with_one_store();
    let c1 = store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_raw("r1"),
        TestRecord::at(1).with_raw("r2"),
    ]));
    let c2 = store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(2).with_raw("r3"),
        TestRecord::at(3).with_raw("r4"),
    ]));
    let engine = engine(&catalog);

    let query = Query {
        limit: Some(3),
        ..Default::default()
    };
    let mut results = engine
        .search(CancellationToken::new(), &query, None)
        .await
        .unwrap();
    let page = results.collect().await.unwrap();
    assert_eq!(raws(&page), vec!["r1", "r2", "r3"]);

    let token = results.resume_token().expect("limit cut leaves a token");
    assert_eq!(token.position_for(store.id(), c1.id()), Some(EXHAUSTED));
    assert_eq!(token.position_for(store.id(), c2.id()), Some(0));

    let query = Query::default();
    let mut results = engine
        .search(CancellationToken::new(), &query, Some(&token))
        .await
        .unwrap();
    let page = results.collect().await.unwrap();
    assert_eq!(raws(&page), vec!["r4"]);
    assert_eq!(results.resume_token(), None);
}

#[tokio::test]
async fn paginated_runs_equal_single_run() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records(
        (0..5).map(|i| TestRecord::at(i * 2).with_raw(&format!("a{}", i))),
    ));
    store.add_chunk(TestChunk::new().with_records(
        (0..5).map(|i| TestRecord::at(i * 2 + 1).with_raw(&format!("b{}", i))),
    ));
    let engine = engine(&catalog);

    let all = run(&engine, &Query::default()).await;
    assert_eq!(all.len(), 10);

    let mut paged: Vec<Record> = vec![];
    let mut token: Option<ResumeToken> = None;
    loop {
        let query = Query {
            limit: Some(3),
            ..Default::default()
        };
        let mut results = engine
            .search(CancellationToken::new(), &query, token.as_ref())
            .await
            .unwrap();
        let page = results.collect().await.unwrap();
        let done = page.is_empty();
        paged.extend(page);
        token = results.resume_token();
        if done || token.is_none() {
            break;
        }
    }

    assert_eq!(raws(&paged), raws(&all));
}

#[tokio::test]
async fn merge_is_ordered_by_ingest_ts_both_directions() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records(
        [0, 2, 4].map(|i| TestRecord::at(i).with_raw(&format!("r{}", i))),
    ));
    store.add_chunk(TestChunk::new().with_records(
        [1, 3, 5].map(|i| TestRecord::at(i).with_raw(&format!("r{}", i))),
    ));
    let engine = engine(&catalog);

    let forward = run(&engine, &Query::default()).await;
    assert_eq!(raws(&forward), vec!["r0", "r1", "r2", "r3", "r4", "r5"]);

    let reverse = run(
        &engine,
        &Query {
            reverse: true,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(raws(&reverse), vec!["r5", "r4", "r3", "r2", "r1", "r0"]);
}

#[tokio::test]
async fn records_replicated_across_stores_are_deduplicated() {
    let catalog = TestCatalog::new();
    let store_a = TestStore::new();
    let store_b = TestStore::new();
    catalog.add_store(Arc::clone(&store_a));
    catalog.add_store(Arc::clone(&store_b));

    let replicated = || {
        TestRecord::at(5)
            .with_raw("shared line")
            .with_attr("ingester_id", "ing-1")
    };
    store_a.add_chunk(
        TestChunk::new()
            .with_record(replicated())
            .with_record(TestRecord::at(6).with_raw("unmarked")),
    );
    store_b.add_chunk(
        TestChunk::new()
            .with_record(replicated())
            .with_record(TestRecord::at(6).with_raw("unmarked")),
    );
    let engine = engine(&catalog);

    let records = run(&engine, &Query::default()).await;
    // the marked record collapses to one copy; unmarked records do not dedup
    assert_eq!(raws(&records), vec!["shared line", "unmarked", "unmarked"]);
}

#[tokio::test]
async fn invalid_resume_token_is_rejected() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_record(TestRecord::at(0).with_raw("r1")));
    let engine = engine(&catalog);

    let token = ResumeToken {
        positions: vec![ResumePosition {
            store_id: store.id(),
            chunk_id: ChunkId::new(),
            position: 3,
        }],
    };
    let err = engine
        .search(CancellationToken::new(), &Query::default(), Some(&token))
        .await
        .unwrap_err();
    assert_matches!(err, Error::InvalidResumeToken { .. });
}

#[tokio::test]
async fn fully_exhausted_token_yields_nothing() {
    let (catalog, store) = TestCatalog::with_one_store();
    let chunk = store.add_chunk(TestChunk::new().with_record(TestRecord::at(0).with_raw("r1")));
    let engine = engine(&catalog);

    let token = ResumeToken {
        positions: vec![ResumePosition {
            store_id: store.id(),
            chunk_id: chunk.id(),
            position: EXHAUSTED,
        }],
    };
    let mut results = engine
        .search(CancellationToken::new(), &Query::default(), Some(&token))
        .await
        .unwrap();
    assert_eq!(results.collect().await.unwrap(), vec![]);
    assert_eq!(results.resume_token(), None);
}

#[tokio::test]
async fn indexable_token_miss_skips_chunk() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_record(TestRecord::at(0).with_raw("warn things")));
    let engine = engine(&catalog);

    let query = Query {
        expr: Some(Expr::pred(Predicate::token("error"))),
        ..Default::default()
    };
    let plan = engine.explain(&query).await.unwrap();
    assert_eq!(plan.chunks[0].action, PlanAction::Skip);
    assert!(run(&engine, &query).await.is_empty());
}

#[tokio::test]
async fn non_indexable_token_scans_sequentially() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_raw("path a.b.c hit"),
        TestRecord::at(1).with_raw("path x.y.z miss"),
    ]));
    let engine = engine(&catalog);

    let query = Query {
        expr: Some(Expr::pred(Predicate::token("a.b"))),
        ..Default::default()
    };
    let plan = engine.explain(&query).await.unwrap();
    assert_eq!(plan.chunks[0].action, PlanAction::Sequential);

    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["path a.b.c hit"]);
}

#[tokio::test]
async fn attr_kv_query_uses_positional_scan() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_raw("one").with_attr("level", "error"),
        TestRecord::at(1).with_raw("two").with_attr("level", "info"),
        TestRecord::at(2).with_raw("three").with_attr("level", "error"),
    ]));
    let engine = engine(&catalog);

    let query = Query {
        expr: Some(Expr::pred(Predicate::kv_eq("level", "error").unwrap())),
        ..Default::default()
    };
    let plan = engine.explain(&query).await.unwrap();
    assert_eq!(plan.chunks[0].action, PlanAction::Positional { positions: 2 });

    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["one", "three"]);
}

#[tokio::test]
async fn capped_body_index_demotes_to_runtime() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(
        TestChunk::new()
            .with_capped_kv_index()
            .with_records([
                TestRecord::at(0).with_raw("msg=boom level=error"),
                TestRecord::at(1).with_raw("msg=fine level=info"),
            ]),
    );
    let engine = engine(&catalog);

    let query = Query {
        expr: Some(Expr::pred(Predicate::kv_eq("level", "error").unwrap())),
        ..Default::default()
    };
    let plan = engine.explain(&query).await.unwrap();
    assert_eq!(plan.chunks[0].action, PlanAction::Sequential);

    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["msg=boom level=error"]);
}

#[tokio::test]
async fn negated_predicates_filter_at_runtime() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_raw("error while connecting"),
        TestRecord::at(1).with_raw("error during retry"),
    ]));
    let engine = engine(&catalog);

    let query = Query {
        expr: Some(Expr::and(vec![
            Expr::pred(Predicate::token("error")),
            Expr::not(Expr::pred(Predicate::token("retry"))),
        ])),
        ..Default::default()
    };
    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["error while connecting"]);
}

#[tokio::test]
async fn active_chunks_are_always_scanned() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(
        TestChunk::new().active().with_records([
            TestRecord::at(100).with_raw("error live"),
            TestRecord::at(101).with_raw("info live"),
        ]),
    );
    let engine = engine(&catalog);

    // bounds that would reject a sealed chunk of this age do not matter:
    // the active chunk has open end bounds
    let query = Query {
        start: secs(0),
        end: secs(1_000),
        expr: Some(Expr::pred(Predicate::token("error"))),
        ..Default::default()
    };
    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["error live"]);
}

#[tokio::test]
async fn store_selector_restricts_and_unknown_store_errors() {
    let catalog = TestCatalog::new();
    let store_a = TestStore::new();
    let store_b = TestStore::new();
    catalog.add_store(Arc::clone(&store_a));
    catalog.add_store(Arc::clone(&store_b));
    store_a.add_chunk(TestChunk::new().with_record(TestRecord::at(0).with_raw("from a")));
    store_b.add_chunk(TestChunk::new().with_record(TestRecord::at(1).with_raw("from b")));
    let engine = engine(&catalog);

    let query = Query {
        expr: Some(Expr::pred(
            Predicate::kv_eq("store", &store_a.id().to_string()).unwrap(),
        )),
        ..Default::default()
    };
    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["from a"]);

    let query = Query {
        expr: Some(Expr::pred(
            Predicate::kv_eq("store", &StoreId::new().to_string()).unwrap(),
        )),
        ..Default::default()
    };
    let err = engine
        .search(CancellationToken::new(), &query, None)
        .await
        .unwrap_err();
    assert_matches!(err, Error::UnknownStore { .. });
}

#[tokio::test]
async fn chunk_selector_restricts() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_record(TestRecord::at(0).with_raw("first")));
    let c2 = store.add_chunk(TestChunk::new().with_record(TestRecord::at(1).with_raw("second")));
    let engine = engine(&catalog);

    let query = Query {
        expr: Some(Expr::pred(
            Predicate::kv_eq("chunk", &c2.id().to_string()).unwrap(),
        )),
        ..Default::default()
    };
    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["second"]);
}

#[tokio::test]
async fn ingest_bounds_filter_records() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_ingest(10).with_raw("early"),
        TestRecord::at(1).with_ingest(20).with_raw("late"),
    ]));
    let engine = engine(&catalog);

    let query = Query {
        ingest_start: secs(15),
        ..Default::default()
    };
    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["late"]);
}

#[tokio::test]
async fn positional_restriction_pins_one_record() {
    let (catalog, store) = TestCatalog::with_one_store();
    let chunk = store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_raw("zero"),
        TestRecord::at(1).with_raw("one"),
        TestRecord::at(2).with_raw("two"),
    ]));
    let engine = engine(&catalog);

    let query = Query {
        pos: Some(data_types::RecordRef {
            store_id: store.id(),
            chunk_id: chunk.id(),
            position: 1,
        }),
        ..Default::default()
    };
    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["one"]);
}

#[tokio::test]
async fn cancellation_surfaces_as_error() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_record(TestRecord::at(0).with_raw("r1")));
    let engine = engine(&catalog);

    let cancel = CancellationToken::new();
    let mut results = engine
        .search(cancel.clone(), &Query::default(), None)
        .await
        .unwrap();
    cancel.cancel();
    assert_matches!(results.next().await, Err(Error::Canceled));
}

#[tokio::test]
async fn read_record_and_unknown_chunk() {
    let (catalog, store) = TestCatalog::with_one_store();
    let chunk = store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_raw("zero"),
        TestRecord::at(1).with_raw("one"),
    ]));
    let engine = engine(&catalog);

    let record = engine
        .read_record(store.id(), chunk.id(), 1)
        .await
        .unwrap();
    assert_eq!(record.raw, b"one");

    let err = engine
        .read_record(store.id(), ChunkId::new(), 0)
        .await
        .unwrap_err();
    assert_matches!(err, Error::UnknownChunk { .. });

    let err = engine
        .read_record(StoreId::new(), chunk.id(), 0)
        .await
        .unwrap_err();
    assert_matches!(err, Error::UnknownStore { .. });
}

#[tokio::test]
async fn glob_uses_prefix_candidates_and_verifies() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_raw("calling com.example.controller"),
        TestRecord::at(1).with_raw("calling org.example.service"),
    ]));
    let engine = engine(&catalog);

    let query = Query {
        expr: Some(Expr::pred(Predicate::glob("com*controller").unwrap())),
        ..Default::default()
    };
    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["calling com.example.controller"]);
}

#[tokio::test]
async fn value_comparisons_are_numeric_aware() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_raw("slow").with_attr("latency_ms", "250"),
        TestRecord::at(1).with_raw("fast").with_attr("latency_ms", "9"),
    ]));
    let engine = engine(&catalog);

    let query = Query {
        expr: Some(Expr::pred(
            Predicate::kv("latency_ms", CompareOp::Gt, "100").unwrap(),
        )),
        ..Default::default()
    };
    let records = run(&engine, &query).await;
    assert_eq!(raws(&records), vec!["slow"]);
}
