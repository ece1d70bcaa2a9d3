//! Histogram fast and slow paths.

use grebe_query::{
    histogram::HistogramQuery,
    test::{TestCatalog, TestChunk, TestRecord},
    Engine, Severity,
};
use grebe_time::Time;
use predicate::{Expr, Predicate};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn engine(catalog: &Arc<TestCatalog>) -> Engine {
    Engine::new(Arc::clone(catalog) as _)
}

fn hq(start: i64, end: i64, buckets: usize) -> HistogramQuery {
    HistogramQuery {
        start: Time::from_timestamp(start, 0),
        end: Time::from_timestamp(end, 0),
        buckets,
        expr: None,
        severity: false,
    }
}

#[tokio::test]
async fn sealed_chunks_answer_from_indexes() {
    let (catalog, store) = TestCatalog::with_one_store();
    // ten records spread over [0s, 10s)
    store.add_chunk(
        TestChunk::new().with_records((0..10).map(|i| TestRecord::at(i).with_raw("x"))),
    );
    let engine = engine(&catalog);

    let result = engine
        .histogram(CancellationToken::new(), &hq(0, 10, 5))
        .await
        .unwrap();

    assert_eq!(result.buckets.len(), 5);
    assert!(result.buckets.iter().all(|b| b.count == 2));
    assert!(!result.truncated);
}

#[tokio::test]
async fn severity_breakdown_via_level_indexes() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_attr("level", "error").with_raw("a"),
        TestRecord::at(1).with_raw("level=err b"),
        TestRecord::at(2).with_attr("severity_name", "warning").with_raw("c"),
        TestRecord::at(3).with_raw("plain line"),
    ]));
    let engine = engine(&catalog);

    let mut query = hq(0, 4, 1);
    query.severity = true;
    let result = engine
        .histogram(CancellationToken::new(), &query)
        .await
        .unwrap();

    assert_eq!(result.buckets.len(), 1);
    let bucket = &result.buckets[0];
    assert_eq!(bucket.count, 4);
    assert_eq!(bucket.by_severity.get(&Severity::Error), Some(&2));
    assert_eq!(bucket.by_severity.get(&Severity::Warn), Some(&1));
    assert_eq!(bucket.by_severity.get(&Severity::Info), None);
}

#[tokio::test]
async fn severity_positions_from_both_indexes_deduplicate() {
    let (catalog, store) = TestCatalog::with_one_store();
    // level appears in the attributes AND the body of the same record: the
    // two index hits must collapse to one count
    store.add_chunk(TestChunk::new().with_record(
        TestRecord::at(0).with_attr("level", "error").with_raw("level=error boom"),
    ));
    let engine = engine(&catalog);

    let mut query = hq(0, 1, 1);
    query.severity = true;
    let result = engine
        .histogram(CancellationToken::new(), &query)
        .await
        .unwrap();

    assert_eq!(result.buckets[0].by_severity.get(&Severity::Error), Some(&1));
}

#[tokio::test]
async fn active_chunks_fall_back_to_scanning() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(
        TestChunk::new()
            .active()
            .with_records((0..4).map(|i| {
                TestRecord::at(i).with_attr("level", "error").with_raw("x")
            })),
    );
    let engine = engine(&catalog);

    let mut query = hq(0, 4, 2);
    query.severity = true;
    let result = engine
        .histogram(CancellationToken::new(), &query)
        .await
        .unwrap();

    assert_eq!(result.buckets.len(), 2);
    assert!(result.buckets.iter().all(|b| b.count == 2));
    assert!(result
        .buckets
        .iter()
        .all(|b| b.by_severity.get(&Severity::Error) == Some(&2)));
}

#[tokio::test]
async fn filtered_histogram_scans_records() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_records([
        TestRecord::at(0).with_raw("error one"),
        TestRecord::at(1).with_raw("info two"),
        TestRecord::at(2).with_raw("error three"),
    ]));
    let engine = engine(&catalog);

    let mut query = hq(0, 3, 3);
    query.expr = Some(Expr::pred(Predicate::token("error")));
    let result = engine
        .histogram(CancellationToken::new(), &query)
        .await
        .unwrap();

    let counts: Vec<u64> = result.buckets.iter().map(|b| b.count).collect();
    assert_eq!(counts, vec![1, 0, 1]);
}

#[tokio::test]
async fn empty_range_yields_no_buckets() {
    let (catalog, store) = TestCatalog::with_one_store();
    store.add_chunk(TestChunk::new().with_record(TestRecord::at(0).with_raw("x")));
    let engine = engine(&catalog);

    let result = engine
        .histogram(CancellationToken::new(), &hq(5, 5, 10))
        .await
        .unwrap();
    assert!(result.buckets.is_empty());
}
