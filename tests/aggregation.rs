//! Read-side aggregation: statistics, per-meter statistics, trends, and
//! per-session aggregate columns.

use meter_sessions::domain::{ReadingInput, TrendBucket};
use meter_sessions::{Store, StoreError};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

fn at(days: i64) -> OffsetDateTime {
    datetime!(2024-01-01 00:00:00 UTC) + Duration::days(days)
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[tokio::test]
async fn two_meter_scenario_produces_expected_deltas_costs_and_totals() {
    let store = Store::connect_in_memory().await.unwrap();
    let a = store.create_meter("electricity", Some("kWh")).await.unwrap().id;
    let b = store.create_meter("gas", Some("m3")).await.unwrap().id;

    let s1 = store
        .create_session(
            0.30,
            vec![
                ReadingInput { meter_id: a, value: 100.0 },
                ReadingInput { meter_id: b, value: 50.0 },
            ],
            None,
            Some(at(1)),
        )
        .await
        .unwrap();
    assert!(s1.readings.iter().all(|r| r.delta.is_none()));
    assert_eq!(s1.meter_count, 2);
    assert!(approx(s1.total_delta, 0.0));
    assert!(approx(s1.total_cost, 0.0));

    let s2 = store
        .create_session(
            0.32,
            vec![
                ReadingInput { meter_id: a, value: 110.0 },
                ReadingInput { meter_id: b, value: 55.0 },
            ],
            None,
            Some(at(2)),
        )
        .await
        .unwrap();

    let ra = s2.readings.iter().find(|r| r.meter_id == a).unwrap();
    let rb = s2.readings.iter().find(|r| r.meter_id == b).unwrap();
    assert_eq!(ra.delta, Some(10.0));
    assert!(approx(ra.cost(s2.session.price).unwrap(), 3.2));
    assert_eq!(rb.delta, Some(5.0));
    assert!(approx(rb.cost(s2.session.price).unwrap(), 1.6));
    assert!(approx(s2.total_delta, 15.0));
    assert!(approx(s2.total_cost, 4.8));
}

#[tokio::test]
async fn statistics_exclude_null_delta_readings() {
    let store = Store::connect_in_memory().await.unwrap();
    let m = store.create_meter("electricity", None).await.unwrap().id;

    store
        .create_session(0.40, vec![ReadingInput { meter_id: m, value: 100.0 }], None, Some(at(1)))
        .await
        .unwrap();
    store
        .create_session(0.50, vec![ReadingInput { meter_id: m, value: 110.0 }], None, Some(at(2)))
        .await
        .unwrap();

    let stats = store.statistics(None, None).await.unwrap();
    // The first reading has a null delta and must not leak into any figure.
    assert_eq!(stats.total_sessions, 1);
    assert_eq!(stats.total_readings, 1);
    assert!(approx(stats.total_consumption, 10.0));
    assert!(approx(stats.total_cost, 5.0));
    assert_eq!(stats.avg_consumption_per_meter, Some(10.0));
    assert_eq!(stats.avg_price, Some(0.50));
    assert_eq!(stats.min_price, Some(0.50));
    assert_eq!(stats.max_price, Some(0.50));
}

#[tokio::test]
async fn statistics_over_empty_range_are_zero_and_none() {
    let store = Store::connect_in_memory().await.unwrap();
    let stats = store.statistics(None, None).await.unwrap();
    assert_eq!(stats.total_sessions, 0);
    assert_eq!(stats.total_readings, 0);
    assert!(approx(stats.total_consumption, 0.0));
    assert!(approx(stats.total_cost, 0.0));
    assert_eq!(stats.avg_price, None);
    assert_eq!(stats.min_price, None);
}

#[tokio::test]
async fn statistics_respect_the_timestamp_range() {
    let store = Store::connect_in_memory().await.unwrap();
    let m = store.create_meter("electricity", None).await.unwrap().id;

    for (day, value) in [(1, 10.0), (2, 20.0), (3, 40.0)] {
        store
            .create_session(0.5, vec![ReadingInput { meter_id: m, value }], None, Some(at(day)))
            .await
            .unwrap();
    }

    // Only the day-2 session falls inside the window; its delta is 10.
    let stats = store.statistics(Some(at(2)), Some(at(2))).await.unwrap();
    assert_eq!(stats.total_sessions, 1);
    assert!(approx(stats.total_consumption, 10.0));

    let open_ended = store.statistics(Some(at(3)), None).await.unwrap();
    assert!(approx(open_ended.total_consumption, 20.0));
}

#[tokio::test]
async fn meter_statistics_cover_one_meter_only() {
    let store = Store::connect_in_memory().await.unwrap();
    let a = store.create_meter("electricity", None).await.unwrap().id;
    let b = store.create_meter("gas", None).await.unwrap().id;

    for (day, va, vb) in [(1, 100.0, 50.0), (2, 110.0, 57.0)] {
        store
            .create_session(
                0.25,
                vec![
                    ReadingInput { meter_id: a, value: va },
                    ReadingInput { meter_id: b, value: vb },
                ],
                None,
                Some(at(day)),
            )
            .await
            .unwrap();
    }

    let stats = store.meter_statistics(b, None, None).await.unwrap();
    assert_eq!(stats.total_readings, 1);
    assert!(approx(stats.total_consumption, 7.0));
    assert!(approx(stats.total_cost, 1.75));
    assert_eq!(stats.avg_consumption, Some(7.0));

    assert!(matches!(
        store.meter_statistics(999, None, None).await.unwrap_err(),
        StoreError::NotFound { .. }
    ));
}

#[tokio::test]
async fn trend_buckets_by_day_most_recent_first() {
    let store = Store::connect_in_memory().await.unwrap();
    let m = store.create_meter("electricity", None).await.unwrap().id;

    // Two sessions on day 2, one on day 3; day 1 only seeds the chain.
    let inputs = [
        (datetime!(2024-01-01 08:00:00 UTC), 100.0),
        (datetime!(2024-01-02 08:00:00 UTC), 110.0),
        (datetime!(2024-01-02 20:00:00 UTC), 115.0),
        (datetime!(2024-01-03 08:00:00 UTC), 130.0),
    ];
    for (ts, value) in inputs {
        store
            .create_session(0.5, vec![ReadingInput { meter_id: m, value }], None, Some(ts))
            .await
            .unwrap();
    }

    let trend = store.trend(TrendBucket::Day, 30).await.unwrap();
    assert_eq!(trend.len(), 2);

    assert_eq!(trend[0].period, "2024-01-03");
    assert!(approx(trend[0].consumption, 15.0));
    assert_eq!(trend[0].session_count, 1);
    assert_eq!(trend[0].reading_count, 1);

    assert_eq!(trend[1].period, "2024-01-02");
    assert!(approx(trend[1].consumption, 15.0));
    assert_eq!(trend[1].session_count, 2);
    assert_eq!(trend[1].reading_count, 2);
    assert!(approx(trend[1].avg_price, 0.5));

    // The cap keeps only the most recent buckets.
    let capped = store.trend(TrendBucket::Day, 1).await.unwrap();
    assert_eq!(capped.len(), 1);
    assert_eq!(capped[0].period, "2024-01-03");
}

#[tokio::test]
async fn session_list_is_most_recent_first_with_pagination() {
    let store = Store::connect_in_memory().await.unwrap();
    let m = store.create_meter("electricity", None).await.unwrap().id;

    for (day, value) in [(1, 10.0), (2, 20.0), (3, 30.0)] {
        store
            .create_session(0.5, vec![ReadingInput { meter_id: m, value }], None, Some(at(day)))
            .await
            .unwrap();
    }

    let page = store.sessions(2, 0).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].session.timestamp, at(3));
    assert_eq!(page[1].session.timestamp, at(2));

    let rest = store.sessions(2, 2).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].session.timestamp, at(1));
}
