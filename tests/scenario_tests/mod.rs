use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use bandwidth_broker::{
    event::event_bus::Event, Broker, BrokerConfig, CorrelatedRequest, DuplicatePolicy,
    FnObserver, Observer, ObserverContext, ObserverFailure, Payload, ReplyEvent, ReplyOutcome,
    RequestKey, RequestResponse, ResponseStatus,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::{sleep, Duration, Instant};

const UNIT: Duration = Duration::from_millis(50);

fn config(timeout: Duration, policy: DuplicatePolicy) -> BrokerConfig {
    BrokerConfig {
        request_timeout: timeout,
        duplicate_policy: policy,
        ..BrokerConfig::default()
    }
}

/// Replies `details` to every request after `delay`.
fn replying(name: &str, delay: Duration, details: &'static str) -> Arc<dyn Observer> {
    Arc::new(FnObserver::new(
        name,
        move |_: Arc<CorrelatedRequest>, _: ObserverContext| async move {
            sleep(delay).await;
            Some(ReplyOutcome::success(details))
        },
    ))
}

/// Counts requests and never replies.
fn counting(name: &str, seen: Arc<AtomicUsize>) -> Arc<dyn Observer> {
    Arc::new(FnObserver::new(
        name,
        move |_: Arc<CorrelatedRequest>, _: ObserverContext| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                None
            }
        },
    ))
}

async fn wait_registered(broker: &Broker, key: &str) {
    let key = RequestKey::from(key);
    let deadline = Instant::now() + Duration::from_secs(1);
    while !broker.registry().contains(&key) {
        assert!(Instant::now() < deadline, "request {} never registered", key);
        sleep(Duration::from_millis(2)).await;
    }
}

fn spawn_reserve(
    broker: &Arc<Broker>,
    key: &str,
) -> tokio::task::JoinHandle<RequestResponse> {
    let broker = broker.clone();
    let key = RequestKey::from(key);
    tokio::spawn(async move { broker.reserve(key, Payload::new()).await })
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let broker = Broker::start_with(config(UNIT * 5, DuplicatePolicy::Reject), vec![])
        .await
        .unwrap();

    let started = Instant::now();
    let response = broker.reserve(RequestKey::from("A"), Payload::new()).await;

    assert_eq!(response, RequestResponse::failure("timeout"));
    assert!(started.elapsed() >= UNIT * 5);
    assert!(!broker.registry().contains(&RequestKey::from("A")));
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reply_completes_request_before_timeout() {
    let broker = Broker::start_with(
        config(UNIT * 5, DuplicatePolicy::Reject),
        vec![replying("policy", UNIT, "ok")],
    )
    .await
    .unwrap();

    let started = Instant::now();
    let response = broker.reserve(RequestKey::from("B"), Payload::new()).await;

    assert_eq!(response, RequestResponse::ok("ok"));
    assert!(started.elapsed() < UNIT * 4);
    assert!(broker.registry().is_empty());
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_key_is_rejected_and_first_call_unaffected() {
    let broker = Arc::new(
        Broker::start_with(
            config(UNIT * 10, DuplicatePolicy::Reject),
            vec![replying("policy", UNIT * 3, "ok")],
        )
        .await
        .unwrap(),
    );

    let first = spawn_reserve(&broker, "C");
    wait_registered(&broker, "C").await;

    let second = broker.reserve(RequestKey::from("C"), Payload::new()).await;
    assert_eq!(second.status, ResponseStatus::Failure);
    assert_eq!(second.details, "Request already in flight for key: C");

    assert_eq!(first.await.unwrap(), RequestResponse::ok("ok"));
    assert!(broker.registry().is_empty());
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_key_supersedes_under_supersede_policy() {
    let broker = Arc::new(
        Broker::start_with(
            config(UNIT * 10, DuplicatePolicy::Supersede),
            vec![replying("policy", UNIT * 3, "ok")],
        )
        .await
        .unwrap(),
    );

    let first = spawn_reserve(&broker, "C");
    wait_registered(&broker, "C").await;
    let second = spawn_reserve(&broker, "C");

    // The first caller is released immediately, not at its own timeout.
    let first = tokio::time::timeout(UNIT * 2, first)
        .await
        .expect("superseded call should return promptly")
        .unwrap();
    assert_eq!(first.status, ResponseStatus::Failure);
    assert!(first.details.contains("superseded"));

    assert_eq!(second.await.unwrap(), RequestResponse::ok("ok"));
    assert!(broker.registry().is_empty());
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unmatched_reply_has_no_effect() {
    let broker = Arc::new(
        Broker::start_with(
            config(UNIT * 10, DuplicatePolicy::Reject),
            vec![replying("policy", UNIT * 2, "ok")],
        )
        .await
        .unwrap(),
    );

    let in_flight = spawn_reserve(&broker, "D");
    wait_registered(&broker, "D").await;

    broker
        .event_bus()
        .publish(Event::Reply(ReplyEvent::failure(
            RequestKey::from("never-registered"),
            ObserverFailure::Internal {
                message: "stray".to_string(),
            },
        )))
        .await
        .unwrap();

    assert_eq!(in_flight.await.unwrap(), RequestResponse::ok("ok"));
    assert!(broker.registry().is_empty());
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_late_reply_after_timeout_is_ignored() {
    let broker = Broker::start_with(
        config(UNIT * 2, DuplicatePolicy::Reject),
        vec![replying("device", UNIT * 4, "too late")],
    )
    .await
    .unwrap();

    let response = broker.reserve(RequestKey::from("L"), Payload::new()).await;
    assert_eq!(response, RequestResponse::failure("timeout"));

    // Let the late reply arrive; nothing is registered to receive it.
    sleep(UNIT * 4).await;
    assert!(broker.registry().is_empty());
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_late_reply_does_not_resolve_retry_for_same_key() {
    // Answers only the first request it sees, and too late.
    let calls = Arc::new(AtomicUsize::new(0));
    let first_only = Arc::new(FnObserver::new(
        "device",
        move |_: Arc<CorrelatedRequest>, _: ObserverContext| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) > 0 {
                    return None;
                }
                sleep(UNIT * 3).await;
                Some(ReplyOutcome::success("answer-for-first"))
            }
        },
    ));
    let broker = Broker::start_with(config(UNIT * 2, DuplicatePolicy::Reject), vec![first_only])
        .await
        .unwrap();

    let first = broker.reserve(RequestKey::from("A"), Payload::new()).await;
    assert_eq!(first, RequestResponse::failure("timeout"));

    // The first request's reply lands while the retry is waiting.
    let retry = broker.reserve(RequestKey::from("A"), Payload::new()).await;
    assert_eq!(retry, RequestResponse::failure("timeout"));
    assert!(broker.registry().is_empty());
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_every_observer_receives_each_request() {
    let seen = Arc::new(AtomicUsize::new(0));
    let broker = Broker::start_with(
        config(UNIT * 10, DuplicatePolicy::Reject),
        vec![
            counting("policy", seen.clone()),
            counting("filter", seen.clone()),
            counting("state", seen.clone()),
            replying("device", UNIT, "programmed"),
        ],
    )
    .await
    .unwrap();

    let response = broker.reserve(RequestKey::from("F"), Payload::new()).await;
    assert_eq!(response, RequestResponse::ok("programmed"));

    let deadline = Instant::now() + Duration::from_secs(1);
    while seen.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
        sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(seen.load(Ordering::SeqCst), 3);
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_registry_empty_after_mixed_concurrent_requests() {
    // Replies only to even-numbered hosts.
    let selective = Arc::new(FnObserver::new(
        "policy",
        |request: Arc<CorrelatedRequest>, _: ObserverContext| async move {
            let host: u32 = request
                .key()
                .as_str()
                .rsplit('.')
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(1);
            if host % 2 == 0 {
                Some(ReplyOutcome::success("ok"))
            } else {
                None
            }
        },
    ));
    let broker = Arc::new(
        Broker::start_with(config(UNIT * 3, DuplicatePolicy::Reject), vec![selective])
            .await
            .unwrap(),
    );

    let calls: Vec<_> = (0..20)
        .map(|i| spawn_reserve(&broker, &format!("10.0.0.{}", i)))
        .collect();
    let responses = futures::future::join_all(calls).await;

    let ok = responses
        .iter()
        .filter(|r| r.as_ref().unwrap().is_ok())
        .count();
    assert_eq!(ok, 10);
    assert!(broker.registry().is_empty());
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_observer_failures_reach_caller() {
    let not_found = Arc::new(FnObserver::new(
        "filter",
        |request: Arc<CorrelatedRequest>, _: ObserverContext| async move {
            let target = request
                .parameter("flow")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(ReplyOutcome::Failure(ObserverFailure::NotFound { target }))
        },
    ));
    let broker = Broker::start_with(config(UNIT * 5, DuplicatePolicy::Reject), vec![not_found])
        .await
        .unwrap();

    let payload: Payload = [("flow".to_string(), json!("video"))].into_iter().collect();
    let response = broker.reserve(RequestKey::from("10.0.0.5"), payload).await;

    assert_eq!(response, RequestResponse::failure("Target not found: video"));
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_payload_timeout_overrides_default() {
    let broker = Broker::start_with(config(Duration::from_secs(5), DuplicatePolicy::Reject), vec![])
        .await
        .unwrap();

    let payload: Payload = [("timeout_ms".to_string(), json!(UNIT.as_millis() as u64))]
        .into_iter()
        .collect();
    let started = Instant::now();
    let response = broker.reserve(RequestKey::from("T"), payload).await;

    assert_eq!(response, RequestResponse::failure("timeout"));
    assert!(started.elapsed() < Duration::from_secs(1));
    broker.shutdown().await.unwrap();
}
