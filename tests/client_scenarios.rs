use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use twitch_bridge::http::mock::MockTransport;
use twitch_bridge::http::Response;
use twitch_bridge::{ApiError, ClientBuilder, Config, Outcome, Request, RequestState, TwitchClient};

type Seen = Rc<RefCell<Vec<(u32, Outcome, std::thread::ThreadId)>>>;

fn fast_config() -> Config {
    Config {
        backoff_base_ms: 10,
        backoff_cap_ms: 50,
        max_retries: 2,
        ..Config::new("cid")
    }
}

fn client_with(mock: &MockTransport, cfg: Config) -> TwitchClient {
    ClientBuilder::new(cfg)
        .transport(Arc::new(mock.clone()))
        .build()
        .unwrap()
}

fn recorder(seen: &Seen, n: u32) -> impl FnOnce(Outcome) + 'static {
    let seen = seen.clone();
    move |outcome| {
        seen.borrow_mut()
            .push((n, outcome, std::thread::current().id()))
    }
}

fn pump_until_idle(client: &mut TwitchClient, limit: Duration) {
    let deadline = Instant::now() + limit;
    while client.pending() > 0 {
        assert!(Instant::now() < deadline, "requests still pending after {:?}", limit);
        client.wait_for_events(Duration::from_millis(20));
    }
}

fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", limit);
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn every_request_gets_exactly_one_result() {
    let mock = MockTransport::new();
    mock.add_response("GET users/1", Ok(Response::new(200, r#"{"name":"one"}"#)));
    mock.add_response("GET users/2", Ok(Response::new(404, "")));
    mock.add_response("GET users/3", Ok(Response::new(503, "")));
    mock.add_response("GET users/3", Ok(Response::new(200, "{}")));
    mock.add_response("GET users/4", Ok(Response::new(200, "<html>")));
    let mut client = client_with(&mock, fast_config());
    let seen: Seen = Default::default();

    let handles: Vec<_> = (1..=5)
        .map(|n| client.submit(Request::get(format!("users/{n}")), recorder(&seen, n)))
        .collect();
    assert!(handles.windows(2).all(|w| w[0] < w[1]));

    pump_until_idle(&mut client, Duration::from_secs(10));
    // Nothing else arrives later.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(client.process_events(), 0);

    let seen = seen.borrow();
    let mut ids: Vec<u32> = seen.iter().map(|(n, _, _)| *n).collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    let by_id = |id: u32| &seen.iter().find(|(n, _, _)| *n == id).unwrap().1;
    assert_eq!(by_id(1).as_ref().unwrap().body["name"], "one");
    assert_eq!(by_id(2).as_ref().unwrap_err().code(), "not_found");
    assert!(by_id(3).is_ok());
    assert!(matches!(by_id(4), Err(ApiError::Decode(_))));
    assert!(matches!(by_id(5), Err(ApiError::Network(_))));
    assert_eq!(mock.calls_for("GET users/3"), 2);
    // The unscripted route is retried like any network failure.
    assert_eq!(mock.calls_for("GET users/5"), 3);
    assert!(handles.iter().all(|h| client.state(*h).is_none()));
}

#[test]
fn quota_scenario_third_request_waits_for_reset() {
    let mock = MockTransport::new();
    let reset = (chrono::Utc::now().timestamp() + 2).to_string();
    mock.add_response(
        "GET streams",
        Ok(Response::new(200, "{}")
            .with_header("Ratelimit-Limit", "2")
            .with_header("Ratelimit-Remaining", "1")
            .with_header("Ratelimit-Reset", &reset)),
    );
    mock.add_response(
        "GET streams",
        Ok(Response::new(200, "{}")
            .with_header("Ratelimit-Limit", "2")
            .with_header("Ratelimit-Remaining", "0")
            .with_header("Ratelimit-Reset", &reset)),
    );
    mock.add_response("GET streams", Ok(Response::new(200, "{}")));

    let mut client = client_with(&mock, fast_config());
    let seen: Seen = Default::default();
    for n in 1..=3 {
        client.submit(Request::get("streams"), recorder(&seen, n));
    }
    pump_until_idle(&mut client, Duration::from_secs(10));

    let calls = mock.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[1].at - calls[0].at < Duration::from_millis(500));
    assert!(
        calls[2].at - calls[1].at >= Duration::from_millis(900),
        "third request went out before the reset"
    );
    assert_eq!(mock.peak_in_flight(), 1);

    let gui = std::thread::current().id();
    let seen = seen.borrow();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(_, outcome, thread)| outcome.is_ok() && *thread == gui));
    assert!(calls.iter().all(|c| c.thread != gui));
    assert_eq!(seen.iter().map(|(n, _, _)| *n).collect::<Vec<_>>(), vec![1, 2, 3]);
}

#[test]
fn cancelling_queued_request_skips_transport() {
    let mock = MockTransport::new();
    let release = mock.add_response_with_trigger("GET first", Ok(Response::new(200, "{}")));
    mock.add_response("GET second", Ok(Response::new(200, "{}")));
    let mut client = client_with(&mock, fast_config());
    let seen: Seen = Default::default();

    let first = client.submit(Request::get("first"), recorder(&seen, 1));
    let second = client.submit(Request::get("second"), recorder(&seen, 2));
    wait_until(Duration::from_secs(5), || mock.in_flight() == 1);
    assert_eq!(client.state(first), Some(RequestState::InFlight));
    assert_eq!(client.state(second), Some(RequestState::Queued));

    assert!(client.cancel(second));
    assert!(!client.cancel(second));
    release.send(()).unwrap();
    pump_until_idle(&mut client, Duration::from_secs(5));
    std::thread::sleep(Duration::from_millis(100));
    client.process_events();

    assert_eq!(mock.calls_for("GET second"), 0);
    assert_eq!(seen.borrow().len(), 1);
    assert_eq!(seen.borrow()[0].0, 1);
}

#[test]
fn cancelling_in_flight_request_discards_result() {
    let mock = MockTransport::new();
    let release = mock.add_response_with_trigger("GET slow", Ok(Response::new(200, "{}")));
    let mut client = client_with(&mock, fast_config());
    let seen: Seen = Default::default();

    let handle = client.submit(Request::get("slow"), recorder(&seen, 1));
    wait_until(Duration::from_secs(5), || mock.in_flight() == 1);
    assert!(client.cancel(handle));
    let _ = release.send(());
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(client.process_events(), 0);
    assert_eq!(client.pending(), 0);
    assert!(seen.borrow().is_empty());
    // The abandoned transport future was dropped.
    wait_until(Duration::from_secs(5), || mock.in_flight() == 0);
}

#[test]
fn cancel_after_completion_but_before_delivery() {
    let mock = MockTransport::new();
    mock.add_response("GET done", Ok(Response::new(200, "{}")));
    let mut client = client_with(&mock, fast_config());
    let seen: Seen = Default::default();

    let handle = client.submit(Request::get("done"), recorder(&seen, 1));
    wait_until(Duration::from_secs(5), || {
        client.state(handle) == Some(RequestState::Succeeded)
    });
    assert!(client.cancel(handle));
    assert_eq!(client.process_events(), 0);
    assert!(seen.borrow().is_empty());
}

#[test]
fn retries_are_bounded_by_config() {
    let mock = MockTransport::new();
    for _ in 0..10 {
        mock.add_response("GET games/top", Ok(Response::new(502, "")));
    }
    let mut client = client_with(&mock, fast_config());
    let seen: Seen = Default::default();
    client.submit(Request::get("games/top"), recorder(&seen, 1));
    pump_until_idle(&mut client, Duration::from_secs(5));
    assert_eq!(mock.call_count(), 3);
    assert_eq!(
        seen.borrow()[0].1.as_ref().unwrap_err().code(),
        "upstream_error"
    );
}

#[test]
fn endpoint_table_calls_and_validation() {
    let mock = MockTransport::new();
    mock.add_response("GET channels/44322889/follows", Ok(Response::new(200, r#"{"_total":0}"#)));
    let mut client = client_with(&mock, fast_config());
    let seen: Seen = Default::default();

    let mut args = BTreeMap::new();
    args.insert("channel_id".to_string(), "44322889".to_string());
    let mut params = BTreeMap::new();
    params.insert("limit".to_string(), "25".to_string());
    client
        .call("get_channel_followers", &args, params, recorder(&seen, 1))
        .unwrap();
    pump_until_idle(&mut client, Duration::from_secs(5));
    let call = &mock.calls()[0];
    assert_eq!(call.request.params.get("limit").map(String::as_str), Some("25"));
    assert!(seen.borrow()[0].1.is_ok());

    let unknown = client.call("get_everything", &BTreeMap::new(), BTreeMap::new(), |_| {});
    assert!(matches!(unknown, Err(ApiError::InvalidRequest(_))));
    let mut too_many = BTreeMap::new();
    too_many.insert("limit".to_string(), "500".to_string());
    assert!(client
        .call("get_channel_followers", &args, too_many, |_| {})
        .is_err());
    assert_eq!(client.pending(), 0);
}

#[test]
fn wake_hook_fires_and_external_runtime_is_used() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mock = MockTransport::new();
    mock.add_response("GET bits/actions", Ok(Response::new(200, "{}")));
    let wakes = Arc::new(AtomicUsize::new(0));
    let counter = wakes.clone();
    let mut client = ClientBuilder::new(fast_config())
        .transport(Arc::new(mock.clone()))
        .runtime(rt.handle().clone())
        .on_wake(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();
    assert!(!client.owns_runtime());

    let seen: Seen = Default::default();
    client.submit(Request::get("bits/actions"), recorder(&seen, 1));
    pump_until_idle(&mut client, Duration::from_secs(5));
    assert_eq!(wakes.load(Ordering::SeqCst), 1);
    assert_eq!(seen.borrow().len(), 1);
}

#[test]
fn separate_buckets_do_not_block_each_other() {
    let mock = MockTransport::new();
    let far = (chrono::Utc::now().timestamp() + 600).to_string();
    mock.add_response(
        "GET clips/top",
        Ok(Response::new(200, "{}")
            .with_header("Ratelimit-Remaining", "0")
            .with_header("Ratelimit-Reset", &far)),
    );
    mock.add_response("GET clips/top", Ok(Response::new(200, "{}")));
    mock.add_response("GET streams", Ok(Response::new(200, "{}")));
    // One concurrency slot: a bucket waiting for its reset must not hold it.
    let cfg = fast_config();
    assert_eq!(cfg.max_concurrency, 1);
    let mut client = client_with(&mock, cfg);
    let seen: Seen = Default::default();

    client.submit(Request::get("clips/top").with_bucket("clips"), recorder(&seen, 1));
    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.borrow().is_empty() {
        assert!(Instant::now() < deadline, "first clip request never completed");
        client.wait_for_events(Duration::from_millis(20));
    }
    let blocked = client.submit(Request::get("clips/top").with_bucket("clips"), recorder(&seen, 2));
    client.submit(Request::get("streams"), recorder(&seen, 3));

    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.borrow().len() < 2 && Instant::now() < deadline {
        client.wait_for_events(Duration::from_millis(20));
    }
    let done: Vec<u32> = seen.borrow().iter().map(|(n, _, _)| *n).collect();
    assert_eq!(done, vec![1, 3]);
    assert_eq!(client.state(blocked), Some(RequestState::Queued));
    assert_eq!(client.rate_limit("clips").and_then(|s| s.remaining), Some(0));
    assert!(client.cancel(blocked));
}
