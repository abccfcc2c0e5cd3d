use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use twitch_bridge::http::{encode_path_segment, error_message, Response};
use twitch_bridge::ratelimit::{extract_rate, retry_after, RateLimitHeaders};
use twitch_bridge::ApiError;

#[test]
fn status_error_mapping() {
    let e = Response::new(429, r#"{"error":"Too Many Requests","status":429,"message":"slow down"}"#)
        .into_payload()
        .unwrap_err();
    assert_eq!(e.code(), "rate_limited");
    assert!(e.retriable());
    assert!(e.is_too_many_requests());

    let e = Response::new(401, r#"{"error":"Unauthorized","status":401,"message":"invalid oauth token"}"#)
        .into_payload()
        .unwrap_err();
    assert_eq!(e.code(), "unauthorized");
    assert_eq!(e.to_info().message, "HTTP 401: invalid oauth token");
    assert!(!e.retriable());
}

#[test]
fn kraken_quota_headers() {
    let reset = chrono::Utc::now().timestamp() + 60;
    let mut h = HeaderMap::new();
    h.insert("ratelimit-limit", "800".parse().unwrap());
    h.insert("ratelimit-remaining", "799".parse().unwrap());
    h.insert("ratelimit-reset", reset.to_string().parse().unwrap());
    h.insert("retry-after", "3".parse().unwrap());
    let rate = extract_rate(&h, &RateLimitHeaders::default());
    assert_eq!(rate.limit, Some(800));
    assert_eq!(rate.remaining, Some(799));
    assert_eq!(rate.reset_at.map(|t| t.timestamp()), Some(reset));
    assert_eq!(retry_after(&h).map(|d| d.as_secs()), Some(3));
}

#[test]
fn clip_creation_bucket_reads_its_own_headers() {
    let mut h = HeaderMap::new();
    h.insert("ratelimit-remaining", "799".parse().unwrap());
    h.insert("ratelimit-helixclipscreation-limit", "600".parse().unwrap());
    h.insert("ratelimit-helixclipscreation-remaining", "0".parse().unwrap());
    let rate = extract_rate(&h, &RateLimitHeaders::prefixed("Ratelimit-Helixclipscreation"));
    assert_eq!(rate.limit, Some(600));
    assert_eq!(rate.remaining, Some(0));
    assert_eq!(rate.reset_at, None);
}

#[test]
fn missing_rate_headers_leave_state_unknown() {
    let rate = extract_rate(&HeaderMap::new(), &RateLimitHeaders::default());
    assert_eq!(rate.remaining, None);
    assert_eq!(rate.reset_at, None);
}

#[test]
fn login_and_slug_segments_are_encoded() {
    // Clip slugs and logins pass through untouched.
    assert_eq!(encode_path_segment("AwkwardHelplessSalamanderSwiftRage"), "AwkwardHelplessSalamanderSwiftRage");
    assert_eq!(encode_path_segment("some_login_123"), "some_login_123");
    // Team display names may carry spaces, slashes and non-ASCII text.
    assert_eq!(encode_path_segment("staff/eu"), "staff%2Feu");
    assert_eq!(encode_path_segment("équipe bleue"), "%C3%A9quipe%20bleue");
}

#[test]
fn error_body_messages() {
    assert_eq!(
        error_message(StatusCode::NOT_FOUND, r#"{"message":"User does not exist"}"#),
        "User does not exist"
    );
    assert_eq!(
        error_message(StatusCode::SERVICE_UNAVAILABLE, ""),
        "Service Unavailable"
    );
    let decode = Response::new(200, "not json").into_payload().unwrap_err();
    assert!(matches!(decode, ApiError::Decode(_)));
}
