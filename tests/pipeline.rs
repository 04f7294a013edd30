//! End-to-end pipeline behaviour against a scripted HTTP stub.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde_json::{json, Value};

use cordflow::{
    json_parser, Answer, Backoff, HttpClient, HttpRequest, HttpResponse, LimiterConfig,
    OverflowPolicy, Pipeline, PipelineConfig, Request, Route, Token, TransportError,
};

enum Step {
    Respond(HttpResponse),
    Fail(TransportError),
}

/// Plays back a fixed sequence of outcomes and records every call.
struct StubClient {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<HttpRequest>>,
    delay: Duration,
}

impl StubClient {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        })
    }

    fn slow(steps: Vec<Step>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
            calls: Mutex::new(Vec::new()),
            delay,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpClient for StubClient {
    async fn perform(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.calls.lock().unwrap().push(request);
        match self.script.lock().unwrap().pop_front() {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Fail(error)) => Err(error),
            None => Ok(response_with(StatusCode::OK, "{}", &[])),
        }
    }
}

fn response_with(status: StatusCode, body: &str, headers: &[(&str, String)]) -> HttpResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            name.parse::<HeaderName>().unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    HttpResponse { status, headers: map, body: Bytes::from(body.to_owned()) }
}

fn bucket_headers(
    limit: i64,
    remaining: i64,
    reset_after: f64,
    bucket: &str,
) -> Vec<(&'static str, String)> {
    vec![
        ("x-ratelimit-limit", limit.to_string()),
        ("x-ratelimit-remaining", remaining.to_string()),
        ("x-ratelimit-reset-after", format!("{:.3}", reset_after)),
        ("x-ratelimit-bucket", bucket.to_owned()),
    ]
}

fn ok(body: &str, headers: &[(&str, String)]) -> Step {
    Step::Respond(response_with(StatusCode::OK, body, headers))
}

fn pipeline(
    client: Arc<StubClient>,
    limiter: LimiterConfig,
    config: PipelineConfig,
) -> Pipeline<Value, &'static str> {
    Pipeline::new(Token::Bot("test-token".into()), client, limiter, config).unwrap()
}

fn request(route: Route, context: &'static str) -> Request<Value, &'static str> {
    Request::new(route, json_parser::<Value>(), context)
}

fn quiet_retries(config: PipelineConfig) -> PipelineConfig {
    PipelineConfig {
        retry_backoff: Backoff::constant(Duration::from_millis(1)),
        ..config
    }
}

#[tokio::test]
async fn successful_get_parses_body_and_seeds_the_bucket() {
    let client = StubClient::new(vec![ok(
        r#"{"id":"100","name":"c"}"#,
        &bucket_headers(5, 4, 1.0, "B1"),
    )]);
    let pipeline = pipeline(
        Arc::clone(&client),
        LimiterConfig::default(),
        PipelineConfig::default(),
    );

    let req = request(Route::get("/channels/100"), "ctx");
    let id = req.id();
    let answer = pipeline.submit(req).await;

    match answer {
        Answer::Response { data, ratelimit, id: answered, context, .. } => {
            assert_eq!(data, json!({"id": "100", "name": "c"}));
            assert_eq!(answered, id);
            assert_eq!(context, "ctx");
            let info = ratelimit.expect("rate-limit headers were present");
            assert_eq!(info.limit, Some(5));
            assert_eq!(info.remaining, Some(4));
        }
        other => panic!("expected a response, got {:?}", other),
    }

    let snapshot = pipeline
        .limiter()
        .bucket_snapshot(&Route::get("/channels/100"))
        .await
        .expect("bucket exists after the response");
    assert_eq!(snapshot.bucket.as_ref().map(|b| b.as_str()), Some("B1"));
    assert_eq!(snapshot.limit, 5);
    assert_eq!(snapshot.remaining, 4);
}

#[tokio::test]
async fn depleted_bucket_defers_the_next_admission() {
    let client = StubClient::new(vec![
        ok("{}", &bucket_headers(1, 0, 0.5, "B1")),
        ok("{}", &bucket_headers(1, 0, 0.5, "B1")),
    ]);
    let pipeline = pipeline(
        Arc::clone(&client),
        LimiterConfig::default(),
        PipelineConfig::default(),
    );

    let first = pipeline.submit(request(Route::get("/channels/1"), "a")).await;
    assert!(first.is_response());

    let started = Instant::now();
    let second = pipeline.submit(request(Route::get("/channels/1"), "b")).await;
    let elapsed = started.elapsed();

    assert!(second.is_response());
    assert!(elapsed >= Duration::from_millis(450), "deferred only {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "deferred too long: {:?}", elapsed);
}

#[tokio::test]
async fn global_ratelimit_holds_subsequent_requests() {
    let client = StubClient::new(vec![
        Step::Respond(response_with(
            StatusCode::TOO_MANY_REQUESTS,
            "ignored",
            &[
                ("x-ratelimit-global", "true".to_owned()),
                ("retry-after", "2.0".to_owned()),
            ],
        )),
        ok("{}", &[]),
    ]);
    let pipeline = pipeline(
        Arc::clone(&client),
        LimiterConfig::default(),
        PipelineConfig::default(),
    );

    let first = pipeline.submit(request(Route::get("/channels/1"), "a")).await;
    match &first {
        Answer::Ratelimited { global, .. } => assert!(*global),
        other => panic!("expected a global ratelimit answer, got {:?}", other),
    }

    // A different route entirely waits out the global window.
    let started = Instant::now();
    let second = pipeline.submit(request(Route::get("/guilds/9"), "b")).await;
    assert!(second.is_response());
    assert!(started.elapsed() >= Duration::from_millis(1900));
}

#[tokio::test]
async fn global_ratelimit_past_the_budget_drops() {
    let client = StubClient::new(vec![Step::Respond(response_with(
        StatusCode::TOO_MANY_REQUESTS,
        "",
        &[
            ("x-ratelimit-global", "true".to_owned()),
            ("retry-after", "2.0".to_owned()),
        ],
    ))]);
    let limiter = LimiterConfig {
        max_allowed_wait: Duration::from_millis(100),
        ..Default::default()
    };
    let pipeline = pipeline(Arc::clone(&client), limiter, PipelineConfig::default());

    let first = pipeline.submit(request(Route::get("/channels/1"), "a")).await;
    assert!(first.is_ratelimited());

    let second = pipeline.submit(request(Route::get("/guilds/9"), "b")).await;
    assert!(second.is_dropped());
}

#[tokio::test]
async fn wait_beyond_budget_answers_dropped_quickly() {
    let client = StubClient::new(vec![ok("{}", &bucket_headers(1, 0, 600.0, "B1"))]);
    let limiter = LimiterConfig {
        max_allowed_wait: Duration::from_secs(120),
        ..Default::default()
    };
    let pipeline = pipeline(Arc::clone(&client), limiter, PipelineConfig::default());

    // Prime the bucket: depleted, resets in ten minutes.
    let primer = pipeline.submit(request(Route::get("/channels/1"), "prime")).await;
    assert!(primer.is_response());

    let started = Instant::now();
    let answer = pipeline.submit(request(Route::get("/channels/1"), "victim")).await;
    assert!(answer.is_dropped());
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(client.call_count(), 1, "the dropped request never reached HTTP");
}

#[tokio::test]
async fn network_errors_are_retried_until_success() {
    let client = StubClient::new(vec![
        Step::Fail(TransportError::Connect("connection reset".into())),
        Step::Fail(TransportError::Connect("connection reset".into())),
        ok("{}", &bucket_headers(5, 4, 1.0, "B1")),
    ]);
    let config = quiet_retries(PipelineConfig { max_retries: 3, ..Default::default() });
    let pipeline = pipeline(Arc::clone(&client), LimiterConfig::default(), config);

    let answer = pipeline.submit(request(Route::get("/channels/1"), "retry")).await;
    assert!(answer.is_response());
    assert_eq!(client.call_count(), 3);
}

#[tokio::test]
async fn retries_exhaust_into_an_error_answer() {
    let client = StubClient::new(vec![
        Step::Fail(TransportError::Connect("reset".into())),
        Step::Fail(TransportError::Connect("reset".into())),
        Step::Fail(TransportError::Connect("reset".into())),
        Step::Fail(TransportError::Connect("reset".into())),
    ]);
    let config = quiet_retries(PipelineConfig { max_retries: 3, ..Default::default() });
    let pipeline = pipeline(Arc::clone(&client), LimiterConfig::default(), config);

    let req = request(Route::get("/channels/1"), "exhausted");
    let id = req.id();
    let answer = pipeline.submit(req).await;

    assert_eq!(answer.id(), id, "retries preserve the original identifier");
    assert!(answer.error_cause().is_some_and(|c| c.is_network()));
    assert_eq!(client.call_count(), 4, "initial attempt plus three retries");
}

#[tokio::test]
async fn both_routes_bind_to_the_shared_bucket() {
    let client = StubClient::new(vec![
        ok("{}", &bucket_headers(5, 4, 10.0, "BX")),
        ok("{}", &bucket_headers(5, 3, 10.0, "BX")),
    ]);
    let pipeline = pipeline(
        Arc::clone(&client),
        LimiterConfig::default(),
        PipelineConfig::default(),
    );

    let members = pipeline.submit(request(Route::get("/guilds/1/members"), "m")).await;
    let roles = pipeline.submit(request(Route::get("/guilds/1/roles"), "r")).await;
    assert!(members.is_response());
    assert!(roles.is_response());

    let via_members = pipeline
        .limiter()
        .bucket_snapshot(&Route::get("/guilds/1/members"))
        .await
        .unwrap();
    let via_roles = pipeline
        .limiter()
        .bucket_snapshot(&Route::get("/guilds/1/roles"))
        .await
        .unwrap();

    assert_eq!(via_members.bucket.as_ref().map(|b| b.as_str()), Some("BX"));
    assert_eq!(via_roles.bucket.as_ref().map(|b| b.as_str()), Some("BX"));
    // One shared entry: both views agree on the counter.
    assert_eq!(via_members.remaining, via_roles.remaining);
    assert_eq!(via_members.remaining, 3);
}

#[tokio::test]
async fn route_local_429_is_not_retried() {
    let client = StubClient::new(vec![Step::Respond(response_with(
        StatusCode::TOO_MANY_REQUESTS,
        "ignored body",
        &[
            ("x-ratelimit-limit", "5".to_owned()),
            ("x-ratelimit-remaining", "0".to_owned()),
            ("x-ratelimit-reset-after", "0.100".to_owned()),
            ("x-ratelimit-bucket", "B1".to_owned()),
        ],
    ))]);
    let config = quiet_retries(PipelineConfig { max_retries: 3, ..Default::default() });
    let pipeline = pipeline(Arc::clone(&client), LimiterConfig::default(), config);

    let answer = pipeline.submit(request(Route::get("/channels/1"), "once")).await;
    match answer {
        Answer::Ratelimited { global, ratelimit, .. } => {
            assert!(!global);
            assert_eq!(ratelimit.remaining, Some(0));
        }
        other => panic!("expected a ratelimited answer, got {:?}", other),
    }
    assert_eq!(client.call_count(), 1);
}

#[tokio::test]
async fn no_content_with_a_data_parser_is_unexpected_empty() {
    let client = StubClient::new(vec![Step::Respond(response_with(
        StatusCode::NO_CONTENT,
        "",
        &bucket_headers(5, 4, 1.0, "B1"),
    ))]);
    let pipeline = pipeline(
        Arc::clone(&client),
        LimiterConfig::default(),
        PipelineConfig::default(),
    );

    let answer = pipeline.submit(request(Route::delete("/channels/1"), "del")).await;
    match answer.error_cause() {
        Some(cause) => assert!(
            matches!(cause, cordflow::ErrorCause::UnexpectedEmpty),
            "unexpected cause: {:?}",
            cause
        ),
        None => panic!("expected an error answer"),
    }
}

#[tokio::test]
async fn http_timeout_surfaces_as_a_timeout_error() {
    let client = StubClient::slow(
        vec![ok("{}", &[])],
        Duration::from_millis(300),
    );
    let config = PipelineConfig {
        http_timeout: Duration::from_millis(50),
        max_retries: 0,
        ..Default::default()
    };
    let pipeline = pipeline(Arc::clone(&client), LimiterConfig::default(), config);

    let answer = pipeline.submit(request(Route::get("/channels/1"), "slow")).await;
    assert!(answer.error_cause().is_some_and(|c| c.is_timeout()));
}

#[tokio::test]
async fn every_submission_is_answered_under_drop_oldest() {
    let client = StubClient::slow(vec![], Duration::from_millis(30));
    let config = PipelineConfig {
        buffer_size: 1,
        parallelism: 1,
        overflow: OverflowPolicy::DropOldest,
        max_retries: 0,
        ..Default::default()
    };
    let pipeline = pipeline(Arc::clone(&client), LimiterConfig::default(), config);
    let (sender, mut answers) = pipeline.stream();

    let mut ids = Vec::new();
    let mut requests = Vec::new();
    for _ in 0..5 {
        let req = request(Route::get("/channels/1"), "burst");
        ids.push(req.id());
        requests.push(req);
    }

    tokio::spawn(async move {
        for req in requests {
            sender.send(req).await;
        }
    });

    let mut answered = Vec::new();
    let mut overflowed = 0;
    for _ in 0..5 {
        let answer = answers.recv().await.expect("pipeline stays open");
        if answer.error_cause().is_some_and(|c| c.is_buffer_overflow()) {
            overflowed += 1;
        }
        answered.push(answer.id());
    }

    answered.sort_unstable_by_key(|id| id.value());
    ids.sort_unstable_by_key(|id| id.value());
    assert_eq!(answered, ids, "exactly one answer per submission");
    assert!(overflowed >= 1, "a one-slot buffer must displace something");
}

#[tokio::test]
async fn concurrent_submissions_each_get_exactly_one_answer() {
    let client = StubClient::slow(vec![], Duration::from_millis(10));
    let pipeline = Arc::new(pipeline(
        Arc::clone(&client),
        LimiterConfig::default(),
        PipelineConfig::default(),
    ));

    let submissions = (0..8).map(|_| {
        let pipeline = Arc::clone(&pipeline);
        async move { pipeline.submit(request(Route::get("/channels/1"), "parallel")).await }
    });
    let answers = futures::future::join_all(submissions).await;

    assert_eq!(answers.len(), 8);
    assert!(answers.iter().all(|a| a.is_response()));
    let mut ids: Vec<u64> = answers.iter().map(|a| a.id().value()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8, "answers map one-to-one onto submissions");
}

#[tokio::test]
async fn two_submissions_of_the_same_call_get_independent_answers() {
    let client = StubClient::new(vec![
        ok("{}", &bucket_headers(5, 4, 1.0, "B1")),
        ok("{}", &bucket_headers(5, 3, 1.0, "B1")),
    ]);
    let pipeline = pipeline(
        Arc::clone(&client),
        LimiterConfig::default(),
        PipelineConfig::default(),
    );

    let first = request(Route::get("/channels/7"), "one");
    let second = request(Route::get("/channels/7"), "two");
    assert_ne!(first.id(), second.id());

    let a = pipeline.submit(first).await;
    let b = pipeline.submit(second).await;
    assert!(a.is_response());
    assert!(b.is_response());
    assert_ne!(a.id(), b.id());
    assert_eq!(*a.context(), "one");
    assert_eq!(*b.context(), "two");
}

#[tokio::test]
async fn requests_carry_the_wire_headers() {
    let client = StubClient::new(vec![ok("{}", &[])]);
    let pipeline = pipeline(
        Arc::clone(&client),
        LimiterConfig::default(),
        PipelineConfig::default(),
    );

    pipeline.submit(request(Route::get("/channels/100"), "hdrs")).await;

    let calls = client.calls.lock().unwrap();
    let sent = &calls[0];
    assert!(sent.url.ends_with("/channels/100"));
    assert_eq!(
        sent.headers.get("authorization").unwrap().to_str().unwrap(),
        "Bot test-token"
    );
    assert!(sent
        .headers
        .get("user-agent")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("DiscordBot ("));
    assert_eq!(
        sent.headers.get("x-ratelimit-precision").unwrap().to_str().unwrap(),
        "millisecond"
    );
}
