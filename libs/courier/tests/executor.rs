//! Task execution: classification, auth challenges, retries and cancellation,
//! driven through an in-memory transport.

mod common;

use bytes::Bytes;
use common::{ScriptedTransport, Step, client, eventually, run_task, start_task, wait_outcome};
use courier::{
    Auth, BasicAuth, BearerAuth, BoxError, Decision, ErrorKind, HttpError, OpaqueToken, Outcome, PreparedRequest,
    RequestBuilder, ResponseHead, RetryBehavior, RetryStrategy, Task, TaskState,
};
use http::StatusCode;
use http::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Auth answering every challenge with a fixed decision and recording the
/// tokens it issued and received.
#[derive(Debug, Default)]
struct ScriptedAuth {
    answer: bool,
    challenges: AtomicUsize,
    issued: Mutex<Vec<OpaqueToken>>,
    received: Mutex<Vec<Option<OpaqueToken>>>,
}

impl ScriptedAuth {
    fn retrying() -> Arc<Self> {
        Arc::new(Self {
            answer: true,
            ..Self::default()
        })
    }

    fn challenges(&self) -> usize {
        self.challenges.load(Ordering::SeqCst)
    }
}

impl Auth for ScriptedAuth {
    fn headers(&self, _request: &PreparedRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Token scripted"));
        headers
    }

    fn opaque_token(&self, _request: &PreparedRequest) -> Option<OpaqueToken> {
        let mut issued = self.issued.lock();
        let token = OpaqueToken::new(issued.len());
        issued.push(token.clone());
        Some(token)
    }

    fn handle_unauthorized(
        &self,
        _response: &ResponseHead,
        _body: &Bytes,
        _task: &Task,
        token: Option<OpaqueToken>,
        decision: Decision,
    ) {
        self.challenges.fetch_add(1, Ordering::SeqCst);
        self.received.lock().push(token);
        decision.complete(self.answer);
    }
}

/// Policy that retries everything, counting how often it is asked.
fn counting_policy(retry: bool) -> (Arc<RetryBehavior>, Arc<AtomicUsize>) {
    let asked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&asked);
    let policy = RetryBehavior::new(move |_task, _error, _attempt, decision| {
        counter.fetch_add(1, Ordering::SeqCst);
        decision.complete(retry);
    });
    (Arc::new(policy), asked)
}

#[derive(Debug, Deserialize, PartialEq)]
struct Item {
    id: u32,
    name: String,
}

#[tokio::test]
async fn json_success_is_parsed() {
    let transport = ScriptedTransport::new([Step::json(200, r#"{"id":7,"name":"widget"}"#)]);
    let client = client(Arc::clone(&transport));

    let outcome = client.get("items/7").send_json::<Item>().await.unwrap();

    let Outcome::Success { response, value } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        value,
        Item {
            id: 7,
            name: "widget".to_owned()
        }
    );
    assert_eq!(transport.uri(0), "https://api.example.com/v1/items/7");
}

#[tokio::test]
async fn failure_without_policy_is_terminal() {
    let transport = ScriptedTransport::new([Step::json(500, r#"{"detail":"boom"}"#)]);
    let client = client(Arc::clone(&transport));

    let (task, outcome) = run_task(client.get("items")).await;

    let error = outcome.error().unwrap();
    assert!(matches!(error, ErrorKind::FailedResponse { status, .. } if *status == StatusCode::INTERNAL_SERVER_ERROR));
    assert_eq!(error.json().unwrap()["detail"], "boom");
    assert_eq!(outcome.response().unwrap().status(), 500);
    assert_eq!(transport.calls(), 1);
    assert_eq!(task.state(), TaskState::Completed);
}

#[tokio::test]
async fn network_failures_retried_until_success() {
    let transport = ScriptedTransport::new([
        Step::NetworkFailure,
        Step::NetworkFailure,
        Step::text(200, "ok"),
    ]);
    let client = client(Arc::clone(&transport));
    let policy = RetryBehavior::retry_network_failure(RetryStrategy::twice_with_delay(
        Duration::from_millis(5),
    ));

    let (task, outcome) = run_task(client.get("items").retry_policy(Arc::new(policy))).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.into_value().unwrap(), Bytes::from_static(b"ok"));
    assert_eq!(transport.calls(), 3);
    assert_eq!(task.generic_retry_attempt(), 2);
    assert_eq!(task.attempts(), 3);
}

#[tokio::test]
async fn retries_stop_at_strategy_limit() {
    let transport = ScriptedTransport::new([
        Step::NetworkFailure,
        Step::NetworkFailure,
        Step::NetworkFailure,
        Step::text(200, "never reached"),
    ]);
    let client = client(Arc::clone(&transport));
    let policy = RetryBehavior::retry_network_failure(RetryStrategy::twice_with_delay(
        Duration::ZERO,
    ));

    let (task, outcome) = run_task(client.get("items").retry_policy(Arc::new(policy))).await;

    assert!(matches!(
        outcome.error(),
        Some(ErrorKind::Transport(HttpError::Transport(_)))
    ));
    assert!(outcome.response().is_none());
    assert_eq!(transport.calls(), 3);
    assert_eq!(task.generic_retry_attempt(), 2);
}

#[tokio::test]
async fn post_without_idempotency_key_is_not_retried() {
    let transport = ScriptedTransport::new([Step::NetworkFailure, Step::text(200, "ok")]);
    let client = client(Arc::clone(&transport));
    let policy = Arc::new(RetryBehavior::retry_network_failure(RetryStrategy::once()));

    let (_, outcome) = run_task(client.post("items").retry_policy(Arc::clone(&policy) as _)).await;
    assert!(outcome.error().unwrap().is_network_failure());
    assert_eq!(transport.calls(), 1);

    let transport = ScriptedTransport::new([Step::NetworkFailure, Step::text(200, "ok")]);
    let client = common::client(Arc::clone(&transport));
    let (_, outcome) = run_task(
        client
            .post("items")
            .header("Idempotency-Key", "order-17")
            .retry_policy(policy),
    )
    .await;
    assert!(outcome.is_success());
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn auth_challenge_retries_once_with_auth_headers() {
    let transport = ScriptedTransport::new([Step::status(401), Step::text(200, "welcome")]);
    let client = client(Arc::clone(&transport));
    let auth = ScriptedAuth::retrying();

    let (task, outcome) = run_task(client.get("me").auth(Arc::clone(&auth) as _)).await;

    assert!(outcome.is_success());
    assert_eq!(auth.challenges(), 1);
    assert!(task.auth_retry_used());
    assert_eq!(task.generic_retry_attempt(), 0);
    assert_eq!(transport.calls(), 2);
    assert_eq!(
        transport.header(0, "authorization").as_deref(),
        Some("Token scripted")
    );
    assert_eq!(
        transport.header(1, "authorization").as_deref(),
        Some("Token scripted")
    );
}

#[tokio::test]
async fn auth_retry_is_used_at_most_once() {
    let transport = ScriptedTransport::new([
        Step::status(401),
        Step::status(401),
        Step::text(200, "never reached"),
    ]);
    let client = client(Arc::clone(&transport));
    let auth = ScriptedAuth::retrying();
    let (policy, asked) = counting_policy(true);

    let (_, outcome) = run_task(
        client
            .get("me")
            .auth(Arc::clone(&auth) as _)
            .retry_policy(policy),
    )
    .await;

    let Some(ErrorKind::Unauthorized { response, auth: failed_auth, .. }) = outcome.error() else {
        panic!("expected unauthorized, got {outcome:?}");
    };
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(format!("{failed_auth:?}").contains("ScriptedAuth"));
    assert_eq!(auth.challenges(), 1);
    assert_eq!(asked.load(Ordering::SeqCst), 0);
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn declined_challenge_fails_unauthorized() {
    let transport = ScriptedTransport::new([Step::json(401, r#"{"error":"expired"}"#)]);
    let client = client(Arc::clone(&transport));
    let auth = Arc::new(ScriptedAuth::default());

    let (task, outcome) = run_task(client.get("me").auth(Arc::clone(&auth) as _)).await;

    let error = outcome.error().unwrap();
    assert!(matches!(error, ErrorKind::Unauthorized { .. }));
    assert_eq!(error.json().unwrap()["error"], "expired");
    assert!(!task.auth_retry_used());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn unauthorized_without_auth_goes_to_retry_policy() {
    let transport = ScriptedTransport::new([Step::status(401), Step::text(200, "ok")]);
    let client = client(Arc::clone(&transport));
    let (policy, asked) = counting_policy(true);

    let (task, outcome) = run_task(client.get("public").no_auth().retry_policy(policy)).await;

    assert!(outcome.is_success());
    assert_eq!(asked.load(Ordering::SeqCst), 1);
    assert!(!task.auth_retry_used());
    assert_eq!(task.generic_retry_attempt(), 1);
    assert_eq!(transport.calls(), 2);
    assert_eq!(transport.header(0, "authorization"), None);
    assert_eq!(transport.header(1, "authorization"), None);
}

#[tokio::test]
async fn basic_auth_401_is_terminal_despite_retry_policy() {
    let transport = ScriptedTransport::new([Step::status(401), Step::text(200, "never reached")]);
    let client = client(Arc::clone(&transport));
    let basic: Arc<dyn Auth> = Arc::new(BasicAuth::new("user", "wrong"));
    let (policy, asked) = counting_policy(true);

    let (_, outcome) = run_task(
        client
            .get("me")
            .auth(Arc::clone(&basic))
            .retry_policy(policy),
    )
    .await;

    let Some(ErrorKind::Unauthorized { auth, .. }) = outcome.error() else {
        panic!("expected unauthorized, got {outcome:?}");
    };
    assert!(Arc::ptr_eq(auth, &basic));
    assert_eq!(asked.load(Ordering::SeqCst), 0);
    assert_eq!(transport.calls(), 1);
}

/// Auth answering challenges from a spawned task after a delay.
#[derive(Debug)]
struct DelayedAuth {
    answer: bool,
}

impl Auth for DelayedAuth {
    fn headers(&self, _request: &PreparedRequest) -> HeaderMap {
        HeaderMap::new()
    }

    fn handle_unauthorized(
        &self,
        _response: &ResponseHead,
        _body: &Bytes,
        task: &Task,
        _token: Option<OpaqueToken>,
        decision: Decision,
    ) {
        let answer = self.answer;
        task.runtime().spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            decision.complete(answer);
        });
    }
}

#[tokio::test]
async fn async_auth_decisions_deliver_one_outcome() {
    for answer in [false, true] {
        let transport = ScriptedTransport::new([Step::status(401), Step::text(200, "ok")]);
        let client = client(Arc::clone(&transport));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let (tx, rx) = tokio::sync::oneshot::channel();

        let task = client
            .get("me")
            .auth(Arc::new(DelayedAuth { answer }))
            .create_data_task(move |outcome| {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(outcome).ok();
            })
            .unwrap();
        task.resume();
        let outcome = wait_outcome(rx).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        if answer {
            assert!(outcome.is_success());
            assert_eq!(transport.calls(), 2);
        } else {
            assert!(matches!(outcome.error(), Some(ErrorKind::Unauthorized { .. })));
            assert_eq!(transport.calls(), 1);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn auth_and_generic_retries_are_counted_separately() {
    let transport = ScriptedTransport::new([
        Step::NetworkFailure,
        Step::status(401),
        Step::status(503),
        Step::text(200, "ok"),
    ]);
    let client = client(Arc::clone(&transport));
    let auth = ScriptedAuth::retrying();
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&attempts);
    let policy = RetryBehavior::new(move |_task, _error, attempt, decision| {
        seen.lock().push(attempt);
        decision.complete(true);
    });

    let (task, outcome) = run_task(
        client
            .get("me")
            .auth(Arc::clone(&auth) as _)
            .retry_policy(Arc::new(policy)),
    )
    .await;

    assert!(outcome.is_success());
    assert_eq!(*attempts.lock(), vec![0, 1]);
    assert_eq!(auth.challenges(), 1);
    assert_eq!(task.attempts(), 4);
}

#[tokio::test]
async fn challenge_carries_token_of_failed_attempt() {
    let transport = ScriptedTransport::new([Step::status(401), Step::text(200, "ok")]);
    let client = client(Arc::clone(&transport));
    let auth = ScriptedAuth::retrying();

    let (_, outcome) = run_task(client.get("me").auth(Arc::clone(&auth) as _)).await;
    assert!(outcome.is_success());

    let issued = auth.issued.lock();
    let received = auth.received.lock();
    assert_eq!(issued.len(), 2);
    assert_eq!(received.len(), 1);
    let token = received[0].as_ref().unwrap();
    assert_eq!(token, &issued[0]);
    assert_ne!(token, &issued[1]);
    assert_eq!(token.downcast_ref::<usize>(), Some(&0));
}

#[tokio::test]
async fn decisions_may_complete_asynchronously() {
    let transport = ScriptedTransport::new([Step::status(503), Step::text(200, "ok")]);
    let client = client(Arc::clone(&transport));
    let policy = RetryBehavior::new(|task, _error, _attempt, decision| {
        task.runtime().spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            decision.complete(true);
        });
    });

    let (_, outcome) = run_task(client.get("slow").retry_policy(Arc::new(policy))).await;

    assert!(outcome.is_success());
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn dropped_decision_declines_retry() {
    let transport = ScriptedTransport::new([Step::status(503), Step::text(200, "ok")]);
    let client = client(Arc::clone(&transport));
    let policy = RetryBehavior::new(|_task, _error, _attempt, decision| drop(decision));

    let (_, outcome) = run_task(client.get("x").retry_policy(Arc::new(policy))).await;

    assert_eq!(outcome.error().unwrap().status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn cancel_while_decision_pending() {
    let transport = ScriptedTransport::new([Step::status(503), Step::text(200, "ok")]);
    let client = client(Arc::clone(&transport));
    let parked: Arc<Mutex<Option<Decision>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&parked);
    let policy = RetryBehavior::new(move |_task, _error, _attempt, decision| {
        *slot.lock() = Some(decision);
    });

    let (task, rx) = start_task(client.get("x").retry_policy(Arc::new(policy)));
    task.resume();
    eventually(|| parked.lock().is_some()).await;

    task.cancel();
    let outcome = wait_outcome(rx).await;
    assert!(outcome.is_canceled());

    let decision = parked.lock().take().unwrap();
    decision.complete(true);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(transport.calls(), 1);
    assert_eq!(task.state(), TaskState::Canceled);
    assert_eq!(task.generic_retry_attempt(), 0);
}

#[tokio::test]
async fn cancel_aborts_attempt_in_flight() {
    let transport = ScriptedTransport::new([Step::Hang]);
    let client = client(Arc::clone(&transport));

    let (task, rx) = start_task(client.get("x"));
    task.resume();
    eventually(|| transport.calls() == 1).await;
    task.cancel();

    assert!(wait_outcome(rx).await.is_canceled());
    assert_eq!(task.state(), TaskState::Canceled);
}

#[tokio::test]
async fn cancel_before_resume_delivers_canceled() {
    let transport = ScriptedTransport::new([Step::text(200, "ok")]);
    let client = client(Arc::clone(&transport));

    let (task, rx) = start_task(client.get("x"));
    task.cancel();
    task.resume();

    assert!(wait_outcome(rx).await.is_canceled());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transport.calls(), 0);
}

#[tokio::test]
async fn completion_fires_exactly_once() {
    let transport = ScriptedTransport::new([Step::text(200, "ok"), Step::text(200, "again")]);
    let client = client(Arc::clone(&transport));
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);

    let task = client
        .get("x")
        .create_data_task(move |outcome| {
            assert!(outcome.is_success());
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    task.resume();
    task.resume();
    eventually(|| task.state() == TaskState::Completed).await;

    task.cancel();
    task.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(task.state(), TaskState::Completed);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn dropping_send_future_cancels_task() {
    let transport = ScriptedTransport::new([Step::Hang]);
    let client = client(Arc::clone(&transport));

    let result = tokio::time::timeout(Duration::from_millis(50), client.get("x").send()).await;
    assert!(result.is_err());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn parse_failure_keeps_response() {
    let transport = ScriptedTransport::new([Step::json(200, "{not json")]);
    let client = client(Arc::clone(&transport));

    let outcome = client.get("items/1").send_json::<Item>().await.unwrap();

    assert!(matches!(outcome.error(), Some(ErrorKind::Parse(_))));
    assert_eq!(outcome.response().unwrap().status(), StatusCode::OK);
}

#[tokio::test]
async fn json_task_rejects_unexpected_content_type() {
    let transport = ScriptedTransport::new([Step::text(200, "<html>")]);
    let client = client(Arc::clone(&transport));

    let outcome = client.get("items/1").send_json::<Item>().await.unwrap();

    let Some(ErrorKind::UnexpectedContentType {
        content_type, body, ..
    }) = outcome.error()
    else {
        panic!("expected content type mismatch, got {outcome:?}");
    };
    assert_eq!(content_type.as_deref(), Some("text/plain"));
    assert_eq!(body, &Bytes::from_static(b"<html>"));
}

#[tokio::test]
async fn no_content_depends_on_parse_step() {
    let transport = ScriptedTransport::new([Step::status(204), Step::status(204)]);
    let client = client(Arc::clone(&transport));

    let outcome = client.delete("items/1").send_json::<Item>().await.unwrap();
    assert!(matches!(
        outcome.error(),
        Some(ErrorKind::UnexpectedNoContent { .. })
    ));

    let outcome = client.delete("items/1").send().await.unwrap();
    assert_eq!(outcome.into_value().unwrap(), Bytes::new());
}

#[tokio::test]
async fn redirect_not_followed_is_reported() {
    let transport = ScriptedTransport::new([Step::status(302).with_header("location", "/v2/items")]);
    let client = client(Arc::clone(&transport));

    let outcome = client.get("items").send().await.unwrap();

    let Some(ErrorKind::UnexpectedRedirect {
        status, location, ..
    }) = outcome.error()
    else {
        panic!("expected redirect, got {outcome:?}");
    };
    assert_eq!(*status, StatusCode::FOUND);
    assert_eq!(
        location.as_ref().map(url::Url::as_str),
        Some("https://api.example.com/v2/items")
    );
}

#[tokio::test]
async fn bearer_refresh_is_shared_by_concurrent_challenges() {
    let transport = ScriptedTransport::from_fn(|request| {
        match request.headers().get(AUTHORIZATION).map(|v| v.to_str().unwrap()) {
            Some("Bearer fresh") => Step::text(200, "ok"),
            _ => Step::status(401),
        }
    });
    let client = client(Arc::clone(&transport));
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refreshes);
    let bearer = BearerAuth::with_refresh("stale", move || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, BoxError>("fresh".to_owned())
        }
    });

    let first = run_task(client.get("a").auth(Arc::new(bearer.clone())));
    let second = run_task(client.get("b").auth(Arc::new(bearer.clone())));
    let ((_, a), (_, b)) = tokio::join!(first, second);

    assert!(a.is_success());
    assert!(b.is_success());
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(bearer.generation(), 1);
    assert_eq!(transport.calls(), 4);
}

#[tokio::test]
async fn bearer_challenge_from_superseded_token_retries_without_refresh() {
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refreshes);
    let bearer = BearerAuth::with_refresh("first", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>("unused".to_owned()) }
    });

    // The token is rotated while the first attempt is in flight.
    let rotating = bearer.clone();
    let transport = ScriptedTransport::from_fn(move |request| {
        match request.headers().get(AUTHORIZATION).map(|v| v.to_str().unwrap()) {
            Some("Bearer second") => Step::text(200, "ok"),
            _ => {
                rotating.set_token("second");
                Step::status(401)
            }
        }
    });
    let client = client(Arc::clone(&transport));

    let (task, outcome) = run_task(client.get("me").auth(Arc::new(bearer.clone()))).await;

    assert!(outcome.is_success());
    assert!(task.auth_retry_used());
    assert_eq!(refreshes.load(Ordering::SeqCst), 0);
    assert_eq!(
        transport.header(0, "authorization").as_deref(),
        Some("Bearer first")
    );
    assert_eq!(
        transport.header(1, "authorization").as_deref(),
        Some("Bearer second")
    );
}

#[tokio::test]
async fn bearer_refresh_failure_fails_unauthorized() {
    let transport = ScriptedTransport::new([Step::status(401)]);
    let client = client(Arc::clone(&transport));
    let bearer = BearerAuth::with_refresh("stale", || async {
        Err::<String, BoxError>("identity provider unavailable".into())
    });

    let (_, outcome) = run_task(client.get("me").auth(Arc::new(bearer.clone()))).await;

    assert!(matches!(
        outcome.error(),
        Some(ErrorKind::Unauthorized { .. })
    ));
    assert_eq!(bearer.generation(), 0);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn bearer_refresh_panic_releases_waiting_tasks() {
    let transport = ScriptedTransport::from_fn(|_| Step::status(401));
    let client = client(Arc::clone(&transport));
    let refreshes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refreshes);
    let bearer = BearerAuth::with_refresh("stale", move || {
        let counter = Arc::clone(&counter);
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(n > 0, "identity provider client crashed");
            Ok::<_, BoxError>("fresh".to_owned())
        }
    });

    let first = run_task(client.get("a").auth(Arc::new(bearer.clone())));
    let second = run_task(client.get("b").auth(Arc::new(bearer.clone())));
    let ((first, a), (second, b)) = tokio::join!(first, second);

    for outcome in [&a, &b] {
        assert!(matches!(outcome.error(), Some(ErrorKind::Unauthorized { .. })));
    }
    assert_eq!(first.state(), TaskState::Completed);
    assert_eq!(second.state(), TaskState::Completed);
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(bearer.generation(), 0);

    // The next challenge starts a fresh refresh instead of joining a dead one.
    let (task, outcome) = run_task(client.get("c").auth(Arc::new(bearer.clone()))).await;
    assert!(matches!(outcome.error(), Some(ErrorKind::Unauthorized { .. })));
    assert!(task.auth_retry_used());
    assert_eq!(refreshes.load(Ordering::SeqCst), 2);
    assert_eq!(bearer.generation(), 1);
}

/// Auth that cancels the challenged task and then asks for a retry.
#[derive(Debug)]
struct CancelingAuth;

impl Auth for CancelingAuth {
    fn headers(&self, _request: &PreparedRequest) -> HeaderMap {
        HeaderMap::new()
    }

    fn handle_unauthorized(
        &self,
        _response: &ResponseHead,
        _body: &Bytes,
        task: &Task,
        _token: Option<OpaqueToken>,
        decision: Decision,
    ) {
        task.cancel();
        decision.complete(true);
    }
}

async fn assert_single_cancel(request: RequestBuilder, transport: &ScriptedTransport) {
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let (tx, rx) = tokio::sync::oneshot::channel();
    let task = request
        .create_data_task(move |outcome| {
            counter.fetch_add(1, Ordering::SeqCst);
            tx.send(outcome).ok();
        })
        .unwrap();
    task.resume();

    assert!(wait_outcome(rx).await.is_canceled());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(transport.calls(), 1);
    assert_eq!(task.state(), TaskState::Canceled);
    assert!(!task.auth_retry_used());
    assert_eq!(task.generic_retry_attempt(), 0);
}

#[tokio::test]
async fn auth_canceling_its_own_task_ends_canceled() {
    let transport = ScriptedTransport::new([Step::status(401), Step::text(200, "ok")]);
    let client = client(Arc::clone(&transport));

    assert_single_cancel(client.get("me").auth(Arc::new(CancelingAuth)), &transport).await;
}

#[tokio::test]
async fn retry_policy_canceling_its_own_task_ends_canceled() {
    let transport = ScriptedTransport::new([Step::status(503), Step::text(200, "ok")]);
    let client = client(Arc::clone(&transport));
    let policy = RetryBehavior::new(|task, _error, _attempt, decision| {
        task.cancel();
        decision.complete(true);
    });

    assert_single_cancel(client.get("x").retry_policy(Arc::new(policy)), &transport).await;
}
