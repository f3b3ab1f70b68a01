//! Attempt loop driving a [`Task`] to its outcome.
//!
//! One driver future runs per resumed task. It issues attempts strictly one
//! after another, classifies every response, and suspends on the auth or
//! retry decision while racing it against cancellation.

use crate::auth::OpaqueToken;
use crate::decision::{Decision, DecisionReceiver, DecisionSource};
use crate::error::HttpError;
use crate::response::ResponseHead;
use crate::taxonomy::{Classified, Completion, ErrorKind, classify};
use crate::task::Task;
use bytes::Bytes;
use http::HeaderMap;

/// Run `task` to completion and hand the result to its sink.
///
/// A `None` from the loop means cancellation won; `finish` is then a no-op
/// because `cancel` already delivered `Canceled`.
pub(crate) async fn drive(task: Task) {
    let completion = run(&task).await.unwrap_or(Completion::Canceled);
    task.finish(completion);
}

async fn run(task: &Task) -> Option<Completion> {
    loop {
        let attempt = task.attempts() + 1;
        let (result, token) = match build_request(task) {
            Ok((request, token)) => {
                tracing::debug!(attempt, "issuing attempt");
                (send_attempt(task, request).await?, token)
            }
            Err(e) => (Err(e), None),
        };

        let error = match result {
            Err(e) => {
                tracing::debug!(attempt, error = %e, "attempt failed without response");
                ErrorKind::Transport(e)
            }
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let head = ResponseHead::from_parts(parts, task.request().url().clone());
                tracing::debug!(attempt, status = head.status().as_u16(), "response received");

                match classify(&head, &body, task.expectations(), task.auth().is_some()) {
                    Classified::Success => {
                        return Some(Completion::Success {
                            response: head,
                            body,
                        });
                    }
                    Classified::Challenge => {
                        if handle_challenge(task, &head, &body, token).await? {
                            continue;
                        }
                        let auth = task.auth().cloned()?;
                        return Some(Completion::failure(ErrorKind::unauthorized(
                            auth, head, body,
                        )));
                    }
                    Classified::Failure(error) => error,
                }
            }
        };

        let Some(policy) = task.retry_policy() else {
            return Some(Completion::failure(error));
        };

        let (decision, rx) = Decision::channel(task.id(), DecisionSource::RetryPolicy);
        policy.should_retry(task, &error, task.generic_retry_attempt(), decision);
        if !wait_for(task, rx).await? {
            return Some(Completion::failure(error));
        }
        if !task.commit_generic_retry() {
            return None;
        }
        tracing::debug!(retry = task.generic_retry_attempt(), "retry policy requested a new attempt");
    }
}

/// Auth branch for a 401. `Some(true)` means retry, `None` means canceled.
async fn handle_challenge(
    task: &Task,
    head: &ResponseHead,
    body: &Bytes,
    token: Option<OpaqueToken>,
) -> Option<bool> {
    let auth = task.auth()?;
    if task.auth_retry_used() {
        tracing::debug!("401 after auth retry; not consulting auth again");
        return Some(false);
    }

    let (decision, rx) = Decision::channel(task.id(), DecisionSource::Auth);
    auth.handle_unauthorized(head, body, task, token, decision);
    if !wait_for(task, rx).await? {
        return Some(false);
    }
    if !task.commit_auth_retry() {
        return None;
    }
    tracing::debug!("auth requested a new attempt");
    Some(true)
}

/// Merge auth headers over the request's own headers and capture the
/// auth's opaque token for this attempt.
fn build_request(
    task: &Task,
) -> Result<(http::Request<Bytes>, Option<OpaqueToken>), HttpError> {
    let prepared = task.request();
    let (auth_headers, token) = match task.auth() {
        Some(auth) => auth.credentials(prepared),
        None => (HeaderMap::new(), None),
    };
    let request = prepared.to_http(auth_headers)?;
    Ok((request, token))
}

/// Issue one attempt on its own runtime task so `cancel` can abort it.
/// `None` when the task was canceled before or during the attempt.
async fn send_attempt(
    task: &Task,
    request: http::Request<Bytes>,
) -> Option<Result<http::Response<Bytes>, HttpError>> {
    let mut handle = task.runtime().spawn(task.transport().send(request));
    if !task.begin_attempt(handle.abort_handle()) {
        return None;
    }

    let joined = tokio::select! {
        biased;
        () = task.cancellation().cancelled() => None,
        joined = &mut handle => Some(joined),
    };
    task.end_attempt();

    match joined? {
        Ok(result) => Some(result),
        Err(e) if e.is_cancelled() => None,
        Err(e) => Some(Err(HttpError::Transport(Box::new(e)))),
    }
}

/// Await a decision unless the task is canceled first.
async fn wait_for(task: &Task, rx: DecisionReceiver) -> Option<bool> {
    tokio::select! {
        biased;
        () = task.cancellation().cancelled() => None,
        retry = rx.wait() => Some(retry),
    }
}
