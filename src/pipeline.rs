//! The staged request pipeline.
//!
//! ```text
//! ingress buffer ──▶ admission gate ──▶ HTTP send ──▶ parser ──▶ answer
//!      ▲                  │                              │
//!      └── retry lane ◀───┴──(failed, retryable)         └──▶ limiter feedback
//! ```
//!
//! Submissions land in a bounded ingress buffer, the gate spawns up to
//! `parallelism` concurrent lanes, and each lane walks one request through
//! admission, the HTTP exchange, and response classification. Retryable
//! failures re-enter through a bounded feedback channel that the gate
//! prefers over fresh ingress. Every submission produces exactly one
//! answer, including the ones a full buffer displaces.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::answer::Answer;
use crate::client::{HttpClient, Token, Wire};
use crate::config::{LimiterConfig, OverflowPolicy, PipelineConfig};
use crate::error::{ConfigError, ErrorCause};
use crate::headers::RatelimitInfo;
use crate::limiter::{self, Admission, LimiterGone, LimiterHandle};
use crate::parser::{interpret, Interpretation};
use crate::queue::{IngressQueue, PushFull};
use crate::request::Request;
use crate::retry::RetryPolicy;
use crate::route::RouteKey;
use crate::sleeper::{Sleeper, TokioSleeper};

/// Where a submission's answer goes.
enum ReplyTo<D, C> {
    Oneshot(oneshot::Sender<Answer<D, C>>),
    Stream(mpsc::Sender<Answer<D, C>>),
}

impl<D, C> ReplyTo<D, C> {
    fn is_closed(&self) -> bool {
        match self {
            Self::Oneshot(tx) => tx.is_closed(),
            Self::Stream(tx) => tx.is_closed(),
        }
    }

    async fn deliver(self, answer: Answer<D, C>) {
        match self {
            Self::Oneshot(tx) => {
                let _ = tx.send(answer);
            }
            Self::Stream(tx) => {
                let _ = tx.send(answer).await;
            }
        }
    }
}

/// A request travelling through the pipeline with its reply address and
/// retry count.
struct Submission<D, C> {
    request: Request<D, C>,
    attempts: u32,
    reply: ReplyTo<D, C>,
}

impl<D, C> Submission<D, C> {
    fn route_key(&self) -> RouteKey {
        RouteKey::of(self.request.route())
    }

    fn into_request(self) -> Request<D, C> {
        self.request
    }

    async fn answer_error(self, cause: ErrorCause) {
        let route = self.route_key();
        let Submission { request, reply, .. } = self;
        let id = request.id();
        let context = request.into_context();
        reply.deliver(Answer::Error { cause, route, id, context }).await;
    }

    async fn answer_dropped(self) {
        let route = self.route_key();
        let Submission { request, reply, .. } = self;
        let id = request.id();
        let context = request.into_context();
        reply.deliver(Answer::Dropped { route, id, context }).await;
    }
}

/// Pieces shared by every lane.
struct Shared {
    client: Arc<dyn HttpClient>,
    wire: Wire,
    limiter: LimiterHandle,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    http_timeout: Duration,
    log_sent: bool,
    log_received: bool,
}

/// Closes ingress once the pipeline and every [`RequestSender`] are gone.
struct ProducerGuard<D, C> {
    ingress: Arc<IngressQueue<Submission<D, C>>>,
}

impl<D, C> Drop for ProducerGuard<D, C> {
    fn drop(&mut self) {
        self.ingress.close();
    }
}

/// The rate-limited request pipeline for one token.
///
/// Construct with [`Pipeline::new`] inside a tokio runtime, then either
/// await individual answers through [`Pipeline::submit`] or wire a
/// channel pair up with [`Pipeline::stream`].
pub struct Pipeline<D, C> {
    shared: Arc<Shared>,
    ingress: Arc<IngressQueue<Submission<D, C>>>,
    guard: Arc<ProducerGuard<D, C>>,
    overflow: OverflowPolicy,
    buffer_size: usize,
}

impl<D, C> Pipeline<D, C>
where
    D: Send + 'static,
    C: Send + 'static,
{
    /// Validate the configuration and start the limiter and gate tasks.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(
        token: Token,
        client: Arc<dyn HttpClient>,
        limiter_config: LimiterConfig,
        pipeline_config: PipelineConfig,
    ) -> Result<Self, ConfigError> {
        limiter_config.validate()?;
        pipeline_config.validate()?;

        let wire = Wire::new(
            &token,
            &pipeline_config.base_url,
            limiter_config.millisecond_precision,
        )?;
        let sleeper: Arc<dyn Sleeper> = Arc::new(TokioSleeper);
        let limiter = limiter::spawn(
            limiter_config,
            Arc::clone(&sleeper),
            pipeline_config.log_ratelimit_events,
        );
        let shared = Arc::new(Shared {
            client,
            wire,
            limiter,
            retry: RetryPolicy::from_config(&pipeline_config),
            sleeper,
            http_timeout: pipeline_config.http_timeout,
            log_sent: pipeline_config.log_sent_rest,
            log_received: pipeline_config.log_received_rest,
        });

        let ingress = Arc::new(IngressQueue::new(pipeline_config.buffer_size));
        let guard = Arc::new(ProducerGuard { ingress: Arc::clone(&ingress) });
        let (retry_tx, retry_rx) = mpsc::channel(pipeline_config.buffer_size);
        tokio::spawn(gate(
            Arc::clone(&shared),
            Arc::clone(&ingress),
            retry_rx,
            retry_tx,
            pipeline_config.parallelism,
        ));

        Ok(Self {
            shared,
            ingress,
            guard,
            overflow: pipeline_config.overflow,
            buffer_size: pipeline_config.buffer_size,
        })
    }

    /// Submit one request and await its answer.
    pub async fn submit(&self, request: Request<D, C>) -> Answer<D, C> {
        let (tx, rx) = oneshot::channel();
        let submission = Submission { request, attempts: 0, reply: ReplyTo::Oneshot(tx) };
        enqueue(&self.ingress, self.overflow, submission).await;
        match rx.await {
            Ok(answer) => answer,
            Err(_) => unreachable!("every submission is answered exactly once"),
        }
    }

    /// Submit without waiting for buffer space. On a full (or closed)
    /// buffer the request is handed back untouched.
    pub fn try_submit(&self, request: Request<D, C>) -> Result<PendingAnswer<D, C>, Request<D, C>> {
        let (tx, rx) = oneshot::channel();
        let submission = Submission { request, attempts: 0, reply: ReplyTo::Oneshot(tx) };
        match self.ingress.try_push(submission) {
            Ok(()) => Ok(PendingAnswer { rx }),
            Err(PushFull::Full(rejected)) | Err(PushFull::Closed(rejected)) => {
                Err(rejected.into_request())
            }
        }
    }

    /// A channel pair over the pipeline: push requests into the sender,
    /// read answers (in completion order) from the receiver. May be called
    /// multiple times; each stream gets its own answer channel.
    pub fn stream(&self) -> (RequestSender<D, C>, mpsc::Receiver<Answer<D, C>>) {
        let (answers, rx) = mpsc::channel(self.buffer_size);
        let sender = RequestSender {
            ingress: Arc::clone(&self.ingress),
            guard: Arc::clone(&self.guard),
            overflow: self.overflow,
            answers,
        };
        (sender, rx)
    }

    /// The limiter handle, for bucket diagnostics.
    pub fn limiter(&self) -> &LimiterHandle {
        &self.shared.limiter
    }
}

/// An answer that has been enqueued but not yet produced.
pub struct PendingAnswer<D, C> {
    rx: oneshot::Receiver<Answer<D, C>>,
}

impl<D, C> PendingAnswer<D, C> {
    pub async fn wait(self) -> Answer<D, C> {
        match self.rx.await {
            Ok(answer) => answer,
            Err(_) => unreachable!("every submission is answered exactly once"),
        }
    }
}

/// Producer half of [`Pipeline::stream`].
pub struct RequestSender<D, C> {
    ingress: Arc<IngressQueue<Submission<D, C>>>,
    guard: Arc<ProducerGuard<D, C>>,
    overflow: OverflowPolicy,
    answers: mpsc::Sender<Answer<D, C>>,
}

impl<D, C> Clone for RequestSender<D, C> {
    fn clone(&self) -> Self {
        Self {
            ingress: Arc::clone(&self.ingress),
            guard: Arc::clone(&self.guard),
            overflow: self.overflow,
            answers: self.answers.clone(),
        }
    }
}

impl<D, C> RequestSender<D, C>
where
    D: Send + 'static,
    C: Send + 'static,
{
    /// Push a request into the pipeline. Under `Backpressure` this waits
    /// for buffer space; under the other policies any loss is reported on
    /// the answer channel.
    pub async fn send(&self, request: Request<D, C>) {
        let submission =
            Submission { request, attempts: 0, reply: ReplyTo::Stream(self.answers.clone()) };
        enqueue(&self.ingress, self.overflow, submission).await;
    }
}

/// Apply the overflow policy. Victims — the new submission or displaced
/// older ones — are answered `BufferOverflow`, never lost silently.
async fn enqueue<D, C>(
    ingress: &IngressQueue<Submission<D, C>>,
    policy: OverflowPolicy,
    submission: Submission<D, C>,
) where
    D: Send + 'static,
    C: Send + 'static,
{
    match policy {
        OverflowPolicy::Backpressure => {
            if let Err(rejected) = ingress.push_wait(submission).await {
                rejected.answer_error(ErrorCause::PipelineShutdown).await;
            }
        }
        OverflowPolicy::DropNewest => match ingress.try_push(submission) {
            Ok(()) => {}
            Err(PushFull::Full(rejected)) => {
                rejected.answer_error(ErrorCause::BufferOverflow).await;
            }
            Err(PushFull::Closed(rejected)) => {
                rejected.answer_error(ErrorCause::PipelineShutdown).await;
            }
        },
        OverflowPolicy::Fail => match ingress.try_push(submission) {
            Ok(()) => {}
            Err(PushFull::Full(rejected)) => {
                warn!("ingress buffer overflowed under the Fail policy; closing the pipeline");
                ingress.close();
                rejected.answer_error(ErrorCause::BufferOverflow).await;
            }
            Err(PushFull::Closed(rejected)) => {
                rejected.answer_error(ErrorCause::PipelineShutdown).await;
            }
        },
        OverflowPolicy::DropOldest => match ingress.push_evict_oldest(submission) {
            Ok(None) => {}
            Ok(Some(victim)) => victim.answer_error(ErrorCause::BufferOverflow).await,
            Err(rejected) => rejected.answer_error(ErrorCause::PipelineShutdown).await,
        },
        OverflowPolicy::DropBuffer => match ingress.push_clearing(submission) {
            Ok(victims) => {
                for victim in victims {
                    victim.answer_error(ErrorCause::BufferOverflow).await;
                }
            }
            Err(rejected) => rejected.answer_error(ErrorCause::PipelineShutdown).await,
        },
    }
}

/// Pull submissions (retries first) and spawn a lane per request, bounded
/// by the parallelism semaphore.
async fn gate<D, C>(
    shared: Arc<Shared>,
    ingress: Arc<IngressQueue<Submission<D, C>>>,
    mut retry_rx: mpsc::Receiver<Submission<D, C>>,
    retry_tx: mpsc::Sender<Submission<D, C>>,
    parallelism: usize,
) where
    D: Send + 'static,
    C: Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(parallelism));
    loop {
        let submission = tokio::select! {
            biased;
            Some(submission) = retry_rx.recv() => submission,
            submission = ingress.pop() => match submission {
                Some(submission) => submission,
                None => break,
            },
        };
        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        // Cancelled while buffered: no admission is taken, no answer owed.
        if submission.reply.is_closed() {
            continue;
        }
        // Enqueue the admission request here, not in the lane: the limiter
        // mailbox then sees requests in ingress order within a bucket.
        let pending = shared
            .limiter
            .request_admission(submission.route_key(), submission.request.id())
            .await;
        tokio::spawn(lane(Arc::clone(&shared), submission, pending, permit, retry_tx.clone()));
    }
    // Ingress is closed and drained. Dropping `retry_rx` makes in-flight
    // lanes surface their error instead of queueing another attempt.
}

/// Walk one submission through admission, the HTTP exchange, and response
/// classification.
async fn lane<D, C>(
    shared: Arc<Shared>,
    submission: Submission<D, C>,
    pending: Result<oneshot::Receiver<Admission>, LimiterGone>,
    permit: OwnedSemaphorePermit,
    retry_tx: mpsc::Sender<Submission<D, C>>,
) where
    D: Send + 'static,
    C: Send + 'static,
{
    let _permit = permit;
    let route = submission.route_key();
    let id = submission.request.id();

    let verdict = match pending {
        Ok(rx) => rx.await.ok(),
        Err(_) => None,
    };
    match verdict {
        None => submission.answer_error(ErrorCause::PipelineShutdown).await,
        Some(Admission::Drop) => submission.answer_dropped().await,
        Some(Admission::Pass) => {
            if submission.reply.is_closed() {
                // Cancelled after admission: hand the reserved slot back.
                shared.limiter.release(route, id).await;
                return;
            }
            exchange(shared, submission, route, retry_tx).await;
        }
    }
}

/// The admitted part of a lane: send, classify, feed the limiter, answer.
async fn exchange<D, C>(
    shared: Arc<Shared>,
    submission: Submission<D, C>,
    route: RouteKey,
    retry_tx: mpsc::Sender<Submission<D, C>>,
) where
    D: Send + 'static,
    C: Send + 'static,
{
    let id = submission.request.id();
    let http_request = shared.wire.build(&submission.request);
    if shared.log_sent {
        debug!(%route, %id, url = %http_request.url, "sending request");
    }

    let started = Instant::now();
    let outcome =
        tokio::time::timeout(shared.http_timeout, shared.client.perform(http_request)).await;
    match outcome {
        Err(_) => {
            // No response observed; clear the in-flight reservation only.
            shared.limiter.update(route.clone(), id, RatelimitInfo::none()).await;
            let cause = ErrorCause::Timeout {
                elapsed: started.elapsed(),
                timeout: shared.http_timeout,
            };
            finish_failure(shared, submission, route, cause, retry_tx).await;
        }
        Ok(Err(transport)) => {
            shared.limiter.update(route.clone(), id, RatelimitInfo::none()).await;
            let cause = ErrorCause::Network { message: transport.message() };
            finish_failure(shared, submission, route, cause, retry_tx).await;
        }
        Ok(Ok(response)) => {
            if shared.log_received {
                debug!(%route, %id, status = %response.status, "received response");
            }
            let (info, interpretation) = interpret(&response, submission.request.parser(), &route);
            // Feed the limiter before the caller can observe the answer.
            shared.limiter.update(route.clone(), id, info.clone()).await;
            match interpretation {
                Interpretation::Success { data } => {
                    let Submission { request, reply, .. } = submission;
                    let context = request.into_context();
                    let ratelimit = info.has_any().then_some(info);
                    reply
                        .deliver(Answer::Response { data, ratelimit, route, id, context })
                        .await;
                }
                Interpretation::Ratelimited { info } => {
                    let global = info.global;
                    let Submission { request, reply, .. } = submission;
                    let context = request.into_context();
                    reply
                        .deliver(Answer::Ratelimited { global, ratelimit: info, route, id, context })
                        .await;
                }
                Interpretation::Failed { cause } => {
                    finish_failure(shared, submission, route, cause, retry_tx).await;
                }
            }
        }
    }
}

/// Either hand a failed submission to the retry lane (after backoff) or
/// surface the error answer.
async fn finish_failure<D, C>(
    shared: Arc<Shared>,
    mut submission: Submission<D, C>,
    route: RouteKey,
    cause: ErrorCause,
    retry_tx: mpsc::Sender<Submission<D, C>>,
) where
    D: Send + 'static,
    C: Send + 'static,
{
    let Some(delay) = shared.retry.next_delay(&cause, submission.attempts) else {
        submission.answer_error(cause).await;
        return;
    };

    submission.attempts += 1;
    let id = submission.request.id();
    debug!(%route, %id, attempts = submission.attempts, ?delay, %cause, "retrying failed request");

    // Back off outside the lane so the permit frees up; re-entry goes
    // through the bounded retry channel the gate prefers over ingress.
    let sleeper = Arc::clone(&shared.sleeper);
    tokio::spawn(async move {
        sleeper.sleep(delay).await;
        match retry_tx.try_send(submission) {
            Ok(()) => {}
            Err(TrySendError::Full(submission)) | Err(TrySendError::Closed(submission)) => {
                warn!(%route, %id, "retry lane unavailable; surfacing the failure");
                submission.answer_error(cause).await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{HttpRequest, HttpResponse, TransportError};
    use crate::request::unit_parser;
    use crate::route::Route;
    use async_trait::async_trait;
    use http::StatusCode;

    struct NoopClient;

    #[async_trait]
    impl HttpClient for NoopClient {
        async fn perform(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Ok(HttpResponse {
                status: StatusCode::NO_CONTENT,
                headers: http::HeaderMap::new(),
                body: bytes::Bytes::new(),
            })
        }
    }

    fn pipeline(config: PipelineConfig) -> Result<Pipeline<(), ()>, ConfigError> {
        Pipeline::new(
            Token::Bot("token".into()),
            Arc::new(NoopClient),
            LimiterConfig::default(),
            config,
        )
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let err = pipeline(PipelineConfig { buffer_size: 0, ..Default::default() });
        assert!(matches!(err, Err(ConfigError::ZeroBufferSize)));

        let err = pipeline(PipelineConfig { parallelism: 0, ..Default::default() });
        assert!(matches!(err, Err(ConfigError::ZeroParallelism)));
    }

    #[tokio::test]
    async fn submit_round_trips() {
        let pipeline = pipeline(PipelineConfig::default()).unwrap();
        let answer = pipeline
            .submit(Request::new(Route::delete("/channels/1/messages/2"), unit_parser(), ()))
            .await;
        assert!(answer.is_response());
    }

    #[tokio::test]
    async fn stream_senders_clone_and_share_the_answer_channel() {
        let pipeline: Pipeline<(), u8> = Pipeline::new(
            Token::Bot("token".into()),
            Arc::new(NoopClient),
            LimiterConfig::default(),
            PipelineConfig::default(),
        )
        .unwrap();
        let (sender, mut answers) = pipeline.stream();
        let second = sender.clone();

        sender.send(Request::new(Route::get("/channels/1"), unit_parser(), 1u8)).await;
        second.send(Request::new(Route::get("/channels/1"), unit_parser(), 2u8)).await;

        let a = answers.recv().await.unwrap();
        let b = answers.recv().await.unwrap();
        let mut tags = [*a.context(), *b.context()];
        tags.sort_unstable();
        assert_eq!(tags, [1, 2]);
    }

    #[tokio::test]
    async fn dropping_the_pipeline_and_senders_closes_ingress() {
        let pipeline = pipeline(PipelineConfig::default()).unwrap();
        let (sender, _answers) = pipeline.stream();
        let ingress = Arc::clone(&pipeline.ingress);
        drop(pipeline);
        assert!(matches!(
            ingress.try_push(Submission {
                request: Request::new(Route::get("/x"), unit_parser(), ()),
                attempts: 0,
                reply: ReplyTo::Stream(sender.answers.clone()),
            }),
            Ok(())
        ));
        drop(sender);
        tokio::task::yield_now().await;
        assert!(matches!(
            ingress.try_push(Submission {
                request: Request::new(Route::get("/x"), unit_parser(), ()),
                attempts: 0,
                reply: ReplyTo::Oneshot(oneshot::channel().0),
            }),
            Err(PushFull::Closed(_))
        ));
    }
}
