//! Installation verification: deferred checks that watched services reach UP.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::stream::{self, select_all, BoxStream};
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio::time::{sleep_until, Instant};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;

use super::{OperationError, RuntimeContext};
use crate::container::ServiceContainer;
use crate::service::{ServiceName, ServiceState, ServiceStatus};

pub const DEFAULT_VERIFICATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Names a step expects to reach UP before its transaction may commit.
#[derive(Clone, Debug)]
pub struct VerificationRequest {
    pub step: usize,
    pub watched: BTreeSet<ServiceName>,
    pub timeout: Duration,
}

/// Register a verification using the context's default deadline.
pub fn add_verify_installation_step(
    ctx: &RuntimeContext,
    watched: impl IntoIterator<Item = ServiceName>,
) {
    add_verify_installation_step_with_timeout(ctx, watched, ctx.verification_timeout());
}

pub fn add_verify_installation_step_with_timeout(
    ctx: &RuntimeContext,
    watched: impl IntoIterator<Item = ServiceName>,
    timeout: Duration,
) {
    let request = VerificationRequest {
        step: ctx.step(),
        watched: watched.into_iter().collect(),
        timeout,
    };
    tracing::debug!(
        step = request.step,
        watched = request.watched.len(),
        ?timeout,
        "Verification step registered"
    );
    ctx.push_verification(request);
}

/// Completion token of a spawned verification.
pub(crate) struct VerificationHandle {
    step: usize,
    rx: oneshot::Receiver<Result<(), OperationError>>,
}

impl VerificationHandle {
    pub(crate) async fn outcome(self) -> (usize, Result<(), OperationError>) {
        let res = self.rx.await.unwrap_or(Err(OperationError::Cancelled));
        (self.step, res)
    }
}

/// Run the request on a container worker; the deadline starts now.
pub(crate) fn spawn_verification(
    container: &ServiceContainer,
    request: VerificationRequest,
    cancel: CancellationToken,
) -> VerificationHandle {
    let (tx, rx) = oneshot::channel();
    let step = request.step;
    let watcher = container.clone();
    container.runtime().spawn(async move {
        let res = await_installation(&watcher, &request.watched, request.timeout, &cancel).await;
        if let Err(err) = &res {
            tracing::debug!(step, error = %err, "Verification failed");
        }
        // receiver is gone once the transaction stopped waiting
        let _ = tx.send(res);
    });
    VerificationHandle { step, rx }
}

/// Wait until every watched service is UP.
///
/// Fails as soon as one of them is FAILED, missing, or removed; fails with
/// [`OperationError::VerificationTimeout`] once `timeout` elapses. Cancellation only stops
/// watching.
pub async fn await_installation(
    container: &ServiceContainer,
    watched: &BTreeSet<ServiceName>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), OperationError> {
    let deadline = Instant::now() + timeout;

    let mut streams: Vec<BoxStream<'static, (ServiceName, Option<ServiceStatus>)>> =
        Vec::with_capacity(watched.len());
    for name in watched {
        let Some(rx) = container.watch(name) else {
            return Err(OperationError::ServiceFailure {
                service: name.clone(),
                cause: "service is not installed".into(),
            });
        };
        let tag = name.clone();
        // a closed channel means the entry is gone; surface that as a terminal event
        let events = WatchStream::new(rx)
            .map(move |status| (tag.clone(), Some(status)))
            .chain(stream::once(futures::future::ready((name.clone(), None))));
        streams.push(events.boxed());
    }

    let mut pending = watched.clone();
    let mut events = select_all(streams);

    while !pending.is_empty() {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OperationError::Cancelled),
            event = events.next() => match event {
                Some((name, Some(status))) => match status.state {
                    ServiceState::Up => {
                        pending.remove(&name);
                    }
                    ServiceState::Failed => {
                        return Err(OperationError::ServiceFailure {
                            service: name,
                            cause: status
                                .failure
                                .map(|f| f.to_string())
                                .unwrap_or_else(|| "unknown failure".into()),
                        });
                    }
                    ServiceState::Removing => return Err(removed(name)),
                    ServiceState::Down | ServiceState::Starting => {}
                },
                Some((name, None)) => return Err(removed(name)),
                None => break,
            },
            _ = sleep_until(deadline) => {
                return Err(OperationError::VerificationTimeout {
                    pending: pending.into_iter().collect(),
                    timeout,
                });
            }
        }
    }

    match pending.into_iter().next() {
        None => Ok(()),
        Some(name) => Err(removed(name)),
    }
}

fn removed(service: ServiceName) -> OperationError {
    OperationError::ServiceFailure {
        service,
        cause: "service was removed while awaiting installation".into(),
    }
}
