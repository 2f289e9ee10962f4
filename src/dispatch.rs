//! Serialized dispatch of intercepted requests
//!
//! Requests are admitted in arrival order and handled one at a time: the
//! next handler starts only after the previous response ended or its
//! connection closed, and after yielding once to the scheduler so the
//! finishing handler can run its cleanup first.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error};

use crate::network::{InterceptedRequest, PendingConnect, ResponseSink};
use crate::{MitmError, Result};

/// Session logic driven by the dispatcher
pub trait RequestHandler: Send + Sync + 'static {
    /// Decide the fate of a dial; dropping the pending connect intercepts it
    fn on_connect(&self, pending: PendingConnect) {
        drop(pending);
    }

    /// Process one intercepted request. An error rejects the session.
    fn handle(
        &self,
        request: InterceptedRequest,
        response: ResponseSink,
    ) -> impl Future<Output = Result<()>> + Send;
}

type Admission = (InterceptedRequest, ResponseSink);

struct PendingGuard(Arc<watch::Sender<usize>>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.send_modify(|pending| *pending = pending.saturating_sub(1));
    }
}

/// FIFO admission queue with at most one request in flight
pub struct Dispatcher {
    queue: mpsc::UnboundedSender<Admission>,
    pending: Arc<watch::Sender<usize>>,
    worker: JoinHandle<()>,
}

impl Dispatcher {
    /// Start dispatching to `handler`; handler errors are sent to `failures`
    pub fn spawn<H: RequestHandler>(
        handler: Arc<H>,
        failures: mpsc::UnboundedSender<MitmError>,
    ) -> Self {
        let (queue, admissions) = mpsc::unbounded_channel();
        let pending = Arc::new(watch::Sender::new(0));
        let worker = tokio::spawn(run(handler, admissions, Arc::clone(&pending), failures));

        Self {
            queue,
            pending,
            worker,
        }
    }

    /// Admit a request
    pub fn enqueue(&self, request: InterceptedRequest, response: ResponseSink) {
        self.pending.send_modify(|pending| *pending += 1);
        if self.queue.send((request, response)).is_err() {
            self.pending.send_modify(|pending| *pending = pending.saturating_sub(1));
        }
    }

    /// Number of admitted requests whose handlers have not finished
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait until every admitted request has been fully handled
    pub async fn drain(&self) {
        let mut pending = self.pending.subscribe();
        let _ = pending.wait_for(|pending| *pending == 0).await;
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run<H: RequestHandler>(
    handler: Arc<H>,
    mut admissions: mpsc::UnboundedReceiver<Admission>,
    pending: Arc<watch::Sender<usize>>,
    failures: mpsc::UnboundedSender<MitmError>,
) {
    let mut handlers = JoinSet::new();

    while let Some((request, mut response)) = admissions.recv().await {
        debug!(
            method = %request.method(),
            path = request.path(),
            socket = request.socket().id(),
            "Dispatching intercepted request"
        );

        let finished = response.on_finish();
        let guard = PendingGuard(Arc::clone(&pending));
        let handler = Arc::clone(&handler);
        let handler_failures = failures.clone();
        handlers.spawn(async move {
            let _guard = guard;
            if let Err(e) = handler.handle(request, response).await {
                let _ = handler_failures.send(e);
            }
        });

        let _ = finished.await;
        tokio::task::yield_now().await;

        while let Some(joined) = handlers.try_join_next() {
            reap(joined, &failures);
        }
    }

    while let Some(joined) = handlers.join_next().await {
        reap(joined, &failures);
    }
}

fn reap(joined: std::result::Result<(), tokio::task::JoinError>, failures: &mpsc::UnboundedSender<MitmError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Request handler panicked");
            let _ = failures.send(MitmError::HandlerPanicked);
        }
    }
}
