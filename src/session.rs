//! Record and mock sessions
//!
//! A session owns one [`Hijacker`] for the duration of an assertion body.
//! Hijack events are pumped on the caller's task: dials are decided by the
//! session's engine, requests are admitted to a [`Dispatcher`]. Once the
//! assertion resolves the pump keeps running until every admitted request
//! has been handled, then interception is disabled on every exit path.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{Config, Mode};
use crate::conversation::{Conversation, ExpectationSpec};
use crate::dispatch::{Dispatcher, RequestHandler};
use crate::inject::{Callsite, InjectionLedger};
use crate::matcher::{ConversationMatcher, SatisfyMatcher};
use crate::message::Fixture;
use crate::mock::{MockEngine, RequestDescription};
use crate::network::{HijackEvent, Hijacker, HttpClient};
use crate::recording::RecordingEngine;
use crate::{MitmError, Result};

/// What a successful mocked session observed and expected
#[derive(Debug, Clone, PartialEq)]
pub struct MockOutcome {
    /// Exchanges observed, in arrival order
    pub conversation: Conversation,
    /// Exchanges declared, in order
    pub expectation: ExpectationSpec,
}

/// Entry point for recording and mocking HTTP traffic
#[derive(Debug, Clone, Default)]
pub struct Mitm {
    config: Arc<Config>,
}

impl Mitm {
    /// Create sessions with `config`
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run `assertion` with a client whose traffic goes to the real network,
    /// and return what went over the wire as a fixture.
    ///
    /// # Errors
    ///
    /// Returns error if the assertion fails, a request has no usable Host
    /// header, or an upstream request fails
    pub async fn record<F, Fut>(&self, assertion: F) -> Result<Fixture>
    where
        F: FnOnce(HttpClient) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        info!(mode = ?Mode::Record, "Starting session");
        let mut hijacker = Hijacker::new(&self.config.limits);
        let engine = Arc::new(RecordingEngine::new(
            hijacker.connector(),
            self.config.limits.clone(),
        ));

        let result = drive(&mut hijacker, Arc::clone(&engine), assertion).await;
        hijacker.disable();
        result?;

        Ok(engine.finish().await)
    }

    /// Like [`Mitm::record`], then buffer the fixture for injection in place
    /// of the marker found at or after the caller's line
    ///
    /// # Errors
    ///
    /// Returns error if recording fails or the caller's source cannot be read
    #[track_caller]
    pub fn record_and_inject<'a, F, Fut>(
        &'a self,
        ledger: &'a InjectionLedger,
        assertion: F,
    ) -> impl Future<Output = Result<Fixture>> + 'a
    where
        F: FnOnce(HttpClient) -> Fut + 'a,
        Fut: Future<Output = anyhow::Result<()>> + 'a,
    {
        let callsite = Callsite::caller();
        async move {
            let fixture = self.record(assertion).await?;
            ledger.record_pending_injection(&callsite, &fixture)?;
            Ok(fixture)
        }
    }

    /// Run `assertion` with every request answered from `descriptions`, in
    /// order, and check the conversation with [`SatisfyMatcher`]
    ///
    /// # Errors
    ///
    /// Returns error if a description is invalid, the assertion fails, or the
    /// conversation does not satisfy the expectation
    pub async fn mock<D, F, Fut>(&self, descriptions: D, assertion: F) -> Result<MockOutcome>
    where
        D: IntoIterator,
        D::Item: Into<RequestDescription>,
        F: FnOnce(HttpClient) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        self.mock_with(&SatisfyMatcher, descriptions, assertion).await
    }

    /// [`Mitm::mock`] with a custom matcher
    ///
    /// # Errors
    ///
    /// Returns error if a description is invalid, the assertion fails, or
    /// `matcher` rejects the conversation
    pub async fn mock_with<M, D, F, Fut>(
        &self,
        matcher: &M,
        descriptions: D,
        assertion: F,
    ) -> Result<MockOutcome>
    where
        M: ConversationMatcher + ?Sized,
        D: IntoIterator,
        D::Item: Into<RequestDescription>,
        F: FnOnce(HttpClient) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let descriptions: Vec<RequestDescription> = descriptions.into_iter().map(Into::into).collect();
        let engine = Arc::new(MockEngine::new(descriptions, self.config.limits.clone())?);

        info!(mode = ?Mode::Mock, declared = engine.remaining().await, "Starting session");
        let mut hijacker = Hijacker::new(&self.config.limits);
        let result = drive(&mut hijacker, Arc::clone(&engine), assertion).await;
        hijacker.disable();
        result?;

        let (conversation, expectation) = engine.finish().await?;
        debug!(
            observed = conversation.len(),
            expected = expectation.len(),
            "Reconciling conversation"
        );
        matcher.satisfy(&conversation, &expectation)?;

        Ok(MockOutcome {
            conversation,
            expectation,
        })
    }

    /// Mock with the exchanges of a recorded fixture
    ///
    /// # Errors
    ///
    /// Returns error if the fixture cannot be parsed, or as [`Mitm::mock`]
    pub async fn mock_fixture<F, Fut>(&self, fixture: &str, assertion: F) -> Result<MockOutcome>
    where
        F: FnOnce(HttpClient) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let descriptions = RequestDescription::from_fixture(Fixture::parse(fixture)?);
        self.mock(descriptions, assertion).await
    }
}

/// Run the assertion, then drain the dispatcher, pumping hijack events the
/// whole time
async fn drive<H, F, Fut>(hijacker: &mut Hijacker, handler: Arc<H>, assertion: F) -> Result<()>
where
    H: RequestHandler,
    F: FnOnce(HttpClient) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let (failures_tx, mut failures) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::spawn(Arc::clone(&handler), failures_tx);
    let assertion = assertion(hijacker.client());

    let outcome = pump(hijacker, handler.as_ref(), &dispatcher, &mut failures, assertion).await?;
    outcome.map_err(MitmError::Assertion)?;

    pump(hijacker, handler.as_ref(), &dispatcher, &mut failures, dispatcher.drain()).await?;
    match failures.try_recv() {
        Ok(error) => Err(error),
        Err(_) => Ok(()),
    }
}

async fn pump<H, T>(
    hijacker: &mut Hijacker,
    handler: &H,
    dispatcher: &Dispatcher,
    failures: &mut mpsc::UnboundedReceiver<MitmError>,
    until: impl Future<Output = T>,
) -> Result<T>
where
    H: RequestHandler,
{
    tokio::pin!(until);
    loop {
        tokio::select! {
            biased;
            Some(error) = failures.recv() => return Err(error),
            Some(event) = hijacker.next_event() => match event {
                HijackEvent::Connect(pending) => handler.on_connect(pending),
                HijackEvent::Request(request, response) => dispatcher.enqueue(request, response),
            },
            value = &mut until => return Ok(value),
        }
    }
}
