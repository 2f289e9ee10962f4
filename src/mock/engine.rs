//! Mock engine

use std::collections::VecDeque;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::request::{ExpectedRequest, RequestMatcher};
use super::response::MockResponse;
use super::spec::ResponseSpec;
use super::RequestDescription;
use crate::collect::{concat, consume_chunks};
use crate::config::LimitsConfig;
use crate::conversation::{Conversation, Exchange, ExchangeResponse, ExpectationSpec, ExpectedExchange};
use crate::dispatch::RequestHandler;
use crate::message::{Body, MessageRecord};
use crate::network::{HijackedSocket, InterceptedRequest, ResponseSink};
use crate::{MockError, Result};

/// Results of one request, stored at the position it arrived in
#[derive(Debug, Default)]
struct Slot {
    exchange: Option<Exchange>,
    expected: Option<ExpectedExchange>,
}

/// Answers intercepted requests from a queue of request descriptions
pub struct MockEngine {
    descriptions: Mutex<VecDeque<RequestDescription>>,
    slots: Mutex<Vec<Slot>>,
    limits: LimitsConfig,
}

impl MockEngine {
    /// Create an engine over `descriptions`
    ///
    /// # Errors
    ///
    /// Returns error if a description cannot be resolved
    pub fn new(descriptions: Vec<RequestDescription>, limits: LimitsConfig) -> Result<Self> {
        for description in &descriptions {
            description.validate()?;
        }

        Ok(Self {
            descriptions: Mutex::new(descriptions.into()),
            slots: Mutex::new(Vec::new()),
            limits,
        })
    }

    /// Number of descriptions not yet consumed
    pub async fn remaining(&self) -> usize {
        self.descriptions.lock().await.len()
    }

    async fn respond(
        &self,
        slot: usize,
        description: Option<RequestDescription>,
        mut request: InterceptedRequest,
        mut response: ResponseSink,
    ) -> Result<()> {
        let has_description = description.is_some();
        let (matcher, spec) = description.map_or((None, None), |d| (d.request, d.response));
        let expected = resolve(matcher)?;

        let chunks = consume_chunks(request.take_body(), self.limits.max_request_size)
            .await
            .into_result()?;
        let record = request_record(&request, &concat(&chunks));
        let socket = request.socket().clone();
        let observation = response.observe();

        let outcome = match spec {
            Some(ResponseSpec::Handler(handler)) => {
                request.replay_body(chunks);
                match handler(request, response).await {
                    Ok(()) => ExchangeResponse::Response(MockResponse::from_raw(
                        observation.wait().await.as_deref(),
                    )),
                    Err(failure) => {
                        let error = MockError::from_failure(&failure);
                        deliver_error(&socket, None, &error).await;
                        ExchangeResponse::Error(error)
                    }
                }
            }
            spec => match MockResponse::materialize(spec, self.limits.max_response_size).await {
                Ok(mock) => {
                    tokio::task::yield_now().await;
                    deliver(&mut response, &mock)?;
                    drop(response);
                    ExchangeResponse::Response(MockResponse::from_raw(
                        observation.wait().await.as_deref(),
                    ))
                }
                Err(error) => {
                    deliver_error(&socket, Some(response), &error).await;
                    ExchangeResponse::Error(error)
                }
            },
        };

        let response = match outcome {
            ExchangeResponse::Response(_) if !has_description => None,
            outcome => Some(outcome),
        };
        debug!(url = ?record.url, "Exchange observed");

        let mut slots = self.slots.lock().await;
        let Some(entry) = slots.get_mut(slot) else {
            return Ok(());
        };
        *entry = Slot {
            exchange: Some(Exchange {
                request: record,
                response,
            }),
            expected: has_description.then(|| ExpectedExchange {
                request: expected,
                response: None,
            }),
        };
        Ok(())
    }

    /// Assemble the conversation and the expectation, resolving descriptions
    /// that were declared but never requested
    ///
    /// # Errors
    ///
    /// Returns error if a leftover description cannot be resolved
    pub async fn finish(&self) -> Result<(Conversation, ExpectationSpec)> {
        let slots = std::mem::take(&mut *self.slots.lock().await);
        let mut conversation = Conversation::default();
        let mut expectation = ExpectationSpec::default();
        for slot in slots {
            conversation.exchanges.extend(slot.exchange);
            expectation.exchanges.extend(slot.expected);
        }

        let leftovers: Vec<_> = self.descriptions.lock().await.drain(..).collect();
        for description in leftovers {
            let request = resolve(description.request)?;
            info!(url = ?request.url, "Declared exchange was never requested");
            let response = MockResponse::materialize(description.response, self.limits.max_response_size)
                .await
                .into();
            expectation.exchanges.push(ExpectedExchange {
                request,
                response: Some(response),
            });
        }

        Ok((conversation, expectation))
    }
}

impl RequestHandler for MockEngine {
    async fn handle(&self, request: InterceptedRequest, response: ResponseSink) -> Result<()> {
        let description = self.descriptions.lock().await.pop_front();
        if description.is_none() {
            warn!(
                method = %request.method(),
                path = request.path(),
                "No response configured for request"
            );
        }
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.push(Slot::default());
            slots.len() - 1
        };

        let socket = request.socket().clone();
        self.respond(slot, description, request, response)
            .await
            .map_err(|e| {
                socket.emit_error(e.to_string());
                e
            })
    }
}

fn resolve(matcher: Option<RequestMatcher>) -> Result<ExpectedRequest> {
    matcher.map_or_else(|| Ok(ExpectedRequest::default()), RequestMatcher::resolve)
}

fn request_record(request: &InterceptedRequest, body: &bytes::Bytes) -> MessageRecord {
    let options = request.socket().options();
    MessageRecord {
        method: Some(request.method().to_string()),
        url: Some(request.path().to_string()),
        protocol: Some(request.protocol()),
        headers: request.canonical_headers(),
        host: Some(options.host.clone()),
        port: Some(options.port),
        encrypted: Some(options.encrypted),
        body: (!body.is_empty()).then(|| Body::Bytes(body.clone())),
        ..MessageRecord::default()
    }
}

fn deliver(response: &mut ResponseSink, mock: &MockResponse) -> Result<()> {
    response.set_status(mock.status_code)?;
    for (name, value) in mock.headers.iter() {
        response.append_header(name, value)?;
    }
    match &mock.body {
        Some(body) => response.write(body.clone())?,
        None if !mock.headers.is_empty() => response.write_head()?,
        None => {}
    }
    response.end()
}

async fn deliver_error(socket: &HijackedSocket, response: Option<ResponseSink>, error: &MockError) {
    tokio::task::yield_now().await;
    socket.emit_error(error.to_string());
    drop(response);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use hyper::{HeaderMap, Method};

    use crate::network::{ConnectOptions, RawTap, RequestBody};

    fn admission(path: &str) -> (InterceptedRequest, ResponseSink) {
        let socket = HijackedSocket::new(1, ConnectOptions::new("example.com", 80, false));
        let (sink, head) = ResponseSink::new(socket.clone(), RawTap::new());
        tokio::spawn(async move {
            let _ = head.await;
        });
        let request = InterceptedRequest::new(
            Method::GET,
            path,
            HeaderMap::new(),
            RequestBody::from(vec![Bytes::from("x")]),
            socket,
        );
        (request, sink)
    }

    #[tokio::test]
    async fn test_declared_error_recorded() {
        let engine = MockEngine::new(
            vec![RequestDescription::new("GET /").respond(MockError::new("boom"))],
            LimitsConfig::default(),
        )
        .unwrap();

        let (request, response) = admission("/");
        engine.handle(request, response).await.unwrap();

        let (conversation, expectation) = engine.finish().await.unwrap();
        assert_eq!(conversation.len(), 1);
        assert_eq!(
            conversation.exchanges[0].response,
            Some(ExchangeResponse::Error(MockError::new("boom")))
        );
        assert_eq!(conversation.exchanges[0].request.body, Some(Body::Bytes(Bytes::from("x"))));
        assert_eq!(expectation.len(), 1);
        assert_eq!(expectation.exchanges[0].response, None);
    }

    #[tokio::test]
    async fn test_leftovers_resolved_into_expectation() {
        let engine = MockEngine::new(
            vec![
                RequestDescription::new("GET /a").respond(201),
                RequestDescription::new("GET /b").respond(404),
            ],
            LimitsConfig::default(),
        )
        .unwrap();

        let (conversation, expectation) = engine.finish().await.unwrap();
        assert!(conversation.is_empty());
        assert_eq!(expectation.len(), 2);
        let Some(ExchangeResponse::Response(response)) = &expectation.exchanges[1].response else {
            panic!("expected response");
        };
        assert_eq!(response.status_code, 404);
        assert_eq!(engine.remaining().await, 0);
    }

    #[test]
    fn test_streamed_request_body_fails_fast() {
        use crate::mock::{BodySpec, RequestProperties};

        let description = RequestDescription::new(
            RequestProperties::url("POST /").body(BodySpec::stream(futures_util::stream::empty())),
        );
        assert!(matches!(
            MockEngine::new(vec![description], LimitsConfig::default()),
            Err(crate::MitmError::StreamedRequestBody)
        ));
    }
}
