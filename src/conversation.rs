//! Observed conversations and declared expectations

use crate::message::MessageRecord;
use crate::mock::{ExpectedRequest, MockResponse};
use crate::MockError;

/// What came back for a request
#[derive(Debug, Clone, PartialEq)]
pub enum ExchangeResponse {
    /// A response was delivered
    Response(MockResponse),
    /// The connection failed with this error
    Error(MockError),
}

impl From<Result<MockResponse, MockError>> for ExchangeResponse {
    fn from(result: Result<MockResponse, MockError>) -> Self {
        match result {
            Ok(response) => Self::Response(response),
            Err(error) => Self::Error(error),
        }
    }
}

/// One observed request and what it got back; `None` means no response was
/// configured for it
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    /// The request as received
    pub request: MessageRecord,
    /// The response as observed on the wire
    pub response: Option<ExchangeResponse>,
}

/// Exchanges observed during a mocked session, in arrival order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    /// Observed exchanges
    pub exchanges: Vec<Exchange>,
}

impl Conversation {
    /// Number of exchanges
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    /// Whether nothing was observed
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}

/// One declared exchange; a response is only expected for declarations that
/// were never requested
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedExchange {
    /// The expected request
    pub request: ExpectedRequest,
    /// The expected response
    pub response: Option<ExchangeResponse>,
}

/// Exchanges a test declared, in order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpectationSpec {
    /// Expected exchanges
    pub exchanges: Vec<ExpectedExchange>,
}

impl ExpectationSpec {
    /// Number of exchanges
    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    /// Whether nothing was declared
    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }
}
