//! Mitmock - record real HTTP traffic into fixtures, or mock it, from tests
//!
//! Traffic of an assertion body is intercepted in-process. In record mode
//! every request is replayed against its real upstream and the exchanges are
//! returned in a canonical, trimmed form. In mock mode requests are answered
//! from declared descriptions and the observed conversation is checked
//! against them.
//!
//! ```no_run
//! # async fn run() -> mitmock::Result<()> {
//! use http_body_util::BodyExt;
//! use mitmock::Mitm;
//!
//! let outcome = Mitm::default()
//!     .mock(["GET http://example.com/status"], |client| async move {
//!         let response = client
//!             .get("http://example.com/status".parse()?)
//!             .await?;
//!         assert_eq!(response.status(), 200);
//!         response.into_body().collect().await?;
//!         Ok(())
//!     })
//!     .await?;
//! assert_eq!(outcome.conversation.len(), 1);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::field_reassign_with_default,
    clippy::multiple_crate_versions
)]

pub mod collect;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod inject;
pub mod matcher;
pub mod message;
pub mod mock;
pub mod network;
pub mod recording;
pub mod session;

pub use error::{MitmError, MockError, Result};
pub use session::{Mitm, MockOutcome};

/// Run an assertion body under interception, selected by a marker literal.
///
/// - `expect_http!("with http recorded", assertion)` records and resolves to
///   the fixture.
/// - `expect_http!("with http recorded and injected", assertion)` records and
///   buffers the fixture for [`inject::ledger`], which rewrites the marker
///   into the mocked form once applied.
/// - `expect_http!("with http mocked out", fixture, assertion)` mocks with the
///   exchanges of a fixture.
#[macro_export]
macro_rules! expect_http {
    ("with http recorded", $assertion:expr $(,)?) => {
        async move { $crate::Mitm::default().record($assertion).await }
    };
    ("with http recorded and injected", $assertion:expr $(,)?) => {
        async move {
            $crate::Mitm::default()
                .record_and_inject($crate::inject::ledger(), $assertion)
                .await
        }
    };
    ("with http mocked out", $fixture:expr, $assertion:expr $(,)?) => {
        async move { $crate::Mitm::default().mock_fixture($fixture, $assertion).await }
    };
}
