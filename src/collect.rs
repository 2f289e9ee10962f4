//! Stream collection
//!
//! Drains a body to its end. A mid-stream failure does not discard what was
//! read so far: the partial data and the error are returned together and the
//! caller decides what the failure means.

use bytes::{Buf, Bytes, BytesMut};
use http_body_util::BodyExt;
use hyper::body::Body;

use crate::{MitmError, Result};

/// Data gathered from a stream, with the error that stopped it, if any
#[derive(Debug)]
pub struct Collected<T> {
    /// Everything read before the stream ended or failed
    pub data: T,
    /// The failure that ended the stream early
    pub error: Option<MitmError>,
}

impl<T> Collected<T> {
    /// Whether the stream reached its end without failing
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// Discard partial data on failure
    ///
    /// # Errors
    ///
    /// Returns the error that ended the stream early
    pub fn into_result(self) -> Result<T> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.data),
        }
    }
}

/// Drain a body into its raw sequence of chunks
pub async fn consume_chunks<B>(mut body: B, limit: usize) -> Collected<Vec<Bytes>>
where
    B: Body + Unpin,
    B::Error: Into<MitmError>,
{
    let mut chunks = Vec::new();
    let mut size = 0usize;

    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                return Collected {
                    data: chunks,
                    error: Some(e.into()),
                }
            }
        };

        let Ok(mut data) = frame.into_data() else {
            // trailers carry no payload
            continue;
        };

        let len = data.remaining();
        size += len;
        if size > limit {
            return Collected {
                data: chunks,
                error: Some(MitmError::DataTooLarge { size, limit }),
            };
        }
        if len > 0 {
            chunks.push(data.copy_to_bytes(len));
        }
    }

    Collected {
        data: chunks,
        error: None,
    }
}

/// Drain a body into one contiguous buffer
pub async fn consume_body<B>(body: B, limit: usize) -> Collected<Bytes>
where
    B: Body + Unpin,
    B::Error: Into<MitmError>,
{
    let Collected { data, error } = consume_chunks(body, limit).await;
    Collected {
        data: concat(&data),
        error,
    }
}

/// Join chunks into one buffer
pub fn concat(chunks: &[Bytes]) -> Bytes {
    match chunks {
        [] => Bytes::new(),
        [single] => single.clone(),
        chunks => {
            let mut buffer = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
            for chunk in chunks {
                buffer.extend_from_slice(chunk);
            }
            buffer.freeze()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use http_body_util::{Full, StreamBody};
    use hyper::body::Frame;

    use crate::MockError;

    fn chunked(
        items: Vec<std::result::Result<&'static [u8], MockError>>,
    ) -> StreamBody<
        stream::Iter<std::vec::IntoIter<std::result::Result<Frame<Bytes>, MockError>>>,
    > {
        let frames: Vec<_> = items
            .into_iter()
            .map(|item| item.map(|bytes| Frame::data(Bytes::from_static(bytes))))
            .collect();
        StreamBody::new(stream::iter(frames))
    }

    #[tokio::test]
    async fn test_consume_body_concatenates() {
        let body = chunked(vec![Ok(b"hello "), Ok(b""), Ok(b"world")]);
        let collected = consume_body(body, 1024).await;
        assert!(collected.is_complete());
        assert_eq!(collected.data, Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_consume_chunks_keeps_boundaries() {
        let body = chunked(vec![Ok(b"a"), Ok(b"bc")]);
        let collected = consume_chunks(body, 1024).await;
        assert_eq!(collected.into_result().unwrap(), vec![Bytes::from("a"), Bytes::from("bc")]);
    }

    #[tokio::test]
    async fn test_partial_data_survives_error() {
        let body = chunked(vec![Ok(b"partial"), Err(MockError::new("reset")), Ok(b"never")]);
        let collected = consume_body(body, 1024).await;
        assert_eq!(collected.data, Bytes::from_static(b"partial"));
        assert!(matches!(collected.error, Some(MitmError::Mock(ref e)) if e.message == "reset"));
    }

    #[tokio::test]
    async fn test_limit_enforced() {
        let body = Full::new(Bytes::from(vec![0u8; 100]));
        let collected = consume_body(
            body.map_err(|never: std::convert::Infallible| -> MitmError { match never {} }),
            10,
        )
        .await;
        assert!(matches!(
            collected.into_result(),
            Err(MitmError::DataTooLarge { size: 100, limit: 10 })
        ));
    }

    #[test]
    fn test_concat() {
        assert!(concat(&[]).is_empty());
        assert_eq!(concat(&[Bytes::from("x"), Bytes::from("y")]), Bytes::from("xy"));
    }
}
