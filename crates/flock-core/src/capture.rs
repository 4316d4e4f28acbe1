//! Response capture for replay.
//!
//! The leader's handler output is recorded into a [`CaptureBuffer`] and
//! snapshotted into a [`Replay`] that every waiting caller receives.
//!
//! The entire body is held in memory. Coalesced endpoints are expected to
//! return small responses; `max_response_bytes` bounds the buffer and a
//! larger body turns into a 502 for every caller in the group.

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::error::LeaderFailure;
use crate::pool::Reusable;

/// An immutable snapshot of one captured response.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Full response body.
    pub body: Bytes,
}

impl IntoResponse for Replay {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Records status, headers and body of a single handler execution.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: BytesMut,
}

impl CaptureBuffer {
    /// Creates an empty capture buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status code. The last write wins.
    pub fn set_status(&mut self, status: StatusCode) {
        self.status = Some(status);
    }

    /// Returns the captured headers for mutation.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Appends a chunk to the captured body.
    pub fn append_body(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    /// Returns the number of body bytes captured.
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Discards everything captured so far.
    pub fn clear(&mut self) {
        self.status = None;
        self.headers.clear();
        self.body.clear();
    }

    /// Records a complete handler response, buffering its body.
    ///
    /// Headers are appended to any already captured. Fails if the body
    /// stream errors or grows past `limit` bytes.
    pub async fn record(
        &mut self,
        response: Response,
        limit: usize,
    ) -> Result<(), LeaderFailure> {
        let (parts, body) = response.into_parts();
        self.set_status(parts.status);
        self.headers.extend(parts.headers);

        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(LeaderFailure::Body)?;
            if self.body.len() + chunk.len() > limit {
                return Err(LeaderFailure::ResponseTooLarge { limit });
            }
            self.append_body(&chunk);
        }

        Ok(())
    }

    /// Takes the captured response out as a [`Replay`], leaving the buffer empty.
    pub fn finish(&mut self) -> Replay {
        Replay {
            status: self.status.take().unwrap_or(StatusCode::OK),
            headers: std::mem::take(&mut self.headers),
            body: self.body.split().freeze(),
        }
    }
}

impl Reusable for CaptureBuffer {
    fn reset(&mut self) {
        self.clear();
    }

    fn is_reset(&self) -> bool {
        self.status.is_none() && self.headers.is_empty() && self.body.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, HeaderValue};

    #[test]
    fn test_status_last_write_wins() {
        let mut capture = CaptureBuffer::new();
        assert_eq!(capture.finish().status, StatusCode::OK);

        capture.set_status(StatusCode::CREATED);
        capture.set_status(StatusCode::ACCEPTED);
        assert_eq!(capture.finish().status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_record_handler_response() {
        let response = (
            StatusCode::IM_A_TEAPOT,
            [(header::CONTENT_TYPE, "text/plain")],
            "short and stout",
        )
            .into_response();

        let mut capture = CaptureBuffer::new();
        capture
            .headers_mut()
            .insert("x-trace", HeaderValue::from_static("1"));
        capture.record(response, usize::MAX).await.unwrap();

        assert_eq!(capture.body_len(), 15);
        let replay = capture.finish();
        assert_eq!(replay.status, StatusCode::IM_A_TEAPOT);
        assert_eq!(
            replay.headers.get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert_eq!(replay.headers.get("x-trace").unwrap(), "1");
        assert_eq!(&replay.body[..], b"short and stout");
        assert!(capture.is_reset());
    }

    #[tokio::test]
    async fn test_record_rejects_oversized_body() {
        let response = "0123456789".into_response();

        let mut capture = CaptureBuffer::new();
        let err = capture.record(response, 4).await.unwrap_err();
        assert!(matches!(err, LeaderFailure::ResponseTooLarge { limit: 4 }));
    }

    #[tokio::test]
    async fn test_replay_into_response() {
        let mut headers = HeaderMap::new();
        headers.insert("x-answer", HeaderValue::from_static("42"));
        let replay = Replay {
            status: StatusCode::NOT_FOUND,
            headers,
            body: Bytes::from_static(b"nothing here"),
        };

        let response = replay.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("x-answer").unwrap(), "42");
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"nothing here");
    }
}
