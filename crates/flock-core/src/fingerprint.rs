//! Request fingerprinting.
//!
//! Two requests are coalesced only when their fingerprints match. The
//! fingerprint covers the method, request target, protocol version, every
//! header and a digest of the full body.

use axum::body::Body;
use axum::extract::Request;
use axum::http::request::Parts;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{CoalesceError, Result};
use crate::pool::{scratch_pool, Pool, PoolConfig, PoolStats};

/// Deterministic identity of a logical request.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hashes a canonical request key into a fingerprint.
    pub fn of(canonical: &[u8]) -> Self {
        Self(Sha256::digest(canonical).into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0[..8]))
    }
}

/// Serializes the identifying parts of a request.
///
/// Every variable-length field is written as a big-endian `u64` length
/// followed by its bytes, so header content can never shift a field
/// boundary. Order: method, target, version, the number of header names,
/// then per name (sorted) the name, its value count and each value in
/// arrival order, and finally the SHA-256 of the body.
pub fn canonical_key(parts: &Parts, body: &[u8]) -> Vec<u8> {
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut key = Vec::with_capacity(256);
    put_field(&mut key, parts.method.as_str().as_bytes());
    put_field(&mut key, target.as_bytes());
    put_field(&mut key, format!("{:?}", parts.version).as_bytes());

    let mut names: Vec<_> = parts.headers.keys().collect();
    names.sort_unstable_by(|a, b| a.as_str().cmp(b.as_str()));
    put_len(&mut key, names.len());
    for name in names {
        put_field(&mut key, name.as_str().as_bytes());
        let values = parts.headers.get_all(name);
        put_len(&mut key, values.iter().count());
        for value in values.iter() {
            put_field(&mut key, value.as_bytes());
        }
    }

    key.extend_from_slice(&Sha256::digest(body));
    key
}

fn put_len(key: &mut Vec<u8>, len: usize) {
    key.extend_from_slice(&(len as u64).to_be_bytes());
}

fn put_field(key: &mut Vec<u8>, field: &[u8]) {
    put_len(key, field.len());
    key.extend_from_slice(field);
}

/// Derives fingerprints, buffering request bodies through a scratch pool.
pub struct FingerprintDeriver {
    scratch: Pool<BytesMut>,
    max_body_bytes: usize,
}

impl FingerprintDeriver {
    /// Creates a deriver that buffers at most `max_body_bytes` of body.
    pub fn new(max_body_bytes: usize, pool: PoolConfig) -> Self {
        Self {
            scratch: scratch_pool(pool),
            max_body_bytes,
        }
    }

    /// Computes the fingerprint of `request`.
    ///
    /// The body is read to completion and handed back inside the returned
    /// request, so the handler sees exactly what the client sent.
    pub async fn derive(&self, request: Request) -> Result<(Fingerprint, Request)> {
        let (parts, body) = request.into_parts();

        let mut scratch = self.scratch.acquire();
        let read = read_body(body, &mut scratch, self.max_body_bytes).await;
        let bytes: Bytes = scratch.split().freeze();
        self.scratch.release(scratch);
        read?;

        let fingerprint = Fingerprint::of(&canonical_key(&parts, &bytes));
        Ok((fingerprint, Request::from_parts(parts, Body::from(bytes))))
    }

    /// Returns statistics of the body scratch pool.
    pub fn scratch_stats(&self) -> PoolStats {
        self.scratch.stats()
    }
}

async fn read_body(body: Body, buf: &mut BytesMut, limit: usize) -> Result<()> {
    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(CoalesceError::Fingerprint)?;
        if buf.len() + chunk.len() > limit {
            return Err(CoalesceError::BodyTooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(())
}
