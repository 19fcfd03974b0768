//! Decoding of REST response envelopes.
//!
//! The backend is not consistent about wrapping: some endpoints return the
//! payload bare, others wrap it as `{"data": ...}` or `{"result": ...}`.
//! Every response goes through [`decode`], which tries the known shapes in
//! order and fails with a typed error when none fits.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("response matched no known envelope shape: {reason}")]
pub struct DecodeError {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Envelope<T> {
    Data { data: T },
    Result { result: T },
    Bare(T),
}

impl<T> Envelope<T> {
    fn into_inner(self) -> T {
        match self {
            Envelope::Data { data } => data,
            Envelope::Result { result } => result,
            Envelope::Bare(inner) => inner,
        }
    }
}

/// Decode `body` as a `T`, accepting any known envelope around it.
pub fn decode<T: DeserializeOwned>(body: &str) -> Result<T, DecodeError> {
    serde_json::from_str::<Envelope<T>>(body)
        .map(Envelope::into_inner)
        .map_err(|e| DecodeError {
            reason: e.to_string(),
        })
}
