//! Layered wire codec: gzip compression followed by optional HMAC-SHA256 signing.
//!
//! The layer order is fixed when the [`CodecStack`] is built. Encoding applies
//! the layers front to back; decoding walks them back to front, so a signature
//! is always checked against the compressed bytes before anything is inflated.
//! The signature never becomes part of the body; callers carry it in the
//! [`HASH_HEADER`] header (or RPC metadata).

use core::error::Error;
use std::fmt;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;

use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::Hmac;
use hmac::Mac;
use sha2::Sha256;

/// Header carrying the hex encoded HMAC-SHA256 of the transmitted body.
pub const HASH_HEADER: &str = "HashSHA256";

type HmacSha256 = Hmac<Sha256>;

pub type CodecResult<T> = Result<T, Report<CodecError>>;

#[derive(Debug, Display)]
pub enum CodecError {
    #[display("gzip compression failed")]
    Compression,
    #[display("gzip decompression failed")]
    Decompression,
    #[display("payload signature is missing")]
    MissingSignature,
    #[display("payload signature does not match")]
    SignatureMismatch,
    #[display("signing key rejected")]
    InvalidKey,
}

impl Error for CodecError {}

#[derive(Clone)]
enum Layer {
    Gzip,
    HmacSha256(Arc<[u8]>),
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Gzip => f.write_str("Gzip"),
            Layer::HmacSha256(_) => f.write_str("HmacSha256(<redacted>)"),
        }
    }
}

/// Output of [`CodecStack::encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    pub body: Vec<u8>,
    /// Hex HMAC of `body`, present when a signing layer is configured.
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CodecStack {
    layers: Vec<Layer>,
}

impl CodecStack {
    /// An empty stack; encoding is the identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stack used by agent and server: gzip, then signing when `key` is
    /// a non-empty secret.
    pub fn for_key(key: Option<&str>) -> Self {
        let stack = Self::new().with_gzip();
        match key {
            Some(key) if !key.is_empty() => stack.with_signing(key.as_bytes()),
            _ => stack,
        }
    }

    pub fn with_gzip(mut self) -> Self {
        self.layers.push(Layer::Gzip);
        self
    }

    pub fn with_signing(mut self, key: &[u8]) -> Self {
        self.layers.push(Layer::HmacSha256(Arc::from(key)));
        self
    }

    pub fn is_signing(&self) -> bool {
        self.signing_key().is_some()
    }

    pub fn is_compressing(&self) -> bool {
        self.layers.iter().any(|layer| matches!(layer, Layer::Gzip))
    }

    fn signing_key(&self) -> Option<&[u8]> {
        self.layers.iter().find_map(|layer| match layer {
            Layer::HmacSha256(key) => Some(key.as_ref()),
            Layer::Gzip => None,
        })
    }

    /// Run `payload` through every layer in order.
    pub fn encode(&self, payload: &[u8]) -> CodecResult<Encoded> {
        let mut encoded = Encoded {
            body: payload.to_vec(),
            signature: None,
        };
        for layer in &self.layers {
            match layer {
                Layer::Gzip => encoded.body = gzip(&encoded.body)?,
                Layer::HmacSha256(key) => {
                    encoded.signature = Some(sign_with(key, &encoded.body)?);
                }
            }
        }
        Ok(encoded)
    }

    /// Undo [`encode`](Self::encode).
    ///
    /// `compressed` tells whether the sender actually applied gzip (for HTTP
    /// this is the `Content-Encoding` header); when false the gzip layer is
    /// skipped but a configured signature is still enforced.
    ///
    /// # Errors
    ///
    /// - [`CodecError::MissingSignature`] if a key is configured and no signature was sent
    /// - [`CodecError::SignatureMismatch`] if the signature does not verify
    /// - [`CodecError::Decompression`] if the body is not valid gzip
    pub fn decode(
        &self,
        body: &[u8],
        signature: Option<&str>,
        compressed: bool,
    ) -> CodecResult<Vec<u8>> {
        let mut decoded = body.to_vec();
        for layer in self.layers.iter().rev() {
            match layer {
                Layer::HmacSha256(key) => {
                    let signature = signature
                        .ok_or_else(|| Report::new(CodecError::MissingSignature))?;
                    verify_with(key, &decoded, signature)?;
                }
                Layer::Gzip if compressed => decoded = gunzip(&decoded)?,
                Layer::Gzip => {}
            }
        }
        Ok(decoded)
    }

    /// Sign arbitrary bytes with the configured key, used for response headers.
    pub fn sign(&self, bytes: &[u8]) -> Option<String> {
        self.signing_key().and_then(|key| sign_with(key, bytes).ok())
    }
}

fn mac(key: &[u8]) -> CodecResult<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| {
        Report::new(CodecError::InvalidKey).attach_printable(format!("hmac key: {e}"))
    })
}

fn sign_with(key: &[u8], bytes: &[u8]) -> CodecResult<String> {
    let mut mac = mac(key)?;
    mac.update(bytes);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn verify_with(key: &[u8], bytes: &[u8], signature: &str) -> CodecResult<()> {
    let expected = hex::decode(signature.trim()).map_err(|e| {
        Report::new(CodecError::SignatureMismatch)
            .attach_printable(format!("signature is not valid hex: {e}"))
    })?;
    let mut mac = mac(key)?;
    mac.update(bytes);
    mac.verify_slice(&expected)
        .map_err(|_| Report::new(CodecError::SignatureMismatch))
}

pub fn gzip(bytes: &[u8]) -> CodecResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .change_context(CodecError::Compression)?;
    encoder.finish().change_context(CodecError::Compression)
}

pub fn gunzip(bytes: &[u8]) -> CodecResult<Vec<u8>> {
    let mut decoded = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut decoded)
        .change_context(CodecError::Decompression)?;
    Ok(decoded)
}
