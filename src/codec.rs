//! Gateway frame codec: JSON payload encode/decode plus the optional
//! streaming zlib transport decompressor.

use flate2::{Decompress, FlushDecompress, Status};
use thiserror::Error;

use crate::model::GatewayPayload;

/// Marker the platform appends to every complete compressed unit.
pub const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Payload encoding negotiated on the gateway URL. The platform also offers
/// a binary term format; this archiver always negotiates JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
}

impl Encoding {
    pub fn query_value(self) -> &'static str {
        match self {
            Encoding::Json => "json",
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("inflate failed: {0}")]
    Inflate(#[from] flate2::DecompressError),
}

pub fn decode_payload(bytes: &[u8]) -> Result<GatewayPayload, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_payload(payload: &GatewayPayload) -> Result<String, CodecError> {
    Ok(serde_json::to_string(payload)?)
}

/// Streaming inflater for the zlib-stream transport option.
///
/// The platform splits one compressed stream across many transport frames and
/// terminates each logical unit with a 4-byte sync-flush marker. Frames are
/// buffered until the marker arrives, then inflated against the persistent
/// dictionary window.
pub struct Inflater {
    decompress: Decompress,
    pending: Vec<u8>,
}

impl Default for Inflater {
    fn default() -> Self {
        Self::new()
    }
}

impl Inflater {
    pub fn new() -> Self {
        Inflater {
            decompress: Decompress::new(true),
            pending: Vec::new(),
        }
    }

    /// Feed one transport frame. Returns the inflated payload once the frame
    /// completes a flush unit, `None` while more fragments are expected.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        self.pending.extend_from_slice(chunk);
        if self.pending.len() < ZLIB_SUFFIX.len() || !self.pending.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(self.pending.len().saturating_mul(4));
        let mut buf = [0u8; 16 * 1024];
        let mut offset = 0usize;

        while offset < self.pending.len() {
            let in_before = self.decompress.total_in();
            let out_before = self.decompress.total_out();
            let status = self.decompress.decompress(
                &self.pending[offset..],
                &mut buf,
                FlushDecompress::Sync,
            )?;
            let consumed = (self.decompress.total_in() - in_before) as usize;
            let produced = (self.decompress.total_out() - out_before) as usize;
            offset += consumed;
            out.extend_from_slice(&buf[..produced]);

            match status {
                Status::StreamEnd => break,
                // BufError with no progress means the input is exhausted up
                // to the flush point.
                Status::BufError if consumed == 0 && produced == 0 => break,
                Status::Ok | Status::BufError => {}
            }
        }

        self.pending.clear();
        Ok(Some(out))
    }
}
