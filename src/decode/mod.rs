//! Response body reassembly.
//!
//! A JSON payload may arrive split over any number of chunks, and a chunk
//! boundary may fall inside a multi-byte character. Only the fully
//! concatenated text is a valid document, so [`decode_full`] drains the whole
//! stream before anything is parsed.

use bytes::{Buf, Bytes, BytesMut};
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use crate::error::TransportError;

/// Incremental UTF-8 decoder that carries incomplete sequences across chunks.
///
/// Invalid byte sequences are replaced with U+FFFD rather than failing, and a
/// sequence still incomplete at [`finish`](Self::finish) becomes one U+FFFD.
///
/// # Examples
///
/// ```
/// use slotfetch::decode::Utf8StreamDecoder;
///
/// let bytes = "é".as_bytes();
/// let mut decoder = Utf8StreamDecoder::new();
/// let mut text = String::new();
/// decoder.push(&bytes[..1], &mut text);
/// assert_eq!(text, "");
/// decoder.push(&bytes[1..], &mut text);
/// decoder.finish(&mut text);
/// assert_eq!(text, "é");
/// ```
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    // Never longer than three bytes between calls.
    pending: BytesMut,
}

impl Utf8StreamDecoder {
    /// Creates a decoder with no buffered bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `chunk`, appending every complete character to `out`.
    pub fn push(&mut self, chunk: &[u8], out: &mut String) {
        self.pending.extend_from_slice(chunk);

        let mut consumed = 0;
        loop {
            let input = &self.pending[consumed..];
            match std::str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    consumed = self.pending.len();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&input[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            consumed += valid + len;
                        }
                        None => {
                            consumed += valid;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.advance(consumed);
    }

    /// Flushes the decoder at end of stream.
    pub fn finish(self, out: &mut String) {
        if !self.pending.is_empty() {
            out.push(char::REPLACEMENT_CHARACTER);
        }
    }
}

/// Drains `body` and returns its full text in arrival order.
///
/// # Errors
///
/// - [`TransportError::NoBody`]: the response carried no body stream.
/// - [`TransportError::Body`] (or whatever the stream yields): a chunk read failed.
pub async fn decode_full<S>(url: &str, body: Option<S>) -> Result<String, TransportError>
where
    S: Stream<Item = Result<Bytes, TransportError>> + Unpin,
{
    let Some(mut body) = body else {
        return Err(TransportError::NoBody {
            url: url.to_owned(),
        });
    };

    let mut decoder = Utf8StreamDecoder::new();
    let mut text = String::new();
    let mut chunks = 0usize;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        chunks += 1;
        decoder.push(&chunk, &mut text);
    }
    decoder.finish(&mut text);

    debug!(url, chunks, bytes = text.len(), "response body decoded");
    Ok(text)
}
