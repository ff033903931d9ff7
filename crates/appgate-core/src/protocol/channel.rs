//! Scalar framing and null-delimited array codec.
//!
//! Wire format:
//! ```text
//! [payload_len:4][payload:N]
//! ```
//! The length prefix is big-endian. A *scalar* is one such frame. An *array*
//! is a scalar whose payload is a sequence of null-terminated strings:
//! `field\0field\0...`. Request headers travel as an array of alternating
//! name/value fields (`REQUEST_METHOD\0PING\0`); console status replies are
//! short arrays such as `["ok"]` or `["end", base64blob]`.
//!
//! The pure `encode_*`/`decode_*` functions operate on byte buffers and are
//! shared by the server and by test clients; the `read_*`/`write_*` functions
//! layer the same codec over tokio streams.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use thiserror::Error;

/// Upper bound applied to incoming scalar lengths unless the caller supplies
/// its own. Matches the default request header ceiling.
pub const DEFAULT_MAX_SCALAR_SIZE: usize = 128 * 1024;

/// Errors that can occur while framing or unframing scalars.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the stream in the middle of a length prefix or payload.
    #[error("stream closed mid-scalar")]
    Truncated,

    /// The declared payload length exceeds the permitted maximum.
    #[error("scalar of {len} bytes exceeds the {max} byte limit")]
    ScalarTooLarge { len: usize, max: usize },

    /// A null-delimited array decoded to an odd number of fields where
    /// name/value pairs were expected.
    #[error("header array has an odd number of fields ({fields})")]
    OddFieldCount { fields: usize },

    /// An array field contained invalid UTF-8.
    #[error("array field is not valid UTF-8")]
    NonUtf8Field(#[from] std::str::Utf8Error),

    /// An underlying I/O failure.
    #[error("i/o error")]
    Io(#[from] std::io::Error),
}

// ── Pure codec ────────────────────────────────────────────────────────────────

/// Encodes `payload` as one scalar: 4-byte big-endian length prefix + bytes.
///
/// # Examples
///
/// ```rust
/// use appgate_core::protocol::encode_scalar;
///
/// let frame = encode_scalar(b"pong");
/// assert_eq!(&frame[..4], &4u32.to_be_bytes());
/// assert_eq!(&frame[4..], b"pong");
/// ```
pub fn encode_scalar(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Encodes `items` as a null-delimited array payload (unframed).
pub fn encode_array<S: AsRef<str>>(items: &[S]) -> Vec<u8> {
    let mut buf = Vec::new();
    for item in items {
        buf.extend_from_slice(item.as_ref().as_bytes());
        buf.push(0);
    }
    buf
}

/// Encodes alternating name/value pairs as an array payload (unframed).
pub fn encode_pairs<'a, I>(pairs: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut buf = Vec::new();
    for (name, value) in pairs {
        buf.extend_from_slice(name.as_bytes());
        buf.push(0);
        buf.extend_from_slice(value.as_bytes());
        buf.push(0);
    }
    buf
}

/// Decodes a null-delimited array payload into its fields.
///
/// Fields are null-terminated, so a trailing null is consumed rather than
/// producing an empty final field. An unterminated final field is accepted.
///
/// # Errors
///
/// Returns [`ProtocolError::NonUtf8Field`] if any field is not valid UTF-8.
pub fn decode_array(payload: &[u8]) -> Result<Vec<String>, ProtocolError> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    let mut fields = Vec::new();
    for raw in payload.split(|&b| b == 0) {
        fields.push(std::str::from_utf8(raw)?.to_string());
    }
    // `split` yields one empty segment after a trailing terminator.
    if payload.ends_with(&[0]) {
        fields.pop();
    }
    Ok(fields)
}

/// Decodes an array payload into `(name, value)` pairs, preserving wire order.
///
/// # Errors
///
/// Returns [`ProtocolError::OddFieldCount`] if the array does not decompose
/// into pairs, or [`ProtocolError::NonUtf8Field`] for invalid UTF-8.
pub fn decode_pairs(payload: &[u8]) -> Result<Vec<(String, String)>, ProtocolError> {
    let fields = decode_array(payload)?;
    if fields.len() % 2 != 0 {
        return Err(ProtocolError::OddFieldCount {
            fields: fields.len(),
        });
    }
    let mut pairs = Vec::with_capacity(fields.len() / 2);
    let mut iter = fields.into_iter();
    while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
        pairs.push((name, value));
    }
    Ok(pairs)
}

// ── Stream I/O ────────────────────────────────────────────────────────────────

/// Writes one scalar (prefix + payload) to `stream`.
///
/// # Errors
///
/// Returns [`ProtocolError::Io`] if the write fails.
pub async fn write_scalar<W>(stream: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    // One buffer, one write: avoids a short frame header reaching the peer
    // ahead of a payload that then fails to send.
    stream.write_all(&encode_scalar(payload)).await?;
    stream.flush().await?;
    Ok(())
}

/// Writes `items` as a framed array to `stream`.
///
/// # Errors
///
/// Returns [`ProtocolError::Io`] if the write fails.
pub async fn write_array<W, S>(stream: &mut W, items: &[S]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    write_scalar(stream, &encode_array(items)).await
}

/// Reads one scalar from `stream`, bounded by `max_len`.
///
/// Returns `Ok(None)` on a clean end-of-stream (no prefix bytes read at all);
/// this is how a peer signals it is done submitting scalars.
///
/// # Errors
///
/// - [`ProtocolError::Truncated`] if the stream ends inside the prefix or
///   payload.
/// - [`ProtocolError::ScalarTooLarge`] if the declared length exceeds
///   `max_len`. Nothing beyond the prefix has been consumed at that point;
///   callers are expected to drop the connection.
pub async fn read_scalar<R>(
    stream: &mut R,
    max_len: usize,
) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = stream.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max_len {
        return Err(ProtocolError::ScalarTooLarge { len, max: max_len });
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        }
    })?;
    Ok(Some(payload))
}

/// Reads one framed array from `stream`, bounded by `max_len`.
///
/// Returns `Ok(None)` on clean end-of-stream.
///
/// # Errors
///
/// Propagates [`read_scalar`] errors plus array decode errors.
pub async fn read_array<R>(
    stream: &mut R,
    max_len: usize,
) -> Result<Option<Vec<String>>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match read_scalar(stream, max_len).await? {
        Some(payload) => Ok(Some(decode_array(&payload)?)),
        None => Ok(None),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
