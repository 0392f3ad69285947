use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Default maximum frame body size: 4 MiB.
pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Initial read buffer capacity for the control channel.
pub const CHANNEL_READ_BUFFER: usize = 262_144;

/// Initial read buffer capacity for the payload channel (header + payload fragment).
pub const PAYLOAD_CHANNEL_READ_BUFFER: usize = 266_000;

/// Default bound on bytes waiting in a writer queue: 64 MiB.
pub const DEFAULT_MAX_WRITE_QUEUE: usize = 64 * 1024 * 1024;

/// Number of decimal digits needed to write `n`.
pub fn length_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Wire size of a netstring whose body is `body_len` bytes.
///
/// Saturates at `usize::MAX` for lengths no buffer could hold.
pub fn encoded_len(body_len: usize) -> usize {
    body_len.saturating_add(length_digits(body_len) + 2)
}

/// Encode one netstring into `dst`.
///
/// Wire format:
/// ```text
/// ┌──────────────────┬─────┬────────────────────┬─────┐
/// │ Length (ASCII    │ ':' │ Body               │ ',' │
/// │ decimal, no      │     │ (Length bytes)     │     │
/// │ leading zeros)   │     │                    │     │
/// └──────────────────┴─────┴────────────────────┴─────┘
/// ```
pub fn encode_netstring(body: &[u8], max_len: usize, dst: &mut BytesMut) -> Result<()> {
    encode_netstring_parts(&[body], max_len, dst)
}

/// Encode one netstring whose body is the concatenation of `parts`.
pub fn encode_netstring_parts(parts: &[&[u8]], max_len: usize, dst: &mut BytesMut) -> Result<()> {
    let body_len: usize = parts.iter().map(|part| part.len()).sum();
    if body_len > max_len {
        return Err(FrameError::FrameTooLarge {
            size: body_len,
            max: max_len,
        });
    }

    dst.reserve(encoded_len(body_len));
    dst.put_slice(body_len.to_string().as_bytes());
    dst.put_u8(b':');
    for part in parts {
        dst.put_slice(part);
    }
    dst.put_u8(b',');
    Ok(())
}

/// Encode one netstring into its own contiguous buffer.
pub fn encode_to_bytes(body: &[u8], max_len: usize) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(encoded_len(body.len()));
    encode_netstring(body, max_len, &mut dst)?;
    Ok(dst.freeze())
}

/// Result of scanning a buffer for the next netstring.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// A complete frame; `consumed` covers prefix, body and terminator.
    Frame { body: &'a [u8], consumed: usize },
    /// More bytes are needed. `frame_len` is the full wire size of the
    /// pending frame once its length prefix has been read.
    Incomplete { frame_len: Option<usize> },
}

/// Decode the netstring at the start of `src`.
///
/// Does not consume anything; the caller advances by `consumed`. A length
/// above `max_len` is rejected as soon as the prefix digits show it, before
/// the colon or body arrive.
pub fn decode_netstring(src: &[u8], max_len: usize) -> Result<Decoded<'_>> {
    let mut len = 0usize;
    let mut idx = 0usize;

    loop {
        let Some(&byte) = src.get(idx) else {
            return Ok(Decoded::Incomplete { frame_len: None });
        };

        match byte {
            b':' if idx == 0 => return Err(FrameError::InvalidLength("empty length")),
            b':' => break,
            b'0'..=b'9' => {
                if idx == 1 && src[0] == b'0' {
                    return Err(FrameError::InvalidLength("leading zero"));
                }
                len = len
                    .checked_mul(10)
                    .and_then(|n| n.checked_add(usize::from(byte - b'0')))
                    .ok_or(FrameError::FrameTooLarge {
                        size: usize::MAX,
                        max: max_len,
                    })?;
                if len > max_len {
                    return Err(FrameError::FrameTooLarge {
                        size: len,
                        max: max_len,
                    });
                }
                idx += 1;
            }
            _ => return Err(FrameError::InvalidLength("non-digit in length")),
        }
    }

    let body_start = idx + 1;
    let total = body_start
        .checked_add(len)
        .and_then(|n| n.checked_add(1))
        .ok_or(FrameError::FrameTooLarge {
            size: len,
            max: max_len,
        })?;
    if src.len() < total {
        return Ok(Decoded::Incomplete {
            frame_len: Some(total),
        });
    }

    let found = src[total - 1];
    if found != b',' {
        return Err(FrameError::MissingTerminator { found });
    }

    Ok(Decoded::Frame {
        body: &src[body_start..body_start + len],
        consumed: total,
    })
}

/// Configuration for framed streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    /// Maximum frame body size in bytes. Default: 4 MiB.
    pub max_frame_len: usize,
    /// Initial read buffer capacity in bytes.
    pub read_buffer_capacity: usize,
    /// Maximum bytes held in the writer queue before the writer gives up.
    pub max_write_queue: usize,
}

impl FrameConfig {
    /// Defaults for the JSON control channel.
    pub fn channel() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            read_buffer_capacity: CHANNEL_READ_BUFFER,
            max_write_queue: DEFAULT_MAX_WRITE_QUEUE,
        }
    }

    /// Defaults for the payload channel.
    pub fn payload_channel() -> Self {
        Self {
            read_buffer_capacity: PAYLOAD_CHANNEL_READ_BUFFER,
            ..Self::channel()
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self::channel()
    }
}
