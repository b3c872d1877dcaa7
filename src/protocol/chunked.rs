//! Incremental `Transfer-Encoding: chunked` decoder.
//!
//! Works byte-by-byte over whatever the socket delivered, so chunk
//! boundaries may fall anywhere in the input. Output per call is bounded
//! by the caller's limit; unconsumed input stays in the buffer.

use bytes::{Buf, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkedError {
    #[error("invalid chunk size")]
    InvalidSize,
    #[error("chunk size too large")]
    SizeOverflow,
    #[error("missing CRLF after chunk data")]
    MissingCrlf,
    #[error("invalid line ending in chunked body")]
    InvalidLineEnding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    Ext,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    TrailerLine,
    FinalLf,
    Done,
}

/// Decoder progress after one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    More,
    Done,
}

#[derive(Debug, Clone)]
pub struct ChunkedDecoder {
    state: State,
    size: u64,
    digits: usize,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            size: 0,
            digits: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Decode from `input` into `out`, appending at most `limit` bytes.
    pub fn decode(
        &mut self,
        input: &mut BytesMut,
        out: &mut BytesMut,
        limit: usize,
    ) -> Result<Decoded, ChunkedError> {
        let mut written = 0usize;

        while !input.is_empty() && self.state != State::Done {
            if self.state == State::Data {
                let room = limit - written;
                if room == 0 {
                    break;
                }
                let n = (self.size.min(input.len() as u64) as usize).min(room);
                out.extend_from_slice(&input[..n]);
                input.advance(n);
                written += n;
                self.size -= n as u64;
                if self.size == 0 {
                    self.state = State::DataCr;
                }
                continue;
            }

            let byte = input[0];
            input.advance(1);
            self.step(byte)?;
        }

        Ok(if self.state == State::Done {
            Decoded::Done
        } else {
            Decoded::More
        })
    }

    fn step(&mut self, byte: u8) -> Result<(), ChunkedError> {
        self.state = match self.state {
            State::Size => match byte {
                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                    if self.digits == 16 {
                        return Err(ChunkedError::SizeOverflow);
                    }
                    self.size = self.size * 16 + u64::from(hex_value(byte));
                    self.digits += 1;
                    State::Size
                }
                b';' | b' ' | b'\t' if self.digits > 0 => State::Ext,
                b'\r' if self.digits > 0 => State::SizeLf,
                b'\n' if self.digits > 0 => self.end_of_size_line(),
                _ => return Err(ChunkedError::InvalidSize),
            },
            State::Ext => match byte {
                b'\r' => State::SizeLf,
                b'\n' => self.end_of_size_line(),
                _ => State::Ext,
            },
            State::SizeLf => match byte {
                b'\n' => self.end_of_size_line(),
                _ => return Err(ChunkedError::InvalidLineEnding),
            },
            State::DataCr => match byte {
                b'\r' => State::DataLf,
                b'\n' => self.next_chunk(),
                _ => return Err(ChunkedError::MissingCrlf),
            },
            State::DataLf => match byte {
                b'\n' => self.next_chunk(),
                _ => return Err(ChunkedError::MissingCrlf),
            },
            State::TrailerStart => match byte {
                b'\r' => State::FinalLf,
                b'\n' => State::Done,
                _ => State::TrailerLine,
            },
            State::TrailerLine => match byte {
                b'\n' => State::TrailerStart,
                _ => State::TrailerLine,
            },
            State::FinalLf => match byte {
                b'\n' => State::Done,
                _ => return Err(ChunkedError::InvalidLineEnding),
            },
            State::Data | State::Done => self.state,
        };
        Ok(())
    }

    fn end_of_size_line(&mut self) -> State {
        if self.size == 0 {
            State::TrailerStart
        } else {
            State::Data
        }
    }

    fn next_chunk(&mut self) -> State {
        self.size = 0;
        self.digits = 0;
        State::Size
    }
}

fn hex_value(byte: u8) -> u8 {
    match byte {
        b'0'..=b'9' => byte - b'0',
        b'a'..=b'f' => byte - b'a' + 10,
        _ => byte - b'A' + 10,
    }
}
