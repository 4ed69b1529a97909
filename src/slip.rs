//! SLIP framing of command and response packets
//!
//! See <https://docs.espressif.com/projects/esptool/en/latest/esp32/advanced-topics/serial-protocol.html#low-level-protocol>

use std::io::{self, Read, Write};

/// SLIP end of packet token
const END: u8 = 0xC0;

/// SLIP escape token
const ESC: u8 = 0xDB;

/// SLIP escaped 0xC0 token
const ESC_END: u8 = 0xDC;

/// SLIP escaped 0xDB token
const ESC_ESC: u8 = 0xDD;

/// Encode a single payload as a delimited, escaped SLIP frame
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    let mut encoder = SlipEncoder::new(&mut frame).expect("writing to a Vec cannot fail");
    encoder
        .write_all(payload)
        .expect("writing to a Vec cannot fail");
    encoder.finish().expect("writing to a Vec cannot fail");

    frame
}

/// Decode the next SLIP frame from `source`
pub fn decode<R: Read>(source: &mut R) -> Result<Vec<u8>, SlipError> {
    SlipDecoder::new().decode(source)
}

/// SLIP decoder error type
#[derive(Debug, thiserror::Error)]
pub enum SlipError {
    #[error("Invalid escape sequence 0xDB {0:#04x}")]
    FramingError(u8),
    #[error("Stream ended in the middle of a frame")]
    Truncated,
    #[error("Stream ended before a frame was received")]
    EndOfStream,
    #[error(transparent)]
    ReadError(#[from] io::Error),
}

/// Streaming SLIP encoder, writing the escaped form of everything written to
/// it into the inner writer
pub struct SlipEncoder<'a, W: Write> {
    writer: &'a mut W,
    len: usize,
}

impl<'a, W: Write> SlipEncoder<'a, W> {
    /// Creates a new encoder context, emitting the leading delimiter
    pub fn new(writer: &'a mut W) -> io::Result<Self> {
        writer.write_all(&[END])?;
        Ok(Self { writer, len: 1 })
    }

    /// Emit the trailing delimiter, returning the total frame length
    pub fn finish(self) -> io::Result<usize> {
        self.writer.write_all(&[END])?;
        Ok(self.len + 1)
    }
}

impl<W: Write> Write for SlipEncoder<'_, W> {
    /// Writes the given buffer replacing the END and ESC bytes
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for value in buf.iter() {
            match *value {
                END => {
                    self.writer.write_all(&[ESC, ESC_END])?;
                    self.len += 2;
                }
                ESC => {
                    self.writer.write_all(&[ESC, ESC_ESC])?;
                    self.len += 2;
                }
                _ => {
                    self.writer.write_all(&[*value])?;
                    self.len += 1;
                }
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the delimiter opening a frame
    Idle,
    Normal,
    /// Inside a frame whose opening delimiter closed an empty frame
    Reopened,
    Escape,
}

/// SLIP decoder context
#[derive(Debug)]
pub struct SlipDecoder {
    state: State,
    frame: Vec<u8>,
}

impl SlipDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            frame: Vec::new(),
        }
    }

    /// Attempts to decode a single SLIP frame from the given source.
    ///
    /// Bytes preceding the opening delimiter (boot messages, line noise) are
    /// discarded. Two back-to-back delimiters decode as an empty frame; the
    /// second of them may also open the next frame, so the following call
    /// starts inside a frame. The source is read one byte at a time, so
    /// nothing past the closing delimiter is consumed.
    pub fn decode<R: Read>(&mut self, source: &mut R) -> Result<Vec<u8>, SlipError> {
        if self.state != State::Reopened {
            self.state = State::Idle;
        }
        self.frame.clear();

        let result = self.decode_frame(source);
        if result.is_err() {
            self.state = State::Idle;
            self.frame.clear();
        }

        result
    }

    fn decode_frame<R: Read>(&mut self, source: &mut R) -> Result<Vec<u8>, SlipError> {
        let mut byte = [0u8; 1];
        loop {
            if source.read(&mut byte)? == 0 {
                return Err(match self.state {
                    State::Idle => SlipError::EndOfStream,
                    _ => SlipError::Truncated,
                });
            }
            let value = byte[0];

            match self.state {
                State::Idle => {
                    if value == END {
                        self.state = State::Normal;
                    }
                }
                State::Normal | State::Reopened => match value {
                    END if self.frame.is_empty() && self.state == State::Normal => {
                        self.state = State::Reopened;
                        return Ok(Vec::new());
                    }
                    // A delimiter right after an empty frame opens this one
                    END if self.frame.is_empty() => self.state = State::Normal,
                    END => {
                        self.state = State::Idle;
                        return Ok(std::mem::take(&mut self.frame));
                    }
                    ESC => self.state = State::Escape,
                    _ => {
                        self.frame.push(value);
                        self.state = State::Normal;
                    }
                },
                State::Escape => {
                    match value {
                        ESC_END => self.frame.push(END),
                        ESC_ESC => self.frame.push(ESC),
                        other => return Err(SlipError::FramingError(other)),
                    }
                    self.state = State::Normal;
                }
            }
        }
    }
}

impl Default for SlipDecoder {
    fn default() -> Self {
        Self::new()
    }
}
