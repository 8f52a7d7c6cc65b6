#![forbid(unsafe_code)]
//! Streaming protocol reader.
//!
//! Commands are lines of whitespace-separated strings with three spellings:
//! bare atoms, double-quoted strings, and `{N}` literals whose raw bytes
//! follow after the server acknowledges with a continuation response. The
//! parser owns a push-back buffer so handlers can undo one token of
//! look-ahead.

use std::io::{Read, Write};

use thiserror::Error;

const READ_CHUNK: usize = 8 * 1024;
const MAX_LITERAL_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The stream ended in the middle of a command or literal.
    #[error("Unable to read more data")]
    UnexpectedEof,
    #[error("{0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListItem {
    Atom(Vec<u8>),
    List(Vec<ListItem>),
}

impl ListItem {
    pub fn as_atom(&self) -> Option<&[u8]> {
        match self {
            Self::Atom(bytes) => Some(bytes),
            Self::List(_) => None,
        }
    }
}

pub struct StreamParser<R: Read, C: Write> {
    reader: R,
    continuation: C,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read, C: Write> StreamParser<R, C> {
    /// `continuation` is the egress side used for `+ Ready for literal
    /// data` responses; it must reach the peer before the literal bytes are
    /// awaited.
    pub fn new(reader: R, continuation: C) -> Self {
        Self {
            reader,
            continuation,
            buf: Vec::new(),
            pos: 0,
            eof: false,
        }
    }

    fn fill(&mut self) -> Result<bool, ProtocolError> {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        if self.eof {
            return Ok(self.pos < self.buf.len());
        }
        let mut chunk = [0u8; READ_CHUNK];
        let read = self.reader.read(&mut chunk)?;
        if read == 0 {
            self.eof = true;
        } else {
            self.buf.extend_from_slice(&chunk[..read]);
        }
        Ok(self.pos < self.buf.len())
    }

    fn peek_byte(&mut self) -> Result<Option<u8>, ProtocolError> {
        if self.pos < self.buf.len() || self.fill()? {
            Ok(Some(self.buf[self.pos]))
        } else {
            Ok(None)
        }
    }

    fn next_byte(&mut self) -> Result<Option<u8>, ProtocolError> {
        let byte = self.peek_byte()?;
        if byte.is_some() {
            self.pos += 1;
        }
        Ok(byte)
    }

    fn skip_spaces(&mut self) -> Result<(), ProtocolError> {
        while let Some(byte) = self.peek_byte()? {
            if byte == b' ' || byte == b'\t' {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(())
    }

    /// True once the underlying stream is exhausted and the buffer drained.
    pub fn at_stream_end(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.peek_byte()?.is_none())
    }

    /// True when the next non-space byte ends the command (or the stream).
    pub fn at_command_end(&mut self) -> Result<bool, ProtocolError> {
        self.skip_spaces()?;
        Ok(matches!(self.peek_byte()?, None | Some(b'\r') | Some(b'\n')))
    }

    /// Eats one CRLF or LF, if present.
    pub fn consume_command_end(&mut self) -> Result<(), ProtocolError> {
        if self.peek_byte()? == Some(b'\r') {
            self.pos += 1;
        }
        if self.peek_byte()? == Some(b'\n') {
            self.pos += 1;
        }
        Ok(())
    }

    /// Discards everything up to and including the next line feed. Literal
    /// bytes are always consumed synchronously, so the line end is the
    /// command end.
    pub fn skip_current_command(&mut self) -> Result<(), ProtocolError> {
        while let Some(byte) = self.next_byte()? {
            if byte == b'\n' {
                break;
            }
        }
        Ok(())
    }

    /// Pushes bytes back in front of the unread input.
    pub fn insert_data(&mut self, data: &[u8]) {
        let tail = self.buf.split_off(self.pos);
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(&tail);
    }

    /// Next string: atom, quoted string, or literal. `NIL` reads as empty.
    pub fn read_string(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.skip_spaces()?;
        match self.peek_byte()? {
            None => Err(ProtocolError::UnexpectedEof),
            Some(b'"') => self.read_quoted(),
            Some(b'{') => self.read_literal(),
            Some(_) => {
                let atom = self.read_atom()?;
                if atom == b"NIL" {
                    Ok(Vec::new())
                } else {
                    Ok(atom)
                }
            }
        }
    }

    fn read_atom(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut atom = Vec::new();
        while let Some(byte) = self.peek_byte()? {
            match byte {
                b' ' | b'\t' | b'\r' | b'\n' | b'(' | b')' | b'"' | b'{' => break,
                _ => {
                    atom.push(byte);
                    self.pos += 1;
                }
            }
        }
        Ok(atom)
    }

    fn read_quoted(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.pos += 1; // opening quote
        let mut value = Vec::new();
        loop {
            match self.next_byte()? {
                None => return Err(ProtocolError::UnexpectedEof),
                Some(b'"') => return Ok(value),
                Some(b'\\') => match self.next_byte()? {
                    None => return Err(ProtocolError::UnexpectedEof),
                    Some(escaped) => value.push(escaped),
                },
                Some(byte) => value.push(byte),
            }
        }
    }

    fn read_literal(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.pos += 1; // opening brace
        let mut digits = Vec::new();
        loop {
            match self.next_byte()? {
                None => return Err(ProtocolError::UnexpectedEof),
                Some(b'}') => break,
                Some(byte) if byte.is_ascii_digit() => digits.push(byte),
                Some(byte) => {
                    return Err(ProtocolError::Malformed(format!(
                        "unexpected byte 0x{byte:02x} in literal size"
                    )))
                }
            }
        }
        let size: usize = String::from_utf8_lossy(&digits)
            .parse()
            .map_err(|_| ProtocolError::Malformed("invalid literal size".into()))?;
        if size > MAX_LITERAL_SIZE {
            return Err(ProtocolError::Malformed(format!(
                "literal of {size} bytes exceeds the maximum allowed size"
            )));
        }

        // The literal body starts on the next line.
        self.consume_command_end()?;
        write!(
            self.continuation,
            "+ Ready for literal data (expecting {size} bytes)\r\n"
        )?;
        self.continuation.flush()?;

        let mut data = Vec::with_capacity(size);
        while data.len() < size {
            if self.pos == self.buf.len() && !self.fill()? {
                return Err(ProtocolError::UnexpectedEof);
            }
            let available = (self.buf.len() - self.pos).min(size - data.len());
            data.extend_from_slice(&self.buf[self.pos..self.pos + available]);
            self.pos += available;
        }
        Ok(data)
    }

    pub fn read_number(&mut self) -> Result<i64, ProtocolError> {
        let token = self.read_string()?;
        String::from_utf8_lossy(&token)
            .parse()
            .map_err(|_| {
                ProtocolError::Malformed(format!(
                    "expected a number, got '{}'",
                    String::from_utf8_lossy(&token)
                ))
            })
    }

    /// A parenthesized tree of atoms and sub-lists.
    pub fn read_list(&mut self) -> Result<Vec<ListItem>, ProtocolError> {
        self.skip_spaces()?;
        match self.peek_byte()? {
            Some(b'(') => self.pos += 1,
            Some(byte) => {
                return Err(ProtocolError::Malformed(format!(
                    "expected '(', got 0x{byte:02x}"
                )))
            }
            None => return Err(ProtocolError::UnexpectedEof),
        }
        let mut items = Vec::new();
        loop {
            self.skip_spaces()?;
            match self.peek_byte()? {
                None => return Err(ProtocolError::UnexpectedEof),
                Some(b')') => {
                    self.pos += 1;
                    return Ok(items);
                }
                Some(b'(') => items.push(ListItem::List(self.read_list()?)),
                Some(b'\r') | Some(b'\n') => {
                    return Err(ProtocolError::Malformed("unterminated list".into()))
                }
                Some(_) => items.push(ListItem::Atom(self.read_string()?)),
            }
        }
    }
}
