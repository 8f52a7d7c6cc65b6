#![forbid(unsafe_code)]
//! Tagged/untagged response writing. Every response is flushed immediately;
//! a handler's output is complete before the next command is read.

use std::io::Write;

pub struct ResponseWriter<W: Write> {
    inner: W,
}

impl<W: Write> ResponseWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(line)?;
        self.inner.write_all(b"\r\n")?;
        self.inner.flush()
    }

    /// `* <text>`
    pub fn untagged(&mut self, text: &str) -> std::io::Result<()> {
        let mut line = Vec::with_capacity(2 + text.len());
        line.extend_from_slice(b"* ");
        line.extend_from_slice(text.as_bytes());
        self.write_line(&line)
    }

    /// `* <data>` where `data` may contain raw payload bytes.
    pub fn untagged_bytes(&mut self, data: &[u8]) -> std::io::Result<()> {
        let mut line = Vec::with_capacity(2 + data.len());
        line.extend_from_slice(b"* ");
        line.extend_from_slice(data);
        self.write_line(&line)
    }

    /// `<tag> <text>`
    pub fn tagged(&mut self, tag: &[u8], text: &str) -> std::io::Result<()> {
        let mut line = Vec::with_capacity(tag.len() + 1 + text.len());
        line.extend_from_slice(tag);
        line.push(b' ');
        line.extend_from_slice(text.as_bytes());
        self.write_line(&line)
    }
}
