//! Frame extraction from raw transport bytes
//!
//! Serial devices deliver bytes in arbitrary chunks. The [`FramedReader`]
//! turns them into [`Frame`]s that always end on the expected delimiter and,
//! for fixed-length devices, have exactly the expected length.
//!
//! Two framing styles are supported:
//! - **Line**: variable-length text split on a delimiter (G-code controllers)
//! - **Fixed**: constant-length records ending in a delimiter (load cells)
//!
//! Fixed-length framing recovers alignment when the stream was joined
//! mid-record: bytes up to and including the first delimiter are discarded
//! and the record is topped up once from the transport.

use super::Transport;
use periphlink_core::{Error, Frame, FrameError, Result, TransportError};
use regex::Regex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Default block size for line-framed loads
pub const READ_BLOCK_SIZE: usize = 4096;

/// How records are delimited
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Variable-length lines ending in `delimiter`
    Line {
        /// Line terminator, usually `"\n"`
        delimiter: String,
        /// Maximum bytes requested per load; also the longest accepted line
        block_size: usize,
    },
    /// Records of exactly `length` bytes, the last of which are `delimiter`
    Fixed {
        /// Record length including the delimiter
        length: usize,
        /// Record terminator
        delimiter: String,
    },
}

/// Framing plus optional content validation
#[derive(Debug, Clone)]
pub struct FrameSpec {
    /// Delimiting style
    pub framing: Framing,
    /// Pattern every complete record must match, delimiter included
    pub format: Option<Regex>,
}

impl FrameSpec {
    /// Newline-delimited text with the default block size
    pub fn lines() -> Self {
        Self {
            framing: Framing::Line {
                delimiter: "\n".to_string(),
                block_size: READ_BLOCK_SIZE,
            },
            format: None,
        }
    }

    /// Fixed-length records
    pub fn fixed(length: usize, delimiter: impl Into<String>) -> Self {
        Self {
            framing: Framing::Fixed {
                length,
                delimiter: delimiter.into(),
            },
            format: None,
        }
    }

    /// Attach a content pattern
    pub fn with_format(mut self, format: Regex) -> Self {
        self.format = Some(format);
        self
    }

    /// Check that records can actually be framed
    pub fn validate(&self) -> std::result::Result<(), String> {
        match &self.framing {
            Framing::Line {
                delimiter,
                block_size,
            } => {
                if delimiter.is_empty() {
                    return Err("line delimiter must not be empty".to_string());
                }
                if *block_size == 0 {
                    return Err("block size must be > 0".to_string());
                }
            }
            Framing::Fixed { length, delimiter } => {
                if delimiter.is_empty() {
                    return Err("record delimiter must not be empty".to_string());
                }
                if *length <= delimiter.len() {
                    return Err(format!(
                        "record length {} must exceed delimiter length {}",
                        length,
                        delimiter.len()
                    ));
                }
            }
        }
        Ok(())
    }

    /// The delimiter in use
    pub fn delimiter(&self) -> &str {
        match &self.framing {
            Framing::Line { delimiter, .. } | Framing::Fixed { delimiter, .. } => delimiter,
        }
    }
}

/// Check that `bytes` is valid UTF-8, tolerating a sequence cut off at the end
///
/// A load may end in the middle of a multi-byte character; the remainder
/// arrives with the next load.
pub fn check_utf8(bytes: &[u8]) -> std::result::Result<(), FrameError> {
    match std::str::from_utf8(bytes) {
        Ok(_) => Ok(()),
        Err(e) if e.error_len().is_none() => Ok(()),
        Err(e) => Err(FrameError::Decode {
            reason: e.to_string(),
        }),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads delimited frames from a transport
///
/// Bytes received past the end of the current frame stay in a residual
/// buffer and seed the next call; nothing a load returns is ever lost except
/// the bytes deliberately discarded to regain alignment.
#[derive(Debug)]
pub struct FramedReader {
    spec: FrameSpec,
    residual: Vec<u8>,
    lines: VecDeque<Frame>,
}

impl FramedReader {
    /// Create a reader for the given spec
    pub fn new(spec: FrameSpec) -> Self {
        Self {
            spec,
            residual: Vec::new(),
            lines: VecDeque::new(),
        }
    }

    /// Framing and format this reader applies
    pub fn spec(&self) -> &FrameSpec {
        &self.spec
    }

    /// Bytes received but not yet part of a returned frame
    pub fn residual(&self) -> &[u8] {
        &self.residual
    }

    /// Drop all buffered input; used when the transport is reopened
    pub fn reset(&mut self) {
        self.residual.clear();
        self.lines.clear();
    }

    /// Feed bytes obtained outside the reader, ahead of the next load
    pub fn push_input(&mut self, bytes: &[u8]) -> Result<()> {
        self.append(bytes)?;
        if let Framing::Line {
            delimiter,
            block_size,
        } = self.spec.framing.clone()
        {
            self.split_lines(&delimiter, block_size)?;
        }
        Ok(())
    }

    /// Read the next frame, waiting at most `timeout` overall
    ///
    /// # Errors
    /// - [`TransportError::Timeout`] when no complete frame arrives in time;
    ///   partial input is retained for the next call
    /// - [`FrameError::Framing`] when alignment cannot be restored
    /// - [`FrameError::Format`] when a framed record fails validation
    /// - [`FrameError::Decode`] on bytes that are not UTF-8
    pub async fn next_frame(
        &mut self,
        transport: &mut dyn Transport,
        timeout: Duration,
    ) -> Result<Frame> {
        let deadline = Instant::now() + timeout;
        match self.spec.framing.clone() {
            Framing::Line {
                delimiter,
                block_size,
            } => {
                self.next_line(transport, &delimiter, block_size, deadline, timeout)
                    .await
            }
            Framing::Fixed { length, delimiter } => {
                self.next_record(transport, length, &delimiter, deadline, timeout)
                    .await
            }
        }
    }

    async fn next_line(
        &mut self,
        transport: &mut dyn Transport,
        delimiter: &str,
        block_size: usize,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Frame> {
        loop {
            if let Some(frame) = self.lines.pop_front() {
                return Ok(frame);
            }

            let remaining = remaining(deadline, timeout)?;
            let bytes = transport.load_bytes(block_size, remaining).await?;
            self.append(&bytes)?;
            self.split_lines(delimiter, block_size)?;
        }
    }

    fn split_lines(&mut self, delimiter: &str, max_line: usize) -> Result<()> {
        let delim = delimiter.as_bytes();
        while let Some(idx) = find_subslice(&self.residual, delim) {
            let rest = self.residual.split_off(idx + delim.len());
            let raw = std::mem::replace(&mut self.residual, rest);
            let text = String::from_utf8(raw).map_err(|e| FrameError::Decode {
                reason: e.utf8_error().to_string(),
            })?;

            let frame = Frame::new(text, delimiter);
            if frame.is_empty() {
                tracing::trace!("Skipping blank line");
                continue;
            }
            self.validate(frame.as_str())?;
            self.lines.push_back(frame);
        }

        if self.residual.len() > max_line {
            let len = self.residual.len();
            self.residual.clear();
            return Err(FrameError::Framing {
                reason: format!("no {:?} within {} bytes", delimiter, len),
            }
            .into());
        }
        Ok(())
    }

    async fn next_record(
        &mut self,
        transport: &mut dyn Transport,
        length: usize,
        delimiter: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Frame> {
        let delim = delimiter.as_bytes();
        let tail = length.saturating_sub(delim.len());

        // Initial load. Left-over input from an earlier timed-out call counts.
        if self.residual.len() < length {
            let want = length - self.residual.len();
            let bytes = transport
                .load_bytes(want, remaining(deadline, timeout)?)
                .await?;
            self.append(&bytes)?;
        }

        // A short load is topped up until the record is complete.
        self.fill(transport, length, deadline, timeout).await?;

        match find_subslice(&self.residual[..length], delim) {
            Some(idx) if idx == tail => {}
            None => {
                self.discard_misaligned(delim.len());
                return Err(FrameError::Framing {
                    reason: format!("no {:?} in {}-byte record", delimiter, length),
                }
                .into());
            }
            Some(idx) => {
                // Joined mid-record: drop the fragment and complete the next one.
                let dropped = idx + delim.len();
                tracing::debug!("Resynchronizing, discarding {} bytes", dropped);
                self.residual.drain(..dropped);
                self.fill(transport, length, deadline, timeout).await?;

                if find_subslice(&self.residual[..length], delim) != Some(tail) {
                    self.discard_misaligned(delim.len());
                    return Err(FrameError::Framing {
                        reason: format!("unable to realign {}-byte records", length),
                    }
                    .into());
                }
            }
        }

        let rest = self.residual.split_off(length);
        let raw = std::mem::replace(&mut self.residual, rest);
        let text = String::from_utf8(raw).map_err(|e| {
            self.residual.clear();
            FrameError::Decode {
                reason: e.utf8_error().to_string(),
            }
        })?;
        self.validate(&text)?;
        Ok(Frame::new(text, delimiter))
    }

    /// Drop a misaligned record, keeping a trailing partial delimiter so the
    /// next read can realign on it
    fn discard_misaligned(&mut self, delimiter_len: usize) {
        let keep = delimiter_len.saturating_sub(1).min(self.residual.len());
        let cut = self.residual.len() - keep;
        self.residual.drain(..cut);
    }

    async fn fill(
        &mut self,
        transport: &mut dyn Transport,
        length: usize,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<()> {
        while self.residual.len() < length {
            let want = length - self.residual.len();
            let bytes = transport
                .load_bytes(want, remaining(deadline, timeout)?)
                .await?;
            self.append(&bytes)?;
        }
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.residual.extend_from_slice(bytes);
        if let Err(e) = check_utf8(&self.residual) {
            self.residual.clear();
            return Err(e.into());
        }
        Ok(())
    }

    fn validate(&self, record: &str) -> Result<()> {
        match &self.spec.format {
            Some(format) if !format.is_match(record) => Err(FrameError::Format {
                record: record.to_string(),
            }
            .into()),
            _ => Ok(()),
        }
    }
}

fn remaining(deadline: Instant, timeout: Duration) -> Result<Duration> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        Err(Error::Transport(TransportError::timeout(timeout)))
    } else {
        Ok(left)
    }
}
