//! Per-direction streaming body filter.
//!
//! Holds arriving body bytes under a buffering policy, applies ordered
//! byte-range edits in stream order, and accounts for the shift between
//! pre-edit and post-edit offsets. All edit coordinates are pre-edit:
//! `bytes_done` counts input bytes already released downstream, `offs`
//! carries the accumulated output-length delta of applied edits.

use bytes::{Bytes, BytesMut};

use crate::core::{WafError, WafResult};
use crate::engine::Direction;

use super::iobuf::IoBuffer;

/// Buffering policy for one direction, selected from the engine's
/// context configuration at first invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferMode {
    /// Write-through; no bytes held back beyond a pending edit.
    Nobuf,
    /// The engine is diverting to a synthetic response; remaining bytes
    /// are not forwarded.
    Discard,
    /// Hold everything until the engine flags inspection finished.
    BufferAll,
    /// Past the limit, flush everything staged before staging more.
    FlushAll,
    /// Past the limit, flush just enough to stay at the limit.
    FlushPart,
}

/// One queued replacement of a pre-edit byte range.
#[derive(Clone, Debug)]
pub struct StreamEdit {
    pub start: u64,
    pub len: u64,
    pub replacement: Bytes,
}

impl StreamEdit {
    fn end(&self) -> u64 {
        self.start + self.len
    }
}

#[derive(Debug)]
pub struct StreamFilter {
    dir: Direction,
    mode: BufferMode,
    buf_limit: usize,
    staged: IoBuffer,
    bytes_done: u64,
    bytes_notified: u64,
    offs: i64,
    /// Sorted by descending `start`, so the smallest remaining start
    /// pops from the back in constant time.
    edits: Vec<StreamEdit>,
    have_edits: bool,
    configured: bool,
    finished: bool,
}

impl StreamFilter {
    pub fn new(dir: Direction) -> Self {
        Self {
            dir,
            mode: BufferMode::Nobuf,
            buf_limit: 0,
            staged: IoBuffer::new(),
            bytes_done: 0,
            bytes_notified: 0,
            offs: 0,
            edits: Vec::new(),
            have_edits: false,
            configured: false,
            finished: false,
        }
    }

    /// Applies the buffering policy chosen at first invocation. Discard
    /// sticks once set.
    pub fn configure(&mut self, mode: BufferMode, buf_limit: usize) {
        if self.mode != BufferMode::Discard {
            self.mode = mode;
        }
        self.buf_limit = buf_limit;
        self.configured = true;
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn mode(&self) -> BufferMode {
        self.mode
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done
    }

    pub fn bytes_notified(&self) -> u64 {
        self.bytes_notified
    }

    pub fn offs(&self) -> i64 {
        self.offs
    }

    pub fn buffered(&self) -> usize {
        self.staged.available()
    }

    pub fn have_edits(&self) -> bool {
        self.have_edits
    }

    /// Declares that edits are coming for this direction.
    pub fn declare_edits(&mut self) {
        self.have_edits = true;
    }

    /// Records bytes delivered to the rules engine (pre-edit).
    pub fn note_notified(&mut self, n: usize) {
        self.bytes_notified += n as u64;
    }

    /// Switches to discard: remaining input is consumed, nothing is
    /// forwarded.
    pub fn set_discard(&mut self) {
        if self.mode != BufferMode::Discard {
            log::debug!("{} body filter switching to discard", self.dir.label());
            self.mode = BufferMode::Discard;
            self.staged = IoBuffer::new();
        }
    }

    /// Queues a byte-range edit. Ranges are pre-edit; edits targeting
    /// already-forwarded data are rejected, overlapping edits are
    /// dropped.
    pub fn queue_edit(&mut self, start: u64, len: u64, replacement: Bytes) -> WafResult<()> {
        if start < self.bytes_done {
            return Err(WafError::EditOutOfRange(format!(
                "{} edit at {start} targets data already forwarded (done {})",
                self.dir.label(),
                self.bytes_done
            )));
        }
        let end = start + len;
        if self
            .edits
            .iter()
            .any(|e| start < e.end() && e.start < end)
        {
            return Err(WafError::EditOutOfRange(format!(
                "{} edit [{start}, {end}) overlaps a queued edit",
                self.dir.label()
            )));
        }

        let at = self
            .edits
            .partition_point(|e| e.start > start);
        self.edits.insert(
            at,
            StreamEdit {
                start,
                len,
                replacement,
            },
        );
        self.have_edits = true;
        Ok(())
    }

    /// Admits one arriving chunk under the buffering policy, appending
    /// any released bytes to `out`.
    pub fn admit(&mut self, chunk: Bytes, out: &mut BytesMut) {
        if chunk.is_empty() {
            return;
        }
        if self.finished {
            log::error!(
                "{} body filter received data after terminal flush",
                self.dir.label()
            );
            return;
        }
        match self.mode {
            BufferMode::Discard => {}
            BufferMode::Nobuf => {
                self.staged.push(chunk);
                let n = self.staged.available();
                self.flush(n, false, out);
            }
            BufferMode::BufferAll => self.staged.push(chunk),
            BufferMode::FlushAll => {
                if self.staged.available() + chunk.len() > self.buf_limit {
                    let n = self.staged.available();
                    self.flush(n, false, out);
                }
                self.staged.push(chunk);
            }
            BufferMode::FlushPart => {
                let incoming = self.staged.available() + chunk.len();
                if incoming > self.buf_limit {
                    self.flush(incoming - self.buf_limit, false, out);
                }
                self.staged.push(chunk);
            }
        }
    }

    /// Releases everything currently staged (the engine has finished
    /// inspecting this direction).
    pub fn release(&mut self, out: &mut BytesMut) {
        let n = self.staged.available();
        self.flush(n, false, out);
    }

    /// Terminal flush at end-of-stream: applies what can still be
    /// applied, drops edits that will never complete, and returns the
    /// output byte total reported downstream (`bytes_done + offs`).
    pub fn finish(&mut self, out: &mut BytesMut) -> u64 {
        self.finished = true;
        let n = self.staged.available();
        self.flush(n, true, out);
        for edit in self.edits.drain(..) {
            log::error!(
                "Dropping {} edit [{}, {}): data never arrived",
                self.dir.label(),
                edit.start,
                edit.end()
            );
        }
        (self.bytes_done as i64 + self.offs).max(0) as u64
    }

    /// Releases `n` staged pre-edit bytes, applying queued edits that
    /// fall inside the released window in ascending start order.
    fn flush(&mut self, n: usize, at_eos: bool, out: &mut BytesMut) {
        let n = n.min(self.staged.available());
        let window_end = self.bytes_done + n as u64;

        while let Some(edit) = self.edits.last() {
            if edit.start >= window_end {
                break;
            }
            let staged_end = self.bytes_done + self.staged.available() as u64;
            if edit.end() > staged_end {
                if at_eos {
                    log::error!(
                        "Dropping {} edit [{}, {}): extends past end of stream ({staged_end})",
                        self.dir.label(),
                        edit.start,
                        edit.end()
                    );
                    self.edits.pop();
                    continue;
                }
                // More data may arrive; release the lead-in and wait.
                log::debug!(
                    "Deferring {} edit [{}, {}): staged through {staged_end}",
                    self.dir.label(),
                    edit.start,
                    edit.end()
                );
                let lead = (edit.start - self.bytes_done) as usize;
                self.forward(lead, out);
                return;
            }

            let edit = self.edits.pop().expect("peeked above");
            let lead = (edit.start - self.bytes_done) as usize;
            self.forward(lead, out);
            self.staged.consume(edit.len as usize);
            self.bytes_done += edit.len;
            out.extend_from_slice(&edit.replacement);
            self.offs += edit.replacement.len() as i64 - edit.len as i64;
        }

        if window_end > self.bytes_done {
            let rest = (window_end - self.bytes_done).min(self.staged.available() as u64);
            self.forward(rest as usize, out);
        }
    }

    fn forward(&mut self, n: usize, out: &mut BytesMut) {
        if n == 0 {
            return;
        }
        let released = self.staged.split_to(n);
        self.bytes_done += released.len() as u64;
        out.extend_from_slice(&released);
    }
}
