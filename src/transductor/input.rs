//! Input stack: byte frames, synthetic signal frames, and the one-shot
//! mark/reset checkpoint with cross-frame replay
//!
//! Frames stack LIFO: a push interposes input to be read before whatever
//! is below, which is how signals and field injections cut in front of
//! stream data. The mark anchors on the bottom frame; stream frames that
//! elapse off the bottom while marked are kept in a bounded archive so a
//! later reset can replay them in original order.

use std::collections::VecDeque;
use std::rc::Rc;

use tracing::warn;

use crate::consts::DEFAULT_MARK_LIMIT;

/// How a frame entered the stack; replay and recycling depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    /// Caller-pushed stream data; archived while marked.
    Stream,
    /// Synthetic one-symbol signal frame; regenerated, never archived.
    Signal(usize),
    /// Field content injected by the `in` effector; regenerated, never
    /// archived.
    Field,
}

/// `(buffer, position, limit, mark)` over a shared byte buffer.
#[derive(Debug, Clone)]
struct Frame {
    buf: Rc<Vec<u8>>,
    position: usize,
    limit: usize,
    mark: Option<usize>,
    kind: FrameKind,
}

impl Frame {
    fn exhausted(&self) -> bool {
        self.position >= self.limit
    }
}

/// Mark lifecycle; `ResetPending` spans the teardown between archiving
/// the bottom frame and re-pushing the replay frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MarkState {
    Clear,
    Marked,
    ResetPending,
}

/// The transductor's input stack.
#[derive(Debug)]
pub(crate) struct InputStack {
    /// Bottom frame at index 0.
    frames: Vec<Frame>,
    /// Stream frames that elapsed past the anchor while marked, in
    /// consumption order. Grows by doubling; the limit is a soft
    /// watermark, not a cap.
    archive: VecDeque<Frame>,
    mark_state: MarkState,
    /// Set when `mark` ran on an empty stack; the next stream push
    /// becomes the anchor at position 0.
    pending_mark: bool,
    /// Retired buffers awaiting `recycle`.
    pool: Vec<Vec<u8>>,
    /// Count of buffers newly allocated because the pool was empty.
    allocated: u64,
    mark_limit: usize,
    warned: bool,
}

const POOL_LIMIT: usize = 8;

impl InputStack {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            archive: VecDeque::new(),
            mark_state: MarkState::Clear,
            pending_mark: false,
            pool: Vec::new(),
            allocated: 0,
            mark_limit: DEFAULT_MARK_LIMIT,
            warned: false,
        }
    }

    /// Adjust the archive's soft watermark.
    pub fn set_mark_limit(&mut self, limit: usize) {
        self.mark_limit = limit.max(1);
        self.warned = false;
    }

    /// Push caller stream data on top of the stack.
    pub fn push(&mut self, data: Vec<u8>) {
        let limit = data.len();
        let mark = if self.frames.is_empty() && self.pending_mark {
            self.pending_mark = false;
            Some(0)
        } else {
            None
        };
        self.frames.push(Frame {
            buf: Rc::new(data),
            position: 0,
            limit,
            mark,
            kind: FrameKind::Stream,
        });
    }

    /// Push a synthetic signal frame. The buffer carries the low byte of
    /// the ordinal but the frame's tag, never the byte, identifies it.
    pub fn push_signal(&mut self, signal: usize) {
        let mut buf = self.take_buffer();
        buf.push((signal & 0xff) as u8);
        self.frames.push(Frame {
            buf: Rc::new(buf),
            position: 0,
            limit: 1,
            mark: None,
            kind: FrameKind::Signal(signal),
        });
    }

    /// Push field or literal content as an input frame, reusing a retired
    /// buffer when one is available.
    pub fn push_field(&mut self, bytes: &[u8]) {
        let mut buf = self.take_buffer();
        buf.extend_from_slice(bytes);
        let limit = buf.len();
        self.frames.push(Frame {
            buf: Rc::new(buf),
            position: 0,
            limit,
            mark: None,
            kind: FrameKind::Field,
        });
    }

    /// Read and consume one symbol: a byte, or a signal frame's ordinal.
    pub fn next_symbol(&mut self) -> Option<usize> {
        loop {
            let frame = self.frames.last_mut()?;
            if frame.exhausted() {
                self.pop_frame();
                continue;
            }
            if let FrameKind::Signal(signal) = frame.kind {
                frame.position = frame.limit;
                return Some(signal);
            }
            let byte = frame.buf[frame.position];
            frame.position += 1;
            return Some(byte as usize);
        }
    }

    /// Count of unread symbols across all frames.
    pub fn remaining(&self) -> usize {
        self.frames.iter().map(|f| f.limit - f.position).sum()
    }

    /// Count of live frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Count of buffers allocated because none could be reused.
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Drop every frame and the archive; mark state clears.
    pub fn clear(&mut self) {
        while let Some(frame) = self.frames.pop() {
            self.retire(frame);
        }
        self.drop_archive();
        self.mark_state = MarkState::Clear;
        self.pending_mark = false;
    }

    /* mark / reset */

    #[cfg(test)]
    pub fn mark_state(&self) -> MarkState {
        self.mark_state
    }

    /// Record the mark on the bottom frame. Re-marking moves the anchor
    /// and forgets any archived frames: at most one mark is live.
    ///
    /// Exhausted top frames (typically the signal frame that triggered
    /// the marking effector) are retired first, so a mark taken between
    /// stream chunks anchors on the next chunk pushed.
    pub fn mark(&mut self) {
        self.unmark();
        while self.frames.last().is_some_and(Frame::exhausted) {
            self.pop_frame();
        }
        match self.frames.first_mut() {
            Some(bottom) => bottom.mark = Some(bottom.position),
            None => self.pending_mark = true,
        }
        self.mark_state = MarkState::Marked;
    }

    /// Forget the mark and anything archived under it.
    pub fn unmark(&mut self) {
        for frame in &mut self.frames {
            frame.mark = None;
        }
        self.drop_archive();
        self.pending_mark = false;
        self.mark_state = MarkState::Clear;
    }

    /// Rewind to the mark. Frames above the anchor are transient
    /// (signals, field injections) and are discarded; re-execution
    /// regenerates them. A signal or field frame at the bottom (e.g. the
    /// signal that triggered the resetting effector) is discarded too,
    /// never archived, or its replay would re-fire the reset.
    pub fn reset(&mut self) {
        if self.mark_state != MarkState::Marked {
            return;
        }
        while self.frames.len() > 1 {
            let frame = self.frames.pop().expect("len checked");
            self.retire(frame);
        }
        if self
            .frames
            .last()
            .is_some_and(|f| f.kind != FrameKind::Stream && f.mark.is_none())
        {
            let frame = self.frames.pop().expect("bottom exists");
            self.retire(frame);
        }
        if self.archive.is_empty() {
            if let Some(bottom) = self.frames.first_mut() {
                if let Some(mark) = bottom.mark.take() {
                    bottom.position = mark;
                }
            }
        } else {
            self.mark_state = MarkState::ResetPending;
            if let Some(mut bottom) = self.frames.pop() {
                // partly consumed continuation; replays from the top
                bottom.position = 0;
                self.archive_frame(bottom);
            }
            let mut replay: Vec<Frame> = self.archive.drain(..).collect();
            if let Some(anchor) = replay.first_mut() {
                anchor.position = anchor.mark.take().unwrap_or(0);
            }
            for frame in replay.iter_mut().skip(1) {
                frame.position = 0;
                frame.mark = None;
            }
            // earliest archived frame must be read first, so it lands on
            // top of the stack
            replay.reverse();
            self.frames = replay;
        }
        self.pending_mark = false;
        self.mark_state = MarkState::Clear;
    }

    /* superinstruction fast paths */

    /// Consume bytes while the bitmap holds them; the first byte outside
    /// the set stays unread. Crosses data frames, stops at signal frames.
    pub fn skip_sum(&mut self, bitmap: &[u64; 4]) -> u64 {
        let mut skipped = 0;
        loop {
            let Some(frame) = self.data_frame() else {
                return skipped;
            };
            while frame.position < frame.limit {
                let byte = frame.buf[frame.position];
                if bitmap[(byte >> 6) as usize] & (1u64 << (byte & 63)) == 0 {
                    return skipped;
                }
                frame.position += 1;
                skipped += 1;
            }
        }
    }

    /// Consume bytes until `byte` is seen; the matching byte stays
    /// unread. Crosses data frames, stops at signal frames.
    pub fn skip_scan(&mut self, byte: u8) -> u64 {
        let mut skipped = 0;
        loop {
            let Some(frame) = self.data_frame() else {
                return skipped;
            };
            match frame.buf[frame.position..frame.limit]
                .iter()
                .position(|b| *b == byte)
            {
                Some(offset) => {
                    frame.position += offset;
                    return skipped + offset as u64;
                }
                None => {
                    skipped += (frame.limit - frame.position) as u64;
                    frame.position = frame.limit;
                }
            }
        }
    }

    /// Match `pattern` verbatim, consuming matched bytes. On mismatch the
    /// offending byte is consumed, mirroring ordinary dispatch of a
    /// rejected symbol, and `false` is returned. Running out of input
    /// counts as a mismatch.
    pub fn match_product(&mut self, pattern: &[u8]) -> (u64, bool) {
        let mut consumed = 0;
        for expected in pattern {
            let Some(frame) = self.data_frame() else {
                return (consumed, false);
            };
            let byte = frame.buf[frame.position];
            frame.position += 1;
            consumed += 1;
            if byte != *expected {
                return (consumed, false);
            }
        }
        (consumed, true)
    }

    /* buffers */

    /// Drop the top input frame on request of an effector.
    pub fn pop_top(&mut self) {
        self.pop_frame();
    }

    /// Reclaim a retired buffer, if any is free. A buffer is only ever
    /// offered here once no live or archived frame references it.
    pub fn recycle(&mut self) -> Option<Vec<u8>> {
        self.pool.pop().map(|mut buf| {
            buf.clear();
            buf
        })
    }

    /// An empty buffer: a cleared pool buffer when one is free, a fresh
    /// allocation (counted) otherwise.
    fn take_buffer(&mut self) -> Vec<u8> {
        match self.pool.pop() {
            Some(mut buf) => {
                buf.clear();
                buf
            }
            None => {
                self.allocated += 1;
                Vec::new()
            }
        }
    }

    /// Top frame holding readable non-signal bytes, dropping exhausted
    /// frames on the way.
    fn data_frame(&mut self) -> Option<&mut Frame> {
        loop {
            let frame = self.frames.last()?;
            if frame.exhausted() {
                self.pop_frame();
                continue;
            }
            if matches!(frame.kind, FrameKind::Signal(_)) {
                return None;
            }
            return self.frames.last_mut();
        }
    }

    /// Pop the top frame: the bottom frame archives while a mark is
    /// live, everything else retires.
    fn pop_frame(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        let was_bottom = self.frames.is_empty();
        let keep = self.mark_state != MarkState::Clear
            && was_bottom
            && (frame.kind == FrameKind::Stream || frame.mark.is_some());
        if keep {
            self.archive_frame(frame);
        } else {
            self.retire(frame);
        }
    }

    fn archive_frame(&mut self, frame: Frame) {
        self.archive.push_back(frame);
        if self.archive.len() > self.mark_limit && !self.warned {
            warn!(
                frames = self.archive.len(),
                limit = self.mark_limit,
                "marked-frame archive exceeds its soft limit; growing"
            );
            self.warned = true;
        }
    }

    fn drop_archive(&mut self) {
        while let Some(frame) = self.archive.pop_front() {
            self.retire(frame);
        }
    }

    /// Return a frame's buffer to the pool once nothing else shares it.
    fn retire(&mut self, frame: Frame) {
        if let Ok(buf) = Rc::try_unwrap(frame.buf) {
            if self.pool.len() < POOL_LIMIT && buf.capacity() > 0 {
                self.pool.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(stack: &mut InputStack) -> Vec<usize> {
        let mut symbols = Vec::new();
        while let Some(symbol) = stack.next_symbol() {
            symbols.push(symbol);
        }
        symbols
    }

    #[test]
    fn frames_read_lifo() {
        let mut stack = InputStack::new();
        stack.push(b"ab".to_vec());
        stack.push_signal(300);
        assert_eq!(drain(&mut stack), vec![300, b'a' as usize, b'b' as usize]);
    }

    #[test]
    fn mark_then_reset_without_advance_is_noop() {
        let mut stack = InputStack::new();
        stack.push(b"abc".to_vec());
        assert_eq!(stack.next_symbol(), Some(b'a' as usize));
        stack.mark();
        stack.reset();
        assert_eq!(stack.next_symbol(), Some(b'b' as usize));
        assert_eq!(stack.mark_state(), MarkState::Clear);
    }

    #[test]
    fn reset_rewinds_within_one_frame() {
        let mut stack = InputStack::new();
        stack.push(b"abc".to_vec());
        assert_eq!(stack.next_symbol(), Some(b'a' as usize));
        stack.mark();
        assert_eq!(stack.next_symbol(), Some(b'b' as usize));
        assert_eq!(stack.next_symbol(), Some(b'c' as usize));
        stack.reset();
        assert_eq!(drain(&mut stack), vec![b'b' as usize, b'c' as usize]);
    }

    #[test]
    fn nested_frames_do_not_replay() {
        // mark, read past a nested frame, reset: nested data reads once
        let mut stack = InputStack::new();
        stack.push(b"ABC".to_vec());
        assert_eq!(stack.next_symbol(), Some(b'A' as usize));
        stack.mark();
        assert_eq!(stack.next_symbol(), Some(b'B' as usize));
        stack.push(b"X".to_vec());
        assert_eq!(stack.next_symbol(), Some(b'X' as usize));
        assert_eq!(stack.next_symbol(), Some(b'C' as usize));
        stack.reset();
        assert_eq!(drain(&mut stack), vec![b'B' as usize, b'C' as usize]);
    }

    #[test]
    fn reset_replays_elapsed_frames_in_order() {
        let mut stack = InputStack::new();
        stack.push(b"ab".to_vec());
        assert_eq!(stack.next_symbol(), Some(b'a' as usize));
        stack.mark();
        assert_eq!(stack.next_symbol(), Some(b'b' as usize));
        // first chunk exhausts and pops off the bottom; it must archive
        assert_eq!(stack.next_symbol(), None);
        stack.push(b"cd".to_vec());
        assert_eq!(stack.next_symbol(), Some(b'c' as usize));
        stack.reset();
        assert_eq!(
            drain(&mut stack),
            vec![b'b' as usize, b'c' as usize, b'd' as usize]
        );
        assert!(stack.archive.is_empty());
    }

    #[test]
    fn remark_drops_previous_archive() {
        let mut stack = InputStack::new();
        stack.push(b"ab".to_vec());
        stack.mark();
        assert_eq!(drain(&mut stack), vec![b'a' as usize, b'b' as usize]);
        assert_eq!(stack.archive.len(), 1);
        stack.push(b"cd".to_vec());
        stack.mark();
        assert!(stack.archive.is_empty());
        assert_eq!(stack.next_symbol(), Some(b'c' as usize));
        stack.reset();
        assert_eq!(drain(&mut stack), vec![b'c' as usize, b'd' as usize]);
    }

    #[test]
    fn unmark_releases_buffers_for_recycling() {
        let mut stack = InputStack::new();
        stack.push(b"ab".to_vec());
        stack.mark();
        assert_eq!(drain(&mut stack), vec![b'a' as usize, b'b' as usize]);
        assert!(stack.recycle().is_none());
        stack.unmark();
        assert!(stack.recycle().is_some());
        assert!(stack.recycle().is_none());
    }

    #[test]
    fn allocations_count_pool_misses() {
        let mut stack = InputStack::new();
        stack.push_field(b"ab");
        assert_eq!(stack.allocated(), 1);
        assert_eq!(drain(&mut stack), vec![b'a' as usize, b'b' as usize]);

        // the retired buffer is reused, so no new allocation
        stack.push_field(b"cd");
        assert_eq!(stack.allocated(), 1);
    }

    #[test]
    fn skip_scan_leaves_the_terminator_unread() {
        let mut stack = InputStack::new();
        stack.push(b"xxxy".to_vec());
        assert_eq!(stack.skip_scan(b'y'), 3);
        assert_eq!(stack.next_symbol(), Some(b'y' as usize));
    }

    #[test]
    fn skip_scan_crosses_frames() {
        let mut stack = InputStack::new();
        stack.push(b"zzy".to_vec());
        stack.push_field(b"zz");
        assert_eq!(stack.skip_scan(b'y'), 4);
        assert_eq!(stack.next_symbol(), Some(b'y' as usize));
    }

    #[test]
    fn skip_sum_respects_the_bitmap() {
        let mut bitmap = [0u64; 4];
        for byte in b"ab" {
            bitmap[(*byte >> 6) as usize] |= 1 << (*byte & 63);
        }
        let mut stack = InputStack::new();
        stack.push(b"ababq".to_vec());
        assert_eq!(stack.skip_sum(&bitmap), 4);
        assert_eq!(stack.next_symbol(), Some(b'q' as usize));
    }

    #[test]
    fn match_product_consumes_the_offending_byte() {
        let mut stack = InputStack::new();
        stack.push(b"abXcd".to_vec());
        assert_eq!(stack.match_product(b"abc"), (3, false));
        assert_eq!(stack.next_symbol(), Some(b'c' as usize));
    }

    #[test]
    fn match_product_accepts_verbatim() {
        let mut stack = InputStack::new();
        stack.push(b"abcd".to_vec());
        assert_eq!(stack.match_product(b"abc"), (3, true));
        assert_eq!(stack.next_symbol(), Some(b'd' as usize));
    }
}
