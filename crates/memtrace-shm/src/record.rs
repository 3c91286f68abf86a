//! Allocation records stored as table values.
//!
//! Records are written straight into shared memory, so everything here is
//! fixed-size `#[repr(C)]` data: a block size and up to [`MAX_FRAMES`] frame
//! descriptors of at most [`FRAME_TEXT_LEN`] bytes each. Anything that does
//! not fit is dropped without error.

use std::fmt::{self, Write as _};

/// Maximum number of frames kept per allocation.
pub const MAX_FRAMES: usize = 10;

/// Maximum length in bytes of one frame descriptor.
pub const FRAME_TEXT_LEN: usize = 64;

/// Bounded, NUL-padded UTF-8 text.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FrameText([u8; FRAME_TEXT_LEN]);

impl FrameText {
    /// The empty descriptor.
    pub const EMPTY: Self = Self([0; FRAME_TEXT_LEN]);

    /// Copy `text`, truncating on a character boundary.
    pub fn new(text: &str) -> Self {
        let mut writer = FrameWriter::new();
        let _ = writer.write_str(text);
        writer.finish()
    }

    /// The stored text.
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(FRAME_TEXT_LEN);
        // Only whole characters are ever copied in, so this cannot fail.
        std::str::from_utf8(&self.0[..end]).unwrap_or_default()
    }

    /// Whether no text is stored.
    pub const fn is_empty(&self) -> bool {
        self.0[0] == 0
    }
}

impl Default for FrameText {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for FrameText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for FrameText {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `fmt::Write` sink that silently stops once the buffer is full.
struct FrameWriter {
    buf: [u8; FRAME_TEXT_LEN],
    len: usize,
}

impl FrameWriter {
    const fn new() -> Self {
        Self {
            buf: [0; FRAME_TEXT_LEN],
            len: 0,
        }
    }

    const fn finish(self) -> FrameText {
        FrameText(self.buf)
    }
}

impl fmt::Write for FrameWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            let width = c.len_utf8();
            if c == '\0' || self.len + width > FRAME_TEXT_LEN {
                break;
            }
            c.encode_utf8(&mut self.buf[self.len..self.len + width]);
            self.len += width;
        }
        Ok(())
    }
}

/// Up to [`MAX_FRAMES`] frame descriptors, filled from the front.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct StackTrace {
    frames: [FrameText; MAX_FRAMES],
}

impl StackTrace {
    /// A trace with no frames.
    pub const EMPTY: Self = Self {
        frames: [FrameText::EMPTY; MAX_FRAMES],
    };

    /// Build a trace from descriptors; extra frames are dropped.
    pub fn from_frames<'a>(frames: impl IntoIterator<Item = &'a str>) -> Self {
        let mut trace = Self::EMPTY;
        for (slot, text) in trace.frames.iter_mut().zip(frames) {
            *slot = FrameText::new(text);
        }
        trace
    }

    /// Capture the calling thread's stack as instruction pointers.
    ///
    /// The innermost `skip` frames are left out. Frames are recorded as
    /// `0x...` text without touching the heap, which makes this usable from
    /// allocator hooks. Addresses are only meaningful in the capturing
    /// process.
    pub fn capture(skip: usize) -> Self {
        let mut trace = Self::EMPTY;
        let mut seen = 0usize;
        let mut len = 0usize;

        backtrace::trace(|frame| {
            seen += 1;
            if seen <= skip {
                return true;
            }
            let mut writer = FrameWriter::new();
            let _ = write!(writer, "{:#x}", frame.ip() as usize);
            trace.frames[len] = writer.finish();
            len += 1;
            len < MAX_FRAMES
        });

        trace
    }

    /// Capture the calling thread's stack with symbol names.
    ///
    /// Frames are rendered as `symbol (file:line)` when debug information is
    /// available, falling back to the symbol name and then the address.
    /// Symbol resolution allocates and is much slower than [`Self::capture`].
    pub fn capture_symbolized(skip: usize) -> Self {
        let mut trace = Self::EMPTY;
        let mut seen = 0usize;
        let mut len = 0usize;

        backtrace::trace(|frame| {
            seen += 1;
            if seen <= skip {
                return true;
            }

            let mut writer = FrameWriter::new();
            let mut resolved = false;
            backtrace::resolve_frame(frame, |symbol| {
                if resolved {
                    return;
                }
                if let Some(name) = symbol.name() {
                    resolved = true;
                    let _ = write!(writer, "{name:#}");
                    if let (Some(file), Some(line)) = (symbol.filename(), symbol.lineno()) {
                        let _ = write!(writer, " ({}:{line})", file.display());
                    }
                }
            });
            if !resolved {
                let _ = write!(writer, "{:#x}", frame.ip() as usize);
            }

            trace.frames[len] = writer.finish();
            len += 1;
            len < MAX_FRAMES
        });

        trace
    }

    /// Non-empty frame descriptors, innermost first.
    pub fn frames(&self) -> impl Iterator<Item = &str> {
        self.frames
            .iter()
            .take_while(|f| !f.is_empty())
            .map(FrameText::as_str)
    }

    /// Number of recorded frames.
    pub fn len(&self) -> usize {
        self.frames.iter().take_while(|f| !f.is_empty()).count()
    }

    /// Whether no frame was recorded.
    pub const fn is_empty(&self) -> bool {
        self.frames[0].is_empty()
    }
}

impl fmt::Debug for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.frames()).finish()
    }
}

/// Metadata kept for every live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct AllocationRecord {
    /// Requested size in bytes.
    pub block_size: u32,
    /// Where the allocation was made.
    pub stack_trace: StackTrace,
}

impl AllocationRecord {
    /// A record without a stack trace.
    pub const fn new(block_size: u32) -> Self {
        Self {
            block_size,
            stack_trace: StackTrace::EMPTY,
        }
    }

    /// A record for a `usize` request, saturating at `u32::MAX`.
    pub fn from_size(size: usize) -> Self {
        Self::new(u32::try_from(size).unwrap_or(u32::MAX))
    }

    /// Attach a stack trace.
    #[must_use]
    pub const fn with_stack_trace(mut self, stack_trace: StackTrace) -> Self {
        self.stack_trace = stack_trace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_text_round_trip() {
        let text = FrameText::new("main (src/main.rs:12)");
        assert_eq!(text.as_str(), "main (src/main.rs:12)");
        assert!(!text.is_empty());
        assert!(FrameText::EMPTY.is_empty());
    }

    #[test]
    fn test_frame_text_truncates_on_char_boundary() {
        // 'é' is two bytes, so 33 of them overflow 64 bytes mid-character
        let long = "é".repeat(33);
        let text = FrameText::new(&long);
        assert_eq!(text.as_str().len(), 64);
        assert_eq!(text.as_str(), "é".repeat(32));

        let ascii = "x".repeat(100);
        assert_eq!(FrameText::new(&ascii).as_str(), "x".repeat(64));

        let mixed = format!("{}é", "x".repeat(63));
        assert_eq!(FrameText::new(&mixed).as_str(), "x".repeat(63));
    }

    #[test]
    fn test_stack_trace_overflow_is_truncated() {
        let names: Vec<String> = (0..15).map(|i| format!("frame{i}")).collect();
        let trace = StackTrace::from_frames(names.iter().map(String::as_str));
        assert_eq!(trace.len(), MAX_FRAMES);
        assert_eq!(trace.frames().next(), Some("frame0"));
        assert_eq!(trace.frames().last(), Some("frame9"));
    }

    #[test]
    fn test_capture_records_addresses() {
        let trace = StackTrace::capture(0);
        assert!(!trace.is_empty());
        assert!(trace.len() <= MAX_FRAMES);
        assert!(trace.frames().all(|f| f.starts_with("0x")));
    }

    #[test]
    fn test_capture_symbolized_is_bounded() {
        let trace = StackTrace::capture_symbolized(0);
        assert!(!trace.is_empty());
        assert!(trace.frames().all(|f| f.len() <= FRAME_TEXT_LEN));
    }

    #[test]
    fn test_record_from_size_saturates() {
        assert_eq!(AllocationRecord::from_size(17).block_size, 17);
        assert_eq!(
            AllocationRecord::from_size(usize::MAX).block_size,
            u32::MAX
        );
    }

    #[test]
    fn test_record_with_stack_trace() {
        let record = AllocationRecord::new(8).with_stack_trace(StackTrace::from_frames(["a", "b"]));
        let frames: Vec<&str> = record.stack_trace.frames().collect();
        assert_eq!(frames, ["a", "b"]);
    }
}
