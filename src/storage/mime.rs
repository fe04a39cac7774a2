/// Number of leading bytes inspected for NUL and control characters
pub const SNIFF_WINDOW: usize = 8192;

/// Buffers at or below this length are never judged by byte ratios
const RATIO_MIN_LEN: usize = 100;

/// Display classification of a stored file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Text,
    Binary,
}

impl ContentKind {
    pub fn is_text(self) -> bool {
        matches!(self, ContentKind::Text)
    }
}

/// Best-effort heuristic for deciding if a buffer can be shown as text.
///
/// Invalid UTF-8 is binary. Otherwise only the first [`SNIFF_WINDOW`] bytes
/// are inspected: more than 1% NUL bytes or more than 5% control bytes
/// (tab, newline and carriage return excluded) marks a buffer longer than
/// 100 bytes as binary.
pub fn classify(buffer: &[u8]) -> ContentKind {
    if buffer.is_empty() {
        return ContentKind::Text;
    }

    if std::str::from_utf8(buffer).is_err() {
        return ContentKind::Binary;
    }

    let window = &buffer[..buffer.len().min(SNIFF_WINDOW)];
    let mut nul_count = 0usize;
    let mut control_count = 0usize;
    for &b in window {
        if b == 0 {
            nul_count += 1;
        }
        if b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r') {
            control_count += 1;
        }
    }

    if buffer.len() > RATIO_MIN_LEN {
        if nul_count * 100 > window.len() {
            return ContentKind::Binary;
        }
        if control_count * 20 > window.len() {
            return ContentKind::Binary;
        }
    }

    ContentKind::Text
}
