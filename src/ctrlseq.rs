//! Control-sequence detector used by the batcher's immediate-flush trigger.
//! False positives (extra flushes) are harmless; false negatives hurt
//! interactive programs like vim and tmux.

use once_cell::sync::Lazy;
use regex_lite::Regex;

const PATTERN: &str = r"\x1b[\[\]OP\\_^]([0-9;:]*|\?[0-9;:]*|![0-9;:]*)[@-~A-Za-z]|\x1b[@-Z\\\-_]|\x1b[\[\]]\d*;?\d*[\x07\x1b\\]";

static CONTROL_SEQUENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(PATTERN).expect("control sequence regex is valid"));

/// Only the first `SCAN_WINDOW` bytes following each ESC are inspected once
/// the input exceeds `SCAN_THRESHOLD` bytes.
const SCAN_THRESHOLD: usize = 256;
const SCAN_WINDOW: usize = 20;

/// Returns true iff `data` contains an ANSI/VT control sequence.
pub fn contains_control_sequence(data: &[u8]) -> bool {
    if !data.contains(&0x1B) {
        return false;
    }

    if data.len() <= SCAN_THRESHOLD {
        let text = String::from_utf8_lossy(data);
        return CONTROL_SEQUENCE.is_match(&text);
    }

    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x1B {
            let end = (i + SCAN_WINDOW).min(data.len());
            let window = String::from_utf8_lossy(&data[i..end]);
            if CONTROL_SEQUENCE.is_match(&window) {
                return true;
            }
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_esc_byte_returns_false_immediately() {
        assert!(!contains_control_sequence(b"plain text, no escapes"));
    }

    #[test]
    fn detects_sgr_color_sequence() {
        assert!(contains_control_sequence(b"\x1b[31mX\x1b[0m"));
    }

    #[test]
    fn detects_cursor_movement() {
        assert!(contains_control_sequence(b"\x1b[1A\x1b[2K"));
    }

    #[test]
    fn large_input_scans_only_window_after_each_esc() {
        let mut data = vec![b'a'; 300];
        data.extend_from_slice(b"\x1b[31mX\x1b[0m");
        assert!(contains_control_sequence(&data));
    }

    #[test]
    fn large_plain_input_without_escape_is_false() {
        let data = vec![b'a'; 300];
        assert!(!contains_control_sequence(&data));
    }
}
