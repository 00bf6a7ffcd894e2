// src/terminal.rs
// Terminal Cleaner: strips ANSI escape sequences from a byte stream while
// preserving newlines, tabs, and printable text.

const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;

/// Strip terminal escape sequences from `input`, returning a cleaned copy.
///
/// Stateless and idempotent: `clean(&clean(x)) == clean(x)`.
pub fn clean(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    let len = input.len();

    while i < len {
        let b = input[i];

        if b == b'\r' {
            // CR LF pairs are preserved; standalone CR is dropped.
            if i + 1 < len && input[i + 1] == b'\n' {
                out.push(b'\r');
                out.push(b'\n');
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }

        if b != ESC {
            out.push(b);
            i += 1;
            continue;
        }

        // b == ESC: figure out which escape form this is.
        if i + 1 >= len {
            // Dangling ESC at end of chunk: drop it.
            i += 1;
            continue;
        }

        match input[i + 1] {
            b'[' => {
                // CSI: ESC '[' [0-9;?]* <final-letter>
                let mut j = i + 2;
                while j < len && matches!(input[j], b'0'..=b'9' | b';' | b'?') {
                    j += 1;
                }
                if j < len {
                    j += 1; // consume the final letter
                }
                i = j;
            }
            b']' => {
                // OSC: ESC ']' <body> (BEL | ESC '\')
                let mut j = i + 2;
                loop {
                    if j >= len {
                        break;
                    }
                    if input[j] == BEL {
                        j += 1;
                        break;
                    }
                    if input[j] == ESC && j + 1 < len && input[j + 1] == b'\\' {
                        j += 2;
                        break;
                    }
                    j += 1;
                }
                i = j;
            }
            b'(' | b')' => {
                // Charset-shift: ESC ('(' | ')') <alnum>
                let mut j = i + 2;
                if j < len && input[j].is_ascii_alphanumeric() {
                    j += 1;
                }
                i = j;
            }
            b'7' | b'8' | b'c' => {
                // Legacy two-byte escapes.
                i += 2;
            }
            _ => {
                // Unrecognized escape: drop just the ESC byte and resync.
                i += 1;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_color_codes() {
        let input = b"\x1b[1;32mhello\x1b[0m world\r\n";
        assert_eq!(clean(input), b"hello world\r\n");
    }

    #[test]
    fn preserves_tabs_and_newlines() {
        let input = b"a\tb\nc\r\nd";
        assert_eq!(clean(input), input);
    }

    #[test]
    fn drops_standalone_carriage_return() {
        let input = b"progress: 50%\rprogress: 100%\n";
        assert_eq!(clean(input), b"progress: 50%progress: 100%\n");
    }

    #[test]
    fn strips_osc_with_bel_terminator() {
        let input = b"\x1b]0;title\x07rest";
        assert_eq!(clean(input), b"rest");
    }

    #[test]
    fn strips_osc_with_st_terminator() {
        let input = b"\x1b]0;title\x1b\\rest";
        assert_eq!(clean(input), b"rest");
    }

    #[test]
    fn strips_charset_shift() {
        let input = b"\x1b(Bhello";
        assert_eq!(clean(input), b"hello");
    }

    #[test]
    fn strips_legacy_escapes() {
        assert_eq!(clean(b"\x1b7saved\x1b8restored"), b"savedrestored");
        assert_eq!(clean(b"\x1bcreset"), b"reset");
    }

    #[test]
    fn is_idempotent() {
        let input = b"\x1b[31mred\x1b[0m\r\nplain\rtext";
        let once = clean(input);
        let twice = clean(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn preserves_printable_bytes() {
        let input: Vec<u8> = (0x20u8..0x7f).collect();
        assert_eq!(clean(&input), input);
    }
}
