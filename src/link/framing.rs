/// Output of [`LineFramer::push`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramedLine {
    Line(String),
    /// A line longer than the limit was discarded; carries the bytes seen
    Oversized(usize),
}

/// Splits a byte stream into `\n`-terminated lines.
///
/// Partial lines are kept until the next read. A trailing `\r` is stripped and
/// invalid UTF-8 is replaced. Blank lines are skipped.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_line_bytes: usize,
    /// Bytes of an oversized line dropped so far; skip until the next newline
    discarding: Option<usize>,
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_line_bytes.min(4_096)),
            max_line_bytes: max_line_bytes.max(1),
            discarding: None,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<FramedLine> {
        let mut out = Vec::new();
        let mut rest = bytes;

        while !rest.is_empty() {
            let newline = rest.iter().position(|&b| b == b'\n');
            let (chunk, terminated) = match newline {
                Some(i) => (&rest[..i], true),
                None => (rest, false),
            };
            rest = match newline {
                Some(i) => &rest[i + 1..],
                None => &[],
            };

            if let Some(dropped) = self.discarding.as_mut() {
                *dropped += chunk.len();
                if terminated {
                    out.push(FramedLine::Oversized(*dropped));
                    self.discarding = None;
                }
                continue;
            }

            if self.buf.len() + chunk.len() > self.max_line_bytes {
                let dropped = self.buf.len() + chunk.len();
                self.buf.clear();
                if terminated {
                    out.push(FramedLine::Oversized(dropped));
                } else {
                    self.discarding = Some(dropped);
                }
                continue;
            }

            self.buf.extend_from_slice(chunk);
            if terminated {
                if let Some(line) = self.take_line() {
                    out.push(FramedLine::Line(line));
                }
            }
        }

        out
    }

    fn take_line(&mut self) -> Option<String> {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        if line.is_empty() {
            None
        } else {
            Some(line)
        }
    }

    /// Bytes of the current unterminated line
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(out: Vec<FramedLine>) -> Vec<String> {
        out.into_iter()
            .filter_map(|f| match f {
                FramedLine::Line(l) => Some(l),
                FramedLine::Oversized(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_partial_lines_carry_across_reads() {
        let mut framer = LineFramer::new(128);
        assert!(framer.push(b"DATA,1,10,0.").is_empty());
        assert_eq!(framer.pending(), 12);
        let out = lines(framer.push(b"5,12.0,0.3\r\nDATA,2"));
        assert_eq!(out, vec!["DATA,1,10,0.5,12.0,0.3"]);
        let out = lines(framer.push(b",20,1.0,12.0,0.3\n"));
        assert_eq!(out, vec!["DATA,2,20,1.0,12.0,0.3"]);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_blank_lines_skipped() {
        let mut framer = LineFramer::new(128);
        assert_eq!(lines(framer.push(b"\n\r\n  \nACK:START\n")), vec!["ACK:START"]);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut framer = LineFramer::new(128);
        let out = lines(framer.push(b"STATUS:\xff\xfeOK\n"));
        assert_eq!(out.len(), 1);
        assert!(out[0].starts_with("STATUS:"));
        assert!(out[0].ends_with("OK"));
    }

    #[test]
    fn test_oversized_line_discarded_until_newline() {
        let mut framer = LineFramer::new(16);
        assert!(framer.push(b"0123456789").is_empty());
        assert!(framer.push(b"0123456789").is_empty());
        assert!(framer.push(b"more junk").is_empty());
        let out = framer.push(b"tail\nACK:OK\n");
        assert_eq!(out[0], FramedLine::Oversized(33));
        assert_eq!(out[1], FramedLine::Line("ACK:OK".to_string()));
    }

    #[test]
    fn test_oversized_terminated_line() {
        let mut framer = LineFramer::new(4);
        let out = framer.push(b"toolong\nok\n");
        assert_eq!(out, vec![FramedLine::Oversized(7), FramedLine::Line("ok".to_string())]);
    }
}
