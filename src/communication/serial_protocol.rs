//! Line framing for firmwares that verify instruction integrity.
//!
//! A checksummed instruction is sent as `N<line> <text>*<xor>`, where `<xor>`
//! is the XOR of every byte preceding the `*`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("missing checksum in '{0}'")]
    MissingChecksum(String),
    #[error("malformed checksum '{0}'")]
    MalformedChecksum(String),
    #[error("checksum mismatch in '{0}'")]
    ChecksumMismatch(String),
    #[error("missing instruction in '{0}'")]
    MissingInstruction(String),
    #[error("malformed line number '{0}'")]
    MalformedLineNumber(String),
}

/// XOR checksum over every byte of `data`.
pub fn checksum(data: &str) -> u8 {
    data.bytes().fold(0u8, |acc, b| acc ^ b)
}

/// Numbers and checksums outgoing instructions.
#[derive(Debug, Clone, Default)]
pub struct LineFramer {
    next_line: u64,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Line number the next framed instruction will carry.
    pub fn next_line(&self) -> u64 {
        self.next_line
    }

    /// Restart numbering. The instruction that resets the firmware's counter
    /// must itself be framed with line 0.
    pub fn reset(&mut self) {
        self.next_line = 0;
    }

    /// Frame `text` for transmission; passes it through unchanged when the
    /// device does not support checksums.
    pub fn frame(&mut self, text: &str, checksummed: bool) -> String {
        if !checksummed {
            return text.to_string();
        }
        let body = format!("N{} {}", self.next_line, text.trim());
        self.next_line += 1;
        let sum = checksum(&body);
        format!("{}*{}", body, sum)
    }
}

/// Split a framed line back into `(line_number, text)`, verifying the checksum.
/// Lines without framing are returned with no line number.
pub fn unframe(line: &str) -> Result<(Option<u64>, &str), FrameError> {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('N') else {
        return Ok((None, line));
    };
    let (body, sum) = line
        .rsplit_once('*')
        .ok_or_else(|| FrameError::MissingChecksum(line.to_string()))?;
    let expected: u8 = sum
        .parse()
        .map_err(|_| FrameError::MalformedChecksum(sum.to_string()))?;
    if checksum(body) != expected {
        return Err(FrameError::ChecksumMismatch(line.to_string()));
    }
    let (number, text) = rest
        .split_once(' ')
        .ok_or_else(|| FrameError::MissingInstruction(line.to_string()))?;
    let number: u64 = number
        .parse()
        .map_err(|_| FrameError::MalformedLineNumber(number.to_string()))?;
    let text = text.rsplit_once('*').map(|(t, _)| t).unwrap_or(text);
    Ok((Some(number), text.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_with_line_number_and_xor() {
        let mut framer = LineFramer::new();
        let framed = framer.frame("M110 N0", true);
        assert!(framed.starts_with("N0 M110 N0*"));
        assert_eq!(framer.next_line(), 1);
        let (_, sum) = framed.rsplit_once('*').unwrap();
        assert_eq!(sum.parse::<u8>().unwrap(), checksum("N0 M110 N0"));
    }

    #[test]
    fn passthrough_without_checksum_support() {
        let mut framer = LineFramer::new();
        assert_eq!(framer.frame("G28", false), "G28");
        assert_eq!(framer.next_line(), 0);
    }

    #[test]
    fn unframe_recovers_text() {
        let mut framer = LineFramer::new();
        framer.frame("M110 N0", true);
        let framed = framer.frame("G1 X10 Y20", true);
        assert_eq!(unframe(&framed).unwrap(), (Some(1), "G1 X10 Y20"));
        assert_eq!(unframe("M400").unwrap(), (None, "M400"));
    }

    #[test]
    fn unframe_rejects_corruption() {
        let mut framer = LineFramer::new();
        let framed = framer.frame("G1 X10", true).replace("X10", "X11");
        assert!(matches!(unframe(&framed), Err(FrameError::ChecksumMismatch(_))));
        assert_eq!(
            unframe("N3 G28"),
            Err(FrameError::MissingChecksum("N3 G28".to_string()))
        );
        assert_eq!(
            unframe("N3 G28*x"),
            Err(FrameError::MalformedChecksum("x".to_string()))
        );
    }
}
