//! Position report parsing.
//!
//! A report carries four fields introduced by `X:`, `Y:`, `Z:` and `E:`, each
//! followed by an optionally signed decimal number. Fields may be separated by
//! arbitrary text; the first occurrence of each marker wins, so trailing
//! stepper counts (`Count X:800 ...`) are ignored.

use forge_shared::Position;
use forge_shared::config::AxisOffsets;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TelemetryError {
    #[error("position report missing {0} field")]
    MissingField(char),
    #[error("malformed {axis} value in position report: '{text}'")]
    Malformed { axis: char, text: String },
}

const AXES: [char; 4] = ['X', 'Y', 'Z', 'E'];

/// Parse a position report. `Ok(None)` when the line is not a report at all
/// (carries no `X:` marker); an error when it is one but incomplete or malformed.
pub fn parse_position(line: &str) -> Result<Option<Position>, TelemetryError> {
    let bytes = line.as_bytes();
    let mut fields: [Option<f64>; 4] = [None; 4];
    let mut i = 0;
    while i + 1 < bytes.len() && fields.iter().any(Option::is_none) {
        let slot = AXES.iter().position(|&a| a as u8 == bytes[i]);
        let at_boundary = i == 0 || !bytes[i - 1].is_ascii_alphabetic();
        match slot {
            Some(slot) if bytes[i + 1] == b':' && at_boundary && fields[slot].is_none() => {
                let start = i + 2;
                let end = scan_number(bytes, start);
                let text = &line[start..end];
                let value = text.parse::<f64>().map_err(|_| TelemetryError::Malformed {
                    axis: AXES[slot],
                    text: token_at(line, start),
                })?;
                fields[slot] = Some(value);
                i = end.max(start);
            }
            _ => i += 1,
        }
    }
    if fields[0].is_none() {
        return Ok(None);
    }
    let mut values = [0.0; 4];
    for (slot, field) in fields.iter().enumerate() {
        values[slot] = field.ok_or(TelemetryError::MissingField(AXES[slot]))?;
    }
    Ok(Some(Position {
        x: values[0],
        y: values[1],
        z: values[2],
        e: values[3],
    }))
}

/// End index of an optionally signed decimal starting at `start`.
fn scan_number(bytes: &[u8], start: usize) -> usize {
    let mut end = start;
    if end < bytes.len() && (bytes[end] == b'-' || bytes[end] == b'+') {
        end += 1;
    }
    let mut seen_dot = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            b'.' if !seen_dot => {
                seen_dot = true;
                end += 1;
            }
            _ => break,
        }
    }
    end
}

fn token_at(line: &str, start: usize) -> String {
    line[start..].split_whitespace().next().unwrap_or("").to_string()
}

/// Convert a reported position into the device's own frame.
pub fn apply_offsets(position: Position, offsets: &AxisOffsets) -> Position {
    Position {
        x: position.x - offsets.x,
        y: position.y - offsets.y,
        z: position.z - offsets.z,
        e: position.e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_report() {
        let p = parse_position("X:10.5 Y:-2.0 Z:5.0 E:100.25").unwrap().unwrap();
        assert_eq!(p, Position { x: 10.5, y: -2.0, z: 5.0, e: 100.25 });
    }

    #[test]
    fn ignores_trailing_counts() {
        let p = parse_position("X:1.00 Y:2.00 Z:3.00 E:4.00 Count X:800 Y:1600 Z:12000")
            .unwrap()
            .unwrap();
        assert_eq!(p, Position { x: 1.0, y: 2.0, z: 3.0, e: 4.0 });
    }

    #[test]
    fn accepts_interleaved_text() {
        let p = parse_position("ok C: X:+1 foo Y:2.5Z:-0.4 bar E:7").unwrap().unwrap();
        assert_eq!(p, Position { x: 1.0, y: 2.5, z: -0.4, e: 7.0 });
    }

    #[test]
    fn non_reports_are_not_errors() {
        assert_eq!(parse_position("ok").unwrap(), None);
        assert_eq!(parse_position("T:210.0 /210.0 B:60.0 /60.0").unwrap(), None);
        assert_eq!(parse_position("echo:busy: processing").unwrap(), None);
    }

    #[test]
    fn missing_field_is_explicit() {
        assert_eq!(parse_position("X:1 Y:2 Z:3"), Err(TelemetryError::MissingField('E')));
    }

    #[test]
    fn malformed_number_is_explicit() {
        let err = parse_position("X:abc Y:2 Z:3 E:4").unwrap_err();
        assert_eq!(err, TelemetryError::Malformed { axis: 'X', text: "abc".to_string() });
        assert!(parse_position("X:- Y:2 Z:3 E:4").is_err());
    }

    #[test]
    fn markers_inside_words_are_ignored() {
        let p = parse_position("INDEX:9 X:1 Y:2 Z:3 E:4").unwrap().unwrap();
        assert_eq!(p.x, 1.0);
    }

    #[test]
    fn offsets_apply_to_xyz_only() {
        let offsets = AxisOffsets { x: 1.0, y: -1.0, z: 0.5 };
        let p = apply_offsets(Position { x: 10.0, y: 10.0, z: 5.5, e: 3.0 }, &offsets);
        assert_eq!(p, Position { x: 9.0, y: 11.0, z: 5.0, e: 3.0 });
    }
}
