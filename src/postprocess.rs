//! Orders raw trace lines and persists them.

use std::{fs, path::Path};

use rayon::prelude::*;
use tracing::info;

use crate::{
    error::TraceError,
    trace::{TraceEvent, TraceLog},
};

/// Leading numeric field of a trace line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimestampKey {
    Integer(u64),
    Float(f64),
}

impl TimestampKey {
    pub fn as_f64(&self) -> f64 {
        match self {
            TimestampKey::Integer(v) => *v as f64,
            TimestampKey::Float(v) => *v,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, TimestampKey::Float(_))
    }
}

/// Parses the field before the first comma as an integer, falling back to a finite float.
pub fn parse_timestamp(line: &str) -> Option<TimestampKey> {
    let (field, _) = line.split_once(',')?;
    let field = field.trim();
    if let Ok(v) = field.parse::<u64>() {
        return Some(TimestampKey::Integer(v));
    }
    field
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .map(TimestampKey::Float)
}

/// Stable ascending sort on the leading numeric field. Fails on the first (lowest line
/// number) unparsable line.
///
/// Integer keys compare exactly. Once any key is a float, every key compares as `f64`,
/// so integers above 2^53 may tie and keep their input order.
pub fn sort_lines<S: AsRef<str> + Sync>(lines: &[S]) -> Result<Vec<String>, TraceError> {
    let parsed: Vec<Result<(TimestampKey, &str), TraceError>> = lines
        .par_iter()
        .enumerate()
        .map(|(i, line)| {
            let line = line.as_ref();
            parse_timestamp(line)
                .map(|key| (key, line))
                .ok_or_else(|| TraceError::Malformed {
                    line: i + 1,
                    content: line.to_string(),
                })
        })
        .collect();
    let mut keyed = parsed.into_iter().collect::<Result<Vec<_>, _>>()?;
    let exact = !keyed.iter().any(|(key, _)| key.is_float());
    keyed.sort_by(|(a, _), (b, _)| match (a, b) {
        (TimestampKey::Integer(x), TimestampKey::Integer(y)) if exact => x.cmp(y),
        _ => a.as_f64().total_cmp(&b.as_f64()),
    });
    Ok(keyed.into_iter().map(|(_, line)| line.to_string()).collect())
}

/// Replaces `dest` with the newline-joined lines (no trailing newline).
pub fn write_lines(lines: &[String], dest: impl AsRef<Path>) -> Result<(), TraceError> {
    fs::write(dest, lines.join("\n"))?;
    Ok(())
}

fn sort_and_write(lines: &[String], dest: &Path) -> Result<Vec<String>, TraceError> {
    let sorted = sort_lines(lines)?;
    info!("number of traces collected: {}", sorted.len());
    write_lines(&sorted, dest)?;
    Ok(sorted)
}

/// Sorts a finished session's events and writes them to `dest`. Nothing is written
/// if any line fails to parse.
pub fn process(log: &TraceLog, dest: impl AsRef<Path>) -> Result<Vec<String>, TraceError> {
    sort_and_write(&log.lines(), dest.as_ref())
}

/// Same as [`process`] for raw newline-separated text. Blank lines are skipped.
pub fn process_text(raw: &str, dest: impl AsRef<Path>) -> Result<Vec<String>, TraceError> {
    let lines: Vec<String> = raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .collect();
    sort_and_write(&lines, dest.as_ref())
}

/// Reads a persisted trace back. Float timestamps are truncated to whole units and
/// `seq` is the line position.
pub fn read_trace(path: impl AsRef<Path>) -> Result<Vec<TraceEvent>, TraceError> {
    let text = fs::read_to_string(path)?;
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            let malformed = || TraceError::Malformed {
                line: i + 1,
                content: line.to_string(),
            };
            let key = parse_timestamp(line).ok_or_else(malformed)?;
            let (_, label) = line.split_once(',').ok_or_else(malformed)?;
            let timestamp = match key {
                TimestampKey::Integer(v) => v,
                TimestampKey::Float(v) => v.max(0.0) as u64,
            };
            Ok(TraceEvent {
                timestamp,
                seq: i as u64,
                label: label.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("12,a"), Some(TimestampKey::Integer(12)));
        assert_eq!(parse_timestamp("1.5,a"), Some(TimestampKey::Float(1.5)));
        assert_eq!(parse_timestamp("abc,label"), None);
        assert_eq!(parse_timestamp("12"), None);
        assert_eq!(parse_timestamp("NaN,x"), None);
        assert_eq!(parse_timestamp(",x"), None);
    }

    #[test]
    fn test_sort_is_stable_on_ties() {
        let lines = ["5,b", "3,a", "5,c", "3,d", "4,e"];
        assert_eq!(
            sort_lines(&lines).unwrap(),
            vec!["3,a", "3,d", "4,e", "5,b", "5,c"]
        );
    }

    #[test]
    fn test_sort_is_idempotent() {
        let lines = ["10,x", "2,y", "2.5,z", "2,w", "1e1,v"];
        let once = sort_lines(&lines).unwrap();
        let twice = sort_lines(&once).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, vec!["2,y", "2,w", "2.5,z", "10,x", "1e1,v"]);
    }

    #[test]
    fn test_large_integers_exact_without_floats() {
        let lines = ["9007199254740993,a", "9007199254740992,b", "1,c"];
        assert_eq!(
            sort_lines(&lines).unwrap(),
            vec!["1,c", "9007199254740992,b", "9007199254740993,a"]
        );
    }

    #[test]
    fn test_large_integers_mixed_with_floats() {
        // 2^53 + 1 and 2^53 share an f64, so they tie and keep input order.
        let lines = [
            "9007199254740993,a",
            "9007199254740992.0,b",
            "9007199254740992,c",
            "0.5,d",
            "9007199254740994,e",
        ];
        let once = sort_lines(&lines).unwrap();
        assert_eq!(
            once,
            vec![
                "0.5,d",
                "9007199254740993,a",
                "9007199254740992.0,b",
                "9007199254740992,c",
                "9007199254740994,e",
            ]
        );
        assert_eq!(sort_lines(&once).unwrap(), once);
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        let lines = ["100,a", "20,b", "3,c"];
        assert_eq!(sort_lines(&lines).unwrap(), vec!["3,c", "20,b", "100,a"]);
    }

    #[test]
    fn test_malformed_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("trace.log");
        let err = process_text("1,ok\nabc,label\n2,ok", &dest).unwrap_err();
        assert!(matches!(err, TraceError::Malformed { line: 2, .. }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_first_malformed_line_reported() {
        let lines = ["x,1", "1,ok", "y,2"];
        assert!(matches!(
            sort_lines(&lines),
            Err(TraceError::Malformed { line: 1, content }) if content == "x,1"
        ));
    }

    #[test]
    fn test_write_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("trace.log");
        fs::write(&dest, "999,stale line that is much longer than the new content\n").unwrap();
        let log: TraceLog = vec![
            TraceEvent {
                timestamp: 7,
                seq: 0,
                label: "forward end fc".to_string(),
            },
            TraceEvent {
                timestamp: 3,
                seq: 1,
                label: "forward start fc".to_string(),
            },
        ]
        .into_iter()
        .collect();
        let sorted = process(&log, &dest).unwrap();
        assert_eq!(sorted, vec!["3,forward start fc", "7,forward end fc"]);
        assert_eq!(
            fs::read_to_string(&dest).unwrap(),
            "3,forward start fc\n7,forward end fc"
        );
    }

    #[test]
    fn test_empty_log_writes_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("trace.log");
        assert!(process(&TraceLog::default(), &dest).unwrap().is_empty());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "");
    }

    #[test]
    fn test_read_trace() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("trace.log");
        fs::write(&dest, "1,forward start a\n2.9,forward end a\n").unwrap();
        let events = read_trace(&dest).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].timestamp, 2);
        assert_eq!(events[1].label, "forward end a");
        assert_eq!(events[1].parsed_label().unwrap().layer, "a");
    }
}
