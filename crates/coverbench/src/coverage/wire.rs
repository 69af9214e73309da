//! Fork agent stdout protocol.
//!
//! On success the agent prints [`COVERAGE_INDICATOR`] on a line of its own,
//! followed by one JSON document:
//!
//! ```text
//! #COVERBENCH-COVERAGE#
//! {"src/max.rs":[[3,4],[5],[7]]}
//! ```
//!
//! Each file maps to `[full, partial, not]`. Anything the test printed
//! before the indicator is ignored.

use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use super::{CoverageInfo, FileCoverage};
use crate::result::AgentFailure;

/// Line that introduces the coverage document
pub const COVERAGE_INDICATOR: &str = "#COVERBENCH-COVERAGE#";

type WireFile = (Vec<u32>, Vec<u32>, Vec<u32>);

impl Serialize for CoverageInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire: BTreeMap<&str, WireFile> = self
            .files()
            .map(|(file, c)| {
                (
                    file,
                    (
                        c.full.iter().copied().collect(),
                        c.partial.iter().copied().collect(),
                        c.not.iter().copied().collect(),
                    ),
                )
            })
            .collect();
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CoverageInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = BTreeMap::<String, WireFile>::deserialize(deserializer)?;
        let mut coverage = Self::new();
        for (file, (full, partial, not)) in wire {
            coverage.insert_file(
                file,
                FileCoverage {
                    full: full.into_iter().collect(),
                    partial: partial.into_iter().collect(),
                    not: not.into_iter().collect(),
                },
            );
        }
        Ok(coverage)
    }
}

/// Write the indicator line and the coverage document
pub fn write_agent_output<W: Write>(out: &mut W, coverage: &CoverageInfo) -> io::Result<()> {
    writeln!(out, "{COVERAGE_INDICATOR}")?;
    serde_json::to_writer(&mut *out, coverage)?;
    writeln!(out)?;
    out.flush()
}

/// Extract the coverage document from an agent's stdout.
///
/// The last indicator line wins, so test output that happens to contain the
/// indicator cannot shadow the real document.
pub fn parse_agent_stdout(stdout: &str) -> Result<CoverageInfo, AgentFailure> {
    let mut document = None;
    let mut rest = stdout;
    while let Some(pos) = rest.find(COVERAGE_INDICATOR) {
        let at_line_start = pos == 0 || rest[..pos].ends_with('\n');
        let after = &rest[pos + COVERAGE_INDICATOR.len()..];
        let line_end = after.strip_prefix("\r\n").or_else(|| after.strip_prefix('\n'));
        if let (true, Some(body)) = (at_line_start, line_end) {
            document = Some(body);
        }
        rest = after;
    }
    let document = document.ok_or(AgentFailure::MissingIndicator)?;
    serde_json::from_str(document.trim()).map_err(|e| AgentFailure::MalformedCoverage {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::LineStatus;

    fn sample() -> CoverageInfo {
        let mut coverage = CoverageInfo::new();
        coverage.record("src/a.rs", 1, LineStatus::FullyCovered);
        coverage.record("src/a.rs", 2, LineStatus::PartlyCovered);
        coverage.record("src/a.rs", 3, LineStatus::NotCovered);
        coverage
    }

    #[test]
    fn test_document_shape() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert_eq!(json, r#"{"src/a.rs":[[1],[2],[3]]}"#);
    }

    #[test]
    fn test_deserialize_cleans_overlaps() {
        let coverage: CoverageInfo = serde_json::from_str(r#"{"f":[[1,2],[2,3],[3,4]]}"#).unwrap();
        let file = coverage.file("f").unwrap();
        assert_eq!(file.full.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(file.partial.iter().copied().collect::<Vec<_>>(), vec![3]);
        assert_eq!(file.not.iter().copied().collect::<Vec<_>>(), vec![4]);
    }

    #[test]
    fn test_parse_skips_test_output() {
        let mut out = b"hello from the test\n".to_vec();
        write_agent_output(&mut out, &sample()).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(parse_agent_stdout(&text).unwrap(), sample());
    }

    #[test]
    fn test_last_indicator_wins() {
        let text = format!("{COVERAGE_INDICATOR}\n{{}}\n{COVERAGE_INDICATOR}\n{{\"x\":[[9],[],[]]}}\n");
        let coverage = parse_agent_stdout(&text).unwrap();
        assert_eq!(coverage.status("x", 9), LineStatus::FullyCovered);
    }

    #[test]
    fn test_missing_indicator() {
        assert_eq!(parse_agent_stdout("{}"), Err(AgentFailure::MissingIndicator));
        let inline = format!("text {COVERAGE_INDICATOR}\n{{}}");
        assert_eq!(parse_agent_stdout(&inline), Err(AgentFailure::MissingIndicator));
    }

    #[test]
    fn test_malformed_document() {
        let text = format!("{COVERAGE_INDICATOR}\nnot json\n");
        assert!(matches!(
            parse_agent_stdout(&text),
            Err(AgentFailure::MalformedCoverage { .. })
        ));
    }
}
