//! Instrumentation-log analysis.
//!
//! Scans the free-text log emitted by the memory/descriptor instrumentation
//! tool (valgrind with `--track-fds=yes --leak-check=full`) for leaked
//! descriptors and leaked memory. Lines are first tokenized into typed
//! records under a configurable [`MarkerGrammar`], then the
//! inherited-lookahead and leak-summary policies run over the records, so
//! detection logic stays testable independent of the tool's exact wording.

use serde::{Deserialize, Serialize};

/// The text markers the analyzer recognizes.
///
/// Defaults match current valgrind output. The grammar is plain data so a
/// different tool version (or tool) is a config edit, not a code change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkerGrammar {
    /// A line opening a descriptor report must contain this...
    pub open_prefix: String,
    /// ...and at least one of these resource kinds.
    pub open_kinds: Vec<String>,
    /// Annotation excusing an open descriptor (printed on a later line).
    pub inherited: String,
    /// How many subsequent lines to search for the inherited annotation.
    pub lookahead_lines: usize,
    /// Summary marker meaning no heap was leaked at all.
    pub all_freed: String,
    /// Leak counter categories that must each read zero.
    pub leak_categories: Vec<String>,
    /// The zero-valued counter text expected after `<category>: `.
    pub zero_counter: String,
}

impl Default for MarkerGrammar {
    fn default() -> Self {
        Self {
            open_prefix: "Open".to_string(),
            open_kinds: vec!["file descriptor".to_string(), "socket".to_string()],
            inherited: "<inherited from parent>".to_string(),
            lookahead_lines: 5,
            all_freed: "All heap blocks were freed".to_string(),
            leak_categories: vec![
                "definitely lost".to_string(),
                "indirectly lost".to_string(),
            ],
            zero_counter: "0 bytes in 0 blocks".to_string(),
        }
    }
}

/// One tokenized log line of interest. Lines matching nothing are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    OpenResource { line: usize, raw: String },
    InheritedAnnotation { line: usize },
    LeakCounter { line: usize, category: String, raw: String, zero: bool },
    AllFreed { line: usize },
}

/// Kind of problem (or excused non-problem) found in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    OpenDescriptor,
    LeakSummary,
}

/// A single analysis finding. Inherited descriptor findings are retained
/// for diagnostics but excluded from failure.
#[derive(Debug, Clone)]
pub struct LogFinding {
    pub kind: FindingKind,
    pub inherited: bool,
    pub raw: String,
}

/// Result of analyzing one instrumentation log.
#[derive(Debug, Clone, Default)]
pub struct LogAnalysis {
    pub findings: Vec<LogFinding>,
}

impl LogAnalysis {
    /// Open descriptors not marked inherited: these fail the scenario.
    pub fn descriptor_leaks(&self) -> Vec<&LogFinding> {
        self.findings
            .iter()
            .filter(|f| f.kind == FindingKind::OpenDescriptor && !f.inherited)
            .collect()
    }

    /// Non-zero (or missing) leak counters: these fail the scenario.
    pub fn memory_leaks(&self) -> Vec<&LogFinding> {
        self.findings
            .iter()
            .filter(|f| f.kind == FindingKind::LeakSummary)
            .collect()
    }

    pub fn is_clean(&self) -> bool {
        self.descriptor_leaks().is_empty() && self.memory_leaks().is_empty()
    }
}

/// Strip valgrind's `==pid==` line prefix, if present.
fn strip_pid_prefix(line: &str) -> &str {
    let trimmed = line.trim_start();
    if let Some(rest) = trimmed.strip_prefix("==") {
        if let Some(end) = rest.find("==") {
            if rest[..end].chars().all(|c| c.is_ascii_digit()) && !rest[..end].is_empty() {
                return rest[end + 2..].trim_start();
            }
        }
    }
    trimmed
}

/// Tokenize the log into typed records.
pub fn tokenize(log: &str, grammar: &MarkerGrammar) -> Vec<LogRecord> {
    let mut records = Vec::new();
    for (line_no, raw_line) in log.lines().enumerate() {
        let line = strip_pid_prefix(raw_line);
        if line.contains(&grammar.inherited) {
            records.push(LogRecord::InheritedAnnotation { line: line_no });
            continue;
        }
        if line.contains(&grammar.all_freed) {
            records.push(LogRecord::AllFreed { line: line_no });
            continue;
        }
        if line.contains(&grammar.open_prefix)
            && grammar.open_kinds.iter().any(|kind| line.contains(kind))
        {
            records.push(LogRecord::OpenResource {
                line: line_no,
                raw: line.to_string(),
            });
            continue;
        }
        for category in &grammar.leak_categories {
            if let Some(idx) = line.find(category.as_str()) {
                let counter = &line[idx + category.len()..];
                let zero = counter
                    .trim_start_matches(':')
                    .trim_start()
                    .starts_with(&grammar.zero_counter);
                records.push(LogRecord::LeakCounter {
                    line: line_no,
                    category: category.clone(),
                    raw: line.to_string(),
                    zero,
                });
                break;
            }
        }
    }
    records
}

/// Analyze an instrumentation log.
///
/// Open-resource records are excused when an inherited annotation appears
/// within the lookahead window (benign terminal/log handles passed down by
/// the launcher must not cause false failures). Leak counters are not
/// consulted at all when the all-freed marker is present; otherwise every
/// configured category must report a zero counter.
pub fn analyze(log: &str, grammar: &MarkerGrammar) -> LogAnalysis {
    let records = tokenize(log, grammar);
    let mut findings = Vec::new();

    let inherited_lines: Vec<usize> = records
        .iter()
        .filter_map(|r| match r {
            LogRecord::InheritedAnnotation { line } => Some(*line),
            _ => None,
        })
        .collect();

    for record in &records {
        if let LogRecord::OpenResource { line, raw } = record {
            let window_end = line + grammar.lookahead_lines;
            let inherited = inherited_lines
                .iter()
                .any(|&ann| ann > *line && ann <= window_end);
            findings.push(LogFinding {
                kind: FindingKind::OpenDescriptor,
                inherited,
                raw: raw.clone(),
            });
        }
    }

    let all_freed = records
        .iter()
        .any(|r| matches!(r, LogRecord::AllFreed { .. }));
    if !all_freed {
        for category in &grammar.leak_categories {
            let counter = records.iter().find_map(|r| match r {
                LogRecord::LeakCounter { category: c, raw, zero, .. } if c == category => {
                    Some((raw.clone(), *zero))
                }
                _ => None,
            });
            match counter {
                Some((_, true)) => {}
                Some((raw, false)) => findings.push(LogFinding {
                    kind: FindingKind::LeakSummary,
                    inherited: false,
                    raw,
                }),
                None => findings.push(LogFinding {
                    kind: FindingKind::LeakSummary,
                    inherited: false,
                    raw: format!("no \"{category}\" counter in log"),
                }),
            }
        }
    }

    LogAnalysis { findings }
}
