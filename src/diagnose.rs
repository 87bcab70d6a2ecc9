//! Root-cause extraction for failed kernel builds.
//!
//! A kernel build log is thousands of lines; the one that explains the
//! failure is usually a compiler diagnostic. The log is scanned once,
//! front to back, against [`BUILD_FAILURE_CAUSES`]:
//!
//! - the first line matching a strong pattern is the title;
//! - otherwise the first line matching a weak pattern is;
//! - otherwise there is no title and the raw error stands.
//!
//! Weak patterns are linker summaries. They follow the real error in a log,
//! so they only count when nothing better is present.

use serde::Serialize;
use std::fmt;

use crate::process::VerboseError;

/// A byte sequence that marks a line as a likely cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticPattern {
    pub pattern: &'static [u8],
    pub weak: bool,
}

/// Ordered by precedence. Earlier entries win when one line matches several.
pub const BUILD_FAILURE_CAUSES: &[DiagnosticPattern] = &[
    DiagnosticPattern {
        pattern: b": error: ",
        weak: false,
    },
    DiagnosticPattern {
        pattern: b": fatal error: ",
        weak: false,
    },
    DiagnosticPattern {
        pattern: b": undefined reference to",
        weak: false,
    },
    DiagnosticPattern {
        pattern: b": final link failed: ",
        weak: true,
    },
    DiagnosticPattern {
        pattern: b"collect2: error: ",
        weak: true,
    },
];

/// Pick the line most likely to explain a build failure.
pub fn extract_root_cause(output: &[u8]) -> Option<String> {
    locate(output, BUILD_FAILURE_CAUSES).map(|found| found.text())
}

/// A log line picked as the root cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Found<'a> {
    /// 0-based line index.
    index: usize,
    line: &'a [u8],
    weak: bool,
}

impl Found<'_> {
    fn text(&self) -> String {
        String::from_utf8_lossy(self.line).into_owned()
    }
}

fn locate<'a>(output: &'a [u8], patterns: &[DiagnosticPattern]) -> Option<Found<'a>> {
    let mut fallback = None;
    for (index, line) in output.split(|&b| b == b'\n').enumerate() {
        match classify(line, patterns) {
            Some(cause) if !cause.weak => {
                return Some(Found {
                    index,
                    line,
                    weak: false,
                });
            }
            Some(_) if fallback.is_none() => {
                fallback = Some(Found {
                    index,
                    line,
                    weak: true,
                })
            }
            _ => {}
        }
    }
    fallback
}

/// The pattern a line counts under, if any.
///
/// Weak markers are linker summaries that also contain the generic
/// `": error: "` marker, so a weak match decides the line.
fn classify<'p>(line: &[u8], patterns: &'p [DiagnosticPattern]) -> Option<&'p DiagnosticPattern> {
    let mut matched = None;
    for cause in patterns {
        if !contains(line, cause.pattern) {
            continue;
        }
        if cause.weak {
            return Some(cause);
        }
        matched.get_or_insert(cause);
    }
    matched
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    needle.is_empty() || haystack.windows(needle.len()).any(|w| w == needle)
}

/// A compilation failure, annotated with its root cause when one was found.
#[derive(Debug, Clone)]
pub struct BuildFailure {
    raw: VerboseError,
    title: Option<String>,
}

impl BuildFailure {
    /// Scan the failure's output and attach the extracted title, if any.
    pub fn diagnose(raw: VerboseError) -> Self {
        let title = extract_root_cause(raw.output());
        Self { raw, title }
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn raw(&self) -> &VerboseError {
        &self.raw
    }

    pub fn full_output(&self) -> &[u8] {
        self.raw.output()
    }
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.title {
            Some(title) => write!(f, "{}", title),
            None => write!(f, "{}", self.raw),
        }
    }
}

impl std::error::Error for BuildFailure {}

/// Machine-readable summary of a diagnosed log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnosis {
    pub title: Option<String>,
    /// 1-based line number of the title within the log.
    pub line: Option<usize>,
    pub weak: bool,
}

impl Diagnosis {
    pub fn of(output: &[u8]) -> Self {
        match locate(output, BUILD_FAILURE_CAUSES) {
            Some(found) => Self {
                title: Some(found.text()),
                line: Some(found.index + 1),
                weak: found.weak,
            },
            None => Self {
                title: None,
                line: None,
                weak: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(s: &str) -> Option<String> {
        extract_root_cause(s.as_bytes())
    }

    #[test]
    fn test_compiler_error_line() {
        assert_eq!(
            extract("foo.c:10:5: error: expected ';'\n").as_deref(),
            Some("foo.c:10:5: error: expected ';'")
        );
    }

    #[test]
    fn test_collect2_alone() {
        assert_eq!(
            extract("collect2: error: ld returned 1 exit status\n").as_deref(),
            Some("collect2: error: ld returned 1 exit status")
        );
    }

    #[test]
    fn test_strong_beats_earlier_and_later_weak() {
        let log = "  CC      kernel/fork.o\n\
                   ld: vmlinux.o: final link failed: bad value\n\
                   kernel/fork.c:12:3: error: unknown type name 'foo'\n\
                   collect2: error: ld returned 1 exit status\n\
                   make: *** [Makefile:1077: vmlinux] Error 1\n";
        assert_eq!(
            extract(log).as_deref(),
            Some("kernel/fork.c:12:3: error: unknown type name 'foo'")
        );
    }

    #[test]
    fn test_first_strong_wins() {
        let log = "a.c:1:1: fatal error: a.h: No such file or directory\n\
                   b.c:2:2: error: second\n";
        assert_eq!(
            extract(log).as_deref(),
            Some("a.c:1:1: fatal error: a.h: No such file or directory")
        );
    }

    #[test]
    fn test_weak_only() {
        let log = "  LD      vmlinux\nld: final.o: final link failed: nonrepresentable section\nmake: *** Error 1\n";
        assert_eq!(
            extract(log).as_deref(),
            Some("ld: final.o: final link failed: nonrepresentable section")
        );
    }

    #[test]
    fn test_first_weak_wins() {
        let log = "ld: x.o: final link failed: bad value\ncollect2: error: ld returned 1 exit status\n";
        assert_eq!(
            extract(log).as_deref(),
            Some("ld: x.o: final link failed: bad value")
        );
    }

    #[test]
    fn test_undefined_reference() {
        let log = "  LD      vmlinux.o\nmm/slab.o: in function `f':\nslab.c:(.text+0x1): undefined reference to `g'\n";
        assert_eq!(
            extract(log).as_deref(),
            Some("slab.c:(.text+0x1): undefined reference to `g'")
        );
    }

    #[test]
    fn test_no_match() {
        assert_eq!(extract("make: *** [Makefile:1] Error 2\n"), None);
        assert_eq!(extract(""), None);
    }

    #[test]
    fn test_warnings_are_not_causes() {
        assert_eq!(extract("foo.c:1:1: warning: unused variable 'x'\n"), None);
    }

    #[test]
    fn test_last_line_without_newline() {
        assert_eq!(
            extract("x\nbar.c:3:1: error: truncated").as_deref(),
            Some("bar.c:3:1: error: truncated")
        );
    }

    #[test]
    fn test_non_utf8_output() {
        let mut log = b"\xff\xfe garbage\n".to_vec();
        log.extend_from_slice(b"q.c:1:1: error: bad \xff byte\n");
        let title = extract_root_cause(&log).unwrap();
        assert!(title.starts_with("q.c:1:1: error: bad "));
    }

    #[test]
    fn test_collect2_is_weak_despite_error_marker() {
        let line = b"collect2: error: ld returned 1 exit status";
        let cause = classify(line, BUILD_FAILURE_CAUSES).unwrap();
        assert!(cause.weak);
    }

    #[test]
    fn test_table_order() {
        let strong: Vec<_> = BUILD_FAILURE_CAUSES.iter().filter(|c| !c.weak).collect();
        assert_eq!(strong.len(), 3);
        assert_eq!(BUILD_FAILURE_CAUSES[0].pattern, b": error: ");
        assert!(BUILD_FAILURE_CAUSES[3].weak && BUILD_FAILURE_CAUSES[4].weak);
    }

    #[test]
    fn test_diagnosis_report() {
        let d = Diagnosis::of(b"one\ncollect2: error: ld returned 1 exit status\n");
        assert_eq!(d.line, Some(2));
        assert!(d.weak);

        let d = Diagnosis::of(b"a.c:1:1: error: x\n");
        assert_eq!(d.line, Some(1));
        assert!(!d.weak);

        assert_eq!(
            Diagnosis::of(b"nothing here\n"),
            Diagnosis {
                title: None,
                line: None,
                weak: false
            }
        );
    }

    #[test]
    fn test_diagnosis_line_for_non_utf8_title() {
        let log = b"  CC      drivers/x.o\ndrivers/x.c:3:1: error: stray '\xff' in program\n";
        let d = Diagnosis::of(log);
        assert_eq!(d.line, Some(2));
        assert!(!d.weak);
        assert!(d.title.unwrap().contains('\u{FFFD}'));
    }

    #[test]
    fn test_diagnosis_line_is_first_of_duplicates() {
        let log = b"a.c:1:1: error: x\nfoo\na.c:1:1: error: x\n";
        assert_eq!(Diagnosis::of(log).line, Some(1));
    }
}
