//! Writing recorded fixtures back into test sources
//!
//! A test written with the `"with http recorded and injected"` marker records
//! its traffic once; the fixture is then spliced into the source in place of
//! the marker so the next run mocks instead. Edits are buffered per file and
//! written in one pass by [`InjectionLedger::apply`].

use std::panic::Location;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::InjectionConfig;
use crate::message::Fixture;
use crate::Result;

/// Marker literal replaced by a recorded fixture
pub const RECORD_AND_INJECT_MARKER: &str = "with http recorded and injected";

/// Literal that replaces the marker
pub const MOCKED_OUT_MARKER: &str = "with http mocked out";

/// Where a recording was started from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callsite {
    /// Source file
    pub file: PathBuf,
    /// 1-based line
    pub line: u32,
}

impl Callsite {
    /// The location of the caller
    #[track_caller]
    pub fn caller() -> Self {
        let location = Location::caller();
        Self {
            file: PathBuf::from(location.file()),
            line: location.line(),
        }
    }
}

/// One buffered source edit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInjection {
    /// Byte position of the replaced text
    pub pos: usize,
    /// Length of the replaced text
    pub len: usize,
    /// Text inserted instead
    pub replacement: String,
}

/// Buffered source edits, keyed by file
#[derive(Debug)]
pub struct InjectionLedger {
    sources: DashMap<PathBuf, Arc<str>>,
    injections: DashMap<PathBuf, Vec<PendingInjection>>,
    indent_width: usize,
}

impl Default for InjectionLedger {
    fn default() -> Self {
        Self::new(&InjectionConfig::default())
    }
}

impl InjectionLedger {
    /// Create an empty ledger
    pub fn new(config: &InjectionConfig) -> Self {
        Self {
            sources: DashMap::new(),
            injections: DashMap::new(),
            indent_width: config.indent_width,
        }
    }

    /// Number of buffered edits
    pub fn pending(&self) -> usize {
        self.injections.iter().map(|entry| entry.value().len()).sum()
    }

    /// Buffer the replacement of the marker found at or after `callsite`.
    ///
    /// Returns `false` when no marker was found; the rendered fixture is then
    /// logged so it can be pasted by hand.
    ///
    /// # Errors
    ///
    /// Returns error if the source cannot be read or the fixture cannot be
    /// rendered
    pub fn record_pending_injection(&self, callsite: &Callsite, fixture: &Fixture) -> Result<bool> {
        let source = self.source(&callsite.file)?;
        let indent_width = detect_indent(&source).unwrap_or(self.indent_width);
        let rendered = fixture.to_pretty_json(indent_width)?;

        let start = line_number_to_index(&source, callsite.line as usize);
        let Some(captures) = marker_pattern().captures_at(&source, start) else {
            warn!(
                "No \"{}\" marker found from {}:{}, recorded fixture:\n{}",
                RECORD_AND_INJECT_MARKER,
                callsite.file.display(),
                callsite.line,
                rendered
            );
            return Ok(false);
        };
        let (Some(whole), Some(indent), Some(prefix)) = (captures.get(0), captures.get(1), captures.get(2))
        else {
            return Ok(false);
        };

        let injection = PendingInjection {
            pos: whole.start(),
            len: whole.len(),
            replacement: render_replacement(indent.as_str(), prefix.as_str(), &rendered),
        };
        debug!(
            "Buffered injection at {}:{} ({} bytes)",
            callsite.file.display(),
            callsite.line,
            injection.replacement.len()
        );

        let mut pending = self.injections.entry(callsite.file.clone()).or_default();
        pending.retain(|existing| existing.pos != injection.pos);
        pending.push(injection);
        Ok(true)
    }

    /// Write every buffered edit, one pass per file, and clear the ledger.
    /// Returns the number of files written.
    ///
    /// # Errors
    ///
    /// Returns error if a file cannot be written
    pub fn apply(&self) -> Result<usize> {
        let files: Vec<PathBuf> = self.injections.iter().map(|entry| entry.key().clone()).collect();
        let mut written = 0;

        for file in files {
            let Some((_, mut injections)) = self.injections.remove(&file) else {
                continue;
            };
            let Some((_, source)) = self.sources.remove(&file) else {
                continue;
            };
            let patched = apply_injections(&source, &mut injections);
            std::fs::write(&file, patched)?;
            info!(
                "Injected {} fixture(s) into {}",
                injections.len(),
                file.display()
            );
            written += 1;
        }

        Ok(written)
    }

    fn source(&self, file: &Path) -> Result<Arc<str>> {
        if let Some(source) = self.sources.get(file) {
            return Ok(Arc::clone(source.value()));
        }
        let source: Arc<str> = std::fs::read_to_string(file)?.into();
        Ok(Arc::clone(
            self.sources
                .entry(file.to_path_buf())
                .or_insert(source)
                .value(),
        ))
    }
}

/// Process-wide ledger, applied by whoever finishes the test run
pub fn ledger() -> &'static InjectionLedger {
    static LEDGER: OnceLock<InjectionLedger> = OnceLock::new();
    LEDGER.get_or_init(InjectionLedger::default)
}

fn marker_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(r#"([ ]*)(.*)"{RECORD_AND_INJECT_MARKER}","#))
            .expect("marker pattern is valid")
    })
}

fn render_replacement(indent: &str, prefix: &str, fixture_json: &str) -> String {
    let hashes = "#".repeat(raw_string_hashes(fixture_json));
    let body = fixture_json.replace('\n', &format!("\n{indent}"));
    format!("{indent}{prefix}\"{MOCKED_OUT_MARKER}\", r{hashes}\"{body}\"{hashes},")
}

/// Fewest `#` that keep `text` from closing a raw string early
fn raw_string_hashes(text: &str) -> usize {
    let mut longest = 0;
    let mut rest = text;
    while let Some(quote) = rest.find('"') {
        rest = &rest[quote + 1..];
        let run = rest.bytes().take_while(|&b| b == b'#').count();
        longest = longest.max(run);
    }
    longest + 1
}

/// Apply edits in ascending position; each edit shifts the ones after it by
/// the difference between its replacement and the text it replaced.
pub fn apply_injections(source: &str, injections: &mut [PendingInjection]) -> String {
    injections.sort_by_key(|injection| injection.pos);

    let mut patched = source.to_string();
    let mut grown = 0usize;
    let mut shrunk = 0usize;
    for injection in injections.iter() {
        let start = (injection.pos + grown).saturating_sub(shrunk);
        let end = start + injection.len;
        if end > patched.len() || !patched.is_char_boundary(start) || !patched.is_char_boundary(end) {
            warn!("Skipping injection at {} outside the source", injection.pos);
            continue;
        }
        patched.replace_range(start..end, &injection.replacement);
        if injection.replacement.len() >= injection.len {
            grown += injection.replacement.len() - injection.len;
        } else {
            shrunk += injection.len - injection.replacement.len();
        }
    }
    patched
}

/// Byte index of the start of 1-based `line`
pub fn line_number_to_index(source: &str, line: usize) -> usize {
    if line <= 1 {
        return 0;
    }
    source
        .match_indices('\n')
        .nth(line - 2)
        .map_or(source.len(), |(index, _)| index + 1)
}

/// Smallest indentation step used in `source`
pub fn detect_indent(source: &str) -> Option<usize> {
    source
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.bytes().take_while(|&b| b == b' ').count())
        .filter(|&width| width > 0)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CanonicalMessage, TrimmedExchange};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn fixture() -> Fixture {
        Fixture::Single(TrimmedExchange {
            request: CanonicalMessage::Url("GET /".to_string()),
            response: CanonicalMessage::StatusCode(204),
        })
    }

    #[test]
    fn test_line_number_to_index() {
        let source = "a\nbc\nd";
        assert_eq!(line_number_to_index(source, 1), 0);
        assert_eq!(line_number_to_index(source, 2), 2);
        assert_eq!(line_number_to_index(source, 3), 5);
        assert_eq!(line_number_to_index(source, 9), source.len());
    }

    #[test]
    fn test_detect_indent() {
        assert_eq!(detect_indent("fn a() {\n  b();\n    c();\n}\n"), Some(2));
        assert_eq!(detect_indent("flat\n"), None);
    }

    #[test]
    fn test_apply_injections_with_running_offset() {
        let source = "one two three";
        let mut injections = vec![
            PendingInjection {
                pos: 8,
                len: 5,
                replacement: "3".to_string(),
            },
            PendingInjection {
                pos: 0,
                len: 3,
                replacement: "uno!".to_string(),
            },
            PendingInjection {
                pos: 4,
                len: 3,
                replacement: "2".to_string(),
            },
        ];
        assert_eq!(apply_injections(source, &mut injections), "uno! 2 3");
    }

    #[test]
    fn test_raw_string_hashes() {
        assert_eq!(raw_string_hashes("{}"), 1);
        assert_eq!(raw_string_hashes(r##"{"a": "b"#"}"##), 2);
    }

    #[test]
    fn test_marker_replaced_in_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "#[test]\nfn t() {{\n    expect_http!(\n        \"{RECORD_AND_INJECT_MARKER}\",\n        body\n    );\n}}\n"
        )
        .unwrap();

        let ledger = InjectionLedger::default();
        let callsite = Callsite {
            file: file.path().to_path_buf(),
            line: 3,
        };
        assert!(ledger.record_pending_injection(&callsite, &fixture()).unwrap());
        assert_eq!(ledger.pending(), 1);
        assert_eq!(ledger.apply().unwrap(), 1);
        assert_eq!(ledger.pending(), 0);

        let patched = std::fs::read_to_string(file.path()).unwrap();
        assert!(!patched.contains(RECORD_AND_INJECT_MARKER));
        assert!(patched.contains(
            "        \"with http mocked out\", r#\"{\n            \"request\": \"GET /\",\n            \"response\": 204\n        }\"#,"
        ));
        assert!(patched.contains("        body\n"));
    }

    #[test]
    fn test_missing_marker_is_not_fatal() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "fn t() {{}}").unwrap();

        let ledger = InjectionLedger::default();
        let callsite = Callsite {
            file: file.path().to_path_buf(),
            line: 1,
        };
        assert!(!ledger.record_pending_injection(&callsite, &fixture()).unwrap());
        assert_eq!(ledger.apply().unwrap(), 0);
    }
}
