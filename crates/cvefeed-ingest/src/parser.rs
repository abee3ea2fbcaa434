//! Streaming feed parser
//!
//! Extracts CVE records from a staged feed artifact one element at a
//! time. The artifact is scanned through a buffered reader with a
//! string-aware brace matcher, so memory stays proportional to a single
//! element regardless of feed size.
//!
//! Malformed elements are skipped and counted, never fatal: one bad
//! record in a feed of hundreds of thousands must not abort the run.
//! Only structural failures (I/O errors, a truncated artifact, a feed
//! with no `CVE_Items` array) surface as stream errors.

use std::fs::File;
use std::io::{BufReader, Read};
use tracing::warn;

use crate::models::{CveRecord, CveReference, FeedArtifact};
use crate::{IngestError, Result};

/// Counters accumulated while scanning one artifact
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct ParseStats {
    /// Elements encountered in the feed array, valid or not
    pub items_seen: u64,
    /// Records successfully extracted
    pub records_yielded: u64,
    /// Elements skipped because extraction failed
    pub parse_errors: u64,
}

/// Opens staged artifacts for record extraction
pub struct FeedParser;

impl FeedParser {
    /// Open a staging artifact and position the stream at the start of
    /// the `CVE_Items` array.
    ///
    /// Returns a `Parse` error when the artifact has no such array.
    pub fn open(artifact: &FeedArtifact) -> Result<RecordStream> {
        let file = File::open(&artifact.path)?;
        RecordStream::new(BufReader::new(file))
    }
}

/// Iterator over the records of one feed artifact
///
/// Yields `Ok(record)` per extractable element. `Err` is reserved for
/// structural failures and ends the stream.
pub struct RecordStream {
    reader: BufReader<File>,
    stats: ParseStats,
    element_index: u64,
    done: bool,
}

impl RecordStream {
    fn new(mut reader: BufReader<File>) -> Result<Self> {
        seek_to_items_array(&mut reader)?;
        Ok(Self {
            reader,
            stats: ParseStats::default(),
            element_index: 0,
            done: false,
        })
    }

    /// Counters for the scan so far. Final once the iterator returns None.
    pub fn stats(&self) -> ParseStats {
        self.stats
    }

    /// Pull the next balanced element out of the array, or None at `]`.
    fn next_element(&mut self) -> Result<Option<String>> {
        loop {
            match read_byte(&mut self.reader)? {
                None => {
                    return Err(IngestError::Parse(
                        "feed artifact truncated inside CVE_Items array".to_string(),
                    ))
                }
                Some(b) if b.is_ascii_whitespace() || b == b',' => continue,
                Some(b']') => return Ok(None),
                Some(b'{') => return read_balanced(&mut self.reader).map(Some),
                Some(b) => {
                    return Err(IngestError::Parse(format!(
                        "unexpected byte {:#04x} in CVE_Items array",
                        b
                    )))
                }
            }
        }
    }
}

impl Iterator for RecordStream {
    type Item = Result<CveRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let element = match self.next_element() {
                Ok(Some(text)) => text,
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            let index = self.element_index;
            self.element_index += 1;
            self.stats.items_seen += 1;

            match extract_record(&element) {
                Ok(record) => {
                    self.stats.records_yielded += 1;
                    return Some(Ok(record));
                }
                Err(reason) => {
                    self.stats.parse_errors += 1;
                    warn!(element_index = index, reason = %reason, "Skipping malformed feed element");
                }
            }
        }
    }
}

/// Advance the reader past the `"CVE_Items"` key and its opening `[`.
///
/// Scans the top-level object with full string awareness so a key or
/// value that merely contains the text "CVE_Items" cannot fool it.
fn seek_to_items_array(reader: &mut BufReader<File>) -> Result<()> {
    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut current_string = Vec::new();
    // Set when a depth-1 key named CVE_Items just closed; cleared by
    // any significant byte other than ':' or '['.
    let mut after_items_key = false;
    let mut after_colon = false;

    while let Some(b) = read_byte(reader)? {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
                if depth == 1 && !after_colon {
                    after_items_key = current_string == b"CVE_Items";
                }
            } else {
                current_string.push(b);
            }
            continue;
        }

        match b {
            b'"' => {
                in_string = true;
                current_string.clear();
            }
            b'{' => {
                depth += 1;
                after_items_key = false;
                after_colon = false;
            }
            b'}' => {
                depth -= 1;
                after_items_key = false;
            }
            b':' if after_items_key => {
                after_colon = true;
            }
            b'[' => {
                if after_items_key && after_colon {
                    return Ok(());
                }
                depth += 1;
                after_items_key = false;
                after_colon = false;
            }
            b']' => {
                depth -= 1;
            }
            b if b.is_ascii_whitespace() => {}
            _ => {
                after_items_key = false;
                after_colon = false;
            }
        }
    }

    Err(IngestError::Parse(
        "feed artifact has no CVE_Items array".to_string(),
    ))
}

/// Read one balanced JSON object, the opening `{` already consumed.
fn read_balanced(reader: &mut BufReader<File>) -> Result<String> {
    let mut buf = vec![b'{'];
    let mut depth: i64 = 1;
    let mut in_string = false;
    let mut escaped = false;

    while let Some(b) = read_byte(reader)? {
        buf.push(b);
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return String::from_utf8(buf).map_err(|e| {
                        IngestError::Parse(format!("feed element is not valid UTF-8: {}", e))
                    });
                }
            }
            _ => {}
        }
    }

    Err(IngestError::Parse(
        "feed artifact truncated inside an element".to_string(),
    ))
}

fn read_byte(reader: &mut BufReader<File>) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(IngestError::Io(e)),
        }
    }
}

/// Map one feed element to the canonical record shape.
///
/// Field rules:
/// - `cve.CVE_data_meta.ID` is required
/// - first entry of `cve.description.description_data` supplies the
///   description, with a "No description" placeholder when absent
/// - `publishedDate` and `lastModifiedDate` pass through as raw strings,
///   empty when absent; no calendar validation
/// - CVSS v3 score and severity come from `impact.baseMetricV3.cvssV3`
///   when present
/// - each reference needs a `url`; `refsource` is optional
/// - the whole element is preserved as `raw_data`
fn extract_record(element: &str) -> std::result::Result<CveRecord, String> {
    let value: serde_json::Value =
        serde_json::from_str(element).map_err(|e| format!("invalid JSON: {}", e))?;

    let cve_id = value
        .pointer("/cve/CVE_data_meta/ID")
        .and_then(|v| v.as_str())
        .ok_or("missing cve.CVE_data_meta.ID")?
        .to_string();

    let description = value
        .pointer("/cve/description/description_data/0/value")
        .and_then(|v| v.as_str())
        .unwrap_or("No description")
        .to_string();

    let published_date = value
        .get("publishedDate")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let last_modified_date = value
        .get("lastModifiedDate")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let cvss = value.pointer("/impact/baseMetricV3/cvssV3");
    let cvss_v3_score = cvss.and_then(|c| c.get("baseScore")).and_then(|v| v.as_f64());
    let severity = cvss
        .and_then(|c| c.get("baseSeverity"))
        .and_then(|v| v.as_str())
        .map(String::from);

    let mut references = Vec::new();
    if let Some(entries) = value
        .pointer("/cve/references/reference_data")
        .and_then(|v| v.as_array())
    {
        for entry in entries {
            let url = entry
                .get("url")
                .and_then(|v| v.as_str())
                .ok_or("reference entry missing url")?
                .to_string();
            let source = entry
                .get("refsource")
                .and_then(|v| v.as_str())
                .map(String::from);
            references.push(CveReference { url, source });
        }
    }

    Ok(CveRecord {
        cve_id,
        description,
        published_date,
        last_modified_date,
        cvss_v3_score,
        severity,
        references,
        raw_data: value,
    })
}

// ============================================================================
// Tests
// ============================================================================
