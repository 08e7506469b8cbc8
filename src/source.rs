//! Sample ingest
//!
//! The engine pulls samples and watermark advances from a `SampleSource`.
//! `NdjsonSource` reads one JSON object per line:
//!
//! ```text
//! {"device": "device1", "endpoint": "temp", "timestamp": 1000, "value": 15.2}
//! {"watermark": 3000}
//! {"watermark": "2024-01-15T00:00:03Z", "device": "device1", "endpoint": "temp"}
//! ```

use crate::error::TopicError;
use crate::schema::{parse_time, RawTime};
use crate::types::{Millis, Sample, SampleValue};
use serde::Deserialize;
use std::io::BufRead;

/// One unit of work from an ingest adapter
#[derive(Debug, Clone, PartialEq)]
pub enum IngestItem {
    Sample {
        device: String,
        endpoint: String,
        sample: Sample,
    },
    /// Watermark advance, for one endpoint or, without a target, for all
    Watermark {
        device: Option<String>,
        endpoint: Option<String>,
        time: Millis,
    },
}

/// Pull-based sample stream
pub trait SampleSource {
    /// Next item, or `None` once the stream is exhausted
    fn next_item(&mut self) -> Result<Option<IngestItem>, TopicError>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLine {
    Watermark {
        watermark: RawTime,
        #[serde(default)]
        device: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
    Sample {
        device: String,
        endpoint: String,
        timestamp: RawTime,
        value: SampleValue,
    },
}

/// Newline-delimited JSON reader
pub struct NdjsonSource<R: BufRead> {
    reader: R,
    line_no: usize,
    buf: String,
}

impl<R: BufRead> NdjsonSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line_no: 0,
            buf: String::new(),
        }
    }

    /// Lines consumed so far
    pub fn line_no(&self) -> usize {
        self.line_no
    }
}

impl<R: BufRead> SampleSource for NdjsonSource<R> {
    fn next_item(&mut self) -> Result<Option<IngestItem>, TopicError> {
        loop {
            self.buf.clear();
            let read = self
                .reader
                .read_line(&mut self.buf)
                .map_err(|e| TopicError::ParseError(format!("read failed: {e}")))?;
            if read == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }

            let raw: RawLine = serde_json::from_str(line).map_err(|e| {
                TopicError::ParseError(format!("line {}: {e}", self.line_no))
            })?;
            return parse_line(raw).map(Some);
        }
    }
}

fn parse_line(raw: RawLine) -> Result<IngestItem, TopicError> {
    match raw {
        RawLine::Watermark {
            watermark,
            device,
            endpoint,
        } => Ok(IngestItem::Watermark {
            device,
            endpoint,
            time: parse_time(&watermark)?,
        }),
        RawLine::Sample {
            device,
            endpoint,
            timestamp,
            value,
        } => Ok(IngestItem::Sample {
            device,
            endpoint,
            sample: Sample {
                timestamp: parse_time(&timestamp)?,
                value,
            },
        }),
    }
}

/// In-memory source over a fixed list of items
pub struct IterSource<I: Iterator<Item = IngestItem>> {
    items: I,
}

impl<I: Iterator<Item = IngestItem>> IterSource<I> {
    pub fn new(items: impl IntoIterator<Item = IngestItem, IntoIter = I>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl<I: Iterator<Item = IngestItem>> SampleSource for IterSource<I> {
    fn next_item(&mut self) -> Result<Option<IngestItem>, TopicError> {
        Ok(self.items.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(input: &str) -> Result<Vec<IngestItem>, TopicError> {
        let mut source = NdjsonSource::new(Cursor::new(input.to_string()));
        let mut items = Vec::new();
        while let Some(item) = source.next_item()? {
            items.push(item);
        }
        Ok(items)
    }

    #[test]
    fn test_reads_samples_and_watermarks() {
        let items = read_all(
            r#"{"device":"device1","endpoint":"temp","timestamp":1000,"value":15.2}

{"watermark":3000}
{"watermark":"1970-01-01T00:00:04Z","device":"device1","endpoint":"temp"}
"#,
        )
        .unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(
            items[0],
            IngestItem::Sample {
                device: "device1".into(),
                endpoint: "temp".into(),
                sample: Sample::new(1000, 15.2),
            }
        );
        assert_eq!(
            items[1],
            IngestItem::Watermark {
                device: None,
                endpoint: None,
                time: 3000
            }
        );
        assert!(matches!(items[2], IngestItem::Watermark { time: 4000, .. }));
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let err = read_all("{\"watermark\":1}\n{\"device\":\"d\"}\n").unwrap_err();
        assert!(matches!(err, TopicError::ParseError(ref m) if m.starts_with("line 2")));
    }

    #[test]
    fn test_iter_source() {
        let mut source = IterSource::new(vec![IngestItem::Watermark {
            device: None,
            endpoint: None,
            time: 1,
        }]);
        assert!(source.next_item().unwrap().is_some());
        assert!(source.next_item().unwrap().is_none());
    }
}
