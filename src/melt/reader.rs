//! Record boundary detection
//!
//! Splits a large document into the raw text of its `<REC>` elements,
//! one line at a time, without parsing anything.

use once_cell::sync::Lazy;
use regex::Regex;
use std::io::{self, BufRead};

static RECORD_START: Lazy<Regex> = Lazy::new(|| Regex::new(r"<REC[\s>/]").unwrap());

const RECORD_END: &str = "</REC>";

/// Yields the text of successive records from a line-oriented stream
pub struct RecordReader<R: BufRead> {
    reader: R,
    line: String,
    /// Text after the last `</REC>` that has not been scanned yet
    carry: String,
}

impl<R: BufRead> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        RecordReader {
            reader,
            line: String::new(),
            carry: String::new(),
        }
    }

    /// The next complete record, or `None` at end of stream.
    ///
    /// A stream that ends inside a record yields the partial text.
    pub fn next_record(&mut self) -> io::Result<Option<String>> {
        let mut record: Option<String> = None;

        loop {
            if self.carry.is_empty() {
                self.line.clear();
                if self.reader.read_line(&mut self.line)? == 0 {
                    return Ok(record);
                }
            } else {
                self.line = std::mem::take(&mut self.carry);
            }

            let searched_from = match record.as_mut() {
                Some(buf) => {
                    let start = buf.len();
                    buf.push_str(&self.line);
                    start
                }
                None => match RECORD_START.find(&self.line) {
                    Some(m) => {
                        record = Some(self.line[m.start()..].to_string());
                        0
                    }
                    None => continue,
                },
            };

            if let Some(buf) = record.as_mut() {
                if let Some(end) = buf[searched_from..].find(RECORD_END) {
                    let end = searched_from + end + RECORD_END.len();
                    self.carry = buf[end..].to_string();
                    buf.truncate(end);
                    return Ok(record);
                }
            }
        }
    }
}

impl<R: BufRead> Iterator for RecordReader<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}
