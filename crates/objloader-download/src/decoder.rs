use objloader_types::{Base, BaseId, Item};
use tracing::warn;

/// A record that arrived but could not be turned into an Item.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MalformedRecord {
    /// The id, when the framing carried one.
    pub id: Option<BaseId>,
    pub reason: String,
}

pub type Record = Result<Item, MalformedRecord>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    /// Nothing but whitespace seen yet.
    Unknown,
    /// `id\tjson\n` records.
    Lines,
    /// `[ {...}, {...} ]` or `[ "{...}", ... ]`.
    JsonArray,
}

/// Brace scanner state for array mode. Positions index into the carry-over
/// buffer and are rebased whenever it is drained.
#[derive(Debug, Default)]
struct ArrayScan {
    /// Next byte to inspect.
    pos: usize,
    /// Start of the element being scanned.
    start: Option<usize>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// The element in progress is a top-level string.
    string_element: bool,
    closed: bool,
}

/// Incremental decoder for batch response bodies.
///
/// Chunks may split records anywhere, including inside a multi-byte UTF-8
/// sequence. Completed records are parsed as soon as their terminating
/// newline or closing brace arrives; the remainder is kept for the next chunk.
/// Malformed records are counted, logged and returned as errors without
/// stopping the stream.
#[derive(Debug)]
pub struct RecordDecoder {
    buf: Vec<u8>,
    format: Format,
    /// Leading bytes of `buf` already known to hold no newline.
    line_scan: usize,
    scan: ArrayScan,
    records: u64,
    parse_errors: u64,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            format: Format::Unknown,
            line_scan: 0,
            scan: ArrayScan::default(),
            records: 0,
            parse_errors: 0,
        }
    }

    /// Records decoded successfully so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    /// Bytes held back waiting for the rest of a record.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Record> {
        self.buf.extend_from_slice(chunk);
        if self.format == Format::Unknown {
            self.sniff();
        }
        match self.format {
            Format::Unknown => Vec::new(),
            Format::Lines => self.drain_lines(),
            Format::JsonArray => self.drain_array(),
        }
    }

    /// End of stream: decode a final unterminated line, and report any
    /// partial array element as malformed.
    pub fn finish(&mut self) -> Vec<Record> {
        let mut out = self.push(&[]);
        let rest = std::mem::take(&mut self.buf);
        match self.format {
            Format::Lines => {
                if !rest.iter().all(u8::is_ascii_whitespace) {
                    out.push(self.decode_line(&rest));
                }
            }
            Format::JsonArray => {
                let tail = &rest[self.scan.start.unwrap_or(0).min(rest.len())..];
                if !self.scan.closed && tail.iter().any(|b| !b.is_ascii_whitespace()) {
                    out.push(self.malformed(None, "response ended inside a JSON array".into()));
                }
            }
            Format::Unknown => {}
        }
        self.scan = ArrayScan::default();
        self.line_scan = 0;
        out
    }

    fn sniff(&mut self) {
        let Some(first) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            return;
        };
        if self.buf[first] == b'[' {
            self.format = Format::JsonArray;
            self.buf.drain(..=first);
        } else {
            self.format = Format::Lines;
            self.buf.drain(..first);
        }
    }

    fn drain_lines(&mut self) -> Vec<Record> {
        let from = self.line_scan.min(self.buf.len());
        let Some(last_newline) = self.buf[from..].iter().rposition(|&b| b == b'\n') else {
            self.line_scan = self.buf.len();
            return Vec::new();
        };
        let complete: Vec<u8> = self.buf.drain(..=from + last_newline).collect();
        self.line_scan = self.buf.len();
        complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .map(|line| self.decode_line(line))
            .collect()
    }

    fn decode_line(&mut self, line: &[u8]) -> Record {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(tab) = line.iter().position(|&b| b == b'\t') else {
            return self.malformed(None, "record has no tab separator".into());
        };
        let id = match std::str::from_utf8(&line[..tab]).map(str::trim) {
            Ok(raw) => match BaseId::parse(raw) {
                Ok(id) => id,
                Err(e) => return self.malformed(None, e.to_string()),
            },
            Err(e) => return self.malformed(None, format!("id is not UTF-8: {e}")),
        };
        let parsed = Base::from_json_slice(&line[tab + 1..])
            .and_then(|base| Item::from_parts(id.clone(), base));
        match parsed {
            Ok(item) => {
                self.records += 1;
                Ok(item)
            }
            Err(e) => self.malformed(Some(id), e.to_string()),
        }
    }

    fn drain_array(&mut self) -> Vec<Record> {
        let mut out = Vec::new();
        let mut consumed = 0;
        let mut i = self.scan.pos;
        while i < self.buf.len() && !self.scan.closed {
            let b = self.buf[i];
            let s = &mut self.scan;
            if s.in_string {
                if s.escaped {
                    s.escaped = false;
                } else if b == b'\\' {
                    s.escaped = true;
                } else if b == b'"' {
                    s.in_string = false;
                    if s.string_element && s.depth == 0 {
                        let start = s.start.take().unwrap_or(i);
                        s.string_element = false;
                        let element = self.buf[start..=i].to_vec();
                        out.push(self.decode_string_element(&element));
                        consumed = i + 1;
                    }
                }
            } else {
                match b {
                    b'"' => {
                        s.in_string = true;
                        if s.depth == 0 {
                            s.start = Some(i);
                            s.string_element = true;
                        }
                    }
                    b'{' | b'[' => {
                        if s.depth == 0 {
                            s.start = Some(i);
                        }
                        s.depth += 1;
                    }
                    b'}' | b']' if s.depth > 0 => {
                        s.depth -= 1;
                        if s.depth == 0 {
                            let start = s.start.take().unwrap_or(i);
                            let element = self.buf[start..=i].to_vec();
                            out.push(self.decode_object_element(&element));
                            consumed = i + 1;
                        }
                    }
                    b']' => {
                        s.closed = true;
                        consumed = i + 1;
                    }
                    b',' if s.depth == 0 => consumed = i + 1,
                    b if b.is_ascii_whitespace() && s.depth == 0 => consumed = i + 1,
                    _ => {}
                }
            }
            i += 1;
        }

        // Rebase the scanner onto the retained tail.
        self.buf.drain(..consumed);
        self.scan.pos = i - consumed;
        if let Some(start) = self.scan.start.as_mut() {
            *start -= consumed;
        }
        out
    }

    fn decode_object_element(&mut self, element: &[u8]) -> Record {
        match Base::from_json_slice(element) {
            Ok(base) => {
                self.records += 1;
                Ok(Item::new(base))
            }
            Err(e) => {
                let id = peek_id(element);
                self.malformed(id, e.to_string())
            }
        }
    }

    fn decode_string_element(&mut self, element: &[u8]) -> Record {
        let text: String = match serde_json::from_slice(element) {
            Ok(text) => text,
            Err(e) => return self.malformed(None, e.to_string()),
        };
        self.decode_object_element(text.as_bytes())
    }

    fn malformed(&mut self, id: Option<BaseId>, reason: String) -> Record {
        self.parse_errors += 1;
        warn!(
            id = id.as_ref().map(BaseId::as_str).unwrap_or("?"),
            reason = %reason,
            "skipping malformed record"
        );
        Err(MalformedRecord { id, reason })
    }
}

impl Default for RecordDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort id of an element that is valid JSON but not a valid Base.
fn peek_id(element: &[u8]) -> Option<BaseId> {
    let value: serde_json::Value = serde_json::from_slice(element).ok()?;
    value
        .get("id")
        .and_then(serde_json::Value::as_str)
        .and_then(|id| BaseId::parse(id).ok())
}
