// Record types and payload decoders

/// Column layout of connection records streamed by the collector.
pub const CONNECTION_COLUMNS: [&str; 19] = [
    "TimestampFirst",
    "LinkProto",
    "NetworkProto",
    "TransportProto",
    "ApplicationProto",
    "SrcMAC",
    "DstMAC",
    "SrcIP",
    "SrcPort",
    "DstIP",
    "DstPort",
    "TotalSize",
    "AppPayloadSize",
    "NumPackets",
    "Duration",
    "TimestampLast",
    "BytesClientToServer",
    "BytesServerToClient",
    "Category",
];

/// Default reserved prefix of the header line's first field.
pub const DEFAULT_HEADER_PREFIX: &str = "Timestamp";

/// A fixed-arity row of comma-separated fields.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct FieldRecord {
    fields: Vec<String>,
}

impl FieldRecord {
    pub fn new(fields: Vec<String>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    pub fn to_line(&self) -> String {
        self.fields.join(",")
    }
}

/// How a single delimited line was classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Record(FieldRecord),
    /// The header line reappeared; marks the start of a new pass over the data.
    Marker,
    Malformed,
}

/// Splits and classifies delimited lines against a schema arity.
#[derive(Debug, Clone)]
pub struct LineParser {
    arity: usize,
    header_prefix: String,
}

impl LineParser {
    pub fn new(arity: usize, header_prefix: impl Into<String>) -> Self {
        Self {
            arity,
            header_prefix: header_prefix.into(),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Classify one line; the caller has already dropped empty lines.
    ///
    /// A line of the wrong arity is a marker when its first field carries the
    /// header prefix, and malformed otherwise.
    pub fn classify(&self, line: &[u8]) -> Line {
        let Ok(line) = std::str::from_utf8(line) else {
            return Line::Malformed;
        };
        let line = line.strip_suffix('\r').unwrap_or(line);

        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() == self.arity {
            return Line::Record(FieldRecord::new(
                fields.into_iter().map(str::to_owned).collect(),
            ));
        }
        if fields[0].starts_with(&self.header_prefix) {
            Line::Marker
        } else {
            Line::Malformed
        }
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new(CONNECTION_COLUMNS.len(), DEFAULT_HEADER_PREFIX)
    }
}

/// Maps a frame payload to a downstream record. `None` means the payload is malformed.
pub trait RecordDecoder {
    type Record;

    fn decode(&self, payload: Vec<u8>) -> Option<Self::Record>;
}

/// Passes payloads through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl RecordDecoder for RawDecoder {
    type Record = Vec<u8>;

    fn decode(&self, payload: Vec<u8>) -> Option<Vec<u8>> {
        Some(payload)
    }
}

/// Decodes payloads holding one delimited line each.
#[derive(Debug, Clone, Default)]
pub struct FieldDecoder {
    parser: LineParser,
}

impl FieldDecoder {
    pub fn new(parser: LineParser) -> Self {
        Self { parser }
    }
}

impl RecordDecoder for FieldDecoder {
    type Record = FieldRecord;

    fn decode(&self, payload: Vec<u8>) -> Option<FieldRecord> {
        let line = payload.strip_suffix(b"\n").unwrap_or(&payload);
        match self.parser.classify(line) {
            Line::Record(record) => Some(record),
            Line::Marker | Line::Malformed => None,
        }
    }
}
