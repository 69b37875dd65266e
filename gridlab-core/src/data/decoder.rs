//! Delimited-table decoding.
//!
//! Two forms share one parser:
//! - **batch**: whole body in memory → gunzip if needed → checksum → parse.
//! - **streaming**: body stream → optional gunzip → checksum pass-through →
//!   incremental parser, projecting and filtering each record as it is read
//!   so peak memory tracks the filtered result, not the full table.
//!
//! The checksum is BLAKE3 over the decompressed bytes in both forms, so the
//! same payload yields the same checksum whichever path decoded it.
//! Malformed gzip or CSV is a [`DataError::Parse`]; it is never retried.

use super::provider::{DataError, Row, Value};
use super::transport::{ByteStream, RequestOptions, RetryingTransport};
use flate2::read::MultiGzDecoder;
use futures::TryStreamExt;
use std::borrow::Cow;
use std::io::{self, BufRead, BufReader, Read};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::debug;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Parsed rows plus the payload fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTable {
    pub rows: Vec<Row>,
    pub checksum: String,
}

/// Per-record projection and season filter for streaming decodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamFilter {
    pub season_column: Option<String>,
    /// Keep only rows for this season; `None` keeps all.
    pub season: Option<i32>,
    /// Columns to retain; empty keeps every column.
    pub columns: Vec<String>,
}

impl StreamFilter {
    /// Season filter only, keeping every column.
    pub fn season(season_column: Option<String>, season: Option<i32>) -> Self {
        Self {
            season_column,
            season,
            columns: Vec::new(),
        }
    }

    /// Apply the filter to already-decoded rows.
    pub fn apply(&self, rows: Vec<Row>) -> Vec<Row> {
        rows.into_iter()
            .filter(|row| self.keep(row))
            .map(|row| self.project(row))
            .collect()
    }

    /// Rows without a season value are kept; they cannot be attributed.
    fn keep(&self, row: &Row) -> bool {
        match (&self.season_column, self.season) {
            (Some(column), Some(season)) => row
                .get(column)
                .and_then(Value::as_i64)
                .map_or(true, |s| s == i64::from(season)),
            _ => true,
        }
    }

    fn project(&self, mut row: Row) -> Row {
        if !self.columns.is_empty() {
            row.retain(|k, _| self.columns.iter().any(|c| c == k));
        }
        row
    }
}

/// Whether a payload is gzip, judged by URL suffix or magic bytes.
pub fn is_gzip(url: &str, head: &[u8]) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.ends_with(".gz") || head.starts_with(&GZIP_MAGIC)
}

/// Decode an in-memory payload.
pub fn decode(url: &str, bytes: &[u8]) -> Result<DecodedTable, DataError> {
    let raw: Cow<'_, [u8]> = if is_gzip(url, bytes) {
        let mut out = Vec::with_capacity(bytes.len() * 4);
        MultiGzDecoder::new(bytes)
            .read_to_end(&mut out)
            .map_err(|e| parse_error(url, format!("gzip: {e}")))?;
        Cow::Owned(out)
    } else {
        Cow::Borrowed(bytes)
    };

    let checksum = blake3::hash(&raw).to_hex().to_string();
    let rows = parse_rows(url, &raw[..], None)?;
    Ok(DecodedTable { rows, checksum })
}

/// Read a delimited table: header-driven, flexible column counts, trimmed
/// cells, blank lines skipped.
fn parse_rows<R: Read>(url: &str, reader: R, filter: Option<&StreamFilter>) -> Result<Vec<Row>, DataError> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers().map_err(|e| csv_error(url, e))?.clone();
    let mut rows = Vec::new();
    let mut record = csv::StringRecord::new();

    while rdr.read_record(&mut record).map_err(|e| csv_error(url, e))? {
        if record.iter().all(str::is_empty) {
            continue;
        }
        let row: Row = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.to_string(), record.get(i).map_or(Value::Null, Value::from_cell)))
            .collect();

        match filter {
            Some(f) if !f.keep(&row) => continue,
            Some(f) => rows.push(f.project(row)),
            None => rows.push(row),
        }
    }
    Ok(rows)
}

fn parse_error(url: &str, reason: String) -> DataError {
    DataError::Parse {
        url: url.to_string(),
        reason,
    }
}

/// Network failures surfacing through the reader chain keep their original
/// classification; everything else is malformed content.
fn io_error(url: &str, e: io::Error) -> DataError {
    match e.get_ref().and_then(|inner| inner.downcast_ref::<DataError>()) {
        Some(original) => original.clone(),
        None => parse_error(url, e.to_string()),
    }
}

fn csv_error(url: &str, e: csv::Error) -> DataError {
    if e.is_io_error() {
        if let csv::ErrorKind::Io(io) = e.into_kind() {
            return io_error(url, io);
        }
        return parse_error(url, "csv I/O error".into());
    }
    parse_error(url, format!("csv: {e}"))
}

/// Pass-through reader that fingerprints everything read through it.
struct HashingReader<R> {
    inner: R,
    hasher: blake3::Hasher,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
        }
    }

    /// Drain whatever the parser left unread, then finish the digest.
    fn finalize(mut self) -> io::Result<String> {
        io::copy(&mut self, &mut io::sink())?;
        Ok(self.hasher.finalize().to_hex().to_string())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// Fetches and decodes tables through the retrying transport.
#[derive(Clone)]
pub struct TableDecoder {
    transport: RetryingTransport,
}

impl TableDecoder {
    pub fn new(transport: RetryingTransport) -> Self {
        Self { transport }
    }

    /// Batch mode: download the whole body, then decode off the async runtime.
    pub async fn fetch_and_decode(&self, url: &str) -> Result<DecodedTable, DataError> {
        let bytes = self
            .transport
            .fetch_bytes(url, &RequestOptions::default())
            .await?;
        let owned_url = url.to_string();
        let table = tokio::task::spawn_blocking(move || decode(&owned_url, &bytes))
            .await
            .map_err(|e| parse_error(url, format!("decoder task failed: {e}")))??;
        debug!(url, rows = table.rows.len(), checksum = %table.checksum, "decoded table");
        Ok(table)
    }

    /// Streaming mode: decode while downloading, keeping only rows `filter` accepts.
    ///
    /// A transient failure part-way through the body restarts the download
    /// and the decode together.
    pub async fn decode_streaming(&self, url: &str, filter: StreamFilter) -> Result<DecodedTable, DataError> {
        let table = self
            .transport
            .consume_stream(url, &RequestOptions::default(), |body| {
                decode_stream(url, body, filter.clone())
            })
            .await?;
        debug!(url, rows = table.rows.len(), checksum = %table.checksum, "stream-decoded table");
        Ok(table)
    }
}

/// Decode a body stream on the blocking pool.
pub async fn decode_stream(url: &str, body: ByteStream, filter: StreamFilter) -> Result<DecodedTable, DataError> {
    let reader = StreamReader::new(body.map_err(io::Error::other));
    // The bridge must be created inside the runtime; it blocks on it later.
    let bridge = SyncIoBridge::new(reader);
    let owned_url = url.to_string();

    tokio::task::spawn_blocking(move || -> Result<DecodedTable, DataError> {
        let url = owned_url.as_str();
        let mut buffered = BufReader::new(bridge);
        let head = buffered.fill_buf().map_err(|e| io_error(url, e))?;
        let source: Box<dyn Read> = if is_gzip(url, head) {
            Box::new(MultiGzDecoder::new(buffered))
        } else {
            Box::new(buffered)
        };

        let mut hashing = HashingReader::new(source);
        let rows = parse_rows(url, &mut hashing, Some(&filter))?;
        let checksum = hashing.finalize().map_err(|e| io_error(url, e))?;
        Ok(DecodedTable { rows, checksum })
    })
    .await
    .map_err(|e| parse_error(url, format!("decoder task failed: {e}")))?
}
