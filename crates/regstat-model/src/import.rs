use std::borrow::Cow;
use std::path::Path;

use encoding_rs::{Encoding, ISO_8859_15, MACINTOSH, UTF_8, WINDOWS_1252};
use rayon::prelude::*;
use thiserror::Error;

use crate::dimension::DataKind;
use crate::parallel::{available_workers, rayon_pool};
use crate::progress::ImportControl;
use crate::record::{ColumnMap, Record};

/// Bytes inspected when guessing the text encoding of an extract.
const ENCODING_SAMPLE_BYTES: usize = 256 * 1024;

/// Accented characters expected in the (French-language) extracts.
const EXPECTED_ACCENTS: &str = "éèêëàâäîïôöûüùçÉÈÊËÀÂÎÏÔÛÙÇœŒ";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("extract is empty")]
    EmptyInput,
    #[error("{kind} extract is missing columns: {}", columns.join(", "))]
    MissingColumns { kind: DataKind, columns: Vec<String> },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Text encodings tried, in order of preference, when decoding an extract.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Windows1252,
    Iso8859_15,
    MacRoman,
}

impl TextEncoding {
    pub const CANDIDATES: [TextEncoding; 4] = [
        TextEncoding::Utf8,
        TextEncoding::Windows1252,
        TextEncoding::Iso8859_15,
        TextEncoding::MacRoman,
    ];

    pub fn encoding(self) -> &'static Encoding {
        match self {
            TextEncoding::Utf8 => UTF_8,
            TextEncoding::Windows1252 => WINDOWS_1252,
            TextEncoding::Iso8859_15 => ISO_8859_15,
            TextEncoding::MacRoman => MACINTOSH,
        }
    }

    pub fn name(self) -> &'static str {
        self.encoding().name()
    }
}

/// Guess the encoding of `bytes` by trial decoding a sample with each candidate.
///
/// Clean UTF-8 wins outright. Otherwise each single-byte candidate is scored by
/// the number of expected accented characters it produces, minus a penalty for
/// control and replacement characters; ties keep the earlier candidate.
pub fn detect_encoding(bytes: &[u8]) -> TextEncoding {
    let sample = &bytes[..bytes.len().min(ENCODING_SAMPLE_BYTES)];
    if sample.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return TextEncoding::Utf8;
    }
    match std::str::from_utf8(sample) {
        Ok(_) => return TextEncoding::Utf8,
        // The sample may cut a multi-byte sequence in half.
        Err(e) if e.error_len().is_none() => return TextEncoding::Utf8,
        Err(_) => {}
    }

    let mut best = TextEncoding::Windows1252;
    let mut best_score = i64::MIN;
    for candidate in TextEncoding::CANDIDATES.into_iter().skip(1) {
        let (text, _) = candidate.encoding().decode_without_bom_handling(sample);
        let score = accent_score(&text);
        if score > best_score {
            best = candidate;
            best_score = score;
        }
    }
    best
}

fn accent_score(text: &str) -> i64 {
    let mut score = 0i64;
    for ch in text.chars() {
        if EXPECTED_ACCENTS.contains(ch) {
            score += 1;
        } else if ch == '\u{FFFD}' || ('\u{80}'..='\u{9F}').contains(&ch) {
            score -= 4;
        } else if ch.is_control() && !matches!(ch, '\r' | '\n' | '\t') {
            score -= 4;
        }
    }
    score
}

/// Decode a whole extract with the detected encoding, stripping any BOM.
pub fn decode_extract(bytes: &[u8]) -> (Cow<'_, str>, TextEncoding) {
    let encoding = detect_encoding(bytes);
    let (text, _) = match encoding {
        TextEncoding::Utf8 => UTF_8.decode_with_bom_removal(bytes),
        other => other.encoding().decode_without_bom_handling(bytes),
    };
    (text, encoding)
}

#[derive(Clone, Debug)]
pub struct ParseOptions {
    /// Lower bound on rows per parse chunk.
    pub min_chunk_rows: usize,
    /// Upper bound on rows per parse chunk.
    pub max_chunk_rows: usize,
    /// Cap on concurrently parsed chunks (defaults to available parallelism).
    pub max_workers: Option<usize>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            min_chunk_rows: 10_000,
            max_chunk_rows: 50_000,
            max_workers: None,
        }
    }
}

impl ParseOptions {
    pub fn worker_count(&self, data_rows: usize) -> usize {
        let cap = self.max_workers.unwrap_or_else(available_workers).max(1);
        let useful = data_rows.div_ceil(self.min_chunk_rows.max(1)).max(1);
        cap.min(useful)
    }

    /// Rows per chunk for a given input size: an even split across workers,
    /// clamped to `[min_chunk_rows, max_chunk_rows]`.
    pub fn chunk_rows(&self, data_rows: usize) -> usize {
        let min = self.min_chunk_rows.max(1);
        let max = self.max_chunk_rows.max(min);
        let workers = self.worker_count(data_rows);
        data_rows.div_ceil(workers).clamp(min, max)
    }
}

/// A data row rejected at parse time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MalformedRow {
    /// 1-based line number in the extract.
    pub line: u64,
    pub fields: usize,
}

#[derive(Debug)]
pub struct ParsedExtract {
    pub kind: DataKind,
    pub encoding: TextEncoding,
    pub has_header: bool,
    /// Valid records in file order.
    pub records: Vec<Record>,
    /// Rejected rows in file order.
    pub malformed: Vec<MalformedRow>,
    pub chunks: usize,
    pub workers: usize,
}

impl ParsedExtract {
    /// Data rows seen, valid or not.
    pub fn total_rows(&self) -> usize {
        self.records.len() + self.malformed.len()
    }
}

struct ChunkOutput {
    records: Vec<Record>,
    malformed: Vec<MalformedRow>,
}

/// Read and parse an extract file.
pub fn read_extract(
    path: &Path,
    kind: DataKind,
    options: &ParseOptions,
    control: &ImportControl,
) -> Result<ParsedExtract, ParseError> {
    let bytes = std::fs::read(path)?;
    parse_extract(&bytes, kind, options, control)
}

/// Parse raw extract bytes into typed records.
///
/// Rows are split into record-aligned chunks that are parsed in parallel and
/// reassembled in file order, so the output does not depend on the worker
/// count. Rows whose field count differs from the header are dropped and
/// reported in [`ParsedExtract::malformed`].
pub fn parse_extract(
    bytes: &[u8],
    kind: DataKind,
    options: &ParseOptions,
    control: &ImportControl,
) -> Result<ParsedExtract, ParseError> {
    let (text, encoding) = decode_extract(bytes);
    log::debug!("{kind} extract decoded as {}", encoding.name());

    let lines = line_starts(&text);
    if lines.is_empty() {
        return Err(ParseError::EmptyInput);
    }

    let first_line = line_at(&text, &lines, 0);
    let delimiter = sniff_delimiter(first_line);
    let first_fields = split_fields(first_line, delimiter);
    let has_header = first_fields
        .first()
        .map(|f| f.trim().trim_matches('"').parse::<f64>().is_err())
        .unwrap_or(false);

    let (columns, data_start) = if has_header {
        let names: Vec<&str> = first_fields.iter().map(|s| s.as_ref()).collect();
        (ColumnMap::from_header(kind, &names)?, 1)
    } else {
        (ColumnMap::canonical(kind), 0)
    };

    let data_rows = lines.len() - data_start;
    control.set_total_rows(data_rows as u64);
    if data_rows == 0 {
        return Ok(ParsedExtract {
            kind,
            encoding,
            has_header,
            records: Vec::new(),
            malformed: Vec::new(),
            chunks: 0,
            workers: 0,
        });
    }

    let chunk_rows = options.chunk_rows(data_rows);
    let workers = options.worker_count(data_rows);
    let mut chunks = Vec::new();
    let mut start = data_start;
    while start < lines.len() {
        let end = (start + chunk_rows).min(lines.len());
        let (byte_start, line_no) = lines[start];
        let byte_end = lines.get(end).map(|(offset, _)| *offset).unwrap_or(text.len());
        chunks.push((line_no, &text[byte_start..byte_end]));
        start = end;
    }

    let parse_all = || -> Vec<ChunkOutput> {
        chunks
            .par_iter()
            .with_max_len(1)
            .map(|(first_line, slice)| {
                parse_chunk(slice, *first_line, delimiter, &columns, control)
            })
            .collect()
    };
    let outputs = match rayon_pool() {
        Some(pool) if workers > 1 => pool.install(parse_all),
        _ => chunks
            .iter()
            .map(|(first_line, slice)| parse_chunk(slice, *first_line, delimiter, &columns, control))
            .collect(),
    };

    let mut records = Vec::with_capacity(data_rows);
    let mut malformed = Vec::new();
    for out in outputs {
        records.extend(out.records);
        malformed.extend(out.malformed);
    }
    if !malformed.is_empty() {
        log::info!(
            "{kind} extract: dropped {} malformed row(s) out of {data_rows}",
            malformed.len()
        );
    }

    Ok(ParsedExtract {
        kind,
        encoding,
        has_header,
        records,
        malformed,
        chunks: chunks.len(),
        workers,
    })
}

fn parse_chunk(
    slice: &str,
    first_line: u64,
    delimiter: u8,
    columns: &ColumnMap,
    control: &ImportControl,
) -> ChunkOutput {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(slice.as_bytes());

    let mut out = ChunkOutput {
        records: Vec::new(),
        malformed: Vec::new(),
    };
    let mut row = csv::StringRecord::new();
    let mut seen = 0u64;
    loop {
        let line = first_line + reader.position().line().saturating_sub(1);
        match reader.read_record(&mut row) {
            Ok(false) => break,
            Ok(true) => {
                seen += 1;
                if row.len() == columns.width() {
                    out.records.push(columns.record(&row));
                } else {
                    log::debug!(
                        "line {line}: expected {} fields, found {}",
                        columns.width(),
                        row.len()
                    );
                    out.malformed.push(MalformedRow {
                        line,
                        fields: row.len(),
                    });
                }
            }
            Err(err) => {
                // Text is already decoded, so this is a quoting problem. The reader
                // resumes at the next record.
                seen += 1;
                log::debug!("line {line}: {err}");
                out.malformed.push(MalformedRow { line, fields: 0 });
            }
        }
        if seen % 4096 == 0 {
            control.add_parsed(4096);
        }
    }
    control.add_parsed(seen % 4096);
    out
}

/// Byte offset and 1-based line number of every non-blank line that starts a
/// record. Lines continuing a quoted field are skipped, so chunks never split
/// a record.
fn line_starts(text: &str) -> Vec<(usize, u64)> {
    let mut starts = Vec::new();
    let mut offset = 0;
    let mut in_quotes = false;
    for (idx, line) in text.split_inclusive('\n').enumerate() {
        if !in_quotes && !line.trim().is_empty() {
            starts.push((offset, idx as u64 + 1));
        }
        if line.bytes().filter(|b| *b == b'"').count() % 2 == 1 {
            in_quotes = !in_quotes;
        }
        offset += line.len();
    }
    starts
}

fn line_at<'a>(text: &'a str, starts: &[(usize, u64)], idx: usize) -> &'a str {
    let (start, _) = starts[idx];
    let rest = &text[start..];
    rest.split('\n').next().unwrap_or("").trim_end_matches('\r')
}

fn sniff_delimiter(line: &str) -> u8 {
    let commas = line.matches(',').count();
    let semicolons = line.matches(';').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

fn split_fields(line: &str, delimiter: u8) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .from_reader(line.as_bytes());
    let mut row = csv::StringRecord::new();
    match reader.read_record(&mut row) {
        Ok(true) => row.iter().map(|f| f.to_string()).collect(),
        _ => Vec::new(),
    }
}
