//! CSV row reading and mapping of raw rows into link intents.

use std::collections::HashMap;
use std::io::Read;
use std::iter::Peekable;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use linkport_core::{same_tag_name, ColumnMapping, LinkField, LinkIntent, MappedRow, ROOT_KEY};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "linkport-mapper";

/// One data row keyed by its (trimmed) header.
pub type CsvRow = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("reading csv headers: {0}")]
    Headers(#[source] csv::Error),
    #[error("parsing csv row {row}: {source}")]
    Row {
        row: usize,
        #[source]
        source: csv::Error,
    },
}

/// Canonical header form: lowercase, runs of anything non-alphanumeric folded to `_`.
pub fn normalize_header(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Value of `column` in `row`, matching headers by canonical form. Blank cells count as absent.
pub fn lookup<'a>(row: &'a CsvRow, column: &str) -> Option<&'a str> {
    let value = match row.get(column) {
        Some(value) => Some(value),
        None => {
            let wanted = normalize_header(column);
            row.iter()
                .find(|(header, _)| normalize_header(header) == wanted)
                .map(|(_, value)| value)
        }
    };
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

/// Splits `domain/path/to/key` (optionally with an http(s) scheme) into domain and key.
pub fn parse_short_link(raw: &str) -> Result<(String, String), String> {
    let trimmed = raw.trim();
    let lowered = trimmed.to_ascii_lowercase();
    let without_scheme = if lowered.starts_with("https://") {
        &trimmed[8..]
    } else if lowered.starts_with("http://") {
        &trimmed[7..]
    } else {
        trimmed
    };

    let mut segments = without_scheme.split('/').filter(|s| !s.is_empty());
    let domain = segments
        .next()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| "Missing domain in link".to_string())?;
    if !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || domain.chars().any(char::is_whitespace)
    {
        return Err(format!("Invalid domain: {domain}"));
    }

    let key = segments.collect::<Vec<_>>().join("/");
    let key = if key.is_empty() { ROOT_KEY.to_string() } else { key };
    Ok((domain, key))
}

/// Best-effort date parsing; anything unrecognized yields `None`.
pub fn parse_permissive_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }

    const DATETIME_FORMATS: [&str; 8] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
        "%m/%d/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }

    const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y", "%Y%m%d"];
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }

    // Unix timestamps; 13+ digits are milliseconds.
    if s.len() >= 9 && s.chars().all(|c| c.is_ascii_digit()) {
        let n: i64 = s.parse().ok()?;
        return if s.len() >= 13 {
            DateTime::from_timestamp(n / 1000, ((n % 1000) * 1_000_000) as u32)
        } else {
            DateTime::from_timestamp(n, 0)
        };
    }

    None
}

/// Comma-separated tag list, trimmed, whitespace-collapsed and de-duplicated ignoring case.
pub fn parse_tags(raw: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in raw.split(',') {
        let tag = tag.split_whitespace().collect::<Vec<_>>().join(" ");
        if tag.is_empty() || out.iter().any(|t| same_tag_name(t, &tag)) {
            continue;
        }
        out.push(tag);
    }
    out
}

/// Maps one raw row. Never fails: problems come back as [`MappedRow::Failure`].
pub fn map_row(row: &CsvRow, mapping: &ColumnMapping) -> MappedRow {
    let field = |f: LinkField| mapping.column_for(f).and_then(|column| lookup(row, column));

    let Some(raw_link) = field(LinkField::Link) else {
        return MappedRow::failure(format!(
            "Missing value for the link column ({})",
            mapping.link
        ));
    };
    let (domain, key) = match parse_short_link(raw_link) {
        Ok(parts) => parts,
        Err(error) => {
            return MappedRow::Failure {
                error,
                domain: None,
                key: Some(raw_link.to_string()),
            }
        }
    };

    let fail = |error: String| MappedRow::Failure {
        error,
        domain: Some(domain.clone()),
        key: Some(key.clone()),
    };

    let Some(raw_url) = field(LinkField::Url) else {
        return fail(format!(
            "Missing value for the destination URL column ({})",
            mapping.url
        ));
    };
    match Url::parse(raw_url) {
        Ok(url) if url.has_host() => {}
        _ => return fail(format!("Invalid URL: {raw_url}")),
    }

    MappedRow::Success(LinkIntent {
        domain: domain.clone(),
        key: key.clone(),
        url: raw_url.trim().to_string(),
        title: field(LinkField::Title).map(str::to_string),
        description: field(LinkField::Description).map(str::to_string),
        tags: field(LinkField::Tags).map(parse_tags).unwrap_or_default(),
        created_at: field(LinkField::CreatedAt).and_then(parse_permissive_date),
    })
}

/// Streaming CSV reader tracking its data-row position.
pub struct CsvRowReader<R: Read> {
    headers: Vec<String>,
    records: Peekable<csv::StringRecordsIntoIter<R>>,
    position: usize,
}

impl<R: Read> CsvRowReader<R> {
    pub fn new(input: R) -> Result<Self, MapperError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(input);
        let headers = reader
            .headers()
            .map_err(MapperError::Headers)?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();
        Ok(Self {
            headers,
            records: reader.into_records().peekable(),
            position: 0,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Index of the next data row.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_exhausted(&mut self) -> bool {
        self.records.peek().is_none()
    }

    /// Reads past rows before `cursor` without mapping them.
    pub fn skip_to(&mut self, cursor: usize) -> Result<(), MapperError> {
        while self.position < cursor {
            match self.next_row() {
                Some(row) => {
                    row?;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Skips to `start`, then yields at most `max` rows with their indices.
    pub fn window(&mut self, start: usize, max: usize) -> Result<RowWindow<'_, R>, MapperError> {
        self.skip_to(start)?;
        Ok(RowWindow {
            reader: self,
            remaining: max,
        })
    }

    fn next_row(&mut self) -> Option<Result<CsvRow, MapperError>> {
        let record = self.records.next()?;
        let row = self.position;
        self.position += 1;
        Some(
            record
                .map(|record| {
                    self.headers
                        .iter()
                        .cloned()
                        .zip(record.iter().map(str::to_string))
                        .collect()
                })
                .map_err(|source| MapperError::Row { row, source }),
        )
    }
}

/// Bounded view over a [`CsvRowReader`].
pub struct RowWindow<'a, R: Read> {
    reader: &'a mut CsvRowReader<R>,
    remaining: usize,
}

impl<R: Read> Iterator for RowWindow<'_, R> {
    type Item = Result<(usize, CsvRow), MapperError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let index = self.reader.position();
        let row = self.reader.next_row()?;
        self.remaining -= 1;
        Some(row.map(|row| (index, row)))
    }
}
