//! Append-only CSV tables scanned end to end.
//!
//! Files are UTF-8 with BOM for spreadsheet compatibility and follow
//! RFC 4180 quoting, so operators can open a ledger directly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{LedgerError, Result};

const BOM: &str = "\u{feff}";

/// Separator used inside a single cell holding a list.
pub const LIST_SEPARATOR: &str = "; ";

/// A record type with a fixed column layout and a unique key.
pub trait TableRow: Sized {
    /// Header row, in column order.
    const COLUMNS: &'static [&'static str];

    /// Unique key; at most one row per key is ever visible.
    fn key(&self) -> String;

    fn to_fields(&self) -> Vec<String>;

    fn from_fields(fields: &[String]) -> std::result::Result<Self, String>;
}

/// A CSV file holding rows of `R`.
///
/// Reads take no lock. Writes are serialized through `writer`, which makes
/// check-then-append atomic within one process.
pub struct CsvTable<R> {
    path: PathBuf,
    separator: char,
    writer: Mutex<()>,
    _row: PhantomData<fn() -> R>,
}

impl<R: TableRow> CsvTable<R> {
    /// Open the table, writing the header row if the file is missing or empty.
    pub fn open(path: impl AsRef<Path>, separator: char) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let table = Self {
            path,
            separator,
            writer: Mutex::new(()),
            _row: PhantomData,
        };
        let empty = std::fs::metadata(&table.path).map_or(true, |m| m.len() == 0);
        if empty {
            if let Some(parent) = table.path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LedgerError::unavailable(parent, e))?;
            }
            let _guard = table.lock();
            table.rewrite(&[])?;
            debug!(path = %table.path.display(), "Created ledger table");
        }
        Ok(table)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Visit every decodable row in file order until `visit` returns `false`.
    pub fn scan(&self, mut visit: impl FnMut(R) -> bool) -> Result<()> {
        let text =
            std::fs::read_to_string(&self.path).map_err(|e| LedgerError::unavailable(&self.path, e))?;
        let text = text.strip_prefix(BOM).unwrap_or(&text);

        let mut records = parse_records(text, self.separator).into_iter().peekable();
        if records.peek().is_some_and(|(_, fields)| is_header::<R>(fields)) {
            records.next();
        }
        for (line, fields) in records {
            match R::from_fields(&fields) {
                Ok(row) => {
                    if !visit(row) {
                        break;
                    }
                }
                Err(reason) => {
                    let e = LedgerError::CorruptRow {
                        path: self.path.clone(),
                        line,
                        reason,
                    };
                    warn!(error = %e, "Skipping undecodable ledger row");
                }
            }
        }
        Ok(())
    }

    /// Linear scan for the row with `key`.
    pub fn find(&self, key: &str) -> Result<Option<R>> {
        let mut found = None;
        self.scan(|row| {
            if row.key() == key {
                found = Some(row);
                false
            } else {
                true
            }
        })?;
        Ok(found)
    }

    /// All rows in file order.
    pub fn rows(&self) -> Result<Vec<R>> {
        let mut rows = Vec::new();
        self.scan(|row| {
            rows.push(row);
            true
        })?;
        Ok(rows)
    }

    /// Append `row` unless a row with the same key exists.
    ///
    /// Returns `true` when the row was written.
    pub fn append_unique(&self, row: &R) -> Result<bool> {
        let _guard = self.lock();
        if self.find(&row.key())?.is_some() {
            return Ok(false);
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LedgerError::unavailable(&self.path, e))?;
        let mut out = String::new();
        match last_byte(&mut file).map_err(|e| LedgerError::unavailable(&self.path, e))? {
            None => {
                out.push_str(BOM);
                out.push_str(&self.encode(&header_fields::<R>()));
            }
            // A crash mid-append can leave an unterminated row.
            Some(b) if b != b'\n' => out.push('\n'),
            Some(_) => {}
        }
        out.push_str(&self.encode(&row.to_fields()));
        file.write_all(out.as_bytes())
            .map_err(|e| LedgerError::unavailable(&self.path, e))?;
        file.flush()
            .map_err(|e| LedgerError::unavailable(&self.path, e))?;
        Ok(true)
    }

    /// Keep only rows for which `keep` is true. Returns the removed rows.
    pub fn retain(&self, mut keep: impl FnMut(&R) -> bool) -> Result<Vec<R>> {
        let _guard = self.lock();
        let (kept, removed): (Vec<R>, Vec<R>) = self.rows()?.into_iter().partition(|r| keep(r));
        if !removed.is_empty() {
            self.rewrite(&kept)?;
        }
        Ok(removed)
    }

    /// Replace the file contents with the header plus `rows`.
    fn rewrite(&self, rows: &[R]) -> Result<()> {
        let mut out = String::from(BOM);
        out.push_str(&self.encode(&header_fields::<R>()));
        for row in rows {
            out.push_str(&self.encode(&row.to_fields()));
        }

        let tmp = self.path.with_extension("csv.tmp");
        let mut file = File::create(&tmp).map_err(|e| LedgerError::unavailable(&tmp, e))?;
        file.write_all(out.as_bytes())
            .map_err(|e| LedgerError::unavailable(&tmp, e))?;
        file.flush().map_err(|e| LedgerError::unavailable(&tmp, e))?;
        drop(file);
        std::fs::rename(&tmp, &self.path).map_err(|e| LedgerError::unavailable(&self.path, e))
    }

    fn encode(&self, fields: &[String]) -> String {
        let separator = self.separator.to_string();
        let mut line = fields
            .iter()
            .map(|f| csv_escape(f, self.separator))
            .collect::<Vec<_>>()
            .join(separator.as_str());
        line.push('\n');
        line
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn header_fields<R: TableRow>() -> Vec<String> {
    R::COLUMNS.iter().map(|c| c.to_string()).collect()
}

/// Whether `fields` is the header row of `R`.
fn is_header<R: TableRow>(fields: &[String]) -> bool {
    fields.len() == R::COLUMNS.len()
        && fields.iter().zip(R::COLUMNS).all(|(f, c)| f.trim() == *c)
}

/// Last byte of `file`, or `None` when it is empty.
fn last_byte(file: &mut File) -> std::io::Result<Option<u8>> {
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte)?;
    Ok(Some(byte[0]))
}

/// Escape a value for CSV (RFC 4180).
///
/// Wraps in double quotes if the value contains the separator, quotes, or newlines.
pub fn csv_escape(value: &str, separator: char) -> String {
    if value.contains(separator) || value.contains('"') || value.contains('\n') || value.contains('\r')
    {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Split CSV text into records, honoring quoted separators and newlines.
///
/// Each record carries the 1-based line number where it starts. Blank lines
/// are skipped.
pub fn parse_records(text: &str, separator: char) -> Vec<(usize, Vec<String>)> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_start = 1;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => {
                    if ch == '\n' {
                        line += 1;
                    }
                    field.push(ch);
                }
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            '\r' => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                if !(fields.len() == 1 && fields[0].is_empty()) {
                    records.push((record_start, std::mem::take(&mut fields)));
                }
                fields.clear();
                line += 1;
                record_start = line;
            }
            c if c == separator => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        records.push((record_start, fields));
    }
    records
}

/// Render a list cell.
///
/// Backslashes and `;` inside an item are backslash-escaped, so items may contain
/// the separator.
pub fn join_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| item.replace('\\', "\\\\").replace(';', "\\;"))
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR)
}

/// Parse a list cell written by [`join_list`].
pub fn split_list(cell: &str) -> Vec<String> {
    if cell.trim().is_empty() {
        return Vec::new();
    }
    let mut items = Vec::new();
    let mut item = String::new();
    let mut chars = cell.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    item.push(escaped);
                }
            }
            ';' => {
                if chars.peek() == Some(&' ') {
                    chars.next();
                }
                items.push(std::mem::take(&mut item));
            }
            c => item.push(c),
        }
    }
    items.push(item);
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Pair {
        key: String,
        value: String,
    }

    impl TableRow for Pair {
        const COLUMNS: &'static [&'static str] = &["Key", "Value"];

        fn key(&self) -> String {
            self.key.clone()
        }

        fn to_fields(&self) -> Vec<String> {
            vec![self.key.clone(), self.value.clone()]
        }

        fn from_fields(fields: &[String]) -> std::result::Result<Self, String> {
            match fields {
                [key, value] => Ok(Self {
                    key: key.clone(),
                    value: value.clone(),
                }),
                _ => Err(format!("expected 2 fields, found {}", fields.len())),
            }
        }
    }

    fn pair(key: &str, value: &str) -> Pair {
        Pair {
            key: key.into(),
            value: value.into(),
        }
    }

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("hello", ','), "hello");
        assert_eq!(csv_escape("hello, world", ','), "\"hello, world\"");
        assert_eq!(csv_escape("say \"hi\"", ','), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("a;b", ';'), "\"a;b\"");
    }

    #[test]
    fn test_parse_records_quoted_newline() {
        let text = "A,B\n\"x\ny\",\"q \"\"z\"\"\"\nlast,row";
        let records = parse_records(text, ',');
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].1, vec!["x\ny".to_string(), "q \"z\"".to_string()]);
        assert_eq!(records[2].0, 4);
        assert_eq!(records[2].1, vec!["last".to_string(), "row".to_string()]);
    }

    #[test]
    fn test_parse_records_empty_trailing_field() {
        let records = parse_records("a,\n", ',');
        assert_eq!(records, vec![(1, vec!["a".to_string(), String::new()])]);
    }

    #[test]
    fn test_append_unique_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let table: CsvTable<Pair> = CsvTable::open(dir.path().join("t.csv"), ',').unwrap();
        assert!(table.append_unique(&pair("k1", "first")).unwrap());
        assert!(!table.append_unique(&pair("k1", "second")).unwrap());
        assert!(table.append_unique(&pair("k2", "with, comma\nand newline")).unwrap());

        let rows = table.rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(table.find("k1").unwrap().unwrap().value, "first");
        assert_eq!(rows[1].value, "with, comma\nand newline");
    }

    #[test]
    fn test_file_is_spreadsheet_friendly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let table: CsvTable<Pair> = CsvTable::open(&path, ',').unwrap();
        table.append_unique(&pair("k", "v")).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "\u{feff}Key,Value\nk,v\n");
    }

    #[test]
    fn test_corrupt_rows_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "Key,Value\nonly-one-field\nk,v\n").unwrap();
        let table: CsvTable<Pair> = CsvTable::open(&path, ',').unwrap();
        assert_eq!(table.rows().unwrap(), vec![pair("k", "v")]);
    }

    #[test]
    fn test_retain_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let table: CsvTable<Pair> = CsvTable::open(dir.path().join("t.csv"), ';').unwrap();
        for k in ["a", "b", "c"] {
            table.append_unique(&pair(k, k)).unwrap();
        }
        assert_eq!(table.retain(|r| r.key != "b").unwrap(), vec![pair("b", "b")]);
        let keys: Vec<String> = table.rows().unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let table: CsvTable<Pair> = CsvTable::open(&path, ',').unwrap();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            table.find("k").unwrap_err(),
            LedgerError::LedgerUnavailable { .. }
        ));
    }

    #[test]
    fn test_list_cells() {
        let items = vec!["a.pdf".to_string(), "b.pdf".to_string()];
        assert_eq!(join_list(&items), "a.pdf; b.pdf");
        assert_eq!(split_list(&join_list(&items)), items);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_list_item_containing_separator() {
        let items = vec!["a; b.pdf".to_string(), "c\\d.pdf".to_string()];
        assert_eq!(split_list(&join_list(&items)), items);
        assert_eq!(split_list(&join_list(&["a; b.pdf".to_string()])).len(), 1);
    }

    #[test]
    fn test_empty_existing_file_gets_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "").unwrap();
        let table: CsvTable<Pair> = CsvTable::open(&path, ',').unwrap();
        assert!(table.append_unique(&pair("k", "v")).unwrap());
        assert_eq!(table.find("k").unwrap(), Some(pair("k", "v")));
        assert!(!table.append_unique(&pair("k", "again")).unwrap());
        assert_eq!(table.rows().unwrap().len(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "\u{feff}Key,Value\nk,v\n");
    }

    #[test]
    fn test_file_truncated_after_open_is_rebuilt_on_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let table: CsvTable<Pair> = CsvTable::open(&path, ',').unwrap();
        std::fs::write(&path, "").unwrap();
        assert!(table.append_unique(&pair("k", "v")).unwrap());
        assert!(!table.append_unique(&pair("k", "v")).unwrap());
        assert_eq!(table.rows().unwrap(), vec![pair("k", "v")]);
    }

    #[test]
    fn test_headerless_file_keeps_first_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        std::fs::write(&path, "k0,v0\nk1,v1\n").unwrap();
        let table: CsvTable<Pair> = CsvTable::open(&path, ',').unwrap();
        assert_eq!(table.find("k0").unwrap(), Some(pair("k0", "v0")));
        assert_eq!(table.rows().unwrap().len(), 2);
    }

    #[test]
    fn test_append_after_unterminated_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.csv");
        let table: CsvTable<Pair> = CsvTable::open(&path, ',').unwrap();
        table.append_unique(&pair("k0", "v0")).unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"partial").unwrap();
        drop(file);

        assert!(table.append_unique(&pair("k1", "v1")).unwrap());
        assert_eq!(table.find("k1").unwrap(), Some(pair("k1", "v1")));
        assert!(!table.append_unique(&pair("k1", "v1")).unwrap());
        let keys: Vec<String> = table.rows().unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["k0", "k1"]);
    }
}
