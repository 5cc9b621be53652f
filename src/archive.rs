//! Archive input: zip member enumeration and streaming row readers.
//!
//! Members are selected with a configurable glob. CSV members stream
//! straight off the zip entry reader; XLSX members are decompressed into
//! memory (they are zip-in-zip, so entry readers cannot seek) but their
//! rows are still parsed incrementally from the worksheet XML. Both
//! readers yield [`RawRecord`]s: header row + cell values, in column order.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use globset::GlobBuilder;
use zip::ZipArchive;

use crate::models::RawRecord;

pub type Archive = ZipArchive<BufReader<File>>;

pub fn open_archive(path: &Path) -> Result<Archive> {
    let file =
        File::open(path).with_context(|| format!("Failed to open archive: {}", path.display()))?;
    ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("Not a readable zip archive: {}", path.display()))
}

/// Archive members matching the configured pattern, in archive order.
///
/// Matching is case-insensitive on the member's base name so directory
/// prefixes inside the archive don't defeat simple patterns like `*.csv`.
pub fn select_members(archive: &Archive, pattern: &str) -> Result<Vec<String>> {
    let glob = GlobBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .with_context(|| format!("Invalid member pattern: {}", pattern))?
        .compile_matcher();

    let members: Vec<String> = archive
        .file_names()
        .filter(|name| {
            let base = name.rsplit('/').next().unwrap_or(name);
            glob.is_match(base)
        })
        .map(|s| s.to_string())
        .collect();

    if members.is_empty() {
        bail!("No archive members match pattern {}", pattern);
    }
    Ok(members)
}

/// Streaming rows from one archive member, format chosen by extension.
pub enum MemberRows<'a> {
    Csv(CsvRows<zip::read::ZipFile<'a>>),
    Xlsx(XlsxRows),
}

impl Iterator for MemberRows<'_> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            MemberRows::Csv(rows) => rows.next(),
            MemberRows::Xlsx(rows) => rows.next(),
        }
    }
}

pub fn member_rows<'a>(archive: &'a mut Archive, name: &str) -> Result<MemberRows<'a>> {
    if name.to_lowercase().ends_with(".xlsx") {
        let mut entry = archive
            .by_name(name)
            .with_context(|| format!("Failed to open archive member: {}", name))?;
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read archive member: {}", name))?;
        Ok(MemberRows::Xlsx(XlsxRows::new(bytes)?))
    } else {
        let entry = archive
            .by_name(name)
            .with_context(|| format!("Failed to open archive member: {}", name))?;
        Ok(MemberRows::Csv(CsvRows::new(entry)?))
    }
}

// ============ CSV ============

pub struct CsvRows<R: Read> {
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<R>,
}

impl<R: Read> CsvRows<R> {
    pub fn new(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);
        let headers: Vec<String> = rdr
            .headers()
            .context("Failed to read CSV header row")?
            .iter()
            .map(|h| h.to_string())
            .collect();
        Ok(Self {
            headers,
            records: rdr.into_records(),
        })
    }
}

impl<R: Read> Iterator for CsvRows<R> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.records.next()? {
            Ok(r) => r,
            Err(e) => return Some(Err(e.into())),
        };
        let columns = self
            .headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.clone(), record.get(i).unwrap_or("").to_string()))
            .collect();
        Some(Ok(RawRecord::new(columns)))
    }
}

// ============ XLSX ============

/// Row reader over the first worksheet of an XLSX member.
///
/// Resolves shared strings up front, then walks `<row>` elements with a
/// pull parser. The first row is taken as the header row; later rows are
/// zipped against it by cell reference (so sparse rows keep alignment).
pub struct XlsxRows {
    headers: Vec<String>,
    reader: quick_xml::Reader<Cursor<Vec<u8>>>,
    shared: Vec<String>,
    done: bool,
}

impl XlsxRows {
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        let mut xlsx = ZipArchive::new(Cursor::new(bytes.as_slice()))
            .context("XLSX member is not a valid OOXML package")?;
        let shared = read_shared_strings(&mut xlsx)?;
        let sheet_name = first_worksheet_name(&xlsx)?;

        let mut sheet_xml = Vec::new();
        xlsx.by_name(&sheet_name)
            .with_context(|| format!("Worksheet {} missing", sheet_name))?
            .read_to_end(&mut sheet_xml)
            .context("Failed to read worksheet XML")?;

        let mut reader = quick_xml::Reader::from_reader(Cursor::new(sheet_xml));
        reader.config_mut().trim_text(true);

        let mut rows = Self {
            headers: Vec::new(),
            reader,
            shared,
            done: false,
        };
        // Header row
        match rows.next_cells()? {
            Some(cells) => {
                let max_col = cells.keys().copied().max().unwrap_or(0);
                rows.headers = (0..=max_col)
                    .map(|col| cells.get(&col).cloned().unwrap_or_default())
                    .collect();
            }
            None => rows.done = true,
        }
        Ok(rows)
    }

    /// Cells of the next `<row>` keyed by zero-based column index, or None
    /// at end of sheet.
    fn next_cells(&mut self) -> Result<Option<BTreeMap<usize, String>>> {
        use quick_xml::events::Event;

        let mut buf = Vec::new();
        let mut cells: BTreeMap<usize, String> = BTreeMap::new();
        let mut in_row = false;
        let mut col: usize = 0;
        let mut implicit_col: usize = 0;
        let mut cell_type = CellType::Number;
        let mut in_v = false;
        let mut in_is_t = false;

        loop {
            match self.reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => match e.local_name().as_ref() {
                    b"row" => {
                        in_row = true;
                        cells.clear();
                        implicit_col = 0;
                    }
                    b"c" if in_row => {
                        cell_type = CellType::Number;
                        col = implicit_col;
                        for attr in e.attributes().flatten() {
                            match attr.key.as_ref() {
                                b"r" => {
                                    if let Some(c) =
                                        column_index(attr.unescape_value().unwrap_or_default().as_ref())
                                    {
                                        col = c;
                                    }
                                }
                                b"t" => {
                                    cell_type = match attr.value.as_ref() {
                                        b"s" => CellType::SharedString,
                                        b"inlineStr" => CellType::Inline,
                                        _ => CellType::Number,
                                    };
                                }
                                _ => {}
                            }
                        }
                        implicit_col = col + 1;
                    }
                    b"v" if in_row => in_v = true,
                    b"t" if in_row && cell_type == CellType::Inline => in_is_t = true,
                    _ => {}
                },
                Ok(Event::Text(t)) if in_v || in_is_t => {
                    let text = t.unescape().unwrap_or_default().into_owned();
                    let value = match cell_type {
                        CellType::SharedString => text
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| self.shared.get(i).cloned())
                            .unwrap_or_default(),
                        _ => text,
                    };
                    if !value.is_empty() {
                        cells.insert(col, value);
                    }
                    in_v = false;
                    in_is_t = false;
                }
                Ok(Event::End(e)) => match e.local_name().as_ref() {
                    b"row" if in_row => return Ok(Some(cells)),
                    b"v" => in_v = false,
                    b"t" => in_is_t = false,
                    _ => {}
                },
                Ok(Event::Eof) => return Ok(None),
                Err(e) => bail!("Worksheet XML parse error: {}", e),
                _ => {}
            }
            buf.clear();
        }
    }
}

#[derive(PartialEq, Clone, Copy)]
enum CellType {
    Number,
    SharedString,
    Inline,
}

impl Iterator for XlsxRows {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_cells() {
            Ok(Some(cells)) => {
                let columns = self
                    .headers
                    .iter()
                    .enumerate()
                    .map(|(i, h)| (h.clone(), cells.get(&i).cloned().unwrap_or_default()))
                    .collect();
                Some(Ok(RawRecord::new(columns)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Parse the column letters of an A1-style cell reference ("BC12" → 54).
fn column_index(cell_ref: &str) -> Option<usize> {
    let letters: String = cell_ref.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }
    let mut idx: usize = 0;
    for c in letters.chars() {
        idx = idx * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
    }
    Some(idx - 1)
}

fn read_shared_strings(archive: &mut ZipArchive<Cursor<&[u8]>>) -> Result<Vec<String>> {
    use quick_xml::events::Event;

    let mut xml = Vec::new();
    match archive.by_name("xl/sharedStrings.xml") {
        Ok(mut entry) => {
            entry
                .read_to_end(&mut xml)
                .context("Failed to read sharedStrings.xml")?;
        }
        // Sheets with only numeric/inline cells have no shared strings part.
        Err(_) => return Ok(Vec::new()),
    }

    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut current = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = true;
                    current.clear();
                } else if in_si && e.local_name().as_ref() == b"t" {
                    if let Ok(Event::Text(te)) = reader.read_event_into(&mut buf) {
                        current.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"si" {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => bail!("sharedStrings.xml parse error: {}", e),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// The first worksheet in part order (sheet1.xml, sheet2.xml, ...).
fn first_worksheet_name(archive: &ZipArchive<Cursor<&[u8]>>) -> Result<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("XLSX member contains no worksheets"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_index_parses_references() {
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("B2"), Some(1));
        assert_eq!(column_index("Z9"), Some(25));
        assert_eq!(column_index("AA10"), Some(26));
        assert_eq!(column_index("BC12"), Some(54));
        assert_eq!(column_index("12"), None);
    }

    #[test]
    fn csv_rows_pair_headers_with_values() {
        let data = "Full Name,Employer,E-mail\nAda,Engines,ada@example.com\nGrace,Navy,\n";
        let mut rows = CsvRows::new(data.as_bytes()).unwrap();

        let first = rows.next().unwrap().unwrap();
        assert_eq!(
            first.columns,
            vec![
                ("Full Name".to_string(), "Ada".to_string()),
                ("Employer".to_string(), "Engines".to_string()),
                ("E-mail".to_string(), "ada@example.com".to_string()),
            ]
        );

        let second = rows.next().unwrap().unwrap();
        assert_eq!(second.columns[2].1, "");
        assert!(rows.next().is_none());
    }

    #[test]
    fn csv_rows_tolerate_ragged_records() {
        let data = "a,b\n1\n2,3,4\n";
        let rows: Vec<_> = CsvRows::new(data.as_bytes())
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].columns[1].1, "");
    }
}
