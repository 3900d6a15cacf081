use calamine::{open_workbook_auto_from_rs, Data, Reader};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

/// Failure to decode an uploaded file.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported file type '{0}' (expected .csv, .xlsx, .xls, .xlsb, .ods or .pdf)")]
    UnsupportedFormat(String),
    #[error("invalid CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("invalid spreadsheet: {0}")]
    Workbook(String),
    #[error("the file contains no data rows")]
    Empty,
    #[error("invalid PDF: {0}")]
    Pdf(String),
    #[error("the PDF has no selectable text; scanned documents are not supported")]
    NoText,
}

/// One spreadsheet row keyed by its original column header.
pub type SheetRow = Map<String, Value>;

#[derive(Debug, Clone, Serialize)]
pub struct ParsedSheet {
    pub headers: Vec<String>,
    pub rows: Vec<SheetRow>,
}

pub fn is_spreadsheet(file_name: &str) -> bool {
    matches!(extension(file_name).as_str(), "csv" | "xlsx" | "xls" | "xlsb" | "ods")
}

pub fn parse_spreadsheet(file_name: &str, bytes: &[u8]) -> Result<ParsedSheet, ParseError> {
    let sheet = match extension(file_name).as_str() {
        "csv" => parse_csv(bytes)?,
        "xlsx" | "xls" | "xlsb" | "ods" => parse_workbook(bytes)?,
        other => return Err(ParseError::UnsupportedFormat(other.to_string())),
    };

    if sheet.rows.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(sheet)
}

fn extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default()
}

fn parse_csv(bytes: &[u8]) -> Result<ParsedSheet, ParseError> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sniff_delimiter(bytes))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers = column_headers(reader.headers()?.iter());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: SheetRow = headers
            .iter()
            .zip(record.iter())
            .filter(|(_, value)| !value.is_empty())
            .map(|(header, value)| (header.clone(), Value::String(value.to_string())))
            .collect();
        if !row.is_empty() {
            rows.push(row);
        }
    }

    Ok(ParsedSheet { headers, rows })
}

/// European exports often use `;` so that `,` can be the decimal separator.
fn sniff_delimiter(bytes: &[u8]) -> u8 {
    let first_line = bytes.split(|b| *b == b'\n').next().unwrap_or_default();
    let semicolons = first_line.iter().filter(|b| **b == b';').count();
    let commas = first_line.iter().filter(|b| **b == b',').count();
    if semicolons > commas {
        b';'
    } else {
        b','
    }
}

fn parse_workbook(bytes: &[u8]) -> Result<ParsedSheet, ParseError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| ParseError::Workbook(e.to_string()))?;

    let first_sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or(ParseError::Empty)?;
    let range = workbook
        .worksheet_range(&first_sheet)
        .map_err(|e| ParseError::Workbook(e.to_string()))?;

    let mut rows_iter = range
        .rows()
        .skip_while(|cells| cells.iter().all(|cell| matches!(cell, Data::Empty)));
    let headers = match rows_iter.next() {
        Some(cells) => {
            let names: Vec<String> = cells.iter().map(|cell| cell.to_string()).collect();
            column_headers(names.iter().map(String::as_str))
        }
        None => return Err(ParseError::Empty),
    };

    let rows = rows_iter
        .map(|cells| {
            headers
                .iter()
                .zip(cells.iter())
                .filter_map(|(header, cell)| cell_value(cell).map(|value| (header.clone(), value)))
                .collect::<SheetRow>()
        })
        .filter(|row| !row.is_empty())
        .collect();

    Ok(ParsedSheet { headers, rows })
}

/// Header names as row keys: blanks become `column_N` and repeats get a
/// `_2`, `_3`... suffix so no column overwrites another.
fn column_headers<'a>(names: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .enumerate()
        .map(|(index, name)| {
            let name = name.trim();
            let base = if name.is_empty() {
                format!("column_{}", index + 1)
            } else {
                name.to_string()
            };
            let mut header = base.clone();
            let mut suffix = 2;
            while !seen.insert(header.clone()) {
                header = format!("{}_{}", base, suffix);
                suffix += 1;
            }
            header
        })
        .collect()
}

fn cell_value(cell: &Data) -> Option<Value> {
    match cell {
        Data::Int(value) => Some(Value::from(*value)),
        Data::Float(value) => Number::from_f64(*value).map(Value::Number),
        Data::String(value) => {
            let value = value.trim();
            (!value.is_empty()).then(|| Value::String(value.to_string()))
        }
        Data::Bool(value) => Some(Value::Bool(*value)),
        Data::DateTime(value) => match value.as_datetime() {
            Some(datetime) => Some(Value::String(datetime.date().format("%Y-%m-%d").to_string())),
            None => Number::from_f64(value.as_f64()).map(Value::Number),
        },
        Data::DateTimeIso(value) | Data::DurationIso(value) => Some(Value::String(value.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_csv() {
        let csv = b"Fecha,Cliente,Importe\n2024-01-05,Estil,121.00\n2024-01-06,Proveedor SL,60.50\n";
        let sheet = parse_spreadsheet("facturas.csv", csv).unwrap();

        assert_eq!(sheet.headers, vec!["Fecha", "Cliente", "Importe"]);
        assert_eq!(sheet.rows.len(), 2);
        assert_eq!(sheet.rows[1]["Cliente"], Value::String("Proveedor SL".to_string()));
    }

    #[test]
    fn parses_semicolon_csv_with_bom_and_blank_headers() {
        let csv = "\u{feff}Fecha;;Importe\n05/01/2024;Estil;1.210,00\n;;\n".as_bytes();
        let sheet = parse_spreadsheet("export.CSV", csv).unwrap();

        assert_eq!(sheet.headers, vec!["Fecha", "column_2", "Importe"]);
        assert_eq!(sheet.rows.len(), 1);
        assert_eq!(sheet.rows[0]["Importe"], Value::String("1.210,00".to_string()));
    }

    #[test]
    fn repeated_headers_keep_every_column() {
        let csv = b"Fecha,Importe,Importe,Importe_2\n2024-01-01,10,20,30\n";
        let sheet = parse_spreadsheet("dup.csv", csv).unwrap();

        assert_eq!(sheet.headers, vec!["Fecha", "Importe", "Importe_2", "Importe_2_2"]);
        let row = &sheet.rows[0];
        assert_eq!(row["Importe"], Value::String("10".to_string()));
        assert_eq!(row["Importe_2"], Value::String("20".to_string()));
        assert_eq!(row["Importe_2_2"], Value::String("30".to_string()));
    }

    #[test]
    fn header_only_file_is_empty() {
        let err = parse_spreadsheet("empty.csv", b"a,b,c\n").unwrap_err();
        assert!(matches!(err, ParseError::Empty));
    }

    #[test]
    fn rejects_unknown_extensions() {
        let err = parse_spreadsheet("notes.txt", b"hello").unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedFormat(ext) if ext == "txt"));
        assert!(!is_spreadsheet("invoice.pdf"));
        assert!(is_spreadsheet("Book1.XLSX"));
    }

    #[test]
    fn corrupt_workbook_is_a_parse_error() {
        let err = parse_spreadsheet("book.xlsx", b"definitely not a zip archive").unwrap_err();
        assert!(matches!(err, ParseError::Workbook(_)));
    }
}
