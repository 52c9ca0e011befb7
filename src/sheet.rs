//! Spreadsheet rows as strings.

use std::io::Cursor;

use anyhow::anyhow;
use calamine::{Data, Range, Reader, Xlsx};

use crate::error::{LibError, Result};

pub const DEFAULT_SHEET: &str = "Sheet1";

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Parses `.xlsx` bytes and returns every row of `sheet`, header included.
pub fn read_rows(bytes: &[u8], sheet: &str) -> Result<Vec<Vec<String>>> {
    let mut workbook = Xlsx::new(Cursor::new(bytes)).map_err(|err| {
        LibError::invalid("Spreadsheet could not be opened", anyhow!(err))
    })?;
    let range = workbook.worksheet_range(sheet).map_err(|err| {
        LibError::invalid(
            "Spreadsheet sheet could not be read",
            anyhow!("sheet {sheet}: {err}"),
        )
    })?;
    let rows = rows_from_range(&range);
    tracing::debug!(sheet, rows = rows.len(), "sheet read");
    Ok(rows)
}

pub fn rows_from_range(range: &Range<Data>) -> Vec<Vec<String>> {
    range
        .rows()
        .map(|row| {
            let mut cells = row.iter().map(render_cell).collect::<Vec<_>>();
            while cells.last().is_some_and(String::is_empty) {
                cells.pop();
            }
            cells
        })
        .collect()
}

fn render_cell(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(value) | Data::DateTimeIso(value) | Data::DurationIso(value) => value.clone(),
        Data::Int(value) => value.to_string(),
        // f64 Display already omits a zero fraction.
        Data::Float(value) => value.to_string(),
        Data::Bool(value) => value.to_string(),
        Data::DateTime(value) => match value.as_datetime() {
            Some(datetime) => datetime.format(DATE_FORMAT).to_string(),
            None => value.as_f64().to_string(),
        },
        Data::Error(err) => err.to_string(),
    }
}
