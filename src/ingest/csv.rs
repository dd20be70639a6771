//! Bulk inventory file parsing
//!
//! Reads the `Store,Item,Count` tabular format into raw mutation rows.
//! Columns are located by header name (case-insensitive), so extra or
//! reordered columns are fine. Cells are trimmed, double-quoted cells may
//! contain commas, newlines and `""` escapes, and blank lines are ignored.
//! Cell contents are not validated here; a row with a missing or malformed
//! cell comes back as-is and is skipped by the applier.

use crate::domain::RawMutation;
use crate::infra::{InventoryError, Result};

const STORE_COLUMN: &str = "store";
const ITEM_COLUMN: &str = "item";
const COUNT_COLUMN: &str = "count";

/// Parse a CSV document into raw mutation rows in file order.
///
/// Fails only when the header is missing a required column or a quoted
/// cell is never closed.
pub fn parse_inventory_csv(input: &str) -> Result<Vec<RawMutation>> {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let mut records = split_records(input)?.into_iter();

    let header = records.next().ok_or_else(|| InventoryError::InvalidInput {
        field: "csv".to_string(),
        reason: "missing header row".to_string(),
    })?;

    let store_idx = column_index(&header, STORE_COLUMN)?;
    let item_idx = column_index(&header, ITEM_COLUMN)?;
    let count_idx = column_index(&header, COUNT_COLUMN)?;

    let cell = |row: &[String], idx: usize| row.get(idx).cloned().unwrap_or_default();

    Ok(records
        .map(|row| RawMutation {
            store: cell(&row, store_idx),
            item: cell(&row, item_idx),
            quantity: cell(&row, count_idx),
        })
        .collect())
}

fn column_index(header: &[String], name: &str) -> Result<usize> {
    header
        .iter()
        .position(|h| h.eq_ignore_ascii_case(name))
        .ok_or_else(|| InventoryError::InvalidInput {
            field: "csv".to_string(),
            reason: format!("header is missing the {:?} column", name),
        })
}

/// Split into records of trimmed cells, dropping blank lines
fn split_records(input: &str) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.push('"');
                }
                '"' => in_quotes = false,
                _ => cell.push(c),
            }
            continue;
        }

        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut cell).trim().to_string()),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                record.push(std::mem::take(&mut cell).trim().to_string());
                push_record(&mut records, std::mem::take(&mut record));
            }
            _ => cell.push(c),
        }
    }

    if in_quotes {
        return Err(InventoryError::InvalidInput {
            field: "csv".to_string(),
            reason: "unterminated quoted cell".to_string(),
        });
    }

    if !cell.is_empty() || !record.is_empty() {
        record.push(cell.trim().to_string());
        push_record(&mut records, record);
    }

    Ok(records)
}

fn push_record(records: &mut Vec<Vec<String>>, record: Vec<String>) {
    if record.iter().any(|c| !c.is_empty()) {
        records.push(record);
    }
}
