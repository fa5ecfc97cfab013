use calamine::{Data, Reader, Sheets, open_workbook_auto};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// One worksheet as a dense grid of cell strings. Merged regions are already
/// expanded: every cell a region spans carries the region's value, so
/// downstream stages never see a blank where the sheet showed one.
#[derive(Debug, Clone)]
pub struct SheetGrid {
    pub name: String,
    /// Absolute 0-based sheet row of `rows[0]` (calamine ranges start at the
    /// first non-empty cell, not at A1).
    pub first_row: u32,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Copy)]
pub struct MergedRegion {
    pub first_row: usize,
    pub first_col: usize,
    pub last_row: usize,
    pub last_col: usize,
}

#[derive(Debug, Error)]
pub enum WorkbookError {
    #[error("unsupported file type: {0}")]
    Unsupported(String),
    #[error("unable to open workbook: {0}")]
    Open(String),
    #[error("unable to read sheet `{name}`: {message}")]
    Sheet { name: String, message: String },
}

const SUPPORTED_EXTENSIONS: &[&str] = &["xls", "xlsx", "xlsm", "xlsb", "ods"];

/// Load every worksheet of the file at `path`. Spreadsheet parsing is
/// CPU-bound, so it runs on the blocking pool.
pub async fn load_workbook(path: PathBuf) -> Result<Vec<SheetGrid>, WorkbookError> {
    tokio::task::spawn_blocking(move || read_workbook(&path))
        .await
        .map_err(|err| WorkbookError::Open(format!("workbook reader task failed: {err}")))?
}

fn read_workbook(path: &Path) -> Result<Vec<SheetGrid>, WorkbookError> {
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(WorkbookError::Unsupported(extension));
    }

    let mut workbook =
        open_workbook_auto(path).map_err(|err| WorkbookError::Open(err.to_string()))?;

    // Merged regions are only recorded in the xlsx container.
    let mut merges_by_sheet: Vec<(String, MergedRegion)> = Vec::new();
    if let Sheets::Xlsx(ref mut xlsx) = workbook {
        if xlsx.load_merged_regions().is_ok() {
            for (sheet, _, dims) in xlsx.merged_regions() {
                merges_by_sheet.push((
                    sheet.clone(),
                    MergedRegion {
                        first_row: dims.start.0 as usize,
                        first_col: dims.start.1 as usize,
                        last_row: dims.end.0 as usize,
                        last_col: dims.end.1 as usize,
                    },
                ));
            }
        }
    }

    let mut grids = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|err| WorkbookError::Sheet {
                name: name.clone(),
                message: err.to_string(),
            })?;

        let (first_row, first_col) = range.start().unwrap_or((0, 0));
        let width = range.width();
        let mut rows: Vec<Vec<String>> = range
            .rows()
            .map(|cells| {
                let mut out: Vec<String> = cells.iter().map(cell_to_string).collect();
                out.resize(width, String::new());
                out
            })
            .collect();

        // Translate absolute merge coordinates into grid space before
        // expanding them.
        let merges: Vec<MergedRegion> = merges_by_sheet
            .iter()
            .filter(|(sheet, _)| sheet == &name)
            .filter_map(|(_, region)| {
                let fr = region.first_row.checked_sub(first_row as usize)?;
                let fc = region.first_col.checked_sub(first_col as usize)?;
                Some(MergedRegion {
                    first_row: fr,
                    first_col: fc,
                    last_row: region.last_row.saturating_sub(first_row as usize),
                    last_col: region.last_col.saturating_sub(first_col as usize),
                })
            })
            .collect();
        expand_merges(&mut rows, &merges);

        while rows.last().is_some_and(|row| row.iter().all(|c| c.is_empty())) {
            rows.pop();
        }

        debug!(
            target = "pricebook.pipeline",
            sheet = %name,
            rows = rows.len(),
            merges = merges.len(),
            "worksheet loaded"
        );
        grids.push(SheetGrid {
            name,
            first_row,
            rows,
        });
    }

    Ok(grids)
}

/// Repeat a merged region's anchor value into every cell it spans. Blank
/// cells plus inference downstream is the failure-prone alternative.
pub(crate) fn expand_merges(rows: &mut [Vec<String>], regions: &[MergedRegion]) {
    for region in regions {
        let Some(anchor) = rows
            .get(region.first_row)
            .and_then(|row| row.get(region.first_col))
            .cloned()
        else {
            continue;
        };
        if anchor.is_empty() {
            continue;
        }
        for r in region.first_row..=region.last_row.min(rows.len().saturating_sub(1)) {
            let row = &mut rows[r];
            if region.first_col >= row.len() {
                continue;
            }
            let last_col = region.last_col.min(row.len() - 1);
            for cell in &mut row[region.first_col..=last_col] {
                if cell.is_empty() {
                    *cell = anchor.clone();
                }
            }
        }
    }
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(value) => value.trim().to_string(),
        Data::Float(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
            format!("{}", *value as i64)
        }
        other => other.to_string().trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(cells: &[&[&str]]) -> Vec<Vec<String>> {
        cells
            .iter()
            .map(|row| row.iter().map(|c| c.to_string()).collect())
            .collect()
    }

    #[test]
    fn merged_value_repeats_into_every_spanned_row() {
        // Rows 1-2 share one vertically merged "Category" cell.
        let mut rows = grid(&[
            &["Category", "Name", "Price"],
            &["Electronics", "Router X1", "10.00"],
            &["", "Switch S8", "12.50"],
        ]);
        let merges = [MergedRegion {
            first_row: 1,
            first_col: 0,
            last_row: 2,
            last_col: 0,
        }];
        expand_merges(&mut rows, &merges);
        assert_eq!(rows[1][0], "Electronics");
        assert_eq!(rows[2][0], "Electronics");
    }

    #[test]
    fn horizontal_merge_fills_columns() {
        let mut rows = grid(&[&["Section A", "", "", "x"]]);
        let merges = [MergedRegion {
            first_row: 0,
            first_col: 0,
            last_row: 0,
            last_col: 2,
        }];
        expand_merges(&mut rows, &merges);
        assert_eq!(rows[0], vec!["Section A", "Section A", "Section A", "x"]);
    }

    #[test]
    fn merge_does_not_overwrite_populated_cells() {
        let mut rows = grid(&[&["A", "keep"], &["", ""]]);
        let merges = [MergedRegion {
            first_row: 0,
            first_col: 0,
            last_row: 1,
            last_col: 1,
        }];
        expand_merges(&mut rows, &merges);
        assert_eq!(rows[0][1], "keep");
        assert_eq!(rows[1][0], "A");
    }

    #[test]
    fn out_of_bounds_merge_is_ignored() {
        let mut rows = grid(&[&["A"]]);
        let merges = [MergedRegion {
            first_row: 5,
            first_col: 0,
            last_row: 6,
            last_col: 0,
        }];
        expand_merges(&mut rows, &merges);
        assert_eq!(rows[0][0], "A");
    }

    #[tokio::test]
    async fn unsupported_extension_is_rejected() {
        let err = load_workbook(PathBuf::from("/tmp/pricelist.csv"))
            .await
            .expect_err("csv is not a workbook");
        assert!(matches!(err, WorkbookError::Unsupported(ext) if ext == "csv"));
    }
}
