use crate::sheet::workbook::SheetGrid;

/// One serialized data row. `row` is the 1-based physical sheet row so the
/// parsing log can point a human at the exact cell range to fix.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedRow {
    pub row: u32,
    pub cells: Vec<String>,
}

/// Layout-preserving textual rendering of one worksheet. Column order and
/// count match the source; merged values were repeated upstream.
#[derive(Debug, Clone)]
pub struct SerializedTable {
    pub sheet: String,
    pub header: Vec<String>,
    pub rows: Vec<SerializedRow>,
}

impl SerializedTable {
    pub fn header_line(&self) -> String {
        render_line(&self.header)
    }

    /// Render a window of rows as a pipe table, header first and visibly
    /// separated from the data rows.
    pub fn render_window(&self, rows: &[SerializedRow]) -> String {
        let mut out = String::new();
        out.push_str(&self.header_line());
        out.push('\n');
        out.push_str(&separator_line(self.header.len()));
        out.push('\n');
        for row in rows {
            out.push_str(&render_line(&row.cells));
            out.push('\n');
        }
        out
    }
}

/// Serialize one dense grid. The header is the first row with any content;
/// fully blank rows after it are dropped, everything else is kept in order.
pub fn serialize_sheet(grid: &SheetGrid) -> SerializedTable {
    let width = grid.rows.iter().map(Vec::len).max().unwrap_or(0);

    let header_idx = grid
        .rows
        .iter()
        .position(|row| row.iter().any(|cell| !cell.is_empty()));

    let (header, rows) = match header_idx {
        Some(idx) => {
            let mut header = grid.rows[idx].clone();
            header.resize(width, String::new());
            let rows = grid.rows[idx + 1..]
                .iter()
                .enumerate()
                .filter(|(_, cells)| cells.iter().any(|cell| !cell.is_empty()))
                .map(|(offset, cells)| {
                    let mut cells = cells.clone();
                    cells.resize(width, String::new());
                    SerializedRow {
                        row: grid.first_row + (idx + 1 + offset) as u32 + 1,
                        cells,
                    }
                })
                .collect();
            (header, rows)
        }
        None => (Vec::new(), Vec::new()),
    };

    SerializedTable {
        sheet: grid.name.clone(),
        header,
        rows,
    }
}

fn render_line(cells: &[String]) -> String {
    let mut out = String::from("|");
    for cell in cells {
        out.push(' ');
        out.push_str(&cell.replace('|', "/"));
        out.push_str(" |");
    }
    out
}

fn separator_line(width: usize) -> String {
    let mut out = String::from("|");
    for _ in 0..width {
        out.push_str("---|");
    }
    out
}
