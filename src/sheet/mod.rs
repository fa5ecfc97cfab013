pub mod grid;
pub mod selector;
pub mod workbook;

pub use grid::{SerializedRow, SerializedTable, serialize_sheet};
pub use selector::{SheetSelection, SheetSummary, select_sheets};
pub use workbook::{SheetGrid, WorkbookError, load_workbook};
