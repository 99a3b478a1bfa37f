//! Output writers for a finished run.
//!
//! # Submodules
//!
//! - [`csv`]: The tabular export, one row per canonical record
//! - [`json`]: Optional run document with the report and all records
//!
//! # Output Structure
//!
//! ```text
//! standardized_data.csv      # header + one row per record
//! reports/run.json           # {"report": {...}, "records": [...]} (when configured)
//! ```

pub mod csv;
pub mod json;
