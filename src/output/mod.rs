mod csv;
pub mod json;

pub use csv::{print_csv, write_csv};
pub use json::{print_json, write_json};
