//! Inspect command implementation.

use super::{load_metadata, CliError};
use std::path::Path;

/// Renders the metadata in `path` as pretty JSON.
pub fn render(path: &Path) -> Result<String, CliError> {
    let metadata = load_metadata(path)?;
    Ok(serde_json::to_string_pretty(&metadata)?)
}

/// Runs the inspect command.
pub fn run(path: &Path) -> Result<(), CliError> {
    println!("{}", render(path)?);
    Ok(())
}
