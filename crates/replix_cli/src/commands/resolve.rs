//! Resolve command implementation.

use super::{load_metadata, CliError};
use replix_commit::IndexFormatVersion;
use replix_replication::decide_startup;
use std::path::Path;

/// Names the startup decision a manager would make for the metadata in `path`.
pub fn decision(
    path: &Path,
    format_version: u32,
    shut_down_when_missing: bool,
) -> Result<&'static str, CliError> {
    let metadata = load_metadata(path)?;
    let declared = IndexFormatVersion::new(format_version);
    let decision = decide_startup(&metadata, declared, shut_down_when_missing)?;
    tracing::debug!(?decision, %declared, "resolved startup decision");
    Ok(decision.name())
}

/// Runs the resolve command.
pub fn run(path: &Path, format_version: u32, shut_down_when_missing: bool) -> Result<(), CliError> {
    println!("{}", decision(path, format_version, shut_down_when_missing)?);
    Ok(())
}
