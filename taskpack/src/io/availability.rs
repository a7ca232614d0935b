//! Loading the availability file.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{instrument, warn};

use crate::core::availability::{AvailabilityConfig, DEFAULT_AVAILABILITY, parse_availability};
use crate::core::types::{Outcome, Refusal, RefusalCode};
use crate::io::artifacts::write_atomic;

/// Load availability. A missing or invalid file is a refusal, not an error:
/// the router cannot plan without it.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_availability(path: &Path) -> Result<Outcome<AvailabilityConfig>> {
    if !path.exists() {
        warn!("availability file missing");
        return Ok(Outcome::Refused(Refusal::new(
            RefusalCode::AvailabilityInvalid,
            format!("availability file {} not found", path.display()),
            "run `taskpack init` or pass --availability <file>",
        )));
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    match parse_availability(&text) {
        Ok(config) => Ok(Outcome::Done(config)),
        Err(errors) => {
            warn!(error_count = errors.len(), "availability file invalid");
            Ok(Outcome::Refused(
                Refusal::new(
                    RefusalCode::AvailabilityInvalid,
                    format!("availability file {} is invalid", path.display()),
                    "fix every listed problem in the availability file",
                )
                .with_details(errors),
            ))
        }
    }
}

/// Write the default availability file unless one exists (or `force`).
/// Returns whether the file was written.
pub fn write_default_availability(path: &Path, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    write_atomic(path, DEFAULT_AVAILABILITY.as_bytes())?;
    Ok(true)
}
