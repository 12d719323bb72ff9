use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::check::{CheckRequest, CheckResponse};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to read or write check payload: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed check payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read a check request from `path`, or from stdin when `None`.
pub fn read_request(path: Option<&Path>) -> Result<CheckRequest, ReportError> {
    let raw = match path {
        Some(path) => {
            debug!(path = %path.display(), "reading request from file");
            std::fs::read_to_string(path)?
        }
        None => {
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw)?;
            raw
        }
    };
    parse_request(&raw)
}

pub fn parse_request(raw: &str) -> Result<CheckRequest, ReportError> {
    Ok(serde_json::from_str(raw)?)
}

/// Write the resolved versions as JSON to stdout (default) or to a file.
#[instrument(skip(response), fields(versions = response.len()))]
pub fn output(response: &CheckResponse, output_path: Option<&Path>) -> Result<(), ReportError> {
    let json = serde_json::to_string(response)?;
    match output_path {
        None => {
            debug!("writing response to stdout");
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{json}")?;
            stdout.flush()?;
        }
        Some(path) => {
            debug!(path = %path.display(), "writing response to file");
            std::fs::write(path, format!("{json}\n"))?;
        }
    }
    Ok(())
}
