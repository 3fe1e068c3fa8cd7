use std::fs::File;
use std::io;
use std::io::BufRead;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Length of the hex prefix kept from the listing digest.
const EXTERNAL_ID_LEN: usize = 16;

/// Builds a stable listing id from the most specific identifier a provider
/// gave us (usually the posting URL) plus the normalized title.
pub fn build_external_id(seed: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.trim().to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(title.trim().to_lowercase().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..EXTERNAL_ID_LEN].to_string()
}

/// Clamps a raw percentage into `[0, 100]`. Non-finite readings are rejected.
pub fn clamp_percent(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value.clamp(0.0, 100.0))
    } else {
        None
    }
}

/// Splits a separator-delimited setting, dropping blanks.
pub fn split_list(raw: &str, sep: char) -> Vec<String> {
    raw.split(sep)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Reads a file line-by-line, returning all non-empty trimmed lines.
/// Lines starting with `#` are treated as comments.
pub fn read_lines(path: &str) -> io::Result<Vec<String>> {
    let file = File::open(Path::new(path))?;
    let reader = io::BufReader::new(file);
    let lines = reader
        .lines()
        .filter_map(|line| {
            let line = line.ok()?;
            let trimmed = line.trim().to_string();
            if trimmed.is_empty() || trimmed.starts_with('#') { None } else { Some(trimmed) }
        })
        .collect();
    Ok(lines)
}
