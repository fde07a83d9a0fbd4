use thiserror::Error;

/// Errors raised while parsing a CPU or memory quantity string
/// (spec.md §4.3 "CPU/memory normalisation").
#[derive(Debug, Error, PartialEq)]
pub enum ResourceParseError {
    #[error("'{0}' is not a valid CPU quantity")]
    InvalidCpu(String),
    #[error("'{0}' is not a valid memory quantity")]
    InvalidMemory(String),
}

/// Parse a CPU quantity. `"1500m"` parses to `1.5` (millicores); a plain
/// number is taken verbatim as fractional cores.
pub fn parse_cpu(raw: &str) -> Result<f64, ResourceParseError> {
    let trimmed = raw.trim();
    if let Some(milli) = trimmed.strip_suffix('m') {
        let value: f64 = milli
            .parse()
            .map_err(|_| ResourceParseError::InvalidCpu(raw.to_string()))?;
        Ok(value / 1000.0)
    } else {
        trimmed
            .parse()
            .map_err(|_| ResourceParseError::InvalidCpu(raw.to_string()))
    }
}

/// Parse a memory quantity in bytes. `Ki`, `Mi`, `Gi`, `Ti` suffixes are
/// binary multiples (1024); a plain number is taken as raw bytes.
pub fn parse_memory(raw: &str) -> Result<u64, ResourceParseError> {
    let trimmed = raw.trim();

    const UNITS: &[(&str, u64)] = &[
        ("Ti", 1024u64.pow(4)),
        ("Gi", 1024u64.pow(3)),
        ("Mi", 1024u64.pow(2)),
        ("Ki", 1024),
    ];

    for (suffix, multiplier) in UNITS {
        if let Some(digits) = trimmed.strip_suffix(suffix) {
            let value: f64 = digits
                .parse()
                .map_err(|_| ResourceParseError::InvalidMemory(raw.to_string()))?;
            return Ok((value * *multiplier as f64) as u64);
        }
    }

    trimmed
        .parse()
        .map_err(|_| ResourceParseError::InvalidMemory(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_millicore_cpu_string() {
        assert_eq!(parse_cpu("1500m").unwrap(), 1.5);
        assert_eq!(parse_cpu("500m").unwrap(), 0.5);
    }

    #[test]
    fn parses_plain_cpu_number() {
        assert_eq!(parse_cpu("2.5").unwrap(), 2.5);
        assert_eq!(parse_cpu("4").unwrap(), 4.0);
    }

    #[test]
    fn rejects_garbage_cpu_string() {
        assert!(parse_cpu("not-a-number").is_err());
        assert!(parse_cpu("5x").is_err());
    }

    #[test]
    fn parses_binary_memory_suffixes() {
        assert_eq!(parse_memory("1Ki").unwrap(), 1024);
        assert_eq!(parse_memory("1Mi").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory("2Gi").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1Ti").unwrap(), 1024u64.pow(4));
    }

    #[test]
    fn parses_plain_byte_count() {
        assert_eq!(parse_memory("2048").unwrap(), 2048);
    }
}
