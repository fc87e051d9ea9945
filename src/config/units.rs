// src/config/units.rs

//! Parsers for the small string grammars used in config files.

use std::path::PathBuf;
use std::time::Duration;

use crate::container::{PortRequest, VolumeBinding};

/// Parse a duration like `500ms`, `30s`, `5m`, `2h` or `7d`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' missing unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;
    let unit = unit_part.trim().to_lowercase();

    let secs = |mult: u64| {
        value
            .checked_mul(mult)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    };

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => secs(1),
        "m" => secs(60),
        "h" => secs(60 * 60),
        "d" => secs(24 * 60 * 60),
        _ => Err(format!(
            "unsupported duration unit '{unit}'; expected ms, s, m, h, or d"
        )),
    }
}

/// Parse a memory size like `268435456`, `512k`, `256m` or `2g` (binary
/// multiples).
pub fn parse_memory(s: &str) -> Result<u64, String> {
    let s = s.trim().to_lowercase();
    let digits_end = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if digits_end == 0 {
        return Err(format!("invalid memory size '{s}'"));
    }

    let (num_part, unit_part) = s.split_at(digits_end);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid memory size '{s}': {e}"))?;
    let mult: u64 = match unit_part.trim_end_matches(['b', 'i']) {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        other => return Err(format!("unsupported memory unit '{other}' in '{s}'")),
    };

    match value.checked_mul(mult) {
        Some(0) => Err("memory limit must be greater than zero".to_string()),
        Some(bytes) => Ok(bytes),
        None => Err(format!("memory size '{s}' is too large")),
    }
}

/// Parse `"8080:80"` (host:container) or `"80"` (auto-assigned host port).
pub fn parse_port(s: &str) -> Result<PortRequest, String> {
    let parse_one = |p: &str| -> Result<u16, String> {
        match p.trim().parse::<u16>() {
            Ok(0) | Err(_) => Err(format!("invalid port '{p}' in '{s}'")),
            Ok(port) => Ok(port),
        }
    };

    match s.split_once(':') {
        Some((host, container)) => Ok(PortRequest {
            host_port: Some(parse_one(host)?),
            container_port: parse_one(container)?,
        }),
        None => Ok(PortRequest {
            host_port: None,
            container_port: parse_one(s)?,
        }),
    }
}

/// Parse `"/host/path:/container/path[:ro|:rw]"`.
pub fn parse_volume(s: &str) -> Result<VolumeBinding, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let (host, container, read_only) = match parts.as_slice() {
        [host, container] => (*host, *container, false),
        [host, container, "ro"] => (*host, *container, true),
        [host, container, "rw"] => (*host, *container, false),
        _ => {
            return Err(format!(
                "invalid volume '{s}'; expected host:container[:ro]"
            ));
        }
    };

    if host.is_empty() || container.is_empty() {
        return Err(format!("invalid volume '{s}'; empty path"));
    }
    let container_path = PathBuf::from(container);
    if !container_path.is_absolute() {
        return Err(format!(
            "invalid volume '{s}'; container path must be absolute"
        ));
    }

    Ok(VolumeBinding {
        host_path: PathBuf::from(host),
        container_path,
        read_only,
    })
}
