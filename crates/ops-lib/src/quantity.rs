//! Resource quantity parsing and formatting
//!
//! CPU quantities are plain decimals ("2", "0.5") or millicores ("500m").
//! Memory quantities are plain decimals or carry one of the suffixes
//! Ki/K, Mi/M, Gi/G, Ti/T, Pi/P, Ei/E, matched case-insensitively. Every
//! memory suffix is a power of 1024: "1M" is the same as "1Mi".
//!
//! The lenient parsers never fail and return 0 for input they cannot read,
//! which is what the cluster report relies on. The `try_` variants return a
//! [`QuantityError`] instead.

use crate::models::QuantityValue;
use std::fmt;
use thiserror::Error;

/// Binary memory suffixes with their power of 1024, in match order
const MEMORY_SUFFIXES: &[(&str, &str, i32)] = &[
    ("KI", "K", 1),
    ("MI", "M", 2),
    ("GI", "G", 3),
    ("TI", "T", 4),
    ("PI", "P", 5),
    ("EI", "E", 6),
];

const MEMORY_UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Kind of resource a quantity describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => f.write_str("cpu"),
            ResourceKind::Memory => f.write_str("memory"),
        }
    }
}

/// A quantity string could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {kind} quantity {input:?}")]
pub struct QuantityError {
    pub kind: ResourceKind,
    pub input: String,
}

impl QuantityError {
    fn new(kind: ResourceKind, input: &str) -> Self {
        Self {
            kind,
            input: input.to_string(),
        }
    }
}

fn parse_decimal(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a CPU quantity into cores, failing on unreadable input
pub fn try_parse_cpu(s: &str) -> Result<f64, QuantityError> {
    let trimmed = s.trim();
    let cores = match trimmed.strip_suffix('m') {
        Some(millis) => parse_decimal(millis).map(|v| v / 1000.0),
        None => parse_decimal(trimmed),
    };
    cores.ok_or_else(|| QuantityError::new(ResourceKind::Cpu, s))
}

/// Parse a CPU quantity into cores, returning 0 for unreadable input
pub fn parse_cpu(s: &str) -> f64 {
    try_parse_cpu(s).unwrap_or(0.0)
}

/// Parse a memory quantity into bytes, failing on unreadable input
pub fn try_parse_memory(s: &str) -> Result<f64, QuantityError> {
    let upper = s.trim().to_ascii_uppercase();

    for (binary, short, power) in MEMORY_SUFFIXES {
        if let Some(number) = upper
            .strip_suffix(binary)
            .or_else(|| upper.strip_suffix(short))
        {
            return parse_decimal(number)
                .map(|v| v * 1024f64.powi(*power))
                .ok_or_else(|| QuantityError::new(ResourceKind::Memory, s));
        }
    }

    parse_decimal(&upper).ok_or_else(|| QuantityError::new(ResourceKind::Memory, s))
}

/// Parse a memory quantity into bytes, returning 0 for unreadable input
pub fn parse_memory(s: &str) -> f64 {
    try_parse_memory(s).unwrap_or(0.0)
}

/// Cores for a raw quantity value; numbers are taken as cores already
pub fn cpu_cores(value: &QuantityValue) -> f64 {
    match value {
        QuantityValue::Number(n) if n.is_finite() => *n,
        QuantityValue::Number(_) => 0.0,
        QuantityValue::Text(s) => parse_cpu(s),
    }
}

/// Bytes for a raw quantity value; numbers are taken as bytes already
pub fn memory_bytes(value: &QuantityValue) -> f64 {
    match value {
        QuantityValue::Number(n) if n.is_finite() => *n,
        QuantityValue::Number(_) => 0.0,
        QuantityValue::Text(s) => parse_memory(s),
    }
}

/// Whole pod-slot count for a raw quantity value, 0 when unreadable
pub fn pod_slots(value: &QuantityValue) -> u64 {
    match value {
        QuantityValue::Number(n) if n.is_finite() && *n >= 0.0 => *n as u64,
        QuantityValue::Number(_) => 0,
        QuantityValue::Text(s) => s.trim().parse().unwrap_or(0),
    }
}

/// Render a byte count with a binary unit and two decimals, e.g. "2.00 GiB"
pub fn format_memory(bytes: f64) -> String {
    let mut value = bytes;
    let mut unit = 0;

    while value >= 1024.0 && unit < MEMORY_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", value, MEMORY_UNITS[unit])
}

/// Render a CPU amount with two decimals, e.g. "1.50 cores"
pub fn format_cores(cores: f64) -> String {
    format!("{:.2} cores", cores)
}
