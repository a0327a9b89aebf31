//! Kubernetes resource quantities.
//!
//! Quantities are converted to integers at the boundary: CPU in
//! millicores, memory and custom resources in whole units. Fractions
//! round up, matching how the API server accounts for requests.

/// Parse a quantity into thousandths of its base unit.
///
/// `"250m"` → 250, `"2"` → 2000, `"1Ki"` → 1_024_000, `"1e3"` → 1_000_000.
pub fn parse_milli(s: &str) -> Option<u64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() || number == "." {
        return None;
    }

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    let digits = format!("{int_part}{frac_part}");
    let mantissa: u128 = digits.parse().ok()?;
    let frac_scale = 10u128.checked_pow(frac_part.len() as u32)?;

    let (mul_num, mul_den) = multiplier(suffix)?;

    let numerator = mantissa.checked_mul(mul_num)?.checked_mul(1000)?;
    let denominator = frac_scale.checked_mul(mul_den)?;
    let value = numerator.div_ceil(denominator);
    u64::try_from(value).ok()
}

/// Parse a CPU quantity into millicores.
pub fn parse_cpu_millis(s: &str) -> Option<u64> {
    parse_milli(s)
}

/// Parse a memory (or any whole-unit) quantity into base units.
pub fn parse_units(s: &str) -> Option<u64> {
    parse_milli(s).map(|m| m.div_ceil(1000))
}

/// Render millicores the way `kubectl` would.
pub fn format_cpu_millis(millis: u64) -> String {
    if millis % 1000 == 0 {
        (millis / 1000).to_string()
    } else {
        format!("{millis}m")
    }
}

/// Render a byte count using the largest exact binary suffix.
pub fn format_bytes(bytes: u64) -> String {
    const SUFFIXES: [(&str, u64); 4] = [
        ("Ti", 1 << 40),
        ("Gi", 1 << 30),
        ("Mi", 1 << 20),
        ("Ki", 1 << 10),
    ];
    for (suffix, size) in SUFFIXES {
        if bytes >= size && bytes % size == 0 {
            return format!("{}{suffix}", bytes / size);
        }
    }
    bytes.to_string()
}

fn multiplier(suffix: &str) -> Option<(u128, u128)> {
    let m = match suffix {
        "" => (1, 1),
        "n" => (1, 1_000_000_000),
        "u" => (1, 1_000_000),
        "m" => (1, 1000),
        "k" => (1000, 1),
        "M" => (1000u128.pow(2), 1),
        "G" => (1000u128.pow(3), 1),
        "T" => (1000u128.pow(4), 1),
        "P" => (1000u128.pow(5), 1),
        "E" => (1000u128.pow(6), 1),
        "Ki" => (1 << 10, 1),
        "Mi" => (1 << 20, 1),
        "Gi" => (1 << 30, 1),
        "Ti" => (1 << 40, 1),
        "Pi" => (1 << 50, 1),
        "Ei" => (1 << 60, 1),
        exp if exp.starts_with(['e', 'E']) => {
            let power: u32 = exp[1..].parse().ok()?;
            (10u128.checked_pow(power)?, 1)
        }
        _ => return None,
    };
    Some(m)
}
