//! Configuration value parsing helpers

use std::time::Duration;

/// Parse a duration string like "800ms", "30s", "5m", "1h30m".
///
/// A bare number is taken as seconds. Zero is allowed.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("Empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut current_num = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            current_num.push(c);
            continue;
        }

        let num: u64 = current_num
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", s))?;
        current_num.clear();

        let part = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Some(Duration::from_millis(num))
            }
            's' => Some(Duration::from_secs(num)),
            'm' => num.checked_mul(60).map(Duration::from_secs),
            'h' => num.checked_mul(3600).map(Duration::from_secs),
            'd' => num.checked_mul(86400).map(Duration::from_secs),
            _ => return Err(format!("Unknown duration unit: {}", c)),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| format!("Duration too large: {}", s))?;
    }

    if !current_num.is_empty() {
        return Err(format!("Missing unit in duration: {}", s));
    }

    Ok(total)
}

/// Parse a listen address port, rejecting 0.
pub fn parse_port(s: &str) -> Result<u16, String> {
    match s.trim().parse::<u16>() {
        Ok(0) => Err("Port must be non-zero".to_string()),
        Ok(port) => Ok(port),
        Err(_) => Err(format!("Invalid port: {}", s)),
    }
}
