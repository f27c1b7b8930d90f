//! Hostlist string expansion.
//!
//! Supported syntaxes:
//! - Single: `foo-cmm01`
//! - Range: `foo-cmm[1-8]`, with an optional suffix after the bracket;
//!   zero padding of the start bound is preserved (`[01-12]` expands to
//!   `01, 02, ... 12`)
//! - Comma-separated combinations of the above
//!
//! NOT supported (explicitly rejected):
//! - Nested or multiple brackets per name (`a[1-2]b[3-4]`)
//! - Stepped ranges (`[1-9/2]`)
//! - Set syntax (`[1,3,5]`)

/// Expand a hostlist string into individual hostnames.
///
/// Returns an error for unsupported syntaxes or malformed inputs.
pub fn expand_hostlist(list: &str) -> Result<Vec<String>, HostlistError> {
    let mut hosts = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        expand_one(part, &mut hosts)?;
    }
    if hosts.is_empty() {
        return Err(HostlistError::Empty);
    }
    Ok(hosts)
}

fn expand_one(name: &str, out: &mut Vec<String>) -> Result<(), HostlistError> {
    let Some(open) = name.find('[') else {
        if name.contains(']') {
            return Err(HostlistError::InvalidFormat(format!(
                "unmatched ']' in '{}'",
                name
            )));
        }
        out.push(name.to_owned());
        return Ok(());
    };

    let close = name.find(']').ok_or_else(|| {
        HostlistError::InvalidFormat(format!("unmatched '[' in '{}'", name))
    })?;
    if close < open {
        return Err(HostlistError::InvalidFormat(format!(
            "']' before '[' in '{}'",
            name
        )));
    }
    let suffix = &name[close + 1..];
    if suffix.contains('[') || suffix.contains(']') {
        return Err(HostlistError::UnsupportedSyntax(format!(
            "multiple bracket groups in '{}' (one range per name)",
            name
        )));
    }

    let prefix = &name[..open];
    let range = &name[open + 1..close];
    let dash = range.find('-').ok_or_else(|| {
        HostlistError::InvalidFormat(format!("expected START-END inside brackets in '{}'", name))
    })?;
    let start_str = &range[..dash];
    let end_str = &range[dash + 1..];

    let start: u32 = start_str.parse().map_err(|_| {
        HostlistError::InvalidFormat(format!("invalid range start '{}' in '{}'", start_str, name))
    })?;
    let end: u32 = end_str.parse().map_err(|_| {
        HostlistError::InvalidFormat(format!("invalid range end '{}' in '{}'", end_str, name))
    })?;
    if start > end {
        return Err(HostlistError::InvalidRange(format!(
            "range start {} > end {} in '{}'",
            start, end, name
        )));
    }

    // Width of the start bound sets the zero padding for the whole range.
    let width = start_str.len();
    for n in start..=end {
        out.push(format!("{}{:0width$}{}", prefix, n, suffix, width = width));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum HostlistError {
    Empty,
    InvalidFormat(String),
    InvalidRange(String),
    UnsupportedSyntax(String),
}

impl std::fmt::Display for HostlistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostlistError::Empty => write!(f, "empty hostlist"),
            HostlistError::InvalidFormat(s) => write!(f, "Invalid hostlist format: {}", s),
            HostlistError::InvalidRange(s) => write!(f, "Invalid range: {}", s),
            HostlistError::UnsupportedSyntax(s) => write!(f, "Unsupported syntax: {}", s),
        }
    }
}

impl std::error::Error for HostlistError {}
