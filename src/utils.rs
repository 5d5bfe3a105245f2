use mailparse::MailAddr;
use sha2::{Digest, Sha256};

/// Extracts the first email address found in a `From` style header.
///
/// Return `None` if parsing fails.
///
/// Returns the first address if multiple are present.
pub fn extract_address(input: &str) -> Option<String> {
    let input_lower = input.trim().to_lowercase();
    if input_lower.is_empty() {
        return None;
    }

    mailparse::addrparse(&input_lower)
        .ok()
        .and_then(|addr| match addr.first() {
            Some(MailAddr::Single(single)) => Some(single.addr.clone()),
            Some(MailAddr::Group(group)) => group.addrs.first().map(|single| single.addr.clone()),
            None => None,
        })
        .filter(|addr| is_plausible_address(addr))
}

/// Minimal syntax check: exactly one `@`, non-empty local part and a dotted domain.
pub fn is_plausible_address(addr: &str) -> bool {
    let Some((local, domain)) = addr.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !addr.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// One-way sender identity used for rate limiting and storage names.
pub fn sender_hash(addr: &str) -> String {
    hex::encode(Sha256::digest(addr.trim().to_lowercase().as_bytes()))
}

/// SHA-256 of arbitrary content, hex encoded.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Masks the local part of an address for logs and metadata.
///
/// `liusoee@gmail.com` becomes `li***ee@gmail.com`.
pub fn mask_address(addr: &str) -> String {
    let Some((local, domain)) = addr.split_once('@') else {
        return addr.to_string();
    };
    let chars: Vec<char> = local.chars().collect();
    let masked: String = match chars.len() {
        0 => String::new(),
        1..=3 => chars
            .iter()
            .take(1)
            .chain(std::iter::repeat_n(&'*', chars.len() - 1))
            .collect(),
        4..=6 => chars
            .iter()
            .take(1)
            .copied()
            .chain(std::iter::repeat_n('*', chars.len() - 2))
            .chain(chars.iter().skip(chars.len() - 1).copied())
            .collect(),
        n => chars
            .iter()
            .take(2)
            .copied()
            .chain(std::iter::repeat_n('*', n - 4))
            .chain(chars.iter().skip(n - 2).copied())
            .collect(),
    };
    format!("{masked}@{domain}")
}

/// Formats a byte count the way notification templates show it.
pub fn human_size(size: u64) -> String {
    const KB: f64 = 1024.0;
    let size_f = size as f64;
    if size_f < KB {
        format!("{size} B")
    } else if size_f < KB * KB {
        format!("{:.1} KB", size_f / KB)
    } else if size_f < KB * KB * KB {
        format!("{:.1} MB", size_f / (KB * KB))
    } else {
        format!("{:.1} GB", size_f / (KB * KB * KB))
    }
}

/// Turns a lettre SMTP error into a log-friendly string.
pub fn format_smtp_error(e: lettre::transport::smtp::Error) -> String {
    match e.status() {
        Some(code) => format!("SMTP {code}: {e}"),
        None => format!("SMTP: {e}"),
    }
}
