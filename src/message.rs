//! Decoding of fetched messages into sender, subject, body and attachment candidates.

use crate::attachment::sanitize_filename;
use crate::error::Error;
use crate::utils::extract_address;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail, parse_mail};
use std::collections::HashSet;

/// A file found in a message, before any validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentCandidate {
    pub filename: String,
    pub data: Vec<u8>,
}

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// Lowercased sender address, `None` when the From header holds nothing usable.
    pub sender: Option<String>,
    pub subject: String,
    pub body: String,
    pub message_id: Option<String>,
    pub attachments: Vec<AttachmentCandidate>,
}

/// Parse raw RFC 5322 bytes.
///
/// Encoded words in `From`, `Subject` and attachment filenames are decoded whatever
/// their charset. Attachment filenames are unique within the message once sanitized.
pub fn parse(raw: &[u8]) -> Result<ParsedMessage, Error> {
    let mail = parse_mail(raw)?;

    let from_header = mail
        .headers
        .get_first_value("From")
        .unwrap_or_default()
        .trim()
        .to_string();
    let sender = extract_address(&from_header);
    let subject = mail
        .headers
        .get_first_value("Subject")
        .unwrap_or_default()
        .trim()
        .to_string();
    let message_id = mail
        .headers
        .get_first_value("Message-ID")
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    let body = first_text_body(&mail).unwrap_or_default();

    let mut attachments = Vec::new();
    let mut seen = HashSet::new();
    collect_attachments(&mail, &mut attachments, &mut seen)?;

    Ok(ParsedMessage {
        sender,
        subject,
        body,
        message_id,
        attachments,
    })
}

fn first_text_body(mail: &ParsedMail) -> Option<String> {
    if mail.subparts.is_empty() {
        if mail.ctype.mimetype.eq_ignore_ascii_case("text/plain")
            && mail.get_content_disposition().disposition != DispositionType::Attachment
        {
            return mail.get_body().ok();
        }
        return None;
    }
    mail.subparts.iter().find_map(first_text_body)
}

fn collect_attachments(
    part: &ParsedMail,
    out: &mut Vec<AttachmentCandidate>,
    seen: &mut HashSet<String>,
) -> Result<(), Error> {
    for sub in &part.subparts {
        collect_attachments(sub, out, seen)?;
    }

    let disposition = part.get_content_disposition();
    if disposition.disposition != DispositionType::Attachment {
        return Ok(());
    }
    let Some(raw_name) = disposition.params.get("filename") else {
        log::debug!("Skipping attachment part without a filename");
        return Ok(());
    };
    let filename = decode_words(raw_name);
    if filename.trim().is_empty() {
        return Ok(());
    }

    let data = part.get_body_raw()?;
    let filename = unique_filename(&filename, seen);
    out.push(AttachmentCandidate { filename, data });
    Ok(())
}

/// Decodes RFC 2047 encoded words that some clients put in parameter values.
fn decode_words(value: &str) -> String {
    if !value.contains("=?") {
        return value.to_string();
    }
    let line = format!("X-Filename: {value}");
    match mailparse::parse_header(line.as_bytes()) {
        Ok((header, _)) => header.get_value(),
        Err(_) => value.to_string(),
    }
}

/// Appends `_2`, `_3`, ... to the stem until the sanitized name has not been seen yet.
fn unique_filename(filename: &str, seen: &mut HashSet<String>) -> String {
    let mut candidate = filename.to_string();
    let (stem, ext) = match filename.rfind('.') {
        Some(idx) if idx > 0 => filename.split_at(idx),
        _ => (filename, ""),
    };
    let mut counter = 2;
    while !seen.insert(sanitize_filename(&candidate)) {
        candidate = format!("{stem}_{counter}{ext}");
        counter += 1;
    }
    candidate
}
