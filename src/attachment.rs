//! Attachment checks run before anything touches the upload directory.

use crate::config::{Config, normalize_extension};
use crate::db::AttachmentRule;
use crate::utils::content_hash;
use mime_guess::MimeGuess;

/// Maximum filename length accepted from a message, in characters.
const MAX_FILENAME_LEN: usize = 255;

/// Stored names are cut to this many characters, extension included.
const MAX_SANITIZED_LEN: usize = 200;

const UNSAFE_FILENAME_PARTS: &[&str] = &["..", "/", "\\", ":", "*", "?", "\"", "<", ">", "|"];

const SCRIPT_EXTENSIONS: &[&str] = &[
    ".bat", ".cmd", ".com", ".exe", ".scr", ".vbs", ".js", ".ps1", ".sh",
];

const EXECUTABLE_SIGNATURES: &[(&[u8], &str)] = &[
    (b"MZ", "PE executable"),
    (b"\x7fELF", "ELF executable"),
    (b"\xfe\xed\xfa\xce", "Mach-O executable"),
    (b"\xfe\xed\xfa\xcf", "Mach-O executable"),
    (b"\xce\xfa\xed\xfe", "Mach-O executable"),
    (b"\xcf\xfa\xed\xfe", "Mach-O executable"),
    (b"#!", "script"),
];

/// Why an attachment was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("unsafe filename")]
    UnsafeFilename,
    #[error("empty file")]
    Empty,
    #[error("file too large: {size} bytes (max: {max} bytes)")]
    TooLarge { size: usize, max: usize },
    #[error("file has no extension")]
    MissingExtension,
    #[error("file type {0} is blocked")]
    BlockedExtension(String),
    #[error("file type {0} is not allowed")]
    ExtensionNotAllowed(String),
    #[error("executable content detected ({0})")]
    Executable(&'static str),
    #[error("too many attachments (max: {0})")]
    TooMany(usize),
}

/// What validation learned about an accepted attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub size: usize,
    pub mime_type: String,
    /// Lowercase, with the leading dot.
    pub extension: String,
    /// SHA-256 of the content, hex encoded.
    pub hash: String,
    pub sanitized_filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid(FileInfo),
    Invalid(Rejection),
}

/// Limits applied to the attachments of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentPolicy {
    pub max_file_size: usize,
    pub max_file_count: usize,
    /// Empty means any extension that is not blocked.
    pub allowed_extensions: Vec<String>,
    pub blocked_extensions: Vec<String>,
}

impl AttachmentPolicy {
    /// The policy used when no attachment rule is active.
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_file_size: config.max_attachment_size,
            max_file_count: config.max_attachment_count,
            allowed_extensions: config.allowed_extensions.clone(),
            blocked_extensions: Vec::new(),
        }
    }

    pub fn from_rule(rule: &AttachmentRule) -> Self {
        let normalize = |list: &[String]| -> Vec<String> {
            list.iter().map(|ext| normalize_extension(ext)).collect()
        };
        Self {
            max_file_size: usize::try_from(rule.max_file_size).unwrap_or(0),
            max_file_count: usize::try_from(rule.max_file_count).unwrap_or(0),
            allowed_extensions: normalize(&rule.allowed_extensions),
            blocked_extensions: normalize(&rule.blocked_extensions),
        }
    }

    /// Runs every check in order and stops at the first failure.
    pub fn validate(&self, filename: &str, data: &[u8]) -> Validation {
        match self.check(filename, data) {
            Ok(info) => Validation::Valid(info),
            Err(rejection) => Validation::Invalid(rejection),
        }
    }

    fn check(&self, filename: &str, data: &[u8]) -> Result<FileInfo, Rejection> {
        if !is_safe_filename(filename) {
            return Err(Rejection::UnsafeFilename);
        }
        if data.is_empty() {
            return Err(Rejection::Empty);
        }
        if data.len() > self.max_file_size {
            return Err(Rejection::TooLarge {
                size: data.len(),
                max: self.max_file_size,
            });
        }

        let extension = extension_of(filename).ok_or(Rejection::MissingExtension)?;
        if self.blocked_extensions.contains(&extension) {
            return Err(Rejection::BlockedExtension(extension));
        }
        if !self.allowed_extensions.is_empty() && !self.allowed_extensions.contains(&extension)
        {
            return Err(Rejection::ExtensionNotAllowed(extension));
        }

        if let Some((_, kind)) = EXECUTABLE_SIGNATURES
            .iter()
            .find(|(magic, _)| data.starts_with(magic))
        {
            return Err(Rejection::Executable(*kind));
        }
        if SCRIPT_EXTENSIONS.contains(&extension.as_str()) {
            return Err(Rejection::Executable("script extension"));
        }

        Ok(FileInfo {
            size: data.len(),
            mime_type: sniff_mime(filename, data),
            extension,
            hash: content_hash(data),
            sanitized_filename: sanitize_filename(filename),
        })
    }
}

fn is_safe_filename(filename: &str) -> bool {
    !filename.trim().is_empty()
        && filename.chars().count() <= MAX_FILENAME_LEN
        && !filename.chars().any(char::is_control)
        && !UNSAFE_FILENAME_PARTS
            .iter()
            .any(|part| filename.contains(part))
}

fn extension_of(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(normalize_extension(ext))
}

fn sniff_mime(filename: &str, data: &[u8]) -> String {
    let guessed = MimeGuess::from_path(filename).first_or_octet_stream();
    let sniffed = if data.starts_with(b"%PDF-") {
        Some("application/pdf")
    } else if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if data.starts_with(b"\xff\xd8\xff") {
        Some("image/jpeg")
    } else if data.starts_with(b"PK\x03\x04") && guessed.type_() != mime_guess::mime::APPLICATION
    {
        // Office documents are zip containers too; trust their extension.
        Some("application/zip")
    } else {
        None
    };
    sniffed.map_or_else(|| guessed.essence_str().to_string(), str::to_string)
}

/// Replaces anything outside `[A-Za-z0-9.-_()[]{}]` with `_` and caps the length,
/// keeping the extension.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || ".-_()[]{}".contains(c) {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.len() <= MAX_SANITIZED_LEN {
        return cleaned;
    }
    let (stem, ext) = match cleaned.rfind('.') {
        Some(idx) if idx > 0 && cleaned.len() - idx < MAX_SANITIZED_LEN => cleaned.split_at(idx),
        _ => (cleaned.as_str(), ""),
    };
    let stem: String = stem.chars().take(MAX_SANITIZED_LEN - ext.len()).collect();
    format!("{stem}{ext}")
}

/// Coarse category stored with each upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileTypeTag {
    Markdown,
    Jupyter,
    Code,
    Documentation,
    Readme,
    Other,
}

impl FileTypeTag {
    pub fn from_filename(filename: &str) -> Self {
        let Some(ext) = extension_of(filename) else {
            return Self::Other;
        };
        match ext.as_str() {
            ".md" => Self::Markdown,
            ".ipynb" => Self::Jupyter,
            ".py" | ".js" | ".ts" | ".java" | ".cpp" | ".c" | ".h" | ".go" | ".rs" | ".rb"
            | ".php" | ".cs" | ".swift" | ".kt" | ".sql" => Self::Code,
            ".txt" | ".doc" | ".docx" | ".pdf" => Self::Documentation,
            ".readme" => Self::Readme,
            _ => Self::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Jupyter => "jupyter",
            Self::Code => "code",
            Self::Documentation => "documentation",
            Self::Readme => "readme",
            Self::Other => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn policy() -> AttachmentPolicy {
        AttachmentPolicy {
            max_file_size: 1024,
            max_file_count: 5,
            allowed_extensions: vec![".pdf".into(), ".txt".into(), ".sh".into(), ".zip".into()],
            blocked_extensions: vec![".zip".into()],
        }
    }

    #[rstest]
    #[case::traversal("../secret.pdf", b"%PDF-1.4".as_slice(), Rejection::UnsafeFilename)]
    #[case::traversal_big("../secret", &[b'a'; 4096], Rejection::UnsafeFilename)]
    #[case::backslash("dir\\file.txt", b"x".as_slice(), Rejection::UnsafeFilename)]
    #[case::pipe("a|b.txt", b"x".as_slice(), Rejection::UnsafeFilename)]
    #[case::control("a\u{7}.txt", b"x".as_slice(), Rejection::UnsafeFilename)]
    #[case::blank("   ", b"x".as_slice(), Rejection::UnsafeFilename)]
    #[case::empty("notes.txt", b"".as_slice(), Rejection::Empty)]
    #[case::too_large("notes.txt", &[b'a'; 1025], Rejection::TooLarge { size: 1025, max: 1024 })]
    #[case::no_extension("README", b"x".as_slice(), Rejection::MissingExtension)]
    #[case::blocked("archive.zip", b"PK\x03\x04".as_slice(), Rejection::BlockedExtension(".zip".into()))]
    #[case::not_allowed("photo.PNG", b"x".as_slice(), Rejection::ExtensionNotAllowed(".png".into()))]
    #[case::pe("invoice.pdf", b"MZ\x90\x00".as_slice(), Rejection::Executable("PE executable"))]
    #[case::elf("notes.txt", b"\x7fELF\x02".as_slice(), Rejection::Executable("ELF executable"))]
    #[case::shebang("notes.txt", b"#!/bin/sh\n".as_slice(), Rejection::Executable("script"))]
    #[case::script_ext("run.sh", b"echo hi".as_slice(), Rejection::Executable("script extension"))]
    fn test_rejections(#[case] filename: &str, #[case] data: &[u8], #[case] expected: Rejection) {
        assert_eq!(policy().validate(filename, data), Validation::Invalid(expected));
    }

    #[test]
    fn test_valid_pdf() {
        let data = b"%PDF-1.4\nhello";
        let Validation::Valid(info) = policy().validate("Quarterly Report.PDF", data) else {
            panic!("pdf should be accepted");
        };
        assert_eq!(info.size, data.len());
        assert_eq!(info.extension, ".pdf");
        assert_eq!(info.mime_type, "application/pdf");
        assert_eq!(info.hash, content_hash(data));
        assert_eq!(info.sanitized_filename, "Quarterly_Report.PDF");
    }

    #[test]
    fn test_empty_allow_list_accepts_unblocked() {
        let mut policy = policy();
        policy.allowed_extensions.clear();
        assert!(matches!(
            policy.validate("diagram.svg", b"<svg/>"),
            Validation::Valid(_)
        ));
        assert!(matches!(
            policy.validate("bundle.zip", b"PK\x03\x04"),
            Validation::Invalid(Rejection::BlockedExtension(_))
        ));
    }

    #[rstest]
    #[case("report.pdf", "report.pdf")]
    #[case("résumé (final).txt", "r_sum__(final).txt")]
    #[case("my file [v2]{x}.md", "my_file_[v2]{x}.md")]
    fn test_sanitize_filename(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(sanitize_filename(input), expected);
    }

    #[test]
    fn test_sanitize_keeps_extension_when_truncating() {
        let long = format!("{}.pdf", "a".repeat(300));
        let sanitized = sanitize_filename(&long);
        assert_eq!(sanitized.len(), 200);
        assert!(sanitized.ends_with(".pdf"));
    }

    #[rstest]
    #[case("notes.md", FileTypeTag::Markdown)]
    #[case("analysis.ipynb", FileTypeTag::Jupyter)]
    #[case("main.py", FileTypeTag::Code)]
    #[case("report.PDF", FileTypeTag::Documentation)]
    #[case("project.readme", FileTypeTag::Readme)]
    #[case("archive.zip", FileTypeTag::Other)]
    #[case("noext", FileTypeTag::Other)]
    fn test_file_type_tag(#[case] filename: &str, #[case] expected: FileTypeTag) {
        assert_eq!(FileTypeTag::from_filename(filename), expected);
    }
}
