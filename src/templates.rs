//! Notification templates with `{{variable}}` placeholders.
//!
//! Rendering is strict: a placeholder without a value, or an unclosed `{{`, fails
//! the whole template instead of mailing out a half-filled message.

use crate::error::Error;
use std::collections::BTreeMap;

/// Subject, plain text and HTML source of one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    pub name: &'static str,
    subject: &'static str,
    text: &'static str,
    html: &'static str,
}

pub const TRACKER_CONFIRMATION: Template = Template {
    name: "tracker_confirmation",
    subject: "File received - Tracker ID: {{tracker_id}}",
    text: include_str!("../templates/tracker_confirmation.txt"),
    html: include_str!("../templates/tracker_confirmation.html"),
};

pub const UPLOAD_SUCCESS: Template = Template {
    name: "upload_success",
    subject: "Upload processed - {{tracker_id}}",
    text: include_str!("../templates/upload_success.txt"),
    html: include_str!("../templates/upload_success.html"),
};

pub const UPLOAD_FAILED: Template = Template {
    name: "upload_failed",
    subject: "Upload not accepted - {{tracker_id}}",
    text: include_str!("../templates/upload_failed.txt"),
    html: include_str!("../templates/upload_failed.html"),
};

pub const RATE_LIMIT: Template = Template {
    name: "rate_limit",
    subject: "Sending limit reached",
    text: include_str!("../templates/rate_limit.txt"),
    html: include_str!("../templates/rate_limit.html"),
};

pub const FILE_REJECTED: Template = Template {
    name: "file_rejected",
    subject: "Attachment not accepted: {{filename}}",
    text: include_str!("../templates/file_rejected.txt"),
    html: include_str!("../templates/file_rejected.html"),
};

pub const DOMAIN_BLOCKED: Template = Template {
    name: "domain_blocked",
    subject: "Sender domain not accepted",
    text: include_str!("../templates/domain_blocked.txt"),
    html: include_str!("../templates/domain_blocked.html"),
};

/// Values substituted into a template.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vars(BTreeMap<&'static str, String>);

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.0.insert(key, value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMail {
    pub subject: String,
    pub text: String,
    pub html: String,
}

#[derive(Clone, Copy)]
enum Escape {
    None,
    Header,
    Html,
}

impl Template {
    pub fn render(&self, vars: &Vars) -> Result<RenderedMail, Error> {
        Ok(RenderedMail {
            subject: self.render_part(self.subject, vars, Escape::Header)?,
            text: self.render_part(self.text, vars, Escape::None)?,
            html: self.render_part(self.html, vars, Escape::Html)?,
        })
    }

    fn render_part(&self, source: &str, vars: &Vars, escape: Escape) -> Result<String, Error> {
        let mut out = String::with_capacity(source.len());
        let mut rest = source;
        while let Some((before, after)) = rest.split_once("{{") {
            out.push_str(before);
            let Some((key, remainder)) = after.split_once("}}") else {
                return Err(Error::Template {
                    template: self.name,
                    reason: "unclosed placeholder".to_string(),
                });
            };
            let key = key.trim();
            let Some(value) = vars.get(key) else {
                return Err(Error::Template {
                    template: self.name,
                    reason: format!("no value for `{key}`"),
                });
            };
            match escape {
                Escape::None => out.push_str(value),
                Escape::Header => out.extend(value.chars().filter(|c| !c.is_control())),
                Escape::Html => push_html_escaped(&mut out, value),
            }
            rest = remainder;
        }
        out.push_str(rest);
        Ok(out)
    }
}

fn push_html_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}
