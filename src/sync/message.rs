use chrono::{DateTime, TimeZone, Utc};
use log::warn;
use mailparse::{dateparse, parse_mail, DispositionType, MailHeaderMap, ParsedMail};

use crate::error::{Result, SyncError};

/// A raw RFC 822 message reduced to the fields the message table stores.
#[derive(Debug)]
pub struct NormalizedMessage {
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
    pub body_text: String,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentPart>,
}

#[derive(Debug)]
pub struct AttachmentPart {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Parses raw message bytes. A single malformed header degrades to `None`
/// or a default rather than an error; only a message that cannot be read as
/// MIME at all is a parse error, which the worker treats as a poison
/// message local to one identifier.
pub fn parse(raw: &[u8]) -> Result<NormalizedMessage> {
    let parsed =
        parse_mail(raw).map_err(|e| SyncError::Parse(format!("malformed MIME: {}", e)))?;
    if parsed.headers.is_empty() {
        return Err(SyncError::Parse("message has no headers".to_string()));
    }

    let from = parsed.headers.get_first_value("From");
    let to = parsed.headers.get_first_value("To");
    let subject = parsed
        .headers
        .get_first_value("Subject")
        .unwrap_or_default();

    let sent_at = parsed
        .headers
        .get_first_value("Date")
        .and_then(|date| dateparse(&date).ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(|| {
            warn!("message has no parseable Date header, using ingestion time");
            Utc::now()
        });

    let body_text = find_body(&parsed, "text/plain").unwrap_or_default();
    let body_html = find_body(&parsed, "text/html");
    let attachments = extract_attachments(&parsed)?;

    Ok(NormalizedMessage {
        from,
        to,
        subject,
        sent_at,
        body_text,
        body_html,
        attachments,
    })
}

// Depth-first search for the first non-attachment part of the wanted type.
fn find_body(part: &ParsedMail, mimetype: &str) -> Option<String> {
    if part.ctype.mimetype.eq_ignore_ascii_case(mimetype)
        && part.get_content_disposition().disposition != DispositionType::Attachment
    {
        return part.get_body().ok();
    }

    for subpart in &part.subparts {
        if let Some(body) = find_body(subpart, mimetype) {
            return Some(body);
        }
    }

    None
}

fn extract_attachments(parsed: &ParsedMail) -> Result<Vec<AttachmentPart>> {
    fn process_part(part: &ParsedMail, attachments: &mut Vec<AttachmentPart>) -> Result<()> {
        let disposition = part.get_content_disposition();

        // Inline parts with no declared filename are decorations of the
        // body, not attachments.
        if disposition.disposition == DispositionType::Attachment {
            if let Some(filename) = disposition.params.get("filename") {
                let content = part
                    .get_body_raw()
                    .map_err(|e| SyncError::Parse(format!("undecodable attachment: {}", e)))?;
                attachments.push(AttachmentPart {
                    filename: filename.clone(),
                    content_type: part.ctype.mimetype.clone(),
                    content,
                });
            }
        }

        // Recursively process subparts
        for subpart in &part.subparts {
            process_part(subpart, attachments)?;
        }

        Ok(())
    }

    let mut attachments = Vec::new();
    process_part(parsed, &mut attachments)?;
    Ok(attachments)
}
