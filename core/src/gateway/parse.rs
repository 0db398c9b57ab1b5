//! Decoding of remote headers and bodies into gateway types

use async_imap::types::{Fetch, Flag};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};

use crate::error::{SortaError, SortaResult};
use crate::markers;
use crate::threading::parse_message_ids;
use crate::types::{AttachmentMeta, MessageBody, MessageSummary};

/// Bytes of body text fetched for previews
pub const PREVIEW_OCTETS: usize = 512;

/// Render a flag the way it appears on the wire
pub fn flag_to_string(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => markers::SEEN.to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => markers::FLAGGED.to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => markers::DRAFT.to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::Custom(name) => name.to_string(),
        _ => "\\*".to_string(),
    }
}

/// Flags of a fetch response as strings
pub fn fetch_flags(fetch: &Fetch) -> Vec<String> {
    fetch.flags().map(|f| flag_to_string(&f)).collect()
}

/// Canonical `<id>` form of a Message-ID value
pub fn normalize_identity(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(first) = parse_message_ids(trimmed).into_iter().next() {
        return Some(first);
    }
    let bare = trimmed.trim_matches(|c| c == '<' || c == '>');
    if bare.is_empty() || bare.contains(char::is_whitespace) {
        None
    } else {
        Some(format!("<{}>", bare))
    }
}

/// Message-ID of a raw header block
pub fn identity_of(header: &[u8]) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(header).ok()?;
    headers
        .get_first_value("Message-ID")
        .and_then(|v| normalize_identity(&v))
}

/// Build a summary from a FETCH of `(UID FLAGS INTERNALDATE BODY.PEEK[HEADER] BODY.PEEK[TEXT]<..>)`
pub fn summary_from_fetch(folder: &str, fetch: &Fetch) -> SortaResult<MessageSummary> {
    let uid = fetch
        .uid
        .ok_or_else(|| SortaError::malformed(format!("fetch without UID in {}", folder)))?;
    let header = fetch
        .header()
        .ok_or_else(|| SortaError::malformed(format!("UID {} in {} has no header", uid, folder)))?;

    parse_summary(
        folder,
        uid,
        header,
        fetch.text().unwrap_or_default(),
        fetch_flags(fetch),
        fetch.internal_date().map(|d| d.with_timezone(&Utc)),
    )
}

/// Parse header bytes into a summary; missing identity or sender is malformed
pub fn parse_summary(
    folder: &str,
    uid: u32,
    header: &[u8],
    text: &[u8],
    flags: Vec<String>,
    internal_date: Option<DateTime<Utc>>,
) -> SortaResult<MessageSummary> {
    let (headers, _) = mailparse::parse_headers(header)?;

    let identity = headers
        .get_first_value("Message-ID")
        .and_then(|v| normalize_identity(&v))
        .ok_or_else(|| SortaError::malformed(format!("UID {} in {} has no Message-ID", uid, folder)))?;

    let sender = headers
        .get_first_value("From")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SortaError::malformed(format!("{} has no sender", identity)))?;

    let date = headers
        .get_first_value("Date")
        .and_then(|v| mailparse::dateparse(&v).ok())
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .or(internal_date);

    let content_type = headers
        .get_first_value("Content-Type")
        .unwrap_or_default()
        .to_ascii_lowercase();

    let mut summary = MessageSummary::new(identity, folder, uid);
    summary.subject = headers.get_first_value("Subject").unwrap_or_default().trim().to_string();
    summary.sender = sender;
    summary.date = date;
    summary.preview = preview_from_text(text);
    summary.has_attachments = content_type.starts_with("multipart/mixed");
    summary.is_read = flags.iter().any(|f| f.eq_ignore_ascii_case(markers::SEEN));
    summary.is_flagged = flags.iter().any(|f| f.eq_ignore_ascii_case(markers::FLAGGED));
    summary.in_reply_to = headers
        .get_first_value("In-Reply-To")
        .and_then(|v| parse_message_ids(&v).into_iter().next());
    summary.references = headers
        .get_first_value("References")
        .map(|v| parse_message_ids(&v))
        .unwrap_or_default();
    summary.markers = flags;

    Ok(summary)
}

/// Plain preview from the first octets of a body, skipping MIME framing
pub fn preview_from_text(text: &[u8]) -> String {
    let raw = String::from_utf8_lossy(text).replace("=\r\n", "").replace("=\n", "");
    let mut in_part_headers = false;
    let mut words: Vec<&str> = Vec::new();

    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("--") {
            in_part_headers = true;
            continue;
        }
        if in_part_headers {
            if trimmed.is_empty() {
                in_part_headers = false;
            }
            continue;
        }
        if trimmed.starts_with('<') || trimmed.starts_with('>') {
            continue;
        }
        words.extend(trimmed.split_whitespace());
    }

    words.join(" ").chars().take(crate::PREVIEW_LENGTH).collect()
}

/// Decode a full RFC 5322 message
pub fn parse_body(raw: &[u8]) -> SortaResult<MessageBody> {
    let parsed = mailparse::parse_mail(raw)?;
    let mut body = MessageBody {
        found: true,
        ..Default::default()
    };
    collect_parts(&parsed, &mut body)?;
    Ok(body)
}

fn collect_parts(part: &ParsedMail<'_>, body: &mut MessageBody) -> SortaResult<()> {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            collect_parts(sub, body)?;
        }
        return Ok(());
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();

    if disposition.disposition == DispositionType::Attachment || filename.is_some() {
        body.attachments.push(AttachmentMeta {
            filename: filename.unwrap_or_else(|| "attachment".to_string()),
            mime_type: part.ctype.mimetype.clone(),
            size: part.get_body_raw()?.len(),
        });
        return Ok(());
    }

    match part.ctype.mimetype.as_str() {
        "text/plain" if body.text.is_none() => body.text = Some(part.get_body()?),
        "text/html" if body.html.is_none() => body.html = Some(part.get_body()?),
        _ => {}
    }
    Ok(())
}

/// IMAP SEARCH date, e.g. `01-Jan-2024`
pub fn imap_date(date: NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}

/// Quote a string for use in a SEARCH command
pub fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// SEARCH criteria matching a single Message-ID
pub fn identity_criterion(identity: &str) -> String {
    format!("HEADER Message-ID {}", quote(identity))
}

/// Combine criteria with the prefix `OR` operator
pub fn or_criteria(criteria: &[String]) -> String {
    match criteria.len() {
        0 => String::new(),
        1 => criteria[0].clone(),
        n => format!("{}{}", "OR ".repeat(n - 1), criteria.join(" ")),
    }
}

/// Comma separated UID set
pub fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(|u| u.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &[u8] = b"Message-ID: <abc@example.com>\r\n\
From: Alice <alice@example.com>\r\n\
Subject: Re: Budget Review\r\n\
Date: Tue, 5 Mar 2024 10:00:00 +0000\r\n\
In-Reply-To: <root@example.com>\r\n\
References: <root@example.com> <mid@example.com>\r\n\
Content-Type: multipart/mixed; boundary=\"b1\"\r\n\r\n";

    #[test]
    fn test_parse_summary() {
        let flags = vec!["\\Seen".to_string(), "$Bucket_finance".to_string()];
        let summary = parse_summary("INBOX", 9, HEADER, b"Hello team,\r\nnumbers attached.", flags, None)
            .unwrap();

        assert_eq!(summary.identity, "<abc@example.com>");
        assert_eq!(summary.sender, "Alice <alice@example.com>");
        assert_eq!(summary.subject, "Re: Budget Review");
        assert!(summary.is_read);
        assert!(!summary.is_flagged);
        assert!(summary.has_attachments);
        assert_eq!(summary.in_reply_to.as_deref(), Some("<root@example.com>"));
        assert_eq!(summary.references.len(), 2);
        assert_eq!(summary.preview, "Hello team, numbers attached.");
        assert!(summary.has_marker("$Bucket_finance"));
        assert_eq!(summary.date.unwrap().timestamp(), 1709632800);
    }

    #[test]
    fn test_malformed_records_rejected() {
        let no_id = b"From: a@x\r\nSubject: hi\r\n\r\n";
        assert!(matches!(
            parse_summary("INBOX", 1, no_id, b"", vec![], None),
            Err(SortaError::Malformed(_))
        ));

        let no_sender = b"Message-ID: <x@y>\r\nSubject: hi\r\n\r\n";
        assert!(matches!(
            parse_summary("INBOX", 1, no_sender, b"", vec![], None),
            Err(SortaError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_body_with_attachment() {
        let raw = b"Message-ID: <m@x>\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\r\n\
--XX\r\n\
Content-Type: text/plain; charset=utf-8\r\n\r\n\
Plain body\r\n\
--XX\r\n\
Content-Type: text/html; charset=utf-8\r\n\r\n\
<p>Html body</p>\r\n\
--XX\r\n\
Content-Type: application/pdf; name=\"q3.pdf\"\r\n\
Content-Disposition: attachment; filename=\"q3.pdf\"\r\n\r\n\
PDFDATA\r\n\
--XX--\r\n";

        let body = parse_body(raw).unwrap();
        assert!(body.found);
        assert_eq!(body.text.as_deref().map(str::trim), Some("Plain body"));
        assert!(body.html.unwrap().contains("Html body"));
        assert_eq!(body.attachments.len(), 1);
        assert_eq!(body.attachments[0].filename, "q3.pdf");
        assert_eq!(body.attachments[0].mime_type, "application/pdf");
    }

    #[test]
    fn test_preview_skips_mime_framing() {
        let text = b"--b1\r\nContent-Type: text/plain\r\n\r\nFirst line\r\nsecond=\r\n line\r\n--b1--";
        assert_eq!(preview_from_text(text), "First line second line");
    }

    #[test]
    fn test_search_helpers() {
        assert_eq!(imap_date(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap()), "05-Jan-2024");
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
        assert_eq!(normalize_identity(" abc@x "), Some("<abc@x>".to_string()));
        assert_eq!(normalize_identity(""), None);

        let criteria: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        assert_eq!(or_criteria(&criteria), "OR OR A B C");
        assert_eq!(uid_set(&[3, 4]), "3,4");
    }
}
