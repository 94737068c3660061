use chrono::{DateTime, NaiveDate};
use mailparse::{MailHeader, MailHeaderMap};
use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::state::Uid;

/// Header fields of a fetched message that archiving and the summary need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: Vec<String>,
    /// To, Cc and Bcc header values in that order.
    pub recipients: Vec<String>,
    /// `None` when the subject could not be decoded.
    pub subject: Option<String>,
    pub date: Option<NaiveDate>,
}

pub fn parse_envelope(uid: Uid, raw: &[u8]) -> Result<Envelope> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(Error::decode(uid, "empty message"));
    }
    let (headers, _) = mailparse::parse_headers(raw).map_err(|e| Error::decode(uid, e))?;
    if headers.is_empty() {
        return Err(Error::decode(uid, "no headers"));
    }

    let from = header_values(&headers, "From");
    let mut recipients = header_values(&headers, "To");
    recipients.extend(header_values(&headers, "Cc"));
    recipients.extend(header_values(&headers, "Bcc"));

    let subject = match headers.get_first_header("Subject") {
        Some(header) => decode_subject(header),
        None => Some(String::new()),
    };
    let date = headers
        .get_first_value("Date")
        .and_then(|value| parse_date(&value));

    Ok(Envelope {
        from,
        recipients,
        subject,
        date,
    })
}

fn header_values(headers: &[MailHeader], name: &str) -> Vec<String> {
    headers
        .get_all_values(name)
        .into_iter()
        .filter(|value| !value.trim().is_empty())
        .collect()
}

fn decode_subject(header: &MailHeader) -> Option<String> {
    // Raw 8-bit subjects in an unknown charset cannot be decoded reliably.
    if std::str::from_utf8(header.get_value_raw()).is_err() {
        return None;
    }
    let value = header.get_value();
    if value.contains('\u{FFFD}') {
        return None;
    }
    Some(value.trim().to_string())
}

fn normalize_datetime(mut dt: &str) -> Cow<str> {
    // Trailing commentary timezone info is not recognized.
    if dt.ends_with(')') {
        if let Some(pos) = dt.rfind('(') {
            dt = &dt[..pos];
        }
    }
    dt = dt.trim();
    // chrono rejects -0000, read it as +0000.
    if dt.ends_with("-0000") {
        Cow::Owned(format!("{}+0000", &dt[..dt.len() - 5]))
    } else {
        Cow::Borrowed(dt)
    }
}

/// Calendar date of a Date header, in UTC.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let normalized = normalize_datetime(value);
    if let Ok(dt) = DateTime::parse_from_rfc2822(&normalized) {
        return Some(dt.naive_utc().date());
    }
    let timestamp = mailparse::dateparse(&normalized).ok()?;
    DateTime::from_timestamp(timestamp, 0).map(|dt| dt.date_naive())
}
