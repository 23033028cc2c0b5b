//! RFC 822 parsing adapter. Turns raw message bytes into the handful of fields
//! the index stores, and recovers a usable date for file mtimes.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use mail_parser::{Addr, MessageParser};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("message has no header section")]
    NoHeaders,

    #[error("message could not be parsed")]
    Malformed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEmail {
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: Option<DateTime<Utc>>,
    pub body_text: String,
    pub size: u64,
}

pub fn parse_email(raw: &[u8]) -> Result<ParsedEmail, ParseError> {
    if !starts_with_header(raw) {
        return Err(ParseError::NoHeaders);
    }

    let message = MessageParser::default()
        .parse(raw)
        .ok_or(ParseError::Malformed)?;

    let from = message
        .from()
        .and_then(|addr| addr.first().map(format_address))
        .unwrap_or_default();
    let to = message
        .to()
        .map(|addr| {
            addr.iter()
                .map(format_address)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    let date = message
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        .or_else(|| fallback_date(raw));

    let body_text = match message.body_text(0) {
        Some(text) => text.trim().to_string(),
        None => message
            .body_html(0)
            .map(|html| html_to_text(&html))
            .unwrap_or_default(),
    };

    Ok(ParsedEmail {
        subject: message.subject().unwrap_or_default().trim().to_string(),
        from,
        to,
        date,
        body_text,
        size: raw.len() as u64,
    })
}

/// Best-effort message date: the `Date` header, leniently parsed, then the
/// timestamp of the most recent `Received` hop.
pub fn message_date(raw: &[u8]) -> Option<DateTime<Utc>> {
    MessageParser::default()
        .parse_headers(raw)
        .and_then(|message| {
            message
                .date()
                .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0))
        })
        .or_else(|| fallback_date(raw))
}

fn fallback_date(raw: &[u8]) -> Option<DateTime<Utc>> {
    let headers = header_fields(raw);
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("date"))
        .find_map(|(_, value)| parse_date_fuzzy(value))
        .or_else(|| {
            headers
                .iter()
                .filter(|(name, _)| name.eq_ignore_ascii_case("received"))
                .find_map(|(_, value)| {
                    let (_, stamp) = value.rsplit_once(';')?;
                    parse_date_fuzzy(stamp)
                })
        })
}

const ZONED_LAYOUTS: &[&str] = &[
    "%a, %d %b %Y %H:%M:%S %z",
    "%d %b %Y %H:%M:%S %z",
    "%a, %d %b %y %H:%M:%S %z",
    "%d %b %y %H:%M %z",
];

const NAIVE_LAYOUTS: &[&str] = &[
    "%a, %d %b %Y %H:%M:%S",
    "%d %b %Y %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

/// Parses the date formats seen in real mailboxes: RFC 2822 with or without
/// weekday, a trailing `(TZ)` comment, a missing zone (taken as UTC), or
/// ISO-like stamps.
pub fn parse_date_fuzzy(raw: &str) -> Option<DateTime<Utc>> {
    let mut value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if value.ends_with(')') {
        if let Some(open) = value.rfind('(') {
            value = value[..open].trim_end();
        }
    }

    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    for layout in ZONED_LAYOUTS {
        if let Ok(parsed) = DateTime::parse_from_str(value, layout) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    for layout in NAIVE_LAYOUTS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, layout) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%m-%d-%Y")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn format_address(addr: &Addr) -> String {
    match (addr.name(), addr.address()) {
        (Some(name), Some(address)) => format!("{name} <{address}>"),
        (Some(name), None) => name.to_string(),
        (None, address) => address.unwrap_or_default().to_string(),
    }
}

pub(crate) fn html_to_text(html: &str) -> String {
    std::panic::catch_unwind(|| {
        html2text::from_read(html.as_bytes(), 120)
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    })
    .unwrap_or_default()
}

fn starts_with_header(raw: &[u8]) -> bool {
    let first_line = raw.split(|b| *b == b'\n').next().unwrap_or_default();
    match first_line.iter().position(|b| *b == b':') {
        Some(0) | None => false,
        Some(colon) => first_line[..colon]
            .iter()
            .all(|b| b.is_ascii_graphic() && *b != b':'),
    }
}

/// Unfolded `(name, value)` pairs of the header section, in order.
fn header_fields(raw: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(raw);
    let mut fields: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            break;
        }
        if line.starts_with([' ', '\t']) {
            if let Some((_, value)) = fields.last_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            fields.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    fields
}
