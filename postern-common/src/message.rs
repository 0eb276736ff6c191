use std::sync::Arc;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Malformed message headers: {0}")]
    Headers(#[from] mailparse::MailParseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Header block plus body bytes.
///
/// Headers are parsed up front so they can be inspected and rewritten by the
/// processing pipeline. The body is kept as shared bytes and never copied
/// when a mail is duplicated or the headers change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSource {
    headers: Vec<Header>,
    body: Arc<[u8]>,
}

impl MessageSource {
    pub fn new(headers: Vec<Header>, body: impl Into<Arc<[u8]>>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Split raw message bytes into the header block and the body.
    ///
    /// # Errors
    /// If the header block cannot be parsed.
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        let (header_end, body_start) = split_header_block(raw);
        let parsed = if header_end == 0 {
            Vec::new()
        } else {
            mailparse::parse_headers(&raw[..header_end])?.0
        };

        let headers = parsed
            .iter()
            .map(|header| {
                Header::new(
                    header.get_key(),
                    String::from_utf8_lossy(header.get_value_raw()).trim(),
                )
            })
            .collect();

        Ok(Self {
            headers,
            body: Arc::from(raw.get(body_start..).unwrap_or_default()),
        })
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.is(name))
            .map(|header| header.value.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |header| header.is(name))
            .map(|header| header.value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn prepend_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(0, Header::new(name, value));
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(Header::new(name, value));
    }

    /// Replace the first header with this name, or append it.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        match self.headers.iter_mut().find(|header| header.is(name)) {
            Some(header) => header.value = value.into(),
            None => self.add_header(name, value),
        }
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|header| !header.is(name));
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Size in bytes of the serialised message.
    pub fn size(&self) -> usize {
        self.headers
            .iter()
            .map(|header| header.name.len() + header.value.len() + 4)
            .sum::<usize>()
            + 2
            + self.body.len()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());

        for header in &self.headers {
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(header.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);

        out
    }
}

/// End of the header block and start of the body.
///
/// The block runs up to the first empty line, which belongs to neither part.
/// A line that is neither a `name:` field nor a folded continuation ends the
/// block early, and the body starts with that line.
fn split_header_block(raw: &[u8]) -> (usize, usize) {
    let mut offset = 0;

    while offset < raw.len() {
        let end = raw[offset..]
            .iter()
            .position(|&byte| byte == b'\n')
            .map_or(raw.len(), |newline| offset + newline + 1);

        let line = &raw[offset..end];
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if line.is_empty() {
            return (offset, end);
        }

        let folded = offset > 0 && matches!(line.first(), Some(b' ' | b'\t'));
        if !folded && !is_field(line) {
            return (offset, offset);
        }

        offset = end;
    }

    (raw.len(), raw.len())
}

/// A field name is printable ASCII other than `:`, followed by `:`.
fn is_field(line: &[u8]) -> bool {
    line.iter()
        .position(|&byte| byte == b':')
        .is_some_and(|colon| colon > 0 && line[..colon].iter().all(|byte| (33..=126).contains(byte)))
}
