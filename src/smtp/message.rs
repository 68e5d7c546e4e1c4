use crate::smtp::attachments::AttachmentPart;
use crate::smtp::{SendEmailError, SendEmailResult};
use base64::Engine;
use encoding_rs::{Encoding, UTF_8};
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Body, Mailbox, MultiPart, SinglePart};
use lettre::{Address, Message};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Recipient lists may use either separator, mixed freely
const ADDRESS_SEPARATORS: [char; 2] = [',', ';'];

/// Longest run of raw bytes packed into one RFC 2047 encoded word
const ENCODED_WORD_BYTES: usize = 45;

/// Caller-supplied description of the message to send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageSpec {
    /// Recipient addresses separated by ',' or ';'
    pub to: String,
    /// Cc recipient addresses separated by ',' or ';'
    pub cc: String,
    /// Bcc recipient addresses separated by ',' or ';'
    pub bcc: String,
    /// Sender address
    pub from: String,
    /// Display name shown next to the sender address
    pub sender_display_name: String,
    pub subject: String,
    pub body: String,
    /// Send the body as text/html instead of text/plain
    pub is_html: bool,
    /// Charset label applied to subject and body, e.g. "utf-8" or "iso-8859-1"
    pub body_encoding: String,
}

impl Default for MessageSpec {
    fn default() -> Self {
        Self {
            to: String::new(),
            cc: String::new(),
            bcc: String::new(),
            from: String::new(),
            sender_display_name: String::new(),
            subject: String::new(),
            body: String::new(),
            is_html: false,
            body_encoding: "utf-8".to_string(),
        }
    }
}

impl MessageSpec {
    /// Create a plain-text UTF-8 message
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_cc(mut self, cc: impl Into<String>) -> Self {
        self.cc = cc.into();
        self
    }

    pub fn with_bcc(mut self, bcc: impl Into<String>) -> Self {
        self.bcc = bcc.into();
        self
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_display_name = name.into();
        self
    }

    pub fn with_html(mut self, is_html: bool) -> Self {
        self.is_html = is_html;
        self
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.body_encoding = encoding.into();
        self
    }
}

/// The message body text after charset conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedText {
    charset: &'static Encoding,
    is_html: bool,
    bytes: Vec<u8>,
}

impl EncodedText {
    /// Encode `text` with `charset`. Characters the charset cannot represent are
    /// replaced rather than failing the send.
    pub fn new(text: &str, charset: &'static Encoding, is_html: bool) -> Self {
        let charset = charset.output_encoding();
        let (bytes, _, had_unmappable) = charset.encode(text);
        if had_unmappable {
            tracing::warn!(
                "Message body contains characters not representable in {}",
                charset.name()
            );
        }

        Self {
            charset,
            is_html,
            bytes: bytes.into_owned(),
        }
    }

    pub fn charset(&self) -> &'static Encoding {
        self.charset
    }

    pub fn is_html(&self) -> bool {
        self.is_html
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `text/plain` or `text/html` with the charset parameter set
    pub fn content_type(&self) -> SendEmailResult<ContentType> {
        let mime = if self.is_html { "text/html" } else { "text/plain" };
        ContentType::parse(&format!("{}; charset={}", mime, self.charset.name()))
            .map_err(|e| SendEmailError::InvalidArgument(format!("Invalid content type: {}", e)))
    }

    /// Build the MIME part carrying the text
    pub fn to_part(self) -> SendEmailResult<SinglePart> {
        let content_type = self.content_type()?;
        Ok(SinglePart::builder()
            .header(content_type)
            .body(Body::new(self.bytes)))
    }
}

/// Addressed, encoded message ready to receive attachment parts
#[derive(Debug, Clone)]
pub struct AssembledMessage {
    from: Mailbox,
    to: Vec<Mailbox>,
    cc: Vec<Mailbox>,
    bcc: Vec<Mailbox>,
    subject: EncodedSubject,
    text: EncodedText,
}

impl AssembledMessage {
    pub fn from(&self) -> &Mailbox {
        &self.from
    }

    pub fn to(&self) -> &[Mailbox] {
        &self.to
    }

    pub fn cc(&self) -> &[Mailbox] {
        &self.cc
    }

    pub fn bcc(&self) -> &[Mailbox] {
        &self.bcc
    }

    pub fn text(&self) -> &EncodedText {
        &self.text
    }

    pub fn recipient_count(&self) -> usize {
        self.to.len() + self.cc.len() + self.bcc.len()
    }

    /// The To header as a single line, used in the status message
    pub fn to_list(&self) -> String {
        self.to
            .iter()
            .map(|mailbox| mailbox.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Produce the final message. Without attachments the text is the single
    /// body part, otherwise it is the first part of a multipart/mixed body.
    pub fn into_message(self, attachments: Vec<AttachmentPart>) -> SendEmailResult<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .sender(self.from)
            .header(self.subject)
            .date_now();

        for to in self.to {
            builder = builder.to(to);
        }

        for cc in self.cc {
            builder = builder.cc(cc);
        }

        for bcc in self.bcc {
            builder = builder.bcc(bcc);
        }

        let text_part = self.text.to_part()?;

        let message = if attachments.is_empty() {
            builder.singlepart(text_part)
        } else {
            let mut multipart = MultiPart::mixed().singlepart(text_part);
            for attachment in attachments {
                multipart = multipart.singlepart(attachment.to_part()?);
            }
            builder.multipart(multipart)
        };

        message.map_err(|e| SendEmailError::InvalidArgument(format!("Failed to build email: {}", e)))
    }
}

/// Turns a [`MessageSpec`] into an [`AssembledMessage`]. All validation happens
/// here, before any network activity.
pub struct MessageAssembler;

impl MessageAssembler {
    pub fn assemble(spec: &MessageSpec) -> SendEmailResult<AssembledMessage> {
        let charset = lookup_encoding(&spec.body_encoding)?;

        let mut from = parse_mailbox(&spec.from)
            .map_err(|e| SendEmailError::InvalidArgument(format!("Invalid 'from' address: {}", e)))?;
        if !spec.sender_display_name.trim().is_empty() {
            from = Mailbox::new(Some(spec.sender_display_name.trim().to_string()), from.email);
        }

        let to = parse_address_list(&spec.to, "to")?;
        let cc = parse_address_list(&spec.cc, "cc")?;
        let bcc = parse_address_list(&spec.bcc, "bcc")?;

        if to.is_empty() && cc.is_empty() && bcc.is_empty() {
            return Err(SendEmailError::InvalidArgument(
                "At least one recipient is required".to_string(),
            ));
        }

        tracing::debug!(
            "Assembled message from {} to {} recipients ({})",
            from,
            to.len() + cc.len() + bcc.len(),
            charset.name()
        );

        Ok(AssembledMessage {
            from,
            to,
            cc,
            bcc,
            subject: EncodedSubject::new(&spec.subject, charset),
            text: EncodedText::new(&spec.body, charset, spec.is_html),
        })
    }
}

/// Resolve a charset label such as "utf-8", "latin1" or "windows-1252"
pub fn lookup_encoding(label: &str) -> SendEmailResult<&'static Encoding> {
    let label = label.trim();
    if label.is_empty() {
        return Ok(UTF_8);
    }

    Encoding::for_label(label.as_bytes())
        .ok_or_else(|| SendEmailError::InvalidArgument(format!("Unknown encoding name '{}'", label)))
}

/// Split an address list on ',' or ';', dropping empty tokens
pub fn split_addresses(addresses: &str) -> Vec<&str> {
    addresses
        .split(ADDRESS_SEPARATORS)
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect()
}

/// Parse a delimiter-separated list of mailboxes. Empty input is zero recipients.
pub fn parse_address_list(addresses: &str, field: &str) -> SendEmailResult<Vec<Mailbox>> {
    split_addresses(addresses)
        .into_iter()
        .map(|token| {
            parse_mailbox(token).map_err(|e| {
                SendEmailError::InvalidArgument(format!(
                    "Invalid '{}' address '{}': {}",
                    field, token, e
                ))
            })
        })
        .collect()
}

/// Parse a single address, either bare or in "Name <email@domain.com>" form
fn parse_mailbox(address: &str) -> Result<Mailbox, String> {
    let trimmed = address.trim();

    if trimmed.is_empty() {
        return Err("empty address".to_string());
    }

    if let (Some(start), Some(end)) = (trimmed.find('<'), trimmed.rfind('>')) {
        if start < end {
            let name = trimmed[..start].trim().trim_matches('"');
            let email = Address::from_str(trimmed[start + 1..end].trim()).map_err(|e| e.to_string())?;

            let name = (!name.is_empty()).then(|| name.to_string());
            return Ok(Mailbox::new(name, email));
        }
    }

    let email = Address::from_str(trimmed).map_err(|e| e.to_string())?;
    Ok(Mailbox::new(None, email))
}

/// Subject header encoded with the message charset
#[derive(Debug, Clone, PartialEq, Eq)]
struct EncodedSubject {
    text: String,
    charset: &'static Encoding,
}

impl EncodedSubject {
    fn new(text: &str, charset: &'static Encoding) -> Self {
        Self {
            text: text.to_string(),
            charset: charset.output_encoding(),
        }
    }

    /// RFC 2047 "B" encoded words, split on character boundaries
    fn encoded_words(&self) -> String {
        let engine = base64::engine::general_purpose::STANDARD;
        let mut words = Vec::new();
        let mut chunk = String::new();

        for ch in self.text.chars() {
            chunk.push(ch);
            let (bytes, _, _) = self.charset.encode(&chunk);
            if bytes.len() > ENCODED_WORD_BYTES && chunk.chars().count() > 1 {
                chunk.pop();
                let (bytes, _, _) = self.charset.encode(&chunk);
                words.push(format!("=?{}?B?{}?=", self.charset.name(), engine.encode(&bytes)));
                chunk.clear();
                chunk.push(ch);
            }
        }

        if !chunk.is_empty() {
            let (bytes, _, _) = self.charset.encode(&chunk);
            words.push(format!("=?{}?B?{}?=", self.charset.name(), engine.encode(&bytes)));
        }

        words.join("\r\n ")
    }
}

impl Header for EncodedSubject {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("Subject")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        Ok(Self::new(s, UTF_8))
    }

    fn display(&self) -> HeaderValue {
        let printable_ascii = self
            .text
            .chars()
            .all(|c| c == ' ' || c.is_ascii_graphic());

        if printable_ascii {
            HeaderValue::new(Self::name(), self.text.clone())
        } else {
            HeaderValue::dangerous_new_pre_encoded(
                Self::name(),
                self.text.clone(),
                self.encoded_words(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formatted(message: &Message) -> String {
        String::from_utf8_lossy(&message.formatted()).to_string()
    }

    #[test]
    fn test_parse_mailbox() {
        let mailbox = parse_mailbox("test@example.com").unwrap();
        assert_eq!(mailbox.email.to_string(), "test@example.com");
        assert!(mailbox.name.is_none());

        let mailbox = parse_mailbox("John Doe <john@example.com>").unwrap();
        assert_eq!(mailbox.email.to_string(), "john@example.com");
        assert_eq!(mailbox.name.as_deref(), Some("John Doe"));

        let mailbox = parse_mailbox("\"Jane Smith\" <jane@example.com>").unwrap();
        assert_eq!(mailbox.email.to_string(), "jane@example.com");
        assert_eq!(mailbox.name.as_deref(), Some("Jane Smith"));

        assert!(parse_mailbox("not-an-address").is_err());
        assert!(parse_mailbox("   ").is_err());
    }

    #[test]
    fn test_split_addresses_on_both_separators() {
        assert_eq!(
            split_addresses("a@x.com;b@x.com, c@x.com"),
            vec!["a@x.com", "b@x.com", "c@x.com"]
        );
        assert_eq!(split_addresses(" a@x.com ;; , ;b@x.com; "), vec!["a@x.com", "b@x.com"]);
        assert!(split_addresses("").is_empty());
        assert!(split_addresses(" ; , ").is_empty());
    }

    #[test]
    fn test_recipient_count_matches_tokens() {
        for (list, expected) in [
            ("a@x.com", 1),
            ("a@x.com,b@x.com", 2),
            ("a@x.com;b@x.com;c@x.com", 3),
            ("a@x.com, ;b@x.com,", 2),
        ] {
            let spec = MessageSpec::new("from@x.com", list, "Subject", "Body");
            let assembled = MessageAssembler::assemble(&spec).unwrap();
            assert_eq!(assembled.to().len(), expected, "list: {}", list);
            assert_eq!(assembled.recipient_count(), expected);
        }
    }

    #[test]
    fn test_empty_cc_and_bcc_are_valid() {
        let spec = MessageSpec::new("from@x.com", "to@x.com", "Subject", "Body");
        let assembled = MessageAssembler::assemble(&spec).unwrap();
        assert!(assembled.cc().is_empty());
        assert!(assembled.bcc().is_empty());
    }

    #[test]
    fn test_invalid_addresses_are_rejected() {
        let spec = MessageSpec::new("not an address", "to@x.com", "Subject", "Body");
        assert!(matches!(
            MessageAssembler::assemble(&spec),
            Err(SendEmailError::InvalidArgument(_))
        ));

        let spec = MessageSpec::new("from@x.com", "to@x.com", "Subject", "Body")
            .with_cc("good@x.com; bad-address");
        let err = MessageAssembler::assemble(&spec).unwrap_err();
        assert!(err.to_string().contains("bad-address"));
    }

    #[test]
    fn test_message_without_recipients_is_rejected() {
        let spec = MessageSpec::new("from@x.com", " ; ", "Subject", "Body");
        assert!(matches!(
            MessageAssembler::assemble(&spec),
            Err(SendEmailError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unknown_encoding_is_rejected() {
        let spec = MessageSpec::new("from@x.com", "to@x.com", "Subject", "Body")
            .with_encoding("no-such-charset");
        let err = MessageAssembler::assemble(&spec).unwrap_err();
        assert!(matches!(err, SendEmailError::InvalidArgument(_)));
        assert!(err.to_string().contains("no-such-charset"));
    }

    #[test]
    fn test_body_is_encoded_with_requested_charset() {
        let text = EncodedText::new("café", lookup_encoding("iso-8859-1").unwrap(), false);
        assert_eq!(text.bytes(), &[0x63, 0x61, 0x66, 0xE9]);
        assert_eq!(text.charset().name(), "windows-1252");

        let text = EncodedText::new("café", lookup_encoding("utf-8").unwrap(), true);
        assert_eq!(text.bytes(), "café".as_bytes());
        assert!(text.is_html());
    }

    #[test]
    fn test_sender_display_name_applied() {
        let spec = MessageSpec::new("a@x.com", "b@x.com", "Subject", "Body")
            .with_sender_name("Alice Example");
        let assembled = MessageAssembler::assemble(&spec).unwrap();
        assert_eq!(assembled.from().name.as_deref(), Some("Alice Example"));

        let message = assembled.into_message(Vec::new()).unwrap();
        let raw = formatted(&message);
        for header in ["From: ", "Sender: "] {
            let line = raw
                .lines()
                .find(|line| line.starts_with(header))
                .expect("header present");
            assert!(line.contains("Alice Example"), "{}", line);
            assert!(line.contains("<a@x.com>"), "{}", line);
        }
    }

    #[test]
    fn test_single_part_body_without_attachments() {
        let spec = MessageSpec::new("a@x.com", "b@x.com;c@x.com", "Hello", "Plain body text");
        let assembled = MessageAssembler::assemble(&spec).unwrap();
        assert_eq!(assembled.to_list(), "b@x.com, c@x.com");

        let message = assembled.into_message(Vec::new()).unwrap();
        let raw = formatted(&message).to_lowercase();
        assert!(raw.contains("content-type: text/plain; charset=utf-8"));
        assert!(!raw.contains("multipart/mixed"));
        assert!(raw.contains("plain body text"));
        assert!(raw.contains("subject: hello"));
    }

    #[test]
    fn test_multipart_body_starts_with_text() {
        let spec = MessageSpec::new("a@x.com", "b@x.com", "Report", "<p>See attached</p>").with_html(true);
        let assembled = MessageAssembler::assemble(&spec).unwrap();
        let attachment = AttachmentPart::new("a.txt", b"hello".to_vec());

        let message = assembled.into_message(vec![attachment]).unwrap();
        let raw = formatted(&message).to_lowercase();

        let multipart = raw.find("multipart/mixed").expect("multipart body");
        let text = raw.find("content-type: text/html; charset=utf-8").expect("text part");
        let attachment = raw.find("filename=\"a.txt\"").expect("attachment part");
        assert!(multipart < text);
        assert!(text < attachment);
    }

    #[test]
    fn test_subject_uses_message_charset() {
        let subject = EncodedSubject::new("Grüße", lookup_encoding("iso-8859-1").unwrap());
        let engine = base64::engine::general_purpose::STANDARD;
        let expected = format!(
            "=?windows-1252?B?{}?=",
            engine.encode([0x47, 0x72, 0xFC, 0xDF, 0x65])
        );
        assert_eq!(subject.encoded_words(), expected);
    }

    #[test]
    fn test_long_subject_splits_into_several_words() {
        let text = "ä".repeat(60);
        let subject = EncodedSubject::new(&text, UTF_8);
        let words = subject.encoded_words();
        assert!(words.split("\r\n ").count() > 1);
        assert!(words.split("\r\n ").all(|w| w.starts_with("=?UTF-8?B?") && w.ends_with("?=")));
    }
}
