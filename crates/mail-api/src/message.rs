//! Message details parsed from a Gmail `format=full` payload
//!
//! Headers give the sender and subject. The MIME tree is walked depth
//! first: the first `text/plain` and first `text/html` leaves win, and
//! leaves carrying an `attachmentId` become attachment metadata. When a
//! message has only HTML, a plain rendition is derived from it.

use std::sync::LazyLock;

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const UNKNOWN_SENDER: &str = "Unknown Sender";
pub const UNKNOWN_ADDRESS: &str = "unknown@example.com";
pub const NO_SUBJECT: &str = "No Subject";

/// Gmail bodies are base64url; padding shows up on some messages and not others.
const BODY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

static NAMED_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.*?)\s*<(.+?)>$").expect("NAMED_ADDRESS should compile - this is a bug")
});
static ANGLE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(.+?)>").expect("ANGLE_ADDRESS should compile - this is a bug"));
static ADDRESS_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s,;]+").expect("ADDRESS_SEPARATORS should compile - this is a bug"));
static STYLE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<style.*?</style>").expect("STYLE_BLOCK should compile - this is a bug")
});
static SCRIPT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script.*?</script>").expect("SCRIPT_BLOCK should compile - this is a bug")
});
static BLOCK_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</div>|</li>|</p>|<br\s*/?>").expect("BLOCK_BREAK should compile - this is a bug")
});
static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<li>").expect("LIST_ITEM should compile - this is a bug"));
static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]+>").expect("ANY_TAG should compile - this is a bug"));
static IMAGE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[image:.*?\]").expect("IMAGE_MARKER should compile - this is a bug")
});
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("WHITESPACE should compile - this is a bug"));

/// Attachment metadata; the content itself is not downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub attachment_id: String,
    pub size: u64,
}

/// Everything the dispatch step needs about one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDetails {
    pub id: String,
    pub from_name: String,
    /// Lower-cased sender address
    pub from_address: String,
    pub subject: String,
    /// Plain text body, whitespace collapsed
    pub text: String,
    pub html: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl MessageDetails {
    /// Text handed to enrichment: subject, blank line, body.
    pub fn analysis_text(&self) -> String {
        format!("{}\n\n{}", self.subject, self.text)
            .trim()
            .to_string()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireMessage {
    pub id: String,
    #[serde(default)]
    pub payload: Option<WirePart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WirePart {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub headers: Vec<WireHeader>,
    #[serde(default)]
    pub body: Option<WireBody>,
    #[serde(default)]
    pub parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireBody {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub attachment_id: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl WirePart {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

impl From<WireMessage> for MessageDetails {
    fn from(message: WireMessage) -> Self {
        let payload = message.payload.unwrap_or_default();
        let from = payload.header("From").unwrap_or(UNKNOWN_SENDER);
        let from_name = sender_name(from);
        let from_address = sender_address(from);
        let subject = payload
            .header("Subject")
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(NO_SUBJECT)
            .to_string();

        let mut content = Content::default();
        content.collect(&payload);
        let Content {
            text,
            html,
            attachments,
        } = content;

        let text = match (text, &html) {
            (Some(text), _) => text,
            (None, Some(html)) => html_to_text(html),
            (None, None) => String::new(),
        };

        Self {
            id: message.id,
            from_name,
            from_address,
            subject,
            text: clean_text(&text),
            html,
            attachments,
        }
    }
}

#[derive(Default)]
struct Content {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<Attachment>,
}

impl Content {
    fn collect(&mut self, part: &WirePart) {
        if !part.parts.is_empty() {
            for child in &part.parts {
                self.collect(child);
            }
            return;
        }

        let mime_type = part
            .mime_type
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let Some(body) = &part.body else {
            return;
        };

        if let Some(decoded) = body.data.as_deref().and_then(decode_body) {
            match mime_type.as_str() {
                "text/plain" if self.text.is_none() => self.text = Some(decoded),
                "text/html" if self.html.is_none() => self.html = Some(decoded),
                _ => {}
            }
        }

        if let (Some(filename), Some(attachment_id)) = (
            part.filename.as_deref().filter(|f| !f.is_empty()),
            body.attachment_id.as_deref(),
        ) {
            self.attachments.push(Attachment {
                filename: filename.to_string(),
                mime_type: part
                    .mime_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                attachment_id: attachment_id.to_string(),
                size: body.size.unwrap_or(0),
            });
        }
    }
}

fn decode_body(data: &str) -> Option<String> {
    let bytes = BODY_ENGINE.decode(data.trim()).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Display name from a `From` header.
///
/// `"Jane Doe" <jane@example.com>` gives `Jane Doe`; a bare address gives
/// its local part.
pub fn sender_name(from: &str) -> String {
    let from = from.trim();
    let address = match NAMED_ADDRESS.captures(from) {
        Some(caps) => {
            let name = strip_quotes(&caps[1]);
            if !name.is_empty() {
                return name;
            }
            caps.get(2).map_or(from, |m| m.as_str())
        }
        None => from,
    };
    let local = address.split('@').next().unwrap_or(address);
    let name = strip_quotes(local);
    if name.is_empty() {
        UNKNOWN_SENDER.to_string()
    } else {
        name
    }
}

/// Lower-cased address from a `From` header, or `unknown@example.com`.
pub fn sender_address(from: &str) -> String {
    if let Some(caps) = ANGLE_ADDRESS.captures(from) {
        return caps[1].trim().to_lowercase();
    }
    ADDRESS_SEPARATORS
        .split(from)
        .find(|part| part.contains('@') && part.contains('.'))
        .map(str::to_lowercase)
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
}

fn strip_quotes(s: &str) -> String {
    s.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string()
}

/// Crude plain rendition of an HTML body.
pub fn html_to_text(html: &str) -> String {
    let text = STYLE_BLOCK.replace_all(html, "");
    let text = SCRIPT_BLOCK.replace_all(&text, "");
    let text = BLOCK_BREAK.replace_all(&text, "\n");
    let text = LIST_ITEM.replace_all(&text, "  *  ");
    let text = ANY_TAG.replace_all(&text, "");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Drop `[image: ...]` placeholders and collapse whitespace.
pub fn clean_text(text: &str) -> String {
    let text = IMAGE_MARKER.replace_all(text, "");
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    fn encode(s: &str) -> String {
        URL_SAFE_NO_PAD.encode(s)
    }

    fn parse(json: serde_json::Value) -> MessageDetails {
        let wire: WireMessage = serde_json::from_value(json).unwrap();
        wire.into()
    }

    #[test]
    fn sender_name_from_quoted_display_name() {
        assert_eq!(sender_name("\"Jane Doe\" <jane@example.com>"), "Jane Doe");
        assert_eq!(sender_name("Jane Doe <jane@example.com>"), "Jane Doe");
    }

    #[test]
    fn sender_name_from_bare_address_is_local_part() {
        assert_eq!(sender_name("jane.doe@example.com"), "jane.doe");
        assert_eq!(sender_name("<jane@example.com>"), "jane");
        assert_eq!(sender_name(""), UNKNOWN_SENDER);
    }

    #[test]
    fn sender_address_is_lowercased() {
        assert_eq!(
            sender_address("Jane <Jane.Doe@Example.COM>"),
            "jane.doe@example.com"
        );
        assert_eq!(sender_address("Jane.Doe@Example.com"), "jane.doe@example.com");
        assert_eq!(sender_address("Mailer Daemon"), UNKNOWN_ADDRESS);
    }

    #[test]
    fn html_is_flattened_to_text() {
        let html = "<html><head><style>p { color: red; }</style><script>alert(1)</script></head>\
                    <body><p>Hello</p><ul><li>one</li><li>two</li></ul>line<br/>break</body></html>";
        assert_eq!(html_to_text(html), "Hello * one * two line break");
    }

    #[test]
    fn image_markers_are_removed() {
        assert_eq!(
            clean_text("See [image: logo.png] the   chart\n[IMAGE: x]"),
            "See the chart"
        );
    }

    #[test]
    fn multipart_message_prefers_first_plain_part() {
        let details = parse(serde_json::json!({
            "id": "18c1",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    {"name": "From", "value": "\"Ops Team\" <OPS@example.com>"},
                    {"name": "Subject", "value": "Deploy finished"}
                ],
                "parts": [
                    {
                        "mimeType": "multipart/alternative",
                        "parts": [
                            {"mimeType": "text/plain", "body": {"data": encode("Build 42   is live")}},
                            {"mimeType": "text/html", "body": {"data": encode("<p>Build 42 is <b>live</b></p>")}}
                        ]
                    },
                    {"mimeType": "text/plain", "body": {"data": encode("second plain part")}},
                    {
                        "mimeType": "application/pdf",
                        "filename": "report.pdf",
                        "body": {"attachmentId": "att-1", "size": 2048}
                    }
                ]
            }
        }));

        assert_eq!(details.id, "18c1");
        assert_eq!(details.from_name, "Ops Team");
        assert_eq!(details.from_address, "ops@example.com");
        assert_eq!(details.subject, "Deploy finished");
        assert_eq!(details.text, "Build 42 is live");
        assert_eq!(details.html.as_deref(), Some("<p>Build 42 is <b>live</b></p>"));
        assert_eq!(
            details.attachments,
            vec![Attachment {
                filename: "report.pdf".into(),
                mime_type: "application/pdf".into(),
                attachment_id: "att-1".into(),
                size: 2048,
            }]
        );
    }

    #[test]
    fn html_only_message_gets_derived_text() {
        let details = parse(serde_json::json!({
            "id": "18c2",
            "payload": {
                "mimeType": "text/html",
                "headers": [{"name": "from", "value": "alerts@example.com"}],
                "body": {"data": encode("<div>Disk at 91%</div><div>[image: graph]</div>")}
            }
        }));

        assert_eq!(details.text, "Disk at 91%");
        assert_eq!(details.subject, NO_SUBJECT);
        assert_eq!(details.from_name, "alerts");
    }

    #[test]
    fn padded_base64_bodies_decode() {
        let details = parse(serde_json::json!({
            "id": "18c3",
            "payload": {
                "mimeType": "text/plain",
                "headers": [],
                "body": {"data": "aGk="}
            }
        }));
        assert_eq!(details.text, "hi");
        assert_eq!(details.from_name, UNKNOWN_SENDER);
        assert_eq!(details.from_address, UNKNOWN_ADDRESS);
    }

    #[test]
    fn message_without_payload_has_defaults() {
        let details = parse(serde_json::json!({"id": "18c4"}));
        assert_eq!(details.text, "");
        assert!(details.html.is_none());
        assert!(details.attachments.is_empty());
        assert_eq!(details.analysis_text(), NO_SUBJECT);
    }
}
