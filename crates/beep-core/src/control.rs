//! Channel-zero control messages.
//!
//! Channel zero speaks a tiny XML vocabulary (`application/beep+xml`):
//!
//! ```text
//! <greeting features=? localize=?><profile uri=.../>*</greeting>
//! <start number=N serverName=?><profile uri=... encoding=?>content?</profile>+</start>
//! <close number=N code=NNN xml:lang=?>diagnostic?</close>
//! <ok/>
//! <profile uri=... encoding=?>content?</profile>
//! <error code=NNN xml:lang=?>diagnostic?</error>
//! ```
//!
//! The reader below understands exactly what these need: elements,
//! attributes in either quote style, character and entity references, CDATA
//! sections, comments and an XML declaration.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use std::fmt::Write as _;

use crate::error::{BeepError, ControlError, ReplyCode};
use crate::frame::MAX_NUMBER;
use crate::payload::{BEEP_XML_CONTENT_TYPE, MimeHeaders, OutputDataStream};

/// Encoding of the content of a `<profile>` element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProfileEncoding {
    /// Content is literal text
    #[default]
    None,
    /// Content is base64
    Base64,
}

impl ProfileEncoding {
    fn parse(value: &str) -> Result<Self, ControlError> {
        match value {
            "none" => Ok(Self::None),
            "base64" => Ok(Self::Base64),
            other => Err(ControlError::InvalidAttribute {
                attribute: "encoding",
                value: other.to_string(),
            }),
        }
    }
}

/// `<profile>` element, inside `<start>` or as a start reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileElement {
    /// Profile URI
    pub uri: String,
    /// Encoding used on the wire for `content`
    pub encoding: ProfileEncoding,
    /// Decoded content
    pub content: Option<Bytes>,
}

impl ProfileElement {
    /// Profile without content
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            encoding: ProfileEncoding::None,
            content: None,
        }
    }

    /// Attach content
    #[must_use]
    pub fn with_content(mut self, content: impl Into<Bytes>, encoding: ProfileEncoding) -> Self {
        self.content = Some(content.into());
        self.encoding = encoding;
        self
    }

    fn encode(&self, out: &mut String) {
        let _ = write!(out, "<profile uri='{}'", escape(&self.uri));
        let Some(content) = &self.content else {
            out.push_str(" />");
            return;
        };
        match (self.encoding, std::str::from_utf8(content)) {
            (ProfileEncoding::None, Ok(text)) => {
                out.push('>');
                push_cdata(out, text);
            }
            // Binary content cannot travel as literal text
            _ => {
                out.push_str(" encoding='base64'>");
                out.push_str(&STANDARD.encode(content));
            }
        }
        out.push_str("</profile>");
    }

    fn from_element(element: &Element) -> Result<Self, ControlError> {
        let uri = element.required("profile", "uri")?.to_string();
        let encoding = match element.attribute("encoding") {
            Some(value) => ProfileEncoding::parse(value)?,
            None => ProfileEncoding::None,
        };
        let (text, verbatim) = element.content();
        let content = if !verbatim && text.trim().is_empty() {
            None
        } else {
            match encoding {
                ProfileEncoding::None => Some(Bytes::from(text)),
                ProfileEncoding::Base64 => {
                    let compact: String = text.split_whitespace().collect();
                    let decoded = STANDARD
                        .decode(compact)
                        .map_err(|_| ControlError::InvalidBase64)?;
                    Some(Bytes::from(decoded))
                }
            }
        };
        Ok(Self {
            uri,
            encoding,
            content,
        })
    }
}

/// `<greeting>`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Greeting {
    /// Advertised profile URIs
    pub profiles: Vec<String>,
    /// `features` attribute
    pub features: Option<String>,
    /// `localize` attribute
    pub localize: Option<String>,
}

/// `<start>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Requested channel number
    pub number: u32,
    /// `serverName` attribute
    pub server_name: Option<String>,
    /// Candidate profiles, in order of preference
    pub profiles: Vec<ProfileElement>,
}

/// `<close>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRequest {
    /// Channel to close, zero for the whole session
    pub number: u32,
    /// Reason code
    pub code: ReplyCode,
    /// `xml:lang` of the diagnostic
    pub lang: Option<String>,
    /// Optional diagnostic text
    pub diagnostic: Option<String>,
}

/// Any channel-zero message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Greeting RPY
    Greeting(Greeting),
    /// Start request MSG
    Start(StartRequest),
    /// Close request MSG
    Close(CloseRequest),
    /// Positive close RPY
    Ok,
    /// Positive start RPY
    Profile(ProfileElement),
    /// ERR, also used to refuse a session in place of a greeting
    Error(BeepError),
}

impl ControlMessage {
    /// Root element name
    #[must_use]
    pub fn element_name(&self) -> &'static str {
        match self {
            ControlMessage::Greeting(_) => "greeting",
            ControlMessage::Start(_) => "start",
            ControlMessage::Close(_) => "close",
            ControlMessage::Ok => "ok",
            ControlMessage::Profile(_) => "profile",
            ControlMessage::Error(_) => "error",
        }
    }

    /// Serialize to XML
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::new();
        match self {
            ControlMessage::Greeting(greeting) => {
                out.push_str("<greeting");
                push_attribute(&mut out, "features", greeting.features.as_deref());
                push_attribute(&mut out, "localize", greeting.localize.as_deref());
                if greeting.profiles.is_empty() {
                    out.push_str(" />");
                } else {
                    out.push('>');
                    for uri in &greeting.profiles {
                        ProfileElement::new(uri.clone()).encode(&mut out);
                    }
                    out.push_str("</greeting>");
                }
            }
            ControlMessage::Start(start) => {
                let _ = write!(out, "<start number='{}'", start.number);
                push_attribute(&mut out, "serverName", start.server_name.as_deref());
                out.push('>');
                for profile in &start.profiles {
                    profile.encode(&mut out);
                }
                out.push_str("</start>");
            }
            ControlMessage::Close(close) => {
                let _ = write!(out, "<close number='{}' code='{}'", close.number, close.code);
                push_attribute(&mut out, "xml:lang", close.lang.as_deref());
                push_text_element(&mut out, "close", close.diagnostic.as_deref());
            }
            ControlMessage::Ok => out.push_str("<ok />"),
            ControlMessage::Profile(profile) => profile.encode(&mut out),
            ControlMessage::Error(error) => {
                let _ = write!(out, "<error code='{}'", error.code);
                push_attribute(&mut out, "xml:lang", error.lang.as_deref());
                let diagnostic = Some(error.diagnostic.as_str()).filter(|d| !d.is_empty());
                push_text_element(&mut out, "error", diagnostic);
            }
        }
        out
    }

    /// Wrap as an `application/beep+xml` payload
    #[must_use]
    pub fn to_payload(&self) -> OutputDataStream {
        OutputDataStream::from_entity(
            &MimeHeaders::with_content_type(BEEP_XML_CONTENT_TYPE),
            self.encode(),
        )
    }

    /// Parse an XML body (MIME headers already removed)
    ///
    /// # Errors
    ///
    /// Returns a [`ControlError`] for malformed XML, unknown elements and
    /// missing or invalid attributes.
    pub fn parse(data: &[u8]) -> Result<Self, ControlError> {
        let text = std::str::from_utf8(data).map_err(|_| ControlError::NotUtf8)?;
        let root = Reader::new(text).document()?;
        match root.name.as_str() {
            "greeting" => {
                let mut profiles = Vec::new();
                for child in root.child_elements() {
                    if child.name != "profile" {
                        return Err(ControlError::UnexpectedElement(child.name.clone()));
                    }
                    profiles.push(child.required("profile", "uri")?.to_string());
                }
                Ok(ControlMessage::Greeting(Greeting {
                    profiles,
                    features: root.attribute("features").map(str::to_string),
                    localize: root.attribute("localize").map(str::to_string),
                }))
            }
            "start" => {
                let number = parse_channel_number(root.required("start", "number")?)?;
                let mut profiles = Vec::new();
                for child in root.child_elements() {
                    if child.name != "profile" {
                        return Err(ControlError::UnexpectedElement(child.name.clone()));
                    }
                    profiles.push(ProfileElement::from_element(child)?);
                }
                if profiles.is_empty() {
                    return Err(ControlError::MissingElement {
                        parent: "start",
                        child: "profile",
                    });
                }
                Ok(ControlMessage::Start(StartRequest {
                    number,
                    server_name: root.attribute("serverName").map(str::to_string),
                    profiles,
                }))
            }
            "close" => {
                let number = parse_channel_number(root.required("close", "number")?)?;
                let code = parse_code(root.required("close", "code")?)?;
                Ok(ControlMessage::Close(CloseRequest {
                    number,
                    code,
                    lang: root.attribute("xml:lang").map(str::to_string),
                    diagnostic: root.text(),
                }))
            }
            "ok" => Ok(ControlMessage::Ok),
            "profile" => Ok(ControlMessage::Profile(ProfileElement::from_element(&root)?)),
            "error" => {
                let code = parse_code(root.required("error", "code")?)?;
                let mut error = BeepError::new(code, root.text().unwrap_or_default());
                error.lang = root.attribute("xml:lang").map(str::to_string);
                Ok(ControlMessage::Error(error))
            }
            other => Err(ControlError::UnexpectedElement(other.to_string())),
        }
    }
}

/// `<error>` payload for an ERR reply
#[must_use]
pub fn error_payload(error: &BeepError) -> OutputDataStream {
    ControlMessage::Error(error.clone()).to_payload()
}

fn parse_channel_number(value: &str) -> Result<u32, ControlError> {
    value
        .parse::<u32>()
        .ok()
        .filter(|n| *n <= MAX_NUMBER)
        .ok_or_else(|| ControlError::InvalidAttribute {
            attribute: "number",
            value: value.to_string(),
        })
}

fn parse_code(value: &str) -> Result<ReplyCode, ControlError> {
    if value.len() == 3 {
        if let Ok(code) = value.parse::<u16>() {
            if (100..1000).contains(&code) {
                return Ok(ReplyCode(code));
            }
        }
    }
    Err(ControlError::InvalidAttribute {
        attribute: "code",
        value: value.to_string(),
    })
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

fn push_attribute(out: &mut String, name: &str, value: Option<&str>) {
    if let Some(value) = value {
        let _ = write!(out, " {name}='{}'", escape(value));
    }
}

fn push_text_element(out: &mut String, name: &str, text: Option<&str>) {
    match text {
        Some(text) => {
            let _ = write!(out, ">{}</{name}>", escape(text));
        }
        None => out.push_str(" />"),
    }
}

fn push_cdata(out: &mut String, text: &str) {
    out.push_str("<![CDATA[");
    out.push_str(&text.replace("]]>", "]]]]><![CDATA[>"));
    out.push_str("]]>");
}

#[derive(Debug)]
enum Node {
    Element(Element),
    Text(String),
    CData(String),
}

#[derive(Debug)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn required(
        &self,
        element: &'static str,
        attribute: &'static str,
    ) -> Result<&str, ControlError> {
        self.attribute(attribute)
            .ok_or(ControlError::MissingAttribute { element, attribute })
    }

    fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            _ => None,
        })
    }

    /// Trimmed text content, `None` when blank
    fn text(&self) -> Option<String> {
        let (text, _) = self.content();
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }

    /// Inner content with child elements re-serialized; the flag is set when
    /// any of it came from CDATA or markup
    fn content(&self) -> (String, bool) {
        let mut out = String::new();
        let mut verbatim = false;
        for node in &self.children {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::CData(text) => {
                    verbatim = true;
                    out.push_str(text);
                }
                Node::Element(element) => {
                    verbatim = true;
                    element.write_xml(&mut out);
                }
            }
        }
        (out, verbatim)
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (name, value) in &self.attributes {
            let _ = write!(out, " {name}='{}'", escape(value));
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Text(text) | Node::CData(text) => out.push_str(&escape(text)),
                Node::Element(element) => element.write_xml(out),
            }
        }
        let _ = write!(out, "</{}>", self.name);
    }
}

struct Reader<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn document(mut self) -> Result<Element, ControlError> {
        self.skip_misc()?;
        if !self.rest().starts_with('<') {
            return Err(self.malformed());
        }
        let root = self.element()?;
        self.skip_misc()?;
        if self.pos != self.input.len() {
            return Err(self.malformed());
        }
        Ok(root)
    }

    fn malformed(&self) -> ControlError {
        if self.pos >= self.input.len() {
            ControlError::UnexpectedEof
        } else {
            ControlError::Malformed(self.pos)
        }
    }

    fn skip_whitespace(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn skip_past(&mut self, terminator: &str) -> Result<(), ControlError> {
        let end = self
            .rest()
            .find(terminator)
            .ok_or(ControlError::UnexpectedEof)?;
        self.pos += end + terminator.len();
        Ok(())
    }

    /// Whitespace, comments, declarations and processing instructions
    fn skip_misc(&mut self) -> Result<(), ControlError> {
        loop {
            self.skip_whitespace();
            let rest = self.rest();
            if rest.starts_with("<?") {
                self.skip_past("?>")?;
            } else if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if rest.starts_with("<!DOCTYPE") {
                self.skip_past(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn name(&mut self) -> Result<String, ControlError> {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')))
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.malformed());
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }

    fn expect(&mut self, token: &str) -> Result<(), ControlError> {
        if self.rest().starts_with(token) {
            self.pos += token.len();
            Ok(())
        } else {
            Err(self.malformed())
        }
    }

    fn element(&mut self) -> Result<Element, ControlError> {
        self.expect("<")?;
        let name = self.name()?;
        let mut attributes = Vec::new();
        loop {
            self.skip_whitespace();
            if self.rest().starts_with("/>") {
                self.pos += 2;
                return Ok(Element {
                    name,
                    attributes,
                    children: Vec::new(),
                });
            }
            if self.rest().starts_with('>') {
                self.pos += 1;
                break;
            }
            let attribute = self.name()?;
            self.skip_whitespace();
            self.expect("=")?;
            self.skip_whitespace();
            let quote = match self.rest().chars().next() {
                Some(q @ ('\'' | '"')) => q,
                _ => return Err(self.malformed()),
            };
            self.pos += 1;
            let end = self.rest().find(quote).ok_or(ControlError::UnexpectedEof)?;
            let raw = &self.rest()[..end];
            if raw.contains('<') {
                return Err(self.malformed());
            }
            let value = unescape(raw)?;
            self.pos += end + 1;
            attributes.push((attribute, value));
        }

        let mut children = Vec::new();
        loop {
            let rest = self.rest();
            if rest.is_empty() {
                return Err(ControlError::UnexpectedEof);
            }
            if rest.starts_with("</") {
                self.pos += 2;
                let closing = self.name()?;
                if closing != name {
                    return Err(ControlError::MismatchedTag {
                        expected: name,
                        actual: closing,
                    });
                }
                self.skip_whitespace();
                self.expect(">")?;
                return Ok(Element {
                    name,
                    attributes,
                    children,
                });
            } else if rest.starts_with("<![CDATA[") {
                self.pos += "<![CDATA[".len();
                let end = self.rest().find("]]>").ok_or(ControlError::UnexpectedEof)?;
                children.push(Node::CData(self.rest()[..end].to_string()));
                self.pos += end + 3;
            } else if rest.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if rest.starts_with("<?") {
                self.skip_past("?>")?;
            } else if rest.starts_with('<') {
                children.push(Node::Element(self.element()?));
            } else {
                let end = rest.find('<').unwrap_or(rest.len());
                children.push(Node::Text(unescape(&rest[..end])?));
                self.pos += end;
            }
        }
    }
}

fn unescape(raw: &str) -> Result<String, ControlError> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp + 1..];
        let semi = rest
            .find(';')
            .ok_or_else(|| ControlError::UnknownEntity(rest.to_string()))?;
        let entity = &rest[..semi];
        let c = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32)
                    .ok_or_else(|| ControlError::UnknownEntity(entity.to_string()))?
            }
        };
        out.push(c);
        rest = &rest[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
