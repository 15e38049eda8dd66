//! Typed versions of the webdav request headers.
//!
//! All of these plug into `headers::HeaderMapExt`, so handlers read them
//! with `req.headers().typed_get::<davheaders::Depth>()`.
use std::fmt;
use std::time::Duration;

use headers::{self, Header};
use http::header::{HeaderName, HeaderValue};

lazy_static! {
    static ref DEPTH: HeaderName = HeaderName::from_static("depth");
    static ref DESTINATION: HeaderName = HeaderName::from_static("destination");
    static ref OVERWRITE: HeaderName = HeaderName::from_static("overwrite");
    static ref TIMEOUT: HeaderName = HeaderName::from_static("timeout");
    static ref LOCK_TOKEN: HeaderName = HeaderName::from_static("lock-token");
    static ref IF: HeaderName = HeaderName::from_static("if");
    static ref X_LITMUS: HeaderName = HeaderName::from_static("x-litmus");
}

/// `Depth` header: how deep to traverse a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Zero,
    One,
    Infinity,
}

impl Header for Depth {
    fn name() -> &'static HeaderName {
        &DEPTH
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        match value.to_str().map(str::trim) {
            Ok("0") => Ok(Depth::Zero),
            Ok("1") => Ok(Depth::One),
            Ok(s) if s.eq_ignore_ascii_case("infinity") => Ok(Depth::Infinity),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let s = match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        };
        values.extend(std::iter::once(HeaderValue::from_static(s)));
    }
}

/// `Destination` header (COPY/MOVE).
///
/// Either an absolute URI or an absolute path. The path is kept in its
/// still-encoded form; `DavPath` does the decoding. The handler verifies
/// scheme and authority against the request.
#[derive(Debug, Clone)]
pub struct Destination {
    pub scheme: Option<String>,
    pub authority: Option<String>,
    pub path: String,
}

impl Header for Destination {
    fn name() -> &'static HeaderName {
        &DESTINATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let s = value.to_str().map_err(|_| headers::Error::invalid())?.trim();
        if s.starts_with('/') {
            return Ok(Destination {
                scheme: None,
                authority: None,
                path: s.to_string(),
            });
        }
        let uri = s
            .parse::<http::Uri>()
            .map_err(|_| headers::Error::invalid())?;
        match (uri.scheme_str(), uri.authority()) {
            (Some(scheme), Some(auth)) => Ok(Destination {
                scheme: Some(scheme.to_string()),
                authority: Some(auth.as_str().to_string()),
                path: uri.path().to_string(),
            }),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let s = match (&self.scheme, &self.authority) {
            (Some(scheme), Some(auth)) => format!("{}://{}{}", scheme, auth, self.path),
            _ => self.path.clone(),
        };
        if let Ok(value) = HeaderValue::from_str(&s) {
            values.extend(std::iter::once(value));
        }
    }
}

/// `Overwrite: T|F`. Absent means `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overwrite(pub bool);

impl Header for Overwrite {
    fn name() -> &'static HeaderName {
        &OVERWRITE
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        match value.as_bytes() {
            b"T" => Ok(Overwrite(true)),
            b"F" => Ok(Overwrite(false)),
            _ => Err(headers::Error::invalid()),
        }
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let s = if self.0 { "T" } else { "F" };
        values.extend(std::iter::once(HeaderValue::from_static(s)));
    }
}

/// One alternative from a `Timeout` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DavTimeout {
    Infinite,
    Seconds(u32),
}

/// `Timeout` header (LOCK): comma separated list of alternatives, in
/// order of preference.
#[derive(Debug, Clone, PartialEq)]
pub struct Timeout(pub Vec<DavTimeout>);

impl Timeout {
    /// First alternative acceptable under `cap`. Falls back to the cap.
    pub(crate) fn pick(&self, cap: Duration) -> Duration {
        for t in &self.0 {
            match t {
                DavTimeout::Infinite => continue,
                DavTimeout::Seconds(n) => {
                    let d = Duration::from_secs(*n as u64);
                    if d <= cap {
                        return d;
                    }
                }
            }
        }
        cap
    }
}

impl Header for Timeout {
    fn name() -> &'static HeaderName {
        &TIMEOUT
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let s = value.to_str().map_err(|_| headers::Error::invalid())?;
        let mut v = Vec::new();
        for word in s.split(',').map(str::trim) {
            if word.eq_ignore_ascii_case("infinite") {
                v.push(DavTimeout::Infinite);
            } else if let Some(secs) = word.strip_prefix("Second-") {
                match secs.parse::<u32>() {
                    Ok(n) => v.push(DavTimeout::Seconds(n)),
                    Err(_) => return Err(headers::Error::invalid()),
                }
            }
            // unknown alternatives are skipped, the server picks from the rest.
        }
        Ok(Timeout(v))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let s = self
            .0
            .iter()
            .map(|t| match t {
                DavTimeout::Infinite => "Infinite".to_string(),
                DavTimeout::Seconds(n) => format!("Second-{n}"),
            })
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&s) {
            values.extend(std::iter::once(value));
        }
    }
}

/// `Lock-Token` header. The Coded-URL angle brackets are stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct LockToken(pub String);

impl Header for LockToken {
    fn name() -> &'static HeaderName {
        &LOCK_TOKEN
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let s = value.to_str().map_err(|_| headers::Error::invalid())?.trim();
        let token = s
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .ok_or_else(headers::Error::invalid)?;
        Ok(LockToken(token.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::from_str(&format!("<{}>", self.0)) {
            values.extend(std::iter::once(value));
        }
    }
}

/// `Content-Location` response header.
#[derive(Debug, Clone)]
pub struct ContentLocation(pub String);

impl Header for ContentLocation {
    fn name() -> &'static HeaderName {
        &http::header::CONTENT_LOCATION
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let s = value.to_str().map_err(|_| headers::Error::invalid())?;
        Ok(ContentLocation(s.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

/// `X-Litmus` test identifier, logged for debugging test runs.
#[derive(Debug, Clone)]
pub struct XLitmus(pub String);

impl fmt::Display for XLitmus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Header for XLitmus {
    fn name() -> &'static HeaderName {
        &X_LITMUS
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let value = values.next().ok_or_else(headers::Error::invalid)?;
        let s = value.to_str().map_err(|_| headers::Error::invalid())?;
        Ok(XLitmus(s.to_string()))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        if let Ok(value) = HeaderValue::from_str(&self.0) {
            values.extend(std::iter::once(value));
        }
    }
}

/// A single condition from an `If` header list.
#[derive(Debug, Clone, PartialEq)]
pub enum IfItem {
    /// State token (`<urn:uuid:...>`), brackets stripped.
    Token(String),
    /// Entity tag (`["..."]`), kept as sent, quotes included.
    ETag(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfCondition {
    pub not: bool,
    pub item: IfItem,
}

/// One parenthesized list. Conditions are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub struct IfList {
    /// Tagged resource (Coded-URL, brackets stripped), or None for the
    /// request target.
    pub resource: Option<String>,
    pub conditions: Vec<IfCondition>,
}

/// The RFC 4918 §10.4 `If` header. Lists are ORed.
#[derive(Debug, Clone, PartialEq)]
pub struct If(pub Vec<IfList>);

impl If {
    /// All state tokens mentioned anywhere in the header. These count as
    /// "submitted" for the purpose of lock arbitration.
    pub fn submitted_tokens(&self) -> impl Iterator<Item = &str> {
        self.0.iter().flat_map(|list| {
            list.conditions.iter().filter_map(|c| match &c.item {
                IfItem::Token(t) => Some(t.as_str()),
                IfItem::ETag(_) => None,
            })
        })
    }
}

fn parse_if(s: &str, lists: &mut Vec<IfList>) -> Result<(), headers::Error> {
    let mut chars = s.chars().peekable();
    let mut resource: Option<String> = None;

    // takes everything up to `end`, fails on end-of-input.
    fn upto(
        chars: &mut std::iter::Peekable<std::str::Chars>,
        end: char,
    ) -> Result<String, headers::Error> {
        let mut r = String::new();
        for c in chars.by_ref() {
            if c == end {
                return Ok(r);
            }
            r.push(c);
        }
        Err(headers::Error::invalid())
    }

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_ascii_whitespace() => {
                chars.next();
            }
            '<' => {
                chars.next();
                resource = Some(upto(&mut chars, '>')?);
            }
            '(' => {
                chars.next();
                let mut conditions = Vec::new();
                loop {
                    match chars.peek() {
                        Some(&w) if w.is_ascii_whitespace() => {
                            chars.next();
                        }
                        Some(')') => {
                            chars.next();
                            break;
                        }
                        Some(_) => {
                            let mut not = false;
                            // optional "Not" keyword.
                            if chars.peek() == Some(&'N') || chars.peek() == Some(&'n') {
                                for expect in "not".chars() {
                                    match chars.next() {
                                        Some(c) if c.eq_ignore_ascii_case(&expect) => {}
                                        _ => return Err(headers::Error::invalid()),
                                    }
                                }
                                not = true;
                                while chars.peek().map_or(false, |c| c.is_ascii_whitespace()) {
                                    chars.next();
                                }
                            }
                            let item = match chars.next() {
                                Some('<') => IfItem::Token(upto(&mut chars, '>')?),
                                Some('[') => IfItem::ETag(upto(&mut chars, ']')?.trim().to_string()),
                                _ => return Err(headers::Error::invalid()),
                            };
                            conditions.push(IfCondition { not, item });
                        }
                        None => return Err(headers::Error::invalid()),
                    }
                }
                if conditions.is_empty() {
                    return Err(headers::Error::invalid());
                }
                lists.push(IfList {
                    resource: resource.clone(),
                    conditions,
                });
            }
            _ => return Err(headers::Error::invalid()),
        }
    }
    Ok(())
}

impl Header for If {
    fn name() -> &'static HeaderName {
        &IF
    }

    fn decode<'i, I>(values: &mut I) -> Result<Self, headers::Error>
    where
        I: Iterator<Item = &'i HeaderValue>,
    {
        let mut lists = Vec::new();
        let mut any = false;
        for value in values {
            any = true;
            let s = value.to_str().map_err(|_| headers::Error::invalid())?;
            parse_if(s, &mut lists)?;
        }
        if !any || lists.is_empty() {
            return Err(headers::Error::invalid());
        }
        Ok(If(lists))
    }

    fn encode<E: Extend<HeaderValue>>(&self, values: &mut E) {
        let mut s = String::new();
        let mut last_resource: Option<&str> = None;
        for list in &self.0 {
            if let Some(r) = &list.resource {
                if last_resource != Some(r.as_str()) {
                    s.push_str(&format!("<{r}> "));
                    last_resource = Some(r.as_str());
                }
            }
            s.push('(');
            let conds = list
                .conditions
                .iter()
                .map(|c| {
                    let item = match &c.item {
                        IfItem::Token(t) => format!("<{t}>"),
                        IfItem::ETag(e) => format!("[{e}]"),
                    };
                    if c.not {
                        format!("Not {item}")
                    } else {
                        item
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
            s.push_str(&conds);
            s.push_str(") ");
        }
        if let Ok(value) = HeaderValue::from_str(s.trim_end()) {
            values.extend(std::iter::once(value));
        }
    }
}
