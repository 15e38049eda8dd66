//! Canonical URL paths.
//!
//! A [`DavPath`] is the decoded, normalized request path with the
//! configured prefix stripped off. A trailing slash marks a collection.
//! Two paths address the same resource iff they are equal after
//! trailing-slash normalization.
use std::fmt;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

use crate::errors::DavError;
use crate::DavResult;

// Characters that need escaping when a path is turned back into a URL.
const PATH_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%');

/// A canonical, prefix-stripped URL path.
#[derive(Clone)]
pub struct DavPath {
    // Decoded path, always starting with "/". Trailing slash means collection.
    path: String,
    // Prefix that was stripped off, decoded, no trailing slash.
    prefix: String,
    // OPTIONS * request.
    star: bool,
}

impl fmt::Display for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl fmt::Debug for DavPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.path)
    }
}

impl PartialEq for DavPath {
    fn eq(&self, other: &DavPath) -> bool {
        self.star == other.star
            && self.path.trim_end_matches('/') == other.path.trim_end_matches('/')
    }
}
impl Eq for DavPath {}

// Normalize "." / ".." / empty segments. Err on escaping the root.
fn normalize(path: &str) -> Result<String, DavError> {
    let mut segs: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if segs.pop().is_none() {
                    return Err(DavError::InvalidPath);
                }
            }
            s => segs.push(s),
        }
    }
    let mut p = String::with_capacity(path.len());
    for seg in &segs {
        p.push('/');
        p.push_str(seg);
    }
    if p.is_empty() || path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..") {
        p.push('/');
    }
    Ok(p)
}

impl DavPath {
    /// Parse a decoded path. The prefix must already be stripped.
    pub fn new(path: &str) -> DavResult<DavPath> {
        DavPath::from_str_and_prefix(path, "")
    }

    /// Parse a raw (still percent-encoded) path and strip `prefix` off.
    pub fn from_str_and_prefix(rawpath: &str, prefix: &str) -> DavResult<DavPath> {
        if rawpath == "*" {
            return Ok(DavPath {
                path: "/".to_string(),
                prefix: prefix.trim_end_matches('/').to_string(),
                star: true,
            });
        }
        if !rawpath.starts_with('/') {
            return Err(DavError::InvalidPath);
        }
        let decoded = percent_decode_str(rawpath)
            .decode_utf8()
            .map_err(|_| DavError::InvalidPath)?;
        if decoded.contains('\0') {
            return Err(DavError::InvalidPath);
        }
        let path = normalize(&decoded)?;

        let prefix = prefix.trim_end_matches('/');
        let rest = match path.strip_prefix(prefix) {
            Some(rest) if rest.is_empty() => "/",
            Some(rest) if rest.starts_with('/') => rest,
            _ => return Err(DavError::InvalidPath),
        };
        Ok(DavPath {
            path: rest.to_string(),
            prefix: prefix.to_string(),
            star: false,
        })
    }

    /// Parse the path of an `http::Uri` and strip `prefix` off.
    pub fn from_uri_and_prefix(uri: &http::Uri, prefix: &str) -> DavResult<DavPath> {
        DavPath::from_str_and_prefix(uri.path(), prefix)
    }

    /// Was this an `OPTIONS *` request.
    pub(crate) fn is_star(&self) -> bool {
        self.star
    }

    /// Does the path have a trailing slash.
    pub fn is_collection(&self) -> bool {
        self.path.ends_with('/')
    }

    /// The server root.
    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// Add a trailing slash if there is none.
    pub(crate) fn add_slash(&mut self) {
        if !self.is_collection() {
            self.path.push('/');
        }
    }

    pub(crate) fn add_slash_if(&mut self, cond: bool) {
        if cond {
            self.add_slash();
        }
    }

    /// Path as a percent-encoded URL string, without the prefix.
    pub fn as_url_string(&self) -> String {
        utf8_percent_encode(&self.path, PATH_ENCODE_SET).to_string()
    }

    /// Path as a percent-encoded URL string, prefix included.
    pub fn as_url_string_with_prefix(&self) -> String {
        let mut p = utf8_percent_encode(&self.prefix, PATH_ENCODE_SET).to_string();
        p.push_str(&self.as_url_string());
        p
    }

    /// The decoded path segments, in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }

    /// Last path segment. Empty for the root.
    pub fn file_name(&self) -> &str {
        self.segments().last().unwrap_or("")
    }

    /// Guess a media type from the name, like mod_mime does.
    pub(crate) fn get_mime_type_str(&self) -> String {
        mime_guess::from_path(self.file_name())
            .first_or_octet_stream()
            .to_string()
    }

    /// The parent collection. The root is its own parent.
    pub fn parent(&self) -> DavPath {
        let trimmed = self.path.trim_end_matches('/');
        let path = match trimmed.rfind('/') {
            Some(idx) => trimmed[..idx + 1].to_string(),
            None => "/".to_string(),
        };
        DavPath {
            path,
            prefix: self.prefix.clone(),
            star: false,
        }
    }

    /// Append one (decoded) segment.
    pub fn push_segment(&mut self, name: &str) {
        self.add_slash();
        self.path.push_str(name);
    }

    /// Is `other` equal to, or located below, this path.
    pub(crate) fn is_ancestor_of(&self, other: &DavPath) -> bool {
        let me = self.path.trim_end_matches('/');
        let them = other.path.trim_end_matches('/');
        them == me || them.starts_with(&format!("{me}/"))
    }

    /// Rebase this path from `from` onto `to` (COPY/MOVE destinations).
    pub(crate) fn rebase(&self, from: &DavPath, to: &DavPath) -> DavPath {
        let me = self.path.trim_end_matches('/');
        let f = from.path.trim_end_matches('/');
        let rest = me.strip_prefix(f).unwrap_or("");
        let mut path = to.path.trim_end_matches('/').to_string();
        path.push_str(rest);
        if self.is_collection() {
            path.push('/');
        }
        if path.is_empty() {
            path.push('/');
        }
        DavPath {
            path,
            prefix: to.prefix.clone(),
            star: false,
        }
    }
}
