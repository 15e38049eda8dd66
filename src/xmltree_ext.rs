//
// Extensions on xmltree::Element: strict parsing into the canonical
// namespace-resolved form, and serialization that keeps the client's
// namespace prefixes stable.
//
use std::io::{Read, Write};

use xml::common::XmlVersion;
use xml::name::Name;
use xml::writer::{EmitterConfig, EventWriter, XmlEvent as XmlWEvent};
use xmltree::Element;

use crate::errors::DavError;
use crate::DavResult;

pub(crate) const NS_DAV_URI: &str = "DAV:";

pub(crate) trait ElementExt {
    fn new2(name: &str) -> Element;
    fn ns<S: Into<String>>(self, prefix: S, uri: S) -> Element;
    fn text<S: Into<String>>(self, text: S) -> Element;
    fn parse2<R: Read>(r: R) -> DavResult<Element>;
    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> DavResult<()>;
}

impl ElementExt for Element {
    /// Create an element from a possibly prefixed name ("D:href").
    fn new2(name: &str) -> Element {
        match name.split_once(':') {
            Some((prefix, local)) => {
                let mut e = Element::new(local);
                e.prefix = Some(prefix.to_string());
                e
            }
            None => Element::new(name),
        }
    }

    fn ns<S: Into<String>>(mut self, prefix: S, uri: S) -> Element {
        let prefix = prefix.into();
        let uri = uri.into();
        let mut ns = self
            .namespaces
            .take()
            .unwrap_or_else(xml::namespace::Namespace::empty);
        ns.put(prefix.clone(), uri.clone());
        self.namespaces = Some(ns);
        if !prefix.is_empty() {
            self.prefix = Some(prefix);
        }
        self.namespace = Some(uri);
        self
    }

    fn text<S: Into<String>>(mut self, text: S) -> Element {
        self.text = Some(text.into());
        self
    }

    /// Parse a request body. Strict: a parse error is a 400, never a
    /// silently empty tree. `xml:lang` is inherited downward and
    /// materialized on the property elements below `prop` so property
    /// echoes keep the language of the request.
    fn parse2<R: Read>(r: R) -> DavResult<Element> {
        let mut root = Element::parse(r).map_err(|_| DavError::XmlParseError)?;
        propagate_lang(&mut root, None);
        Ok(root)
    }

    fn write_ev<W: Write>(&self, emitter: &mut EventWriter<W>) -> DavResult<()> {
        let mut scope = Vec::new();
        write_elem(self, emitter, &mut scope)
    }
}

// xml:lang flows down; direct children of a DAV: "prop" element get it
// stamped on so each property value remembers its language.
fn propagate_lang(elem: &mut Element, inherited: Option<&str>) {
    let lang = elem
        .attributes
        .get("lang")
        .or_else(|| elem.attributes.get("xml:lang"))
        .cloned()
        .or_else(|| inherited.map(|s| s.to_string()));
    let is_prop = elem.name == "prop" && elem.namespace.as_deref() == Some(NS_DAV_URI);
    for child in &mut elem.children {
        if is_prop {
            if let Some(l) = &lang {
                child
                    .attributes
                    .entry("xml:lang".to_string())
                    .or_insert_with(|| l.clone());
            }
        }
        propagate_lang(child, lang.as_deref());
    }
}

// In-scope namespace declarations: (prefix or None-for-default, uri).
pub(crate) type NsScope = Vec<(Option<String>, String)>;

fn in_scope(scope: &NsScope, prefix: Option<&str>, uri: &str) -> bool {
    // innermost declaration wins.
    scope
        .iter()
        .rev()
        .find(|(p, _)| p.as_deref() == prefix)
        .map(|(_, u)| u == uri)
        .unwrap_or(false)
}

fn prefix_for(scope: &NsScope, uri: &str) -> Option<String> {
    scope
        .iter()
        .rev()
        .find(|(p, u)| p.is_some() && u == uri)
        .and_then(|(p, _)| p.clone())
}

pub(crate) fn write_elem<W: Write>(
    elem: &Element,
    emitter: &mut EventWriter<W>,
    scope: &mut NsScope,
) -> DavResult<()> {
    let mut declared = 0;

    // pick the serialized name, and whether this element has to carry
    // its own namespace declaration.
    let mut decl: Option<(Option<String>, String)> = None;
    let qname = match (&elem.prefix, &elem.namespace) {
        (Some(p), Some(uri)) => {
            if !in_scope(scope, Some(p), uri) {
                decl = Some((Some(p.clone()), uri.clone()));
            }
            format!("{}:{}", p, elem.name)
        }
        // prefix without a resolved uri: trust the declaration made
        // further up (the multistatus root).
        (Some(p), None) => format!("{}:{}", p, elem.name),
        (None, Some(uri)) => {
            if in_scope(scope, None, uri) {
                elem.name.clone()
            } else if let Some(p) = prefix_for(scope, uri) {
                // children's consistent inherited prefix.
                format!("{}:{}", p, elem.name)
            } else {
                // no usable prefix anywhere: scope a default namespace
                // onto this element.
                decl = Some((None, uri.clone()));
                elem.name.clone()
            }
        }
        (None, None) => elem.name.clone(),
    };

    let mut ev = XmlWEvent::start_element(qname.as_str());
    if let Some((prefix, uri)) = &decl {
        ev = match prefix {
            Some(p) => ev.ns(p.as_str(), uri.as_str()),
            None => ev.default_ns(uri.as_str()),
        };
        scope.push((prefix.clone(), uri.clone()));
        declared += 1;
    }

    // extra prefixes declared on this element (carried over from the
    // request for stable client-visible names).
    if let Some(ns) = &elem.namespaces {
        for (p, uri) in ns.0.iter() {
            if p.is_empty() || uri.is_empty() || is_reserved_prefix(p) {
                continue;
            }
            if !in_scope(scope, Some(p), uri) {
                ev = ev.ns(p.as_str(), uri.as_str());
                scope.push((Some(p.clone()), uri.clone()));
                declared += 1;
            }
        }
    }

    for (name, value) in &elem.attributes {
        ev = ev.attr(Name::from(name.as_str()), value);
    }

    emitter.write(ev)?;
    if let Some(text) = &elem.text {
        emitter.write(XmlWEvent::characters(text))?;
    }
    for child in &elem.children {
        write_elem(child, emitter, scope)?;
    }
    emitter.write(XmlWEvent::end_element())?;

    scope.truncate(scope.len() - declared);
    Ok(())
}

fn is_reserved_prefix(p: &str) -> bool {
    p == "xml" || p == "xmlns"
}

/// A configured XML writer: pretty in debug builds, single-line in
/// release builds.
pub(crate) fn emitter<W: Write>(w: W) -> DavResult<EventWriter<W>> {
    let mut emitter = EventWriter::new_with_config(
        w,
        EmitterConfig {
            normalize_empty_elements: false,
            perform_indent: cfg!(debug_assertions),
            ..Default::default()
        },
    );
    emitter.write(XmlWEvent::StartDocument {
        version: XmlVersion::Version10,
        encoding: Some("utf-8"),
        standalone: None,
    })?;
    Ok(emitter)
}

/// Serialize a single element to standalone bytes (dead property
/// storage format).
pub(crate) fn element_to_bytes(elem: &Element) -> DavResult<Vec<u8>> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    let mut emitter = EventWriter::new_with_config(
        &mut cursor,
        EmitterConfig {
            normalize_empty_elements: false,
            perform_indent: false,
            write_document_declaration: false,
            ..Default::default()
        },
    );
    elem.write_ev(&mut emitter)?;
    Ok(cursor.into_inner())
}

/// Client prefix declarations found in a request body, so responses can
/// reuse them. `DAV:` is excluded, the response root owns that one.
pub(crate) fn collect_prefixes(elem: &Element, out: &mut Vec<(String, String)>) {
    if let (Some(p), Some(uri)) = (&elem.prefix, &elem.namespace) {
        if uri != NS_DAV_URI
            && !is_reserved_prefix(p)
            && !out.iter().any(|(op, _)| op == p)
        {
            out.push((p.clone(), uri.clone()));
        }
    }
    for child in &elem.children {
        collect_prefixes(child, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_parse_resolves_namespaces() {
        let xml = r#"<?xml version="1.0"?>
            <D:propfind xmlns:D="DAV:"><D:prop>
                <Z:author xmlns:Z="urn:example"/>
            </D:prop></D:propfind>"#;
        let root = Element::parse2(Cursor::new(xml)).unwrap();
        assert_eq!(root.name, "propfind");
        assert_eq!(root.namespace.as_deref(), Some("DAV:"));
        let prop = &root.children[0];
        let author = &prop.children[0];
        assert_eq!(author.namespace.as_deref(), Some("urn:example"));
        assert_eq!(author.prefix.as_deref(), Some("Z"));
    }

    #[test]
    fn test_parse_malformed() {
        assert!(Element::parse2(Cursor::new("<unclosed>")).is_err());
    }

    #[test]
    fn test_lang_materialized_on_props() {
        let xml = r#"<D:propfind xmlns:D="DAV:" xml:lang="en">
            <D:prop><D:displayname/></D:prop></D:propfind>"#;
        let root = Element::parse2(Cursor::new(xml)).unwrap();
        let name = &root.children[0].children[0];
        assert_eq!(name.attributes.get("xml:lang").map(|s| s.as_str()), Some("en"));
    }

    #[test]
    fn test_write_roundtrip() {
        let mut e = Element::new2("author").ns("Z", "urn:example");
        e.children.push(Element::new2("Z:name").text("rustacean"));
        e.children[0].namespace = Some("urn:example".to_string());
        let bytes = element_to_bytes(&e).unwrap();
        let s = String::from_utf8(bytes.clone()).unwrap();
        assert!(s.contains("xmlns:Z=\"urn:example\""));
        // the nested element reuses the in-scope declaration.
        assert_eq!(s.matches("urn:example").count(), 1);
        let back = Element::parse2(Cursor::new(bytes)).unwrap();
        assert_eq!(back.name, "author");
        assert_eq!(back.namespace.as_deref(), Some("urn:example"));
        assert_eq!(back.children[0].text.as_deref(), Some("rustacean"));
    }
}
