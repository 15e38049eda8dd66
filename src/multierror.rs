//
// Multi-Status responses for the resource-level verbs (DELETE,
// COPY, MOVE). Collects per-resource outcomes while a tree walk is in
// progress, then renders either a plain single-status response or one
// 207 `<multistatus>`.
//
use http::{Response, StatusCode};
use xmltree::Element;

use crate::body::Body;
use crate::davpath::DavPath;
use crate::errors::DavError;
use crate::util::MemBuffer;
use crate::xmltree_ext::{self, ElementExt, NsScope, NS_DAV_URI};
use crate::DavResult;

struct MultiStatusEntry {
    path: DavPath,
    status: StatusCode,
    // optional <error> precondition fragment.
    error: Option<Element>,
}

pub(crate) struct MultiError {
    path: DavPath,
    entries: Vec<MultiStatusEntry>,
}

impl MultiError {
    pub fn new(path: DavPath) -> MultiError {
        MultiError {
            path,
            entries: Vec::new(),
        }
    }

    /// Record a status for one resource.
    pub fn add_status(&mut self, path: &DavPath, status: StatusCode) {
        self.entries.push(MultiStatusEntry {
            path: path.clone(),
            status,
            error: None,
        });
    }

    /// Record a status plus a DAV precondition element.
    pub fn add_error(&mut self, path: &DavPath, status: StatusCode, error: Element) {
        self.entries.push(MultiStatusEntry {
            path: path.clone(),
            status,
            error: Some(error),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Turn the collected entries into a response.
    ///
    /// No entries: plain `success` response. One entry for the request
    /// path itself: that status directly. Anything else: 207.
    pub fn final_response(self, success: StatusCode) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());
        if self.entries.is_empty() {
            *res.status_mut() = success;
            return Ok(res);
        }
        if self.entries.len() == 1 && self.entries[0].path == self.path {
            *res.status_mut() = self.entries[0].status;
            if self.entries[0].status == StatusCode::LOCKED {
                res.headers_mut().insert(
                    "content-type",
                    "application/xml; charset=utf-8".parse().unwrap(),
                );
                *res.body_mut() = crate::util::dav_xml_error("<D:lock-token-submitted/>");
            }
            return Ok(res);
        }

        let mut buffer = MemBuffer::new();
        let mut emitter = xmltree_ext::emitter(buffer.clone())?;
        let mut scope: NsScope = vec![(Some("D".to_string()), NS_DAV_URI.to_string())];

        emitter.write(xml::writer::XmlEvent::start_element("D:multistatus").ns("D", NS_DAV_URI))?;
        for entry in &self.entries {
            emitter.write(xml::writer::XmlEvent::start_element("D:response"))?;
            Element::new2("D:href")
                .text(entry.path.as_url_string_with_prefix())
                .write_ev(&mut emitter)?;
            Element::new2("D:status")
                .text(status_line(entry.status))
                .write_ev(&mut emitter)?;
            if let Some(error) = &entry.error {
                emitter.write(xml::writer::XmlEvent::start_element("D:error"))?;
                xmltree_ext::write_elem(error, &mut emitter, &mut scope)?;
                emitter.write(xml::writer::XmlEvent::end_element())?;
            }
            emitter.write(xml::writer::XmlEvent::end_element())?;
        }
        emitter.write(xml::writer::XmlEvent::end_element())?;

        *res.status_mut() = StatusCode::MULTI_STATUS;
        res.headers_mut().insert(
            "content-type",
            "application/xml; charset=utf-8".parse().unwrap(),
        );
        *res.body_mut() = Body::from(buffer.take());
        Ok(res)
    }
}

pub(crate) fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("HTTP/1.1 {} {}", status.as_u16(), reason),
        None => format!("HTTP/1.1 {}", status.as_u16()),
    }
}

// Multistatus bodies always describe errors at the resource level; the
// dispatcher must not override the 207 with its own error mapping.
impl From<MultiError> for DavError {
    fn from(_: MultiError) -> Self {
        DavError::ChildError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    async fn body_string(mut body: Body) -> String {
        let mut v = Vec::new();
        while let Some(chunk) = body.next().await {
            v.extend_from_slice(&chunk.unwrap());
        }
        String::from_utf8(v).unwrap()
    }

    #[tokio::test]
    async fn test_empty_is_success() {
        let me = MultiError::new(DavPath::new("/x").unwrap());
        let res = me.final_response(StatusCode::NO_CONTENT).unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_single_self_entry_is_plain() {
        let path = DavPath::new("/x").unwrap();
        let mut me = MultiError::new(path.clone());
        me.add_status(&path, StatusCode::LOCKED);
        let res = me.final_response(StatusCode::NO_CONTENT).unwrap();
        assert_eq!(res.status(), StatusCode::LOCKED);
    }

    #[tokio::test]
    async fn test_multi_renders_207() {
        let path = DavPath::new("/c/").unwrap();
        let mut me = MultiError::new(path.clone());
        me.add_status(&DavPath::new("/c/y").unwrap(), StatusCode::LOCKED);
        me.add_status(&path, StatusCode::FAILED_DEPENDENCY);
        let res = me.final_response(StatusCode::NO_CONTENT).unwrap();
        assert_eq!(res.status(), StatusCode::MULTI_STATUS);
        let body = body_string(res.into_body()).await;
        assert!(body.contains("<D:href>/c/y</D:href>"));
        assert!(body.contains("HTTP/1.1 423 Locked"));
        assert!(body.contains("HTTP/1.1 424 Failed Dependency"));
    }
}
