use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use xml::writer::{EventWriter, XmlEvent as XmlWEvent};
use xmltree::Element;

use crate::body::Body;
use crate::conditional::{self, if_match_get_tokens};
use crate::davheaders::{self, Depth};
use crate::davpath::DavPath;
use crate::errors::{fserror_to_status, DavError};
use crate::fs::{DavFileSystem, DavMetaData, DavProp};
use crate::ls::{DavLockSystem, EffectiveLocks, LockPermission};
use crate::util::{dav_xml_error, systemtime_to_httpdate, systemtime_to_rfc3339, DavMethod, MemBuffer};
use crate::xmltree_ext::{self, ElementExt, NsScope, NS_DAV_URI};
use crate::DavResult;

// Live properties the engine computes. PROPPATCH cannot touch them.
const LIVE_PROPERTIES: &[&str] = &[
    "creationdate",
    "getcontentlength",
    "getcontenttype",
    "getetag",
    "getlastmodified",
    "resourcetype",
    "supportedlock",
    "lockdiscovery",
];

// list returned by PROPFIND <propname/>.
const PROPNAME_STR: &[&str] = &[
    "D:creationdate",
    "D:displayname",
    "D:getcontentlanguage",
    "D:getcontentlength",
    "D:getcontenttype",
    "D:getetag",
    "D:getlastmodified",
    "D:lockdiscovery",
    "D:resourcetype",
    "D:supportedlock",
];

// properties returned by PROPFIND <allprop/> or empty body.
const ALLPROP_STR: &[&str] = PROPNAME_STR;

lazy_static! {
    static ref ALLPROP: Vec<Element> = init_staticprop(ALLPROP_STR);
    static ref PROPNAME: Vec<Element> = init_staticprop(PROPNAME_STR);
}

fn init_staticprop(p: &[&str]) -> Vec<Element> {
    p.iter()
        .map(|name| {
            let mut e = Element::new2(name);
            if e.prefix.as_deref() == Some("D") {
                e.namespace = Some(NS_DAV_URI.to_string());
            }
            e
        })
        .collect()
}

struct StatusElement {
    status: StatusCode,
    element: Element,
}

// Writes one <multistatus> with a <response> per resource, each with
// <propstat> groups keyed by status code.
struct PropWriter {
    emitter: EventWriter<MemBuffer>,
    buffer: MemBuffer,
    name: String,
    props: Vec<Element>,
    fs: Arc<dyn DavFileSystem>,
    ls: Option<Arc<dyn DavLockSystem>>,
    scope: NsScope,
}

impl PropWriter {
    fn new(
        res: &mut Response<Body>,
        name: &str,
        mut props: Vec<Element>,
        fs: Arc<dyn DavFileSystem>,
        ls: Option<Arc<dyn DavLockSystem>>,
        prefixes: Vec<(String, String)>,
    ) -> DavResult<PropWriter> {
        res.headers_mut().insert(
            "content-type",
            "application/xml; charset=utf-8".parse().unwrap(),
        );
        *res.status_mut() = StatusCode::MULTI_STATUS;

        // the static prop tables supply whatever an allprop/propname
        // request did not name explicitly.
        if name != "prop" && name != "propertyupdate" {
            let table = if name == "propname" { &*PROPNAME } else { &*ALLPROP };
            for a in table.iter() {
                if !props
                    .iter()
                    .any(|e| a.namespace == e.namespace && a.name == e.name)
                {
                    props.push(a.clone());
                }
            }
        }

        let buffer = MemBuffer::new();
        let mut emitter = xmltree_ext::emitter(buffer.clone())?;
        let mut scope: NsScope = vec![(Some("D".to_string()), NS_DAV_URI.to_string())];

        let mut ev = XmlWEvent::start_element("D:multistatus").ns("D", NS_DAV_URI);
        // redeclare the client's prefixes on the root for stable
        // property names in the response.
        for (p, uri) in &prefixes {
            ev = ev.ns(p.as_str(), uri.as_str());
            scope.push((Some(p.clone()), uri.clone()));
        }
        emitter.write(ev)?;

        Ok(PropWriter {
            emitter,
            buffer,
            name: name.to_string(),
            props,
            fs,
            ls,
            scope,
        })
    }

    fn build_elem<T>(&self, content: bool, e: &Element, text: T) -> StatusElement
    where
        T: Into<String>,
    {
        let mut elem = Element {
            prefix: e.prefix.clone(),
            namespace: e.namespace.clone(),
            namespaces: None,
            name: e.name.clone(),
            attributes: e.attributes.clone(),
            children: Vec::new(),
            text: None,
        };
        if content {
            let text = text.into();
            if !text.is_empty() {
                elem.text = Some(text);
            }
        }
        StatusElement {
            status: StatusCode::OK,
            element: elem,
        }
    }

    async fn build_prop(
        &self,
        prop: &Element,
        path: &DavPath,
        meta: &dyn DavMetaData,
        docontent: bool,
    ) -> DavResult<StatusElement> {
        // some DAV: properties (displayname and friends) are stored in
        // the dead prop database when the backend has one.
        let mut try_deadprop = false;

        match prop.namespace.as_deref() {
            Some(NS_DAV_URI) => match prop.name.as_str() {
                "creationdate" => {
                    let time = meta.created().or_else(|_| meta.modified());
                    if let Ok(time) = time {
                        return Ok(self.build_elem(docontent, prop, systemtime_to_rfc3339(time)));
                    }
                }
                "getetag" => {
                    if let Some(etag) = meta.etag() {
                        return Ok(self.build_elem(docontent, prop, format!("\"{etag}\"")));
                    }
                }
                "getcontentlength" => {
                    if !meta.is_dir() {
                        return Ok(self.build_elem(docontent, prop, meta.len().to_string()));
                    }
                }
                "getcontenttype" => {
                    let ct = if meta.is_dir() {
                        "httpd/unix-directory".to_string()
                    } else {
                        path.get_mime_type_str()
                    };
                    return Ok(self.build_elem(docontent, prop, ct));
                }
                "getlastmodified" => {
                    if let Ok(time) = meta.modified() {
                        return Ok(self.build_elem(docontent, prop, systemtime_to_httpdate(time)));
                    }
                }
                "resourcetype" => {
                    let mut se = self.build_elem(docontent, prop, "");
                    if meta.is_dir() && docontent {
                        se.element.children.push(Element::new2("D:collection"));
                    }
                    return Ok(se);
                }
                "supportedlock" => {
                    let elem = if self.ls.is_some() {
                        super::handle_lock::list_supportedlock()
                    } else {
                        Element::new2("D:supportedlock")
                    };
                    return Ok(StatusElement {
                        status: StatusCode::OK,
                        element: elem,
                    });
                }
                "lockdiscovery" => {
                    let locks = match &self.ls {
                        Some(ls) => ls.list(path).await,
                        None => Vec::new(),
                    };
                    return Ok(StatusElement {
                        status: StatusCode::OK,
                        element: super::handle_lock::list_lockdiscovery(&locks),
                    });
                }
                _ => {
                    try_deadprop = true;
                }
            },
            _ => {
                try_deadprop = true;
            }
        }

        if try_deadprop && self.name == "prop" && self.fs.have_props(path).await {
            // asking for a specific property.
            let dprop = element_to_davprop(prop);
            if let Ok(xml) = self.fs.get_prop(path, dprop).await {
                if let Ok(e) = Element::parse2(Cursor::new(xml)) {
                    return Ok(StatusElement {
                        status: StatusCode::OK,
                        element: e,
                    });
                }
            }
        }
        let mut not_found = self.build_elem(false, prop, "");
        not_found.status = StatusCode::NOT_FOUND;
        Ok(not_found)
    }

    async fn write_props(&mut self, path: &DavPath, meta: &dyn DavMetaData) -> DavResult<()> {
        // A map of StatusCode => Vec<Element> for the result.
        let mut props: HashMap<StatusCode, Vec<Element>> = HashMap::new();

        let do_content = self.name != "propname";
        let requested = std::mem::take(&mut self.props);
        for p in &requested {
            let res = self.build_prop(p, path, meta, do_content).await?;
            if res.status == StatusCode::OK || self.name == "prop" {
                props.entry(res.status).or_default().push(res.element);
            }
        }
        self.props = requested;

        // and list the dead properties as well.
        if (self.name == "propname" || self.name == "allprop") && self.fs.have_props(path).await {
            if let Ok(v) = self.fs.get_props(path, do_content).await {
                for prop in v {
                    props
                        .entry(StatusCode::OK)
                        .or_default()
                        .push(davprop_to_element(prop));
                }
            }
        }

        self.write_propresponse(path, props, HashMap::new())
    }

    fn write_propresponse(
        &mut self,
        path: &DavPath,
        props: HashMap<StatusCode, Vec<Element>>,
        errors: HashMap<StatusCode, Element>,
    ) -> DavResult<()> {
        self.emitter.write(XmlWEvent::start_element("D:response"))?;
        Element::new2("D:href")
            .text(path.as_url_string_with_prefix())
            .write_ev(&mut self.emitter)?;

        let mut keys = props.keys().collect::<Vec<_>>();
        keys.sort();
        for status in keys {
            let v = props.get(status).unwrap();
            self.emitter.write(XmlWEvent::start_element("D:propstat"))?;
            self.emitter.write(XmlWEvent::start_element("D:prop"))?;
            for elem in v.iter() {
                xmltree_ext::write_elem(elem, &mut self.emitter, &mut self.scope)?;
            }
            self.emitter.write(XmlWEvent::end_element())?;
            Element::new2("D:status")
                .text(crate::multierror::status_line(*status))
                .write_ev(&mut self.emitter)?;
            if let Some(error) = errors.get(status) {
                self.emitter.write(XmlWEvent::start_element("D:error"))?;
                xmltree_ext::write_elem(error, &mut self.emitter, &mut self.scope)?;
                self.emitter.write(XmlWEvent::end_element())?;
            }
            self.emitter.write(XmlWEvent::end_element())?;
        }

        self.emitter.write(XmlWEvent::end_element())?; // response
        Ok(())
    }

    fn finish(mut self) -> DavResult<Body> {
        self.emitter.write(XmlWEvent::end_element())?; // multistatus
        Ok(Body::from(self.buffer.take()))
    }
}

impl crate::DavHandler {
    pub(crate) async fn handle_propfind(
        &self,
        req: &Request<()>,
        xmldata: &[u8],
    ) -> DavResult<Response<Body>> {
        // No checks on If: and If-* headers here, because I do not see
        // the point and there's nothing in RFC4918 that indicates we should.

        let mut res = Response::new(Body::empty());
        res.headers_mut().insert(
            "cache-control",
            "no-store, no-cache, must-revalidate".parse().unwrap(),
        );
        res.headers_mut().insert("pragma", "no-cache".parse().unwrap());

        // Depth defaults to infinity; deployments that find that too
        // expensive turn it into an error instead.
        let depth = match req.headers().typed_get::<Depth>() {
            Some(Depth::Infinity) | None => {
                if self.propfind_finite_depth
                    && req.headers().typed_get::<davheaders::XLitmus>().is_none()
                {
                    res.headers_mut().insert(
                        "content-type",
                        "application/xml; charset=utf-8".parse().unwrap(),
                    );
                    *res.status_mut() = StatusCode::FORBIDDEN;
                    *res.body_mut() = dav_xml_error("<D:propfind-finite-depth/>");
                    return Ok(res);
                }
                Depth::Infinity
            }
            Some(d) => d,
        };

        let mut path = self.path(req);
        let meta = self.fs.metadata(&path).await?;
        let meta = self.fixpath(&mut res, &mut path, meta);

        let mut root = None;
        if !xmldata.is_empty() {
            let tree = Element::parse2(Cursor::new(xmldata))?;
            if tree.name != "propfind" || tree.namespace.as_deref() != Some(NS_DAV_URI) {
                return Err(DavError::XmlParseError);
            }
            root = Some(tree);
        }

        let mut prefixes = Vec::new();
        if let Some(root) = &root {
            xmltree_ext::collect_prefixes(root, &mut prefixes);
        }

        let (name, props) = match root {
            None => ("allprop", Vec::new()),
            Some(mut elem) => {
                let includes = elem
                    .take_child("include")
                    .map_or(Vec::new(), |c| c.children);
                match elem
                    .children
                    .iter()
                    .position(|e| e.name == "propname" || e.name == "prop" || e.name == "allprop")
                    .map(|i| elem.children.remove(i))
                {
                    Some(elem) => match elem.name.as_str() {
                        "propname" => ("propname", Vec::new()),
                        "prop" => ("prop", elem.children),
                        "allprop" => ("allprop", includes),
                        _ => return Err(DavError::XmlParseError),
                    },
                    None => return Err(DavError::XmlParseError),
                }
            }
        };

        debug!("propfind: type request: {}", name);

        let mut pw = PropWriter::new(
            &mut res,
            name,
            props,
            self.fs.clone(),
            self.ls.clone(),
            prefixes,
        )?;
        pw.write_props(&path, &*meta).await?;

        // walk the tree iteratively; recursion depth is the client's
        // choice, not ours.
        if meta.is_dir() && depth != Depth::Zero {
            let mut stack = vec![path.clone()];
            while let Some(dir) = stack.pop() {
                let entries = match self.fs.read_dir(&dir).await {
                    Ok(entries) => {
                        use futures_util::StreamExt;
                        entries.collect::<Vec<_>>().await
                    }
                    Err(e) => {
                        // if we cannot read_dir, just skip it.
                        error!("read_dir {dir} error {e:?}");
                        continue;
                    }
                };
                for entry in entries {
                    let mut npath = dir.clone();
                    npath.push_segment(&entry.name());
                    let meta = match entry.metadata().await {
                        Ok(meta) => meta,
                        Err(e) => {
                            debug!("metadata error on {}. Skipping {:?}", npath, e);
                            continue;
                        }
                    };
                    npath.add_slash_if(meta.is_dir());
                    pw.write_props(&npath, &*meta).await?;
                    if meta.is_dir() && depth == Depth::Infinity {
                        stack.push(npath);
                    }
                }
            }
        }

        *res.body_mut() = pw.finish()?;
        Ok(res)
    }

    pub(crate) async fn handle_proppatch(
        &self,
        req: &Request<()>,
        xmldata: &[u8],
    ) -> DavResult<Response<Body>> {
        let mut res = Response::new(Body::empty());

        // file must exist.
        let mut path = self.path(req);
        let meta = self.fs.metadata(&path).await?;
        let meta = self.fixpath(&mut res, &mut path, meta);

        // check the If and If-* headers.
        let tokens = if_match_get_tokens(
            req.headers(),
            Some(&*meta),
            &*self.fs,
            self.ls.as_deref(),
            &self.prefix,
            &path,
        )
        .await?;
        if let Some(status) =
            conditional::http_conditionals(req.headers(), DavMethod::PropPatch, Some(&*meta))
        {
            return Err(DavError::Status(status));
        }

        // property changes count as touching the namespace entry.
        if let Some(ls) = &self.ls {
            let eff = EffectiveLocks::gather(&**ls, &path).await;
            if eff.evaluate(DavMethod::PropPatch, &tokens, self.principal_str())
                != LockPermission::Full
            {
                return Err(DavError::Status(StatusCode::LOCKED));
            }
        }

        debug!(
            "proppatch input:\n{}",
            String::from_utf8_lossy(xmldata)
        );

        // parse xml
        let tree = Element::parse2(Cursor::new(xmldata))?;
        if tree.name != "propertyupdate" || tree.namespace.as_deref() != Some(NS_DAV_URI) {
            return Err(DavError::XmlParseError);
        }
        let mut prefixes = Vec::new();
        xmltree_ext::collect_prefixes(&tree, &mut prefixes);

        let can_deadprop = self.fs.have_props(&path).await;

        // walk the set/remove entries in document order. Live
        // properties are protected; everything else is staged for the
        // backend.
        let mut patch = Vec::new();
        let mut ret: Vec<(StatusCode, DavProp)> = Vec::new();
        let mut protected = false;
        for elem in &tree.children {
            let set = match elem.name.as_str() {
                "set" => true,
                "remove" => false,
                _ => continue,
            };
            for n in elem
                .children
                .iter()
                .filter(|f| f.name == "prop")
                .flat_map(|f| &f.children)
            {
                let is_live = n.namespace.as_deref() == Some(NS_DAV_URI)
                    && LIVE_PROPERTIES.contains(&n.name.as_str());
                if is_live {
                    protected = true;
                    ret.push((StatusCode::FORBIDDEN, element_to_davprop(n)));
                } else if !can_deadprop {
                    ret.push((StatusCode::FORBIDDEN, element_to_davprop(n)));
                } else if set {
                    patch.push((true, element_to_davprop_full(n)?));
                } else {
                    patch.push((false, element_to_davprop(n)));
                }
            }
        }

        if !ret.is_empty() {
            // anything that would have succeeded reports 424 instead,
            // and nothing is applied.
            ret.extend(
                patch
                    .into_iter()
                    .map(|(_, prop)| (StatusCode::FAILED_DEPENDENCY, prop)),
            );
        } else if !patch.is_empty() {
            match self.fs.patch_props(&path, patch.clone()).await {
                Ok(deadret) => {
                    ret.extend(deadret);
                }
                Err(e) => {
                    // the backend kept its promise of atomicity; report
                    // the failure for every property.
                    let status = fserror_to_status(&e);
                    ret.extend(patch.into_iter().map(|(_, prop)| (status, prop)));
                }
            }
        }

        // group by statuscode.
        let mut hm: HashMap<StatusCode, Vec<Element>> = HashMap::new();
        for (code, prop) in ret {
            let mut elem = davprop_to_element(prop);
            elem.children.clear();
            elem.text = None;
            hm.entry(code).or_default().push(elem);
        }
        let mut errors = HashMap::new();
        if protected {
            errors.insert(
                StatusCode::FORBIDDEN,
                Element::new2("D:cannot-modify-protected-property"),
            );
        }

        let mut pw = PropWriter::new(
            &mut res,
            "propertyupdate",
            Vec::new(),
            self.fs.clone(),
            self.ls.clone(),
            prefixes,
        )?;
        pw.write_propresponse(&path, hm, errors)?;
        *res.body_mut() = pw.finish()?;
        Ok(res)
    }
}

fn element_to_davprop_full(elem: &Element) -> DavResult<DavProp> {
    let xml = xmltree_ext::element_to_bytes(elem)?;
    Ok(DavProp {
        name: elem.name.clone(),
        prefix: elem.prefix.clone(),
        namespace: elem.namespace.clone(),
        xml: Some(xml),
    })
}

fn element_to_davprop(elem: &Element) -> DavProp {
    DavProp {
        name: elem.name.clone(),
        prefix: elem.prefix.clone(),
        namespace: elem.namespace.clone(),
        xml: None,
    }
}

fn davprop_to_element(prop: DavProp) -> Element {
    if let Some(xml) = prop.xml {
        if let Ok(elem) = Element::parse2(Cursor::new(xml)) {
            return elem;
        }
    }
    let mut elem = Element::new(&prop.name);
    elem.prefix = prop.prefix;
    elem.namespace = prop.namespace;
    elem
}
