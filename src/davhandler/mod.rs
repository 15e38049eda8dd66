//
// This module contains the main entry point of the library,
// DavHandler.
//
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use futures_util::stream::Stream;
use headers::HeaderMapExt;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;

use crate::body::{Body, RequestBody, StreamBody};
use crate::davheaders;
use crate::davpath::DavPath;
use crate::encoding;
use crate::errors::DavError;
use crate::fs::{DavFileSystem, DavMetaData};
use crate::ls::DavLockSystem;
use crate::util::{dav_method, dav_xml_error, DavMethod, DavMethodSet};
use crate::DavResult;

pub mod handle_copymove;
pub mod handle_delete;
pub mod handle_gethead;
use handle_gethead::READ_BUF_SIZE;
pub mod handle_lock;
pub mod handle_mkcol;
pub mod handle_options;
pub mod handle_props;
pub mod handle_put;

// Pre-read request bodies (PROPFIND etc) are capped; a PUT body is not.
const MAX_XML_BODY: usize = 65536;

// A verb that takes an XML body only takes XML, in a charset we read.
fn check_xml_content_type(req: &Request<()>) -> DavResult<()> {
    let Some(value) = req.headers().get("content-type") else {
        return Ok(());
    };
    let ct = value.to_str().map_err(|_| DavError::UnsupportedMediaType)?;
    let mut parts = ct.split(';');
    let mime = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    if mime != "application/xml" && mime != "text/xml" {
        return Err(DavError::UnsupportedMediaType);
    }
    for p in parts {
        if let Some(charset) = p.trim().strip_prefix("charset=") {
            let charset = charset.trim_matches('"').to_ascii_lowercase();
            if charset != "utf-8" && charset != "us-ascii" {
                return Err(DavError::UnsupportedMediaType);
            }
        }
    }
    Ok(())
}

/// Configuration of the handler.
#[derive(Clone)]
pub struct DavBuilder {
    /// Prefix to be stripped off when handling request.
    prefix: String,
    /// Filesystem backend.
    fs: Option<Arc<dyn DavFileSystem>>,
    /// Locksystem backend.
    ls: Option<Arc<dyn DavLockSystem>>,
    /// Set of allowed methods (Defaults to "all methods").
    allow: DavMethodSet,
    /// Principal is webdav speak for "user", used to give locks an owner.
    principal: Option<String>,
    /// Upper bound for lock lifetimes a client may ask for.
    max_timeout: Duration,
    /// Idle timeout on request body reads.
    request_timeout: Duration,
    /// Negotiate compressed response bodies.
    compression: bool,
    /// Refuse PROPFIND with Depth: infinity (some deployments want this).
    propfind_finite_depth: bool,
    /// Read buffer size in bytes.
    read_buf_size: usize,
}

impl Default for DavBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DavBuilder {
    /// Create a new configuration builder.
    pub fn new() -> DavBuilder {
        Self {
            prefix: String::new(),
            fs: None,
            ls: None,
            allow: DavMethodSet::all(),
            principal: None,
            max_timeout: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(30),
            compression: true,
            propfind_finite_depth: false,
            read_buf_size: READ_BUF_SIZE,
        }
    }

    /// Use the configuration that was built to generate a DavHandler.
    ///
    /// Panics when no filesystem was configured.
    pub fn build(self) -> DavHandler {
        self.into()
    }

    /// Prefix to be stripped off before translating the rest of
    /// the request path to a filesystem path.
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the filesystem backend to use.
    pub fn filesystem(mut self, fs: Arc<dyn DavFileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    /// Set the locksystem to use.
    pub fn locksystem(mut self, ls: Arc<dyn DavLockSystem>) -> Self {
        self.ls = Some(ls);
        self
    }

    /// Which methods to allow (default is all methods).
    pub fn methods(mut self, allow: DavMethodSet) -> Self {
        self.allow = allow;
        self
    }

    /// Set the name of the "webdav principal". This will be the owner of
    /// any created locks.
    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Cap on the lock timeout clients may request (default 1 hour).
    pub fn max_lock_timeout(mut self, d: Duration) -> Self {
        self.max_timeout = d;
        self
    }

    /// Idle timeout on request body reads (default 30 seconds).
    pub fn request_timeout(mut self, d: Duration) -> Self {
        self.request_timeout = d;
        self
    }

    /// Negotiate compressed response bodies (default true).
    pub fn compression(mut self, compression: bool) -> Self {
        self.compression = compression;
        self
    }

    /// Refuse `PROPFIND` with `Depth: infinity`. Default is to allow it,
    /// as RFC4918 wants.
    pub fn propfind_finite_depth(mut self, finite: bool) -> Self {
        self.propfind_finite_depth = finite;
        self
    }

    /// Read buffer size in bytes.
    pub fn read_buf_size(mut self, size: usize) -> Self {
        self.read_buf_size = size;
        self
    }
}

/// The webdav handler struct.
///
/// The `builder` and `build` methods are used to instantiate a handler.
///
/// The `handle` and `handle_with` methods are the methods that do the
/// actual work.
#[derive(Clone)]
pub struct DavHandler {
    pub(crate) prefix: Arc<String>,
    pub(crate) fs: Arc<dyn DavFileSystem>,
    pub(crate) ls: Option<Arc<dyn DavLockSystem>>,
    pub(crate) allow: DavMethodSet,
    pub(crate) principal: Option<Arc<String>>,
    pub(crate) max_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) compression: bool,
    pub(crate) propfind_finite_depth: bool,
    pub(crate) read_buf_size: usize,
}

impl From<DavBuilder> for DavHandler {
    fn from(cfg: DavBuilder) -> Self {
        Self {
            prefix: Arc::new(cfg.prefix),
            fs: cfg.fs.expect("must configure a filesystem backend"),
            ls: cfg.ls,
            allow: cfg.allow,
            principal: cfg.principal.map(Arc::new),
            max_timeout: cfg.max_timeout,
            request_timeout: cfg.request_timeout,
            compression: cfg.compression,
            propfind_finite_depth: cfg.propfind_finite_depth,
            read_buf_size: cfg.read_buf_size,
        }
    }
}

impl DavHandler {
    /// Return a configuration builder.
    pub fn builder() -> DavBuilder {
        DavBuilder::new()
    }

    /// Handle a webdav request.
    pub async fn handle<ReqBody, ReqData, ReqError>(&self, req: Request<ReqBody>) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        self.handle_inner(req).await
    }

    /// Handle a webdav request, overriding parts of the config.
    ///
    /// For example, the `principal` can be set for this request, after
    /// the upstream layer authenticated the caller.
    pub async fn handle_with<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
        prefix: Option<String>,
        principal: Option<String>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
    {
        let mut this = self.clone();
        if let Some(prefix) = prefix {
            this.prefix = Arc::new(format!(
                "{}/{}",
                this.prefix.strip_suffix('/').unwrap_or(&this.prefix),
                prefix.strip_prefix('/').unwrap_or(&prefix)
            ));
        }
        if let Some(principal) = principal {
            this.principal = Some(Arc::new(principal));
        }
        this.handle_inner(req).await
    }

    /// Handles a request with a `Stream` body instead of a `HttpBody`.
    /// Used with webserver frameworks that have not
    /// opted to use the `http_body` crate just yet.
    #[doc(hidden)]
    pub async fn handle_stream<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: Stream<Item = Result<ReqData, ReqError>>,
    {
        let req = {
            let (parts, body) = req.into_parts();
            Request::from_parts(parts, StreamBody::new(body))
        };
        self.handle_inner(req).await
    }

    /// Handles a request with a `Stream` body instead of a `HttpBody`.
    #[doc(hidden)]
    pub async fn handle_stream_with<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
        prefix: Option<String>,
        principal: Option<String>,
    ) -> Response<Body>
    where
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
        ReqBody: Stream<Item = Result<ReqData, ReqError>>,
    {
        let req = {
            let (parts, body) = req.into_parts();
            Request::from_parts(parts, StreamBody::new(body))
        };
        self.handle_with(req, prefix, principal).await
    }
}

impl DavHandler {
    pub(crate) fn principal_str(&self) -> Option<&str> {
        self.principal.as_deref().map(|s| s.as_str())
    }

    // helper.
    pub(crate) async fn has_parent<'a>(&'a self, path: &'a DavPath) -> bool {
        let p = path.parent();
        self.fs
            .metadata(&p)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    // helper.
    pub(crate) fn path(&self, req: &Request<()>) -> DavPath {
        // This never fails (has been checked before)
        DavPath::from_uri_and_prefix(req.uri(), &self.prefix).unwrap()
    }

    // See if this is a directory and if so, if we have
    // to fixup the path by adding a slash at the end.
    pub(crate) fn fixpath(
        &self,
        res: &mut Response<Body>,
        path: &mut DavPath,
        meta: Box<dyn DavMetaData>,
    ) -> Box<dyn DavMetaData> {
        if meta.is_dir() && !path.is_collection() {
            path.add_slash();
            let newloc = path.as_url_string_with_prefix();
            res.headers_mut()
                .typed_insert(davheaders::ContentLocation(newloc));
        }
        meta
    }

    // internal dispatcher.
    async fn handle_inner<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> Response<Body>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let is_ms = req
            .headers()
            .get("user-agent")
            .and_then(|s| s.to_str().ok())
            .map(|s| s.contains("Microsoft"))
            .unwrap_or(false);

        // a request we cannot answer in an acceptable coding is fatal.
        let result = match encoding::accepted_coding(req.headers()) {
            Ok(coding) => self.handle2(req).await.map(|res| (res, coding)),
            Err(e) => Err(e),
        };

        // Turn any DavError results into a HTTP error response.
        match result {
            Ok((mut resp, coding)) => {
                debug!("== END REQUEST result OK");
                encoding::encode_response(&mut resp, coding, self.compression);
                resp
            }
            Err(err) => {
                debug!("== END REQUEST result {:?}", err);
                let mut resp = Response::builder();
                if is_ms && err.statuscode() == StatusCode::NOT_FOUND {
                    // This is an attempt to convince Windows to not
                    // cache a 404 NOT_FOUND for 30-60 seconds.
                    //
                    // That is a problem since windows caches the NOT_FOUND in a
                    // case-insensitive way. So if "www" does not exist, but "WWW" does,
                    // and you do a "dir www" and then a "dir WWW" the second one
                    // will fail.
                    //
                    // Ofcourse the below is not sufficient. Fixes welcome.
                    resp = resp
                        .header("Cache-Control", "no-store, no-cache, must-revalidate")
                        .header("Progma", "no-cache")
                        .header("Expires", "0")
                        .header("Vary", "*");
                }
                resp = resp.status(err.statuscode());
                if err.must_close() {
                    resp = resp.header("connection", "close");
                }
                // add a precondition body where RFC4918 defines one.
                let body = match err.statuscode() {
                    StatusCode::LOCKED => Some(dav_xml_error("<D:lock-token-submitted/>")),
                    _ => None,
                };
                match body {
                    Some(body) => resp
                        .header("content-type", "application/xml; charset=utf-8")
                        .body(body)
                        .unwrap(),
                    None => resp
                        .header("Content-Length", "0")
                        .body(Body::empty())
                        .unwrap(),
                }
            }
        }
    }

    // internal dispatcher part 2.
    async fn handle2<ReqBody, ReqData, ReqError>(
        &self,
        req: Request<ReqBody>,
    ) -> DavResult<Response<Body>>
    where
        ReqBody: HttpBody<Data = ReqData, Error = ReqError>,
        ReqData: Buf + Send + 'static,
        ReqError: StdError + Send + Sync + 'static,
    {
        let (req, body) = {
            let (parts, body) = req.into_parts();
            (Request::from_parts(parts, ()), body)
        };

        // debug when running the webdav litmus tests.
        if log_enabled!(log::Level::Debug) {
            if let Some(t) = req.headers().typed_get::<davheaders::XLitmus>() {
                debug!("X-Litmus: {:?}", t);
            }
        }

        // translate HTTP method to Webdav method.
        let method = match dav_method(req.method()) {
            Ok(m) => m,
            Err(e) => {
                debug!("refusing method {} request {}", req.method(), req.uri());
                return Err(e);
            }
        };

        // see if method is allowed.
        if !self.allow.contains_method(method) {
            debug!(
                "method {} not allowed on request {}",
                req.method(),
                req.uri()
            );
            return Err(DavError::StatusClose(StatusCode::METHOD_NOT_ALLOWED));
        }

        // the hosting HTTP layer must have decoded the transfer coding
        // already; anything else we cannot re-frame.
        if let Some(te) = req.headers().get("transfer-encoding") {
            match te.to_str() {
                Ok(te)
                    if te
                        .split(',')
                        .all(|t| {
                            let t = t.trim();
                            t.eq_ignore_ascii_case("chunked")
                                || t.eq_ignore_ascii_case("identity")
                        }) => {}
                _ => return Err(DavError::StatusClose(StatusCode::NOT_IMPLEMENTED)),
            }
        }

        // make sure the request path is valid.
        let path = DavPath::from_uri_and_prefix(req.uri(), &self.prefix)?;

        // the backend authorizes the principal for this method first.
        if !self
            .fs
            .is_authorized(&path, method, self.principal_str())
            .await
        {
            return Err(DavError::Unauthorized);
        }

        // the coding the request body arrives in.
        let coding = encoding::request_coding(req.headers())?;

        // PUT is the only handler that reads the body itself. All the
        // other handlers either expect no body, or a pre-read Vec<u8>.
        let mut body = RequestBody::new(body, self.request_timeout);
        let (body_strm, body_data) = match method {
            DavMethod::Put => (Some(body), Vec::new()),
            _ => {
                let data = body.read_to_end(MAX_XML_BODY).await?;
                (None, encoding::decode_bytes(data, coding).await?)
            }
        };

        // Not all methods accept a body.
        match method {
            DavMethod::Put => {}
            DavMethod::PropFind | DavMethod::PropPatch | DavMethod::Lock => {
                if !body_data.is_empty() {
                    check_xml_content_type(&req)?;
                }
            }
            _ => {
                if !body_data.is_empty() {
                    return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE.into());
                }
            }
        }

        debug!("== START REQUEST {:?} {}", method, path);

        match method {
            DavMethod::Options => self.handle_options(&req).await,
            DavMethod::PropFind => self.handle_propfind(&req, &body_data).await,
            DavMethod::PropPatch => self.handle_proppatch(&req, &body_data).await,
            DavMethod::MkCol => self.handle_mkcol(&req).await,
            DavMethod::Delete => self.handle_delete(&req).await,
            DavMethod::Lock => self.handle_lock(&req, &body_data).await,
            DavMethod::Unlock => self.handle_unlock(&req).await,
            DavMethod::Head | DavMethod::Get => self.handle_get(&req).await,
            DavMethod::Copy | DavMethod::Move => self.handle_copymove(&req, method).await,
            DavMethod::Put => self.handle_put(&req, body_strm.unwrap(), coding).await,
        }
    }
}
