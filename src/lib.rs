//! ## Generic async HTTP/Webdav protocol engine
//!
//! [`Webdav`][RFC4918] (RFC4918) is defined as
//! HTTP (GET/HEAD/PUT/DELETE) plus a bunch of extension methods (PROPFIND, etc).
//! These extension methods are used to manage collections (like unix directories),
//! get information on collections (like unix `ls` or `readdir`), rename and
//! copy items, lock/unlock items, etc.
//!
//! A `handler` is a piece of code that takes a `http::Request`, processes it in some
//! way, and then generates a `http::Response`. This library is a `handler` that maps
//! the HTTP/Webdav protocol onto a storage backend you plug in. The handler owns the
//! protocol: XML request bodies, conditional headers and lock tokens,
//! Depth/Destination/Overwrite handling, multistatus responses, response-body
//! compression. The backend owns the bytes.
//!
//! ## Backend interfaces.
//!
//! The backend interfaces are similar to the ones from the Go `x/net/webdav package`:
//!
//! - the library contains a [HTTP handler][DavHandler].
//! - you supply a [filesystem][DavFileSystem] for backend storage, which can
//!   optionally implement reading/writing [DAV properties][DavProp].
//! - you can supply a [locksystem][DavLockSystem] that handles webdav locks.
//!
//! The handler works with the standard http types from the `http` and `http_body`
//! crates, so it plugs into any server framework that also speaks those types.
//! Authentication is the hosting layer's job: authenticate however you like, then
//! pass the resulting user to [`DavHandler::handle_with`] as the principal. Lock
//! ownership follows the principal.
//!
//! ## Implemented standards.
//!
//! All of the base [RFC4918] webdav specification: webdav class 1 and 2, including
//! locking, dead properties, and multistatus aggregation for the collection verbs.
//! The relevant parts of the HTTP RFCs are implemented as well: the preconditions
//! (If-Match, If-None-Match, If-Modified-Since, If-Unmodified-Since, If-Range),
//! partial transfers (Range), and content coding negotiation (gzip, deflate, br).
//!
//! RFC3744 "acl", RFC5842 "bind" and RFC3253 "versioning" are not supported.
//!
//! ## Backends.
//!
//! Included are an ephemeral in-memory filesystem ([`MemFs`]) that supports DAV
//! properties, and an in-memory locksystem ([`MemLs`]). Real deployments implement
//! [`DavFileSystem`]/[`DavLockSystem`] against their own storage.
//!
//! ## Example.
//!
//! ```no_run
//! use davkit::{Body, DavHandler, MemFs, MemLs};
//!
//! async fn serve_one(req: http::Request<Body>) -> http::Response<Body> {
//!     let dav = DavHandler::builder()
//!         .filesystem(MemFs::new())
//!         .locksystem(MemLs::new())
//!         .build();
//!     // the upstream layer authenticated the caller as "alice".
//!     dav.handle_with(req, None, Some("alice".to_string())).await
//! }
//! ```
//!
//! [RFC4918]: https://tools.ietf.org/html/rfc4918
//! [DavFileSystem]: fs/trait.DavFileSystem.html
//! [DavLockSystem]: ls/trait.DavLockSystem.html
//! [DavProp]: fs/struct.DavProp.html

#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

mod conditional;
mod davhandler;
mod davheaders;
mod encoding;
mod errors;
mod multierror;
mod util;
mod xmltree_ext;

pub mod body;
pub mod davpath;
pub mod fs;
pub mod ls;

pub(crate) use crate::errors::DavResult;

pub use crate::body::Body;
pub use crate::davhandler::{DavBuilder, DavHandler};
pub use crate::davpath::DavPath;
pub use crate::errors::DavError;
pub use crate::fs::memfs::MemFs;
pub use crate::ls::memls::MemLs;
pub use crate::util::{DavMethod, DavMethodSet};
