//! Contains the structs and traits that define a filesystem backend.
//!
//! The handler performs no storage I/O of its own: resources, byte
//! streams and dead properties all live behind [`DavFileSystem`]. You
//! only need to implement the subset of methods that the verbs you
//! allow will hit; everything else has a "not implemented" default.
use std::fmt::Debug;
use std::future::Future;
use std::io::SeekFrom;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes};
use futures_util::future::{ready, FutureExt};
use futures_util::stream::Stream;
use http::StatusCode;

use crate::davpath::DavPath;
use crate::util::DavMethod;

pub mod memfs;

/// Errors generated by a filesystem implementation.
///
/// These get mapped one-on-one to HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotImplemented,
    GeneralFailure,
    Exists,
    NotFound,
    Forbidden,
    InsufficientStorage,
    LoopDetected,
    PathTooLong,
    TooLarge,
    IsRemote,
}

pub type FsResult<T> = Result<T, FsError>;

/// Future returned by almost all of the backend methods.
pub type FsFuture<'a, T> = Pin<Box<dyn Future<Output = FsResult<T>> + Send + 'a>>;

/// Convenience alias for a boxed stream.
pub type FsStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Options for `open()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// open for reading.
    pub read: bool,
    /// open for writing.
    pub write: bool,
    /// open in write-append mode.
    pub append: bool,
    /// truncate file first when writing.
    pub truncate: bool,
    /// create file if it doesn't exist.
    pub create: bool,
    /// must create new file, fail if it already exists.
    pub create_new: bool,
}

impl OpenOptions {
    pub(crate) fn read() -> OpenOptions {
        OpenOptions {
            read: true,
            ..Default::default()
        }
    }

    pub(crate) fn write() -> OpenOptions {
        OpenOptions {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }
}

/// A dead property.
///
/// `xml` is the serialized element, the value as the client sent it.
#[derive(Debug, Clone)]
pub struct DavProp {
    /// Local name.
    pub name: String,
    /// Namespace prefix the client used, kept for stable responses.
    pub prefix: Option<String>,
    /// Namespace URI.
    pub namespace: Option<String>,
    /// Serialized value, None when only the name matters.
    pub xml: Option<Vec<u8>>,
}

impl DavProp {
    /// Key under which the property is stored: namespace plus local name.
    pub fn key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

/// The trait that defines a filesystem backend.
pub trait DavFileSystem: Send + Sync {
    /// Open the file at the path.
    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<'a, Box<dyn DavFile>>;

    /// Perform read_dir.
    fn read_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>>;

    /// Return the metadata of a file or directory.
    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>>;

    /// Create a directory.
    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()>;

    /// Remove a directory. It must be empty.
    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()>;

    /// Remove a file.
    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()>;

    /// Rename a file or directory. Source and destination must be in
    /// this filesystem; used by MOVE when the whole subtree moves.
    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()>;

    /// Copy a single file, dead properties included.
    fn copy<'a>(&'a self, _from: &'a DavPath, _to: &'a DavPath) -> FsFuture<'a, ()> {
        notimplemented()
    }

    /// May the principal perform the method on the path. The handler
    /// asks before dispatching; the default allows everything, real
    /// access control sits with the backend.
    fn is_authorized<'a>(
        &'a self,
        _path: &'a DavPath,
        _method: DavMethod,
        _principal: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        ready(true).boxed()
    }

    /// Does this filesystem support dead properties.
    fn have_props<'a>(&'a self, _path: &'a DavPath) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        ready(false).boxed()
    }

    /// Apply a set of property set/remove patches in order.
    ///
    /// `patch` entries are `(set, prop)`; `set == false` removes. The
    /// whole patch must apply atomically: on any failure no change may
    /// persist. The result reports one status per input property.
    fn patch_props<'a>(
        &'a self,
        _path: &'a DavPath,
        _patch: Vec<(bool, DavProp)>,
    ) -> FsFuture<'a, Vec<(StatusCode, DavProp)>> {
        notimplemented()
    }

    /// List all dead properties, with values if `do_content` is set.
    fn get_props<'a>(&'a self, _path: &'a DavPath, _do_content: bool) -> FsFuture<'a, Vec<DavProp>> {
        notimplemented()
    }

    /// Get one dead property value.
    fn get_prop<'a>(&'a self, _path: &'a DavPath, _prop: DavProp) -> FsFuture<'a, Vec<u8>> {
        notimplemented()
    }
}

fn notimplemented<'a, T: Send + 'a>() -> FsFuture<'a, T> {
    ready(Err(FsError::NotImplemented)).boxed()
}

/// One directory entry, from `read_dir`.
pub trait DavDirEntry: Send + Sync {
    /// Name of the entry.
    fn name(&self) -> String;

    /// Metadata of the entry.
    fn metadata(&self) -> FsFuture<Box<dyn DavMetaData>>;
}

/// An open file handle.
pub trait DavFile: Debug + Send + Sync {
    /// Metadata of the file, as it is right now.
    fn metadata(&mut self) -> FsFuture<Box<dyn DavMetaData>>;

    /// Write the whole buffer at the current position.
    fn write_buf(&mut self, buf: Box<dyn Buf + Send>) -> FsFuture<()>;

    /// Write bytes at the current position.
    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<()>;

    /// Read up to `count` bytes. An empty result means end of file.
    fn read_bytes(&mut self, count: usize) -> FsFuture<Bytes>;

    /// Seek. Backends that cannot seek return `NotImplemented` and GET
    /// serves full bodies instead of ranges.
    fn seek(&mut self, pos: SeekFrom) -> FsFuture<u64>;

    /// Flush and commit. PUT calls this once the whole body arrived.
    ///
    /// Replacement must be atomic: until `flush` returns Ok, readers
    /// see the previous content, and a write handle dropped without a
    /// flush (timeout, transport error) must leave it intact. Stage
    /// into a scratch buffer or a temporary name and swap here.
    fn flush(&mut self) -> FsFuture<()>;
}

/// File or directory metadata.
pub trait DavMetaData: Debug + Send + Sync {
    fn len(&self) -> u64;
    fn modified(&self) -> FsResult<SystemTime>;
    fn is_dir(&self) -> bool;

    /// ETag, derived from length and mtime unless the backend has a
    /// better one. Returned without surrounding quotes.
    fn etag(&self) -> Option<String> {
        if let Ok(t) = self.modified() {
            if let Ok(t) = t.duration_since(UNIX_EPOCH) {
                if self.is_file() {
                    return Some(format!("{:x}-{:x}", self.len(), t.as_micros()));
                }
                return Some(format!("{:x}", t.as_micros()));
            }
        }
        None
    }

    fn is_file(&self) -> bool {
        !self.is_dir()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Creation time. Not all backends know it.
    fn created(&self) -> FsResult<SystemTime> {
        Err(FsError::NotImplemented)
    }
}
