//! Ephemeral in-memory filesystem, with dead-property support.
//!
//! Mostly useful for testing, or for handing a litmus-capable backend
//! to clients that only need scratch space. All state lives behind one
//! mutex; that mutex is this backend's concurrency control.
//!
//! Writes are staged per handle and only replace the stored content on
//! `flush()`, the same stage-then-apply discipline `patch_props` uses.
//! An upload that dies halfway never leaves a truncated file behind.
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bytes::{Buf, Bytes};
use futures_util::future::{ready, FutureExt};
use futures_util::stream;
use http::StatusCode;

use crate::davpath::DavPath;
use crate::fs::*;

/// Ephemeral in-memory filesystem.
#[derive(Debug)]
pub struct MemFs {
    root: Arc<Mutex<MemFsNode>>,
}

#[derive(Debug, Clone)]
enum MemFsNode {
    Dir(MemDir),
    File(MemFile),
}

#[derive(Debug, Clone)]
struct MemDir {
    children: BTreeMap<String, MemFsNode>,
    crtime: SystemTime,
    mtime: SystemTime,
    props: HashMap<String, DavProp>,
}

#[derive(Debug, Clone)]
struct MemFile {
    data: Vec<u8>,
    crtime: SystemTime,
    mtime: SystemTime,
    props: HashMap<String, DavProp>,
}

#[derive(Debug, Clone)]
struct MemFsMeta {
    len: u64,
    is_dir: bool,
    crtime: SystemTime,
    mtime: SystemTime,
}

struct MemFsDirEntry {
    name: String,
    meta: MemFsMeta,
}

#[derive(Debug)]
struct MemFsFile {
    root: Arc<Mutex<MemFsNode>>,
    segs: Vec<String>,
    pos: usize,
    append: bool,
    // Write handles stage their bytes here and swap them into the tree
    // on flush(). A handle dropped mid-upload leaves the old content
    // untouched.
    scratch: Option<Vec<u8>>,
}

impl MemFsNode {
    fn new_dir() -> MemFsNode {
        let now = SystemTime::now();
        MemFsNode::Dir(MemDir {
            children: BTreeMap::new(),
            crtime: now,
            mtime: now,
            props: HashMap::new(),
        })
    }

    fn new_file(data: Vec<u8>) -> MemFsNode {
        let now = SystemTime::now();
        MemFsNode::File(MemFile {
            data,
            crtime: now,
            mtime: now,
            props: HashMap::new(),
        })
    }

    fn is_dir(&self) -> bool {
        matches!(self, MemFsNode::Dir(_))
    }

    fn meta(&self) -> MemFsMeta {
        match self {
            MemFsNode::Dir(d) => MemFsMeta {
                len: 0,
                is_dir: true,
                crtime: d.crtime,
                mtime: d.mtime,
            },
            MemFsNode::File(f) => MemFsMeta {
                len: f.data.len() as u64,
                is_dir: false,
                crtime: f.crtime,
                mtime: f.mtime,
            },
        }
    }

    fn props(&self) -> &HashMap<String, DavProp> {
        match self {
            MemFsNode::Dir(d) => &d.props,
            MemFsNode::File(f) => &f.props,
        }
    }

    fn props_mut(&mut self) -> &mut HashMap<String, DavProp> {
        match self {
            MemFsNode::Dir(d) => &mut d.props,
            MemFsNode::File(f) => &mut f.props,
        }
    }

    // walk down to the node for these path segments.
    fn lookup(&self, segs: &[String]) -> FsResult<&MemFsNode> {
        let mut node = self;
        for seg in segs {
            match node {
                MemFsNode::Dir(d) => {
                    node = d.children.get(seg).ok_or(FsError::NotFound)?;
                }
                MemFsNode::File(_) => return Err(FsError::NotFound),
            }
        }
        Ok(node)
    }

    fn lookup_mut(&mut self, segs: &[String]) -> FsResult<&mut MemFsNode> {
        let mut node = self;
        for seg in segs {
            match node {
                MemFsNode::Dir(d) => {
                    node = d.children.get_mut(seg).ok_or(FsError::NotFound)?;
                }
                MemFsNode::File(_) => return Err(FsError::NotFound),
            }
        }
        Ok(node)
    }

    // the directory that contains (or would contain) the last segment.
    fn lookup_parent_mut<'a>(&'a mut self, segs: &[String]) -> FsResult<(&'a mut MemDir, String)> {
        let (name, dir_segs) = segs.split_last().ok_or(FsError::Forbidden)?;
        match self.lookup_mut(dir_segs)? {
            MemFsNode::Dir(d) => Ok((d, name.clone())),
            MemFsNode::File(_) => Err(FsError::NotFound),
        }
    }
}

fn segs_of(path: &DavPath) -> Vec<String> {
    path.segments().map(|s| s.to_string()).collect()
}

impl MemFs {
    /// Create a new in-memory filesystem, with an empty root collection.
    pub fn new() -> Arc<MemFs> {
        Arc::new(MemFs {
            root: Arc::new(Mutex::new(MemFsNode::new_dir())),
        })
    }
}

impl Default for MemFs {
    fn default() -> Self {
        MemFs {
            root: Arc::new(Mutex::new(MemFsNode::new_dir())),
        }
    }
}

impl DavFileSystem for MemFs {
    fn metadata<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, Box<dyn DavMetaData>> {
        let res = (|| {
            let root = self.root.lock().unwrap();
            let meta = root.lookup(&segs_of(path))?.meta();
            Ok(Box::new(meta) as Box<dyn DavMetaData>)
        })();
        ready(res).boxed()
    }

    fn read_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, FsStream<Box<dyn DavDirEntry>>> {
        let res = (|| {
            let root = self.root.lock().unwrap();
            match root.lookup(&segs_of(path))? {
                MemFsNode::Dir(d) => {
                    let entries: Vec<Box<dyn DavDirEntry>> = d
                        .children
                        .iter()
                        .map(|(name, node)| {
                            Box::new(MemFsDirEntry {
                                name: name.clone(),
                                meta: node.meta(),
                            }) as Box<dyn DavDirEntry>
                        })
                        .collect();
                    Ok(Box::pin(stream::iter(entries)) as FsStream<Box<dyn DavDirEntry>>)
                }
                MemFsNode::File(_) => Err(FsError::NotFound),
            }
        })();
        ready(res).boxed()
    }

    fn open<'a>(&'a self, path: &'a DavPath, options: OpenOptions) -> FsFuture<'a, Box<dyn DavFile>> {
        let res = (|| {
            let segs = segs_of(path);
            let root = self.root.lock().unwrap();
            let (name, dir_segs) = segs.split_last().ok_or(FsError::Forbidden)?;
            let dir = match root.lookup(dir_segs)? {
                MemFsNode::Dir(d) => d,
                MemFsNode::File(_) => return Err(FsError::NotFound),
            };
            let existing = match dir.children.get(name) {
                Some(MemFsNode::Dir(_)) => return Err(FsError::Forbidden),
                Some(MemFsNode::File(f)) => {
                    if options.create_new {
                        return Err(FsError::Exists);
                    }
                    Some(&f.data)
                }
                None => {
                    if !options.create && !options.create_new {
                        return Err(FsError::NotFound);
                    }
                    None
                }
            };
            // write handles stage everything; the tree changes on flush.
            let scratch = if options.write {
                if options.truncate {
                    Some(Vec::new())
                } else {
                    Some(existing.cloned().unwrap_or_default())
                }
            } else {
                None
            };
            Ok(Box::new(MemFsFile {
                root: self.root.clone(),
                segs,
                pos: 0,
                append: options.append,
                scratch,
            }) as Box<dyn DavFile>)
        })();
        ready(res).boxed()
    }

    fn create_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        let res = (|| {
            let mut root = self.root.lock().unwrap();
            let (dir, name) = root.lookup_parent_mut(&segs_of(path))?;
            if dir.children.contains_key(&name) {
                return Err(FsError::Exists);
            }
            dir.children.insert(name, MemFsNode::new_dir());
            dir.mtime = SystemTime::now();
            Ok(())
        })();
        ready(res).boxed()
    }

    fn remove_dir<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        let res = (|| {
            let mut root = self.root.lock().unwrap();
            let (dir, name) = root.lookup_parent_mut(&segs_of(path))?;
            match dir.children.get(&name) {
                Some(MemFsNode::Dir(d)) if d.children.is_empty() => {}
                Some(_) => return Err(FsError::Forbidden),
                None => return Err(FsError::NotFound),
            }
            dir.children.remove(&name);
            dir.mtime = SystemTime::now();
            Ok(())
        })();
        ready(res).boxed()
    }

    fn remove_file<'a>(&'a self, path: &'a DavPath) -> FsFuture<'a, ()> {
        let res = (|| {
            let mut root = self.root.lock().unwrap();
            let (dir, name) = root.lookup_parent_mut(&segs_of(path))?;
            match dir.children.get(&name) {
                Some(MemFsNode::File(_)) => {}
                Some(MemFsNode::Dir(_)) => return Err(FsError::Forbidden),
                None => return Err(FsError::NotFound),
            }
            dir.children.remove(&name);
            dir.mtime = SystemTime::now();
            Ok(())
        })();
        ready(res).boxed()
    }

    fn rename<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        let res = (|| {
            let mut root = self.root.lock().unwrap();
            // verify the destination parent up front so the removed
            // node can never dangle.
            if root.lookup_parent_mut(&segs_of(to)).is_err() {
                return Err(FsError::NotFound);
            }
            let (dir, name) = root.lookup_parent_mut(&segs_of(from))?;
            let node = dir.children.remove(&name).ok_or(FsError::NotFound)?;
            dir.mtime = SystemTime::now();
            let (dir, newname) = root
                .lookup_parent_mut(&segs_of(to))
                .map_err(|_| FsError::GeneralFailure)?;
            dir.children.insert(newname, node);
            dir.mtime = SystemTime::now();
            Ok(())
        })();
        ready(res).boxed()
    }

    fn copy<'a>(&'a self, from: &'a DavPath, to: &'a DavPath) -> FsFuture<'a, ()> {
        let res = (|| {
            let mut root = self.root.lock().unwrap();
            // collections are copied shallow, the handler recurses.
            let copy = match root.lookup(&segs_of(from))? {
                MemFsNode::Dir(d) => {
                    let mut d = d.clone();
                    d.children = BTreeMap::new();
                    MemFsNode::Dir(d)
                }
                MemFsNode::File(f) => MemFsNode::File(f.clone()),
            };
            let (dir, name) = root.lookup_parent_mut(&segs_of(to))?;
            dir.children.insert(name, copy);
            dir.mtime = SystemTime::now();
            Ok(())
        })();
        ready(res).boxed()
    }

    fn have_props<'a>(
        &'a self,
        _path: &'a DavPath,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + 'a>> {
        ready(true).boxed()
    }

    fn patch_props<'a>(
        &'a self,
        path: &'a DavPath,
        patch: Vec<(bool, DavProp)>,
    ) -> FsFuture<'a, Vec<(StatusCode, DavProp)>> {
        let res = (|| {
            let mut root = self.root.lock().unwrap();
            let node = root.lookup_mut(&segs_of(path))?;
            // stage first so the whole patch applies or nothing does.
            for (set, prop) in &patch {
                if *set && prop.xml.is_none() {
                    return Err(FsError::GeneralFailure);
                }
            }
            let props = node.props_mut();
            let mut res = Vec::new();
            for (set, mut prop) in patch {
                if set {
                    props.insert(prop.key(), prop.clone());
                } else {
                    props.remove(&prop.key());
                }
                prop.xml = None;
                res.push((StatusCode::OK, prop));
            }
            Ok(res)
        })();
        ready(res).boxed()
    }

    fn get_props<'a>(&'a self, path: &'a DavPath, do_content: bool) -> FsFuture<'a, Vec<DavProp>> {
        let res = (|| {
            let root = self.root.lock().unwrap();
            let node = root.lookup(&segs_of(path))?;
            let mut v: Vec<DavProp> = node
                .props()
                .values()
                .map(|p| {
                    let mut p = p.clone();
                    if !do_content {
                        p.xml = None;
                    }
                    p
                })
                .collect();
            v.sort_by(|a, b| a.key().cmp(&b.key()));
            Ok(v)
        })();
        ready(res).boxed()
    }

    fn get_prop<'a>(&'a self, path: &'a DavPath, prop: DavProp) -> FsFuture<'a, Vec<u8>> {
        let res = (|| {
            let root = self.root.lock().unwrap();
            let node = root.lookup(&segs_of(path))?;
            node.props()
                .get(&prop.key())
                .and_then(|p| p.xml.clone())
                .ok_or(FsError::NotFound)
        })();
        ready(res).boxed()
    }
}

impl DavDirEntry for MemFsDirEntry {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn metadata(&self) -> FsFuture<Box<dyn DavMetaData>> {
        let meta = self.meta.clone();
        ready(Ok(Box::new(meta) as Box<dyn DavMetaData>)).boxed()
    }
}

impl DavFile for MemFsFile {
    fn metadata(&mut self) -> FsFuture<Box<dyn DavMetaData>> {
        let res = (|| {
            if let Some(scratch) = &self.scratch {
                // still staged: describe what flush() would commit.
                let now = SystemTime::now();
                let meta = MemFsMeta {
                    len: scratch.len() as u64,
                    is_dir: false,
                    crtime: now,
                    mtime: now,
                };
                return Ok(Box::new(meta) as Box<dyn DavMetaData>);
            }
            let root = self.root.lock().unwrap();
            let meta = root.lookup(&self.segs)?.meta();
            Ok(Box::new(meta) as Box<dyn DavMetaData>)
        })();
        ready(res).boxed()
    }

    fn write_buf(&mut self, mut buf: Box<dyn Buf + Send>) -> FsFuture<()> {
        let bytes = buf.copy_to_bytes(buf.remaining());
        self.write_bytes(bytes)
    }

    fn write_bytes(&mut self, buf: Bytes) -> FsFuture<()> {
        let res = (|| {
            let Some(scratch) = self.scratch.as_mut() else {
                // read-only handle.
                return Err(FsError::Forbidden);
            };
            let pos = if self.append { scratch.len() } else { self.pos };
            let end = pos + buf.len();
            if scratch.len() < end {
                scratch.resize(end, 0);
            }
            scratch[pos..end].copy_from_slice(&buf);
            self.pos = end;
            Ok(())
        })();
        ready(res).boxed()
    }

    fn read_bytes(&mut self, count: usize) -> FsFuture<Bytes> {
        let res = (|| {
            if let Some(scratch) = &self.scratch {
                let start = self.pos.min(scratch.len());
                let end = (self.pos + count).min(scratch.len());
                self.pos = end;
                return Ok(Bytes::copy_from_slice(&scratch[start..end]));
            }
            let root = self.root.lock().unwrap();
            match root.lookup(&self.segs)? {
                MemFsNode::File(f) => {
                    let start = self.pos.min(f.data.len());
                    let end = (self.pos + count).min(f.data.len());
                    self.pos = end;
                    Ok(Bytes::copy_from_slice(&f.data[start..end]))
                }
                MemFsNode::Dir(_) => Err(FsError::Forbidden),
            }
        })();
        ready(res).boxed()
    }

    fn seek(&mut self, pos: SeekFrom) -> FsFuture<u64> {
        let res = (|| {
            let len = match &self.scratch {
                Some(scratch) => scratch.len() as i64,
                None => {
                    let root = self.root.lock().unwrap();
                    match root.lookup(&self.segs)? {
                        MemFsNode::File(f) => f.data.len() as i64,
                        MemFsNode::Dir(_) => return Err(FsError::Forbidden),
                    }
                }
            };
            let newpos = match pos {
                SeekFrom::Start(n) => n as i64,
                SeekFrom::End(n) => len + n,
                SeekFrom::Current(n) => self.pos as i64 + n,
            };
            if newpos < 0 {
                return Err(FsError::GeneralFailure);
            }
            self.pos = newpos as usize;
            Ok(newpos as u64)
        })();
        ready(res).boxed()
    }

    // Commit: the staged bytes replace the node content in one step,
    // creating the node if the open() reserved a new name.
    fn flush(&mut self) -> FsFuture<()> {
        let res = (|| {
            let Some(data) = self.scratch.take() else {
                return Ok(());
            };
            let mut root = self.root.lock().unwrap();
            let (dir, name) = root.lookup_parent_mut(&self.segs)?;
            let mut staged = Some(data);
            match dir.children.get_mut(&name) {
                Some(MemFsNode::File(f)) => {
                    f.data = staged.take().unwrap();
                    f.mtime = SystemTime::now();
                }
                Some(MemFsNode::Dir(_)) => return Err(FsError::Forbidden),
                None => {}
            }
            if let Some(data) = staged {
                dir.children.insert(name, MemFsNode::new_file(data));
                dir.mtime = SystemTime::now();
            }
            Ok(())
        })();
        ready(res).boxed()
    }
}

impl DavMetaData for MemFsMeta {
    fn len(&self) -> u64 {
        self.len
    }

    fn modified(&self) -> FsResult<SystemTime> {
        Ok(self.mtime)
    }

    fn is_dir(&self) -> bool {
        self.is_dir
    }

    fn created(&self) -> FsResult<SystemTime> {
        Ok(self.crtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DavPath {
        DavPath::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_and_stat() {
        let fs = MemFs::new();
        fs.create_dir(&p("/a/")).await.unwrap();
        let mut f = fs.open(&p("/a/f"), OpenOptions::write()).await.unwrap();
        f.write_bytes(Bytes::from_static(b"hello")).await.unwrap();
        f.flush().await.unwrap();
        let meta = fs.metadata(&p("/a/f")).await.unwrap();
        assert_eq!(meta.len(), 5);
        assert!(!meta.is_dir());
        assert!(fs.metadata(&p("/a/missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_props_patch_is_transactional() {
        let fs = MemFs::new();
        let mut f = fs.open(&p("/f"), OpenOptions::write()).await.unwrap();
        f.flush().await.unwrap();
        let prop = DavProp {
            name: "author".to_string(),
            prefix: Some("Z".to_string()),
            namespace: Some("urn:example".to_string()),
            xml: Some(b"<Z:author xmlns:Z=\"urn:example\">x</Z:author>".to_vec()),
        };
        let bad = DavProp {
            name: "bad".to_string(),
            prefix: None,
            namespace: None,
            xml: None,
        };
        // a set without a value fails the whole patch.
        assert!(fs
            .patch_props(&p("/f"), vec![(true, prop.clone()), (true, bad)])
            .await
            .is_err());
        assert!(fs.get_props(&p("/f"), false).await.unwrap().is_empty());

        fs.patch_props(&p("/f"), vec![(true, prop.clone())])
            .await
            .unwrap();
        assert_eq!(fs.get_props(&p("/f"), false).await.unwrap().len(), 1);
        assert!(fs.get_prop(&p("/f"), prop).await.is_ok());
    }

    #[tokio::test]
    async fn test_unflushed_write_rolls_back() {
        let fs = MemFs::new();
        let mut f = fs.open(&p("/f"), OpenOptions::write()).await.unwrap();
        f.write_bytes(Bytes::from_static(b"old")).await.unwrap();
        f.flush().await.unwrap();

        // a replacement that is dropped before flush changes nothing,
        // and the target stays invisible until the first commit.
        let mut f = fs.open(&p("/f"), OpenOptions::write()).await.unwrap();
        f.write_bytes(Bytes::from_static(b"partial new conte"))
            .await
            .unwrap();
        drop(f);
        let mut f = fs.open(&p("/f"), OpenOptions::read()).await.unwrap();
        assert_eq!(&f.read_bytes(16).await.unwrap()[..], b"old");

        let g = fs.open(&p("/g"), OpenOptions::write()).await.unwrap();
        drop(g);
        assert!(fs.metadata(&p("/g")).await.is_err());
    }

    #[tokio::test]
    async fn test_copy_keeps_props() {
        let fs = MemFs::new();
        let mut f = fs.open(&p("/f"), OpenOptions::write()).await.unwrap();
        f.write_bytes(Bytes::from_static(b"data")).await.unwrap();
        f.flush().await.unwrap();
        let prop = DavProp {
            name: "color".to_string(),
            prefix: Some("Z".to_string()),
            namespace: Some("urn:example".to_string()),
            xml: Some(b"<Z:color xmlns:Z=\"urn:example\">red</Z:color>".to_vec()),
        };
        fs.patch_props(&p("/f"), vec![(true, prop)]).await.unwrap();
        fs.copy(&p("/f"), &p("/g")).await.unwrap();
        assert_eq!(fs.metadata(&p("/g")).await.unwrap().len(), 4);
        assert_eq!(fs.get_props(&p("/g"), false).await.unwrap().len(), 1);
    }
}
