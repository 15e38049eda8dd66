//! End-to-end tests: full requests through DavHandler against the
//! in-memory backends.
use davkit::{Body, DavHandler, MemFs, MemLs};
use futures_util::StreamExt;
use http::{HeaderMap, StatusCode};

fn handler() -> DavHandler {
    DavHandler::builder()
        .filesystem(MemFs::new())
        .locksystem(MemLs::new())
        .build()
}

async fn request(
    dav: &DavHandler,
    principal: &str,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = http::Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder.body(Body::from(body.to_string())).unwrap();
    let res = dav
        .handle_with(req, None, Some(principal.to_string()))
        .await;
    let (parts, mut body) = res.into_parts();
    let mut data = Vec::new();
    while let Some(chunk) = body.next().await {
        data.extend_from_slice(&chunk.unwrap());
    }
    (parts.status, parts.headers, data)
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).to_string()
}

fn lock_token(headers: &HeaderMap) -> String {
    let t = headers.get("lock-token").unwrap().to_str().unwrap();
    t.trim_start_matches('<').trim_end_matches('>').to_string()
}

const LOCKINFO_EXCLUSIVE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:lockinfo xmlns:D="DAV:">
  <D:lockscope><D:exclusive/></D:lockscope>
  <D:locktype><D:write/></D:locktype>
  <D:owner><D:href>test-suite</D:href></D:owner>
</D:lockinfo>"#;

const LOCKINFO_SHARED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:lockinfo xmlns:D="DAV:">
  <D:lockscope><D:shared/></D:lockscope>
  <D:locktype><D:write/></D:locktype>
</D:lockinfo>"#;

#[tokio::test]
async fn options_advertises_dav_class_2() {
    let dav = handler();
    let (status, headers, _) = request(&dav, "alice", "OPTIONS", "/", &[], "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("dav").unwrap(), "1, 2");
    assert_eq!(headers.get("ms-author-via").unwrap(), "DAV");
    let allow = headers.get("allow").unwrap().to_str().unwrap();
    assert!(allow.contains("PROPFIND"));
    assert!(allow.contains("LOCK"));
}

#[tokio::test]
async fn propfind_depth_zero_allprop_on_collection() {
    let dav = handler();
    let (status, _, _) = request(&dav, "alice", "MKCOL", "/c/", &[], "").await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _, body) =
        request(&dav, "alice", "PROPFIND", "/c/", &[("Depth", "0")], "").await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    let body = text(&body);
    assert_eq!(body.matches("<D:response>").count(), 1);
    assert!(body.contains("<D:href>/c/</D:href>"));
    assert!(body.contains("<D:collection"));
    assert!(body.contains("<D:resourcetype>"));
    assert!(body.contains("HTTP/1.1 200 OK"));
}

#[tokio::test]
async fn propfind_depth_one_lists_children() {
    let dav = handler();
    request(&dav, "alice", "MKCOL", "/c/", &[], "").await;
    request(&dav, "alice", "PUT", "/c/x", &[], "hi").await;

    let (status, _, body) =
        request(&dav, "alice", "PROPFIND", "/c/", &[("Depth", "1")], "").await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    let body = text(&body);
    assert_eq!(body.matches("<D:response>").count(), 2);
    assert!(body.contains("<D:href>/c/x</D:href>"));
    assert!(body.contains("<D:getcontentlength>2</D:getcontentlength>"));
}

#[tokio::test]
async fn propfind_prop_reports_missing_as_404() {
    let dav = handler();
    request(&dav, "alice", "PUT", "/f", &[], "x").await;
    let body = r#"<?xml version="1.0"?>
        <D:propfind xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:prop><D:getetag/><Z:author/></D:prop>
        </D:propfind>"#;
    let (status, _, res) = request(
        &dav,
        "alice",
        "PROPFIND",
        "/f",
        &[("Depth", "0"), ("Content-Type", "application/xml")],
        body,
    )
    .await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    let res = text(&res);
    assert!(res.contains("HTTP/1.1 200 OK"));
    assert!(res.contains("HTTP/1.1 404 Not Found"));
    assert!(res.contains("Z:author"));
    assert!(res.contains("xmlns:Z=\"urn:example\""));
}

#[tokio::test]
async fn lock_then_put_without_token_is_refused() {
    let dav = handler();
    request(&dav, "alice", "PUT", "/f", &[], "v1").await;

    let (status, headers, body) = request(
        &dav,
        "alice",
        "LOCK",
        "/f",
        &[("Depth", "0"), ("Content-Type", "application/xml")],
        LOCKINFO_EXCLUSIVE,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let token = lock_token(&headers);
    assert!(token.starts_with("urn:uuid:"));
    let body = text(&body);
    assert!(body.contains("<D:lockdiscovery>"));
    assert!(body.contains("<D:exclusive"));

    // same principal, but no token submitted.
    let (status, _, _) = request(&dav, "alice", "PUT", "/f", &[], "v2").await;
    assert_eq!(status, StatusCode::LOCKED);

    let if_header = format!("(<{token}>)");
    let (status, _, _) =
        request(&dav, "alice", "PUT", "/f", &[("If", &if_header)], "v2").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, _, body) = request(&dav, "alice", "GET", "/f", &[("If", &if_header)], "").await;
    assert_eq!(text(&body), "v2");
}

#[tokio::test]
async fn lock_contention() {
    let dav = handler();
    request(&dav, "alice", "PUT", "/f", &[], "x").await;
    let (status, _, _) = request(
        &dav,
        "alice",
        "LOCK",
        "/f",
        &[("Content-Type", "application/xml")],
        LOCKINFO_EXCLUSIVE,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // bob, exclusive: refused with the conflicting lock enumerated.
    let (status, _, body) = request(
        &dav,
        "bob",
        "LOCK",
        "/f",
        &[("Content-Type", "application/xml")],
        LOCKINFO_EXCLUSIVE,
    )
    .await;
    assert_eq!(status, StatusCode::LOCKED);
    let body = text(&body);
    assert!(body.contains("<D:no-conflicting-lock>"));
    assert!(body.contains("<D:href>/f</D:href>"));

    // bob, shared against an exclusive holder: flat conflict.
    let (status, _, _) = request(
        &dav,
        "bob",
        "LOCK",
        "/f",
        &[("Content-Type", "application/xml")],
        LOCKINFO_SHARED,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // two shared locks coexist.
    request(&dav, "alice", "PUT", "/g", &[], "x").await;
    let (status, _, _) = request(
        &dav,
        "alice",
        "LOCK",
        "/g",
        &[("Content-Type", "application/xml")],
        LOCKINFO_SHARED,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = request(
        &dav,
        "bob",
        "LOCK",
        "/g",
        &[("Content-Type", "application/xml")],
        LOCKINFO_SHARED,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn lock_refresh_and_unlock() {
    let dav = handler();
    request(&dav, "alice", "PUT", "/f", &[], "x").await;
    let (_, headers, _) = request(
        &dav,
        "alice",
        "LOCK",
        "/f",
        &[("Content-Type", "application/xml")],
        LOCKINFO_EXCLUSIVE,
    )
    .await;
    let token = lock_token(&headers);

    // refresh: empty body, token in If.
    let if_header = format!("(<{token}>)");
    let (status, headers, _) = request(
        &dav,
        "alice",
        "LOCK",
        "/f",
        &[("If", &if_header), ("Timeout", "Second-600")],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lock_token(&headers), token);

    // the wrong principal cannot unlock.
    let coded = format!("<{token}>");
    let (status, _, _) =
        request(&dav, "bob", "UNLOCK", "/f", &[("Lock-Token", &coded)], "").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) =
        request(&dav, "alice", "UNLOCK", "/f", &[("Lock-Token", &coded)], "").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // lock gone: plain PUT works again.
    let (status, _, _) = request(&dav, "bob", "PUT", "/f", &[], "v2").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn lock_null_resource_lifecycle() {
    let dav = handler();

    let (status, headers, _) = request(
        &dav,
        "alice",
        "LOCK",
        "/pending",
        &[("Content-Type", "application/xml")],
        LOCKINFO_EXCLUSIVE,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let token = lock_token(&headers);

    // visible to PROPFIND.
    let (status, _, _) =
        request(&dav, "alice", "PROPFIND", "/pending", &[("Depth", "0")], "").await;
    assert_eq!(status, StatusCode::MULTI_STATUS);

    // unlocking the never-written resource removes it again.
    let coded = format!("<{token}>");
    let (status, _, _) = request(
        &dav,
        "alice",
        "UNLOCK",
        "/pending",
        &[("Lock-Token", &coded)],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) =
        request(&dav, "alice", "PROPFIND", "/pending", &[("Depth", "0")], "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn lock_null_becomes_real_on_put() {
    let dav = handler();
    let (status, headers, _) = request(
        &dav,
        "alice",
        "LOCK",
        "/pending",
        &[("Content-Type", "application/xml")],
        LOCKINFO_EXCLUSIVE,
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let token = lock_token(&headers);

    let if_header = format!("(<{token}>)");
    let (status, _, _) = request(
        &dav,
        "alice",
        "PUT",
        "/pending",
        &[("If", &if_header)],
        "content",
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // now a normal locked resource: unlock leaves it in place.
    let coded = format!("<{token}>");
    request(&dav, "alice", "UNLOCK", "/pending", &[("Lock-Token", &coded)], "").await;
    let (status, _, body) = request(&dav, "alice", "GET", "/pending", &[], "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text(&body), "content");
}

#[tokio::test]
async fn copy_with_overwrite_false_onto_existing() {
    let dav = handler();
    request(&dav, "alice", "PUT", "/a", &[], "source").await;
    request(&dav, "alice", "PUT", "/b", &[], "target").await;

    let (status, _, _) = request(
        &dav,
        "alice",
        "COPY",
        "/a",
        &[("Destination", "/b"), ("Overwrite", "F")],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    let (_, _, body) = request(&dav, "alice", "GET", "/b", &[], "").await;
    assert_eq!(text(&body), "target");

    // with the default Overwrite: T the copy happens.
    let (status, _, _) =
        request(&dav, "alice", "COPY", "/a", &[("Destination", "/b")], "").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, _, body) = request(&dav, "alice", "GET", "/b", &[], "").await;
    assert_eq!(text(&body), "source");
}

#[tokio::test]
async fn copy_into_own_subtree_is_forbidden() {
    let dav = handler();
    request(&dav, "alice", "MKCOL", "/c/", &[], "").await;
    let (status, _, _) = request(
        &dav,
        "alice",
        "COPY",
        "/c/",
        &[("Destination", "/c/sub")],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn move_roundtrip_restores_tree() {
    let dav = handler();
    request(&dav, "alice", "MKCOL", "/m/", &[], "").await;
    request(&dav, "alice", "PUT", "/m/f", &[], "data").await;

    let (status, _, _) =
        request(&dav, "alice", "MOVE", "/m/", &[("Destination", "/n/")], "").await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _, _) = request(&dav, "alice", "GET", "/m/f", &[], "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) =
        request(&dav, "alice", "MOVE", "/n/", &[("Destination", "/m/")], "").await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _, body) = request(&dav, "alice", "GET", "/m/f", &[], "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text(&body), "data");
}

#[tokio::test]
async fn delete_partial_failure_reports_multistatus() {
    let dav = handler();
    request(&dav, "alice", "MKCOL", "/c/", &[], "").await;
    request(&dav, "alice", "PUT", "/c/x", &[], "x").await;
    request(&dav, "alice", "PUT", "/c/y", &[], "y").await;

    // bob holds /c/y.
    let (status, _, _) = request(
        &dav,
        "bob",
        "LOCK",
        "/c/y",
        &[("Content-Type", "application/xml")],
        LOCKINFO_EXCLUSIVE,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = request(&dav, "alice", "DELETE", "/c/", &[], "").await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    let body = text(&body);
    assert!(body.contains("<D:href>/c/y</D:href>"));
    assert!(body.contains("HTTP/1.1 423 Locked"));
    assert!(body.contains("<D:href>/c/</D:href>"));
    assert!(body.contains("HTTP/1.1 424 Failed Dependency"));

    // the unlocked sibling is gone, the rest is still there.
    let (status, _, _) = request(&dav, "alice", "GET", "/c/x", &[], "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _, _) = request(&dav, "alice", "GET", "/c/y", &[], "").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn delete_single_resource_returns_204() {
    let dav = handler();
    request(&dav, "alice", "PUT", "/f", &[], "x").await;
    let (status, _, _) = request(&dav, "alice", "DELETE", "/f", &[], "").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = request(&dav, "alice", "DELETE", "/f", &[], "").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn proppatch_is_atomic() {
    let dav = handler();
    request(&dav, "alice", "PUT", "/f", &[], "x").await;

    // one dead property and one protected live property.
    let body = r#"<?xml version="1.0"?>
        <D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:set><D:prop><Z:a>1</Z:a></D:prop></D:set>
          <D:set><D:prop><D:getetag>forged</D:getetag></D:prop></D:set>
        </D:propertyupdate>"#;
    let (status, _, res) = request(
        &dav,
        "alice",
        "PROPPATCH",
        "/f",
        &[("Content-Type", "application/xml")],
        body,
    )
    .await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    let res = text(&res);
    assert!(res.contains("HTTP/1.1 403 Forbidden"));
    assert!(res.contains("HTTP/1.1 424 Failed Dependency"));
    assert!(res.contains("cannot-modify-protected-property"));

    // nothing persisted.
    let query = r#"<?xml version="1.0"?>
        <D:propfind xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:prop><Z:a/></D:prop>
        </D:propfind>"#;
    let (_, _, res) = request(
        &dav,
        "alice",
        "PROPFIND",
        "/f",
        &[("Depth", "0"), ("Content-Type", "application/xml")],
        query,
    )
    .await;
    let res = text(&res);
    assert!(res.contains("HTTP/1.1 404 Not Found"));
}

#[tokio::test]
async fn proppatch_set_then_read_back() {
    let dav = handler();
    request(&dav, "alice", "PUT", "/f", &[], "x").await;

    let body = r#"<?xml version="1.0"?>
        <D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:set><D:prop><Z:author>ferris</Z:author></D:prop></D:set>
        </D:propertyupdate>"#;
    let (status, _, res) = request(
        &dav,
        "alice",
        "PROPPATCH",
        "/f",
        &[("Content-Type", "application/xml")],
        body,
    )
    .await;
    assert_eq!(status, StatusCode::MULTI_STATUS);
    assert!(text(&res).contains("HTTP/1.1 200 OK"));

    let query = r#"<?xml version="1.0"?>
        <D:propfind xmlns:D="DAV:" xmlns:Z="urn:example">
          <D:prop><Z:author/></D:prop>
        </D:propfind>"#;
    let (_, _, res) = request(
        &dav,
        "alice",
        "PROPFIND",
        "/f",
        &[("Depth", "0"), ("Content-Type", "application/xml")],
        query,
    )
    .await;
    let res = text(&res);
    assert!(res.contains("HTTP/1.1 200 OK"));
    assert!(res.contains("ferris"));
}

#[tokio::test]
async fn mkcol_statuses() {
    let dav = handler();
    // missing parent.
    let (status, _, _) = request(&dav, "alice", "MKCOL", "/x/y/", &[], "").await;
    assert_eq!(status, StatusCode::CONFLICT);
    // already mapped.
    let (status, _, _) = request(&dav, "alice", "MKCOL", "/", &[], "").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    // a body is not acceptable.
    let (status, _, _) = request(&dav, "alice", "MKCOL", "/c/", &[], "stuff").await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    let (status, _, _) = request(&dav, "alice", "MKCOL", "/c/", &[], "").await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn put_without_parent_conflicts() {
    let dav = handler();
    let (status, _, _) = request(&dav, "alice", "PUT", "/nodir/f", &[], "x").await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn get_headers_and_ranges() {
    let dav = handler();
    request(&dav, "alice", "PUT", "/f.txt", &[], "hello world").await;

    let (status, headers, body) = request(&dav, "alice", "GET", "/f.txt", &[], "").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text(&body), "hello world");
    assert!(headers.get("etag").is_some());
    assert!(headers.get("last-modified").is_some());
    assert!(headers
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/plain"));

    let (status, headers, body) = request(
        &dav,
        "alice",
        "GET",
        "/f.txt",
        &[("Range", "bytes=0-4")],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(text(&body), "hello");
    assert_eq!(
        headers.get("content-range").unwrap().to_str().unwrap(),
        "bytes 0-4/11"
    );

    let (status, _, body) = request(&dav, "alice", "HEAD", "/f.txt", &[], "").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn get_conditionals() {
    let dav = handler();
    request(&dav, "alice", "PUT", "/f", &[], "x").await;
    let (_, headers, _) = request(&dav, "alice", "GET", "/f", &[], "").await;
    let etag = headers.get("etag").unwrap().to_str().unwrap().to_string();

    let (status, _, _) = request(
        &dav,
        "alice",
        "GET",
        "/f",
        &[("If-None-Match", &etag)],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);

    let (status, _, _) = request(
        &dav,
        "alice",
        "PUT",
        "/f",
        &[("If-Match", "\"someone-elses-etag\"")],
        "y",
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn response_compression_negotiated() {
    let dav = handler();
    let content = "squeeze me ".repeat(200);
    request(&dav, "alice", "PUT", "/big", &[], &content).await;

    let (status, headers, body) = request(
        &dav,
        "alice",
        "GET",
        "/big",
        &[("Accept-Encoding", "gzip, br;q=0.5")],
        "",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("content-encoding").unwrap(), "gzip");
    assert!(headers
        .get("vary")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("Accept-Encoding"));
    // gzip magic, and actually smaller.
    assert_eq!(&body[..2], &[0x1f, 0x8b]);
    assert!(body.len() < content.len());

    // no accept-encoding: identity, no content-encoding header.
    let (_, headers, body) = request(&dav, "alice", "GET", "/big", &[], "").await;
    assert!(headers.get("content-encoding").is_none());
    assert_eq!(text(&body), content);
}

#[tokio::test]
async fn unknown_content_encoding_is_415() {
    let dav = handler();
    let (status, _, _) = request(
        &dav,
        "alice",
        "PUT",
        "/f",
        &[("Content-Encoding", "compress")],
        "x",
    )
    .await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn depth_zero_parent_lock_allows_child_body_writes() {
    let dav = handler();
    request(&dav, "alice", "MKCOL", "/c/", &[], "").await;
    request(&dav, "alice", "PUT", "/c/f", &[], "v1").await;

    // alice locks the collection, depth 0.
    let (status, _, _) = request(
        &dav,
        "alice",
        "LOCK",
        "/c/",
        &[("Depth", "0"), ("Content-Type", "application/xml")],
        LOCKINFO_EXCLUSIVE,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // bob can replace the body of an existing child...
    let (status, _, _) = request(&dav, "bob", "PUT", "/c/f", &[], "v2").await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    // ...but cannot remove the mapping.
    let (status, _, _) = request(&dav, "bob", "DELETE", "/c/f", &[], "").await;
    assert_eq!(status, StatusCode::LOCKED);
}
