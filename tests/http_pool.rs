//! End-to-end pool tests against an in-process server.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use common::{Reply, serve};
use stevedore::http::{ConnectionPool, PoolManager, PoolOptions};
use stevedore::{Error, Result};

fn pool_for(port: u16, options: PoolOptions) -> ConnectionPool {
    ConnectionPool::new(&format!("http://127.0.0.1:{port}"), options).expect("pool must build")
}

#[test]
fn small_get_buffered() {
    let port = serve(|_req| Reply::ok("ok"));
    let pool = pool_for(port, PoolOptions::default());

    let resp = pool
        .request(
            "GET",
            "/",
            &[("Host".to_string(), format!("127.0.0.1:{port}"))],
            None,
        )
        .unwrap();

    assert_eq!(resp.status, 200);
    assert!(resp.successful());
    assert_eq!(resp.header("Content-Length"), Some("2"));
    assert_eq!(&resp.body[..], b"ok");
}

#[test]
fn large_body_streams_in_multiple_chunks_and_matches_buffered() {
    let body: Vec<u8> = vec![b'x'; 128 * 1024];
    let port = serve(move |_req| Reply::ok(vec![b'x'; 128 * 1024]));
    let pool = pool_for(port, PoolOptions::default());

    let buffered = pool.request("GET", "/large", &[], None).unwrap();
    assert_eq!(buffered.body.len(), 131_072);
    assert!(buffered.body.iter().all(|&b| b == b'x'));

    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut sink = |chunk: &[u8]| -> Result<()> {
        chunks.push(chunk.to_vec());
        Ok(())
    };
    let (status, _headers) = pool
        .request_streaming("GET", "/large", &[], None, &mut sink)
        .unwrap();

    assert_eq!(status, 200);
    assert!(chunks.len() >= 2, "expected >= 2 chunks, got {}", chunks.len());
    let streamed: Vec<u8> = chunks.concat();
    assert_eq!(streamed, body);
}

#[test]
fn duplicate_headers_merge_in_order_except_set_cookie() {
    let port = serve(|_req| {
        Reply::Raw(
            b"HTTP/1.1 200 OK\r\n\
              X-Foo: a\r\n\
              X-Foo: b\r\n\
              Set-Cookie: one=1\r\n\
              X-Foo: c\r\n\
              Set-Cookie: two=2\r\n\
              Content-Length: 0\r\n\r\n"
                .to_vec(),
        )
    });
    let pool = pool_for(port, PoolOptions::default());

    let resp = pool.request("GET", "/", &[], None).unwrap();

    let foo: Vec<&(String, String)> = resp
        .headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("x-foo"))
        .collect();
    assert_eq!(foo.len(), 1);
    let values: Vec<&str> = foo[0].1.split(", ").collect();
    assert_eq!(values, ["a", "b", "c"]);

    let cookies: Vec<&str> = resp
        .headers
        .iter()
        .filter(|(n, _)| n.eq_ignore_ascii_case("set-cookie"))
        .map(|(_, v)| v.as_str())
        .collect();
    assert_eq!(cookies, ["one=1", "two=2"]);
}

#[test]
fn chunked_responses_are_decoded() {
    let port = serve(|_req| {
        Reply::Raw(
            b"HTTP/1.1 200 OK\r\n\
              Transfer-Encoding: chunked\r\n\r\n\
              4\r\nWiki\r\n\
              5\r\npedia\r\n\
              0\r\n\r\n"
                .to_vec(),
        )
    });
    let pool = pool_for(port, PoolOptions::default());

    let resp = pool.request("GET", "/", &[], None).unwrap();
    assert_eq!(&resp.body[..], b"Wikipedia");
}

#[test]
fn close_delimited_bodies_read_to_eof() {
    let port = serve(|_req| {
        Reply::Raw(
            b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nuntil the very end".to_vec(),
        )
    });
    let pool = pool_for(port, PoolOptions::default());

    let resp = pool.request("GET", "/", &[], None).unwrap();
    assert_eq!(&resp.body[..], b"until the very end");
}

#[test]
fn head_responses_carry_no_body() {
    let port = serve(|_req| Reply::ok("would-be-body"));
    let pool = pool_for(port, PoolOptions::default());

    let resp = pool.request("HEAD", "/", &[], None).unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.header("Content-Length"), Some("13"));
    assert!(resp.body.is_empty());
}

#[test]
fn request_bodies_are_delivered_with_content_length() {
    let port = serve(|req| {
        assert_eq!(req.header("Content-Length"), Some("11"));
        Reply::ok(req.body.clone())
    });
    let pool = pool_for(port, PoolOptions::default());

    let resp = pool
        .request("PUT", "/echo", &[], Some(b"hello world"))
        .unwrap();
    assert_eq!(&resp.body[..], b"hello world");
}

#[test]
fn absent_body_sends_no_content_length() {
    let port = serve(|req| {
        assert_eq!(req.header("Content-Length"), None);
        assert_eq!(req.header("Transfer-Encoding"), None);
        Reply::ok("")
    });
    let pool = pool_for(port, PoolOptions::default());

    let resp = pool.request("GET", "/", &[], None).unwrap();
    assert_eq!(resp.status, 200);
}

#[test]
fn slow_first_byte_raises_timeout_within_bound() {
    let port = serve(|_req| {
        thread::sleep(Duration::from_secs(5));
        Reply::ok("late")
    });
    let pool = pool_for(
        port,
        PoolOptions {
            read_timeout_ms: 1_000,
            ..PoolOptions::default()
        },
    );

    let started = Instant::now();
    let err = pool.request("GET", "/slow", &[], None).unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, Error::Timeout { .. }), "{err}");
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    assert!(err.to_string().contains("SOCKET_TIMEOUT"));
}

#[test]
fn concurrent_requests_do_not_cross_contaminate() {
    let port = serve(|req| {
        let id = req.header("X-Correlation-Id").unwrap_or("missing").to_string();
        Reply::ok(id)
    });
    let pool = Arc::new(pool_for(port, PoolOptions::default()));

    let failures = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..32)
        .map(|i| {
            let pool = Arc::clone(&pool);
            let failures = Arc::clone(&failures);
            thread::spawn(move || {
                for round in 0..8 {
                    let id = format!("req-{i}-{round}");
                    let resp = pool
                        .request(
                            "GET",
                            "/echo-id",
                            &[("X-Correlation-Id".to_string(), id.clone())],
                            None,
                        )
                        .expect("request must succeed");
                    if resp.body != id.as_bytes() {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[test]
fn pool_manager_lookup_is_stable_under_contention() {
    let manager = Arc::new(PoolManager::default());
    let port = serve(|_req| Reply::ok("pooled"));
    let endpoint = format!("http://127.0.0.1:{port}");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let endpoint = endpoint.clone();
            thread::spawn(move || {
                for _ in 0..16 {
                    let pool = manager.pool_for(&endpoint).unwrap();
                    let resp = pool.request("GET", "/", &[], None).unwrap();
                    assert_eq!(&resp.body[..], b"pooled");
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn sink_errors_abort_the_stream_and_surface() {
    let port = serve(|_req| Reply::ok(vec![b'y'; 64 * 1024]));
    let pool = pool_for(port, PoolOptions::default());

    let mut calls = 0usize;
    let mut sink = |_chunk: &[u8]| -> Result<()> {
        calls += 1;
        Err(Error::argument("sink refused the chunk"))
    };

    let err = pool
        .request_streaming("GET", "/", &[], None, &mut sink)
        .unwrap_err();
    assert!(matches!(err, Error::Argument { .. }), "{err}");
    assert_eq!(calls, 1);
}

#[test]
fn invalid_method_is_an_argument_error() {
    let port = serve(|_req| Reply::ok(""));
    let pool = pool_for(port, PoolOptions::default());

    let err = pool.request("GE T", "/", &[], None).unwrap_err();
    assert!(matches!(err, Error::Argument { .. }));
}
