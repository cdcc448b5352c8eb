
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use harness::{
    exchange, response_body, response_status, tls_connect, FrontdoorHandle, HttpBackend,
    RecordingUpstream, TEST_TIMEOUT,
};
use plfm_frontdoor::{AcceptError, Classification, HttpUpstream, SyntheticAddress, TransportConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

#[tokio::test]
async fn plaintext_request_is_directed_to_http_host() {
    let recorder = Arc::new(RecordingUpstream::default());
    let frontdoor = FrontdoorHandle::spawn(recorder.clone()).await.unwrap();

    let response = timeout(TEST_TIMEOUT, async {
        let mut stream = frontdoor.connect().await?;
        exchange(
            &mut stream,
            b"GET / HTTP/1.1\r\nHost: example.internal\r\nConnection: close\r\n\r\n",
        )
        .await
    })
    .await
    .expect("request timed out")
    .unwrap();

    assert_eq!(response_status(&response), Some(200), "{response}");
    assert_eq!(response_body(&response), "http://example.internal/");
    assert_eq!(recorder.uris().await, vec!["http://example.internal/"]);

    let stats = frontdoor.listener.stats();
    assert_eq!(stats.classified_plaintext.load(Ordering::Relaxed), 1);
    assert_eq!(stats.classified_tls.load(Ordering::Relaxed), 0);
}

#[tokio::test]
async fn tls_request_is_directed_to_https_host() {
    let recorder = Arc::new(RecordingUpstream::default());
    let frontdoor = FrontdoorHandle::spawn(recorder.clone()).await.unwrap();

    let response = timeout(TEST_TIMEOUT, async {
        let mut tls = tls_connect(&frontdoor.bind_path, &frontdoor.cert_der).await?;
        exchange(
            &mut tls,
            b"GET /status?verbose=1 HTTP/1.1\r\nHost: example.internal\r\nConnection: close\r\n\r\n",
        )
        .await
    })
    .await
    .expect("request timed out")
    .unwrap();

    assert_eq!(response_status(&response), Some(200), "{response}");
    assert_eq!(
        response_body(&response),
        "https://example.internal/status?verbose=1"
    );
    assert_eq!(
        recorder.uris().await,
        vec!["https://example.internal/status?verbose=1"]
    );
    assert_eq!(
        frontdoor
            .listener
            .stats()
            .classified_tls
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn keep_alive_connection_directs_every_request() {
    let recorder = Arc::new(RecordingUpstream::default());
    let frontdoor = FrontdoorHandle::spawn(recorder.clone()).await.unwrap();

    timeout(TEST_TIMEOUT, async {
        let mut tls = tls_connect(&frontdoor.bind_path, &frontdoor.cert_der).await?;
        tls.write_all(b"GET /one HTTP/1.1\r\nHost: a.internal\r\n\r\n")
            .await?;
        tls.flush().await?;

        // Wait for the first response before pipelining the second request.
        let mut buf = vec![0u8; 1024];
        let mut seen = String::new();
        while !seen.contains("https://a.internal/one") {
            let n = tls.read(&mut buf).await?;
            assert!(n > 0, "connection closed early: {seen}");
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
        }

        let response = exchange(
            &mut tls,
            b"GET /two HTTP/1.1\r\nHost: b.internal\r\nConnection: close\r\n\r\n",
        )
        .await?;
        assert_eq!(response_body(&response), "https://b.internal/two");
        Ok::<_, std::io::Error>(())
    })
    .await
    .expect("requests timed out")
    .unwrap();

    assert_eq!(
        recorder.uris().await,
        vec!["https://a.internal/one", "https://b.internal/two"]
    );
}

#[tokio::test]
async fn peer_closing_before_first_byte_is_scoped_to_its_accept() {
    let recorder = Arc::new(RecordingUpstream::default());
    let (frontdoor, _shutdown_rx) = FrontdoorHandle::bind(recorder).await.unwrap();

    let silent = frontdoor.connect().await.unwrap();
    drop(silent);

    let err = timeout(TEST_TIMEOUT, frontdoor.listener.accept())
        .await
        .expect("accept timed out")
        .err()
        .expect("accept should fail");
    assert!(matches!(err, AcceptError::FirstRead(_)), "{err:?}");

    // The listener keeps accepting.
    let mut client = frontdoor.connect().await.unwrap();
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: example.internal\r\n\r\n")
        .await
        .unwrap();

    let stream = timeout(TEST_TIMEOUT, frontdoor.listener.accept())
        .await
        .expect("accept timed out")
        .unwrap();
    assert_eq!(stream.classification(), Classification::Plaintext);

    let addr: SyntheticAddress = stream.local_addr().to_string().parse().unwrap();
    assert_eq!(addr.classification().scheme(), "http");
    assert_eq!(addr.bind_path(), frontdoor.bind_path.as_path());

    let stats = frontdoor.listener.stats();
    assert_eq!(stats.sniff_failed.load(Ordering::Relaxed), 1);
    assert_eq!(stats.classified_plaintext.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn tls_accept_reports_https_local_addr() {
    let recorder = Arc::new(RecordingUpstream::default());
    let (frontdoor, _shutdown_rx) = FrontdoorHandle::bind(recorder).await.unwrap();

    let bind_path = frontdoor.bind_path.clone();
    let cert_der = frontdoor.cert_der.clone();
    let client = tokio::spawn(async move { tls_connect(&bind_path, &cert_der).await });

    let stream = timeout(TEST_TIMEOUT, frontdoor.listener.accept())
        .await
        .expect("accept timed out")
        .unwrap();
    assert_eq!(stream.classification(), Classification::Tls);

    let addr: SyntheticAddress = stream.local_addr().to_string().parse().unwrap();
    assert_eq!(addr.classification().scheme(), "https");

    client.await.unwrap().unwrap();
}

#[tokio::test]
async fn serving_loop_survives_silent_and_broken_peers() {
    let recorder = Arc::new(RecordingUpstream::default());
    let frontdoor = FrontdoorHandle::spawn(recorder.clone()).await.unwrap();

    // Closes without a byte.
    drop(frontdoor.connect().await.unwrap());

    // Claims TLS, then sends garbage.
    let mut broken = frontdoor.connect().await.unwrap();
    broken.write_all(b"\x16\x03\x01garbage").await.unwrap();
    let mut sink = Vec::new();
    let _ = timeout(TEST_TIMEOUT, broken.read_to_end(&mut sink)).await;

    let response = timeout(TEST_TIMEOUT, async {
        let mut stream = frontdoor.connect().await?;
        exchange(
            &mut stream,
            b"GET /after HTTP/1.1\r\nHost: example.internal\r\nConnection: close\r\n\r\n",
        )
        .await
    })
    .await
    .expect("request timed out")
    .unwrap();

    assert_eq!(response_body(&response), "http://example.internal/after");
    assert_eq!(
        frontdoor
            .listener
            .stats()
            .handshake_failed
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn request_without_host_is_rejected() {
    let recorder = Arc::new(RecordingUpstream::default());
    let frontdoor = FrontdoorHandle::spawn(recorder.clone()).await.unwrap();

    let response = timeout(TEST_TIMEOUT, async {
        let mut stream = frontdoor.connect().await?;
        exchange(&mut stream, b"GET / HTTP/1.0\r\n\r\n").await
    })
    .await
    .expect("request timed out")
    .unwrap();

    assert_eq!(response_status(&response), Some(400), "{response}");
    assert!(recorder.uris().await.is_empty());
}

#[tokio::test]
async fn forwards_to_real_backend_and_streams_response() {
    let mut backend = HttpBackend::spawn("hello from backend").await.unwrap();
    let transport = TransportConfig {
        use_env_proxy: false,
        ..TransportConfig::default()
    };
    let upstream = Arc::new(HttpUpstream::new(&transport).unwrap());
    let frontdoor = FrontdoorHandle::spawn(upstream).await.unwrap();

    let request = format!(
        "GET /greeting HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nX-Request-Id: abc123\r\n\r\n",
        backend.addr
    );

    let response = timeout(TEST_TIMEOUT, async {
        let mut stream = frontdoor.connect().await?;
        exchange(&mut stream, request.as_bytes()).await
    })
    .await
    .expect("request timed out")
    .unwrap();

    assert_eq!(response_status(&response), Some(200), "{response}");
    assert!(response.to_ascii_lowercase().contains("x-backend: loopback"));
    assert!(response_body(&response).contains("hello from backend"));

    let head = backend.requests.recv().await.unwrap();
    assert!(head.starts_with("GET /greeting HTTP/1.1\r\n"), "{head}");
    let lower = head.to_ascii_lowercase();
    assert!(lower.contains(&format!("host: {}", backend.addr)), "{head}");
    assert!(lower.contains("x-request-id: abc123"), "{head}");
    assert!(!lower.contains("connection: close"), "{head}");

    assert_eq!(
        frontdoor
            .engine
            .stats()
            .requests_forwarded
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn unreachable_backend_yields_bad_gateway() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let transport = TransportConfig {
        use_env_proxy: false,
        ..TransportConfig::default()
    };
    let upstream = Arc::new(HttpUpstream::new(&transport).unwrap());
    let frontdoor = FrontdoorHandle::spawn(upstream).await.unwrap();

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        dead_addr
    );

    let response = timeout(TEST_TIMEOUT, async {
        let mut stream = frontdoor.connect().await?;
        exchange(&mut stream, request.as_bytes()).await
    })
    .await
    .expect("request timed out")
    .unwrap();

    assert_eq!(response_status(&response), Some(502), "{response}");
    assert_eq!(
        frontdoor
            .engine
            .stats()
            .requests_failed
            .load(Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn absolute_form_target_wins_over_host_header() {
    let mut backend = HttpBackend::spawn("absolute").await.unwrap();
    let transport = TransportConfig {
        use_env_proxy: false,
        ..TransportConfig::default()
    };
    let upstream = Arc::new(HttpUpstream::new(&transport).unwrap());
    let frontdoor = FrontdoorHandle::spawn(upstream).await.unwrap();

    let request = format!(
        "GET http://{}/x HTTP/1.1\r\nHost: other.invalid\r\nConnection: close\r\n\r\n",
        backend.addr
    );

    let response = timeout(TEST_TIMEOUT, async {
        let mut stream = frontdoor.connect().await?;
        exchange(&mut stream, request.as_bytes()).await
    })
    .await
    .expect("request timed out")
    .unwrap();

    assert_eq!(response_status(&response), Some(200), "{response}");
    assert_eq!(response_body(&response), "absolute");

    let head = backend.requests.recv().await.unwrap();
    assert!(head.starts_with("GET /x HTTP/1.1\r\n"), "{head}");
    assert!(
        head.to_ascii_lowercase()
            .contains(&format!("host: {}", backend.addr)),
        "{head}"
    );
}

#[tokio::test]
async fn connections_over_limit_are_rejected() {
    let recorder = Arc::new(RecordingUpstream::default());
    let frontdoor = FrontdoorHandle::spawn_with(recorder.clone(), |config| {
        config.max_connections = 1;
        config.sniff_timeout = Duration::from_secs(30);
    })
    .await
    .unwrap();
    let stats = frontdoor.listener.stats();

    // Holds the only permit while it waits for a first byte.
    let holder = frontdoor.connect().await.unwrap();
    timeout(TEST_TIMEOUT, async {
        while stats.connections_active.load(Ordering::Relaxed) == 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first connection never became active");

    let mut rejected = frontdoor.connect().await.unwrap();
    let mut sink = Vec::new();
    timeout(TEST_TIMEOUT, rejected.read_to_end(&mut sink))
        .await
        .expect("rejected connection was not closed")
        .unwrap();
    assert!(sink.is_empty());
    assert_eq!(stats.connections_rejected.load(Ordering::Relaxed), 1);

    drop(holder);
    timeout(TEST_TIMEOUT, async {
        while stats.connections_active.load(Ordering::Relaxed) != 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("permit was not released");

    let response = timeout(TEST_TIMEOUT, async {
        let mut stream = frontdoor.connect().await?;
        exchange(
            &mut stream,
            b"GET / HTTP/1.1\r\nHost: example.internal\r\nConnection: close\r\n\r\n",
        )
        .await
    })
    .await
    .expect("request timed out")
    .unwrap();
    assert_eq!(response_status(&response), Some(200), "{response}");
}
