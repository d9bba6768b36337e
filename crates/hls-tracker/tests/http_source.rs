// Wire-level coverage: the reqwest-backed source against an in-process axum
// origin, and a full tracker run checking that delivery directives actually
// reach the server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderMap as AxumHeaderMap, StatusCode};
use axum::routing::get;
use reqwest::header::HeaderMap;
use tokio::net::TcpListener;
use url::Url;

use hls_tracker::test_utils::{MediaPlaylistBuilder, RecordingPrimaryListener, ScriptedOrigin, multivariant};
use hls_tracker::{
    HlsPlaylistTracker, HttpPlaylistSource, HttpSourceConfig, LoadRequest, PlaylistDataSource,
    TrackerError,
};

#[derive(Clone, Default)]
struct RequestLog {
    entries: Arc<Mutex<Vec<(String, String)>>>,
}

impl RequestLog {
    fn record(&self, path_and_query: impl Into<String>, accept_encoding: impl Into<String>) {
        self.entries
            .lock()
            .unwrap()
            .push((path_and_query.into(), accept_encoding.into()));
    }

    fn entries(&self) -> Vec<(String, String)> {
        self.entries.lock().unwrap().clone()
    }
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://127.0.0.1:{}", addr.port())
}

fn playlist_app(log: RequestLog) -> Router {
    let handler = |log: RequestLog| {
        move |headers: AxumHeaderMap, uri: axum::http::Uri| async move {
            let accept_encoding = headers
                .get("accept-encoding")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_owned();
            log.record(
                uri.path_and_query().map(ToString::to_string).unwrap_or_default(),
                accept_encoding,
            );
            "#EXTM3U\n"
        }
    };
    Router::new()
        .route("/master.m3u8", get(handler(log.clone())))
        .route("/a.m3u8", get(handler(log.clone())))
        .route(
            "/missing.m3u8",
            get(|| async { (StatusCode::NOT_FOUND, "gone") }),
        )
}

#[tokio::test]
async fn http_source_returns_bytes_and_maps_statuses() {
    let log = RequestLog::default();
    let base = serve(playlist_app(log.clone())).await;
    let source = HttpPlaylistSource::new(HttpSourceConfig::default()).unwrap();

    let ok: Url = format!("{base}/master.m3u8").parse().unwrap();
    let bytes = source
        .load(&LoadRequest {
            uri: ok.clone(),
            headers: HeaderMap::new(),
            allow_gzip: true,
        })
        .await
        .unwrap();
    assert!(bytes.starts_with(b"#EXTM3U"));

    let missing: Url = format!("{base}/missing.m3u8").parse().unwrap();
    let error = source
        .load(&LoadRequest {
            uri: missing,
            headers: HeaderMap::new(),
            allow_gzip: true,
        })
        .await
        .unwrap_err();
    match error {
        TrackerError::HttpStatus { status, .. } => {
            assert_eq!(status, reqwest::StatusCode::NOT_FOUND)
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn gzip_negotiation_follows_the_request_flag() {
    let log = RequestLog::default();
    let base = serve(playlist_app(log.clone())).await;
    let source = HttpPlaylistSource::new(HttpSourceConfig::default()).unwrap();
    let uri: Url = format!("{base}/master.m3u8").parse().unwrap();

    for allow_gzip in [true, false] {
        source
            .load(&LoadRequest {
                uri: uri.clone(),
                headers: HeaderMap::new(),
                allow_gzip,
            })
            .await
            .unwrap();
    }

    let entries = log.entries();
    assert_eq!(entries.len(), 2);
    assert!(entries[0].1.contains("gzip"));
    assert_eq!(entries[1].1, "identity");
}

#[tokio::test]
async fn delivery_directives_reach_the_wire() {
    let log = RequestLog::default();
    let base = serve(playlist_app(log.clone())).await;
    let master: Url = format!("{base}/master.m3u8").parse().unwrap();
    let a: Url = format!("{base}/a.m3u8").parse().unwrap();

    // Typed playlists come from the scripted parser; the bytes travel over
    // real HTTP so the request URIs are observable server-side.
    let scripts = ScriptedOrigin::new();
    scripts.enqueue_multivariant(&master, multivariant(&master, &[&a]));
    scripts.enqueue_media(
        &a,
        MediaPlaylistBuilder::new()
            .media_sequence(100)
            .segments(4, Duration::from_millis(200))
            .can_block_reload()
            .build_arc(),
    );
    scripts.enqueue_media(
        &a,
        MediaPlaylistBuilder::new()
            .media_sequence(101)
            .segments(4, Duration::from_millis(200))
            .can_block_reload()
            .end_tag()
            .build_arc(),
    );

    let tracker = HlsPlaylistTracker::builder(scripts.parser_factory())
        .build()
        .unwrap();
    let primary = Arc::new(RecordingPrimaryListener::default());
    tracker.start(master, primary.clone()).await.unwrap();

    // Three requests: master, plain media, blocking media reload.
    for _ in 0..100 {
        if log.entries().len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tracker.stop().await;

    let paths: Vec<String> = log.entries().into_iter().map(|(path, _)| path).collect();
    assert_eq!(paths[0], "/master.m3u8");
    assert_eq!(paths[1], "/a.m3u8");
    assert_eq!(paths[2], "/a.m3u8?_HLS_msn=104");
    assert!(primary.latest().unwrap().has_end_tag);
}
