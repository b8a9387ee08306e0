// End-to-end pipeline scenarios against a mock HTTP server and a stub
// muxer that concatenates the manifest entries byte-for-byte.

use std::path::{Path, PathBuf};
use std::time::Duration;

use vodl_engine::{
    DownloadRequest, Engine, EngineConfig, EngineError, JobId, JobState, NetworkError,
    OrchestratorError, Playlist, PlaylistHint, Source,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(muxer: &Path, tasks: usize) -> EngineConfig {
    EngineConfig {
        muxer_path: muxer.to_path_buf(),
        max_concurrent_tasks: tasks,
        download_timeout: Duration::from_secs(5),
        resource_timeout: Duration::from_secs(20),
        ..Default::default()
    }
}

/// Shell stand-in for the real muxer: concatenates every file named in
/// the concat manifest into the output path (the last argument).
#[cfg(unix)]
fn write_stub_muxer(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let script = r#"#!/bin/sh
set -e
for arg in "$@"; do out="$arg"; done
: > "$out"
while IFS= read -r line; do
  f=${line#"file '"}
  f=${f%"'"}
  cat "$f" >> "$out"
done < concat.txt
"#;
    let path = dir.join("stub-muxer");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn wait_for_terminal(engine: &Engine, id: &JobId, timeout: Duration) -> JobState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let state = engine.status(id).expect("job is known");
        if state.is_terminal() {
            return state;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {id} still {state:?} after {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn media_playlist(segment_names: &[&str]) -> String {
    let mut text = String::from(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n#EXT-X-MEDIA-SEQUENCE:0\n",
    );
    for name in segment_names {
        text.push_str("#EXTINF:10.0,\n");
        text.push_str(name);
        text.push('\n');
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

#[cfg(unix)]
#[tokio::test]
async fn simple_media_playlist_downloads_and_muxes() {
    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().unwrap();
    let muxer = write_stub_muxer(scratch.path());
    let out_dir = scratch.path().join("out");

    Mock::given(method("GET"))
        .and(path("/v/index.m3u8"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(media_playlist(&[
                "segment0.ts",
                "segment1.ts",
            ])),
        )
        .mount(&server)
        .await;
    let seg0 = vec![0xAAu8; 1024];
    let seg1 = vec![0xBBu8; 1024];
    Mock::given(method("GET"))
        .and(path("/v/segment0.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(seg0.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v/segment1.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(seg1.clone()))
        .mount(&server)
        .await;

    let engine = Engine::new(test_config(&muxer, 2)).unwrap();
    let source = Source::parse(&format!("{}/v/index.m3u8", server.uri())).unwrap();
    let id = engine
        .submit(DownloadRequest::new(source, &out_dir))
        .unwrap();

    let state = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(state, JobState::Succeeded, "{:?}", engine.job_error(&id));

    // Output is the segments in playlist order, regardless of download
    // completion order.
    let produced = std::fs::read(out_dir.join("index.mp4")).unwrap();
    let mut expected = seg0;
    expected.extend_from_slice(&seg1);
    assert_eq!(produced, expected);

    // Temp directory is gone after the terminal transition.
    if let Some(temp) = engine.temp_dir(&id) {
        assert!(!temp.exists(), "temp dir {} still on disk", temp.display());
    }
}

#[cfg(unix)]
#[tokio::test]
async fn client_error_fails_without_retry() {
    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().unwrap();
    let muxer = write_stub_muxer(scratch.path());

    Mock::given(method("GET"))
        .and(path("/v/index.m3u8"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let engine = Engine::new(test_config(&muxer, 2)).unwrap();
    let source = Source::parse(&format!("{}/v/index.m3u8", server.uri())).unwrap();
    let id = engine
        .submit(DownloadRequest::new(source, scratch.path().join("out")))
        .unwrap();

    let state = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(state, JobState::Failed);

    let error = engine.job_error(&id).unwrap();
    assert_eq!(
        error.source,
        EngineError::Network(NetworkError::ClientError { status: 404 })
    );
    assert_eq!(error.code(), 203);
    server.verify().await;
}

#[cfg(unix)]
#[tokio::test]
async fn server_errors_retry_with_backoff_then_succeed() {
    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().unwrap();
    let muxer = write_stub_muxer(scratch.path());
    let out_dir = scratch.path().join("out");

    // Two 503s, then the real playlist: three attempts total.
    Mock::given(method("GET"))
        .and(path("/v/index.m3u8"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(media_playlist(&["a.ts"])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v/a.ts"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"segment".to_vec()))
        .mount(&server)
        .await;

    let engine = Engine::new(test_config(&muxer, 2)).unwrap();
    let source = Source::parse(&format!("{}/v/index.m3u8", server.uri())).unwrap();
    let id = engine
        .submit(DownloadRequest::new(source, &out_dir))
        .unwrap();

    let state = wait_for_terminal(&engine, &id, Duration::from_secs(20)).await;
    assert_eq!(state, JobState::Succeeded, "{:?}", engine.job_error(&id));
    server.verify().await;
}

#[cfg(unix)]
#[tokio::test]
async fn third_submission_is_rejected_synchronously() {
    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().unwrap();
    let muxer = write_stub_muxer(scratch.path());

    // Slow playlist keeps the first two jobs running.
    Mock::given(method("GET"))
        .and(path("/v/index.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(media_playlist(&[]))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let engine = Engine::new(test_config(&muxer, 2)).unwrap();
    let source = Source::parse(&format!("{}/v/index.m3u8", server.uri())).unwrap();
    let out = scratch.path().join("out");

    let first = engine
        .submit(DownloadRequest::new(source.clone(), &out))
        .unwrap();
    let second = engine
        .submit(DownloadRequest::new(source.clone(), &out))
        .unwrap();

    let err = engine
        .submit(DownloadRequest::new(source, &out))
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Orchestrator(OrchestratorError::MaxConcurrentTasksReached { limit: 2 })
    ));

    engine.cancel(&first).unwrap();
    engine.cancel(&second).unwrap();
    wait_for_terminal(&engine, &first, Duration::from_secs(10)).await;
    wait_for_terminal(&engine, &second, Duration::from_secs(10)).await;
}

#[cfg(unix)]
#[tokio::test]
async fn key_override_decrypts_without_fetching_key_uri() {
    use aes::Aes128;
    use cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let padded_len = ((plaintext.len() / 16) + 1) * 16;
        let mut buffer = vec![0u8; padded_len];
        buffer[..plaintext.len()].copy_from_slice(plaintext);
        cipher
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap()
            .to_vec()
    }

    fn iv_for_sequence(sequence: u64) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[8..].copy_from_slice(&sequence.to_be_bytes());
        iv
    }

    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().unwrap();
    let muxer = write_stub_muxer(scratch.path());
    let out_dir = scratch.path().join("out");

    let key_hex = "0123456789abcdef0123456789abcdef";
    let mut key = [0u8; 16];
    hex::decode_to_slice(key_hex, &mut key).unwrap();

    let playlist = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:10\n\
#EXT-X-MEDIA-SEQUENCE:0\n\
#EXT-X-KEY:METHOD=AES-128,URI=\"/keys/master.key\"\n\
#EXTINF:10.0,\n\
enc0.ts\n\
#EXTINF:10.0,\n\
enc1.ts\n\
#EXT-X-ENDLIST\n";

    Mock::given(method("GET"))
        .and(path("/v/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(playlist))
        .mount(&server)
        .await;
    // The caller supplied the key, so the key URI must never be hit.
    Mock::given(method("GET"))
        .and(path("/keys/master.key"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 16]))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v/enc0.ts"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(encrypt(b"plain zero", &key, &iv_for_sequence(0))),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v/enc1.ts"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(encrypt(b"plain one", &key, &iv_for_sequence(1))),
        )
        .mount(&server)
        .await;

    let engine = Engine::new(test_config(&muxer, 2)).unwrap();
    let source = Source::parse(&format!("{}/v/index.m3u8", server.uri())).unwrap();
    let mut request = DownloadRequest::new(source, &out_dir);
    request.key_hex = Some(key_hex.to_owned());
    let id = engine.submit(request).unwrap();

    let state = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(state, JobState::Succeeded, "{:?}", engine.job_error(&id));

    let produced = std::fs::read(out_dir.join("index.mp4")).unwrap();
    assert_eq!(produced, b"plain zeroplain one");
    server.verify().await;
}

#[cfg(unix)]
#[tokio::test]
async fn cancel_mid_download_cleans_up() {
    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().unwrap();
    let muxer = write_stub_muxer(scratch.path());
    let out_dir = scratch.path().join("out");

    let names: Vec<String> = (0..100).map(|i| format!("s{i}.ts")).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    Mock::given(method("GET"))
        .and(path("/v/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(media_playlist(&name_refs)))
        .mount(&server)
        .await;
    // Segments respond slowly enough for the cancel to land mid-batch.
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![1u8; 256])
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let engine = Engine::new(test_config(&muxer, 2)).unwrap();
    let source = Source::parse(&format!("{}/v/index.m3u8", server.uri())).unwrap();
    let id = engine
        .submit(DownloadRequest::new(source, &out_dir))
        .unwrap();

    // Let the first segments land, then cancel.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let downloading = engine
            .temp_dir(&id)
            .map(|dir| dir.exists())
            .unwrap_or(false);
        if downloading || tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    engine.cancel(&id).unwrap();
    // Idempotent: a second cancel is equally fine.
    engine.cancel(&id).unwrap();

    let state = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(state, JobState::Cancelled);
    assert!(engine.job_error(&id).is_none());

    if let Some(temp) = engine.temp_dir(&id) {
        assert!(!temp.exists());
    }
    // No output landed in the destination.
    let produced = std::fs::read_dir(&out_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(produced, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn master_playlist_submission_is_a_documented_failure() {
    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().unwrap();
    let muxer = write_stub_muxer(scratch.path());

    let master = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360\n\
low/index.m3u8\n";
    Mock::given(method("GET"))
        .and(path("/v/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(master))
        .mount(&server)
        .await;

    let engine = Engine::new(test_config(&muxer, 2)).unwrap();
    let url = format!("{}/v/master.m3u8", server.uri());
    let source = Source::parse(&url).unwrap();
    let id = engine
        .submit(DownloadRequest::new(source.clone(), scratch.path().join("out")))
        .unwrap();
    let state = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(state, JobState::Failed);
    assert_eq!(engine.job_error(&id).unwrap().code(), 103);

    // The caller's path: parse with the master hint and pick a variant.
    let parsed = engine.parse(&source, PlaylistHint::Master).await.unwrap();
    let Playlist::Master(master) = parsed else {
        panic!("expected master playlist");
    };
    assert_eq!(master.variants.len(), 1);
    assert_eq!(master.highest_bandwidth().unwrap().bandwidth, 800_000);
}

#[cfg(unix)]
#[tokio::test]
async fn zero_segment_playlist_still_produces_an_output() {
    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().unwrap();
    let muxer = write_stub_muxer(scratch.path());
    let out_dir = scratch.path().join("out");

    Mock::given(method("GET"))
        .and(path("/v/index.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(media_playlist(&[])))
        .mount(&server)
        .await;

    let engine = Engine::new(test_config(&muxer, 2)).unwrap();
    let source = Source::parse(&format!("{}/v/index.m3u8", server.uri())).unwrap();
    let id = engine
        .submit(DownloadRequest::new(source, &out_dir))
        .unwrap();

    let state = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(state, JobState::Succeeded, "{:?}", engine.job_error(&id));
    assert!(out_dir.join("index.mp4").exists());
}

#[tokio::test]
async fn missing_muxer_fails_the_job_at_start() {
    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().unwrap();

    let engine = Engine::new(test_config(Path::new("/nonexistent/muxer"), 2)).unwrap();
    let source = Source::parse(&format!("{}/v/index.m3u8", server.uri())).unwrap();
    let id = engine
        .submit(DownloadRequest::new(source, scratch.path().join("out")))
        .unwrap();

    let state = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(state, JobState::Failed);
    assert_eq!(engine.job_error(&id).unwrap().code(), 501);
    // The playlist was never requested.
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[cfg(unix)]
#[tokio::test]
async fn local_playlist_with_local_segments() {
    let scratch = tempfile::tempdir().unwrap();
    let muxer = write_stub_muxer(scratch.path());
    let out_dir = scratch.path().join("out");

    let media_dir = scratch.path().join("media");
    std::fs::create_dir_all(&media_dir).unwrap();
    std::fs::write(media_dir.join("part0.ts"), b"local zero ").unwrap();
    std::fs::write(media_dir.join("part1.ts"), b"local one").unwrap();
    let playlist_path = media_dir.join("show.m3u8");
    std::fs::write(&playlist_path, media_playlist(&["part0.ts", "part1.ts"])).unwrap();

    let engine = Engine::new(test_config(&muxer, 2)).unwrap();
    let source = Source::Local(playlist_path);
    let id = engine
        .submit(DownloadRequest::new(source, &out_dir))
        .unwrap();

    let state = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(state, JobState::Succeeded, "{:?}", engine.job_error(&id));
    assert_eq!(
        std::fs::read(out_dir.join("show.mp4")).unwrap(),
        b"local zero local one"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn remote_playlist_cannot_reference_local_files() {
    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().unwrap();
    let muxer = write_stub_muxer(scratch.path());
    let out_dir = scratch.path().join("out");

    // A file the remote playlist has no business reading.
    let secret = scratch.path().join("secret.txt");
    std::fs::write(&secret, b"do not leak").unwrap();

    // An absolute segment URI replaces the base URL on resolution, so a
    // hostile remote playlist can point straight at local paths.
    let segment_uri = format!("file://{}", secret.display());
    Mock::given(method("GET"))
        .and(path("/v/index.m3u8"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(media_playlist(&[segment_uri.as_str()])),
        )
        .mount(&server)
        .await;

    let engine = Engine::new(test_config(&muxer, 2)).unwrap();
    let source = Source::parse(&format!("{}/v/index.m3u8", server.uri())).unwrap();
    let id = engine
        .submit(DownloadRequest::new(source, &out_dir))
        .unwrap();

    let state = wait_for_terminal(&engine, &id, Duration::from_secs(10)).await;
    assert_eq!(state, JobState::Failed);
    let error = engine.job_error(&id).unwrap();
    assert!(matches!(error.source, EngineError::Configuration { .. }));

    // Nothing was fetched or muxed: no output, temp dir gone.
    assert_eq!(
        std::fs::read_dir(&out_dir)
            .map(|entries| entries.count())
            .unwrap_or(0),
        0
    );
    if let Some(temp) = engine.temp_dir(&id) {
        assert!(!temp.exists());
    }
}
