// The process-wide engine surface: initialize / submit / status / cancel /
// parse as free functions. Kept in its own test binary because the engine
// slot is shared process-wide.

use std::time::Duration;

use vodl_engine::{
    DownloadRequest, EngineConfig, EngineError, JobId, JobState, OrchestratorError, Playlist,
    PlaylistHint, Source,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn wait_for_terminal(id: &JobId, timeout: Duration) -> JobState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let state = vodl_engine::status(id).expect("job is known");
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

#[cfg(unix)]
#[tokio::test]
async fn process_wide_surface_round_trips() {
    let server = MockServer::start().await;
    let scratch = tempfile::tempdir().unwrap();

    // Slow playlist so the job is still in flight when cancel lands.
    Mock::given(method("GET"))
        .and(path("/v/index.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXT-X-ENDLIST\n")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let config = || EngineConfig {
        muxer_path: "/bin/sh".into(),
        max_concurrent_tasks: 2,
        ..Default::default()
    };
    vodl_engine::initialize(config()).unwrap();
    // Reconfiguring is idempotent.
    vodl_engine::initialize(config()).unwrap();

    let source = Source::parse(&format!("{}/v/index.m3u8", server.uri())).unwrap();
    let id = vodl_engine::submit(DownloadRequest::new(
        source.clone(),
        scratch.path().join("out"),
    ))
    .unwrap();
    assert!(vodl_engine::status(&id).is_some());

    vodl_engine::cancel(&id).unwrap();
    let state = wait_for_terminal(&id, Duration::from_secs(10)).await;
    assert_eq!(state, JobState::Cancelled);
    // Cancel stays idempotent after the terminal transition.
    vodl_engine::cancel(&id).unwrap();

    // A fresh initialize swaps the engine; the old job id is unknown to
    // the replacement.
    vodl_engine::initialize(config()).unwrap();
    assert!(vodl_engine::status(&id).is_none());
    let err = vodl_engine::cancel(&id).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Orchestrator(OrchestratorError::JobNotFound { .. })
    ));

    // parse through the same surface, from a local file.
    let playlist_path = scratch.path().join("show.m3u8");
    std::fs::write(
        &playlist_path,
        "#EXTM3U\n\
#EXT-X-TARGETDURATION:10\n\
#EXTINF:4.0,\n\
part0.ts\n\
#EXTINF:4.0,\n\
part1.ts\n\
#EXT-X-ENDLIST\n",
    )
    .unwrap();
    let parsed = vodl_engine::parse(&Source::Local(playlist_path), PlaylistHint::Media)
        .await
        .unwrap();
    let Playlist::Media(media) = parsed else {
        panic!("expected media playlist");
    };
    assert_eq!(media.segments.len(), 2);
}
