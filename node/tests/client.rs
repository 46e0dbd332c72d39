use crate::{addax_test, uds_channel};
use common::Digest;
use gemsbok::{ActionResult, CacheError, CacheOptions, Gemsbok};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::UnixListener;
use tonic::transport::{Channel, Endpoint};

/// Limits small enough that a handful of tiny blobs spans several chunks and
/// batches.
fn small_limits() -> CacheOptions {
    CacheOptions {
        max_chunk_size_bytes: 2,
        max_batch_size_bytes: 10,
        max_batch_inputs: 10,
        ..Default::default()
    }
}

fn client(channel: Channel) -> Gemsbok {
    Gemsbok::with_options(channel, small_limits()).unwrap()
}

/// A node whose socket is bound but never served: connections queue up and
/// nothing answers.
fn unresponsive_node() -> (UnixListener, Channel) {
    let socket = NamedTempFile::new().unwrap();
    let socket = Arc::new(socket.into_temp_path());
    std::fs::remove_file(&*socket).unwrap();
    let listener = UnixListener::bind(&*socket).unwrap();
    (listener, uds_channel(socket))
}

async fn write_file(path: &Path, contents: &[u8]) {
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    tokio::fs::write(path, contents).await.unwrap();
}

#[tokio::test]
async fn empty_blobs_never_reach_the_server() {
    // Nothing listens here, any RPC would fail.
    let channel = Endpoint::from_static("http://[::1]:1").connect_lazy();
    let client = client(channel);

    let digests = client.upload_blobs(&[b"", b""]).await.unwrap();
    assert_eq!(digests, vec![Digest::empty(), Digest::empty()]);

    let blobs = client.download_blobs(&digests).await.unwrap();
    assert_eq!(blobs, vec![Vec::<u8>::new(), vec![]]);
    assert!(client.download_blob(&Digest::empty()).await.unwrap().is_empty());
}

#[tokio::test]
async fn blobs_round_trip_across_chunks_and_batches() {
    addax_test(|channel, store| async move {
        let client = client(channel);
        let blobs: [&[u8]; 5] = [b"fooooooo", b"baaaar", b"1", b"2", b"3"];

        let digests = client.upload_blobs(&blobs).await.unwrap();
        assert_eq!(digests.len(), 5);
        assert_eq!(digests[0], Digest::of_bytes(b"fooooooo"));
        assert_eq!(store.len().await, 5);

        // The node streams blobs back in reverse; results follow the request.
        let wanted = vec![
            digests[4].clone(),
            digests[0].clone(),
            Digest::empty(),
            digests[2].clone(),
            digests[1].clone(),
        ];
        let downloaded = client.download_blobs(&wanted).await.unwrap();
        assert_eq!(
            downloaded,
            vec![
                b"3".to_vec(),
                b"fooooooo".to_vec(),
                vec![],
                b"1".to_vec(),
                b"baaaar".to_vec()
            ]
        );
    })
    .await;
}

#[tokio::test]
async fn uploading_twice_stores_once() {
    addax_test(|channel, store| async move {
        let client = client(channel);
        let first = client.upload_blobs(&[b"swakopmund", b"swakopmund"]).await.unwrap();
        let second = client.upload_blobs(&[b"swakopmund"]).await.unwrap();

        assert_eq!(first[0], first[1]);
        assert_eq!(first[0], second[0]);
        assert_eq!(store.len().await, 1);
    })
    .await;
}

#[tokio::test]
async fn concurrent_identical_uploads_store_once() {
    addax_test(|channel, store| async move {
        let clients: Vec<Gemsbok> = (0..4).map(|_| client(channel.clone())).collect();
        let blobs: [&[u8]; 1] = [b"the same content"];
        let (a, b, c, d) = tokio::join!(
            clients[0].upload_blobs(&blobs),
            clients[1].upload_blobs(&blobs),
            clients[2].upload_blobs(&blobs),
            clients[3].upload_blobs(&blobs),
        );
        for result in [a, b, c, d] {
            assert_eq!(result.unwrap(), vec![Digest::of_bytes(blobs[0])]);
        }
        assert_eq!(store.len().await, 1);
    })
    .await;
}

#[tokio::test]
async fn refused_lookup_is_unavailable() {
    // Nothing listens here.
    let channel = Endpoint::from_static("http://[::1]:1").connect_lazy();
    let err = client(channel).upload_blobs(&[b"foo"]).await.unwrap_err();
    assert!(matches!(err, CacheError::Unavailable(_)), "{err:?}");
}

#[tokio::test]
async fn missing_blob_fails_the_whole_download() {
    addax_test(|channel, store| async move {
        let present = store.put(b"swakopmund").await;
        let absent = Digest::of_bytes(b"windhoek");
        let client = client(channel);

        let err = client
            .download_blobs(&[present, absent.clone()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains(&absent.to_string()));
        match err {
            CacheError::MissingDigests(missing) => assert_eq!(missing, vec![absent]),
            other => panic!("unexpected {other:?}"),
        }
    })
    .await;
}

#[tokio::test]
async fn results_round_trip_through_the_cache() {
    addax_test(|channel, _| async move {
        let client = client(channel);
        let source = tempfile::tempdir().unwrap();
        let files = [
            source.path().join("a/foo"),
            source.path().join("b/empty"),
            source.path().join("a/bar"),
        ];
        write_file(&files[0], b"foo").await;
        write_file(&files[1], b"").await;
        write_file(&files[2], b"bar").await;

        let mut result = ActionResult::new();
        client
            .upload_all_results(source.path(), &files, &mut result)
            .await
            .unwrap();
        let paths: Vec<&str> = result.outputs().iter().map(|o| o.path.as_str()).collect();
        assert_eq!(paths, vec!["a/foo", "b/empty", "a/bar"]);
        assert_eq!(result.outputs()[1].digest, Digest::empty());

        let target = tempfile::tempdir().unwrap();
        client
            .download_all_results(&result, target.path())
            .await
            .unwrap();
        for output in result.outputs() {
            let written = target.path().join(&output.path);
            assert_eq!(Digest::of_file(&written).await.unwrap(), output.digest);
        }
        assert_eq!(
            tokio::fs::read(target.path().join("a/bar")).await.unwrap(),
            b"bar"
        );
    })
    .await;
}

#[tokio::test]
async fn large_outputs_stream_in_chunks() {
    addax_test(|channel, store| async move {
        let client = client(channel);
        let source = tempfile::tempdir().unwrap();
        let large = source.path().join("out/large");
        // Well past the batch limit, so it goes alone and in many chunks.
        let contents: Vec<u8> = (0..=255u8).cycle().take(4099).collect();
        write_file(&large, &contents).await;

        let mut result = ActionResult::new();
        client
            .upload_all_results(source.path(), &[&large], &mut result)
            .await
            .unwrap();
        assert_eq!(result.outputs()[0].digest, Digest::of_bytes(&contents));
        assert_eq!(store.len().await, 1);
        assert_eq!(
            client.download_blob(&result.outputs()[0].digest).await.unwrap(),
            contents
        );
    })
    .await;
}

#[tokio::test]
async fn executable_bit_survives_the_round_trip() {
    addax_test(|channel, _| async move {
        let client = client(channel);
        let source = tempfile::tempdir().unwrap();
        let tool = source.path().join("bin/tool");
        let data = source.path().join("share/data");
        write_file(&tool, b"#!/bin/sh\n").await;
        write_file(&data, b"data").await;
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::set_permissions(&data, std::fs::Permissions::from_mode(0o644)).unwrap();

        let mut result = ActionResult::new();
        client
            .upload_all_results(source.path(), &[&tool, &data], &mut result)
            .await
            .unwrap();
        assert!(result.outputs()[0].executable);
        assert!(!result.outputs()[1].executable);

        let target = tempfile::tempdir().unwrap();
        client
            .download_all_results(&result, target.path())
            .await
            .unwrap();
        let mode = |path: &str| {
            std::fs::metadata(target.path().join(path))
                .unwrap()
                .permissions()
                .mode()
        };
        assert_ne!(mode("bin/tool") & 0o111, 0);
        assert_eq!(mode("share/data") & 0o111, 0);
    })
    .await;
}

#[tokio::test]
async fn outputs_must_stay_inside_the_root() {
    addax_test(|channel, _| async move {
        let client = client(channel);
        let root = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let stray = elsewhere.path().join("stray");
        write_file(&stray, b"stray").await;

        let mut result = ActionResult::new();
        let err = client
            .upload_all_results(root.path(), &[&stray], &mut result)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::PathOutsideRoot { .. }));
        assert!(result.outputs().is_empty());

        let mut escaping = ActionResult::new();
        escaping.add_output("../escape", Digest::of_bytes(b"stray"), false);
        let err = client
            .download_all_results(&escaping, root.path())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::PathOutsideRoot { .. }));
    })
    .await;
}

#[tokio::test]
async fn failed_upload_leaves_the_result_alone() {
    addax_test(|channel, _| async move {
        let client = client(channel);
        let root = tempfile::tempdir().unwrap();
        let mut result = ActionResult::new();
        result.add_output("kept", Digest::empty(), false);

        let err = client
            .upload_all_results(root.path(), &[root.path().join("absent")], &mut result)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Filesystem { .. }));
        assert_eq!(result.outputs().len(), 1);
    })
    .await;
}

#[tokio::test]
async fn action_results_are_cached() {
    addax_test(|channel, _| async move {
        let client = client(channel);
        let action = Digest::of_bytes(b"cc -c main.c");
        assert_eq!(client.get_cached_result(&action).await.unwrap(), None);

        let source = tempfile::tempdir().unwrap();
        let object = source.path().join("main.o");
        write_file(&object, b"\x7fELF").await;

        let mut unpublished = ActionResult::new();
        unpublished.add_output("main.o", Digest::of_bytes(b"\x7fELF"), false);
        match client.set_cached_result(&action, &unpublished).await {
            Err(CacheError::Transport(status)) => {
                assert_eq!(status.code(), tonic::Code::FailedPrecondition)
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut result = ActionResult::new();
        client
            .upload_all_results(source.path(), &[&object], &mut result)
            .await
            .unwrap();
        client.set_cached_result(&action, &result).await.unwrap();
        assert_eq!(
            client.get_cached_result(&action).await.unwrap(),
            Some(result)
        );
    })
    .await;
}

#[tokio::test]
async fn unresponsive_node_times_out() {
    let (_listener, channel) = unresponsive_node();
    let options = CacheOptions {
        timeout_seconds: 1,
        ..small_limits()
    };
    let client = Gemsbok::with_options(channel, options).unwrap();
    match client.upload_blobs(&[b"swakopmund"]).await {
        Err(CacheError::Timeout(after)) => assert_eq!(after.as_secs(), 1),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn interrupted_upload_leaves_the_result_alone() {
    let (_listener, channel) = unresponsive_node();
    let source = tempfile::tempdir().unwrap();
    let output = source.path().join("out/main.o");
    write_file(&output, b"\x7fELF").await;
    let mut result = ActionResult::new();
    result.add_output("kept", Digest::empty(), false);
    let before = result.clone();

    let options = CacheOptions {
        timeout_seconds: 1,
        ..small_limits()
    };
    let impatient = Gemsbok::with_options(channel.clone(), options).unwrap();
    let err = impatient
        .upload_all_results(source.path(), &[&output], &mut result)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Timeout(_)), "{err:?}");
    assert_eq!(result, before);

    // Dropping the call part way through has the same effect.
    let client = client(channel);
    let abandoned = tokio::time::timeout(
        Duration::from_millis(200),
        client.upload_all_results(source.path(), &[&output], &mut result),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(result, before);
}

#[tokio::test]
async fn zero_limits_are_refused() {
    let options = CacheOptions {
        max_concurrent_batches: 0,
        ..Default::default()
    };
    let channel = Endpoint::from_static("http://[::1]:1").connect_lazy();
    assert!(matches!(
        Gemsbok::with_options(channel, options),
        Err(CacheError::InvalidOptions(_))
    ));
}
