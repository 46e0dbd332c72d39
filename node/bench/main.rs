use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gemsbok::*;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::runtime::Runtime;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Uri};

fn setup_addax_benchmark() -> (Runtime, Channel) {
    let rt = Runtime::new().expect("tokio runtime initialization");

    // Set up the stream
    let (stream, socket) = rt.block_on(async {
        // Create a new UDS file
        let socket = NamedTempFile::new().unwrap();
        let socket = Arc::new(socket.into_temp_path());
        std::fs::remove_file(&*socket).unwrap();

        let uds = UnixListener::bind(&*socket).unwrap();
        (UnixListenerStream::new(uds), socket)
    });

    // Start the server
    rt.spawn(async {
        let result = node_lib::start_addax(
            node_lib::Connection::Uds(stream),
            node_lib::StorageBackend::InMemory,
            node_lib::ServiceOptions::default(),
        )
        .await;
        assert!(result.is_ok());
    });

    // Create a channel for a client to connect on
    let channel = rt.block_on(async {
        // Create a UDS connection to the addax instance
        let socket = Arc::clone(&socket);
        Endpoint::try_from("http://addax.build")
            .unwrap()
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let socket = Arc::clone(&socket);
                async move { UnixStream::connect(&*socket).await }
            }))
            .await
            .unwrap()
    });

    (rt, channel)
}

async fn upload_blobs(client: Gemsbok, blobs: Vec<Vec<u8>>) {
    let _digests = client.upload_blobs(&blobs).await.unwrap();
}

/// Every iteration uploads fresh content, so deduplication never kicks in.
fn fresh_blobs(rng: &mut ChaCha8Rng, count: usize, size: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|_| (0..size).map(|_| rng.gen()).collect())
        .collect()
}

fn upload_blobs_benchmark(c: &mut Criterion) {
    let (rt, channel) = setup_addax_benchmark();
    let client = Gemsbok::new(channel);

    static KB: usize = 1024;
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    let mut group = c.benchmark_group("upload_blobs");
    for size in [32, KB, 8 * KB, 64 * KB, 1024 * KB].iter() {
        group.throughput(Throughput::Bytes(16 * *size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.to_async(&rt).iter_batched(
                || fresh_blobs(&mut rng, 16, size),
                |blobs| upload_blobs(client.clone(), blobs),
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(benches, upload_blobs_benchmark);
criterion_main!(benches);
