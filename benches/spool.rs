#[macro_use]
extern crate criterion;

extern crate chrono;
extern crate courier;
extern crate tempdir;
extern crate url;

use chrono::offset::Utc;
use courier::config::SpoolConfig;
use courier::spool::Spool;
use courier::transmission;
use courier::transmission::Transmission;
use criterion::Criterion;
use url::Url;

fn sample_transmission() -> Transmission {
    Transmission::new(
        Url::parse("https://ingest.example.com/v2/track").unwrap(),
        vec![0x2a; 512],
        "application/json",
        "gzip",
        Utc::now(),
    )
}

fn bench_frame_encode(c: &mut Criterion) {
    let t = sample_transmission();
    c.bench_function("frame_encode_512b", move |b| {
        b.iter(|| {
            let mut buf = Vec::with_capacity(1024);
            transmission::write(&t, &mut buf).unwrap();
            buf
        })
    });
}

fn bench_frame_round_trip(c: &mut Criterion) {
    let t = sample_transmission();
    let mut buf = Vec::with_capacity(1024);
    transmission::write(&t, &mut buf).unwrap();
    c.bench_function("frame_decode_512b", move |b| {
        b.iter(|| transmission::decode(&buf, "bench").unwrap())
    });
}

fn bench_enqueue_peek_delete(c: &mut Criterion) {
    c.bench_function("spool_enqueue_peek_delete", |b| {
        let dir = tempdir::TempDir::new("courier").unwrap();
        let spool = Spool::open(dir.path().to_path_buf(), SpoolConfig::default()).unwrap();
        let t = sample_transmission();
        b.iter(|| {
            spool.enqueue(&t);
            let handle = spool.peek().expect("nothing to peek");
            spool.delete(handle);
        })
    });
}

criterion_group!(benches, bench_frame_encode, bench_frame_round_trip, bench_enqueue_peek_delete);
criterion_main!(benches);
