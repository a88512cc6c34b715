use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use revfs::Fs;

fn gen_body(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(b' '..=b'~')).collect()
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("commit");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(10);

    for &files in &[10usize, 100usize] {
        group.throughput(Throughput::Elements(files as u64));
        group.bench_with_input(BenchmarkId::new("files_per_rev", files), &files, |b, &files| {
            b.iter(|| {
                let fs = Fs::memory().unwrap();
                let txn = fs.begin_txn(0).unwrap();
                let root = txn.root();
                root.make_dir("/data").unwrap();
                for i in 0..files {
                    let path = format!("/data/file-{}", i);
                    root.make_file(&path).unwrap();
                    root.apply_text(&path, None, &gen_body(512, i as u64)).unwrap();
                }
                criterion::black_box(txn.commit().unwrap());
            });
        });
    }

    group.bench_function("append_history_64", |b| {
        b.iter(|| {
            let fs = Fs::memory().unwrap();
            let txn = fs.begin_txn(0).unwrap();
            txn.root().make_file("/log").unwrap();
            txn.root().apply_text("/log", None, b"seed\n").unwrap();
            txn.commit().unwrap();
            let mut body = b"seed\n".to_vec();
            for i in 0..64u64 {
                let head = fs.youngest_rev().unwrap();
                let txn = fs.begin_txn(head).unwrap();
                body.extend_from_slice(&gen_body(128, i));
                body.push(b'\n');
                txn.root().apply_text("/log", None, &body).unwrap();
                txn.commit().unwrap();
            }
            criterion::black_box(fs.youngest_rev().unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_commit);
criterion_main!(benches);
