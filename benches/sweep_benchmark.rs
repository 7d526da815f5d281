use concord::consensus::{DetectorOptions, find_bad_in};
use concord::data::{FitRecord, FitTable};
use concord::sweep::{SweepOptions, run_sweep};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;

const OPTIMIZERS: [&str; 6] = ["bobyqa", "nelder_mead", "nlminb", "lbfgsb", "nloptwrap", "optimx"];

fn synthetic_table(datasets: usize) -> FitTable {
    let mut rng = StdRng::seed_from_u64(0x5EED_C0DE + datasets as u64);
    let noise = Normal::new(0.0, 1e-4).expect("valid noise scale");
    let mut records = Vec::with_capacity(datasets * OPTIMIZERS.len() * 3);
    for dataset in 0..datasets {
        let log_size = 2.0 + (dataset % 4) as f64 * 0.5;
        for (p, parameter) in ["theta1", "theta2", "sigma"].into_iter().enumerate() {
            let truth = 1.0 + p as f64;
            for optimizer in OPTIMIZERS {
                let wander = if rng.gen_bool(0.05) { 0.2 } else { 0.0 };
                records.push(FitRecord {
                    dataset: format!("d{dataset}"),
                    optimizer: optimizer.to_string(),
                    log_size,
                    replicate: dataset as u32,
                    parameter: parameter.to_string(),
                    value: truth + wander + rng.sample(noise),
                    gradient: rng.gen_range(1e-8..1e-2),
                    min_eigenvalue: rng.gen_range(1e-6..1.0),
                    time: rng.gen_range(0.1..5.0),
                });
            }
        }
    }
    FitTable::new(records)
}

fn benchmark_find_bad(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let mut group = c.benchmark_group("find_bad");
    for size in [4_usize, 16, 64] {
        let values: Vec<f64> = (0..size).map(|_| 1.0 + rng.gen_range(-1e-3..1e-3)).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("cutoff", size), &values, |b, input| {
            let options = DetectorOptions::default();
            b.iter(|| black_box(find_bad_in(black_box(input), &options)))
        });
    }
    group.finish();
}

fn benchmark_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep");
    group.sample_size(20);
    for datasets in [100_usize, 1_000] {
        let table = synthetic_table(datasets);
        group.throughput(Throughput::Elements(table.len() as u64));
        group.bench_with_input(BenchmarkId::new("run_sweep", datasets), &table, |b, input| {
            let options = SweepOptions::default();
            b.iter(|| black_box(run_sweep(black_box(input), &options)))
        });
    }
    group.finish();
}

criterion_group!(sweep_benchmark, benchmark_find_bad, benchmark_sweep);
criterion_main!(sweep_benchmark);
