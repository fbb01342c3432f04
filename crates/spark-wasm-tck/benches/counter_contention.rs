use criterion::{BatchSize, Criterion, black_box};
use spark_wasm_core::{RetryPolicy, SharedCounter};
use spark_wasm_tck::SharedStore;
use std::{env, sync::Arc, thread, time::Duration};

/// 共享计数器在无竞争与多线程竞争下的递增成本。
///
/// # 设计背景（Why）
/// - 请求热路径上每个响应都要完成一次 CAS 递增，冲突重试的放大效应需要有基线可比。
///
/// # 逻辑解析（How）
/// - `uncontended`：单线程反复递增同一键；
/// - `contended/4`：四个线程各递增 64 次，统计整批耗时。
fn bench_counter(c: &mut Criterion) {
    c.bench_function("counter/uncontended", |b| {
        let store = SharedStore::new();
        let counter = SharedCounter::default();
        counter
            .initialize(&store, Default::default())
            .expect("initialize");
        b.iter(|| black_box(counter.increment_and_get(&store).expect("increment")));
    });

    c.bench_function("counter/contended/4", |b| {
        b.iter_batched(
            || {
                let store = Arc::new(SharedStore::new());
                let counter = SharedCounter::default().with_retry(RetryPolicy::unbounded());
                counter
                    .initialize(store.as_ref(), Default::default())
                    .expect("initialize");
                (store, counter)
            },
            |(store, counter)| {
                thread::scope(|scope| {
                    for _ in 0..4 {
                        let store = Arc::clone(&store);
                        let counter = counter.clone();
                        scope.spawn(move || {
                            for _ in 0..64 {
                                black_box(
                                    counter
                                        .increment_and_get(store.as_ref())
                                        .expect("increment"),
                                );
                            }
                        });
                    }
                });
                store.mismatches()
            },
            BatchSize::SmallInput,
        );
    });
}

fn main() {
    let mut quick_mode = false;
    for arg in env::args().skip(1) {
        if arg == "--quick" {
            quick_mode = true;
        }
    }

    let mut criterion = Criterion::default();
    if quick_mode {
        criterion = criterion
            .sample_size(10)
            .warm_up_time(Duration::from_millis(100))
            .measurement_time(Duration::from_millis(250));
    }

    bench_counter(&mut criterion);
    criterion.final_summary();
}
