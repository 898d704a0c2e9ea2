//! Benchmarks for change selection and dependency ordering

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tracksync::provider::memory::InMemoryProvider;
use tracksync::schema::{SyncColumn, SyncRelation, SyncSet, SyncTable, TableRef};
use tracksync::{LocalOrchestrator, SyncOptions, SyncProvision, SyncSetup};

fn customer() -> SyncTable {
    SyncTable::new("Customer")
        .with_key_column(SyncColumn::new("Id", "int"))
        .with_column(SyncColumn::new("Name", "text").nullable())
}

fn bench_select_changes(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let rows = 5_000;

    let mut group = c.benchmark_group("select_changes");
    group.throughput(Throughput::Elements(rows));
    group.sample_size(20);

    for batch_size_kb in [16usize, 256, 5000] {
        let provider = InMemoryProvider::new();
        let options = SyncOptions::default()
            .with_batch_directory(dir.path().join(format!("kb_{}", batch_size_kb)))
            .with_batch_size(batch_size_kb);
        let local = LocalOrchestrator::new(
            Arc::new(provider.clone()),
            SyncSetup::new(["Customer"]),
            options,
        )
        .unwrap();
        let schema = SyncSet::new().with_table(customer());
        rt.block_on(local.provision(&SyncProvision::client_default(), false, Some(&schema)))
            .unwrap();
        for id in 0..rows {
            provider
                .upsert_row("Customer", json!({"Id": id, "Name": format!("customer {}", id)}))
                .unwrap();
        }
        let scope = rt.block_on(local.get_client_scope()).unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}kb", batch_size_kb)),
            &batch_size_kb,
            |b, _| {
                b.iter(|| {
                    rt.block_on(async {
                        let changes = local.get_changes(&scope).await.unwrap();
                        changes.batch_info.remove_directory().await.unwrap();
                        black_box(changes.changes_selected)
                    })
                })
            },
        );
    }

    group.finish();
}

fn bench_dependency_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("dependency_order");

    for count in [10usize, 50, 200] {
        // A chain declared children first, the worst case for the sort
        let mut set = SyncSet::new();
        for index in (0..count).rev() {
            set = set.with_table(
                SyncTable::new(format!("T{}", index)).with_key_column(SyncColumn::new("Id", "int")),
            );
        }
        for index in 1..count {
            set = set.with_relation(
                SyncRelation::new(
                    format!("FK_{}", index),
                    TableRef::new(format!("T{}", index), None),
                    TableRef::new(format!("T{}", index - 1), None),
                )
                .with_keys("ParentId", "Id"),
            );
        }

        group.bench_with_input(BenchmarkId::from_parameter(count), &set, |b, set| {
            b.iter(|| black_box(set.sort_by_dependencies().len()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_select_changes, bench_dependency_order);
criterion_main!(benches);
