use criterion::{Criterion, criterion_group, criterion_main};
use saga_log::{
    CommitOptions, InMemorySagaRepository, SagaRef, SagaRepository, SagaRepositoryExt,
    TransactionDraft, TransactionPayload, TransactionQuery,
};

fn drafts(count: usize) -> Vec<TransactionDraft> {
    (0..count)
        .map(|_| TransactionDraft::new(TransactionPayload::PlayerEntered))
        .collect()
}

fn bench_append_single(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_log/append_single", |b| {
        b.iter(|| {
            rt.block_on(async {
                let repo = InMemorySagaRepository::new();
                let instance = repo
                    .get_or_create_shared_instance(&SagaRef::new("bench"))
                    .await
                    .unwrap();
                repo.add_transaction(
                    instance.instance_id(),
                    TransactionDraft::new(TransactionPayload::SagaDiscovered),
                )
                .await
                .unwrap();
            });
        });
    });
}

fn bench_append_and_commit_batch_10(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("saga_log/append_and_commit_batch_10", |b| {
        b.iter(|| {
            rt.block_on(async {
                let repo = InMemorySagaRepository::new();
                let instance = repo
                    .get_or_create_shared_instance(&SagaRef::new("bench"))
                    .await
                    .unwrap();
                let batch = drafts(10);
                let ids: Vec<_> = batch.iter().map(|d| d.transaction_id).collect();
                repo.add_transactions(instance.instance_id(), batch)
                    .await
                    .unwrap();
                repo.commit_transactions(
                    instance.instance_id(),
                    &ids,
                    CommitOptions::expect_commit_version(instance.commit_version()),
                )
                .await
                .unwrap();
            });
        });
    });
}

fn bench_query_large_log(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let repo = InMemorySagaRepository::new();
    let instance_id = rt.block_on(async {
        let instance = repo
            .get_or_create_shared_instance(&SagaRef::new("bench"))
            .await
            .unwrap();
        repo.add_transactions(instance.instance_id(), drafts(1000))
            .await
            .unwrap();
        instance.instance_id()
    });

    c.bench_function("saga_log/query_1000_transactions", |b| {
        b.iter(|| {
            rt.block_on(async {
                repo.query_transactions(TransactionQuery::for_instance(instance_id).limit(100))
                    .await
                    .unwrap();
            });
        });
    });
}

criterion_group!(
    benches,
    bench_append_single,
    bench_append_and_commit_batch_10,
    bench_query_large_log,
);
criterion_main!(benches);
