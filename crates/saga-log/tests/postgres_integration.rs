//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p saga-log --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;

use futures_util::StreamExt;
use saga_log::{
    AvatarId, CommitCheckpoint, CommitOptions, CommitVersion, PostgresSagaRepository,
    SagaLogError, SagaRef, SagaRepository, SagaRepositoryExt, SequenceNumber, TransactionDraft,
    TransactionKind, TransactionPayload, TransactionQuery, TransactionStatus,
};
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh repository with its own pool and cleared tables
async fn get_test_repository() -> PostgresSagaRepository {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE saga_transactions, saga_instances")
        .execute(&pool)
        .await
        .unwrap();

    PostgresSagaRepository::new(pool)
}

#[tokio::test]
async fn get_or_create_is_stable() {
    let repo = get_test_repository().await;
    let avatar = AvatarId::new();
    let saga = SagaRef::new("sunken_crypt");

    let first = repo.get_or_create_instance(avatar, &saga).await.unwrap();
    let second = repo.get_or_create_instance(avatar, &saga).await.unwrap();
    let shared = repo.get_or_create_shared_instance(&saga).await.unwrap();
    let shared_again = repo.get_or_create_shared_instance(&saga).await.unwrap();

    assert_eq!(first.instance_id(), second.instance_id());
    assert_eq!(first.owner_avatar_id(), Some(avatar));
    assert_eq!(shared.instance_id(), shared_again.instance_id());
    assert_ne!(first.instance_id(), shared.instance_id());
}

#[tokio::test]
async fn append_commit_and_reload() {
    let repo = get_test_repository().await;
    let avatar = AvatarId::new();
    let instance = repo
        .get_or_create_shared_instance(&SagaRef::new("tower"))
        .await
        .unwrap();
    let instance_id = instance.instance_id();

    let discovered = TransactionDraft::new(TransactionPayload::SagaDiscovered).avatar(avatar);
    let loot = TransactionDraft::new(TransactionPayload::loot_awarded("silver_key", 2)).avatar(avatar);
    let ids = [discovered.transaction_id, loot.transaction_id];

    let sequences = repo
        .add_transactions(instance_id, vec![discovered, loot])
        .await
        .unwrap();
    assert_eq!(sequences, vec![SequenceNumber::new(1), SequenceNumber::new(2)]);

    assert!(repo.commit_unchecked(instance_id, &ids).await.unwrap());

    let reloaded = repo.require_instance(instance_id).await.unwrap();
    assert_eq!(reloaded.commit_version(), CommitVersion::new(1));
    assert_eq!(reloaded.next_sequence_number(), SequenceNumber::new(3));
    let committed: Vec<_> = reloaded.committed_transactions().collect();
    assert_eq!(committed.len(), 2);
    assert_eq!(committed[1].payload(), &TransactionPayload::loot_awarded("silver_key", 2));
    assert_eq!(committed[0].avatar_id(), Some(avatar));
}

#[tokio::test]
async fn stale_commit_is_rejected_and_can_be_rolled_back() {
    let repo = get_test_repository().await;
    let instance = repo
        .get_or_create_shared_instance(&SagaRef::new("tower"))
        .await
        .unwrap();
    let instance_id = instance.instance_id();
    let read_version = instance.commit_version();

    let theirs = TransactionDraft::new(TransactionPayload::PlayerEntered);
    let ours = TransactionDraft::new(TransactionPayload::SagaDiscovered);
    let (theirs_id, ours_id) = (theirs.transaction_id, ours.transaction_id);
    repo.add_transactions(instance_id, vec![theirs, ours])
        .await
        .unwrap();
    repo.commit_unchecked(instance_id, &[theirs_id]).await.unwrap();

    let committed = repo
        .commit_transactions(
            instance_id,
            &[ours_id],
            CommitOptions::expect_commit_version(read_version),
        )
        .await
        .unwrap();
    assert!(!committed);

    repo.rollback_transactions(instance_id, &[ours_id])
        .await
        .unwrap();
    let transactions = repo.get_transactions(instance_id).await.unwrap();
    assert_eq!(transactions[1].status(), TransactionStatus::RolledBack);

    let result = repo.commit_unchecked(instance_id, &[ours_id]).await;
    assert!(matches!(
        result,
        Err(SagaLogError::InvalidStatusTransition { .. })
    ));
}

#[tokio::test]
async fn sequence_numbers_survive_rollback() {
    let repo = get_test_repository().await;
    let instance_id = repo
        .get_or_create_shared_instance(&SagaRef::new("tower"))
        .await
        .unwrap()
        .instance_id();

    let first = TransactionDraft::new(TransactionPayload::PlayerEntered);
    let first_id = first.transaction_id;
    repo.add_transaction(instance_id, first).await.unwrap();
    repo.rollback_transactions(instance_id, &[first_id])
        .await
        .unwrap();

    let next = repo
        .add_transaction(
            instance_id,
            TransactionDraft::new(TransactionPayload::PlayerEntered),
        )
        .await
        .unwrap();
    assert_eq!(next, SequenceNumber::new(2));

    let after = repo
        .get_transactions_after_sequence(instance_id, SequenceNumber::new(1))
        .await
        .unwrap();
    assert_eq!(after.len(), 1);
}

#[tokio::test]
async fn query_and_stream_committed() {
    let repo = get_test_repository().await;
    let avatar = AvatarId::new();
    let instance_id = repo
        .get_or_create_instance(avatar, &SagaRef::new("crypt"))
        .await
        .unwrap()
        .instance_id();

    let entered = TransactionDraft::new(TransactionPayload::PlayerEntered).avatar(avatar);
    let discovered = TransactionDraft::new(TransactionPayload::SagaDiscovered).avatar(avatar);
    let discovered_id = discovered.transaction_id;
    repo.add_transactions(instance_id, vec![entered, discovered])
        .await
        .unwrap();
    repo.commit_unchecked(instance_id, &[discovered_id])
        .await
        .unwrap();

    let found = repo
        .query_transactions(
            TransactionQuery::new()
                .saga_ref("crypt")
                .kinds(vec![TransactionKind::SagaDiscovered, TransactionKind::PlayerEntered])
                .avatar_id(avatar)
                .committed(),
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].transaction.transaction_id(), discovered_id);

    let streamed: Vec<_> = repo
        .stream_committed_transactions()
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(streamed.len(), 1);

    let for_avatar = repo.get_all_instances_for_avatar(avatar).await.unwrap();
    assert_eq!(for_avatar.len(), 1);
}

#[tokio::test]
async fn duplicate_transaction_id_is_rejected() {
    let repo = get_test_repository().await;
    let instance_id = repo
        .get_or_create_shared_instance(&SagaRef::new("tower"))
        .await
        .unwrap()
        .instance_id();
    let draft = TransactionDraft::new(TransactionPayload::PlayerEntered);

    repo.add_transaction(instance_id, draft.clone()).await.unwrap();
    let result = repo.add_transaction(instance_id, draft).await;

    assert!(matches!(
        result,
        Err(SagaLogError::DuplicateTransaction { .. })
    ));
}

#[tokio::test]
async fn stream_since_checkpoint_returns_only_new_commits() {
    let repo = get_test_repository().await;
    let instance_id = repo
        .get_or_create_shared_instance(&SagaRef::new("crypt"))
        .await
        .unwrap()
        .instance_id();

    let early = TransactionDraft::new(TransactionPayload::SagaDiscovered);
    let late = TransactionDraft::new(TransactionPayload::PlayerEntered);
    let (early_id, late_id) = (early.transaction_id, late.transaction_id);
    repo.add_transactions(instance_id, vec![early, late])
        .await
        .unwrap();
    repo.commit_unchecked(instance_id, &[late_id]).await.unwrap();

    let mut checkpoint = CommitCheckpoint::new();
    checkpoint.insert(instance_id, CommitVersion::new(1));
    repo.commit_unchecked(instance_id, &[early_id]).await.unwrap();

    let fresh: Vec<_> = repo
        .stream_committed_since(&checkpoint)
        .await
        .unwrap()
        .map(|logged| logged.unwrap())
        .filter(|logged| std::future::ready(logged.instance_id == instance_id))
        .map(|logged| logged.transaction.transaction_id())
        .collect()
        .await;
    assert_eq!(fresh, vec![early_id]);

    checkpoint.insert(instance_id, CommitVersion::new(2));
    let drained = repo
        .stream_committed_since(&checkpoint)
        .await
        .unwrap()
        .filter(|logged| {
            std::future::ready(
                logged
                    .as_ref()
                    .is_ok_and(|logged| logged.instance_id == instance_id),
            )
        })
        .count()
        .await;
    assert_eq!(drained, 0);
}

#[tokio::test]
async fn stored_timestamps_match_assigned_precision() {
    let repo = get_test_repository().await;
    let instance_id = repo
        .get_or_create_shared_instance(&SagaRef::new("crypt"))
        .await
        .unwrap()
        .instance_id();
    repo.add_transaction(
        instance_id,
        TransactionDraft::new(TransactionPayload::PlayerEntered),
    )
    .await
    .unwrap();

    let stored = repo.get_transactions(instance_id).await.unwrap();
    let accepted_at = stored[0].server_timestamp();
    assert_eq!(accepted_at.timestamp_subsec_nanos() % 1_000, 0);

    let at_boundary = repo
        .query_transactions(
            TransactionQuery::for_instance(instance_id)
                .from_timestamp(accepted_at)
                .to_timestamp(accepted_at),
        )
        .await
        .unwrap();
    assert_eq!(at_boundary.len(), 1);
}

#[tokio::test]
async fn shared_instance_lists_only_committed_authors() {
    let repo = get_test_repository().await;
    let avatar = AvatarId::new();
    let instance_id = repo
        .get_or_create_shared_instance(&SagaRef::new("tower"))
        .await
        .unwrap()
        .instance_id();
    repo.add_transaction(
        instance_id,
        TransactionDraft::new(TransactionPayload::PlayerEntered).avatar(avatar),
    )
    .await
    .unwrap();

    assert!(repo.get_all_instances_for_avatar(avatar).await.unwrap().is_empty());
}
