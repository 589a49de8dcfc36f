use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AvatarId, CommitOptions, CommitVersion, InstanceId, InstanceType, Result, SagaInstance,
    SagaLogError, SagaRef, SagaTransaction, SequenceNumber, TransactionDraft, TransactionId,
    TransactionPayload, TransactionQuery, TransactionStatus,
    repository::{
        CommitCheckpoint, LoggedTransaction, SagaRepository, TransactionStream, record_commit,
    },
};

const INSTANCE_COLUMNS: &str =
    "id, saga_ref, instance_type, owner_avatar_id, next_sequence_number, commit_version, created_at";

const TRANSACTION_COLUMNS: &str = "t.id, t.instance_id, i.saga_ref, t.sequence_number, t.kind, \
     t.avatar_id, t.local_timestamp, t.server_timestamp, t.status, t.committed_in, t.payload";

/// PostgreSQL-backed saga repository.
///
/// Appends, commits and rollbacks lock the instance row with
/// `SELECT ... FOR UPDATE` for the duration of one database transaction, so
/// concurrent writers to the same instance are serialized.
#[derive(Clone)]
pub struct PostgresSagaRepository {
    pool: PgPool,
}

impl PostgresSagaRepository {
    /// Creates a new PostgreSQL saga repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_transaction(row: &PgRow) -> Result<SagaTransaction> {
        let kind: String = row.try_get("kind")?;
        let payload = TransactionPayload::decode(&kind, row.try_get("payload")?)?;

        let status: String = row.try_get("status")?;
        let status = TransactionStatus::parse(&status)
            .ok_or_else(|| SagaLogError::CorruptRecord(format!("unknown status {status}")))?;

        Ok(SagaTransaction::restore(
            TransactionId::from_uuid(row.try_get::<Uuid, _>("id")?),
            row.try_get::<Option<Uuid>, _>("avatar_id")?
                .map(AvatarId::from_uuid),
            row.try_get("local_timestamp")?,
            row.try_get("server_timestamp")?,
            SequenceNumber::new(from_db(row.try_get("sequence_number")?)?),
            status,
            row.try_get::<Option<i64>, _>("committed_in")?
                .map(from_db)
                .transpose()?
                .map(CommitVersion::new),
            payload,
        ))
    }

    fn row_to_logged(row: PgRow) -> Result<LoggedTransaction> {
        Ok(LoggedTransaction {
            instance_id: InstanceId::from_uuid(row.try_get::<Uuid, _>("instance_id")?),
            saga_ref: SagaRef::new(row.try_get::<String, _>("saga_ref")?),
            transaction: Self::row_to_transaction(&row)?,
        })
    }

    /// Loads an instance with its whole log, optionally locking the instance row.
    async fn load_instance(
        conn: &mut PgConnection,
        instance_id: InstanceId,
        for_update: bool,
    ) -> Result<Option<SagaInstance>> {
        let sql = format!(
            "SELECT {INSTANCE_COLUMNS} FROM saga_instances WHERE id = $1{}",
            if for_update { " FOR UPDATE" } else { "" }
        );
        let Some(row) = sqlx::query(&sql)
            .bind(instance_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await?
        else {
            return Ok(None);
        };

        let transactions = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM saga_transactions t \
             JOIN saga_instances i ON i.id = t.instance_id \
             WHERE t.instance_id = $1 ORDER BY t.sequence_number ASC"
        ))
        .bind(instance_id.as_uuid())
        .fetch_all(&mut *conn)
        .await?
        .iter()
        .map(Self::row_to_transaction)
        .collect::<Result<Vec<_>>>()?;

        let instance_type: String = row.try_get("instance_type")?;
        let instance_type = InstanceType::parse(&instance_type).ok_or_else(|| {
            SagaLogError::CorruptRecord(format!("unknown instance type {instance_type}"))
        })?;

        Ok(Some(SagaInstance::restore(
            instance_id,
            SagaRef::new(row.try_get::<String, _>("saga_ref")?),
            instance_type,
            row.try_get::<Option<Uuid>, _>("owner_avatar_id")?
                .map(AvatarId::from_uuid),
            row.try_get::<DateTime<Utc>, _>("created_at")?,
            transactions,
            SequenceNumber::new(from_db(row.try_get("next_sequence_number")?)?),
            CommitVersion::new(from_db(row.try_get("commit_version")?)?),
        )))
    }

    async fn load_locked(conn: &mut PgConnection, instance_id: InstanceId) -> Result<SagaInstance> {
        Self::load_instance(conn, instance_id, true)
            .await?
            .ok_or(SagaLogError::InstanceNotFound(instance_id))
    }

    async fn insert_instance(&self, instance: &SagaInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_instances (id, saga_ref, instance_type, owner_avatar_id, next_sequence_number, commit_version, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(instance.instance_id().as_uuid())
        .bind(instance.saga_ref().as_str())
        .bind(instance.instance_type().as_str())
        .bind(instance.owner_avatar_id().map(|id| id.as_uuid()))
        .bind(to_db(instance.next_sequence_number().as_u64())?)
        .bind(to_db(instance.commit_version().as_u64())?)
        .bind(instance.created_at())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_by_id(&self, instance_id: InstanceId) -> Result<Option<SagaInstance>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_instance(&mut conn, instance_id, false).await
    }

    /// Writes the status of the given transactions back from the in-memory instance.
    async fn persist_statuses(
        conn: &mut PgConnection,
        instance: &SagaInstance,
        transaction_ids: &[TransactionId],
    ) -> Result<()> {
        for &transaction_id in transaction_ids {
            let Some(tx) = instance.transaction(transaction_id) else {
                continue;
            };
            sqlx::query(
                "UPDATE saga_transactions SET status = $1, committed_in = $2 WHERE id = $3 AND status = 'Pending'",
            )
            .bind(tx.status().as_str())
            .bind(tx.committed_in().map(|v| to_db(v.as_u64())).transpose()?)
            .bind(transaction_id.as_uuid())
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SagaRepository for PostgresSagaRepository {
    #[tracing::instrument(skip(self))]
    async fn get_or_create_instance(
        &self,
        avatar_id: AvatarId,
        saga_ref: &SagaRef,
    ) -> Result<SagaInstance> {
        self.insert_instance(&SagaInstance::single_player(avatar_id, saga_ref.clone()))
            .await?;

        let instance_id: Uuid = sqlx::query_scalar(
            r#"
            SELECT id FROM saga_instances
            WHERE instance_type = 'SinglePlayer' AND owner_avatar_id = $1 AND saga_ref = $2
            "#,
        )
        .bind(avatar_id.as_uuid())
        .bind(saga_ref.as_str())
        .fetch_one(&self.pool)
        .await?;

        let instance_id = InstanceId::from_uuid(instance_id);
        self.fetch_by_id(instance_id)
            .await?
            .ok_or(SagaLogError::InstanceNotFound(instance_id))
    }

    #[tracing::instrument(skip(self))]
    async fn get_or_create_shared_instance(&self, saga_ref: &SagaRef) -> Result<SagaInstance> {
        self.insert_instance(&SagaInstance::shared(saga_ref.clone()))
            .await?;

        let instance_id: Uuid = sqlx::query_scalar(
            "SELECT id FROM saga_instances WHERE instance_type = 'SharedMultiplayer' AND saga_ref = $1",
        )
        .bind(saga_ref.as_str())
        .fetch_one(&self.pool)
        .await?;

        let instance_id = InstanceId::from_uuid(instance_id);
        self.fetch_by_id(instance_id)
            .await?
            .ok_or(SagaLogError::InstanceNotFound(instance_id))
    }

    async fn get_instance_by_id(&self, instance_id: InstanceId) -> Result<Option<SagaInstance>> {
        self.fetch_by_id(instance_id).await
    }

    #[tracing::instrument(skip(self, drafts), fields(count = drafts.len()))]
    async fn add_transactions(
        &self,
        instance_id: InstanceId,
        drafts: Vec<TransactionDraft>,
    ) -> Result<Vec<SequenceNumber>> {
        let mut db_tx = self.pool.begin().await?;
        let mut instance = Self::load_locked(&mut db_tx, instance_id).await?;
        let last_existing =
            SequenceNumber::new(instance.next_sequence_number().as_u64().saturating_sub(1));
        let sequences = instance.add_transactions(drafts)?;

        for tx in instance.transactions_after(last_existing) {
            sqlx::query(
                r#"
                INSERT INTO saga_transactions (id, instance_id, sequence_number, kind, avatar_id, local_timestamp, server_timestamp, status, committed_in, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NULL, $9)
                "#,
            )
            .bind(tx.transaction_id().as_uuid())
            .bind(instance_id.as_uuid())
            .bind(to_db(tx.sequence_number().as_u64())?)
            .bind(tx.kind().as_str())
            .bind(tx.avatar_id().map(|id| id.as_uuid()))
            .bind(tx.local_timestamp())
            .bind(tx.server_timestamp())
            .bind(tx.status().as_str())
            .bind(tx.payload().encode_data()?)
            .execute(&mut *db_tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.is_unique_violation()
                {
                    return SagaLogError::DuplicateTransaction {
                        instance_id,
                        transaction_id: tx.transaction_id(),
                    };
                }
                SagaLogError::Database(e)
            })?;
        }

        sqlx::query("UPDATE saga_instances SET next_sequence_number = $1 WHERE id = $2")
            .bind(to_db(instance.next_sequence_number().as_u64())?)
            .bind(instance_id.as_uuid())
            .execute(&mut *db_tx)
            .await?;

        db_tx.commit().await?;
        Ok(sequences)
    }

    async fn get_transactions(&self, instance_id: InstanceId) -> Result<Vec<SagaTransaction>> {
        let instance = self
            .fetch_by_id(instance_id)
            .await?
            .ok_or(SagaLogError::InstanceNotFound(instance_id))?;
        Ok(instance.transactions().to_vec())
    }

    async fn get_transactions_after_sequence(
        &self,
        instance_id: InstanceId,
        sequence: SequenceNumber,
    ) -> Result<Vec<SagaTransaction>> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM saga_instances WHERE id = $1)")
                .bind(instance_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        if !exists {
            return Err(SagaLogError::InstanceNotFound(instance_id));
        }

        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM saga_transactions t \
             JOIN saga_instances i ON i.id = t.instance_id \
             WHERE t.instance_id = $1 AND t.sequence_number > $2 \
             ORDER BY t.sequence_number ASC"
        ))
        .bind(instance_id.as_uuid())
        .bind(to_db(sequence.as_u64())?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    #[tracing::instrument(skip(self, transaction_ids), fields(count = transaction_ids.len()))]
    async fn commit_transactions(
        &self,
        instance_id: InstanceId,
        transaction_ids: &[TransactionId],
        options: CommitOptions,
    ) -> Result<bool> {
        let mut db_tx = self.pool.begin().await?;
        let mut instance = Self::load_locked(&mut db_tx, instance_id).await?;
        let version_before = instance.commit_version();

        let committed = instance.commit(transaction_ids, &options)?;
        if committed && instance.commit_version() != version_before {
            Self::persist_statuses(&mut db_tx, &instance, transaction_ids).await?;
            sqlx::query("UPDATE saga_instances SET commit_version = $1 WHERE id = $2")
                .bind(to_db(instance.commit_version().as_u64())?)
                .bind(instance_id.as_uuid())
                .execute(&mut *db_tx)
                .await?;
        }

        db_tx.commit().await?;
        record_commit(instance_id, committed);
        Ok(committed)
    }

    #[tracing::instrument(skip(self, transaction_ids), fields(count = transaction_ids.len()))]
    async fn rollback_transactions(
        &self,
        instance_id: InstanceId,
        transaction_ids: &[TransactionId],
    ) -> Result<()> {
        let mut db_tx = self.pool.begin().await?;
        let mut instance = Self::load_locked(&mut db_tx, instance_id).await?;
        instance.rollback(transaction_ids)?;
        Self::persist_statuses(&mut db_tx, &instance, transaction_ids).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn get_all_instances_for_avatar(&self, avatar_id: AvatarId) -> Result<Vec<SagaInstance>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT i.id FROM saga_instances i
            WHERE (i.instance_type = 'SinglePlayer' AND i.owner_avatar_id = $1)
               OR (i.instance_type = 'SharedMultiplayer' AND EXISTS (
                    SELECT 1 FROM saga_transactions t WHERE t.instance_id = i.id AND t.avatar_id = $1 AND t.status = 'Committed'
               ))
            ORDER BY i.created_at ASC, i.id ASC
            "#,
        )
        .bind(avatar_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let mut conn = self.pool.acquire().await?;
        let mut instances = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(instance) =
                Self::load_instance(&mut conn, InstanceId::from_uuid(id), false).await?
            {
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    async fn query_transactions(&self, query: TransactionQuery) -> Result<Vec<LoggedTransaction>> {
        let mut sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM saga_transactions t \
             JOIN saga_instances i ON i.id = t.instance_id WHERE 1=1"
        );
        let mut param_count = 0;

        // Build dynamic query
        if query.instance_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND t.instance_id = ${param_count}"));
        }
        if query.saga_ref.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND i.saga_ref = ${param_count}"));
        }
        if query.kinds.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND t.kind = ANY(${param_count})"));
        }
        if query.avatar_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND t.avatar_id = ${param_count}"));
        }
        if query.status.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND t.status = ${param_count}"));
        }
        if query.from_sequence.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND t.sequence_number >= ${param_count}"));
        }
        if query.to_sequence.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND t.sequence_number <= ${param_count}"));
        }
        if query.from_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND t.server_timestamp >= ${param_count}"));
        }
        if query.to_timestamp.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND t.server_timestamp <= ${param_count}"));
        }

        sql.push_str(" ORDER BY i.created_at ASC, i.id ASC, t.sequence_number ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }
        if query.offset.is_some() {
            param_count += 1;
            sql.push_str(&format!(" OFFSET ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(id) = query.instance_id {
            sqlx_query = sqlx_query.bind(id.as_uuid());
        }
        if let Some(saga_ref) = query.saga_ref {
            sqlx_query = sqlx_query.bind(saga_ref.as_str().to_string());
        }
        if let Some(kinds) = query.kinds {
            let kinds: Vec<String> = kinds.iter().map(|k| k.as_str().to_string()).collect();
            sqlx_query = sqlx_query.bind(kinds);
        }
        if let Some(avatar_id) = query.avatar_id {
            sqlx_query = sqlx_query.bind(avatar_id.as_uuid());
        }
        if let Some(status) = query.status {
            sqlx_query = sqlx_query.bind(status.as_str());
        }
        if let Some(from) = query.from_sequence {
            sqlx_query = sqlx_query.bind(to_db(from.as_u64())?);
        }
        if let Some(to) = query.to_sequence {
            sqlx_query = sqlx_query.bind(to_db(to.as_u64())?);
        }
        if let Some(from_ts) = query.from_timestamp {
            sqlx_query = sqlx_query.bind(from_ts);
        }
        if let Some(to_ts) = query.to_timestamp {
            sqlx_query = sqlx_query.bind(to_ts);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }
        if let Some(offset) = query.offset {
            sqlx_query = sqlx_query.bind(offset as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_logged).collect()
    }

    async fn stream_committed_transactions(&self) -> Result<TransactionStream> {
        use futures_util::stream;

        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM saga_transactions t \
             JOIN saga_instances i ON i.id = t.instance_id \
             WHERE t.status = 'Committed' \
             ORDER BY i.created_at ASC, i.id ASC, t.sequence_number ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        let stream = stream::iter(rows.into_iter().map(Self::row_to_logged));
        Ok(Box::pin(stream))
    }

    async fn stream_committed_since(
        &self,
        checkpoint: &CommitCheckpoint,
    ) -> Result<TransactionStream> {
        use futures_util::stream;

        let mut instance_ids = Vec::with_capacity(checkpoint.len());
        let mut versions = Vec::with_capacity(checkpoint.len());
        for (instance_id, version) in checkpoint {
            instance_ids.push(instance_id.as_uuid());
            versions.push(to_db(version.as_u64())?);
        }

        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM saga_transactions t \
             JOIN saga_instances i ON i.id = t.instance_id \
             LEFT JOIN UNNEST($1::uuid[], $2::bigint[]) AS seen(instance_id, commit_version) \
               ON seen.instance_id = i.id \
             WHERE t.status = 'Committed' \
               AND i.commit_version > COALESCE(seen.commit_version, 0) \
               AND t.committed_in > COALESCE(seen.commit_version, 0) \
             ORDER BY i.created_at ASC, i.id ASC, t.sequence_number ASC"
        ))
        .bind(instance_ids)
        .bind(versions)
        .fetch_all(&self.pool)
        .await?;

        let stream = stream::iter(rows.into_iter().map(Self::row_to_logged));
        Ok(Box::pin(stream))
    }
}

fn to_db(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| SagaLogError::CounterOutOfRange(value))
}

fn from_db(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| SagaLogError::CorruptRecord(format!("negative counter {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_beyond_bigint_are_rejected() {
        assert_eq!(to_db(42).unwrap(), 42);
        assert_eq!(to_db(i64::MAX as u64).unwrap(), i64::MAX);
        assert!(matches!(
            to_db(u64::MAX),
            Err(SagaLogError::CounterOutOfRange(u64::MAX))
        ));
    }

    #[test]
    fn negative_counters_are_corrupt() {
        assert_eq!(from_db(7).unwrap(), 7);
        assert!(matches!(from_db(-1), Err(SagaLogError::CorruptRecord(_))));
    }
}
