use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8Path;
use libsql::{Connection, Row, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::storage::{
    ClaimRecord, InstanceRecord, StorageError, X25519_KEY_LEN, generate_claim_code, normalize_claim_code,
};

/// Collision retries when minting a claim code.
const CODE_RETRIES: usize = 5;

/// libSQL-backed store for instances and claims.
///
/// Writes are serialized by SQLite; reads don't block. The connection is
/// cheap to clone and shared across tasks. Migration state lives in
/// `PRAGMA user_version`, one integer at a fixed offset in the file.
#[derive(Clone)]
pub struct RelayStore {
    conn: Connection,
}

impl RelayStore {
    pub async fn open(path: &Utf8Path) -> Result<Self, StorageError> {
        let db = libsql::Builder::new_local(path.as_std_path())
            .build()
            .await?;
        let conn = db.connect()?;
        Ok(Self { conn })
    }

    pub async fn in_memory() -> Result<Self, StorageError> {
        let db = libsql::Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;
        let store = Self { conn };
        store.setup().await?;
        Ok(store)
    }

    pub async fn setup(&self) -> Result<(), StorageError> {
        self.apply_pragmas().await?;
        self.migrate().await?;
        Ok(())
    }

    async fn apply_pragmas(&self) -> Result<(), StorageError> {
        const PRAGMAS: &str = "
            -- WAL keeps readers unblocked while the sweep or a register writes.
            PRAGMA journal_mode = WAL;

            -- WAL mode is safe from corruption with synchronous = NORMAL.
            PRAGMA synchronous = NORMAL;

            -- Wait for a locked resource instead of failing with SQLITE_BUSY.
            PRAGMA busy_timeout = 15000;

            -- 3MB page cache; the hot set (instances + live claims) is small.
            PRAGMA cache_size = -3000;

            PRAGMA auto_vacuum = INCREMENTAL;

            PRAGMA temp_store = MEMORY;
        ";

        trace!(sql_query = %PRAGMAS, "PRAGMAs query");

        let mut batch_rows = self.conn.execute_batch(PRAGMAS).await?;

        while let Some(rows) = batch_rows.next_stmt_row() {
            let Some(mut rows) = rows else {
                continue;
            };

            while let Ok(Some(row)) = rows.next().await {
                trace!(?row, "PRAGMA row");
            }
        }

        Ok(())
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        let user_version = self.query_user_version().await?;

        match MIGRATIONS.get(user_version..) {
            Some(remaining) if !remaining.is_empty() => {
                info!(
                    user_version,
                    migration_count = MIGRATIONS.len() - user_version,
                    "Start migration"
                );

                for (sql_query, migration_id) in remaining.iter().zip(user_version..MIGRATIONS.len()) {
                    trace!(migration_id, %sql_query, "Apply migration");

                    self.conn.execute_batch(sql_query).await?;

                    self.update_user_version(migration_id + 1).await?;
                }

                info!("Migration complete");
            }
            None => {
                warn!(user_version, "user_version is set to an unexpected value");
            }
            _ => {
                debug!(user_version, "Database is already up to date");
            }
        }

        Ok(())
    }

    async fn query_user_version(&self) -> Result<usize, StorageError> {
        let sql_query = "PRAGMA user_version";

        trace!(%sql_query, "Query user_version");

        let row = self
            .conn
            .query(sql_query, ())
            .await?
            .next()
            .await?
            .ok_or_else(|| StorageError::BadRecord {
                source: anyhow::anyhow!("PRAGMA user_version returned no row"),
            })?;

        let value = row.get::<u64>(0).map_err(|source| StorageError::BadRecord {
            source: anyhow::Error::new(source).context("user_version"),
        })?;

        Ok(usize::try_from(value).expect("number not too big"))
    }

    async fn update_user_version(&self, value: usize) -> Result<(), StorageError> {
        let sql_query = format!("PRAGMA user_version = {value}");

        trace!(%sql_query, "Update user_version");

        self.conn.execute(&sql_query, ()).await?;

        Ok(())
    }

    // ----- instances ----- //

    /// Registers or re-registers an instance.
    ///
    /// Idempotent as long as the public key matches the stored one; a
    /// mismatch means key rotation or id reuse and is refused. A fresh
    /// token digest replaces the old one on every successful call.
    pub async fn register_instance(
        &self,
        instance_id: Uuid,
        public_key: &[u8],
        direct_urls: &[String],
        token_digest: &str,
    ) -> Result<InstanceRecord, StorageError> {
        if public_key.len() != X25519_KEY_LEN {
            return Err(StorageError::InvalidPublicKey);
        }

        let sql_query = "INSERT INTO instances (instance_id, public_key, direct_urls, token_digest)
            VALUES (:instance_id, :public_key, :direct_urls, :token_digest)
            ON CONFLICT (instance_id) DO UPDATE SET
                token_digest = excluded.token_digest,
                direct_urls = excluded.direct_urls,
                last_seen_at = MAX(last_seen_at, unixepoch())
            WHERE instances.public_key = excluded.public_key";

        let params = (
            (":instance_id", instance_id.to_string()),
            (":public_key", public_key.to_vec()),
            (":direct_urls", encode_urls(direct_urls)?),
            (":token_digest", token_digest.to_owned()),
        );

        trace!(%sql_query, %instance_id, "Register instance");

        let changed_count = self.conn.execute(sql_query, params).await?;

        if changed_count == 0 {
            // The upsert's WHERE clause rejected the row: same id, other key.
            return Err(StorageError::Conflict);
        }

        self.get_instance(instance_id).await
    }

    /// Refreshes `last_seen_at` (monotonically non-decreasing) and,
    /// optionally, the advertised direct URLs.
    pub async fn heartbeat(
        &self,
        instance_id: Uuid,
        direct_urls: Option<&[String]>,
    ) -> Result<InstanceRecord, StorageError> {
        let changed_count = match direct_urls {
            Some(direct_urls) => {
                let sql_query = "UPDATE instances
                    SET last_seen_at = MAX(last_seen_at, unixepoch()), direct_urls = :direct_urls
                    WHERE instance_id = :instance_id";

                let params = (
                    (":direct_urls", encode_urls(direct_urls)?),
                    (":instance_id", instance_id.to_string()),
                );

                trace!(%sql_query, %instance_id, "Heartbeat with direct_urls");

                self.conn.execute(sql_query, params).await?
            }
            None => {
                let sql_query = "UPDATE instances
                    SET last_seen_at = MAX(last_seen_at, unixepoch())
                    WHERE instance_id = $1";

                let params = [instance_id.to_string()];

                trace!(%sql_query, %instance_id, "Heartbeat");

                self.conn.execute(sql_query, params).await?
            }
        };

        if changed_count == 0 {
            return Err(StorageError::NotFound);
        }

        self.get_instance(instance_id).await
    }

    pub async fn get_instance(&self, instance_id: Uuid) -> Result<InstanceRecord, StorageError> {
        let sql_query = "SELECT instance_id, public_key, direct_urls, token_digest, last_seen_at, online, created_at, updated_at
            FROM instances WHERE instance_id = $1";

        let params = [instance_id.to_string()];

        trace!(%sql_query, %instance_id, "Get instance");

        let row = self
            .conn
            .query(sql_query, params)
            .await?
            .next()
            .await?
            .ok_or(StorageError::NotFound)?;

        instance_from_row(&row)
    }

    pub async fn set_online(&self, instance_id: Uuid, online: bool) -> Result<(), StorageError> {
        let sql_query = "UPDATE instances
            SET online = :online, last_seen_at = MAX(last_seen_at, unixepoch())
            WHERE instance_id = :instance_id";

        let params = ((":online", i64::from(online)), (":instance_id", instance_id.to_string()));

        trace!(%sql_query, %instance_id, online, "Set online flag");

        let changed_count = self.conn.execute(sql_query, params).await?;

        if changed_count == 0 {
            return Err(StorageError::NotFound);
        }

        Ok(())
    }

    pub async fn mark_offline(&self, instance_id: Uuid) -> Result<(), StorageError> {
        // Going offline must not refresh the presence timestamp.
        let sql_query = "UPDATE instances SET online = 0 WHERE instance_id = $1";

        let params = [instance_id.to_string()];

        trace!(%sql_query, %instance_id, "Mark offline");

        let changed_count = self.conn.execute(sql_query, params).await?;

        if changed_count == 0 {
            return Err(StorageError::NotFound);
        }

        Ok(())
    }

    /// Marks instances offline whose presence went stale; returns how many.
    pub async fn sweep_stale(&self, stale_after: Duration) -> Result<u64, StorageError> {
        let sql_query = "UPDATE instances
            SET online = 0
            WHERE online = 1 AND last_seen_at < unixepoch() - $1";

        let params = [as_i64(stale_after)];

        trace!(%sql_query, ?params, "Sweep stale instances");

        let offline_count = self.conn.execute(sql_query, params).await?;

        Ok(offline_count)
    }

    // ----- claims ----- //

    /// Mints a claim for `(instance, user)`.
    ///
    /// Codes are drawn from the OS RNG; a collision with a live code retries
    /// up to five times before giving up.
    pub async fn create_claim(
        &self,
        instance_id: Uuid,
        user_id: &str,
        ttl: Duration,
    ) -> Result<ClaimRecord, StorageError> {
        let sql_query = "INSERT INTO claims (id, code, instance_id, user_id, expires_at)
            VALUES (:id, :code, :instance_id, :user_id, :expires_at)";

        for _ in 0..CODE_RETRIES {
            let id = Uuid::new_v4();
            let code = generate_claim_code();
            let now = OffsetDateTime::now_utc();
            let expires_at = now + ttl;

            let params = (
                (":id", id.to_string()),
                (":code", code.clone()),
                (":instance_id", instance_id.to_string()),
                (":user_id", user_id.to_owned()),
                (":expires_at", expires_at.unix_timestamp()),
            );

            trace!(%sql_query, %instance_id, "Create claim");

            match self.conn.execute(sql_query, params).await {
                Ok(_) => {
                    return Ok(ClaimRecord {
                        id,
                        code,
                        instance_id,
                        user_id: user_id.to_owned(),
                        expires_at,
                        consumed_at: None,
                        device_id: None,
                        created_at: now,
                    });
                }
                Err(error) if is_unique_violation(&error) => {
                    debug!(%instance_id, "Claim code collision, retrying");
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(StorageError::CodeSpaceExhausted)
    }

    /// Looks a claim up by code without consuming it.
    ///
    /// Distinguishes the three failure shapes the pairing UX needs:
    /// `NotFound` (no such code), `Expired` (sweep hasn't removed it yet)
    /// and `AlreadyConsumed` (terminal).
    pub async fn redeem_claim(&self, code: &str) -> Result<ClaimRecord, StorageError> {
        let code = normalize_claim_code(code);

        // Consumed claims free their code for reuse, so prefer a live row.
        let sql_query = "SELECT id, code, instance_id, user_id, expires_at, consumed_at, device_id, created_at
            FROM claims WHERE code = $1
            ORDER BY (consumed_at IS NULL) DESC, created_at DESC
            LIMIT 1";

        let params = [code];

        trace!(%sql_query, "Redeem claim");

        let row = self
            .conn
            .query(sql_query, params)
            .await?
            .next()
            .await?
            .ok_or(StorageError::NotFound)?;

        let claim = claim_from_row(&row)?;

        if claim.is_consumed() {
            return Err(StorageError::AlreadyConsumed);
        }

        if claim.is_expired_at(OffsetDateTime::now_utc()) {
            return Err(StorageError::Expired);
        }

        Ok(claim)
    }

    /// Terminal consume; succeeds at most once per claim.
    ///
    /// The update is a single atomic write keyed on
    /// `(id, instance_id, consumed_at IS NULL)`; losers of the race get the
    /// precise reason from a follow-up read.
    pub async fn consume_claim(
        &self,
        auth_instance_id: Uuid,
        claim_id: Uuid,
        device_id: &str,
    ) -> Result<(), StorageError> {
        let sql_query = "UPDATE claims
            SET consumed_at = unixepoch(), device_id = :device_id
            WHERE id = :id AND instance_id = :instance_id AND consumed_at IS NULL";

        let params = (
            (":device_id", device_id.to_owned()),
            (":id", claim_id.to_string()),
            (":instance_id", auth_instance_id.to_string()),
        );

        trace!(%sql_query, %claim_id, "Consume claim");

        let changed_count = self.conn.execute(sql_query, params).await?;

        if changed_count == 1 {
            return Ok(());
        }

        // Nothing changed: figure out which precondition failed.
        let sql_query = "SELECT id, code, instance_id, user_id, expires_at, consumed_at, device_id, created_at
            FROM claims WHERE id = $1";

        let params = [claim_id.to_string()];

        let row = self
            .conn
            .query(sql_query, params)
            .await?
            .next()
            .await?
            .ok_or(StorageError::NotFound)?;

        let claim = claim_from_row(&row)?;

        if claim.instance_id != auth_instance_id {
            return Err(StorageError::NotOwner);
        }

        Err(StorageError::AlreadyConsumed)
    }

    /// Deletes claims that expired (or were consumed) at least `grace` ago.
    pub async fn cleanup_claims(&self, grace: Duration) -> Result<u64, StorageError> {
        let sql_query = "DELETE FROM claims
            WHERE expires_at <= unixepoch() - $1
               OR (consumed_at IS NOT NULL AND consumed_at <= unixepoch() - $1)";

        let params = [as_i64(grace)];

        trace!(%sql_query, ?params, "Cleanup claims");

        let deleted_count = self.conn.execute(sql_query, params).await?;

        Ok(deleted_count)
    }
}

fn as_i64(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

fn encode_urls(direct_urls: &[String]) -> Result<String, StorageError> {
    serde_json::to_string(direct_urls).map_err(|source| StorageError::BadRecord {
        source: anyhow::Error::new(source).context("direct_urls"),
    })
}

fn is_unique_violation(error: &libsql::Error) -> bool {
    error.to_string().contains("UNIQUE constraint failed")
}

fn instance_from_row(row: &Row) -> Result<InstanceRecord, StorageError> {
    Ok(InstanceRecord {
        instance_id: uuid_at(row, 0)?,
        public_key: blob_at(row, 1)?,
        direct_urls: urls_at(row, 2)?,
        token_digest: text_at(row, 3)?,
        last_seen_at: timestamp_at(row, 4)?,
        online: integer_at(row, 5)? != 0,
        created_at: timestamp_at(row, 6)?,
        updated_at: timestamp_at(row, 7)?,
    })
}

fn claim_from_row(row: &Row) -> Result<ClaimRecord, StorageError> {
    let consumed_at = match value_at(row, 5)? {
        Value::Null => None,
        Value::Integer(unix) => Some(timestamp_from_unix(unix)?),
        other => return Err(bad_record(5, &other)),
    };

    let device_id = match value_at(row, 6)? {
        Value::Null => None,
        Value::Text(text) => Some(text),
        other => return Err(bad_record(6, &other)),
    };

    Ok(ClaimRecord {
        id: uuid_at(row, 0)?,
        code: text_at(row, 1)?,
        instance_id: uuid_at(row, 2)?,
        user_id: text_at(row, 3)?,
        expires_at: timestamp_at(row, 4)?,
        consumed_at,
        device_id,
        created_at: timestamp_at(row, 7)?,
    })
}

// ----- row decoding helpers ----- //

fn value_at(row: &Row, idx: i32) -> Result<Value, StorageError> {
    row.get_value(idx).map_err(|source| StorageError::BadRecord {
        source: anyhow::Error::new(source).context(format!("column {idx}")),
    })
}

fn bad_record(idx: i32, value: &Value) -> StorageError {
    StorageError::BadRecord {
        source: anyhow::anyhow!("unexpected value {value:?} in column {idx}"),
    }
}

fn text_at(row: &Row, idx: i32) -> Result<String, StorageError> {
    match value_at(row, idx)? {
        Value::Text(text) => Ok(text),
        other => Err(bad_record(idx, &other)),
    }
}

fn integer_at(row: &Row, idx: i32) -> Result<i64, StorageError> {
    match value_at(row, idx)? {
        Value::Integer(integer) => Ok(integer),
        other => Err(bad_record(idx, &other)),
    }
}

fn blob_at(row: &Row, idx: i32) -> Result<Vec<u8>, StorageError> {
    match value_at(row, idx)? {
        Value::Blob(blob) => Ok(blob),
        other => Err(bad_record(idx, &other)),
    }
}

fn uuid_at(row: &Row, idx: i32) -> Result<Uuid, StorageError> {
    let text = text_at(row, idx)?;
    Uuid::parse_str(&text).map_err(|source| StorageError::BadRecord {
        source: anyhow::Error::new(source).context(format!("column {idx}")),
    })
}

fn urls_at(row: &Row, idx: i32) -> Result<Vec<String>, StorageError> {
    let text = text_at(row, idx)?;
    serde_json::from_str(&text).map_err(|source| StorageError::BadRecord {
        source: anyhow::Error::new(source).context(format!("column {idx}")),
    })
}

fn timestamp_at(row: &Row, idx: i32) -> Result<OffsetDateTime, StorageError> {
    timestamp_from_unix(integer_at(row, idx)?)
}

fn timestamp_from_unix(unix: i64) -> Result<OffsetDateTime, StorageError> {
    OffsetDateTime::from_unix_timestamp(unix).map_err(|source| StorageError::BadRecord {
        source: anyhow::Error::new(source).context("timestamp"),
    })
}

// Migrations are append-only once released.
const MIGRATIONS: &[&str] = &[
    // Migration 0
    "CREATE TABLE instances (
        instance_id TEXT NOT NULL PRIMARY KEY,
        public_key BLOB NOT NULL,
        direct_urls TEXT NOT NULL,
        token_digest TEXT NOT NULL,
        last_seen_at INT NOT NULL DEFAULT (unixepoch()),
        online INT NOT NULL DEFAULT 0,
        created_at INT NOT NULL DEFAULT (unixepoch()),
        updated_at INT NOT NULL DEFAULT (unixepoch())
    ) STRICT;

    CREATE TRIGGER update_instance_updated_at_on_update AFTER UPDATE ON instances
    BEGIN
        UPDATE instances SET updated_at = unixepoch() WHERE instance_id == NEW.instance_id;
    END;

    CREATE INDEX idx_instances_last_seen_online ON instances(last_seen_at) WHERE online = 1;

    CREATE TABLE claims (
        id TEXT NOT NULL PRIMARY KEY,
        code TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        expires_at INT NOT NULL,
        consumed_at INT,
        device_id TEXT,
        created_at INT NOT NULL DEFAULT (unixepoch())
    ) STRICT;

    -- Codes are unique among claims that can still be consumed.
    CREATE UNIQUE INDEX idx_claims_code_active ON claims(code) WHERE consumed_at IS NULL;
    CREATE INDEX idx_claims_expires_at ON claims(expires_at);",
];

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const PUBLIC_KEY: [u8; 32] = [7u8; 32];

    async fn store() -> RelayStore {
        RelayStore::in_memory().await.unwrap()
    }

    fn urls() -> Vec<String> {
        vec!["https://host:4443".to_owned()]
    }

    #[tokio::test]
    async fn register_is_idempotent_for_a_matching_key() {
        let store = store().await;
        let instance_id = Uuid::new_v4();

        let first = store
            .register_instance(instance_id, &PUBLIC_KEY, &urls(), "digest-1")
            .await
            .unwrap();
        let second = store
            .register_instance(instance_id, &PUBLIC_KEY, &urls(), "digest-2")
            .await
            .unwrap();

        assert_eq!(first.instance_id, second.instance_id);
        assert_eq!(first.public_key, second.public_key);
        // A fresh token digest replaces the old one.
        assert_eq!(second.token_digest, "digest-2");
    }

    #[tokio::test]
    async fn register_with_another_key_is_a_conflict() {
        let store = store().await;
        let instance_id = Uuid::new_v4();

        store
            .register_instance(instance_id, &PUBLIC_KEY, &urls(), "digest")
            .await
            .unwrap();

        let error = store
            .register_instance(instance_id, &[9u8; 32], &urls(), "digest")
            .await
            .unwrap_err();

        assert!(matches!(error, StorageError::Conflict));
    }

    #[tokio::test]
    async fn register_rejects_short_keys() {
        let store = store().await;

        let error = store
            .register_instance(Uuid::new_v4(), &[1u8; 16], &urls(), "digest")
            .await
            .unwrap_err();

        assert!(matches!(error, StorageError::InvalidPublicKey));
    }

    #[tokio::test]
    async fn heartbeat_updates_presence_and_optionally_urls() {
        let store = store().await;
        let instance_id = Uuid::new_v4();

        store
            .register_instance(instance_id, &PUBLIC_KEY, &urls(), "digest")
            .await
            .unwrap();

        let after_plain = store.heartbeat(instance_id, None).await.unwrap();
        assert_eq!(after_plain.direct_urls, urls());

        let new_urls = vec!["https://other:8443".to_owned()];
        let after_update = store.heartbeat(instance_id, Some(&new_urls)).await.unwrap();
        assert_eq!(after_update.direct_urls, new_urls);

        assert!(matches!(
            store.heartbeat(Uuid::new_v4(), None).await.unwrap_err(),
            StorageError::NotFound
        ));
    }

    #[tokio::test]
    async fn claim_lifecycle_create_redeem_consume() {
        let store = store().await;
        let instance_id = Uuid::new_v4();

        store
            .register_instance(instance_id, &PUBLIC_KEY, &urls(), "digest")
            .await
            .unwrap();

        let claim = store
            .create_claim(instance_id, "u1", Duration::from_secs(300))
            .await
            .unwrap();

        // Redeem is an idempotent read, case-insensitive on the code.
        let redeemed = store.redeem_claim(&claim.code.to_ascii_lowercase()).await.unwrap();
        assert_eq!(redeemed.id, claim.id);
        assert_eq!(redeemed.user_id, "u1");

        let again = store.redeem_claim(&claim.code).await.unwrap();
        assert_eq!(again.id, claim.id);

        // Consume is terminal and at-most-once.
        store.consume_claim(instance_id, claim.id, "d1").await.unwrap();
        assert!(matches!(
            store.consume_claim(instance_id, claim.id, "d1").await.unwrap_err(),
            StorageError::AlreadyConsumed
        ));
        assert!(matches!(
            store.redeem_claim(&claim.code).await.unwrap_err(),
            StorageError::AlreadyConsumed
        ));
    }

    #[tokio::test]
    async fn consume_from_another_instance_is_refused() {
        let store = store().await;
        let owner = Uuid::new_v4();
        let intruder = Uuid::new_v4();

        store.register_instance(owner, &PUBLIC_KEY, &urls(), "digest").await.unwrap();

        let claim = store.create_claim(owner, "u1", Duration::from_secs(300)).await.unwrap();

        assert!(matches!(
            store.consume_claim(intruder, claim.id, "d1").await.unwrap_err(),
            StorageError::NotOwner
        ));
        assert!(matches!(
            store.consume_claim(owner, Uuid::new_v4(), "d1").await.unwrap_err(),
            StorageError::NotFound
        ));

        // The failed attempts didn't burn the claim.
        store.consume_claim(owner, claim.id, "d1").await.unwrap();
    }

    #[tokio::test]
    async fn expired_claims_answer_expired_until_swept() {
        let store = store().await;
        let instance_id = Uuid::new_v4();

        store
            .register_instance(instance_id, &PUBLIC_KEY, &urls(), "digest")
            .await
            .unwrap();

        let claim = store
            .create_claim(instance_id, "u1", Duration::from_secs(300))
            .await
            .unwrap();

        // Age the claim past its TTL.
        store
            .conn
            .execute(
                "UPDATE claims SET expires_at = unixepoch() - 10 WHERE id = $1",
                [claim.id.to_string()],
            )
            .await
            .unwrap();

        assert!(matches!(
            store.redeem_claim(&claim.code).await.unwrap_err(),
            StorageError::Expired
        ));

        let deleted_count = store.cleanup_claims(Duration::ZERO).await.unwrap();
        assert_eq!(deleted_count, 1);

        assert!(matches!(
            store.redeem_claim(&claim.code).await.unwrap_err(),
            StorageError::NotFound
        ));
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let store = store().await;

        assert!(matches!(
            store.redeem_claim("ZZZZZZZZ").await.unwrap_err(),
            StorageError::NotFound
        ));
    }

    #[tokio::test]
    async fn sweep_stale_marks_quiet_instances_offline() {
        let store = store().await;
        let quiet = Uuid::new_v4();
        let active = Uuid::new_v4();

        store.register_instance(quiet, &PUBLIC_KEY, &urls(), "digest").await.unwrap();
        store.register_instance(active, &[8u8; 32], &urls(), "digest").await.unwrap();

        store.set_online(quiet, true).await.unwrap();
        store.set_online(active, true).await.unwrap();

        // Age the quiet instance's presence past the threshold.
        store
            .conn
            .execute(
                "UPDATE instances SET last_seen_at = unixepoch() - 600 WHERE instance_id = $1",
                [quiet.to_string()],
            )
            .await
            .unwrap();

        let offline_count = store.sweep_stale(Duration::from_secs(120)).await.unwrap();
        assert_eq!(offline_count, 1);

        assert!(!store.get_instance(quiet).await.unwrap().online);
        assert!(store.get_instance(active).await.unwrap().online);
    }
}
