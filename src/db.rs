//! Durable store: accounts, pairing codes, relationships, push tokens.

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use time::OffsetDateTime;

use crate::pairing::{Issuer, PairingCode};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        username TEXT NOT NULL,
        role TEXT NOT NULL,
        gender TEXT,
        age INTEGER,
        last_seen INTEGER,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS pairing_codes (
        code TEXT PRIMARY KEY,
        creator_id INTEGER REFERENCES users(id),
        issued_at INTEGER NOT NULL,
        expires_at INTEGER NOT NULL,
        used INTEGER NOT NULL DEFAULT 0,
        claimed_by INTEGER REFERENCES users(id)
    )",
    "CREATE TABLE IF NOT EXISTS relationships (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        elder_id INTEGER NOT NULL REFERENCES users(id),
        family_id INTEGER NOT NULL REFERENCES users(id),
        created_at INTEGER NOT NULL,
        UNIQUE (elder_id, family_id)
    )",
    "CREATE TABLE IF NOT EXISTS push_tokens (
        room_id TEXT NOT NULL,
        token TEXT NOT NULL,
        device_name TEXT NOT NULL,
        role TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (room_id, token)
    )",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountRole {
    Elder,
    Family,
}

impl AccountRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountRole::Elder => "elder",
            AccountRole::Family => "family",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "elder" => Some(AccountRole::Elder),
            "family" => Some(AccountRole::Family),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub role: Option<AccountRole>,
    pub last_seen: Option<i64>,
}

/// What a family member tells us about the elder when confirming a code
/// shown on the elder's device.
#[derive(Debug, Clone, Default)]
pub struct ElderProfile {
    pub name: String,
    pub gender: Option<String>,
    pub age: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relationship {
    pub elder_id: i64,
    pub family_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub token: String,
    pub device_name: String,
}

#[derive(Clone, Debug)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    pub async fn connect(url: &str, max_connections: u32) -> sqlx::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Private in-memory database. One connection, never recycled, so the
    /// data lives as long as the pool.
    pub async fn in_memory() -> sqlx::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> sqlx::Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn create_user(
        &self,
        username: &str,
        role: AccountRole,
        now: OffsetDateTime,
    ) -> sqlx::Result<i64> {
        let result = sqlx::query("INSERT INTO users (username,role,created_at) VALUES (?,?,?)")
            .bind(username)
            .bind(role.as_str())
            .bind(now.unix_timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn find_user(&self, id: i64) -> sqlx::Result<Option<User>> {
        let row: Option<(i64, String, String, Option<i64>)> =
            sqlx::query_as("SELECT id,username,role,last_seen FROM users WHERE id=?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(id, username, role, last_seen)| User {
            id,
            username,
            role: AccountRole::parse(&role),
            last_seen,
        }))
    }

    pub async fn touch_last_seen(&self, id: i64, now: OffsetDateTime) -> sqlx::Result<()> {
        sqlx::query("UPDATE users SET last_seen=? WHERE id=?")
            .bind(now.unix_timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Elders paired with `family_id`, with their last-seen timestamp.
    pub async fn elders_for(&self, family_id: i64) -> sqlx::Result<Vec<(i64, String, Option<i64>)>> {
        sqlx::query_as(
            "SELECT u.id,u.username,u.last_seen FROM relationships r
             JOIN users u ON u.id=r.elder_id
             WHERE r.family_id=? ORDER BY u.id",
        )
        .bind(family_id)
        .fetch_all(&self.pool)
        .await
    }

    /// Codes that have not yet expired, used or not.
    pub async fn load_codes(&self, now: OffsetDateTime) -> sqlx::Result<Vec<PairingCode>> {
        let rows: Vec<(String, Option<i64>, i64, i64, bool, Option<i64>)> = sqlx::query_as(
            "SELECT code,creator_id,issued_at,expires_at,used,claimed_by FROM pairing_codes WHERE expires_at>?",
        )
        .bind(now.unix_timestamp())
        .fetch_all(&self.pool)
        .await?;

        let mut codes = Vec::with_capacity(rows.len());
        for (code, creator_id, issued_at, expires_at, used, claimed_by) in rows {
            let (Ok(issued_at), Ok(expires_at)) = (
                OffsetDateTime::from_unix_timestamp(issued_at),
                OffsetDateTime::from_unix_timestamp(expires_at),
            ) else {
                tracing::warn!("skipping pairing code with corrupt timestamps");
                continue;
            };
            codes.push(PairingCode {
                code,
                issuer: creator_id.map_or(Issuer::Elder, Issuer::Family),
                issued_at,
                expires_at,
                used,
                claimed_by,
            });
        }
        Ok(codes)
    }

    /// Replaces any stale row holding the same digits.
    pub async fn insert_code(&self, code: &PairingCode) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO pairing_codes (code,creator_id,issued_at,expires_at,used,claimed_by)
             VALUES (?,?,?,?,?,?)",
        )
        .bind(&code.code)
        .bind(code.issuer.family_id())
        .bind(code.issued_at.unix_timestamp())
        .bind(code.expires_at.unix_timestamp())
        .bind(code.used)
        .bind(code.claimed_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_code_used(&self, code: &str) -> sqlx::Result<()> {
        sqlx::query("UPDATE pairing_codes SET used=1 WHERE code=?")
            .bind(code)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_expired_codes(&self, now: OffsetDateTime) -> sqlx::Result<u64> {
        let result = sqlx::query("DELETE FROM pairing_codes WHERE expires_at<=?")
            .bind(now.unix_timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// An elder redeems a family-issued code.
    pub async fn claim_family_code(
        &self,
        code: &str,
        family_id: i64,
        elder_id: i64,
        now: OffsetDateTime,
    ) -> sqlx::Result<Relationship> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE pairing_codes SET used=1,claimed_by=? WHERE code=?")
            .bind(elder_id)
            .bind(code)
            .execute(&mut *tx)
            .await?;
        insert_relationship(&mut tx, elder_id, family_id, now).await?;

        tx.commit().await?;
        Ok(Relationship { elder_id, family_id })
    }

    /// A family member redeems the code shown on an elder's device,
    /// registering the elder in the same transaction.
    pub async fn claim_elder_code(
        &self,
        code: &str,
        family_id: i64,
        elder: &ElderProfile,
        now: OffsetDateTime,
    ) -> sqlx::Result<Relationship> {
        let mut tx = self.pool.begin().await?;

        let elder_id = sqlx::query("INSERT INTO users (username,role,gender,age,created_at) VALUES (?,?,?,?,?)")
            .bind(&elder.name)
            .bind(AccountRole::Elder.as_str())
            .bind(&elder.gender)
            .bind(elder.age)
            .bind(now.unix_timestamp())
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        sqlx::query("UPDATE pairing_codes SET used=1,claimed_by=? WHERE code=?")
            .bind(elder_id)
            .bind(code)
            .execute(&mut *tx)
            .await?;
        insert_relationship(&mut tx, elder_id, family_id, now).await?;

        tx.commit().await?;
        Ok(Relationship { elder_id, family_id })
    }

    pub async fn upsert_push_token(
        &self,
        room_id: &str,
        token: &str,
        device_name: &str,
        role: &str,
        now: OffsetDateTime,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO push_tokens (room_id,token,device_name,role,updated_at) VALUES (?,?,?,?,?)
             ON CONFLICT(room_id,token) DO UPDATE SET
                device_name=excluded.device_name, role=excluded.role, updated_at=excluded.updated_at",
        )
        .bind(room_id)
        .bind(token)
        .bind(device_name)
        .bind(role)
        .bind(now.unix_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn push_tokens(&self, room_id: &str) -> sqlx::Result<Vec<PushTarget>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT token,device_name FROM push_tokens WHERE room_id=? ORDER BY updated_at")
                .bind(room_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(token, device_name)| PushTarget { token, device_name })
            .collect())
    }
}

async fn insert_relationship(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    elder_id: i64,
    family_id: i64,
    now: OffsetDateTime,
) -> sqlx::Result<()> {
    // a pair that is already linked stays linked
    sqlx::query("INSERT OR IGNORE INTO relationships (elder_id,family_id,created_at) VALUES (?,?,?)")
        .bind(elder_id)
        .bind(family_id)
        .bind(now.unix_timestamp())
        .execute(&mut **tx)
        .await?;
    Ok(())
}
