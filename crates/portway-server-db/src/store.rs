//! Row-level stores
//!
//! The stores carry record shapes that mirror the table layout; the server
//! crate maps its domain types onto them. Every write is awaited before the
//! server mutates its in-memory caches.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, Condition, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::entities::{client, client_auth, job, prelude};

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("{0}")]
    Internal(String),
}

/// One persisted client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub id: String,
    pub client_auth_id: String,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub details: serde_json::Value,
}

/// One persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub jid: Uuid,
    pub client_id: String,
    pub status: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

fn client_record(model: client::Model) -> ClientRecord {
    ClientRecord {
        id: model.id,
        client_auth_id: model.client_auth_id,
        disconnected_at: model.disconnected_at,
        details: model.details,
    }
}

fn job_record(model: job::Model) -> JobRecord {
    JobRecord {
        jid: model.jid,
        client_id: model.client_id,
        status: model.status,
        details: model.details,
        created_at: model.created_at,
    }
}

/// Client rows.
#[derive(Clone)]
pub struct ClientStore {
    conn: DatabaseConnection,
}

impl ClientStore {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    /// All rows that are connected or disconnected no earlier than `cutoff`.
    /// With no cutoff every row qualifies.
    pub async fn get_all_recent(
        &self,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<ClientRecord>, StoreError> {
        let mut query = prelude::Client::find();
        if let Some(cutoff) = cutoff {
            query = query.filter(
                Condition::any()
                    .add(client::Column::DisconnectedAt.is_null())
                    .add(client::Column::DisconnectedAt.gte(cutoff)),
            );
        }
        let rows = query.all(&self.conn).await?;
        Ok(rows.into_iter().map(client_record).collect())
    }

    pub async fn save(&self, record: &ClientRecord) -> Result<(), StoreError> {
        let model = client::ActiveModel {
            id: Set(record.id.clone()),
            client_auth_id: Set(record.client_auth_id.clone()),
            disconnected_at: Set(record.disconnected_at),
            details: Set(record.details.clone()),
        };

        let exists = prelude::Client::find_by_id(record.id.clone())
            .one(&self.conn)
            .await?
            .is_some();
        if exists {
            model.update(&self.conn).await?;
        } else {
            model.insert(&self.conn).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        prelude::Client::delete_by_id(id.to_string())
            .exec(&self.conn)
            .await?;
        Ok(())
    }

    /// Remove rows disconnected before `cutoff`; returns how many went.
    pub async fn delete_obsolete(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = prelude::Client::delete_many()
            .filter(client::Column::DisconnectedAt.is_not_null())
            .filter(client::Column::DisconnectedAt.lt(cutoff))
            .exec(&self.conn)
            .await?;
        Ok(result.rows_affected)
    }
}

/// ClientAuth rows.
#[derive(Clone)]
pub struct AuthStore {
    conn: DatabaseConnection,
}

impl AuthStore {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn get(&self, id: &str) -> Result<Option<(String, String)>, StoreError> {
        let row = prelude::ClientAuth::find_by_id(id.to_string())
            .one(&self.conn)
            .await?;
        Ok(row.map(|m| (m.id, m.password)))
    }

    pub async fn get_all(&self) -> Result<Vec<(String, String)>, StoreError> {
        let rows = prelude::ClientAuth::find().all(&self.conn).await?;
        Ok(rows.into_iter().map(|m| (m.id, m.password)).collect())
    }

    pub async fn save(&self, id: &str, password: &str) -> Result<(), StoreError> {
        let model = client_auth::ActiveModel {
            id: Set(id.to_string()),
            password: Set(password.to_string()),
        };
        let exists = prelude::ClientAuth::find_by_id(id.to_string())
            .one(&self.conn)
            .await?
            .is_some();
        if exists {
            model.update(&self.conn).await?;
        } else {
            model.insert(&self.conn).await?;
        }
        Ok(())
    }

    /// Returns false when no such row existed.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let result = prelude::ClientAuth::delete_by_id(id.to_string())
            .exec(&self.conn)
            .await?;
        Ok(result.rows_affected > 0)
    }
}

/// Job rows.
#[derive(Clone)]
pub struct JobStore {
    conn: DatabaseConnection,
}

impl JobStore {
    pub fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn save(&self, record: &JobRecord) -> Result<(), StoreError> {
        let model = job::ActiveModel {
            jid: Set(record.jid),
            client_id: Set(record.client_id.clone()),
            status: Set(record.status.clone()),
            details: Set(record.details.clone()),
            created_at: Set(record.created_at),
        };
        let exists = prelude::Job::find_by_id(record.jid)
            .one(&self.conn)
            .await?
            .is_some();
        if exists {
            model.update(&self.conn).await?;
        } else {
            model.insert(&self.conn).await?;
        }
        Ok(())
    }

    pub async fn get(&self, client_id: &str, jid: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let row = prelude::Job::find_by_id(jid)
            .filter(job::Column::ClientId.eq(client_id))
            .one(&self.conn)
            .await?;
        Ok(row.map(job_record))
    }

    pub async fn list_by_client(&self, client_id: &str) -> Result<Vec<JobRecord>, StoreError> {
        let rows = prelude::Job::find()
            .filter(job::Column::ClientId.eq(client_id))
            .order_by_desc(job::Column::CreatedAt)
            .all(&self.conn)
            .await?;
        Ok(rows.into_iter().map(job_record).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, disconnected_at: Option<DateTime<Utc>>) -> ClientRecord {
        ClientRecord {
            id: id.to_string(),
            client_auth_id: "auth-1".to_string(),
            disconnected_at,
            details: serde_json::json!({"name": id, "tags": []}),
        }
    }

    #[tokio::test]
    async fn client_save_and_reload() {
        let conn = crate::connect_in_memory().await.unwrap();
        let store = ClientStore::new(conn);

        let rec = record("c1", None);
        store.save(&rec).await.unwrap();

        let all = store.get_all_recent(None).await.unwrap();
        assert_eq!(all, vec![rec.clone()]);

        // Upsert replaces in place.
        let mut updated = rec;
        updated.disconnected_at = Some(Utc::now());
        store.save(&updated).await.unwrap();
        let all = store.get_all_recent(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].disconnected_at.is_some());
    }

    #[tokio::test]
    async fn obsolete_rows_filtered_and_deleted() {
        let conn = crate::connect_in_memory().await.unwrap();
        let store = ClientStore::new(conn);

        let cutoff = Utc::now() - Duration::hours(1);
        store.save(&record("active", None)).await.unwrap();
        store
            .save(&record("recent", Some(Utc::now() - Duration::minutes(5))))
            .await
            .unwrap();
        store
            .save(&record("stale", Some(Utc::now() - Duration::hours(3))))
            .await
            .unwrap();

        let recent = store.get_all_recent(Some(cutoff)).await.unwrap();
        let ids: Vec<&str> = recent.iter().map(|r| r.id.as_str()).collect();
        assert!(ids.contains(&"active"));
        assert!(ids.contains(&"recent"));
        assert!(!ids.contains(&"stale"));

        let removed = store.delete_obsolete(cutoff).await.unwrap();
        assert_eq!(removed, 1);

        // Idempotent: second pass removes nothing.
        let removed = store.delete_obsolete(cutoff).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn auth_store_crud() {
        let conn = crate::connect_in_memory().await.unwrap();
        let store = AuthStore::new(conn);

        store.save("agent-a", "secret").await.unwrap();
        assert_eq!(
            store.get("agent-a").await.unwrap(),
            Some(("agent-a".to_string(), "secret".to_string()))
        );

        store.save("agent-a", "rotated").await.unwrap();
        assert_eq!(
            store.get("agent-a").await.unwrap().unwrap().1,
            "rotated".to_string()
        );

        assert!(store.delete("agent-a").await.unwrap());
        assert!(!store.delete("agent-a").await.unwrap());
        assert_eq!(store.get("agent-a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn job_store_lookup() {
        let conn = crate::connect_in_memory().await.unwrap();
        let store = JobStore::new(conn);

        let jid = Uuid::new_v4();
        let rec = JobRecord {
            jid,
            client_id: "c1".to_string(),
            status: "running".to_string(),
            details: serde_json::json!({"command": "uptime"}),
            created_at: Utc::now(),
        };
        store.save(&rec).await.unwrap();

        assert!(store.get("c1", jid).await.unwrap().is_some());
        // Job ids are scoped to their client.
        assert!(store.get("other", jid).await.unwrap().is_none());

        let listed = store.list_by_client("c1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].jid, jid);
    }
}
