//! Persistence for hosts, images, spaces and port links.
//!
//! The store is the source of truth shared by every task in the process.
//! The unique index on `port_links(external_address, external_port)` is the
//! only arbitration point between concurrent port reservations.

use crate::error::{OrchestratorError, Result};
use crate::host::{ConnectionKind, Host, HostConfig};
use crate::space::{PortLink, Space, SpaceImage};
use crate::status::SpaceStatus;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::instrument;
use uuid::Uuid;

/// Fields of a space at the start of provisioning.
#[derive(Debug, Clone)]
pub struct NewSpace {
    pub owner_id: String,
    pub name: String,
    pub host_id: String,
    pub image_id: String,
    pub ssh_key_id: Option<String>,
    pub keep_alive: bool,
}

#[derive(Clone)]
pub struct SpaceStore {
    pool: SqlitePool,
}

impl SpaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // --- Hosts ---

    #[instrument(skip(self, config), fields(host = %config.name))]
    pub async fn insert_host(&self, config: &HostConfig, connected: bool) -> Result<Host> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO hosts (id, name, connection_kind, endpoint, ca_cert_path, client_cert_path,
                               client_key_path, external_address, display_address, connected,
                               created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&config.name)
        .bind(config.connection_kind)
        .bind(&config.endpoint)
        .bind(path_text(&config.ca_cert_path))
        .bind(path_text(&config.client_cert_path))
        .bind(path_text(&config.client_key_path))
        .bind(&config.external_address)
        .bind(&config.display_address)
        .bind(connected)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                OrchestratorError::DuplicateHost(config.name.clone())
            }
            other => other.into(),
        })?;

        self.get_host(&id).await
    }

    pub async fn get_host(&self, id: &str) -> Result<Host> {
        let row = sqlx::query_as::<_, HostRow>("SELECT * FROM hosts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("host {id}")))?;

        Ok(row.into())
    }

    pub async fn find_host_by_name(&self, name: &str) -> Result<Option<Host>> {
        let row = sqlx::query_as::<_, HostRow>("SELECT * FROM hosts WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    pub async fn list_hosts(&self) -> Result<Vec<Host>> {
        let rows = sqlx::query_as::<_, HostRow>("SELECT * FROM hosts ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn set_host_connected(&self, id: &str, connected: bool) -> Result<()> {
        sqlx::query("UPDATE hosts SET connected = ?, updated_at = ? WHERE id = ?")
            .bind(connected)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // --- Images ---

    pub async fn create_image(
        &self,
        name: &str,
        description: &str,
        image: &str,
        tag: &str,
        active: bool,
    ) -> Result<SpaceImage> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO space_images (id, active, name, description, image, tag, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(active)
        .bind(name)
        .bind(description)
        .bind(image)
        .bind(tag)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        self.get_image(&id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("image {id}")))
    }

    pub async fn get_image(&self, id: &str) -> Result<Option<SpaceImage>> {
        let row = sqlx::query_as::<_, ImageRow>("SELECT * FROM space_images WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    /// Find an image by repository and tag
    pub async fn find_image(&self, image: &str, tag: &str) -> Result<Option<SpaceImage>> {
        let row = sqlx::query_as::<_, ImageRow>(
            "SELECT * FROM space_images WHERE image = ? AND tag = ?",
        )
        .bind(image)
        .bind(tag)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    pub async fn set_image_active(&self, id: &str, active: bool) -> Result<()> {
        sqlx::query("UPDATE space_images SET active = ? WHERE id = ?")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn list_images(&self) -> Result<Vec<SpaceImage>> {
        let rows = sqlx::query_as::<_, ImageRow>("SELECT * FROM space_images ORDER BY created_at, rowid")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    // --- Spaces ---

    /// Insert a space in `creation started`
    #[instrument(skip(self, new), fields(owner = %new.owner_id, host = %new.host_id))]
    pub async fn create_space(&self, new: NewSpace) -> Result<Space> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO spaces (id, owner_id, name, host_id, image_id, ssh_key_id, container_id,
                                status, keep_alive, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, '', ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.owner_id)
        .bind(&new.name)
        .bind(&new.host_id)
        .bind(&new.image_id)
        .bind(&new.ssh_key_id)
        .bind(SpaceStatus::CreationStarted)
        .bind(new.keep_alive)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_space(&id).await
    }

    /// Get a single space with its port links attached
    pub async fn get_space(&self, id: &str) -> Result<Space> {
        let row = sqlx::query_as::<_, SpaceRow>("SELECT * FROM spaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("space {id}")))?;

        let links = self.list_port_links(id).await?;
        Ok(row.into_space(links))
    }

    /// List spaces, optionally for one owner, with port links attached
    pub async fn list_spaces(&self, owner_id: Option<&str>) -> Result<Vec<Space>> {
        let mut query = "SELECT * FROM spaces WHERE 1=1".to_string();

        if owner_id.is_some() {
            query.push_str(" AND owner_id = ?");
        }

        query.push_str(" ORDER BY created_at, rowid");

        let mut q = sqlx::query_as::<_, SpaceRow>(&query);

        if let Some(owner) = owner_id {
            q = q.bind(owner);
        }

        let rows = q.fetch_all(&self.pool).await?;

        let mut links_by_space: HashMap<String, Vec<PortLink>> = HashMap::new();
        for link in self.list_all_port_links().await? {
            links_by_space
                .entry(link.space_id.clone())
                .or_default()
                .push(link);
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let links = links_by_space.remove(&row.id).unwrap_or_default();
                row.into_space(links)
            })
            .collect())
    }

    /// Number of spaces assigned to each host
    pub async fn count_spaces_by_host(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT host_id, COUNT(*) FROM spaces GROUP BY host_id")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().collect())
    }

    /// Persist a status transition, refusing transitions the state machine forbids.
    ///
    /// The write only lands while the row still holds `space.status`. When
    /// another task moved the space first, `space` is refreshed from the row
    /// and the call fails with [`OrchestratorError::InvalidTransition`] (or
    /// [`OrchestratorError::NotFound`] once the space is gone).
    pub async fn update_status(&self, space: &mut Space, next: SpaceStatus) -> Result<()> {
        check_transition(space.status, next)?;

        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE spaces SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(next)
        .bind(now.timestamp())
        .bind(&space.id)
        .bind(space.status)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.stale_write(space, next).await);
        }

        space.status = next;
        space.updated_at = now;
        Ok(())
    }

    /// Record the runtime container together with its status
    pub async fn set_container(
        &self,
        space: &mut Space,
        container_id: &str,
        next: SpaceStatus,
    ) -> Result<()> {
        check_transition(space.status, next)?;

        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE spaces SET container_id = ?, status = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(container_id)
        .bind(next)
        .bind(now.timestamp())
        .bind(&space.id)
        .bind(space.status)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.stale_write(space, next).await);
        }

        space.container_id = container_id.to_string();
        space.status = next;
        space.updated_at = now;
        Ok(())
    }

    async fn stale_write(&self, space: &mut Space, next: SpaceStatus) -> OrchestratorError {
        match self.get_space(&space.id).await {
            Ok(current) => {
                let from = current.status;
                *space = current;
                OrchestratorError::InvalidTransition { from, to: next }
            }
            Err(e) => e,
        }
    }

    /// Delete a space and its port links
    #[instrument(skip(self))]
    pub async fn delete_space(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM port_links WHERE space_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM spaces WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("space {id}")));
        }

        tx.commit().await?;
        Ok(())
    }

    // --- Port links ---

    pub async fn is_port_taken(&self, external_address: &str, external_port: u16) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM port_links WHERE external_address = ? AND external_port = ?",
        )
        .bind(external_address)
        .bind(i64::from(external_port))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    /// Reserve an external port; a taken pair yields [`OrchestratorError::PortConflict`]
    pub async fn insert_port_link(
        &self,
        space_id: &str,
        space_port: u16,
        external_port: u16,
        external_address: &str,
        display_address: &str,
    ) -> Result<PortLink> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO port_links (id, space_id, space_port, external_port, external_address,
                                     display_address, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(space_id)
        .bind(i64::from(space_port))
        .bind(i64::from(external_port))
        .bind(external_address)
        .bind(display_address)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                OrchestratorError::PortConflict {
                    address: external_address.to_string(),
                    port: external_port,
                }
            }
            other => other.into(),
        })?;

        Ok(PortLink {
            id,
            space_id: space_id.to_string(),
            space_port,
            external_port,
            external_address: external_address.to_string(),
            display_address: display_address.to_string(),
        })
    }

    pub async fn list_port_links(&self, space_id: &str) -> Result<Vec<PortLink>> {
        let rows = sqlx::query_as::<_, PortLinkRow>(
            "SELECT * FROM port_links WHERE space_id = ? ORDER BY rowid",
        )
        .bind(space_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn list_all_port_links(&self) -> Result<Vec<PortLink>> {
        let rows = sqlx::query_as::<_, PortLinkRow>("SELECT * FROM port_links ORDER BY rowid")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

fn check_transition(from: SpaceStatus, to: SpaceStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidTransition { from, to })
    }
}

fn path_text(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}

fn timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct HostRow {
    id: String,
    name: String,
    connection_kind: ConnectionKind,
    endpoint: Option<String>,
    ca_cert_path: Option<String>,
    client_cert_path: Option<String>,
    client_key_path: Option<String>,
    external_address: String,
    display_address: String,
    connected: bool,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct ImageRow {
    id: String,
    active: bool,
    name: String,
    description: String,
    image: String,
    tag: String,
}

#[derive(sqlx::FromRow)]
struct SpaceRow {
    id: String,
    owner_id: String,
    name: String,
    host_id: String,
    image_id: String,
    ssh_key_id: Option<String>,
    container_id: String,
    status: SpaceStatus,
    keep_alive: bool,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct PortLinkRow {
    id: String,
    space_id: String,
    space_port: i64,
    external_port: i64,
    external_address: String,
    display_address: String,
}

impl From<HostRow> for Host {
    fn from(row: HostRow) -> Self {
        Self {
            id: row.id,
            config: HostConfig {
                name: row.name,
                connection_kind: row.connection_kind,
                endpoint: row.endpoint,
                ca_cert_path: row.ca_cert_path.map(PathBuf::from),
                client_cert_path: row.client_cert_path.map(PathBuf::from),
                client_key_path: row.client_key_path.map(PathBuf::from),
                external_address: row.external_address,
                display_address: row.display_address,
            },
            connected: row.connected,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
        }
    }
}

impl From<ImageRow> for SpaceImage {
    fn from(row: ImageRow) -> Self {
        Self {
            id: row.id,
            active: row.active,
            name: row.name,
            description: row.description,
            image: row.image,
            tag: row.tag,
        }
    }
}

impl SpaceRow {
    fn into_space(self, port_links: Vec<PortLink>) -> Space {
        Space {
            id: self.id,
            owner_id: self.owner_id,
            name: self.name,
            host_id: self.host_id,
            image_id: self.image_id,
            ssh_key_id: self.ssh_key_id,
            container_id: self.container_id,
            status: self.status,
            keep_alive: self.keep_alive,
            port_links,
            created_at: timestamp(self.created_at),
            updated_at: timestamp(self.updated_at),
        }
    }
}

impl From<PortLinkRow> for PortLink {
    fn from(row: PortLinkRow) -> Self {
        Self {
            id: row.id,
            space_id: row.space_id,
            space_port: u16::try_from(row.space_port).unwrap_or_default(),
            external_port: u16::try_from(row.external_port).unwrap_or_default(),
            external_address: row.external_address,
            display_address: row.display_address,
        }
    }
}
