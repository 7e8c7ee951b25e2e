//! `Dragonfly` (Redis-compatible) work queues.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `queue:update:cell` | List | JSON cell observations awaiting the cell updater |
//! | `queue:update:wifi` | List | JSON WiFi observations awaiting the WiFi updater |
//! | `queue:update:cell_area` | Set | Canonical keys of areas to recompute |
//!
//! Claims use `LPOP key count` and `SPOP key count`, which remove and
//! return in one command.

use fred::prelude::*;
use waypost_types::{CellAreaKey, Observation, StationKey, StationKind};

use crate::error::DbError;
use crate::queue::{AREA_QUEUE, WorkQueue, decode_areas, decode_claimed, observation_queue};

/// Connection handle to a `Dragonfly` (Redis-compatible) instance.
#[derive(Clone)]
pub struct DragonflyPool {
    client: Client,
}

impl DragonflyPool {
    /// Connect to `Dragonfly` at the given URL.
    ///
    /// The URL should follow the Redis URL scheme:
    /// `redis://host:port` or `redis://host:port/db`
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] if the URL cannot be parsed.
    /// Returns [`DbError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!("Connected to Dragonfly");
        Ok(Self { client })
    }

    /// Delete every queue this crate owns.
    ///
    /// **WARNING:** pending work is lost. Only use for testing.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Dragonfly`] if the delete fails.
    pub async fn clear_queues(&self) -> Result<(), DbError> {
        let keys = vec![
            observation_queue(StationKind::Cell),
            observation_queue(StationKind::Wifi),
            AREA_QUEUE.to_owned(),
        ];
        let _: u32 = self.client.del(keys).await?;
        Ok(())
    }

    /// Return a reference to the underlying [`Client`].
    pub const fn client(&self) -> &Client {
        &self.client
    }
}

impl WorkQueue for DragonflyPool {
    async fn push_observations<K: StationKey>(
        &self,
        observations: &[Observation<K>],
    ) -> Result<usize, DbError> {
        if observations.is_empty() {
            return Ok(0);
        }
        let payloads = observations
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<String>, _>>()?;
        let count = payloads.len();
        let _: u64 = self
            .client
            .rpush(observation_queue(K::KIND), payloads)
            .await?;
        Ok(count)
    }

    async fn claim_observations<K: StationKey>(
        &self,
        count: usize,
    ) -> Result<Vec<Observation<K>>, DbError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let queue = observation_queue(K::KIND);
        let raw: Option<Vec<String>> = self.client.lpop(queue.as_str(), Some(count)).await?;
        Ok(decode_claimed(&queue, &raw.unwrap_or_default()))
    }

    async fn pending_observations(&self, kind: StationKind) -> Result<usize, DbError> {
        let len: usize = self.client.llen(observation_queue(kind)).await?;
        Ok(len)
    }

    async fn schedule_areas(&self, keys: &[CellAreaKey]) -> Result<(), DbError> {
        if keys.is_empty() {
            return Ok(());
        }
        let members: Vec<String> = keys.iter().map(ToString::to_string).collect();
        let _: u64 = self.client.sadd(AREA_QUEUE, members).await?;
        Ok(())
    }

    async fn claim_areas(&self, count: usize) -> Result<Vec<CellAreaKey>, DbError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let raw: Option<Vec<String>> = self.client.spop(AREA_QUEUE, Some(count)).await?;
        Ok(decode_areas(&raw.unwrap_or_default()))
    }

    async fn pending_areas(&self) -> Result<usize, DbError> {
        let len: usize = self.client.scard(AREA_QUEUE).await?;
        Ok(len)
    }
}
