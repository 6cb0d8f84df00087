// src/db.rs

use std::future::IntoFuture;
use std::time::Duration;

use futures_util::TryStreamExt;
use log::info;
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, Cursor, Database, IndexModel};
use serde::de::DeserializeOwned;

use crate::config::Config;
use crate::error::RepositoryError;

pub const USER_COLLECTION: &str = "user";
pub const TEAM_COLLECTION: &str = "team";
pub const BOX_COLLECTION: &str = "box";

pub struct MongoDB {
    pub db: Database,
    pub timeout: Duration,
}

impl MongoDB {
    pub async fn init(config: &Config) -> Result<Self, RepositoryError> {
        let mut client_options = ClientOptions::parse(&config.mongo_uri).await?;
        client_options.app_name = Some("magichub".to_string());
        client_options.connect_timeout = Some(config.upstream_timeout);
        client_options.server_selection_timeout = Some(config.upstream_timeout);

        let client = Client::with_options(client_options)?;
        let db = client.database(&config.database_name);
        let mongodb = MongoDB {
            db,
            timeout: config.upstream_timeout,
        };
        mongodb.ensure_indexes().await?;
        info!("Connected to MongoDB database {}", config.database_name);
        Ok(mongodb)
    }

    pub fn collection<T: Send + Sync>(&self, name: &str) -> Collection<T> {
        self.db.collection::<T>(name)
    }

    /// Uniqueness of usernames, emails and team names is enforced here rather
    /// than by a lookup before every write.
    async fn ensure_indexes(&self) -> Result<(), RepositoryError> {
        let unique = |field: &str| {
            IndexModel::builder()
                .keys(doc! { field: 1 })
                .options(IndexOptions::builder().unique(true).build())
                .build()
        };

        let users = self.db.collection::<mongodb::bson::Document>(USER_COLLECTION);
        with_deadline(self.timeout, users.create_index(unique("email"))).await?;
        with_deadline(self.timeout, users.create_index(unique("username"))).await?;

        let teams = self.db.collection::<mongodb::bson::Document>(TEAM_COLLECTION);
        with_deadline(self.timeout, teams.create_index(unique("name"))).await?;

        let boxes = self.db.collection::<mongodb::bson::Document>(BOX_COLLECTION);
        let by_team = IndexModel::builder().keys(doc! { "team": 1 }).build();
        with_deadline(self.timeout, boxes.create_index(by_team)).await?;
        Ok(())
    }
}

/// Runs one driver call under a deadline.
pub async fn with_deadline<T, F>(limit: Duration, call: F) -> Result<T, RepositoryError>
where
    F: IntoFuture<Output = mongodb::error::Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result.map_err(RepositoryError::from),
        Err(_) => Err(RepositoryError::Timeout(limit)),
    }
}

/// Runs a query and drains its cursor under one deadline, so follow-up
/// batches count against the same budget as the first.
pub async fn collect_with_deadline<T, F>(limit: Duration, find: F) -> Result<Vec<T>, RepositoryError>
where
    T: DeserializeOwned + Unpin + Send + Sync,
    F: IntoFuture<Output = mongodb::error::Result<Cursor<T>>>,
{
    with_deadline(limit, async move {
        let cursor = find.await?;
        cursor.try_collect::<Vec<T>>().await
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slow_calls_time_out() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, mongodb::error::Error>(())
        };
        let err = with_deadline(Duration::from_millis(10), slow).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Timeout(_)));
    }

    #[tokio::test]
    async fn cursor_queries_share_the_deadline() {
        let never = std::future::pending::<mongodb::error::Result<Cursor<mongodb::bson::Document>>>();
        let err = collect_with_deadline(Duration::from_millis(10), never)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Timeout(_)));
    }

    #[tokio::test]
    async fn fast_calls_pass_through() {
        let fast = async { Ok::<_, mongodb::error::Error>(7) };
        assert_eq!(with_deadline(Duration::from_secs(1), fast).await.unwrap(), 7);
    }
}
