use std::{path::Path, str::FromStr, sync::Arc};

use sqlx::{
    Error, Pool, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode},
};

pub mod models;

pub type ConnectionHook = Arc<
    dyn for<'a> Fn(
            &'a mut SqliteConnection,
        )
            -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), Error>> + Send + 'a>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct DBService {
    pub pool: Pool<Sqlite>,
}

impl DBService {
    pub async fn new(db_path: &Path) -> Result<DBService, Error> {
        let pool = Self::create_pool(db_path, None).await?;
        Ok(DBService { pool })
    }

    /// Create a service whose connections run `after_connect` before use.
    /// Used to install the sqlite update hook that feeds row-change events.
    pub async fn new_with_after_connect(
        db_path: &Path,
        after_connect: ConnectionHook,
    ) -> Result<DBService, Error> {
        let pool = Self::create_pool(db_path, Some(after_connect)).await?;
        Ok(DBService { pool })
    }

    /// Run pending migrations without keeping the pool. Used by `migrate`.
    pub async fn migrate_only(db_path: &Path) -> Result<(), Error> {
        let service = Self::new(db_path).await?;
        service.pool.close().await;
        Ok(())
    }

    async fn create_pool(
        db_path: &Path,
        after_connect: Option<ConnectionHook>,
    ) -> Result<Pool<Sqlite>, Error> {
        let database_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = if let Some(hook) = after_connect {
            sqlx::sqlite::SqlitePoolOptions::new()
                .after_connect(move |conn, _meta| {
                    let hook = hook.clone();
                    Box::pin(async move {
                        hook(conn).await?;
                        Ok(())
                    })
                })
                .connect_with(options)
                .await?
        } else {
            SqlitePool::connect_with(options).await?
        };

        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(pool)
    }
}
