use diesel_async::{
    pg::AsyncPgConnection,
    pooled_connection::{
        deadpool::{BuildError, Pool},
        AsyncDieselConnectionManager,
    },
};

/// The sync loop queries one window at a time.
const POOL_MAX_SIZE: usize = 3;

/// Builds a lazily connecting pool; the first checkout surfaces connection failures.
pub async fn build_db_pool(db_url: &str) -> Result<Pool<AsyncPgConnection>, BuildError> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(db_url);
    Pool::builder(manager).max_size(POOL_MAX_SIZE).build()
}
