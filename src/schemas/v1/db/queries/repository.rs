use crate::schemas::v1::models::repository::Repository;
use sqlx::{MySql, Pool};

pub async fn list_repositories(pool: &Pool<MySql>) -> Result<Vec<Repository>, sqlx::Error> {
    sqlx::query_as::<_, Repository>("SELECT * FROM repositories ORDER BY id")
        .fetch_all(pool)
        .await
}

pub async fn get_repository_by_id(
    pool: &Pool<MySql>,
    repository_id: i64,
) -> Result<Option<Repository>, sqlx::Error> {
    sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = ?")
        .bind(repository_id)
        .fetch_optional(pool)
        .await
}

/// Creates a repository entry. The root path is created lazily when the
/// first backup lands in it.
pub async fn create_repository(
    pool: &Pool<MySql>,
    name: &str,
    root_path: &str,
) -> Result<Repository, sqlx::Error> {
    sqlx::query("INSERT INTO repositories (name, root_path) VALUES (?, ?)")
        .bind(name)
        .bind(root_path)
        .execute(pool)
        .await?;

    let last_insert_id: i64 = sqlx::query_scalar("SELECT LAST_INSERT_ID()")
        .fetch_one(pool)
        .await?;

    sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = ?")
        .bind(last_insert_id)
        .fetch_one(pool)
        .await
}
