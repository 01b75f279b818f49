use crate::schemas::v1::db::queries as db;
use rocket::http::Status;
use rocket::serde::json::{json, Json, Value};
use rocket::{get, post, State};
use serde::Deserialize;
use sqlx::MySql;

#[derive(Debug, Deserialize)]
pub struct CreateRepositoryRequest {
    pub name: String,
    pub root_path: String,
}

#[get("/repositories")]
pub async fn list_repositories(
    pool: &State<sqlx::Pool<MySql>>,
) -> Result<Json<Value>, (Status, Json<Value>)> {
    let repositories = db::repository::list_repositories(pool).await.map_err(|e| {
        (
            Status::InternalServerError,
            Json(json!({ "error": e.to_string() })),
        )
    })?;
    Ok(Json(json!({ "repositories": repositories })))
}

#[post("/repositories", format = "json", data = "<request>")]
pub async fn create_repository(
    pool: &State<sqlx::Pool<MySql>>,
    request: Json<CreateRepositoryRequest>,
) -> Result<(Status, Json<Value>), (Status, Json<Value>)> {
    if request.name.trim().is_empty() || !request.root_path.starts_with('/') {
        return Err((
            Status::BadRequest,
            Json(json!({ "error": "name must be set and root_path absolute" })),
        ));
    }

    let repository = db::repository::create_repository(pool, &request.name, &request.root_path)
        .await
        .map_err(|e| {
            (
                Status::Conflict,
                Json(json!({ "error": e.to_string() })),
            )
        })?;

    Ok((Status::Created, Json(json!({ "repository": repository }))))
}
