use utoipa::OpenApi;

use crate::routes::{admin, health, tasks};

#[derive(OpenApi)]
#[openapi(info(
    title = "kiln-server",
    description = "Generation task orchestration API",
    version = "0.1.0",
))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut root = ApiDoc::openapi();
    root.merge(health::HealthApi::openapi());
    root.merge(tasks::TasksApi::openapi());
    root.merge(admin::AdminApi::openapi());
    root
}
