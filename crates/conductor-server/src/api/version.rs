//! Build information at GET /version

use crate::version::{build_info, BuildInfo};
use axum::Json;

pub async fn get_version() -> Json<BuildInfo> {
    Json(build_info())
}
