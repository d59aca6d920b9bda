use axum::response::IntoResponse;

/// Plain-text banner with name and version.
pub async fn root() -> impl IntoResponse {
    format!(
        "{} {} ({})\n",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        crate::GIT_COMMIT_HASH
    )
}
