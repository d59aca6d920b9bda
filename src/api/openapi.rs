use crate::api::handlers::{authflow, health};
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Router that also drives the `OpenAPI` document.
///
/// Routes registered outside (`/`, `OPTIONS /health`) are not documented.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .routes(routes!(health::health))
        .routes(routes!(authflow::create::create))
        .routes(routes!(authflow::input::input))
        .routes(routes!(authflow::get::get))
        .routes(routes!(authflow::websocket::websocket));

    let mut authflow_tag = Tag::new("authflow");
    authflow_tag.description =
        Some("Signup, login and account recovery flows driven by inputs".to_string());
    let mut health_tag = Tag::new("health");
    health_tag.description = Some("Service and store status".to_string());
    router.get_openapi_mut().tags = Some(vec![authflow_tag, health_tag]);

    router
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact(env!("CARGO_PKG_AUTHORS"));
    info.license = optional_str(env!("CARGO_PKG_LICENSE")).map(|identifier| {
        let mut license = License::new(identifier);
        license.identifier = Some(identifier.to_string());
        license
    });

    OpenApiBuilder::new().info(info).build()
}

/// First author of a `;`/`:` separated Cargo authors list, as "Name <email>".
fn cargo_contact(authors: &str) -> Option<Contact> {
    let primary = authors.split([';', ':']).next().map(str::trim)?;
    let (name, email) = match primary.split_once('<') {
        Some((name, email)) => (name.trim(), email.trim_end_matches('>').trim()),
        None => (primary, ""),
    };
    if name.is_empty() && email.is_empty() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = optional_str(name).map(str::to_string);
    contact.email = optional_str(email).map(str::to_string);
    Some(contact)
}

fn optional_str(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
