use crate::api::handlers::{health, login, me, oidc, passkeys, register, session};
use axum::http::Method;
use utoipa::openapi::{Contact, InfoBuilder, License, OpenApiBuilder, Tag, path::PathItem};
use utoipa_axum::{router::OpenApiRouter, routes};

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    // Reuse the same router wiring and only return the generated OpenAPI document.
    let (_router, openapi) = api_router().split_for_parts();
    openapi
}

/// Every documented route, served and described in one place.
pub(crate) fn api_router() -> OpenApiRouter {
    let mut router = OpenApiRouter::with_openapi(cargo_openapi())
        .merge(public_router())
        .merge(gated_router());

    router.get_openapi_mut().tags = Some(vec![
        tag("health", "Liveness and build information"),
        tag("session", "Current caller and logout"),
        tag("auth", "Password login, registration and TOTP"),
        tag("passkeys", "WebAuthn registration and login"),
        tag("oidc", "Federated login"),
    ]);
    router
}

/// Routes served without the gate.
pub(crate) fn public_router() -> OpenApiRouter {
    OpenApiRouter::new().routes(routes!(health::health))
}

/// Routes mounted behind the gate. Each one needs a rule in the route table.
///
/// Add new endpoints here via `.routes(routes!(...))` so they are served,
/// documented and checked against the route table at boot.
pub(crate) fn gated_router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(me::me))
        .routes(routes!(session::logout))
        .routes(routes!(register::register))
        .routes(routes!(register::register_totp))
        .routes(routes!(login::login))
        .routes(routes!(login::login_totp))
        .routes(routes!(passkeys::register_begin))
        .routes(routes!(passkeys::register_finish))
        .routes(routes!(passkeys::login_begin))
        .routes(routes!(passkeys::login_finish))
        .routes(routes!(oidc::authorize))
        .routes(routes!(oidc::callback))
}

/// `(method, path template)` of every gated route.
#[must_use]
pub fn mounted_routes() -> Vec<(Method, String)> {
    let (_router, openapi) = gated_router().split_for_parts();
    let mut mounted = Vec::new();
    for (path, item) in &openapi.paths.paths {
        for method in item_methods(item) {
            mounted.push((method, path.clone()));
        }
    }
    mounted
}

fn item_methods(item: &PathItem) -> Vec<Method> {
    [
        (Method::GET, item.get.is_some()),
        (Method::POST, item.post.is_some()),
        (Method::PUT, item.put.is_some()),
        (Method::PATCH, item.patch.is_some()),
        (Method::DELETE, item.delete.is_some()),
    ]
    .into_iter()
    .filter_map(|(method, present)| present.then_some(method))
    .collect()
}

fn tag(name: &str, description: &str) -> Tag {
    let mut tag = Tag::new(name);
    tag.description = Some(description.to_string());
    tag
}

fn cargo_openapi() -> utoipa::openapi::OpenApi {
    // Use Cargo.toml metadata instead of the utoipa-axum crate info defaults.
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();

    OpenApiBuilder::new().info(info).build()
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let primary = env!("CARGO_PKG_AUTHORS").split(';').next().map(str::trim)?;
    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    match author.split_once('<') {
        Some((name, email)) => (
            optional_str(name),
            optional_str(email.trim_end_matches('>')),
        ),
        None => (optional_str(author), None),
    }
}
