use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Catcher Signal API",
        version = "0.3.0",
        description = "Coordination signals shared by Catcher engine instances."
    ),
    paths(
        crate::routes::list_signals,
        crate::routes::get_signal,
        crate::routes::set_signal,
        crate::routes::get_kill,
        crate::routes::set_kill,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::SetSignalRequest,
        crate::dto::SignalResponse,
        crate::dto::SignalListResponse,
        crate::dto::SetKillRequest,
        crate::dto::KillResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "signals", description = "Per-group RUN/STOP signals"),
        (name = "kill", description = "Global kill switch"),
        (name = "system", description = "Health and system status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "Admin token. Set via CATCHER_ADMIN_TOKEN environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
