//! OpenAPI document served at /docs.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "vectorAIz control plane",
        description = "Operational surface: health, diagnostics, system mode, and serial lifecycle.",
        version = "1.8.0",
    ),
    paths(
        super::health::health,
        super::health::health_deep,
        super::health::health_issues,
        super::diagnostics::diagnostics_bundle,
        super::system::system_info,
        super::system::system_mode,
        super::system::billing_status,
        super::system::version,
        super::system::provision_serial,
    ),
    components(schemas(super::health::HealthResponse)),
    tags(
        (name = "health", description = "Liveness and component health"),
        (name = "diagnostics", description = "Support bundle generation"),
        (name = "system", description = "Mode, version, and serial lifecycle"),
    )
)]
pub struct ApiDoc;
