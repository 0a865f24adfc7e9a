use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use turgolab_service::{api, config::ServiceConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turgolab_service=debug,tower_http=debug,axum=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting TurgoLab Service");

    let config = ServiceConfig::from_env();
    tracing::info!("Using gmsh command: {}", config.gmsh_path);
    tracing::info!("Using solver command: {}", config.solver_command.join(" "));
    tracing::info!("Workspaces under {:?}", config.work_root);

    // Verify gmsh installation
    match tokio::process::Command::new(&config.gmsh_path)
        .arg("-version")
        .output()
        .await
    {
        Ok(_) => tracing::info!("gmsh found and accessible"),
        Err(e) => {
            tracing::warn!("gmsh not found or not accessible: {}", e);
            tracing::warn!("Set GMSH_PATH environment variable to the correct path");
            tracing::warn!("Service will start but mesh generation will fail until gmsh is available");
        }
    }

    if !config.default_geometry.is_file() {
        tracing::warn!(
            "Default geometry {:?} does not exist; sessions must upload a .geo file",
            config.default_geometry
        );
    }

    let addr = config.bind_addr();
    let app = api::create_router(config);

    tracing::info!("Listening on {}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  GET    /health");
    tracing::info!("  GET    /api/v1/version");
    tracing::info!("  POST   /api/v1/sessions");
    tracing::info!("  GET    /api/v1/sessions/:id");
    tracing::info!("  POST   /api/v1/sessions/:id/geometry");
    tracing::info!("  PUT    /api/v1/sessions/:id/parameters");
    tracing::info!("  POST   /api/v1/sessions/:id/mesh");
    tracing::info!("  POST   /api/v1/sessions/:id/mesh/cancel");
    tracing::info!("  POST   /api/v1/sessions/:id/mesh/preview");
    tracing::info!("  POST   /api/v1/sessions/:id/solve");
    tracing::info!("  GET    /api/v1/sessions/:id/solve/log");
    tracing::info!("  GET    /api/v1/sessions/:id/result");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
