//! Runs mesh generation and the solver once, locally, without the HTTP layer.
//!
//! Usage: turgor_run <geometry.geo> [scale] [young poisson fix|outer pressure]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use turgolab_service::config::ServiceConfig;
use turgolab_service::mesh::MeshGenerator;
use turgolab_service::models::{DirichletBoundary, SimulationParameters, DEFAULT_SCALE};
use turgolab_service::params::ParameterStore;
use turgolab_service::solver::SolverRunner;
use turgolab_service::task::{CancelHandle, LogBuffer};
use turgolab_service::workspace::{RunWorkspace, ARCHIVE_FILE};

fn parse_args(args: &[String]) -> Result<(PathBuf, f64, SimulationParameters), Box<dyn std::error::Error>> {
    let geometry = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("geometry.geo"));
    let scale = match args.get(2) {
        Some(s) => s.parse()?,
        None => DEFAULT_SCALE,
    };

    let mut params = SimulationParameters::default();
    if args.len() >= 7 {
        params.young = args[3].parse()?;
        params.poisson = args[4].parse()?;
        params.dirichlet = match args[5].as_str() {
            "fix" => DirichletBoundary::Fix,
            "outer" => DirichletBoundary::Outer,
            other => return Err(format!("unknown boundary {:?}, expected fix or outer", other).into()),
        };
        params.pressure = args[6].parse()?;
    }
    Ok((geometry, scale, params))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let (geometry, scale, params) = parse_args(&args)?;
    let config = ServiceConfig::from_env();

    let workspace = RunWorkspace::create(&config.work_root)?;
    let cancel = CancelHandle::new();

    let mesher = MeshGenerator::new(vec![config.gmsh_path.clone()], config.mesh_timeout);
    let outcome = mesher.generate(&workspace, &geometry, scale, &cancel).await?;
    if !outcome.succeeded() {
        return Err(format!("Mesh generation failed:\n{}", outcome.output_text()).into());
    }
    println!("Mesh generated successfully!");

    ParameterStore::new(workspace.params_path()).save(&params)?;

    // Print solver output as it arrives
    let log = LogBuffer::new();
    let printed = Arc::new(AtomicUsize::new(0));
    let printer = {
        let log = log.clone();
        let printed = printed.clone();
        tokio::spawn(async move {
            loop {
                for line in log.since(printed.load(Ordering::SeqCst)) {
                    println!("{}", line);
                    printed.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };

    let solver = SolverRunner::new(config.solver_command.clone(), config.solver_timeout);
    let report = solver.run(&workspace, &log, &cancel).await;
    printer.abort();
    let _ = printer.await;
    for line in log.since(printed.load(Ordering::SeqCst)) {
        println!("{}", line);
    }

    let report = report?;
    if !report.outcome.succeeded() {
        return Err("Simulation failed with errors. See output above.".into());
    }

    println!("Simulation completed.");
    if let Some(plot) = &report.plot {
        let dest = PathBuf::from("plot.png");
        std::fs::copy(plot, &dest)?;
        println!("Plot written to {}", dest.display());
    }
    if let Some(archive) = &report.archive {
        std::fs::copy(archive, ARCHIVE_FILE)?;
        println!("Results written to {}", ARCHIVE_FILE);
    }

    Ok(())
}
