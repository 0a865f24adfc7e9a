//! Orchestration service for turgor-pressure simulations of 2D cell networks.
//!
//! Meshing (gmsh) and the hyperelastic solve run as external processes; this
//! crate captures parameters, launches those processes inside per-session
//! workspaces, streams their output, and packages the results.

pub mod api;
pub mod archive;
pub mod config;
pub mod mesh;
pub mod models;
pub mod params;
pub mod session;
pub mod solver;
pub mod task;
pub mod workspace;
