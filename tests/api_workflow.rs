use std::io::Read;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use turgolab_service::api::create_router;
use turgolab_service::config::{ServiceConfig, DEFAULT_ANATOMESHR_URL};

const BOUNDARY: &str = "turgolab-boundary";

/// gmsh is stood in for by `sh`, so a geometry file is a script that receives
/// gmsh's arguments. This one writes a mesh to the `-o` target.
const MESHABLE_GEOMETRY: &str = r#"
for last; do :; done
echo "Info    : Meshing 2D..."
echo '$MeshFormat' > "$last"
"#;

const BROKEN_GEOMETRY: &str = "echo \"Error   : line 1: syntax error\" >&2\nexit 1\n";

/// Fake solver: fails like the real one without a mesh, otherwise echoes the
/// parameters and writes the output bundle.
const FAKE_SOLVER: &str = r#"
if [ ! -f geometry.msh ]; then
  echo "FileNotFoundError: geometry.msh" >&2
  exit 1
fi
echo "reading parameters"
tail -n 1 params.csv
echo "Newton iteration 0: r (abs) = 1.0e+00" >&2
echo "Newton solver finished in 3 iterations"
echo '<Xdmf/>' > turgor.xdmf
if [ "${SKIP_H5:-0}" != 1 ]; then printf 'HDF' > turgor.h5; fi
printf 'PNG' > plot.png
"#;

struct Harness {
    dir: TempDir,
    app: Router,
}

fn harness_with(solver_script: &str, default_geometry: &str) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let solver = dir.path().join("solver.sh");
    let geometry = dir.path().join("geometry.geo");
    std::fs::write(&solver, solver_script).unwrap();
    std::fs::write(&geometry, default_geometry).unwrap();

    let config = ServiceConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        gmsh_path: "sh".to_string(),
        solver_command: vec!["sh".to_string(), solver.to_string_lossy().to_string()],
        preview_command: vec![
            "sh".to_string(),
            "-c".to_string(),
            "test -f geometry.msh && printf PNG > mesh_preview.png".to_string(),
        ],
        default_geometry: geometry,
        work_root: dir.path().join("work"),
        mesh_timeout: Some(Duration::from_secs(30)),
        preview_timeout: Some(Duration::from_secs(30)),
        solver_timeout: Some(Duration::from_secs(30)),
        session_ttl: None,
        anatomeshr_url: DEFAULT_ANATOMESHR_URL.to_string(),
    };

    Harness {
        app: create_router(config),
        dir,
    }
}

fn harness() -> Harness {
    harness_with(FAKE_SOLVER, MESHABLE_GEOMETRY)
}

impl Harness {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn json(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let (status, bytes) = self.send(request).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn create_session(&self) -> String {
        let (status, body) = self.json("POST", "/api/v1/sessions", None).await;
        assert_eq!(status, StatusCode::CREATED);
        body["session_id"].as_str().unwrap().to_string()
    }

    async fn upload(&self, session: &str, file_name: &str, contents: &str) -> (StatusCode, Value) {
        let body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"geometry\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n{contents}\r\n--{BOUNDARY}--\r\n"
        );
        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/sessions/{session}/geometry"))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap();
        let (status, bytes) = self.send(request).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn wait_for_solve(&self, session: &str) -> Value {
        for _ in 0..400 {
            let (status, body) = self
                .json("GET", &format!("/api/v1/sessions/{session}/solve"), None)
                .await;
            assert_eq!(status, StatusCode::OK);
            let state = body["status"].as_str().unwrap();
            if state != "running" && state != "pending" {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("solve did not finish");
    }
}

fn zip_entries(bytes: &[u8]) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
    let mut names: Vec<String> = (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn root_and_health_endpoints_respond() {
    let h = harness();

    let (status, body) = h.json("GET", "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["anatomeshr_url"], DEFAULT_ANATOMESHR_URL);

    let (status, body) = h.json("GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    let (status, body) = h.json("GET", "/api/v1/version", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["api_version"], "v1");
}

#[tokio::test]
async fn full_workflow_produces_downloadable_archive() {
    let h = harness();
    let session = h.create_session().await;

    let (status, body) = h.json("GET", &format!("/api/v1/sessions/{session}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["view"]["plot_displayed"], false);
    assert_eq!(body["view"]["mesh_ready"], false);

    let (status, body) = h
        .upload(&session, "cells.geo", MESHABLE_GEOMETRY)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["geometry"], "uploaded_cells.geo");
    assert_eq!(body["default"], false);

    let params = json!({"young": 200.0, "poisson": 0.4, "dirichlet": "fix", "pressure": 0.3});
    let (status, body) = h
        .json("PUT", &format!("/api/v1/sessions/{session}/parameters"), Some(params.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, params);

    let (status, body) = h
        .json("GET", &format!("/api/v1/sessions/{session}/parameters"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, params);

    let (status, body) = h
        .json("POST", &format!("/api/v1/sessions/{session}/mesh"), Some(json!({"scale": 1.5})))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "succeeded");
    assert_eq!(body["message"], "Mesh generated successfully!");

    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/mesh/preview"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, png) = h
        .send(
            Request::get(format!("/api/v1/sessions/{session}/mesh/preview"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(png, b"PNG");

    let (status, body) = h
        .json("POST", &format!("/api/v1/sessions/{session}/solve"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "running");

    let body = h.wait_for_solve(&session).await;
    assert_eq!(body["status"], "succeeded", "{body}");
    assert_eq!(body["exit_code"], 0);
    assert_eq!(
        body["log"],
        json!([
            "reading parameters",
            "200.0,0.4,fix,0.3",
            "Newton iteration 0: r (abs) = 1.0e+00",
            "Newton solver finished in 3 iterations"
        ])
    );
    assert_eq!(body["plot_available"], true);
    assert_eq!(body["archive_available"], true);

    let (status, plot) = h
        .send(
            Request::get(format!("/api/v1/sessions/{session}/solve/plot"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plot, b"PNG");

    let response = h
        .app
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/sessions/{session}/result"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"turgor_output.zip\""
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(zip_entries(&bytes), vec!["turgor.h5", "turgor.xdmf"]);

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
    let mut xdmf = String::new();
    archive
        .by_name("turgor.xdmf")
        .unwrap()
        .read_to_string(&mut xdmf)
        .unwrap();
    assert_eq!(xdmf.trim(), "<Xdmf/>");

    let (_, body) = h.json("GET", &format!("/api/v1/sessions/{session}"), None).await;
    assert_eq!(body["view"]["plot_displayed"], true);
    assert_eq!(body["view"]["mesh_ready"], true);
    assert_eq!(body["view"]["result_available"], true);
    assert_eq!(body["solve_state"], "succeeded");
}

#[tokio::test]
async fn archive_without_companion_has_one_entry() {
    let solver = format!("SKIP_H5=1\n{FAKE_SOLVER}");
    let h = harness_with(&solver, MESHABLE_GEOMETRY);
    let session = h.create_session().await;

    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/mesh"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    h.json("POST", &format!("/api/v1/sessions/{session}/solve"), None).await;
    let body = h.wait_for_solve(&session).await;
    assert_eq!(body["status"], "succeeded");

    let (status, bytes) = h
        .send(
            Request::get(format!("/api/v1/sessions/{session}/result"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(zip_entries(&bytes), vec!["turgor.xdmf"]);
}

#[tokio::test]
async fn solve_without_mesh_fails_with_solver_output() {
    let h = harness();
    let session = h.create_session().await;

    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/solve"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let body = h.wait_for_solve(&session).await;
    assert_eq!(body["status"], "failed");
    assert_eq!(body["exit_code"], 1);
    assert_eq!(body["log"], json!(["FileNotFoundError: geometry.msh"]));
    assert_eq!(body["archive_available"], false);

    let (status, _) = h
        .json("GET", &format!("/api/v1/sessions/{session}/result"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // defaults were persisted because nothing had been saved
    let (_, params) = h
        .json("GET", &format!("/api/v1/sessions/{session}/parameters"), None)
        .await;
    assert_eq!(params["young"], 200.0);
    assert_eq!(params["dirichlet"], "fix");
}

#[tokio::test]
async fn mesh_failure_surfaces_gmsh_output() {
    let h = harness();
    let session = h.create_session().await;
    h.upload(&session, "broken.geo", BROKEN_GEOMETRY).await;

    let (status, body) = h
        .json("POST", &format!("/api/v1/sessions/{session}/mesh"), Some(json!({"scale": 2.0})))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["status"], "failed");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("Mesh generation failed:\nError"));

    let (_, body) = h.json("GET", &format!("/api/v1/sessions/{session}"), None).await;
    assert_eq!(body["view"]["mesh_ready"], false);

    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/mesh/preview"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn missing_default_geometry_is_reported() {
    let h = harness();
    let session = h.create_session().await;

    // remove the bundled default so the session has no geometry at all
    std::fs::remove_file(h.dir.path().join("geometry.geo")).unwrap();

    let (status, body) = h
        .json("POST", &format!("/api/v1/sessions/{session}/mesh"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("Geometry file not found"));

    let (_, body) = h.json("GET", &format!("/api/v1/sessions/{session}"), None).await;
    assert_eq!(body["view"]["mesh_ready"], false);
}

#[tokio::test]
async fn rejects_invalid_inputs() {
    let h = harness();
    let session = h.create_session().await;

    let (status, _) = h
        .json(
            "PUT",
            &format!("/api/v1/sessions/{session}/parameters"),
            Some(json!({"young": 200.0, "poisson": 0.5, "dirichlet": "fix", "pressure": 0.3})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h
        .json(
            "POST",
            &format!("/api/v1/sessions/{session}/mesh"),
            Some(json!({"scale": 0.01})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h.upload(&session, "cells.msh", "not geo").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h
        .json("GET", "/api/v1/sessions/00000000-0000-0000-0000-000000000000", None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn log_is_served_incrementally_and_in_order() {
    let script = r#"
i=1
while [ $i -le 5 ]; do
  echo "step $i"
  sleep 0.1
  i=$((i + 1))
done
echo '<Xdmf/>' > turgor.xdmf
"#;
    let h = harness_with(script, "");
    let session = h.create_session().await;
    h.json("POST", &format!("/api/v1/sessions/{session}/solve"), None).await;

    let expected: Vec<String> = (1..=5).map(|i| format!("step {i}")).collect();
    let mut seen: Vec<String> = Vec::new();
    for _ in 0..400 {
        let (status, body) = h
            .json(
                "GET",
                &format!("/api/v1/sessions/{session}/solve/log?from={}", seen.len()),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        for line in body["lines"].as_array().unwrap() {
            seen.push(line.as_str().unwrap().to_string());
        }
        assert_eq!(body["next"].as_u64().unwrap() as usize, seen.len());
        // every observation is a prefix of the final output
        assert_eq!(seen[..], expected[..seen.len()]);
        if body["status"] == "succeeded" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn concurrent_solve_is_rejected_and_can_be_cancelled() {
    let h = harness_with("echo started\nexec sleep 5\n", "");
    let session = h.create_session().await;

    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/solve"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/solve"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/solve/cancel"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let body = h.wait_for_solve(&session).await;
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["error_message"], "Simulation cancelled");

    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/solve/cancel"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn sessions_do_not_share_files() {
    let h = harness();
    let first = h.create_session().await;
    let second = h.create_session().await;

    h.json(
        "PUT",
        &format!("/api/v1/sessions/{first}/parameters"),
        Some(json!({"young": 50.0, "poisson": 0.2, "dirichlet": "outer", "pressure": 1.0})),
    )
    .await;
    let (status, _) = h
        .json("GET", &format!("/api/v1/sessions/{second}/parameters"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{first}/mesh"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    h.json("POST", &format!("/api/v1/sessions/{second}/solve"), None).await;
    let body = h.wait_for_solve(&second).await;
    assert_eq!(body["status"], "failed");

    let (status, _) = h
        .json("DELETE", &format!("/api/v1/sessions/{first}"), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = h.json("GET", &format!("/api/v1/sessions/{first}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn running_solve_locks_its_inputs() {
    let script = "echo start\nsleep 1\ncat geometry.msh || exit 7\necho '<Xdmf/>' > turgor.xdmf\n";
    let h = harness_with(script, MESHABLE_GEOMETRY);
    let session = h.create_session().await;

    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/mesh"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/solve"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _) = h.upload(&session, "other.geo", MESHABLE_GEOMETRY).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = h
        .json(
            "PUT",
            &format!("/api/v1/sessions/{session}/parameters"),
            Some(json!({"young": 10.0, "poisson": 0.1, "dirichlet": "outer", "pressure": 1.0})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/mesh"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let body = h.wait_for_solve(&session).await;
    assert_eq!(body["status"], "succeeded", "{body}");
    assert_eq!(body["log"], json!(["start", "$MeshFormat"]));

    let (_, params) = h
        .json("GET", &format!("/api/v1/sessions/{session}/parameters"), None)
        .await;
    assert_eq!(params["dirichlet"], "fix");
}

#[tokio::test]
async fn mesh_runs_without_blocking_the_session_and_can_be_cancelled() {
    let h = harness_with(FAKE_SOLVER, "echo meshing\nsleep 5\n");
    let session = h.create_session().await;

    let app = h.app.clone();
    let uri = format!("/api/v1/sessions/{session}/mesh");
    let mesh = tokio::spawn(async move {
        let request = Request::post(uri).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice::<Value>(&bytes).unwrap())
    });

    let mut running = false;
    for _ in 0..100 {
        let (status, body) = tokio::time::timeout(
            Duration::from_millis(500),
            h.json("GET", &format!("/api/v1/sessions/{session}"), None),
        )
        .await
        .expect("session is readable while gmsh runs");
        assert_eq!(status, StatusCode::OK);
        if body["active_step"] == "mesh" {
            running = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(running, "mesh step never started");

    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/solve"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/mesh/preview"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = h
        .json("POST", &format!("/api/v1/sessions/{session}/mesh/cancel"), None)
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["cancelled"], "mesh");

    let (status, body) = tokio::time::timeout(Duration::from_secs(3), mesh)
        .await
        .expect("cancelled mesh returns promptly")
        .unwrap();
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["message"], "Mesh generation cancelled");

    let (_, body) = h.json("GET", &format!("/api/v1/sessions/{session}"), None).await;
    assert_eq!(body["active_step"], Value::Null);
    assert_eq!(body["view"]["mesh_ready"], false);

    let (status, _) = h
        .json("POST", &format!("/api/v1/sessions/{session}/mesh/cancel"), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}
