//! Rutas del servicio contra el router en memoria.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use base64::Engine as _;
use common::{Project, ProjectStore, RunKind};
use serde_json::{json, Value};
use service::ServiceManager;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn project(dir: &Path, service: Value) -> Arc<ProjectStore> {
    fs::write(dir.join("in.csv"), "a,b\n1,2\n3,4\n").unwrap();
    let doc = json!({
        "name": "demo",
        "etls": [{
            "id": "e1",
            "name": "copia",
            "content": {
                "nodes": [
                    {"id": 1, "type": "source", "subtype": "csv", "config": {"path": "in.csv"}},
                    {"id": 2, "type": "destination", "subtype": "json", "config": {"path": "out/copia.json"}}
                ],
                "edges": [{"source": 1, "target": 2}]
            }
        }, {
            "id": "e2",
            "name": "rota",
            "content": {
                "nodes": [
                    {"id": 1, "type": "source", "subtype": "csv", "config": {"path": "falta.csv"}},
                    {"id": 2, "type": "destination", "subtype": "json", "config": {"path": "out/rota.json"}}
                ],
                "edges": [{"source": 1, "target": 2}]
            }
        }],
        "jobs": [{"id": "j1", "name": "diario", "stages": [{"steps": [{"etl_id": "e1"}]}]}],
        "services": [service]
    });
    let project: Project = serde_json::from_value(doc).unwrap();
    Arc::new(ProjectStore::create(dir.join("demo.fetl"), project).unwrap())
}

fn router(store: Arc<ProjectStore>) -> Router {
    ServiceManager::new(store).router("api", CancellationToken::new()).unwrap()
}

async fn call(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
    (status, body)
}

fn post_json(uri: &str, body: Value, auth: Option<&str>) -> Request<Body> {
    let mut b = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
    if let Some(a) = auth {
        b = b.header(header::AUTHORIZATION, a);
    }
    b.body(Body::from(body.to_string())).unwrap()
}

fn basic(user: &str, pass: &str) -> String {
    format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}")))
}

#[tokio::test]
async fn health_sin_autenticacion() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(project(dir.path(), json!({"id": "api", "jwt_secret": "k"})));
    let (status, body) = call(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "service": "api"}));
}

#[tokio::test]
async fn etl_run_abierto_escribe_log_y_registra_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = project(dir.path(), json!({"id": "api", "etl_ids": ["e1", "e2"]}));
    let app = router(store.clone());

    let (status, body) = call(&app, post_json("/etl/run", json!({"etl_id": "e1"}), None)).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], true);
    let log_path = body["log_path"].as_str().unwrap();
    assert!(Path::new(log_path).exists());
    assert!(fs::read_to_string(log_path).unwrap().contains("copia"));
    assert!(dir.path().join("out/copia.json").exists());

    let runs = store.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].kind, RunKind::Etl);
    assert_eq!(runs[0].id, "e1");
    assert!(runs[0].ok);

    // el historial queda persistido en el archivo del proyecto
    let saved: Value = serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
    assert_eq!(saved["runs"][0]["type"], "etl");
}

#[tokio::test]
async fn etl_run_fallido_devuelve_500_y_tambien_se_registra() {
    let dir = tempfile::tempdir().unwrap();
    let store = project(dir.path(), json!({"id": "api"}));
    let app = router(store.clone());

    let (status, body) = call(&app, post_json("/etl/run", json!({"etl_id": "e2"}), None)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().contains("IOError"));
    assert!(body["log_path"].is_string());
    assert!(!store.runs()[0].ok);
}

#[tokio::test]
async fn etl_no_expuesto_o_inexistente_es_404() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(project(dir.path(), json!({"id": "api", "etl_ids": ["e2"]})));

    let (status, _) = call(&app, post_json("/etl/run", json!({"etl_id": "e1"}), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, body) = call(&app, post_json("/etl/run", json!({"etl_id": "zzz"}), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn job_run_devuelve_resultado_del_job() {
    let dir = tempfile::tempdir().unwrap();
    let store = project(dir.path(), json!({"id": "api"}));
    let app = router(store.clone());

    let (status, body) = call(&app, post_json("/job/run", json!({"job_id": "j1"}), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["errors"], json!([]));
    assert_eq!(store.runs()[0].kind, RunKind::Job);
}

#[tokio::test]
async fn basic_protege_las_rutas() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(project(
        dir.path(),
        json!({"id": "api", "basic_user": "ana", "basic_pass": "pw", "lang": "en"}),
    ));

    let (status, body) = call(&app, Request::get("/echo").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["ok"], false);

    let req = Request::get("/echo").header(header::AUTHORIZATION, basic("ana", "pw")).body(Body::empty()).unwrap();
    let (status, body) = call(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["lang"], "en");

    let req = Request::get("/echo?lang=pt")
        .header(header::AUTHORIZATION, basic("ana", "pw"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(call(&app, req).await.1["lang"], "pt");
}

#[tokio::test]
async fn jwt_emitido_por_token_es_aceptado_y_uno_invalido_no() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(project(
        dir.path(),
        json!({"id": "api", "basic_user": "ana", "basic_pass": "pw", "jwt_secret": "secreto"}),
    ));

    let (status, _) = call(&app, post_json("/token", json!({}), Some(&basic("ana", "mal")))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(&app, post_json("/token", json!({}), Some(&basic("ana", "pw")))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "bearer");
    assert_eq!(body["expires_in"], 86400);
    let token = body["access_token"].as_str().unwrap().to_string();

    // con jwt_secret, Basic ya no alcanza para las rutas protegidas
    let req = Request::get("/echo").header(header::AUTHORIZATION, basic("ana", "pw")).body(Body::empty()).unwrap();
    assert_eq!(call(&app, req).await.0, StatusCode::UNAUTHORIZED);

    let req = Request::get("/echo")
        .header(header::AUTHORIZATION, "Bearer no.es.un.jwt")
        .body(Body::empty())
        .unwrap();
    assert_eq!(call(&app, req).await.0, StatusCode::UNAUTHORIZED);

    let (status, body) = call(
        &app,
        post_json("/etl/run", json!({"etl_id": "e1"}), Some(&format!("Bearer {token}"))),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
}

#[tokio::test]
async fn token_sin_jwt_secret_es_404() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(project(dir.path(), json!({"id": "api", "basic_user": "ana", "basic_pass": "pw"})));
    let (status, _) = call(&app, post_json("/token", json!({}), Some(&basic("ana", "pw")))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cada_pedido_queda_en_el_log_del_servicio() {
    let dir = tempfile::tempdir().unwrap();
    let store = project(dir.path(), json!({"id": "api", "name": "API pública"}));
    let app = router(store.clone());
    call(&app, Request::get("/health").body(Body::empty()).unwrap()).await;

    let svc_dir = store.logs().service_dir("API pública");
    let log = fs::read_dir(&svc_dir).unwrap().next().unwrap().unwrap().path();
    assert!(fs::read_to_string(log).unwrap().contains("GET /health -> 200"));
}

#[tokio::test]
async fn mcp_sin_ollama_responde_502() {
    let dir = tempfile::tempdir().unwrap();
    let store = project(dir.path(), json!({"id": "api"}));
    // puerto reservado sin nadie escuchando
    let mut doc = store.snapshot();
    doc.defaults.mcp.ollama_base_url = "http://127.0.0.1:9".to_string();
    let store = Arc::new(ProjectStore::create(dir.path().join("otro.fetl"), doc).unwrap());
    let app = router(store);

    let (status, body) = call(&app, Request::get("/mcp/models").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["ok"], false);
}
