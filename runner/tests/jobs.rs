use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use common::{Project, ProjectStore, Result};
use runner::{JobRunner, ServiceControl};
use serde_json::{json, Value};

/// Gestor de servicios en memoria que anota cada llamada.
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<String>>,
    running: Mutex<Vec<String>>,
}

impl ServiceControl for Recorder {
    fn start(&self, service_id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("start {service_id}"));
        self.running.lock().unwrap().push(service_id.to_string());
        Ok(())
    }

    fn stop(&self, service_id: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("stop {service_id}"));
        self.running.lock().unwrap().retain(|s| s != service_id);
        Ok(())
    }

    fn is_running(&self, service_id: &str) -> bool {
        self.running.lock().unwrap().iter().any(|s| s == service_id)
    }
}

fn csv_to_json(id: &str, input: &str, output: &str) -> Value {
    json!({
        "id": id,
        "name": format!("copia {id}"),
        "content": {
            "nodes": [
                {"id": 1, "type": "source", "subtype": "csv", "config": {"path": input}},
                {"id": 2, "type": "destination", "subtype": "json", "config": {"path": output}}
            ],
            "edges": [{"source": 1, "target": 2}]
        }
    })
}

fn store(dir: &Path, doc: Value) -> Arc<ProjectStore> {
    let project: Project = serde_json::from_value(doc).unwrap();
    Arc::new(ProjectStore::create(dir.join("demo.fetl"), project).unwrap())
}

#[tokio::test]
async fn etapa_paralela_con_dos_etls() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.csv"), "x\n1\n2\n").unwrap();
    fs::write(dir.path().join("b.csv"), "y\nhola\n").unwrap();
    let s = store(
        dir.path(),
        json!({
            "etls": [csv_to_json("e1", "a.csv", "out/a.json"), csv_to_json("e2", "b.csv", "out/b.json")],
            "jobs": [{"id": "j1", "name": "nocturno", "stages": [
                {"parallel": true, "steps": [{"etl_id": "e1"}, {"etl_id": "e2"}]}
            ]}]
        }),
    );
    let job = s.job("j1").unwrap();
    let out = JobRunner::new(s.clone()).run(&job).await.unwrap();

    assert!(out.success, "{:?}", out.errors);
    assert!(out.errors.is_empty());
    assert_eq!(fs::read_to_string(dir.path().join("out/a.json")).unwrap(), r#"[{"x":1},{"x":2}]"#);
    assert!(dir.path().join("out/b.json").exists());

    let job_dir = s.logs().job_dir("nocturno");
    let logs: Vec<String> = fs::read_dir(&job_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    let step_logs = logs.iter().filter(|n| n.contains("-copia_e")).count();
    assert_eq!(step_logs, 2, "{logs:?}");
    assert!(logs.iter().any(|n| out.log_path.ends_with(n.as_str())));
}

fn failing_then_more(on_error: &str) -> Value {
    json!({
        "etls": [
            csv_to_json("roto", "no-existe.csv", "out/roto.json"),
            csv_to_json("bien", "ok.csv", "out/bien.json")
        ],
        "jobs": [{"id": "j", "name": "j", "on_error": on_error, "stages": [
            {"steps": [{"etl_id": "roto"}]},
            {"parallel": true, "steps": [{"etl_id": "bien"}, {"service_id": "api", "action": "start"}]}
        ]}]
    })
}

#[tokio::test]
async fn on_error_stop_no_ejecuta_la_etapa_siguiente() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("ok.csv"), "x\n1\n").unwrap();
    let s = store(dir.path(), failing_then_more("stop"));
    let services = Arc::new(Recorder::default());
    let job = s.job("j").unwrap();

    let out = JobRunner::new(s).with_services(services.clone()).run(&job).await.unwrap();

    assert!(!out.success);
    assert_eq!(out.errors.len(), 1);
    assert!(out.errors[0].contains("IOError"), "{:?}", out.errors);
    assert!(!dir.path().join("out/bien.json").exists());
    assert!(services.calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn on_error_continue_sigue_con_las_etapas() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("ok.csv"), "x\n1\n").unwrap();
    let s = store(dir.path(), failing_then_more("continue"));
    let services = Arc::new(Recorder::default());
    let job = s.job("j").unwrap();

    let out = JobRunner::new(s).with_services(services.clone()).run(&job).await.unwrap();

    assert!(!out.success);
    assert_eq!(out.errors.len(), 1);
    assert!(dir.path().join("out/bien.json").exists());
    assert_eq!(*services.calls.lock().unwrap(), vec!["start api".to_string()]);
    assert!(services.is_running("api"));
}
