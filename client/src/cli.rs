use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use common::io::file::{read_csv, read_json};
use common::transforms::suggest_join_pairs;
use common::{compile, DataFrame, ProjectStore, RunKind, RunRecord};
use runner::{run_etl, JobRunner};
use serde_json::{Map, Value};
use service::ServiceManager;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fetl", version)]
#[command(about = "Ejecuta ETLs, jobs y servicios de un proyecto fetl")]
pub struct Cli {
    /// Archivo de proyecto (.fetl)
    #[arg(long, short, global = true, env = "FETL_PROJECT")]
    pub project: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Ejecuta un ETL (por id o nombre)
    RunEtl {
        #[arg(value_name = "ETL")]
        etl: String,

        /// Override `<nodo>.<clave>=<valor>`; el valor se lee como JSON si puede
        #[arg(long = "set", value_name = "NODO.CLAVE=VALOR")]
        overrides: Vec<String>,
    },
    /// Ejecuta un job por etapas
    RunJob {
        #[arg(value_name = "JOB")]
        job: String,
    },
    /// Levanta un servicio HTTP hasta ctrl-c
    Serve {
        #[arg(value_name = "SERVICIO")]
        service: String,
    },
    /// Compila todos los ETLs del proyecto (o uno) sin ejecutarlos
    Check {
        #[arg(value_name = "ETL")]
        etl: Option<String>,
    },
    /// Propone pares de columnas para un join entre dos archivos CSV/JSON
    SuggestKeys {
        #[arg(value_name = "IZQUIERDA")]
        left: PathBuf,
        #[arg(value_name = "DERECHA")]
        right: PathBuf,
    },
}

fn open_store(project: Option<&Path>) -> Result<Arc<ProjectStore>> {
    let path = project.ok_or_else(|| anyhow!("falta --project (o FETL_PROJECT)"))?;
    let store = ProjectStore::open(path).with_context(|| format!("abriendo {}", path.display()))?;
    Ok(Arc::new(store))
}

/// `4.path=otro.csv` -> ("4.path", "otro.csv"); `2.n=5` -> ("2.n", 5).
pub fn parse_override(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("override '{raw}' inválida: se esperaba NODO.CLAVE=VALOR"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

/// ctrl-c cancela el token devuelto.
fn stop_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("ctrl-c: cancelando");
            on_signal.cancel();
        }
    });
    token
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::RunEtl { etl, overrides } => {
            let store = open_store(cli.project.as_deref())?;
            run_etl_cmd(&store, &etl, &overrides).await
        }
        Commands::RunJob { job } => {
            let store = open_store(cli.project.as_deref())?;
            run_job_cmd(store, &job).await
        }
        Commands::Serve { service } => {
            let store = open_store(cli.project.as_deref())?;
            let manager = ServiceManager::new(store);
            let served = manager.serve(&service, stop_on_ctrl_c()).await;
            manager.stop_all();
            served.map_err(Into::into)
        }
        Commands::Check { etl } => {
            let store = open_store(cli.project.as_deref())?;
            check_cmd(&store, etl.as_deref())
        }
        Commands::SuggestKeys { left, right } => {
            let pairs = suggest_join_pairs(&load_table(&left)?, &load_table(&right)?);
            if pairs.is_empty() {
                println!("sin candidatos");
            }
            for (l, r) in pairs {
                println!("{l} = {r}");
            }
            Ok(())
        }
    }
}

async fn run_etl_cmd(store: &ProjectStore, key: &str, raw_overrides: &[String]) -> Result<()> {
    let etl = store.etl(key).ok_or_else(|| anyhow!("el ETL '{key}' no existe"))?;
    let mut overrides = Map::new();
    for raw in raw_overrides {
        let (k, v) = parse_override(raw)?;
        overrides.insert(k, v);
    }

    let log_name = if etl.name.trim().is_empty() { &etl.id } else { &etl.name };
    let log = store.logs().etl_log(log_name)?;
    let log_path = log.path_string();
    info!("log de la corrida: {log_path}");

    let result = run_etl(&etl, &overrides, &store.base_dir(), log, stop_on_ctrl_c()).await;
    store.append_run(RunRecord::now(RunKind::Etl, &etl.id, &etl.name, result.is_ok(), log_path.clone()))?;

    let out = result.with_context(|| format!("ETL '{}' (log: {log_path})", etl.name))?;
    println!("ok: {} nodos, {} avisos", out.order.len(), out.warnings.len());
    for w in &out.warnings {
        println!("  aviso: {w}");
    }
    println!("log: {log_path}");
    Ok(())
}

async fn run_job_cmd(store: Arc<ProjectStore>, key: &str) -> Result<()> {
    let job = store.job(key).ok_or_else(|| anyhow!("el job '{key}' no existe"))?;
    let services = ServiceManager::new(store.clone());
    let runner = JobRunner::new(store.clone())
        .with_services(services.clone())
        .with_stop(stop_on_ctrl_c());

    let outcome = runner.run(&job).await?;
    services.stop_all();
    store.append_run(RunRecord::now(
        RunKind::Job,
        &job.id,
        &job.name,
        outcome.success,
        outcome.log_path.clone(),
    ))?;

    println!("log: {}", outcome.log_path);
    if !outcome.success {
        for e in &outcome.errors {
            println!("  error: {e}");
        }
        bail!("job '{}' terminado con {} errores", job.name, outcome.errors.len());
    }
    println!("ok");
    Ok(())
}

fn check_cmd(store: &ProjectStore, only: Option<&str>) -> Result<()> {
    let project = store.snapshot();
    let etls: Vec<_> = match only {
        Some(key) => vec![project.etl(key).cloned().ok_or_else(|| anyhow!("el ETL '{key}' no existe"))?],
        None => project.etls.clone(),
    };

    let mut failed = 0;
    for etl in &etls {
        match compile(etl, &Map::new()) {
            Ok(compiled) => {
                let order: Vec<String> = compiled.dag.topo_order().iter().map(|id| id.to_string()).collect();
                println!("ok    {} [{}]", etl.name, order.join(" -> "));
            }
            Err(e) => {
                failed += 1;
                println!("error {}: {e}", etl.name);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} de {} ETLs no compilan", etls.len());
    }
    Ok(())
}

fn load_table(path: &Path) -> Result<DataFrame> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let df = match ext.as_str() {
        "csv" => read_csv(path, None, true)?,
        "json" | "jsonl" => read_json(path)?,
        other => bail!("extensión '{other}' no soportada en {}", path.display()),
    };
    Ok(df)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn override_con_valor_json_o_texto() {
        assert_eq!(parse_override("2.n=5").unwrap(), ("2.n".to_string(), json!(5)));
        assert_eq!(parse_override("1.path=in.csv").unwrap(), ("1.path".to_string(), json!("in.csv")));
        assert_eq!(parse_override("3.flag=true").unwrap().1, json!(true));
        assert!(parse_override("sin_igual").is_err());
    }

    #[test]
    fn cli_parsea_subcomandos() {
        let cli = Cli::try_parse_from(["fetl", "-p", "x.fetl", "run-etl", "e1", "--set", "1.path=a.csv"]).unwrap();
        assert_eq!(cli.project, Some(PathBuf::from("x.fetl")));
        match cli.command {
            Commands::RunEtl { etl, overrides } => {
                assert_eq!(etl, "e1");
                assert_eq!(overrides, vec!["1.path=a.csv".to_string()]);
            }
            _ => panic!("subcomando inesperado"),
        }
        assert!(Cli::try_parse_from(["fetl", "nada"]).is_err());
    }

    #[test]
    fn check_reporta_etl_con_ciclo() {
        let dir = tempfile::tempdir().unwrap();
        let project: common::Project = serde_json::from_value(json!({
            "etls": [{"id": "c", "name": "ciclo", "content": {
                "nodes": [
                    {"id": 1, "type": "transform", "subtype": "select"},
                    {"id": 2, "type": "transform", "subtype": "select"}
                ],
                "edges": [{"source": 1, "target": 2}, {"source": 2, "target": 1}]
            }}]
        }))
        .unwrap();
        let store = ProjectStore::create(dir.path().join("p.fetl"), project).unwrap();
        assert!(check_cmd(&store, None).is_err());
        assert!(check_cmd(&store, Some("nope")).is_err());
    }
}
