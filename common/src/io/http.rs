//! Orígenes y destinos HTTP (reqwest).

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Map, Value as Json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::flex;
use crate::error::{EtlError, Result};
use crate::frame::DataFrame;
use crate::io::records_from_json;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BATCH_SIZE: usize = 500;

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiSource {
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub url: Option<String>,
    /// GET (por defecto) o POST.
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Map<String, Json>,
    #[serde(default)]
    pub params: Map<String, Json>,
    #[serde(default)]
    pub body: Option<Json>,
    /// Ruta con puntos hasta la lista de registros, ej: "data.items".
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub records_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSink {
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Map<String, Json>,
    #[serde(default = "default_batch_size", deserialize_with = "flex::usize")]
    pub batch_size: usize,
}

impl Default for ApiSink {
    fn default() -> Self {
        Self {
            url: None,
            method: None,
            headers: Map::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Cliente compartido con timeout por petición de 30 s.
pub fn http_client() -> Client {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn method(raw: Option<&str>, default: Method) -> Result<Method> {
    match raw {
        None => Ok(default),
        Some(m) => Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| EtlError::config(format!("método HTTP '{m}' inválido"))),
    }
}

fn text_of(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn with_headers(mut req: RequestBuilder, headers: &Map<String, Json>) -> RequestBuilder {
    for (k, v) in headers {
        req = req.header(k.as_str(), text_of(v));
    }
    req
}

/// Envía la petición; se corta en cuanto `stop` se cancela.
async fn send(req: RequestBuilder, url: &str, stop: &CancellationToken) -> Result<Response> {
    let resp = tokio::select! {
        _ = stop.cancelled() => return Err(EtlError::Cancelled),
        r = req.send() => r.map_err(|e| EtlError::io(format!("HTTP {url}: {e}")))?,
    };
    let status = resp.status();
    if !status.is_success() {
        return Err(EtlError::io(format!("HTTP {} en {url}", status.as_u16())));
    }
    Ok(resp)
}

pub async fn fetch(client: &Client, src: &ApiSource, stop: &CancellationToken) -> Result<DataFrame> {
    if stop.is_cancelled() {
        return Err(EtlError::Cancelled);
    }
    let url = src.url.as_deref().ok_or_else(|| EtlError::config("origen api sin 'url'"))?;
    let method = method(src.method.as_deref(), Method::GET)?;
    debug!("{method} {url}");

    let mut req = with_headers(client.request(method, url), &src.headers);
    if !src.params.is_empty() {
        let query: Vec<(String, String)> = src.params.iter().map(|(k, v)| (k.clone(), text_of(v))).collect();
        req = req.query(&query);
    }
    if let Some(body) = &src.body {
        req = req.json(body);
    }

    let resp = send(req, url, stop).await?;
    let doc: Json = tokio::select! {
        _ = stop.cancelled() => return Err(EtlError::Cancelled),
        r = resp.json() => r.map_err(|e| EtlError::io(format!("respuesta JSON inválida de {url}: {e}")))?,
    };
    let records = records_from_json(doc, src.records_path.as_deref())?;
    DataFrame::from_records(&records)
}

/// Envía los registros en lotes de `batch_size`. El token se revisa antes de
/// cada lote, así que nunca se envía nada después de una cancelación.
pub async fn post_batches(client: &Client, sink: &ApiSink, df: &DataFrame, stop: &CancellationToken) -> Result<usize> {
    let url = sink.url.as_deref().ok_or_else(|| EtlError::config("destino api sin 'url'"))?;
    let method = method(sink.method.as_deref(), Method::POST)?;
    let records = df.to_records();
    let mut sent = 0usize;

    for batch in records.chunks(sink.batch_size.max(1)) {
        if stop.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        let req = with_headers(client.request(method.clone(), url), &sink.headers).json(batch);
        send(req, url, stop).await?;
        sent += batch.len();
        debug!("lote enviado a {url}: {sent}/{}", records.len());
    }
    Ok(sent)
}
