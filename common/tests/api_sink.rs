//! Destino api contra un receptor HTTP local.

use std::sync::{Arc, Mutex};

use axum::{extract::State, routing::post, Json, Router};
use common::io::http::{http_client, post_batches, ApiSink};
use common::{DataFrame, EtlError};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Receiver {
    sizes: Arc<Mutex<Vec<usize>>>,
    // si está, se cancela al recibir el primer lote
    cancel_on_first: Option<CancellationToken>,
}

async fn receive(State(rx): State<Receiver>, Json(batch): Json<Vec<Value>>) -> Json<Value> {
    rx.sizes.lock().unwrap().push(batch.len());
    if let Some(stop) = &rx.cancel_on_first {
        stop.cancel();
    }
    Json(json!({"ok": true}))
}

async fn serve(rx: Receiver) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route("/lotes", post(receive)).with_state(rx);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/lotes")
}

fn five_records() -> DataFrame {
    let rows: Vec<Value> = (1..=5).map(|i| json!({"n": i})).collect();
    DataFrame::from_records(&rows).unwrap()
}

fn sink(url: String) -> ApiSink {
    serde_json::from_value(json!({"url": url, "batch_size": 2})).unwrap()
}

#[tokio::test]
async fn cinco_registros_en_lotes_de_dos() {
    let rx = Receiver::default();
    let url = serve(rx.clone()).await;

    let sent = post_batches(&http_client(), &sink(url), &five_records(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(sent, 5);
    assert_eq!(*rx.sizes.lock().unwrap(), vec![2, 2, 1]);
}

#[tokio::test]
async fn cancelar_tras_el_primer_lote_corta_el_envio() {
    let stop = CancellationToken::new();
    let rx = Receiver {
        sizes: Arc::default(),
        cancel_on_first: Some(stop.clone()),
    };
    let url = serve(rx.clone()).await;

    let err = post_batches(&http_client(), &sink(url), &five_records(), &stop)
        .await
        .unwrap_err();
    assert_eq!(err, EtlError::Cancelled);
    assert_eq!(*rx.sizes.lock().unwrap(), vec![2]);
}

#[tokio::test]
async fn receptor_con_error_es_io_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route(
        "/lotes",
        post(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "caído") }),
    );
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let err = post_batches(
        &http_client(),
        &sink(format!("http://{addr}/lotes")),
        &five_records(),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.tag(), "IOError");
}
