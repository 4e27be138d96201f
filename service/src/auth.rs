//! Autenticación del servicio: Bearer JWT (HS256) o Basic.
//!
//! Precedencia: con `jwt_secret` sólo se acepta un JWT válido; si no, con
//! `basic_user`/`basic_pass` se exige Basic; sin nada configurado, se permite.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine as _;
use chrono::Utc;
use common::{EtlError, ServiceDoc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::state::AppState;

pub const TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    Jwt { secret: String },
    Basic { user: String, pass: String },
    Open,
}

impl AuthMode {
    pub fn for_service(svc: &ServiceDoc) -> AuthMode {
        if let Some(secret) = &svc.jwt_secret {
            return AuthMode::Jwt { secret: secret.clone() };
        }
        match (&svc.basic_user, &svc.basic_pass) {
            (Some(user), Some(pass)) => AuthMode::Basic { user: user.clone(), pass: pass.clone() },
            _ => AuthMode::Open,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Credenciales `Authorization: Basic base64(user:pass)`.
pub fn parse_basic(headers: &HeaderMap) -> Result<(String, String), EtlError> {
    let auth = header_str(headers, header::AUTHORIZATION)
        .ok_or_else(|| EtlError::Auth("falta el header Authorization".into()))?;
    let encoded = auth
        .strip_prefix("Basic ")
        .or_else(|| auth.strip_prefix("basic "))
        .ok_or_else(|| EtlError::Auth("se esperaba esquema Basic".into()))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| EtlError::Auth("credenciales Basic inválidas".into()))?;
    let decoded = String::from_utf8(decoded).map_err(|_| EtlError::Auth("credenciales Basic no son utf8".into()))?;
    let (user, pass) = decoded
        .split_once(':')
        .ok_or_else(|| EtlError::Auth("se esperaba usuario:clave".into()))?;
    Ok((user.to_string(), pass.to_string()))
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    let auth = header_str(headers, header::AUTHORIZATION)?;
    auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer ")).map(str::trim)
}

pub fn issue_token(secret: &str, subject: &str) -> Result<String, EtlError> {
    let now = Utc::now().timestamp();
    let claims = Claims { sub: subject.to_string(), iat: now, exp: now + TOKEN_TTL_SECS };
    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
        .map_err(|e| EtlError::Auth(format!("no se pudo firmar el token: {e}")))
}

pub fn verify_token(secret: &str, token: &str) -> Result<Claims, EtlError> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|e| EtlError::Auth(format!("token inválido: {e}")))
}

/// Valida los headers de un pedido contra el modo del servicio.
pub fn check(mode: &AuthMode, headers: &HeaderMap) -> Result<(), EtlError> {
    match mode {
        AuthMode::Open => Ok(()),
        AuthMode::Jwt { secret } => {
            let token = bearer(headers).ok_or_else(|| EtlError::Auth("falta el token Bearer".into()))?;
            let claims = verify_token(secret, token)?;
            debug!("JWT válido para '{}'", claims.sub);
            Ok(())
        }
        AuthMode::Basic { user, pass } => {
            let (u, p) = parse_basic(headers)?;
            if &u == user && &p == pass {
                Ok(())
            } else {
                Err(EtlError::Auth("usuario o clave incorrectos".into()))
            }
        }
    }
}

pub fn unauthorized(err: &EtlError) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"ok": false, "error": err.to_string()}))).into_response()
}

/// Middleware para las rutas protegidas.
pub async fn require_auth(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match check(&state.auth, req.headers()) {
        Ok(()) => next.run(req).await,
        Err(e) => unauthorized(&e),
    }
}
