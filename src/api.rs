use log::{debug, info};
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::auth::{AuthManager, AuthResponse, LoginError, LoginSpec, TokenRefreshSpec};
use crate::{Error, JWE_TOKEN_HEADER};


#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginStatus {
    pub token_present: bool,
    pub header_present: bool,
    pub https_mode: bool,
}

pub async fn serve(bind: SocketAddr, manager: Arc<AuthManager>) {
    info!("API listening on {bind}");
    warp::serve(routes(manager)).try_bind(bind).await;
}

pub fn routes(
    manager: Arc<AuthManager>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let manager = warp::any().map(move || manager.clone());

    let login = warp::path!("api" / "v1" / "login")
        .and(warp::post())
        .and(warp::body::json())
        .and(manager.clone())
        .then(login);

    let refresh = warp::path!("api" / "v1" / "token" / "refresh")
        .and(warp::post())
        .and(warp::body::json())
        .and(manager.clone())
        .then(refresh);

    let modes = warp::path!("api" / "v1" / "login" / "modes")
        .and(warp::get())
        .and(manager.clone())
        .map(|manager: Arc<AuthManager>| {
            json(
                StatusCode::OK,
                &serde_json::json!({ "modes": manager.authentication_modes() }),
            )
        });

    let skippable = warp::path!("api" / "v1" / "login" / "skippable")
        .and(warp::get())
        .and(manager)
        .map(|manager: Arc<AuthManager>| {
            json(
                StatusCode::OK,
                &serde_json::json!({ "skippable": manager.authentication_skippable() }),
            )
        });

    let status = warp::path!("api" / "v1" / "login" / "status")
        .and(warp::get())
        .and(warp::header::optional::<String>(JWE_TOKEN_HEADER))
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::header::optional::<String>("x-forwarded-proto"))
        .map(|token: Option<String>, authorization: Option<String>, proto: Option<String>| {
            let status = LoginStatus {
                token_present: token.is_some_and(|v| !v.is_empty()),
                header_present: authorization.is_some_and(|v| !v.is_empty()),
                https_mode: proto.is_some_and(|v| v.eq_ignore_ascii_case("https")),
            };
            json(StatusCode::OK, &status)
        });

    login
        .or(refresh)
        .unify()
        .or(modes)
        .unify()
        .or(skippable)
        .unify()
        .or(status)
        .unify()
        .recover(recover)
        .unify()
}

async fn login(spec: LoginSpec, manager: Arc<AuthManager>) -> Response {
    match manager.login(&spec).await {
        Ok(resp) => json(StatusCode::OK, &resp),
        Err(LoginError {
            error,
            response: Some(resp),
        }) => {
            debug!("login rejected: {error}");
            json(status_of(&error), &resp)
        }
        Err(LoginError {
            error,
            response: None,
        }) => {
            debug!("login failed: {error}");
            error_reply(&error)
        }
    }
}

async fn refresh(spec: TokenRefreshSpec, manager: Arc<AuthManager>) -> Response {
    match manager.refresh(&spec.jwe_token).await {
        Ok(token) => json(
            StatusCode::OK,
            &AuthResponse {
                jwe_token: Some(token),
                errors: Vec::new(),
            },
        ),
        Err(e) => {
            debug!("token refresh failed: {e}");
            error_reply(&e)
        }
    }
}

async fn recover(rejection: Rejection) -> Result<Response, Infallible> {
    let error = if rejection.is_not_found() {
        Error::NotFound("not found".into())
    } else if let Some(e) = rejection.find::<warp::body::BodyDeserializeError>() {
        Error::invalid(format!("invalid request body: {e}"))
    } else {
        Error::invalid(format!("invalid request: {rejection:?}"))
    };
    Ok(error_reply(&error))
}

fn status_of(error: &Error) -> StatusCode {
    StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn error_reply(error: &Error) -> Response {
    json(status_of(error), error)
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}
