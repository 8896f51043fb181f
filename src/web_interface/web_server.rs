//! HTTP query surface.
//!
//! Exposes the query layer under a versioned REST prefix, plus the user,
//! logout, metrics and metrics-store proxy endpoints. The resource routes
//! are generic: the first path segment resolves to a record kind, unknown
//! roots and sub-paths answer with a JSON 404 body.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use warp::http::header::{HeaderValue, CONTENT_TYPE, SET_COOKIE, WWW_AUTHENTICATE};
use warp::http::StatusCode;
use warp::{filters::BoxedFilter, reply, Filter, Rejection, Reply};

use crate::auth::{AuthGate, LogoutOutcome};
use crate::configuration::Config;
use crate::error_handling::types::QueryError;
use crate::ingest::Collector;
use crate::query::query_layer;
use crate::store::RecordKind;

use super::types::ApiError;

type Response = warp::reply::Response;

pub struct WebServer {
    collector: Arc<RwLock<Collector>>,
    gate: Arc<AuthGate>,
    config: Config,
    http: reqwest::Client,
}

fn into_response<R: Reply>(reply: R) -> Response {
    reply.into_response()
}

fn json_status<T: serde::Serialize>(body: &T, status: StatusCode) -> Response {
    reply::with_status(reply::json(body), status).into_response()
}

fn not_found() -> Response {
    json_status(&ApiError::new("Not found"), StatusCode::NOT_FOUND)
}

fn unauthorized() -> Response {
    let mut res = json_status(&ApiError::new("Unauthorized"), StatusCode::UNAUTHORIZED);
    res.headers_mut()
        .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=van"));
    res
}

fn query_result(result: Result<serde_json::Value, QueryError>) -> Response {
    match result {
        Ok(value) => json_status(&value, StatusCode::OK),
        Err(QueryError::NotFound) => not_found(),
        Err(QueryError::BadRequest(message)) => {
            json_status(&ApiError::new(&message), StatusCode::BAD_REQUEST)
        }
    }
}

fn auth_header() -> impl Filter<Extract = (Option<String>,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
}

/// The request's raw query string, or empty when there is none.
fn raw_query() -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::query::raw().or_else(|_| async { Ok::<(String,), Rejection>((String::new(),)) })
}

/// First value of a query parameter in a raw query string.
fn query_param<'a>(raw: &'a str, name: &str) -> Option<&'a str> {
    raw.split('&')
        .find_map(|pair| pair.strip_prefix(name)?.strip_prefix('='))
}

/// Value of the oauth proxy cookie, if the Cookie header carries one.
fn oauth_cookie(header: Option<&str>) -> Option<String> {
    header?
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("_oauth_proxy="))
        .map(|value| value.to_string())
}

impl WebServer {
    pub fn new(collector: Arc<RwLock<Collector>>, gate: Arc<AuthGate>, config: Config) -> Self {
        Self {
            collector,
            gate,
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Serve until cancelled.
    pub async fn serve(self, cancel: CancellationToken) {
        let addr: SocketAddr = (
            self.config
                .listen_host
                .parse::<IpAddr>()
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            self.config.listen_port,
        )
            .into();
        let use_cors = self.config.use_cors;
        let routes = self.routes();
        info!("query API listening on {}", addr);
        if use_cors {
            let cors = warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST", "DELETE"]);
            tokio::select! {
                _ = warp::serve(routes.with(cors)).run(addr) => {},
                _ = cancel.cancelled() => info!("query API stopping"),
            }
        } else {
            tokio::select! {
                _ = warp::serve(routes).run(addr) => {},
                _ = cancel.cancelled() => info!("query API stopping"),
            }
        }
    }

    pub fn routes(&self) -> BoxedFilter<(Response,)> {
        let api = || warp::path("api").and(warp::path("v1alpha1"));
        let log_uri = self.config.log_request_uri;
        let request_log = warp::log::custom(move |info| {
            if log_uri {
                info!("request uri {}", info.path());
            }
        });

        // GET /api/v1alpha1/user
        let gate = self.gate.clone();
        let user = api()
            .and(warp::path("user"))
            .and(warp::path::end())
            .and(warp::get())
            .and(auth_header())
            .and(warp::header::optional::<String>("cookie"))
            .and_then(move |auth: Option<String>, cookies: Option<String>| {
                let gate = gate.clone();
                async move {
                    if !gate.authorize(auth.as_deref()) {
                        return Ok::<_, Rejection>(unauthorized());
                    }
                    let cookie = oauth_cookie(cookies.as_deref());
                    let user = gate.user_for(auth.as_deref(), cookie.as_deref());
                    Ok(json_status(&user, StatusCode::OK))
                }
            })
            .boxed();

        // GET /api/v1alpha1/logout?nonce=...
        let gate = self.gate.clone();
        let logout = api()
            .and(warp::path("logout"))
            .and(warp::path::end())
            .and(warp::get())
            .and(raw_query())
            .and_then(move |raw: String| {
                let gate = gate.clone();
                async move {
                    let nonce = query_param(&raw, "nonce");
                    let res = match gate.logout(nonce) {
                        LogoutOutcome::LoggedOut => {
                            reply::with_status("Logged out", StatusCode::OK).into_response()
                        }
                        LogoutOutcome::Unauthorized => unauthorized(),
                        LogoutOutcome::ClearCookie => {
                            let mut res = reply::with_status("Logged out", StatusCode::OK)
                                .into_response();
                            res.headers_mut().insert(
                                SET_COOKIE,
                                HeaderValue::from_static("_oauth_proxy=; Path=/; Max-Age=0"),
                            );
                            res
                        }
                    };
                    Ok::<_, Rejection>(res)
                }
            })
            .boxed();

        // GET /api/v1alpha1/metrics
        let collector = self.collector.clone();
        let metrics = api()
            .and(warp::path("metrics"))
            .and(warp::path::end())
            .and(warp::get())
            .and_then(move || {
                let collector = collector.clone();
                async move {
                    let exported = collector.read().metrics().export();
                    let res = match exported {
                        Ok(text) => {
                            let mut res = reply::with_status(text, StatusCode::OK).into_response();
                            res.headers_mut().insert(
                                CONTENT_TYPE,
                                HeaderValue::from_static("text/plain; version=0.0.4"),
                            );
                            res
                        }
                        Err(e) => {
                            warn!("metrics exposition failed: {}", e);
                            json_status(
                                &ApiError::new("Metrics unavailable"),
                                StatusCode::INTERNAL_SERVER_ERROR,
                            )
                        }
                    };
                    Ok::<_, Rejection>(res)
                }
            })
            .boxed();

        // GET /api/v1alpha1/internal/prom/{query|rangequery}/
        let prom_query = self.prom_proxy("query", "query").boxed();
        let prom_range = self.prom_proxy("rangequery", "query_range").boxed();

        // GET /api/v1alpha1/{root}
        let collector = self.collector.clone();
        let gate = self.gate.clone();
        let list = api()
            .and(warp::path!(String))
            .and(warp::get())
            .and(auth_header())
            .and_then(move |root: String, auth: Option<String>| {
                let collector = collector.clone();
                let gate = gate.clone();
                async move {
                    if !gate.authorize(auth.as_deref()) {
                        return Ok::<_, Rejection>(unauthorized());
                    }
                    let res = match RecordKind::from_root(&root) {
                        Some(kind) => {
                            let listed = query_layer::list(&collector.read(), kind);
                            json_status(&listed, StatusCode::OK)
                        }
                        None => not_found(),
                    };
                    Ok(res)
                }
            })
            .boxed();

        // GET /api/v1alpha1/{root}/{id}
        let collector = self.collector.clone();
        let gate = self.gate.clone();
        let item = api()
            .and(warp::path!(String / String))
            .and(warp::get())
            .and(auth_header())
            .and_then(move |root: String, id: String, auth: Option<String>| {
                let collector = collector.clone();
                let gate = gate.clone();
                async move {
                    if !gate.authorize(auth.as_deref()) {
                        return Ok::<_, Rejection>(unauthorized());
                    }
                    let res = match RecordKind::from_root(&root) {
                        Some(kind) => {
                            query_result(query_layer::item(&collector.read(), kind, &id))
                        }
                        None => not_found(),
                    };
                    Ok(res)
                }
            })
            .boxed();

        // GET /api/v1alpha1/{root}/{id}/{sub}
        let collector = self.collector.clone();
        let gate = self.gate.clone();
        let sub = api()
            .and(warp::path!(String / String / String))
            .and(warp::get())
            .and(auth_header())
            .and_then(
                move |root: String, id: String, sub: String, auth: Option<String>| {
                    let collector = collector.clone();
                    let gate = gate.clone();
                    async move {
                        if !gate.authorize(auth.as_deref()) {
                            return Ok::<_, Rejection>(unauthorized());
                        }
                        let res = match RecordKind::from_root(&root) {
                            Some(kind) => query_result(query_layer::sub_resource(
                                &collector.read(),
                                kind,
                                &id,
                                &sub,
                            )),
                            None => not_found(),
                        };
                        Ok(res)
                    }
                },
            )
            .boxed();

        // anything else under the API prefix
        let api_fallback = api()
            .and(warp::any())
            .and_then(|| async { Ok::<_, Rejection>(not_found()) })
            .boxed();

        user.or(logout)
            .unify()
            .or(metrics)
            .unify()
            .or(prom_query)
            .unify()
            .or(prom_range)
            .unify()
            .or(list)
            .unify()
            .or(item)
            .unify()
            .or(sub)
            .unify()
            .or(api_fallback)
            .unify()
            .with(request_log)
            .map(into_response)
            .boxed()
    }

    /// Forwards an instant or range query, with its parameters, to the
    /// co-located metrics store.
    fn prom_proxy(
        &self,
        segment: &'static str,
        upstream_op: &'static str,
    ) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
        let base = self.config.prometheus_url.clone().map(|mut url| {
            if !url.ends_with('/') {
                url.push('/');
            }
            url
        });
        let gate = self.gate.clone();
        let http = self.http.clone();
        warp::path("api")
            .and(warp::path("v1alpha1"))
            .and(warp::path("internal"))
            .and(warp::path("prom"))
            .and(warp::path(segment))
            .and(warp::path::end())
            .and(warp::get())
            .and(raw_query())
            .and(auth_header())
            .and_then(
                move |raw: String, auth: Option<String>| {
                    let base = base.clone();
                    let gate = gate.clone();
                    let http = http.clone();
                    async move {
                        if !gate.authorize(auth.as_deref()) {
                            return Ok::<_, Rejection>(unauthorized());
                        }
                        let base = match base {
                            Some(base) => base,
                            None => return Ok(not_found()),
                        };
                        // the query string is forwarded verbatim
                        let url = if raw.is_empty() {
                            format!("{}{}", base, upstream_op)
                        } else {
                            format!("{}{}?{}", base, upstream_op, raw)
                        };
                        let upstream = http.get(&url).send().await;
                        let res = match upstream {
                            Ok(resp) => {
                                let status = StatusCode::from_u16(resp.status().as_u16())
                                    .unwrap_or(StatusCode::BAD_GATEWAY);
                                let body = resp.text().await.unwrap_or_default();
                                let mut res =
                                    reply::with_status(body, status).into_response();
                                res.headers_mut().insert(
                                    CONTENT_TYPE,
                                    HeaderValue::from_static("application/json"),
                                );
                                res
                            }
                            Err(e) => {
                                warn!("metrics store request to {} failed: {}", url, e);
                                json_status(
                                    &ApiError::new("Metrics store unavailable"),
                                    StatusCode::BAD_GATEWAY,
                                )
                            }
                        };
                        Ok(res)
                    }
                },
            )
    }
}
