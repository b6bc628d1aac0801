//! The plugin endpoint: a unix socket speaking the volume plugin protocol,
//! JSON request bodies POSTed to `/VolumeDriver.<Op>`. Failures ride in the
//! `Err` field of an otherwise successful HTTP response, per the protocol.

use crate::{
    api::{
        ActivateResponse, CreateRequest, ErrorResponse, GetRequest, MountRequest, PathRequest,
        RemoveRequest, UnmountRequest,
    },
    driver::CepherDriver,
    error::Error,
};
use actix_web::{web, App, HttpResponse, HttpServer};
use serde::Serialize;
use std::sync::Arc;

/// Where the container runtime looks for the plugin.
pub const PLUGIN_SOCKET: &str = "/run/docker/plugins/cepher.sock";

/// Serve the plugin API on the given unix socket until shutdown.
pub async fn serve(driver: Arc<CepherDriver>, socket: &str) -> std::io::Result<()> {
    let driver = web::Data::from(driver);
    HttpServer::new(move || {
        App::new()
            .app_data(driver.clone())
            .route("/Plugin.Activate", web::post().to(activate))
            .route("/VolumeDriver.Capabilities", web::post().to(capabilities))
            .route("/VolumeDriver.Create", web::post().to(create))
            .route("/VolumeDriver.Remove", web::post().to(remove))
            .route("/VolumeDriver.Mount", web::post().to(mount))
            .route("/VolumeDriver.Unmount", web::post().to(unmount))
            .route("/VolumeDriver.Path", web::post().to(path))
            .route("/VolumeDriver.Get", web::post().to(get))
            .route("/VolumeDriver.List", web::post().to(list))
    })
    .workers(1)
    .bind_uds(socket)?
    .run()
    .await
}

fn ok_or_err(result: Result<(), Error>) -> HttpResponse {
    match result {
        Ok(()) => HttpResponse::Ok().json(ErrorResponse::none()),
        Err(error) => protocol_error(error),
    }
}

fn value_or_err<T: Serialize>(result: Result<T, Error>) -> HttpResponse {
    match result {
        Ok(value) => HttpResponse::Ok().json(value),
        Err(error) => protocol_error(error),
    }
}

fn protocol_error(error: Error) -> HttpResponse {
    tracing::error!("{error}");
    HttpResponse::Ok().json(ErrorResponse::new(error))
}

async fn activate() -> HttpResponse {
    HttpResponse::Ok().json(ActivateResponse::default())
}

async fn capabilities(driver: web::Data<CepherDriver>) -> HttpResponse {
    HttpResponse::Ok().json(driver.capabilities())
}

async fn create(driver: web::Data<CepherDriver>, request: web::Json<CreateRequest>) -> HttpResponse {
    ok_or_err(driver.create(&request).await)
}

async fn remove(driver: web::Data<CepherDriver>, request: web::Json<RemoveRequest>) -> HttpResponse {
    ok_or_err(driver.remove(&request).await)
}

async fn mount(driver: web::Data<CepherDriver>, request: web::Json<MountRequest>) -> HttpResponse {
    value_or_err(driver.mount(&request).await)
}

async fn unmount(
    driver: web::Data<CepherDriver>,
    request: web::Json<UnmountRequest>,
) -> HttpResponse {
    ok_or_err(driver.unmount(&request).await)
}

async fn path(driver: web::Data<CepherDriver>, request: web::Json<PathRequest>) -> HttpResponse {
    value_or_err(driver.path(&request).await)
}

async fn get(driver: web::Data<CepherDriver>, request: web::Json<GetRequest>) -> HttpResponse {
    value_or_err(driver.get(&request).await)
}

async fn list(driver: web::Data<CepherDriver>) -> HttpResponse {
    value_or_err(driver.list().await)
}
