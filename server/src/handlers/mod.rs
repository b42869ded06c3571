use actix_web::{web, HttpResponse, Responder};
use serde_json::json;

use crate::connection::ws_index;
use crate::document::{doc_index, DocumentBridge};
use crate::server::{stats, ServerTx};

pub fn root(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/ws").route(web::get().to(ws_index)));
    cfg.service(web::resource("/doc/{room}").route(web::get().to(doc_index)));
    cfg.service(web::resource("/health").route(web::get().to(health)));
}

async fn health(srv_tx: web::Data<ServerTx>, bridge: web::Data<DocumentBridge>) -> impl Responder {
    match stats(srv_tx.get_ref()).await {
        Some(counts) => HttpResponse::Ok().json(json!({
            "status": "ok",
            "connections": counts.connections,
            "rooms": counts.rooms,
            "documentRooms": bridge.open_rooms(),
        })),
        None => {
            log::error!("Server loop did not answer the health check");
            HttpResponse::ServiceUnavailable().json(json!({ "status": "unavailable" }))
        }
    }
}
