use actix::{Actor, ActorContext, AsyncContext, Handler, Message, Running, StreamHandler};
use actix_web::error::ErrorBadRequest;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use uuid::Uuid;

use super::bridge::DocumentBridge;
use crate::auth::{authenticate, TokenVerifier};

const ROOM_PREFIX: &str = "session-";
const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// `session-<id>` to `<id>`.
pub fn session_of_room(room: &str) -> Option<&str> {
    room.strip_prefix(ROOM_PREFIX).filter(|id| !id.is_empty())
}

#[derive(Message)]
#[rtype(result = "()")]
struct DocumentFrame(Vec<u8>);

/// One peer on a document room. Frames are never interpreted here.
struct DocumentPeerActor {
    bridge: DocumentBridge,
    session_id: String,
    peer_id: Uuid,
}

impl Actor for DocumentPeerActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Vec<u8>>();
        self.bridge.attach(&self.session_id, self.peer_id, tx);

        let addr = ctx.address().recipient();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if addr.send(DocumentFrame(frame)).await.is_err() {
                    break;
                }
            }
        });
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        self.bridge.detach(&self.session_id, self.peer_id);
        Running::Stop
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for DocumentPeerActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Binary(bin)) => {
                log::debug!("Document ingress size: {}", bin.len());
                self.bridge
                    .update(&self.session_id, self.peer_id, bin.to_vec());
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => (),
            Err(e) => {
                log::info!("Protocol error on document channel: {}", e);
                ctx.stop();
            }
        }
    }
}

impl Handler<DocumentFrame> for DocumentPeerActor {
    type Result = ();

    fn handle(&mut self, msg: DocumentFrame, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.binary(msg.0);
    }
}

pub async fn doc_index(
    req: HttpRequest,
    stream: web::Payload,
    room: web::Path<String>,
    bridge: web::Data<DocumentBridge>,
    verifier: web::Data<dyn TokenVerifier>,
) -> Result<HttpResponse, Error> {
    let session_id = session_of_room(&room)
        .ok_or_else(|| ErrorBadRequest("room must be named session-<id>"))?
        .to_owned();
    let identity = authenticate(&req, verifier.get_ref()).await?;
    log::info!(
        "Document channel for {} opened by user {}",
        session_id,
        identity.id
    );

    ws::WsResponseBuilder::new(
        DocumentPeerActor {
            bridge: bridge.get_ref().clone(),
            session_id,
            peer_id: Uuid::new_v4(),
        },
        &req,
        stream,
    )
    .frame_size(MAX_FRAME_SIZE)
    .start()
}
