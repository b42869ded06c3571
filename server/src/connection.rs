use std::future::Future;

use actix::{Actor, ActorContext, AsyncContext, Handler, Message, Running, StreamHandler};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use actix_web_actors::ws::{CloseCode, CloseReason};
use tokio::sync::mpsc::Receiver;
use tokio::sync::oneshot;

use system::{ClientEvent, ConnectionId, Identity, ServerEvent};

use crate::auth::{authenticate, TokenVerifier};
use crate::server::{spawn_ingress, IngressTx, ServerCommand, ServerTx};

const OUTBOUND_QUEUE_SIZE: usize = 256;

#[derive(Message)]
#[rtype(result = "()")]
struct ConnectionActorMessage(ServerEvent);

enum ConnectionState {
    /// Waiting for the server to hand out an id. Inbound events are held back.
    Idle(Vec<ClientEvent>),
    Connected(ConnectionId),
}

struct ConnectionActor {
    state: ConnectionState,
    ingress: IngressTx,
    identity: Option<Identity>,
    /// Dropped with the actor, which tells the forwarder the socket is gone.
    alive: Option<oneshot::Sender<()>>,
}

impl ConnectionActor {
    fn new(srv_tx: ServerTx, identity: Identity) -> Self {
        Self {
            state: ConnectionState::Idle(Vec::new()),
            ingress: spawn_ingress(srv_tx),
            identity: Some(identity),
            alive: None,
        }
    }

    fn submit(&self, command: ServerCommand) {
        if self.ingress.send(command).is_err() {
            log::error!("Server loop is gone");
        }
    }

    fn close(&mut self, ctx: &mut ws::WebsocketContext<Self>, code: CloseCode, description: String) {
        ctx.close(Some(CloseReason {
            code,
            description: Some(description),
        }));
        ctx.stop();
    }
}

/// Hands server events to the socket until either side goes away, then
/// disconnects the connection. The id is learned from the first event, so a
/// socket that closes mid-handshake is still cleaned up.
pub(crate) async fn forward_events<F, Fut>(
    mut rx: Receiver<ServerEvent>,
    mut alive: oneshot::Receiver<()>,
    ingress: IngressTx,
    mut deliver: F,
) where
    F: FnMut(ServerEvent) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut connection_id = None;
    loop {
        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Some(event) => event,
                    // The server already dropped this connection.
                    None => return,
                };
                if let ServerEvent::Connected { connection_id: id, .. } = &event {
                    connection_id = Some(*id);
                }
                if !deliver(event).await {
                    break;
                }
            }
            _ = &mut alive => break,
        }
    }

    let from = match connection_id {
        Some(id) => id,
        None => match rx.recv().await {
            Some(ServerEvent::Connected { connection_id, .. }) => connection_id,
            _ => return,
        },
    };
    log::debug!("Connection {} socket closed", from);
    let _ = ingress.send(ServerCommand::Disconnect { from });
}

impl Actor for ConnectionActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let identity = match self.identity.take() {
            Some(identity) => identity,
            None => {
                ctx.stop();
                return;
            }
        };
        let (tx, rx) = tokio::sync::mpsc::channel::<ServerEvent>(OUTBOUND_QUEUE_SIZE);
        let (alive_tx, alive_rx) = oneshot::channel();
        self.alive = Some(alive_tx);
        self.submit(ServerCommand::Connect { identity, tx });

        let addr = ctx.address().recipient();
        tokio::spawn(forward_events(
            rx,
            alive_rx,
            self.ingress.clone(),
            move |event| {
                let addr = addr.clone();
                async move { addr.send(ConnectionActorMessage(event)).await.is_ok() }
            },
        ));
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        self.alive.take();
        Running::Stop
    }
}

/// Ingress
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConnectionActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => ctx.pong(&msg),
            Ok(ws::Message::Text(text)) => {
                log::debug!("Ingress size: {}", text.len());
                match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => match &mut self.state {
                        ConnectionState::Connected(from) => {
                            let from = *from;
                            self.submit(ServerCommand::ClientEvent { from, event });
                        }
                        ConnectionState::Idle(held) => held.push(event),
                    },
                    Err(e) => {
                        log::info!("Closing connection after malformed frame: {}", e);
                        self.close(ctx, CloseCode::Invalid, e.to_string());
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                self.close(
                    ctx,
                    CloseCode::Unsupported,
                    "event channel only carries text frames".into(),
                );
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(_) => (),
            Err(e) => {
                log::info!("Protocol error on event channel: {}", e);
                ctx.stop();
            }
        }
    }
}

/// Egress
impl Handler<ConnectionActorMessage> for ConnectionActor {
    type Result = ();

    fn handle(
        &mut self,
        msg: ConnectionActorMessage,
        ctx: &mut ws::WebsocketContext<Self>,
    ) -> Self::Result {
        let event = msg.0;
        log::debug!("Egress {:?}", event);

        if let ServerEvent::Connected { connection_id, .. } = &event {
            let from = *connection_id;
            let state = std::mem::replace(&mut self.state, ConnectionState::Connected(from));
            if let ConnectionState::Idle(held) = state {
                for event in held {
                    self.submit(ServerCommand::ClientEvent { from, event });
                }
            }
        }

        match serde_json::to_string(&event) {
            Ok(text) => ctx.text(text),
            Err(e) => log::error!("Could not encode outbound event: {}", e),
        }
    }
}

pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    srv_tx: web::Data<ServerTx>,
    verifier: web::Data<dyn TokenVerifier>,
) -> Result<HttpResponse, Error> {
    let identity = authenticate(&req, verifier.get_ref()).await?;
    log::info!("Event channel opened for user {}", identity.id);
    ws::start(
        ConnectionActor::new(srv_tx.get_ref().clone(), identity),
        &req,
        stream,
    )
}
