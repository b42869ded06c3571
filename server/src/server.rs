use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc::{channel, unbounded_channel, Sender, UnboundedSender, WeakSender};
use tokio::sync::oneshot;

use system::{
    AdmissionController, AdmissionStatus, ClientEvent, ConnectionId, Identity, Notification,
    Participant, RunResult, ServerEvent, SessionId,
};

use crate::bus::{BroadcastBus, ConnectionTx};
use crate::directory::{session_exists, SessionDirectory};
use crate::executor::{ExecutionDispatcher, ExecutionRequest};
use crate::relay::relay;

pub type ServerTx = Sender<ServerCommand>;
pub type IngressTx = UnboundedSender<ServerCommand>;

const SERVER_QUEUE_SIZE: usize = 1024;
const SESSION_NOT_FOUND: &str = "Session not found";
const STATS_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum ServerCommand {
    Connect {
        identity: Identity,
        tx: ConnectionTx,
    },
    Disconnect {
        from: ConnectionId,
    },
    ClientEvent {
        from: ConnectionId,
        event: ClientEvent,
    },
    JoinChecked {
        from: ConnectionId,
        session_id: SessionId,
        display_name: String,
        is_host: bool,
        exists: bool,
    },
    RunFinished {
        session_id: SessionId,
        result: RunResult,
    },
    Stats {
        reply: oneshot::Sender<ServerStats>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub connections: usize,
    pub rooms: usize,
}

/// One connection's way into the loop.
///
/// Commands reach the loop in the order they were sent here, however full the
/// loop's own queue gets.
pub fn spawn_ingress(srv_tx: ServerTx) -> IngressTx {
    let (tx, mut rx) = unbounded_channel::<ServerCommand>();
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            if srv_tx.send(command).await.is_err() {
                log::error!("Server loop is gone");
                break;
            }
        }
    });
    tx
}

/// Asks the loop for its counts. `None` if it does not answer in time.
pub async fn stats(srv_tx: &ServerTx) -> Option<ServerStats> {
    let (reply, rx) = oneshot::channel();
    srv_tx.send(ServerCommand::Stats { reply }).await.ok()?;
    tokio::time::timeout(STATS_TIMEOUT, rx).await.ok()?.ok()
}

struct Server {
    admission: AdmissionController,
    connections: BroadcastBus,
    directory: Arc<dyn SessionDirectory>,
    dispatcher: ExecutionDispatcher,
    srv_tx: WeakSender<ServerCommand>,
    /// Connections with a join under directory lookup, and what they sent since.
    pending_joins: HashMap<ConnectionId, Vec<ClientEvent>>,
}

impl Server {
    fn new(
        directory: Arc<dyn SessionDirectory>,
        dispatcher: ExecutionDispatcher,
        srv_tx: WeakSender<ServerCommand>,
    ) -> Self {
        Self {
            admission: AdmissionController::new(),
            connections: BroadcastBus::new(),
            directory,
            dispatcher,
            srv_tx,
            pending_joins: HashMap::new(),
        }
    }

    fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Connect { identity, tx } => {
                let user_id = identity.id.clone();
                let display_name = identity.display_name.clone();
                let connection_id = self.admission.connect(identity);
                self.connections.insert(connection_id, tx);
                self.connections.unicast(
                    &connection_id,
                    ServerEvent::Connected {
                        connection_id,
                        user_id,
                        display_name,
                    },
                );
            }
            ServerCommand::Disconnect { from } => self.disconnect(from),
            ServerCommand::ClientEvent { from, event } => self.handle_client_event(from, event),
            ServerCommand::JoinChecked {
                from,
                session_id,
                display_name,
                is_host,
                exists,
            } => self.join_checked(from, session_id, display_name, is_host, exists),
            ServerCommand::RunFinished { session_id, result } => {
                let members = self.admission.registry().members_of(&session_id);
                self.connections
                    .broadcast_to_room(&members, &ServerEvent::RunResult(result), None);
            }
            ServerCommand::Stats { reply } => {
                let _ = reply.send(ServerStats {
                    connections: self.admission.registry().connection_count(),
                    rooms: self.admission.registry().room_count(),
                });
            }
        }
        self.collect_closed();
    }

    fn handle_client_event(&mut self, from: ConnectionId, event: ClientEvent) {
        if let Some(held) = self.pending_joins.get_mut(&from) {
            held.push(event);
            return;
        }
        match event {
            ClientEvent::JoinSession {
                session_id,
                display_name,
                is_host,
            } => self.check_join(from, session_id, display_name, is_host),
            ClientEvent::LeaveSession => {
                let transition = self.admission.leave(from);
                self.deliver(transition.notifications);
            }
            ClientEvent::AdmitParticipant {
                target_connection_id,
                session_id,
            } => {
                let transition = self
                    .admission
                    .admit(from, &session_id, target_connection_id);
                self.deliver(transition.notifications);
            }
            ClientEvent::RejectParticipant {
                target_connection_id,
                session_id,
            } => {
                let transition = self
                    .admission
                    .reject(from, &session_id, target_connection_id);
                self.deliver(transition.notifications);
            }
            ClientEvent::SetAutoAdmit {
                session_id,
                enabled,
            } => {
                let notifications = self.admission.set_auto_admit(from, &session_id, enabled);
                self.deliver(notifications);
            }
            ClientEvent::Signal {
                to_connection_id,
                payload,
            } => {
                relay(&mut self.connections, from, to_connection_id, payload);
            }
            ClientEvent::RunCode {
                language,
                code,
                input,
                session_id,
                timeout_ms,
            } => {
                let request = ExecutionRequest {
                    language,
                    source: code,
                    stdin: input,
                    deadline: timeout_ms.map(Duration::from_millis),
                };
                self.run_code(from, session_id, request)
            }
            ClientEvent::ChatMessage { text } => self.broadcast_from(from, |from| {
                ServerEvent::ChatMessage {
                    from,
                    text,
                    sent_at: Utc::now(),
                }
            }),
            ClientEvent::ProblemStatementUpdate { text } => {
                self.broadcast_from(from, |from| ServerEvent::ProblemStatementUpdate { from, text })
            }
            ClientEvent::LanguageChange { language } => {
                self.broadcast_from(from, |from| ServerEvent::LanguageChange { from, language })
            }
            ClientEvent::FileUpdate { files } => {
                self.broadcast_from(from, |from| ServerEvent::FileUpdate { from, files })
            }
            ClientEvent::FocusChange { index } => {
                self.broadcast_from(from, |from| ServerEvent::FocusChange { from, index })
            }
            ClientEvent::ProctorEvent(detail) => {
                self.broadcast_from(from, |from| ServerEvent::ProctorEvent { from, detail })
            }
        }
    }

    /// The directory lookup runs off the loop and posts its outcome back.
    /// Until then, everything else from this connection waits behind it.
    fn check_join(
        &mut self,
        from: ConnectionId,
        session_id: SessionId,
        display_name: String,
        is_host: bool,
    ) {
        let session_id = session_id.trim().to_owned();
        if session_id.is_empty() {
            self.connections.unicast(
                &from,
                ServerEvent::AdmissionStatus(AdmissionStatus::refused(SESSION_NOT_FOUND)),
            );
            return;
        }

        self.pending_joins.insert(from, Vec::new());
        let directory = self.directory.clone();
        let srv_tx = self.srv_tx.clone();
        tokio::spawn(async move {
            let exists = session_exists(directory.as_ref(), &session_id).await;
            if let Some(srv_tx) = srv_tx.upgrade() {
                let _ = srv_tx
                    .send(ServerCommand::JoinChecked {
                        from,
                        session_id,
                        display_name,
                        is_host,
                        exists,
                    })
                    .await;
            }
        });
    }

    fn join_checked(
        &mut self,
        from: ConnectionId,
        session_id: SessionId,
        display_name: String,
        is_host: bool,
        exists: bool,
    ) {
        let held = self.pending_joins.remove(&from).unwrap_or_default();
        if self.admission.registry().lookup(&from).is_none() {
            return;
        }

        if exists {
            let transition = self
                .admission
                .request_join(from, &session_id, &display_name, is_host);
            log::debug!("Connection {} is now {:?}", from, transition.state);
            self.deliver(transition.notifications);
        } else {
            log::info!("Connection {} asked for unknown session {}", from, session_id);
            self.connections.unicast(
                &from,
                ServerEvent::AdmissionStatus(AdmissionStatus::refused(SESSION_NOT_FOUND)),
            );
        }

        // A replayed join holds back whatever follows it again.
        for event in held {
            self.handle_client_event(from, event);
        }
    }

    fn run_code(
        &mut self,
        from: ConnectionId,
        requested_session: Option<SessionId>,
        request: ExecutionRequest,
    ) {
        let session_id = match self.admitted_session(&from) {
            Some(session_id) => session_id,
            None => {
                log::debug!("Ignoring run from connection {} outside any session", from);
                return;
            }
        };
        if requested_session.map_or(false, |s| s != session_id) {
            log::debug!("Ignoring run from {} aimed at another session", from);
            return;
        }

        log::info!(
            "Connection {} runs {} code in {}",
            from,
            request.language,
            session_id
        );
        let dispatcher = self.dispatcher.clone();
        let srv_tx = self.srv_tx.clone();
        tokio::spawn(async move {
            let result = dispatcher.dispatch(&session_id, from, request).await;
            if let Some(srv_tx) = srv_tx.upgrade() {
                let _ = srv_tx
                    .send(ServerCommand::RunFinished { session_id, result })
                    .await;
            }
        });
    }

    /// Fans out to the sender's room, minus the sender. Unadmitted senders are ignored.
    fn broadcast_from<F>(&mut self, from: ConnectionId, event: F)
    where
        F: FnOnce(Participant) -> ServerEvent,
    {
        let (session_id, participant) = match self.admission.registry().lookup(&from) {
            Some(connection) => match &connection.session_id {
                Some(session_id) => (session_id.clone(), connection.participant()),
                None => return,
            },
            None => return,
        };
        self.deliver(vec![Notification::room(
            &session_id,
            Some(from),
            event(participant),
        )]);
    }

    fn admitted_session(&self, connection_id: &ConnectionId) -> Option<SessionId> {
        self.admission
            .registry()
            .lookup(connection_id)
            .and_then(|c| c.session_id.clone())
    }

    fn deliver(&mut self, notifications: Vec<Notification>) {
        self.connections
            .deliver(notifications, self.admission.registry());
    }

    fn disconnect(&mut self, connection_id: ConnectionId) {
        self.pending_joins.remove(&connection_id);
        let transition = self.admission.disconnect(connection_id);
        if self.connections.remove(&connection_id).is_some() {
            log::info!("Connection {} disconnected", connection_id);
        }
        self.deliver(transition.notifications);
    }

    fn collect_closed(&mut self) {
        loop {
            let closed = self.connections.take_closed();
            if closed.is_empty() {
                break;
            }
            for connection_id in closed {
                self.disconnect(connection_id);
            }
        }
    }
}

pub fn spawn_server(
    directory: Arc<dyn SessionDirectory>,
    dispatcher: ExecutionDispatcher,
) -> ServerTx {
    let (srv_tx, mut srv_rx) = channel::<ServerCommand>(SERVER_QUEUE_SIZE);
    let weak_tx = srv_tx.downgrade();

    tokio::spawn(async move {
        let mut server = Box::new(Server::new(directory, dispatcher, weak_tx));

        while let Some(command) = srv_rx.recv().await {
            server.handle_command(command);
        }
        log::info!("Server loop stopped");
    });

    srv_tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::OpenDirectory;
    use crate::error::DirectoryError;
    use crate::executor::tests::{EchoExecutor, SleepingExecutor};
    use crate::executor::Executor;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc::Receiver;

    struct MissingDirectory;

    #[async_trait]
    impl SessionDirectory for MissingDirectory {
        async fn exists(&self, _: &str) -> Result<bool, DirectoryError> {
            Ok(false)
        }
    }

    fn spawn_with(directory: Arc<dyn SessionDirectory>, executor: Arc<dyn Executor>) -> ServerTx {
        spawn_server(
            directory,
            ExecutionDispatcher::new(executor, Duration::from_millis(50)),
        )
    }

    fn spawn_open() -> ServerTx {
        spawn_with(Arc::new(OpenDirectory), Arc::new(EchoExecutor))
    }

    async fn next_event(rx: &mut Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("open queue")
    }

    async fn wait_for<F>(rx: &mut Receiver<ServerEvent>, mut pred: F) -> ServerEvent
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        loop {
            let event = next_event(rx).await;
            if pred(&event) {
                return event;
            }
        }
    }

    async fn assert_quiet<F>(rx: &mut Receiver<ServerEvent>, mut pred: F)
    where
        F: FnMut(&ServerEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(150);
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            assert!(!pred(&event), "unexpected {:?}", event);
        }
    }

    async fn connect(srv_tx: &ServerTx, name: &str) -> (ConnectionId, Receiver<ServerEvent>) {
        connect_with_capacity(srv_tx, name, 64).await
    }

    async fn connect_with_capacity(
        srv_tx: &ServerTx,
        name: &str,
        capacity: usize,
    ) -> (ConnectionId, Receiver<ServerEvent>) {
        let (tx, mut rx) = channel(capacity);
        srv_tx
            .send(ServerCommand::Connect {
                identity: Identity {
                    id: format!("user-{}", name),
                    display_name: name.into(),
                    role: String::new(),
                },
                tx,
            })
            .await
            .expect("server running");
        match next_event(&mut rx).await {
            ServerEvent::Connected { connection_id, .. } => (connection_id, rx),
            other => panic!("unexpected {:?}", other),
        }
    }

    async fn send(srv_tx: &ServerTx, from: ConnectionId, event: ClientEvent) {
        srv_tx
            .send(ServerCommand::ClientEvent { from, event })
            .await
            .expect("server running");
    }

    async fn join(srv_tx: &ServerTx, from: ConnectionId, session_id: &str, is_host: bool) {
        send(
            srv_tx,
            from,
            ClientEvent::JoinSession {
                session_id: session_id.into(),
                display_name: String::new(),
                is_host,
            },
        )
        .await;
    }

    fn is_admitted(event: &ServerEvent) -> bool {
        matches!(event, ServerEvent::AdmissionStatus(s) if s.admitted)
    }

    /// Host plus one guest admitted through auto-admit.
    async fn room_of_two(
        srv_tx: &ServerTx,
    ) -> (
        (ConnectionId, Receiver<ServerEvent>),
        (ConnectionId, Receiver<ServerEvent>),
    ) {
        let (host, mut host_rx) = connect(srv_tx, "host").await;
        join(srv_tx, host, "S1", true).await;
        wait_for(&mut host_rx, is_admitted).await;
        send(
            srv_tx,
            host,
            ClientEvent::SetAutoAdmit {
                session_id: "S1".into(),
                enabled: true,
            },
        )
        .await;

        let (guest, mut guest_rx) = connect(srv_tx, "guest").await;
        join(srv_tx, guest, "S1", false).await;
        wait_for(&mut guest_rx, is_admitted).await;
        wait_for(&mut host_rx, |e| matches!(e, ServerEvent::UserJoined(_))).await;
        ((host, host_rx), (guest, guest_rx))
    }

    #[tokio::test]
    async fn it_refuses_join_to_unknown_session() {
        let srv_tx = spawn_with(Arc::new(MissingDirectory), Arc::new(EchoExecutor));
        let (a, mut a_rx) = connect(&srv_tx, "a").await;
        join(&srv_tx, a, "S9", true).await;
        match next_event(&mut a_rx).await {
            ServerEvent::AdmissionStatus(status) => {
                assert!(!status.admitted);
                assert_eq!(status.message.as_deref(), Some(SESSION_NOT_FOUND));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn it_broadcasts_chat_to_everyone_but_sender() {
        let srv_tx = spawn_open();
        let ((_, mut host_rx), (guest, mut guest_rx)) = room_of_two(&srv_tx).await;

        send(
            &srv_tx,
            guest,
            ClientEvent::ChatMessage {
                text: "hello".into(),
            },
        )
        .await;
        match wait_for(&mut host_rx, |e| matches!(e, ServerEvent::ChatMessage { .. })).await {
            ServerEvent::ChatMessage { from, text, .. } => {
                assert_eq!(from.connection_id, guest);
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_quiet(&mut guest_rx, |e| matches!(e, ServerEvent::ChatMessage { .. })).await;
    }

    #[tokio::test]
    async fn it_ignores_events_from_unadmitted_connections() {
        let srv_tx = spawn_open();
        let ((_, mut host_rx), _guest) = room_of_two(&srv_tx).await;
        let (outsider, _outsider_rx) = connect(&srv_tx, "outsider").await;

        send(
            &srv_tx,
            outsider,
            ClientEvent::LanguageChange {
                language: "rust".into(),
            },
        )
        .await;
        assert_quiet(&mut host_rx, |e| {
            matches!(e, ServerEvent::LanguageChange { .. })
        })
        .await;
    }

    #[tokio::test]
    async fn it_broadcasts_single_failed_run_on_executor_timeout() {
        let srv_tx = spawn_with(
            Arc::new(OpenDirectory),
            Arc::new(SleepingExecutor(Duration::from_secs(5))),
        );
        let ((_, mut host_rx), (guest, mut guest_rx)) = room_of_two(&srv_tx).await;

        send(
            &srv_tx,
            guest,
            ClientEvent::RunCode {
                language: "python".into(),
                code: "while True: pass".into(),
                input: String::new(),
                session_id: Some("S1".into()),
                timeout_ms: None,
            },
        )
        .await;

        for rx in [&mut host_rx, &mut guest_rx] {
            match wait_for(rx, |e| matches!(e, ServerEvent::RunResult(_))).await {
                ServerEvent::RunResult(result) => {
                    assert_ne!(result.exit_code, 0);
                    assert!(result.timed_out);
                    assert_eq!(result.requested_by, Some(guest));
                }
                other => panic!("unexpected {:?}", other),
            }
            assert_quiet(rx, |e| matches!(e, ServerEvent::RunResult(_))).await;
        }
    }

    #[tokio::test]
    async fn it_relays_signals_and_drops_to_departed() {
        let srv_tx = spawn_open();
        let (a, mut a_rx) = connect(&srv_tx, "a").await;
        let (b, mut b_rx) = connect(&srv_tx, "b").await;

        send(
            &srv_tx,
            a,
            ClientEvent::Signal {
                to_connection_id: b,
                payload: json!({ "offer": "x" }),
            },
        )
        .await;
        match next_event(&mut b_rx).await {
            ServerEvent::Signal {
                from_connection_id,
                payload,
            } => {
                assert_eq!(from_connection_id, a);
                assert_eq!(payload, json!({ "offer": "x" }));
            }
            other => panic!("unexpected {:?}", other),
        }

        srv_tx
            .send(ServerCommand::Disconnect { from: b })
            .await
            .expect("server running");
        send(
            &srv_tx,
            a,
            ClientEvent::Signal {
                to_connection_id: b,
                payload: json!({ "answer": "y" }),
            },
        )
        .await;
        assert_quiet(&mut a_rx, |_| true).await;
    }

    #[tokio::test]
    async fn it_cleans_up_connection_whose_queue_closed() {
        let srv_tx = spawn_open();
        let ((host, mut host_rx), (guest, guest_rx)) = room_of_two(&srv_tx).await;
        drop(guest_rx);

        send(
            &srv_tx,
            host,
            ClientEvent::ProblemStatementUpdate {
                text: "Reverse a list".into(),
            },
        )
        .await;
        match wait_for(&mut host_rx, |e| matches!(e, ServerEvent::UserLeft(_))).await {
            ServerEvent::UserLeft(participant) => assert_eq!(participant.connection_id, guest),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn it_keeps_join_and_leave_in_order() {
        let srv_tx = spawn_open();
        let (a, mut a_rx) = connect(&srv_tx, "a").await;

        join(&srv_tx, a, "S1", true).await;
        send(&srv_tx, a, ClientEvent::LeaveSession).await;
        wait_for(&mut a_rx, is_admitted).await;
        assert_quiet(&mut a_rx, |e| matches!(e, ServerEvent::AdmissionStatus(_))).await;

        let counts = stats(&srv_tx).await.expect("server running");
        assert_eq!(counts.connections, 1);
        assert_eq!(counts.rooms, 0);

        // The host slot is free again.
        let (b, mut b_rx) = connect(&srv_tx, "b").await;
        join(&srv_tx, b, "S1", true).await;
        match wait_for(&mut b_rx, |e| matches!(e, ServerEvent::AdmissionStatus(_))).await {
            ServerEvent::AdmissionStatus(status) => {
                assert!(status.admitted);
                assert!(status.is_host);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn it_holds_events_behind_pending_join() {
        let srv_tx = spawn_open();
        let ((_, mut host_rx), _guest) = room_of_two(&srv_tx).await;
        let (c, mut c_rx) = connect(&srv_tx, "c").await;

        join(&srv_tx, c, "S1", false).await;
        send(
            &srv_tx,
            c,
            ClientEvent::ChatMessage {
                text: "first".into(),
            },
        )
        .await;
        wait_for(&mut c_rx, is_admitted).await;
        match wait_for(&mut host_rx, |e| matches!(e, ServerEvent::ChatMessage { .. })).await {
            ServerEvent::ChatMessage { from, text, .. } => {
                assert_eq!(from.connection_id, c);
                assert_eq!(text, "first");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn it_forgets_pending_join_of_departed_connection() {
        let srv_tx = spawn_open();
        let (a, _a_rx) = connect(&srv_tx, "a").await;
        join(&srv_tx, a, "S1", true).await;
        srv_tx
            .send(ServerCommand::Disconnect { from: a })
            .await
            .expect("server running");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let counts = stats(&srv_tx).await.expect("server running");
        assert_eq!(counts.connections, 0);
        assert_eq!(counts.rooms, 0);
    }

    #[tokio::test]
    async fn it_keeps_ingress_order_past_a_full_queue() {
        let srv_tx = spawn_open();
        let (a, _a_rx) = connect(&srv_tx, "a").await;
        let burst = SERVER_QUEUE_SIZE * 2;
        let (b, mut b_rx) = connect_with_capacity(&srv_tx, "b", burst).await;

        let ingress = spawn_ingress(srv_tx.clone());
        for n in 0..burst {
            ingress
                .send(ServerCommand::ClientEvent {
                    from: a,
                    event: ClientEvent::Signal {
                        to_connection_id: b,
                        payload: json!(n),
                    },
                })
                .expect("ingress open");
        }
        for n in 0..burst {
            match next_event(&mut b_rx).await {
                ServerEvent::Signal { payload, .. } => assert_eq!(payload, json!(n)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
