//! Per-connection protocol state machine.
//!
//! A [`Session`] is the only owner of its connection's protocol state and
//! the only producer of its outgoing frames. It reacts to two sources: the
//! decoded frames from its own client, and [`SessionEvent`]s pushed into its
//! inbox by the registry or by its mate. Whatever makes it stop, the same
//! teardown runs: leave the registry (which tells the mate) and mark the
//! session terminated.

use std::sync::Arc;

use {
    duet_protocol::{AuthError, Message, ProtocolError},
    duet_store::PairKey,
    futures::{Stream, StreamExt},
    tokio::sync::mpsc,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    auth::{self, Credentials},
    registry::{MateHandle, RegistryClosed, SessionEvent, SessionHandle},
    state::GatewayState,
};

/// One item read from the client side of the connection.
#[derive(Debug)]
pub enum Inbound {
    Message(Message),
    /// A text frame that did not decode.
    Invalid(ProtocolError),
    /// The client closed the transport without sending `Close`.
    Closed,
    /// The transport failed.
    Failed(String),
}

/// One item for the connection writer.
#[derive(Debug)]
pub enum Outbound {
    Frame(Message),
    /// Transport-level liveness probe.
    Ping,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("connection writer closed")]
    WriterClosed,
    #[error(transparent)]
    Registry(#[from] RegistryClosed),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pending {
    Sent { target: String },
    Received { inviter: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Anonymous,
    Idle,
    InvitePending(Pending),
    Paired,
    Terminated,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    /// The client sent `Close`.
    Closed,
    /// The server is shutting down.
    ServerStop,
    /// Transport failure, heartbeat timeout, or an internal error.
    Crashed(String),
}

struct Mate {
    name: String,
    handle: MateHandle,
}

type Step = Result<Option<Exit>, SessionError>;

pub struct Session {
    conn_id: u64,
    name: Option<String>,
    phase: Phase,
    mate: Option<Mate>,
    inbox_tx: SessionHandle,
    inbox_rx: mpsc::UnboundedReceiver<SessionEvent>,
    outbox: mpsc::Sender<Outbound>,
    state: Arc<GatewayState>,
}

impl Session {
    pub fn new(conn_id: u64, outbox: mpsc::Sender<Outbound>, state: Arc<GatewayState>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            conn_id,
            name: None,
            phase: Phase::Anonymous,
            mate: None,
            inbox_tx,
            inbox_rx,
            outbox,
            state,
        }
    }

    /// Drive the session until the client leaves, the transport dies, the
    /// server stops, or `cancel` fires. Teardown always runs before return.
    pub async fn run<S>(mut self, mut inbound: S, cancel: CancellationToken) -> Exit
    where
        S: Stream<Item = Inbound> + Unpin,
    {
        let exit = loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => Ok(Some(Exit::Crashed("connection lost".into()))),
                item = inbound.next() => match item {
                    Some(item) => self.on_inbound(item).await,
                    None => Ok(Some(Exit::Crashed("connection ended".into()))),
                },
                Some(event) = self.inbox_rx.recv() => self.on_event(event).await,
            };
            match step {
                Ok(None) => {},
                Ok(Some(exit)) => break exit,
                Err(e) => break Exit::Crashed(e.to_string()),
            }
        };
        self.teardown(&exit).await;
        exit
    }

    async fn teardown(&mut self, exit: &Exit) {
        if let Exit::Crashed(reason) = exit {
            warn!(conn_id = self.conn_id, user = self.name.as_deref().unwrap_or("-"), %reason, "session crashed");
            let _ = self.outbox.try_send(Outbound::Frame(Message::Crash));
        }
        if let Some(name) = &self.name {
            if let Err(e) = self.state.registry.leave(name).await {
                warn!(conn_id = self.conn_id, error = %e, "could not leave registry");
            }
            info!(conn_id = self.conn_id, user = %name, ?exit, "session ended");
        }
        self.mate = None;
        self.phase = Phase::Terminated;
    }

    async fn on_inbound(&mut self, item: Inbound) -> Step {
        match item {
            Inbound::Message(msg) => self.on_message(msg).await,
            Inbound::Invalid(e) => {
                warn!(conn_id = self.conn_id, error = %e, "ignoring undecodable frame");
                Ok(None)
            },
            Inbound::Closed => Ok(Some(Exit::Crashed("closed without Close".into()))),
            Inbound::Failed(reason) => Ok(Some(Exit::Crashed(reason))),
        }
    }

    async fn on_message(&mut self, msg: Message) -> Step {
        match msg {
            Message::Login(name, password) if self.phase == Phase::Anonymous => {
                self.authenticate(Credentials::new(name, password), false)
                    .await
            },
            Message::Register(name, password) if self.phase == Phase::Anonymous => {
                self.authenticate(Credentials::new(name, password), true)
                    .await
            },
            Message::Invite(target) if self.negotiable() => self.invite(target).await,
            Message::InviteCrush(inviter) if self.negotiable() => self.accept(inviter).await,
            Message::InvitePass(inviter) if self.negotiable() => self.decline(inviter).await,
            Message::Chat(text) if self.phase == Phase::Paired => self.relay(text),
            Message::Ping => self.write(Message::Pong).await,
            Message::Pong => Ok(None),
            Message::Close => Ok(Some(Exit::Closed)),
            other => {
                warn!(conn_id = self.conn_id, tag = other.tag(), phase = ?self.phase, "message not valid here, ignored");
                Ok(None)
            },
        }
    }

    async fn on_event(&mut self, event: SessionEvent) -> Step {
        match event {
            SessionEvent::OnlineUsers(names) => self.write(Message::OnlineUsers(names)).await,
            SessionEvent::InviteRequest { from } => {
                if self.phase == Phase::Paired {
                    debug!(conn_id = self.conn_id, %from, "invite arrived after pairing, dropped");
                    return Ok(None);
                }
                self.phase = Phase::InvitePending(Pending::Received {
                    inviter: from.clone(),
                });
                self.write(Message::InviteRequest(from)).await
            },
            SessionEvent::InviteRefused { by } => {
                if matches!(&self.phase, Phase::InvitePending(Pending::Sent { target }) if *target == by)
                {
                    self.phase = Phase::Idle;
                }
                self.write(Message::InviteRefuse(by)).await
            },
            SessionEvent::Paired { mate, handle } => {
                info!(conn_id = self.conn_id, user = self.name(), %mate, "invite accepted");
                self.mate = Some(Mate {
                    name: mate.clone(),
                    handle,
                });
                self.phase = Phase::Paired;
                self.write(Message::InviteAccept(mate)).await
            },
            SessionEvent::Chat(text) => self.write(Message::Chat(text)).await,
            SessionEvent::History(transcript) => self.write(Message::History(transcript)).await,
            SessionEvent::MateLeft => {
                if let Some(mate) = self.mate.take() {
                    debug!(conn_id = self.conn_id, mate = %mate.name, "mate left");
                }
                self.phase = Phase::Idle;
                self.write(Message::MateClosed).await
            },
            SessionEvent::ServerStop => {
                self.write(Message::ServerStop).await?;
                Ok(Some(Exit::ServerStop))
            },
        }
    }

    async fn authenticate(&mut self, creds: Credentials, register: bool) -> Step {
        match self.admit(&creds, register).await? {
            Ok(()) => {
                info!(conn_id = self.conn_id, user = %creds.name, register, "authenticated");
                self.name = Some(creds.name);
                self.phase = Phase::Idle;
                let reply = if register {
                    Message::Registered
                } else {
                    Message::Logged
                };
                self.write(reply).await
            },
            Err(e) => {
                debug!(conn_id = self.conn_id, user = %creds.name, error = %e, "authentication rejected");
                self.write(e.into()).await
            },
        }
    }

    /// Credential check followed by the registry join. The join is the
    /// authoritative uniqueness check; the early lookup only spares a store
    /// round trip.
    async fn admit(
        &self,
        creds: &Credentials,
        register: bool,
    ) -> Result<Result<(), AuthError>, SessionError> {
        let registry = &self.state.registry;
        if registry.is_online(&creds.name).await? {
            return Ok(Err(AuthError::AlreadyOnline));
        }
        let store = self.state.credentials.as_ref();
        let checked = if register {
            auth::register_user(store, creds).await
        } else {
            auth::verify_login(store, creds).await
        };
        if let Err(e) = checked {
            return Ok(Err(e));
        }
        Ok(registry.join(&creds.name, self.inbox_tx.clone()).await?)
    }

    async fn invite(&mut self, target: String) -> Step {
        match self.state.registry.invite(self.name(), &target).await? {
            Ok(()) => {
                self.phase = Phase::InvitePending(Pending::Sent { target });
                self.write(Message::InviteSent).await
            },
            Err(e) => self.write(e.into()).await,
        }
    }

    /// The transcript is read before the registry pairs the two sides, so
    /// no line from the new pairing can land in it first.
    async fn accept(&mut self, inviter: String) -> Step {
        let me = self.name().to_string();
        let key = PairKey::new(&me, &inviter);
        let prior = self.state.journal.load(key.clone()).await;
        let handle = match self.state.registry.accept(&me, &inviter).await? {
            Ok(handle) => handle,
            Err(e) => return self.write(e.into()).await,
        };
        info!(conn_id = self.conn_id, user = %me, mate = %inviter, "accepted invite");
        self.mate = Some(Mate {
            name: inviter,
            handle,
        });
        self.phase = Phase::Paired;

        match prior {
            Some(transcript) => {
                self.forward(SessionEvent::History(transcript.clone()));
                self.write(Message::History(transcript)).await
            },
            None => {
                self.state.journal.create(key);
                Ok(None)
            },
        }
    }

    async fn decline(&mut self, inviter: String) -> Step {
        self.state.registry.decline(self.name(), &inviter).await?;
        if matches!(&self.phase, Phase::InvitePending(Pending::Received { inviter: i }) if *i == inviter)
        {
            self.phase = Phase::Idle;
        }
        Ok(None)
    }

    /// Relay the line, then queue it for the transcript. Nothing between
    /// the two yields, and recording never waits on storage.
    fn relay(&mut self, text: String) -> Step {
        let Some(mate) = &self.mate else {
            return Ok(None);
        };
        let key = PairKey::new(self.name(), &mate.name);
        let line = format!("{}> {}\n", self.name(), text);
        self.forward(SessionEvent::Chat(text));
        self.state.journal.record(key, line);
        Ok(None)
    }

    /// Push an event into the mate's inbox, if the mate is still around.
    fn forward(&self, event: SessionEvent) {
        let Some(mate) = &self.mate else {
            return;
        };
        match mate.handle.upgrade() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!(conn_id = self.conn_id, mate = %mate.name, "mate inbox closed");
                }
            },
            None => debug!(conn_id = self.conn_id, mate = %mate.name, "mate already gone"),
        }
    }

    async fn write(&self, msg: Message) -> Step {
        self.outbox
            .send(Outbound::Frame(msg))
            .await
            .map_err(|_| SessionError::WriterClosed)?;
        Ok(None)
    }

    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }

    fn negotiable(&self) -> bool {
        matches!(self.phase, Phase::Idle | Phase::InvitePending(_))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        duet_store::{HistoryStore, InMemoryHistoryStore},
        tokio::task::JoinHandle,
    };

    /// A session driven through channels instead of a socket.
    struct Harness {
        input: mpsc::UnboundedSender<Inbound>,
        output: mpsc::Receiver<Outbound>,
        cancel: CancellationToken,
        task: JoinHandle<Exit>,
    }

    impl Harness {
        fn start(state: &Arc<GatewayState>) -> Self {
            let (input, rx) = mpsc::unbounded_channel();
            let (outbox, output) = mpsc::channel(64);
            let cancel = CancellationToken::new();
            let session = Session::new(state.next_conn_id(), outbox, Arc::clone(state));
            let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
            let task = tokio::spawn(session.run(stream, cancel.clone()));
            Self {
                input,
                output,
                cancel,
                task,
            }
        }

        fn send(&self, msg: Message) {
            self.input.send(Inbound::Message(msg)).unwrap();
        }

        /// Next frame, skipping presence snapshots.
        async fn recv(&mut self) -> Message {
            loop {
                match self.output.recv().await.unwrap() {
                    Outbound::Frame(Message::OnlineUsers(_)) => continue,
                    Outbound::Frame(msg) => return msg,
                    Outbound::Ping => continue,
                }
            }
        }

        async fn login(state: &Arc<GatewayState>, name: &str) -> Self {
            let mut h = Self::start(state);
            h.send(Message::Register(name.into(), "pw".into()));
            assert_eq!(h.recv().await, Message::Registered);
            h
        }
    }

    async fn pair(state: &Arc<GatewayState>) -> (Harness, Harness) {
        let mut alice = Harness::login(state, "alice").await;
        let mut bob = Harness::login(state, "bob").await;
        alice.send(Message::Invite("bob".into()));
        assert_eq!(alice.recv().await, Message::InviteSent);
        assert_eq!(bob.recv().await, Message::InviteRequest("alice".into()));
        bob.send(Message::InviteCrush("alice".into()));
        assert_eq!(alice.recv().await, Message::InviteAccept("bob".into()));
        (alice, bob)
    }

    #[tokio::test]
    async fn out_of_state_messages_are_ignored() {
        let state = GatewayState::in_memory();
        let mut h = Harness::start(&state);
        h.send(Message::Invite("bob".into()));
        h.send(Message::Chat("hello".into()));
        h.input
            .send(Inbound::Invalid(ProtocolError::UnknownTag("Dance".into())))
            .unwrap();
        h.send(Message::Ping);
        assert_eq!(h.recv().await, Message::Pong);
    }

    #[tokio::test]
    async fn second_login_is_already_online() {
        let state = GatewayState::in_memory();
        let _alice = Harness::login(&state, "alice").await;
        let mut again = Harness::start(&state);
        again.send(Message::Login("alice".into(), "pw".into()));
        assert_eq!(again.recv().await, Message::AlreadyOnline);
    }

    #[tokio::test]
    async fn chat_is_relayed_and_recorded() {
        let state = GatewayState::in_memory();
        let (alice, mut bob) = pair(&state).await;
        alice.send(Message::Chat("hi".into()));
        assert_eq!(bob.recv().await, Message::Chat("hi".into()));

        let transcript = state
            .journal
            .load(PairKey::new("bob", "alice"))
            .await
            .unwrap();
        assert_eq!(transcript, "alice> hi\n");
    }

    #[tokio::test]
    async fn first_pairing_sends_no_history_even_when_inviter_speaks_at_once() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let state = GatewayState::in_memory_with_history(history.clone());
        let (alice, mut bob) = pair(&state).await;
        // The inviter learns of the pairing first and may talk before the
        // accepter's session has finished accepting.
        alice.send(Message::Chat("hi".into()));
        assert_eq!(bob.recv().await, Message::Chat("hi".into()));
        bob.send(Message::Ping);
        assert_eq!(bob.recv().await, Message::Pong);

        let key = PairKey::new("alice", "bob");
        assert_eq!(
            state.journal.load(key.clone()).await.as_deref(),
            Some("alice> hi\n")
        );
        assert_eq!(history.get(&key).await.unwrap().as_deref(), Some("alice> hi\n"));
    }

    #[tokio::test]
    async fn rejected_accept_creates_no_history() {
        let state = GatewayState::in_memory();
        let mut bob = Harness::login(&state, "bob").await;
        bob.send(Message::InviteCrush("alice".into()));
        assert_eq!(bob.recv().await, Message::UserNotFound);
        assert_eq!(state.journal.load(PairKey::new("alice", "bob")).await, None);
    }

    #[tokio::test]
    async fn crash_notifies_mate_once_and_leaves_registry() {
        let state = GatewayState::in_memory();
        let (alice, mut bob) = pair(&state).await;

        alice.input.send(Inbound::Failed("reset".into())).unwrap();
        assert!(matches!(alice.task.await.unwrap(), Exit::Crashed(_)));
        assert_eq!(bob.recv().await, Message::MateClosed);
        assert!(!state.registry.is_online("alice").await.unwrap());
        assert!(state.registry.mate_of("bob").await.unwrap().is_none());

        bob.send(Message::Invite("alice".into()));
        assert_eq!(bob.recv().await, Message::UserNotFound);
    }

    #[tokio::test]
    async fn cancellation_runs_teardown() {
        let state = GatewayState::in_memory();
        let mut alice = Harness::login(&state, "alice").await;
        alice.cancel.cancel();
        assert!(matches!(alice.task.await.unwrap(), Exit::Crashed(_)));
        // Best-effort crash notice reaches the writer.
        let mut saw_crash = false;
        while let Ok(out) = alice.output.try_recv() {
            saw_crash |= matches!(out, Outbound::Frame(Message::Crash));
        }
        assert!(saw_crash);
        assert!(state.registry.online().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repairing_delivers_history_to_both() {
        let history = Arc::new(InMemoryHistoryStore::new());
        let state = GatewayState::in_memory_with_history(history);
        {
            let (alice, mut bob) = pair(&state).await;
            alice.send(Message::Chat("m1".into()));
            assert_eq!(bob.recv().await, Message::Chat("m1".into()));
            bob.send(Message::Chat("m2".into()));
            let mut alice = alice;
            assert_eq!(alice.recv().await, Message::Chat("m2".into()));
            alice.send(Message::Close);
            bob.send(Message::Close);
            assert_eq!(alice.task.await.unwrap(), Exit::Closed);
            assert_eq!(bob.task.await.unwrap(), Exit::Closed);
        }

        let mut alice = Harness::login_existing(&state, "alice").await;
        let mut bob = Harness::login_existing(&state, "bob").await;
        bob.send(Message::Invite("alice".into()));
        assert_eq!(bob.recv().await, Message::InviteSent);
        assert_eq!(alice.recv().await, Message::InviteRequest("bob".into()));
        alice.send(Message::InviteCrush("bob".into()));
        assert_eq!(bob.recv().await, Message::InviteAccept("alice".into()));

        let expected = Message::History("alice> m1\nbob> m2\n".into());
        assert_eq!(alice.recv().await, expected);
        assert_eq!(bob.recv().await, expected);
    }

    #[tokio::test]
    async fn server_stop_ends_session() {
        let state = GatewayState::in_memory();
        let mut alice = Harness::login(&state, "alice").await;
        state.registry.shutdown().await.unwrap();
        assert_eq!(alice.recv().await, Message::ServerStop);
        assert_eq!(alice.task.await.unwrap(), Exit::ServerStop);
    }

    impl Harness {
        async fn login_existing(state: &Arc<GatewayState>, name: &str) -> Self {
            let mut h = Self::start(state);
            h.send(Message::Login(name.into(), "pw".into()));
            assert_eq!(h.recv().await, Message::Logged);
            h
        }
    }
}
