//! Online registry: who is connected, who invited whom, who is paired.
//!
//! All membership and pairing state lives in a single actor task. Sessions
//! talk to it through [`RegistryHandle`]; requests are applied strictly one
//! at a time in mailbox order, so joins, leaves and pairings never race.
//! Establishing a pairing updates both members in one step, before either
//! session is told about it.

use std::collections::{BTreeMap, HashSet};

use {
    duet_protocol::{AuthError, PairingError},
    tokio::sync::{mpsc, oneshot},
    tracing::{debug, info, warn},
};

/// Capacity of the registry mailbox.
const MAILBOX_CAPACITY: usize = 256;

/// Events pushed into a session's inbox by the registry or by its mate.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Presence snapshot: space-joined names.
    OnlineUsers(String),
    InviteRequest { from: String },
    InviteRefused { by: String },
    /// Your invite was accepted. The pairing is already in place.
    Paired { mate: String, handle: MateHandle },
    /// Chat text relayed from the mate.
    Chat(String),
    /// Transcript sent by the mate right after pairing.
    History(String),
    /// The mate closed or crashed; the pairing is gone.
    MateLeft,
    ServerStop,
}

/// Inbox of a live session.
pub type SessionHandle = mpsc::UnboundedSender<SessionEvent>;

/// Non-owning reference to the mate's inbox.
pub type MateHandle = mpsc::WeakUnboundedSender<SessionEvent>;

// ── Ledger ───────────────────────────────────────────────────────────────────

struct Member {
    handle: SessionHandle,
    mate: Option<String>,
}

/// The membership and pairing table owned by the actor.
#[derive(Default)]
struct Ledger {
    /// Sorted so presence snapshots come out in a stable order.
    members: BTreeMap<String, Member>,
    /// Outstanding invites as (inviter, target).
    invites: HashSet<(String, String)>,
}

impl Ledger {
    fn join(&mut self, name: String, handle: SessionHandle) -> Result<(), AuthError> {
        if self.members.contains_key(&name) {
            return Err(AuthError::AlreadyOnline);
        }
        self.members.insert(name, Member { handle, mate: None });
        Ok(())
    }

    /// Remove `name`, dissolving its pairing. Returns whether it was present.
    fn leave(&mut self, name: &str) -> bool {
        let Some(member) = self.members.remove(name) else {
            return false;
        };
        self.invites.retain(|(from, to)| from != name && to != name);
        if let Some(mate_name) = member.mate
            && let Some(mate) = self.members.get_mut(&mate_name)
        {
            mate.mate = None;
            let _ = mate.handle.send(SessionEvent::MateLeft);
        }
        true
    }

    fn invite(&mut self, from: &str, target: &str) -> Result<(), PairingError> {
        if from == target {
            return Err(PairingError::InviteYourself);
        }
        let member = self.members.get(target).ok_or(PairingError::UserNotFound)?;
        if member.mate.is_some() {
            return Err(PairingError::UserIsChatting);
        }
        member
            .handle
            .send(SessionEvent::InviteRequest {
                from: from.to_string(),
            })
            .map_err(|_| PairingError::UserNotFound)?;
        self.invites.insert((from.to_string(), target.to_string()));
        Ok(())
    }

    /// Pair `accepter` with `inviter`. Both sides are updated here, and the
    /// inviter's session is notified before the accepter gets its reply.
    fn accept(&mut self, accepter: &str, inviter: &str) -> Result<MateHandle, PairingError> {
        let inviter_member = self.members.get(inviter).ok_or(PairingError::UserNotFound)?;
        let accepter_member = self
            .members
            .get(accepter)
            .ok_or(PairingError::UserNotFound)?;
        if inviter_member.mate.is_some() || accepter_member.mate.is_some() {
            return Err(PairingError::UserIsChatting);
        }
        if !self
            .invites
            .contains(&(inviter.to_string(), accepter.to_string()))
        {
            return Err(PairingError::UserNotFound);
        }

        let inviter_handle = inviter_member.handle.downgrade();
        inviter_member
            .handle
            .send(SessionEvent::Paired {
                mate: accepter.to_string(),
                handle: accepter_member.handle.downgrade(),
            })
            .map_err(|_| PairingError::UserNotFound)?;

        for (name, mate) in [(accepter, inviter), (inviter, accepter)] {
            if let Some(member) = self.members.get_mut(name) {
                member.mate = Some(mate.to_string());
            }
        }
        self.invites
            .retain(|(from, to)| ![inviter, accepter].iter().any(|n| n == from || n == to));
        Ok(inviter_handle)
    }

    fn decline(&mut self, decliner: &str, inviter: &str) -> bool {
        if !self
            .invites
            .remove(&(inviter.to_string(), decliner.to_string()))
        {
            return false;
        }
        match self.members.get(inviter) {
            Some(member) => member
                .handle
                .send(SessionEvent::InviteRefused {
                    by: decliner.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    fn online_names(&self) -> String {
        self.members
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Push the current presence snapshot to every member.
    fn broadcast_online(&self) {
        let names = self.online_names();
        for member in self.members.values() {
            let _ = member.handle.send(SessionEvent::OnlineUsers(names.clone()));
        }
    }

    fn mate_of(&self, name: &str) -> Option<String> {
        self.members.get(name).and_then(|m| m.mate.clone())
    }
}

// ── Actor ────────────────────────────────────────────────────────────────────

enum Command {
    Join {
        name: String,
        handle: SessionHandle,
        reply: oneshot::Sender<Result<(), AuthError>>,
    },
    Leave {
        name: String,
        reply: oneshot::Sender<()>,
    },
    IsOnline {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    Invite {
        from: String,
        target: String,
        reply: oneshot::Sender<Result<(), PairingError>>,
    },
    Accept {
        accepter: String,
        inviter: String,
        reply: oneshot::Sender<Result<MateHandle, PairingError>>,
    },
    Decline {
        decliner: String,
        inviter: String,
    },
    MateOf {
        name: String,
        reply: oneshot::Sender<Option<String>>,
    },
    Online {
        reply: oneshot::Sender<Vec<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// The registry actor went away (only happens while the process exits).
#[derive(Debug, thiserror::Error)]
#[error("online registry is unavailable")]
pub struct RegistryClosed;

/// Cloneable client of the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    /// Spawn the actor on the current runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        tokio::spawn(run(rx));
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RegistryClosed> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.map_err(|_| RegistryClosed)?;
        rx.await.map_err(|_| RegistryClosed)
    }

    pub async fn join(
        &self,
        name: &str,
        handle: SessionHandle,
    ) -> Result<Result<(), AuthError>, RegistryClosed> {
        self.request(|reply| Command::Join {
            name: name.to_string(),
            handle,
            reply,
        })
        .await
    }

    pub async fn leave(&self, name: &str) -> Result<(), RegistryClosed> {
        self.request(|reply| Command::Leave {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn is_online(&self, name: &str) -> Result<bool, RegistryClosed> {
        self.request(|reply| Command::IsOnline {
            name: name.to_string(),
            reply,
        })
        .await
    }

    pub async fn invite(
        &self,
        from: &str,
        target: &str,
    ) -> Result<Result<(), PairingError>, RegistryClosed> {
        self.request(|reply| Command::Invite {
            from: from.to_string(),
            target: target.to_string(),
            reply,
        })
        .await
    }

    /// Accept `inviter`'s invite. On success returns the inviter's inbox.
    pub async fn accept(
        &self,
        accepter: &str,
        inviter: &str,
    ) -> Result<Result<MateHandle, PairingError>, RegistryClosed> {
        self.request(|reply| Command::Accept {
            accepter: accepter.to_string(),
            inviter: inviter.to_string(),
            reply,
        })
        .await
    }

    pub async fn decline(&self, decliner: &str, inviter: &str) -> Result<(), RegistryClosed> {
        self.tx
            .send(Command::Decline {
                decliner: decliner.to_string(),
                inviter: inviter.to_string(),
            })
            .await
            .map_err(|_| RegistryClosed)
    }

    /// Current mate of `name`, as recorded centrally.
    pub async fn mate_of(&self, name: &str) -> Result<Option<String>, RegistryClosed> {
        self.request(|reply| Command::MateOf {
            name: name.to_string(),
            reply,
        })
        .await
    }

    /// Names currently online, sorted.
    pub async fn online(&self) -> Result<Vec<String>, RegistryClosed> {
        self.request(|reply| Command::Online { reply }).await
    }

    /// Tell every member the server is stopping.
    pub async fn shutdown(&self) -> Result<(), RegistryClosed> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

async fn run(mut rx: mpsc::Receiver<Command>) {
    let mut ledger = Ledger::default();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Join {
                name,
                handle,
                reply,
            } => {
                let result = ledger.join(name.clone(), handle);
                if result.is_ok() {
                    info!(%name, online = ledger.members.len(), "joined");
                    ledger.broadcast_online();
                }
                let _ = reply.send(result);
            },
            Command::Leave { name, reply } => {
                if ledger.leave(&name) {
                    info!(%name, online = ledger.members.len(), "left");
                    ledger.broadcast_online();
                }
                let _ = reply.send(());
            },
            Command::IsOnline { name, reply } => {
                let _ = reply.send(ledger.members.contains_key(&name));
            },
            Command::Invite {
                from,
                target,
                reply,
            } => {
                let result = ledger.invite(&from, &target);
                debug!(%from, %target, ?result, "invite");
                let _ = reply.send(result);
            },
            Command::Accept {
                accepter,
                inviter,
                reply,
            } => {
                let result = ledger.accept(&accepter, &inviter);
                match &result {
                    Ok(_) => info!(%inviter, %accepter, "paired"),
                    Err(e) => debug!(%inviter, %accepter, error = %e, "accept rejected"),
                }
                if reply.send(result).is_err() {
                    // The accepter vanished mid-request; undo so nobody is
                    // left paired with a dead session.
                    warn!(%accepter, "accepter gone before pairing completed");
                    if ledger.mate_of(&accepter).is_some() {
                        ledger.leave(&accepter);
                        ledger.broadcast_online();
                    }
                }
            },
            Command::Decline { decliner, inviter } => {
                let notified = ledger.decline(&decliner, &inviter);
                debug!(%inviter, %decliner, notified, "invite declined");
            },
            Command::MateOf { name, reply } => {
                let _ = reply.send(ledger.mate_of(&name));
            },
            Command::Online { reply } => {
                let _ = reply.send(ledger.members.keys().cloned().collect());
            },
            Command::Shutdown { reply } => {
                info!(online = ledger.members.len(), "notifying sessions of shutdown");
                for member in ledger.members.values() {
                    let _ = member.handle.send(SessionEvent::ServerStop);
                }
                let _ = reply.send(());
            },
        }
    }
    debug!("registry mailbox closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn last_online(events: &[SessionEvent]) -> Option<String> {
        events.iter().rev().find_map(|e| match e {
            SessionEvent::OnlineUsers(names) => Some(names.clone()),
            _ => None,
        })
    }

    #[tokio::test]
    async fn join_and_leave_broadcast_presence() {
        let registry = RegistryHandle::spawn();
        let (alice, mut alice_rx) = session();
        let (bob, mut bob_rx) = session();

        registry.join("alice", alice).await.unwrap().unwrap();
        registry.join("bob", bob).await.unwrap().unwrap();
        assert_eq!(last_online(&drain(&mut alice_rx)).unwrap(), "alice bob");
        assert_eq!(last_online(&drain(&mut bob_rx)).unwrap(), "alice bob");

        registry.leave("alice").await.unwrap();
        assert_eq!(last_online(&drain(&mut bob_rx)).unwrap(), "bob");
        assert_eq!(registry.online().await.unwrap(), vec!["bob".to_string()]);
        assert!(!registry.is_online("alice").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_join_is_rejected() {
        let registry = RegistryHandle::spawn();
        let (first, _rx1) = session();
        let (second, _rx2) = session();
        registry.join("alice", first).await.unwrap().unwrap();
        assert_eq!(
            registry.join("alice", second).await.unwrap(),
            Err(AuthError::AlreadyOnline)
        );
    }

    #[tokio::test]
    async fn concurrent_joins_of_one_name_admit_exactly_one() {
        let registry = RegistryHandle::spawn();
        let mut tasks = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..16 {
            let (tx, rx) = session();
            receivers.push(rx);
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.join("alice", tx).await.unwrap()
            }));
        }
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn invite_rejections() {
        let registry = RegistryHandle::spawn();
        let (alice, _a) = session();
        registry.join("alice", alice).await.unwrap().unwrap();

        assert_eq!(
            registry.invite("alice", "alice").await.unwrap(),
            Err(PairingError::InviteYourself)
        );
        assert_eq!(
            registry.invite("alice", "nobody").await.unwrap(),
            Err(PairingError::UserNotFound)
        );
    }

    #[tokio::test]
    async fn invite_accept_pairs_both_sides() {
        let registry = RegistryHandle::spawn();
        let (alice, mut alice_rx) = session();
        let (bob, mut bob_rx) = session();
        registry.join("alice", alice).await.unwrap().unwrap();
        registry.join("bob", bob).await.unwrap().unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        registry.invite("alice", "bob").await.unwrap().unwrap();
        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [SessionEvent::InviteRequest { from }] if from == "alice"
        ));

        let inviter = registry.accept("bob", "alice").await.unwrap().unwrap();
        assert!(inviter.upgrade().is_some());
        assert_eq!(registry.mate_of("alice").await.unwrap().as_deref(), Some("bob"));
        assert_eq!(registry.mate_of("bob").await.unwrap().as_deref(), Some("alice"));

        // The inviter learns about the pairing from the registry itself.
        assert!(matches!(
            drain(&mut alice_rx).as_slice(),
            [SessionEvent::Paired { mate, .. }] if mate == "bob"
        ));
    }

    #[tokio::test]
    async fn accept_without_invite_is_refused() {
        let registry = RegistryHandle::spawn();
        let (alice, _a) = session();
        let (bob, _b) = session();
        registry.join("alice", alice).await.unwrap().unwrap();
        registry.join("bob", bob).await.unwrap().unwrap();

        assert_eq!(
            registry.accept("bob", "alice").await.unwrap().err(),
            Some(PairingError::UserNotFound)
        );
        assert_eq!(
            registry.accept("bob", "ghost").await.unwrap().err(),
            Some(PairingError::UserNotFound)
        );
        assert!(registry.mate_of("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn paired_user_cannot_be_invited_but_pending_one_can() {
        let registry = RegistryHandle::spawn();
        let mut rxs = Vec::new();
        for name in ["alice", "bob", "carol", "dave"] {
            let (tx, rx) = session();
            rxs.push(rx);
            registry.join(name, tx).await.unwrap().unwrap();
        }

        // bob holds an unanswered invite from alice: still inviteable.
        registry.invite("alice", "bob").await.unwrap().unwrap();
        registry.invite("carol", "bob").await.unwrap().unwrap();

        registry.accept("bob", "carol").await.unwrap().unwrap();
        assert_eq!(
            registry.invite("dave", "bob").await.unwrap(),
            Err(PairingError::UserIsChatting)
        );
        // alice's stale invite can no longer be accepted.
        assert_eq!(
            registry.accept("bob", "alice").await.unwrap().err(),
            Some(PairingError::UserIsChatting)
        );
    }

    #[tokio::test]
    async fn racing_accepts_pair_inviter_once() {
        let registry = RegistryHandle::spawn();
        let mut rxs = Vec::new();
        for name in ["alice", "bob", "carol"] {
            let (tx, rx) = session();
            rxs.push(rx);
            registry.join(name, tx).await.unwrap().unwrap();
        }
        registry.invite("alice", "bob").await.unwrap().unwrap();
        registry.invite("alice", "carol").await.unwrap().unwrap();

        let (r1, r2) = tokio::join!(
            registry.accept("bob", "alice"),
            registry.accept("carol", "alice")
        );
        let wins = [r1.unwrap().is_ok(), r2.unwrap().is_ok()];
        assert_eq!(wins.iter().filter(|w| **w).count(), 1);

        let mate = registry.mate_of("alice").await.unwrap().unwrap();
        assert_eq!(
            registry.mate_of(&mate).await.unwrap().as_deref(),
            Some("alice")
        );
        let loser = if mate == "bob" { "carol" } else { "bob" };
        assert!(registry.mate_of(loser).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leaving_mate_is_notified_once_and_unpaired() {
        let registry = RegistryHandle::spawn();
        let (alice, _alice_rx) = session();
        let (bob, mut bob_rx) = session();
        registry.join("alice", alice).await.unwrap().unwrap();
        registry.join("bob", bob).await.unwrap().unwrap();
        registry.invite("alice", "bob").await.unwrap().unwrap();
        registry.accept("bob", "alice").await.unwrap().unwrap();
        drain(&mut bob_rx);

        registry.leave("alice").await.unwrap();
        let events = drain(&mut bob_rx);
        let mate_left = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::MateLeft))
            .count();
        assert_eq!(mate_left, 1);
        assert!(registry.mate_of("bob").await.unwrap().is_none());
        assert_eq!(
            registry.invite("bob", "alice").await.unwrap(),
            Err(PairingError::UserNotFound)
        );
    }

    #[tokio::test]
    async fn decline_notifies_inviter() {
        let registry = RegistryHandle::spawn();
        let (alice, mut alice_rx) = session();
        let (bob, _bob_rx) = session();
        registry.join("alice", alice).await.unwrap().unwrap();
        registry.join("bob", bob).await.unwrap().unwrap();
        registry.invite("alice", "bob").await.unwrap().unwrap();
        drain(&mut alice_rx);

        registry.decline("bob", "alice").await.unwrap();
        // Decline is fire-and-forget; a follow-up request orders after it.
        registry.online().await.unwrap();
        assert!(matches!(
            drain(&mut alice_rx).as_slice(),
            [SessionEvent::InviteRefused { by }] if by == "bob"
        ));
        // The invite is gone.
        assert!(registry.accept("bob", "alice").await.unwrap().is_err());
    }

    #[tokio::test]
    async fn shutdown_reaches_every_member() {
        let registry = RegistryHandle::spawn();
        let (alice, mut alice_rx) = session();
        registry.join("alice", alice).await.unwrap().unwrap();
        registry.shutdown().await.unwrap();
        assert!(
            drain(&mut alice_rx)
                .iter()
                .any(|e| matches!(e, SessionEvent::ServerStop))
        );
    }
}
