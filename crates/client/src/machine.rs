//! Client side of the protocol as a pure state machine.
//!
//! The machine never touches the terminal or the socket. It consumes user
//! lines and server messages and returns [`Effect`]s for the event loop to
//! carry out, which keeps every transition testable.

use {duet_protocol::Message, tracing::debug};

use crate::commands::{Command, HELP};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(Message),
    /// Show a line of output above the prompt.
    Print(String),
    /// Redraw the prompt (it may have changed).
    Prompt,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthKind {
    Login,
    Register,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// Waiting for `login` or `register`.
    Ready,
    AwaitName(AuthKind),
    AwaitPassword { kind: AuthKind, name: String },
    /// Request sent, exactly one reply outstanding.
    AwaitResponse { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    Sent { target: String },
    /// Waiting for the user to answer Y/N.
    Received { inviter: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Unauthenticated(Auth),
    Idle,
    InviteNegotiation(Negotiation),
    Chatting { mate: String },
    Terminated,
}

/// An accept the server has not confirmed yet. The accepter gets no ack, so
/// the first line or history from the mate settles it, and a pairing error
/// undoes it.
#[derive(Debug, Default)]
struct Unconfirmed {
    /// Invite that arrived in the meantime, shown if the accept fails.
    later_invite: Option<String>,
}

pub struct Machine {
    state: State,
    name: Option<String>,
    /// Last presence snapshot from the server.
    online: String,
    accepting: Option<Unconfirmed>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: State::Unauthenticated(Auth::Ready),
            name: None,
            online: String::new(),
            accepting: None,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn prompt(&self) -> String {
        match &self.state {
            State::Unauthenticated(Auth::AwaitName(_)) => "Write your name: ".into(),
            State::Unauthenticated(Auth::AwaitPassword { .. }) => "Write your password: ".into(),
            State::InviteNegotiation(Negotiation::Received { inviter }) => {
                format!("{inviter} invited you. Accept? (Y/N) ")
            },
            _ => match &self.name {
                Some(name) => format!("duet {name}> "),
                None => "duet> ".into(),
            },
        }
    }

    // ── User input ──────────────────────────────────────────────────────────

    pub fn on_input(&mut self, line: &str) -> Vec<Effect> {
        match &self.state {
            State::Unauthenticated(auth) => {
                let auth = auth.clone();
                self.input_unauthenticated(auth, line)
            },
            State::Idle | State::InviteNegotiation(Negotiation::Sent { .. }) => {
                self.input_idle(line)
            },
            State::InviteNegotiation(Negotiation::Received { inviter }) => {
                let inviter = inviter.clone();
                self.answer_invite(inviter, line)
            },
            State::Chatting { .. } => self.input_chatting(line),
            State::Terminated => Vec::new(),
        }
    }

    fn input_unauthenticated(&mut self, auth: Auth, line: &str) -> Vec<Effect> {
        match auth {
            Auth::Ready => match Command::parse(line) {
                Command::Login => self.begin_auth(AuthKind::Login),
                Command::Register => self.begin_auth(AuthKind::Register),
                Command::Invite(_) | Command::Online => say("You're not logged in"),
                command => self.common(command),
            },
            Auth::AwaitName(kind) => {
                let name = line.trim().to_string();
                self.state = State::Unauthenticated(Auth::AwaitPassword { kind, name });
                vec![Effect::Prompt]
            },
            Auth::AwaitPassword { kind, name } => {
                let password = line.to_string();
                let request = match kind {
                    AuthKind::Login => Message::Login(name.clone(), password),
                    AuthKind::Register => Message::Register(name.clone(), password),
                };
                self.state = State::Unauthenticated(Auth::AwaitResponse { name });
                vec![Effect::Send(request)]
            },
            Auth::AwaitResponse { .. } => say("Waiting for the server, hold on"),
        }
    }

    fn begin_auth(&mut self, kind: AuthKind) -> Vec<Effect> {
        self.state = State::Unauthenticated(Auth::AwaitName(kind));
        vec![Effect::Prompt]
    }

    fn input_idle(&mut self, line: &str) -> Vec<Effect> {
        match Command::parse(line) {
            Command::Invite(Some(target)) => {
                self.state = State::InviteNegotiation(Negotiation::Sent {
                    target: target.clone(),
                });
                vec![Effect::Send(Message::Invite(target))]
            },
            Command::Invite(None) => say("usage: invite [user]"),
            Command::Login | Command::Register => say("You're already logged in"),
            Command::Online => say(self.online_line()),
            command => self.common(command),
        }
    }

    fn answer_invite(&mut self, inviter: String, line: &str) -> Vec<Effect> {
        match line.trim() {
            "y" | "Y" | "yes" | "Yes" => {
                self.state = State::Chatting {
                    mate: inviter.clone(),
                };
                self.accepting = Some(Unconfirmed::default());
                vec![
                    Effect::Send(Message::InviteCrush(inviter.clone())),
                    Effect::Print(format!("Chatting with {inviter}")),
                    Effect::Prompt,
                ]
            },
            "n" | "N" | "no" | "No" => {
                self.state = State::Idle;
                vec![Effect::Send(Message::InvitePass(inviter)), Effect::Prompt]
            },
            _ => vec![Effect::Prompt],
        }
    }

    fn input_chatting(&mut self, line: &str) -> Vec<Effect> {
        match Command::parse(line) {
            Command::Exit => self.terminate(None),
            Command::Help => say(HELP),
            Command::Empty => vec![Effect::Prompt],
            _ => vec![Effect::Send(Message::Chat(line.to_string())), Effect::Prompt],
        }
    }

    /// Commands accepted in every command-driven state.
    fn common(&mut self, command: Command) -> Vec<Effect> {
        match command {
            Command::Help => say(HELP),
            Command::Exit => self.terminate(None),
            Command::Empty => vec![Effect::Prompt],
            _ => say("No such command"),
        }
    }

    /// Ctrl-C or end of input.
    pub fn on_interrupt(&mut self) -> Vec<Effect> {
        self.terminate(None)
    }

    // ── Server messages ─────────────────────────────────────────────────────

    pub fn on_message(&mut self, msg: Message) -> Vec<Effect> {
        if self.state == State::Terminated {
            return Vec::new();
        }
        match msg {
            Message::MateClosed => return self.terminate(Some("Your mate exited chat")),
            Message::Crash => return self.terminate(Some("Your connection crashed.")),
            Message::ServerStop => return self.terminate(Some("Server stopped by admin.")),
            Message::Ping => return vec![Effect::Send(Message::Pong)],
            Message::Pong => return Vec::new(),
            Message::OnlineUsers(names) => {
                self.online = names;
                return say(format!("Online users refresh: {}", self.online));
            },
            _ => {},
        }
        match self.state.clone() {
            State::Unauthenticated(Auth::AwaitResponse { name }) => self.auth_reply(name, msg),
            State::Idle | State::InviteNegotiation(_) => self.negotiation_reply(msg),
            State::Chatting { mate } => self.chat_reply(&mate, msg),
            _ => self.unexpected(msg),
        }
    }

    fn auth_reply(&mut self, name: String, msg: Message) -> Vec<Effect> {
        let failure = match msg {
            Message::Logged | Message::Registered => {
                self.name = Some(name);
                self.state = State::Idle;
                return vec![Effect::Prompt];
            },
            Message::UserNotFound => "User not found",
            Message::WrongPassword => "Wrong password",
            Message::AlreadyOnline => "User already online",
            Message::UserExist => "User already exists",
            other => return self.unexpected(other),
        };
        self.state = State::Unauthenticated(Auth::Ready);
        say(failure)
    }

    fn negotiation_reply(&mut self, msg: Message) -> Vec<Effect> {
        match msg {
            Message::InviteSent => say("Invite sent"),
            Message::InviteRequest(inviter) => {
                self.state = State::InviteNegotiation(Negotiation::Received { inviter });
                vec![Effect::Prompt]
            },
            Message::InviteAccept(mate) => {
                self.state = State::Chatting { mate: mate.clone() };
                say(format!("{mate} accepted"))
            },
            Message::InviteRefuse(by) => {
                self.clear_sent();
                say(format!("{by} refused"))
            },
            Message::UserNotFound => self.invite_failed("User not found"),
            Message::UserIsChatting => self.invite_failed("User is chatting"),
            Message::InviteYourself => self.invite_failed("You cannot invite yourself"),
            other => self.unexpected(other),
        }
    }

    fn chat_reply(&mut self, mate: &str, msg: Message) -> Vec<Effect> {
        match msg {
            Message::Chat(text) => {
                self.accepting = None;
                say(format!("{mate}> {text}"))
            },
            Message::History(transcript) => {
                self.accepting = None;
                say(format!(
                    "Your chat history:\n{}",
                    transcript.trim_end_matches('\n')
                ))
            },
            Message::UserNotFound if self.accepting.is_some() => self.accept_failed("User not found"),
            Message::UserIsChatting if self.accepting.is_some() => {
                self.accept_failed("User is chatting")
            },
            // Our own invite won the race against the one we accepted.
            Message::InviteAccept(other) if self.accepting.is_some() => {
                self.accepting = None;
                self.state = State::Chatting {
                    mate: other.clone(),
                };
                say(format!("{other} accepted"))
            },
            Message::InviteRequest(inviter) => {
                if let Some(unconfirmed) = self.accepting.as_mut() {
                    unconfirmed.later_invite = Some(inviter);
                }
                // Otherwise moot while chatting.
                Vec::new()
            },
            other => self.unexpected(other),
        }
    }

    fn accept_failed(&mut self, reason: &str) -> Vec<Effect> {
        let later_invite = self.accepting.take().and_then(|u| u.later_invite);
        self.state = match later_invite {
            Some(inviter) => State::InviteNegotiation(Negotiation::Received { inviter }),
            None => State::Idle,
        };
        say(reason)
    }

    fn invite_failed(&mut self, reason: &str) -> Vec<Effect> {
        self.clear_sent();
        say(reason)
    }

    fn clear_sent(&mut self) {
        if matches!(self.state, State::InviteNegotiation(Negotiation::Sent { .. })) {
            self.state = State::Idle;
        }
    }

    fn unexpected(&self, msg: Message) -> Vec<Effect> {
        debug!(tag = msg.tag(), state = ?self.state, "ignoring unexpected message");
        Vec::new()
    }

    // ── Termination ─────────────────────────────────────────────────────────

    pub fn on_transport_lost(&mut self, reason: &str) -> Vec<Effect> {
        if self.state == State::Terminated {
            return Vec::new();
        }
        let notice = format!("Connection lost: {reason}");
        self.terminate(Some(&notice))
    }

    fn terminate(&mut self, notice: Option<&str>) -> Vec<Effect> {
        self.state = State::Terminated;
        self.accepting = None;
        let mut effects = Vec::new();
        if let Some(notice) = notice {
            effects.push(Effect::Print(notice.to_string()));
        }
        effects.push(Effect::Send(Message::Close));
        effects.push(Effect::Exit);
        effects
    }

    fn online_line(&self) -> String {
        if self.online.is_empty() {
            "Nobody online".into()
        } else {
            self.online.clone()
        }
    }
}

fn say(line: impl Into<String>) -> Vec<Effect> {
    vec![Effect::Print(line.into()), Effect::Prompt]
}
