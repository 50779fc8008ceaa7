use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

use crate::ProtocolError;

/// Every tag the protocol knows, in catalog order.
pub const TAGS: &[&str] = &[
    "Login",
    "Register",
    "Logged",
    "Registered",
    "UserNotFound",
    "WrongPassword",
    "AlreadyOnline",
    "UserExist",
    "Invite",
    "InviteSent",
    "InviteRequest",
    "InviteCrush",
    "InvitePass",
    "InviteAccept",
    "InviteRefuse",
    "InviteYourself",
    "UserIsChatting",
    "OnlineUsers",
    "Chat",
    "History",
    "MateClosed",
    "Crash",
    "ServerStop",
    "Close",
    "Ping",
    "Pong",
];

/// One application-level envelope.
///
/// Direction is noted per variant: `C→S` is sent by clients, `S→C` by the
/// server. `Chat`, `Ping` and `Pong` flow both ways.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Message {
    /// C→S: `[name, password]`.
    Login(String, String),
    /// C→S: `[name, password]`.
    Register(String, String),
    Logged,
    Registered,
    UserNotFound,
    WrongPassword,
    AlreadyOnline,
    UserExist,
    /// C→S: target user name.
    Invite(String),
    InviteSent,
    /// S→C: name of the inviter.
    InviteRequest(String),
    /// C→S: accept the invite sent by the named user.
    InviteCrush(String),
    /// C→S: decline the invite sent by the named user.
    InvitePass(String),
    /// S→C: name of the user who accepted your invite.
    InviteAccept(String),
    /// S→C: name of the user who declined your invite.
    InviteRefuse(String),
    InviteYourself,
    UserIsChatting,
    /// S→C: space-joined names of everyone online.
    OnlineUsers(String),
    Chat(String),
    /// S→C: transcript of the pair's earlier conversations.
    History(String),
    MateClosed,
    Crash,
    ServerStop,
    Close,
    Ping,
    Pong,
}

impl Message {
    /// The wire tag of this envelope.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Login(..) => "Login",
            Self::Register(..) => "Register",
            Self::Logged => "Logged",
            Self::Registered => "Registered",
            Self::UserNotFound => "UserNotFound",
            Self::WrongPassword => "WrongPassword",
            Self::AlreadyOnline => "AlreadyOnline",
            Self::UserExist => "UserExist",
            Self::Invite(_) => "Invite",
            Self::InviteSent => "InviteSent",
            Self::InviteRequest(_) => "InviteRequest",
            Self::InviteCrush(_) => "InviteCrush",
            Self::InvitePass(_) => "InvitePass",
            Self::InviteAccept(_) => "InviteAccept",
            Self::InviteRefuse(_) => "InviteRefuse",
            Self::InviteYourself => "InviteYourself",
            Self::UserIsChatting => "UserIsChatting",
            Self::OnlineUsers(_) => "OnlineUsers",
            Self::Chat(_) => "Chat",
            Self::History(_) => "History",
            Self::MateClosed => "MateClosed",
            Self::Crash => "Crash",
            Self::ServerStop => "ServerStop",
            Self::Close => "Close",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
        }
    }

    /// Decode one text frame.
    ///
    /// Tags outside [`TAGS`] yield [`ProtocolError::UnknownTag`]; a known tag
    /// whose payload does not fit yields [`ProtocolError::Malformed`].
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let Some(tag) = value.get("type").and_then(Value::as_str) else {
            return Err(ProtocolError::Malformed("missing \"type\" tag".into()));
        };
        if !TAGS.contains(&tag) {
            return Err(ProtocolError::UnknownTag(tag.to_string()));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode as one text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
