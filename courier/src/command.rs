//! Parsing of the line-mode input.
//!
//! Lines starting with `/` are commands; anything else is sent as a
//! message to the active conversation. Targets are written `@user` or
//! `#group`.

use std::path::PathBuf;

use courier_proto::event::ClientEvent;
use courier_proto::message::{MessageId, Recipient};

use crate::net::NetCommand;

/// Help text printed by `/help`.
pub const HELP: &str = "\
/open @user|#group   open a conversation
/close               close the active conversation
/status @user        ask for a user's presence
/typing | /stop      start or stop the typing indicator
/mute | /unmute      mute notifications for the active conversation
/delete <id>         delete one of your messages
/attach <path> [text] send a file to the active conversation
/cancel <upload-id>  cancel an attachment upload
/sync                request a fresh snapshot
/quit                exit";

/// Why a line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    /// The command needs an active conversation.
    #[error("no conversation is open (use /open @user or /open #group)")]
    NoActiveConversation,
    /// Wrong arguments for a known command.
    #[error("usage: {0}")]
    Usage(&'static str),
    /// Not a known command.
    #[error("unknown command: {0} (try /help)")]
    Unknown(String),
    /// A target did not start with `@` or `#`.
    #[error("invalid target {0:?}: expected @user or #group")]
    BadTarget(String),
    /// A message id that is not a UUID.
    #[error("invalid message id {0:?}")]
    BadMessageId(String),
}

/// A parsed input line.
#[derive(Debug)]
pub enum Input {
    /// Forward to the supervisor.
    Net(NetCommand),
    /// Read a file and send it as an attachment.
    Attach {
        /// File to upload.
        path: PathBuf,
        /// Caption sent as the message content.
        caption: String,
        /// Conversation target.
        target: Recipient,
    },
    /// Print the help text.
    Help,
    /// Exit the client.
    Quit,
    /// Blank line.
    Empty,
}

/// Parses one line typed by the user.
///
/// # Errors
///
/// Returns [`InputError`] if the line is a malformed command or needs an
/// active conversation that does not exist.
pub fn parse(line: &str, active: Option<&Recipient>) -> Result<Input, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(command) = line.strip_prefix('/') else {
        let target = active.ok_or(InputError::NoActiveConversation)?;
        return Ok(send(ClientEvent::SendMessage {
            receiver_id: target.clone(),
            content: line.to_string(),
            attachment: None,
        }));
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(n, r)| (n, r.trim()));
    let require_active = || active.cloned().ok_or(InputError::NoActiveConversation);

    let input = match name {
        "open" => Input::Net(NetCommand::Open(parse_target(rest, "/open @user|#group")?)),
        "close" => Input::Net(NetCommand::Close),
        "status" => match parse_target(rest, "/status @user")? {
            Recipient::User(user) => send(ClientEvent::Status { receiver_id: user }),
            Recipient::Group(_) => return Err(InputError::Usage("/status @user")),
        },
        "typing" => send(ClientEvent::Typing {
            receiver_id: require_active()?,
        }),
        "stop" => send(ClientEvent::NotTyping {
            receiver_id: require_active()?,
        }),
        "mute" | "unmute" => send(ClientEvent::MuteConversation {
            chat_id: require_active()?,
            muted: name == "mute",
        }),
        "delete" => {
            if rest.is_empty() {
                return Err(InputError::Usage("/delete <message-id>"));
            }
            let uuid = uuid::Uuid::parse_str(rest).map_err(|_| InputError::BadMessageId(rest.to_string()))?;
            send(ClientEvent::MessageDeleted {
                id: MessageId::from_uuid(uuid),
                receiver_id: require_active()?,
            })
        }
        "attach" => {
            let (path, caption) = rest
                .split_once(char::is_whitespace)
                .map_or((rest, ""), |(p, c)| (p, c.trim()));
            if path.is_empty() {
                return Err(InputError::Usage("/attach <path> [caption]"));
            }
            Input::Attach {
                path: PathBuf::from(path),
                caption: caption.to_string(),
                target: require_active()?,
            }
        }
        "cancel" => {
            if rest.is_empty() {
                return Err(InputError::Usage("/cancel <upload-id>"));
            }
            send(ClientEvent::CancelUpload {
                upload_id: rest.to_string(),
            })
        }
        "sync" => send(ClientEvent::Sync),
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(InputError::Unknown(format!("/{other}"))),
    };
    Ok(input)
}

/// Parses `@user` or `#group`.
///
/// # Errors
///
/// Returns [`InputError::Usage`] when empty and [`InputError::BadTarget`]
/// when the sigil is missing.
pub fn parse_target(text: &str, usage: &'static str) -> Result<Recipient, InputError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(InputError::Usage(usage));
    }
    if let Some(user) = text.strip_prefix('@').filter(|u| !u.is_empty()) {
        return Ok(Recipient::User(user.into()));
    }
    if let Some(group) = text.strip_prefix('#').filter(|g| !g.is_empty()) {
        return Ok(Recipient::Group(group.into()));
    }
    Err(InputError::BadTarget(text.to_string()))
}

const fn send(event: ClientEvent) -> Input {
    Input::Net(NetCommand::Send(event))
}
