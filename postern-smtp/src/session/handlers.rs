use std::borrow::Cow;

use postern_common::{address::MailAddress, incoming, internal, status::Status};
use tokio::io::{AsyncRead, AsyncWrite};

use super::Session;
use crate::{
    auth::{self, LOGIN_PASSWORD, LOGIN_USERNAME, Mechanism},
    command::{Command, HeloVariant, MailParameters, ParseError},
    connection::{Line, MAX_COMMAND_LINE},
    error::{ProtocolError, SessionResult},
    reply::Reply,
    state::HelloMode,
};

type HandlerResult = Result<Reply, ProtocolError>;

const HELP: [&str; 4] = [
    "Supported commands:",
    "HELO EHLO AUTH MAIL RCPT DATA",
    "RSET NOOP QUIT VRFY EXPN HELP",
    "End of HELP info",
];

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    /// Handle one command line. Returns true once the session should close.
    pub(crate) async fn dispatch(&mut self, line: &str) -> SessionResult<bool> {
        let command = match Command::try_from(line) {
            Ok(command) => command,
            Err(ParseError::Unrecognised(verb)) => {
                let reply = if self.state.message_failed {
                    Reply::new(Status::Unrecognised, "Syntax error, command unrecognized")
                } else {
                    incoming!("{verb}");
                    Reply::new(
                        Status::Unrecognised,
                        format!(
                            "{} Syntax error, command unrecognized: {verb}",
                            self.context.config.hostname
                        ),
                    )
                };
                self.send(&reply).await?;
                return Ok(false);
            }
            Err(ParseError::Syntax(message)) => {
                if !self.state.message_failed {
                    incoming!("{}", line.trim_end());
                }
                let verb = line
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_ascii_uppercase();
                let error = self
                    .out_of_sequence(&verb)
                    .unwrap_or_else(|| ProtocolError::syntax(message));
                self.send(&Reply::from(error)).await?;
                return Ok(false);
            }
        };

        if !self.state.message_failed {
            incoming!("{command}");
        }

        let reply = match command {
            Command::Helo(variant) => self.handle_helo(&variant),
            Command::Auth { mechanism, initial } => self.handle_auth(&mechanism, initial).await?,
            Command::MailFrom(sender, params) => self.handle_mail(sender, &params),
            Command::RcptTo(recipient) => self.handle_rcpt(recipient),
            Command::Data => self.handle_data().await?,
            Command::Rset => {
                self.state.rset();
                Ok(Reply::ok("OK"))
            }
            Command::Noop => Ok(Reply::ok("OK")),
            Command::Quit => {
                let reply = Reply::new(
                    Status::GoodBye,
                    format!(
                        "{} Service closing transmission channel",
                        self.context.config.hostname
                    ),
                );
                self.send(&reply).await?;
                return Ok(true);
            }
            Command::Vrfy(_) => Ok(Reply::new(
                Status::CannotVerify,
                "Cannot VRFY user, but will accept message and attempt delivery",
            )),
            Command::Expn(_) => Err(ProtocolError::new(
                Status::NotImplemented,
                "EXPN is not supported",
            )),
            Command::Help(_) => Ok(Reply::multiline(
                Status::HelpMessage,
                HELP.into_iter().map(Cow::Borrowed).collect(),
            )),
        };

        self.send(&reply.unwrap_or_else(Reply::from)).await?;
        Ok(false)
    }

    fn handle_helo(&mut self, variant: &HeloVariant) -> HandlerResult {
        let config = &self.context.config;
        let mode = match variant {
            HeloVariant::Ehlo(_) => HelloMode::Ehlo,
            HeloVariant::Helo(_) => HelloMode::Helo,
        };

        if !self.state.greet(mode, variant.name()) {
            return Ok(Reply::ok(format!("{} Duplicate HELO/EHLO", config.hostname)));
        }

        let ip = self.peer.ip();
        let greeting = format!("{} Hello {} ({ip} [{ip}])", config.hostname, variant.name());

        if mode == HelloMode::Helo {
            return Ok(Reply::ok(greeting));
        }

        let mut lines = vec![Cow::Owned(greeting)];
        if let Some(max) = config.max_message_bytes() {
            lines.push(Cow::Owned(format!("SIZE {max}")));
        }
        if config.offers_auth(ip) {
            lines.push(Cow::Borrowed("AUTH LOGIN PLAIN"));
            // Some older clients only understand the draft syntax
            lines.push(Cow::Borrowed("AUTH=LOGIN PLAIN"));
        }

        Ok(Reply::multiline(Status::Ok, lines))
    }

    /// Ordering errors for `verb`, which win over any problem with its arguments.
    fn out_of_sequence(&self, verb: &str) -> Option<ProtocolError> {
        match verb {
            "MAIL" if self.state.has_sender() => {
                Some(ProtocolError::sequence("Sender already specified"))
            }
            "MAIL"
                if self.context.config.helo_ehlo_enforcement
                    && self.state.hello_mode == HelloMode::None =>
            {
                Some(ProtocolError::sequence("Need HELO or EHLO before MAIL"))
            }
            "RCPT" if !self.state.has_sender() => {
                Some(ProtocolError::sequence("Need MAIL before RCPT"))
            }
            _ => None,
        }
    }

    fn handle_mail(&mut self, sender: Option<MailAddress>, params: &MailParameters) -> HandlerResult {
        if let Some(error) = self.out_of_sequence("MAIL") {
            return Err(error);
        }

        let config = &self.context.config;

        if let (Some(declared), Some(max)) = (params.size(), config.max_message_bytes())
            && declared > max
        {
            return Err(ProtocolError::new(
                Status::ExceededStorage,
                "Message size exceeds fixed maximum message size",
            ));
        }

        let reply = Reply::ok(format!(
            "Sender <{}> OK",
            sender.as_ref().map(ToString::to_string).unwrap_or_default()
        ));

        self.state.declared_size = params.size();
        self.state.sender = Some(sender);

        Ok(reply)
    }

    fn handle_rcpt(&mut self, recipient: MailAddress) -> HandlerResult {
        let config = &self.context.config;

        let Some(sender) = &self.state.sender else {
            return Err(ProtocolError::sequence("Need MAIL before RCPT"));
        };

        if config.auth_required.enforced() && !config.is_authorized(self.peer.ip()) {
            match &self.state.authenticated_user {
                None if !config.is_local_domain(&recipient.domain) => {
                    internal!(
                        level = INFO,
                        "Rejected relay attempt from {} to {recipient}",
                        self.peer
                    );
                    return Err(ProtocolError::new(
                        Status::AuthRequired,
                        "Authentication Required",
                    ));
                }
                Some(user) if config.verify_identity => {
                    let as_self = sender.as_ref().is_some_and(|sender| {
                        sender.local_part == *user && config.is_local_domain(&sender.domain)
                    });

                    if !as_self {
                        return Err(ProtocolError::sequence(
                            "Incorrect Authentication for Specified Email Address",
                        ));
                    }
                }
                _ => {}
            }
        }

        let reply = Reply::ok(format!("Recipient <{recipient}> OK"));
        self.state.recipients.push(recipient);

        Ok(reply)
    }

    async fn handle_auth(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> SessionResult<HandlerResult> {
        if !self.context.config.auth_required.enforced() {
            return Ok(Err(ProtocolError::sequence("AUTH is not enabled")));
        }

        if self.state.authenticated_user.is_some() {
            return Ok(Err(ProtocolError::sequence(
                "User has previously authenticated. Further authentication is not required!",
            )));
        }

        let Ok(mechanism) = Mechanism::try_from(mechanism) else {
            return Ok(Err(ProtocolError::new(
                Status::ParameterNotImplemented,
                "Unrecognized Authentication Type",
            )));
        };

        let credentials = match mechanism {
            Mechanism::Plain => {
                let response = match initial {
                    Some(response) => Some(response),
                    None => self.challenge("OK. Continue authentication").await?,
                };
                let Some(response) = response else {
                    return Ok(Err(aborted()));
                };
                auth::decode_plain(&response)
            }
            Mechanism::Login => {
                let user = match initial {
                    Some(user) => Some(user),
                    None => self.challenge(LOGIN_USERNAME).await?,
                };
                let Some(user) = user else {
                    return Ok(Err(aborted()));
                };
                let Some(password) = self.challenge(LOGIN_PASSWORD).await? else {
                    return Ok(Err(aborted()));
                };
                auth::decode(&user).zip(auth::decode(&password))
            }
        };

        let Some((user, password)) = credentials else {
            return Ok(Err(ProtocolError::syntax(Cow::Borrowed(
                "Could not decode parameters for AUTH",
            ))));
        };

        if self.context.users.test(&user, &password) {
            internal!("Authenticated {user} from {}", self.peer);
            self.state.authenticated_user = Some(user);
            Ok(Ok(Reply::new(
                Status::AuthSucceeded,
                "Authentication Successful",
            )))
        } else {
            internal!(level = WARN, "Failed authentication for {user} from {}", self.peer);
            Ok(Err(ProtocolError::new(
                Status::AuthFailed,
                "Authentication Failed",
            )))
        }
    }

    /// Send a 334 challenge and read the response. `None` if the client
    /// cancelled with `*`.
    async fn challenge(&mut self, prompt: &'static str) -> SessionResult<Option<String>> {
        self.send(&Reply::new(Status::AuthChallenge, prompt)).await?;

        let mut buf = Vec::new();
        match self.read_line(&mut buf, MAX_COMMAND_LINE).await? {
            Line::Eof => Err(crate::error::SessionError::Disconnected),
            Line::TooLong => Ok(None),
            Line::Complete(_) => {
                let response = String::from_utf8_lossy(&buf).trim().to_string();
                Ok((response != "*").then_some(response))
            }
        }
    }
}

fn aborted() -> ProtocolError {
    ProtocolError::syntax(Cow::Borrowed("AUTH aborted"))
}
