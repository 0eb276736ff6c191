//! One delivery attempt against one remote server.

use std::time::Duration;

use postern_common::{address::MailAddress, internal, mail::Mail};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    DeliveryError, TemporaryError,
    client::{ClientError, Response, SmtpClient},
    dns::MailServer,
};

/// What became of each recipient of an attempt.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub delivered: Vec<MailAddress>,
    /// Failed for now, worth another attempt
    pub deferred: Vec<MailAddress>,
    /// Failed for good
    pub rejected: Vec<MailAddress>,
    /// The last failure seen, if any
    pub reason: Option<String>,
}

impl Outcome {
    pub fn delivered(recipients: &[MailAddress]) -> Self {
        Self {
            delivered: recipients.to_vec(),
            ..Self::default()
        }
    }

    /// Every recipient failed with `error`.
    pub fn failed(recipients: &[MailAddress], error: &DeliveryError) -> Self {
        let mut outcome = Self {
            reason: Some(error.to_string()),
            ..Self::default()
        };

        if error.is_permanent() {
            outcome.rejected = recipients.to_vec();
        } else {
            outcome.deferred = recipients.to_vec();
        }

        outcome
    }

    fn fail(&mut self, recipients: Vec<MailAddress>, reply: &Response, command: &str) {
        self.reason = Some(format!("{command} rejected: {} {}", reply.code, reply.message()));

        if reply.is_permanent() {
            self.rejected.extend(recipients);
        } else {
            self.deferred.extend(recipients);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.deferred.is_empty() && self.rejected.is_empty()
    }
}

pub struct SmtpTransaction<'a> {
    mail: &'a Mail,
    helo: &'a str,
    timeout: Duration,
    sendpartial: bool,
}

impl<'a> SmtpTransaction<'a> {
    pub const fn new(mail: &'a Mail, helo: &'a str, timeout: Duration, sendpartial: bool) -> Self {
        Self {
            mail,
            helo,
            timeout,
            sendpartial,
        }
    }

    async fn timed<T>(
        &self,
        stage: &str,
        future: impl Future<Output = Result<T, ClientError>>,
    ) -> Result<T, DeliveryError> {
        tokio::time::timeout(self.timeout, future)
            .await
            .map_err(|_| {
                TemporaryError::Timeout(format!("{stage} timed out after {:?}", self.timeout))
            })?
            .map_err(DeliveryError::from)
    }

    /// Connect to `server` and deliver.
    ///
    /// An error means the attempt failed before any recipient was tried, so
    /// another server may do better.
    pub async fn execute(&self, server: &MailServer) -> Result<Outcome, DeliveryError> {
        let address = server.address();
        internal!("Delivering mail {} via {address}", self.mail.id);

        let mut client = self
            .timed("Connect", SmtpClient::connect(&address))
            .await
            .map_err(|err| match err {
                DeliveryError::Temporary(TemporaryError::ConnectionFailed(reason)) => {
                    DeliveryError::from(TemporaryError::ConnectionFailed(format!(
                        "{address}: {reason}"
                    )))
                }
                other => other,
            })?;

        self.run(&mut client).await
    }

    pub async fn run<Stream>(
        &self,
        client: &mut SmtpClient<Stream>,
    ) -> Result<Outcome, DeliveryError>
    where
        Stream: AsyncRead + AsyncWrite + Unpin,
    {
        self.timed("Greeting", client.read_response())
            .await?
            .into_result("Connection")?;

        let ehlo = self.timed("EHLO", client.ehlo(self.helo)).await?;
        let size = if ehlo.is_success() {
            ehlo.has_extension("SIZE")
                .then(|| self.mail.message.size())
        } else {
            self.timed("HELO", client.helo(self.helo))
                .await?
                .into_result("HELO")?;
            None
        };

        self.timed("MAIL", client.mail_from(&self.mail.reverse_path(), size))
            .await?
            .into_result("MAIL")?;

        let mut outcome = Outcome::default();
        let mut accepted = Vec::new();

        for recipient in &self.mail.recipients {
            let reply = self.timed("RCPT", client.rcpt_to(recipient)).await?;
            if reply.is_success() {
                accepted.push(recipient.clone());
            } else {
                outcome.fail(vec![recipient.clone()], &reply, &format!("RCPT <{recipient}>"));
            }
        }

        if !outcome.is_complete() && !self.sendpartial {
            self.quit(client).await;
            return Ok(self.all_or_nothing(outcome));
        }

        if accepted.is_empty() {
            self.quit(client).await;
            return Ok(outcome);
        }

        let data = self.timed("DATA", client.data()).await?;
        if data.code != 354 {
            outcome.fail(accepted, &data, "DATA");
            self.quit(client).await;
            return Ok(outcome);
        }

        let message = self.mail.message.to_bytes();
        let reply = self.timed("Message", client.send_message(&message)).await?;
        if reply.is_success() {
            outcome.delivered = accepted;
        } else {
            outcome.fail(accepted, &reply, "Message");
        }

        self.quit(client).await;
        Ok(outcome)
    }

    /// Without `sendpartial` one refused recipient fails the whole mail. It
    /// is deferred unless every refusal was permanent.
    fn all_or_nothing(&self, partial: Outcome) -> Outcome {
        let recipients = self.mail.recipients.clone();
        let mut outcome = Outcome {
            reason: partial.reason,
            ..Outcome::default()
        };

        if partial.deferred.is_empty() {
            outcome.rejected = recipients;
        } else {
            outcome.deferred = recipients;
        }

        outcome
    }

    async fn quit<Stream>(&self, client: &mut SmtpClient<Stream>)
    where
        Stream: AsyncRead + AsyncWrite + Unpin,
    {
        // Whatever was delivered stays delivered
        if let Err(err) = self.timed("QUIT", client.quit()).await {
            internal!(level = DEBUG, "QUIT after mail {} failed: {err}", self.mail.id);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use postern_common::{address::MailAddress, mail::Mail, message::MessageSource};
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

    use super::*;

    /// Replies of a scripted server. RCPT replies are looked up by local part.
    #[derive(Clone)]
    pub struct Script {
        pub ehlo: &'static str,
        pub mail: &'static str,
        pub rcpt: fn(&str) -> &'static str,
        pub data: &'static str,
        pub message: &'static str,
    }

    impl Default for Script {
        fn default() -> Self {
            Self {
                ehlo: "250-mx.test\r\n250 SIZE 1000000\r\n",
                mail: "250 OK\r\n",
                rcpt: |_| "250 OK\r\n",
                data: "354 Go ahead\r\n",
                message: "250 Queued\r\n",
            }
        }
    }

    /// Play `script` over `stream`, returning every line received.
    pub async fn serve<S>(stream: S, script: Script) -> Vec<String>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        let mut received = Vec::new();
        let mut in_data = false;

        write.write_all(b"220 mx.test ready\r\n").await.unwrap();

        while let Ok(Some(line)) = lines.next_line().await {
            received.push(line.clone());

            if in_data {
                if line == "." {
                    in_data = false;
                    write.write_all(script.message.as_bytes()).await.unwrap();
                }
                continue;
            }

            let upper = line.to_ascii_uppercase();
            let reply = if upper.starts_with("EHLO") {
                script.ehlo
            } else if upper.starts_with("HELO") {
                "250 mx.test\r\n"
            } else if upper.starts_with("MAIL") {
                script.mail
            } else if let Some(rest) = upper.strip_prefix("RCPT TO:<") {
                let local = rest.split('@').next().unwrap_or_default().to_ascii_lowercase();
                (script.rcpt)(&local)
            } else if upper == "DATA" {
                in_data = script.data.starts_with("354");
                script.data
            } else if upper == "QUIT" {
                write.write_all(b"221 Bye\r\n").await.unwrap();
                break;
            } else {
                "250 OK\r\n"
            };

            write.write_all(reply.as_bytes()).await.unwrap();
        }

        received
    }

    pub fn mail(recipients: &[&str]) -> Mail {
        Mail::new(
            Some(MailAddress::new("alice", "example.com")),
            recipients
                .iter()
                .map(|local| MailAddress::new(*local, "remote.test"))
                .collect(),
            MessageSource::parse(b"Subject: hi\r\n\r\nHello\r\n.dot\r\n").unwrap(),
        )
    }

    async fn attempt(mail: &Mail, script: Script, sendpartial: bool) -> (Outcome, Vec<String>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve(server, script));

        let mut client = SmtpClient::new(client);
        let outcome = SmtpTransaction::new(mail, "mx.example", Duration::from_secs(5), sendpartial)
            .run(&mut client)
            .await
            .unwrap();
        drop(client);

        (outcome, server.await.unwrap())
    }

    fn addresses(locals: &[&str]) -> Vec<MailAddress> {
        locals
            .iter()
            .map(|local| MailAddress::new(*local, "remote.test"))
            .collect()
    }

    #[tokio::test]
    async fn delivers_everything() {
        let mail = mail(&["bob", "carol"]);
        let (outcome, received) = attempt(&mail, Script::default(), false).await;

        assert_eq!(outcome, Outcome::delivered(&mail.recipients));
        assert_eq!(
            received[..4],
            [
                "EHLO mx.example",
                format!("MAIL FROM:<alice@example.com> SIZE={}", mail.message.size()).as_str(),
                "RCPT TO:<bob@remote.test>",
                "RCPT TO:<carol@remote.test>",
            ]
        );
        assert!(received.iter().any(|line| line == "..dot"));
        assert_eq!(received.last().map(String::as_str), Some("QUIT"));
    }

    #[tokio::test]
    async fn falls_back_to_helo() {
        let script = Script {
            ehlo: "502 Not implemented\r\n",
            ..Script::default()
        };
        let mail = mail(&["bob"]);
        let (outcome, received) = attempt(&mail, script, false).await;

        assert!(outcome.is_complete());
        assert_eq!(received[1], "HELO mx.example");
        assert_eq!(received[2], "MAIL FROM:<alice@example.com>");
    }

    #[tokio::test]
    async fn partial_delivery() {
        let script = Script {
            rcpt: |local| match local {
                "bob" => "550 No such user\r\n",
                "dave" => "452 Mailbox busy\r\n",
                _ => "250 OK\r\n",
            },
            ..Script::default()
        };
        let mail = mail(&["bob", "carol", "dave"]);
        let (outcome, _) = attempt(&mail, script, true).await;

        assert_eq!(outcome.delivered, addresses(&["carol"]));
        assert_eq!(outcome.rejected, addresses(&["bob"]));
        assert_eq!(outcome.deferred, addresses(&["dave"]));
        assert_eq!(
            outcome.reason.as_deref(),
            Some("RCPT <dave@remote.test> rejected: 452 Mailbox busy")
        );
    }

    #[tokio::test]
    async fn without_sendpartial_one_refusal_fails_all() {
        let script = Script {
            rcpt: |local| match local {
                "bob" => "450 Try later\r\n",
                _ => "250 OK\r\n",
            },
            ..Script::default()
        };
        let mail = mail(&["bob", "carol"]);
        let (outcome, received) = attempt(&mail, script, false).await;

        assert!(outcome.delivered.is_empty());
        assert_eq!(outcome.deferred, mail.recipients);
        assert!(!received.iter().any(|line| line == "DATA"));

        let script = Script {
            rcpt: |local| match local {
                "bob" => "550 No such user\r\n",
                _ => "250 OK\r\n",
            },
            ..Script::default()
        };
        let (outcome, _) = attempt(&mail, script, false).await;
        assert_eq!(outcome.rejected, mail.recipients);
    }

    #[tokio::test]
    async fn message_rejected_after_data() {
        let script = Script {
            message: "554 Spam detected\r\n",
            ..Script::default()
        };
        let mail = mail(&["bob"]);
        let (outcome, _) = attempt(&mail, script, false).await;

        assert_eq!(outcome.rejected, mail.recipients);
        assert_eq!(
            outcome.reason.as_deref(),
            Some("Message rejected: 554 Spam detected")
        );
    }

    #[tokio::test]
    async fn sender_refused_is_an_error() {
        let script = Script {
            mail: "421 Too busy\r\n",
            ..Script::default()
        };
        let mail = mail(&["bob"]);

        let (client, server) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(serve(server, script));
        let mut client = SmtpClient::new(client);

        let err = SmtpTransaction::new(&mail, "mx.example", Duration::from_secs(5), false)
            .run(&mut client)
            .await
            .unwrap_err();
        drop(client);
        server.await.unwrap();

        assert!(err.is_temporary());
        assert_eq!(
            err.to_string(),
            "Temporary failure: MAIL rejected: 421 Too busy"
        );
    }

    #[test]
    fn failed_outcomes() {
        let recipients = addresses(&["bob"]);
        let temporary = DeliveryError::from(ClientError::ConnectionClosed);

        let outcome = Outcome::failed(&recipients, &temporary);
        assert_eq!(outcome.deferred, recipients);
        assert!(outcome.rejected.is_empty());
        assert!(!outcome.is_complete());
    }
}
