//! Spool administration for the running server, behind the control socket.

use std::sync::Arc;

use async_trait::async_trait;
use postern_control::{
    CommandHandler, ControlError, Request, Response, ResponsePayload, SpoolCommand, StoreName,
};
use postern_spool::{
    MailStore, SpoolError,
    admin::{list_spool_items, move_spool_items, remove_spool_items, resend_spool_items},
};

/// Runs admin operations on the server's own stores, so they honour the
/// locks held by its workers and wake them on change.
#[derive(Debug)]
pub struct SpoolControlHandler {
    spool: Arc<dyn MailStore>,
    outgoing: Arc<dyn MailStore>,
    inbox: Option<Arc<dyn MailStore>>,
}

fn spool_error(err: &SpoolError) -> ControlError {
    ControlError::Server(err.to_string())
}

impl SpoolControlHandler {
    pub fn new(
        spool: Arc<dyn MailStore>,
        outgoing: Arc<dyn MailStore>,
        inbox: Option<Arc<dyn MailStore>>,
    ) -> Self {
        Self {
            spool,
            outgoing,
            inbox,
        }
    }

    fn store(&self, name: StoreName) -> Result<&dyn MailStore, ControlError> {
        match name {
            StoreName::Spool => Ok(self.spool.as_ref()),
            StoreName::Outgoing => Ok(self.outgoing.as_ref()),
            StoreName::Inbox => self
                .inbox
                .as_deref()
                .ok_or_else(|| ControlError::Server(String::from("No inbox store is configured"))),
        }
    }
}

#[async_trait]
impl CommandHandler for SpoolControlHandler {
    async fn handle_request(&self, request: Request) -> Result<Response, ControlError> {
        let store = self.store(request.store)?;

        let payload = match request.command {
            SpoolCommand::List(selection) => ResponsePayload::Items(
                list_spool_items(store, &selection.filter()?)
                    .await
                    .map_err(|err| spool_error(&err))?,
            ),
            SpoolCommand::Remove(selection) => ResponsePayload::Report(
                remove_spool_items(store, selection.id, &selection.filter()?)
                    .await
                    .map_err(|err| spool_error(&err))?,
            ),
            SpoolCommand::Resend(selection) => ResponsePayload::Report(
                resend_spool_items(store, selection.id, &selection.filter()?)
                    .await
                    .map_err(|err| spool_error(&err))?,
            ),
            SpoolCommand::Move { to, selection } => {
                if to == request.store {
                    return Err(ControlError::Server(String::from(
                        "Source and destination stores are the same",
                    )));
                }

                ResponsePayload::Report(
                    move_spool_items(store, self.store(to)?, selection.id, &selection.filter()?)
                        .await
                        .map_err(|err| spool_error(&err))?,
                )
            }
        };

        Ok(Response::new(payload))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::UNIX_EPOCH};

    use postern_common::{
        address::MailAddress,
        mail::{Mail, MailId},
        message::MessageSource,
    };
    use postern_control::{
        CommandHandler, ControlError, Request, ResponsePayload, Selection, SpoolCommand, StoreName,
    };
    use postern_spool::{LockOwner, MailStore, MemoryStore};
    use pretty_assertions::assert_eq;

    use super::SpoolControlHandler;

    fn mail(subject: &str) -> Mail {
        Mail::new(
            Some(MailAddress::new("a", "x")),
            vec![MailAddress::new("b", "y")],
            MessageSource::parse(format!("Subject: {subject}\r\n\r\nbody").as_bytes()).unwrap(),
        )
    }

    fn handler() -> (SpoolControlHandler, Arc<MemoryStore>, Arc<MemoryStore>) {
        let spool = Arc::new(MemoryStore::new("spool"));
        let outgoing = Arc::new(MemoryStore::new("outgoing"));
        let handler = SpoolControlHandler::new(spool.clone(), outgoing.clone(), None);
        (handler, spool, outgoing)
    }

    fn report(payload: ResponsePayload) -> (Vec<MailId>, Vec<MailId>) {
        let ResponsePayload::Report(report) = payload else {
            panic!("expected a report, got {payload:?}");
        };
        (report.affected, report.locking_failures)
    }

    #[tokio::test]
    async fn mails_held_by_a_worker_are_skipped() {
        let (handler, _, outgoing) = handler();
        let held = mail("held");
        let free = mail("free");
        outgoing.store(&held).await.unwrap();
        outgoing.store(&free).await.unwrap();
        assert!(outgoing.lock(&held.id, LockOwner::next()));

        let response = handler
            .handle_request(Request::new(
                StoreName::Outgoing,
                SpoolCommand::Remove(Selection::default()),
            ))
            .await
            .unwrap();

        assert_eq!(report(response.payload), (vec![free.id], vec![held.id]));
        assert_eq!(outgoing.list().await.unwrap(), vec![held.id]);
    }

    #[tokio::test]
    async fn resend_wakes_waiting_workers() {
        let (handler, _, outgoing) = handler();
        let queued = mail("later");
        outgoing.store(&queued).await.unwrap();

        let notified = outgoing.signal().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        handler
            .handle_request(Request::new(
                StoreName::Outgoing,
                SpoolCommand::Resend(Selection {
                    id: Some(queued.id),
                    ..Selection::default()
                }),
            ))
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .unwrap();
        let stored = outgoing.retrieve(&queued.id).await.unwrap().unwrap();
        assert_eq!(stored.last_updated, UNIX_EPOCH);
    }

    #[tokio::test]
    async fn move_between_stores() {
        let (handler, spool, outgoing) = handler();
        let invoice = mail("Invoice 7");
        outgoing.store(&invoice).await.unwrap();
        outgoing.store(&mail("hello")).await.unwrap();

        let response = handler
            .handle_request(Request::new(
                StoreName::Outgoing,
                SpoolCommand::Move {
                    to: StoreName::Spool,
                    selection: Selection {
                        header: Some((String::from("Subject"), String::from("^Invoice"))),
                        ..Selection::default()
                    },
                },
            ))
            .await
            .unwrap();

        assert_eq!(report(response.payload).0, vec![invoice.id]);
        assert_eq!(spool.list().await.unwrap(), vec![invoice.id]);
        assert_eq!(outgoing.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unusable_requests_are_refused() {
        let (handler, _, _) = handler();

        let same = handler
            .handle_request(Request::new(
                StoreName::Spool,
                SpoolCommand::Move {
                    to: StoreName::Spool,
                    selection: Selection::default(),
                },
            ))
            .await;
        assert!(matches!(same, Err(ControlError::Server(_))));

        let no_inbox = handler
            .handle_request(Request::new(
                StoreName::Inbox,
                SpoolCommand::List(Selection::default()),
            ))
            .await;
        assert!(matches!(no_inbox, Err(ControlError::Server(_))));
    }
}
