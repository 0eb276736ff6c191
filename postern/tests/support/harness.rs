//! A complete postern instance on loopback ports: SMTP listener, spool
//! manager, remote delivery and a control socket, relaying to a
//! [`MockSmtpServer`].

use std::{net::SocketAddr, sync::Arc, time::Duration};

use postern::{Components, Postern};
use postern_common::{Signal, address::MailAddress};
use postern_control::ControlClient;
use postern_delivery::client::SmtpClient;
use postern_spool::MailStore;
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle, time::timeout};

use super::MockSmtpServer;

pub struct TestHarness {
    smtp_addr: SocketAddr,
    mock_server: MockSmtpServer,
    pub spool: Arc<dyn MailStore>,
    pub outgoing: Arc<dyn MailStore>,
    pub inbox: Option<Arc<dyn MailStore>>,
    control: ControlClient,
    shutdown: broadcast::Sender<Signal>,
    tasks: Vec<JoinHandle<()>>,
    _socket_dir: TempDir,
}

impl TestHarness {
    /// Start with `config`, delivering remote mail to a fresh mock server.
    pub async fn start(mut config: Postern) -> Self {
        let mock_server = MockSmtpServer::start().await;
        config.delivery.gateway = vec![mock_server.addr().to_string()];

        let socket_dir = TempDir::new().unwrap();
        let socket = socket_dir.path().join("control.sock");
        config.control_socket = Some(socket.clone());

        let Components {
            smtp,
            manager,
            delivery,
            spool,
            outgoing,
            inbox,
            control,
        } = config.build().await.unwrap();
        let control = control.unwrap();
        let control_listener = control.bind().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let smtp_addr = listener.local_addr().unwrap();
        let (shutdown, _) = broadcast::channel(16);

        let receiver = shutdown.subscribe();
        let mut tasks = vec![
            tokio::spawn(async move {
                smtp.serve(listener, receiver).await.unwrap();
            }),
            tokio::spawn(manager.run(shutdown.subscribe())),
            tokio::spawn(delivery.run(shutdown.subscribe())),
        ];
        let receiver = shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            control.serve(control_listener, receiver).await.unwrap();
        }));

        Self {
            smtp_addr,
            mock_server,
            spool,
            outgoing,
            inbox,
            control: ControlClient::new(socket),
            shutdown,
            tasks,
            _socket_dir: socket_dir,
        }
    }

    pub const fn mock_server(&self) -> &MockSmtpServer {
        &self.mock_server
    }

    pub const fn control(&self) -> &ControlClient {
        &self.control
    }

    /// Submit one message over SMTP, returning the final reply code.
    pub async fn send_email(&self, from: &str, to: &[&str], message: &str) -> u16 {
        let mut client = SmtpClient::connect(&self.smtp_addr.to_string())
            .await
            .unwrap();

        assert_eq!(client.read_response().await.unwrap().code, 220);
        assert_eq!(client.ehlo("client.test").await.unwrap().code, 250);
        assert_eq!(
            client.mail_from(&format!("<{from}>"), None).await.unwrap().code,
            250
        );
        for recipient in to {
            let recipient: MailAddress = recipient.parse().unwrap();
            assert_eq!(client.rcpt_to(&recipient).await.unwrap().code, 250);
        }
        assert_eq!(client.data().await.unwrap().code, 354);

        let code = client.send_message(message.as_bytes()).await.unwrap().code;
        client.quit().await.unwrap();
        code
    }

    /// Poll until `count` mails reached the mock server.
    pub async fn wait_for_deliveries(&self, count: usize, within: Duration) {
        timeout(within, async {
            while self.mock_server.delivered().await.len() < count {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("{count} deliveries did not arrive within {within:?}"));
    }

    /// Stop every component and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(Signal::Shutdown);
        self.mock_server.shutdown();

        timeout(Duration::from_secs(5), async {
            for task in self.tasks {
                task.await.unwrap();
            }
        })
        .await
        .unwrap();
    }
}
