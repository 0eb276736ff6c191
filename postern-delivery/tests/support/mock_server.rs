//! A minimal SMTP server that accepts everything and records what it got.
#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Received {
    pub sender: String,
    pub recipients: Vec<String>,
    pub data: Vec<String>,
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Received>>>,
}

impl MockSmtpServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let store = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(Self::handle(stream, Arc::clone(&store)));
            }
        });

        Self { addr, received }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub async fn received(&self) -> Vec<Received> {
        self.received.lock().await.clone()
    }

    async fn handle(stream: TcpStream, store: Arc<Mutex<Vec<Received>>>) {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut current = Received::default();
        let mut in_data = false;

        write.write_all(b"220 mock ready\r\n").await.unwrap();

        while let Ok(Some(line)) = lines.next_line().await {
            if in_data {
                if line == "." {
                    in_data = false;
                    store.lock().await.push(std::mem::take(&mut current));
                    write.write_all(b"250 Queued\r\n").await.unwrap();
                } else {
                    current.data.push(line);
                }
                continue;
            }

            let upper = line.to_ascii_uppercase();
            let reply: &[u8] = if upper.starts_with("EHLO") {
                b"250-mock\r\n250 SIZE 1000000\r\n"
            } else if let Some(sender) = line.get(10..).filter(|_| upper.starts_with("MAIL FROM:")) {
                current.sender = sender.split_whitespace().next().unwrap_or_default().to_string();
                b"250 OK\r\n"
            } else if let Some(recipient) = line.get(8..).filter(|_| upper.starts_with("RCPT TO:")) {
                current.recipients.push(recipient.to_string());
                b"250 OK\r\n"
            } else if upper == "DATA" {
                in_data = true;
                b"354 Go ahead\r\n"
            } else if upper == "QUIT" {
                write.write_all(b"221 Bye\r\n").await.unwrap();
                break;
            } else {
                b"250 OK\r\n"
            };

            write.write_all(reply).await.unwrap();
        }
    }
}
