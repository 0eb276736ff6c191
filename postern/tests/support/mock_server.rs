//! Destination server for end-to-end tests. Accepts every mail and keeps
//! the raw DATA of each.

use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    task::JoinHandle,
};

#[derive(Debug, Clone, Default)]
pub struct Delivered {
    pub commands: Vec<String>,
    pub content: String,
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    delivered: Arc<Mutex<Vec<Delivered>>>,
    handle: JoinHandle<()>,
}

impl MockSmtpServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let delivered = Arc::new(Mutex::new(Vec::new()));

        let store = Arc::clone(&delivered);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(Self::session(stream, Arc::clone(&store)));
            }
        });

        Self {
            addr,
            delivered,
            handle,
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().await.clone()
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }

    async fn session(stream: TcpStream, store: Arc<Mutex<Vec<Delivered>>>) {
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut current = Delivered::default();
        let mut in_data = false;

        write.write_all(b"220 destination ready\r\n").await.unwrap();

        while let Ok(Some(line)) = lines.next_line().await {
            if in_data {
                if line == "." {
                    in_data = false;
                    store.lock().await.push(std::mem::take(&mut current));
                    write.write_all(b"250 Queued\r\n").await.unwrap();
                } else {
                    current.content.push_str(line.strip_prefix('.').unwrap_or(&line));
                    current.content.push_str("\r\n");
                }
                continue;
            }

            current.commands.push(line.clone());
            let verb = line
                .split([' ', ':'])
                .next()
                .unwrap_or_default()
                .to_ascii_uppercase();

            let reply: &[u8] = match verb.as_str() {
                "EHLO" => b"250-destination\r\n250 8BITMIME\r\n",
                "DATA" => {
                    in_data = true;
                    b"354 Go ahead\r\n"
                }
                "QUIT" => b"221 Bye\r\n",
                _ => b"250 OK\r\n",
            };
            write.write_all(reply).await.unwrap();

            if verb == "QUIT" {
                break;
            }
        }
    }
}
