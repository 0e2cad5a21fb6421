//! Scripted IMAP server on a local port for connection tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, Copy)]
pub(crate) struct ServerBehavior {
    /// Advertise IDLE in CAPABILITY.
    pub idle: bool,
    pub select_ok: bool,
    /// Hang up as soon as the client enters IDLE.
    pub drop_on_idle: bool,
    /// Accept connections but never answer.
    pub silent: bool,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            idle: true,
            select_ok: true,
            drop_on_idle: false,
            silent: false,
        }
    }
}

pub(crate) struct FakeServer {
    port: u16,
    accepted: Arc<AtomicU32>,
}

impl FakeServer {
    pub(crate) async fn start(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, behavior));
            }
        });
        Self { port, accepted }
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn accepted(&self) -> u32 {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn serve(stream: TcpStream, behavior: ServerBehavior) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    if behavior.silent {
        while let Ok(Some(_)) = lines.next_line().await {}
        return;
    }
    if writer.write_all(b"* OK fake server ready\r\n").await.is_err() {
        return;
    }
    let mut idle_tag = None;
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().eq_ignore_ascii_case("DONE") {
            let tag = idle_tag.take().unwrap_or_else(|| "*".to_string());
            let reply = format!("{tag} OK IDLE terminated\r\n");
            if writer.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
            continue;
        }
        let mut parts = line.split_whitespace();
        let tag = parts.next().unwrap_or("*").to_string();
        let command = parts.next().unwrap_or_default().to_ascii_uppercase();
        let reply = match command.as_str() {
            "LOGIN" => format!("{tag} OK LOGIN completed\r\n"),
            "CAPABILITY" if behavior.idle => {
                format!("* CAPABILITY IMAP4rev1 IDLE\r\n{tag} OK CAPABILITY completed\r\n")
            }
            "CAPABILITY" => {
                format!("* CAPABILITY IMAP4rev1\r\n{tag} OK CAPABILITY completed\r\n")
            }
            "SELECT" if behavior.select_ok => format!(
                "* FLAGS (\\Seen \\Deleted)\r\n* 3 EXISTS\r\n* 0 RECENT\r\n\
                 * OK [UIDVALIDITY 7] UIDs valid\r\n{tag} OK [READ-WRITE] SELECT completed\r\n"
            ),
            "SELECT" => format!("{tag} NO mailbox unavailable\r\n"),
            "IDLE" if behavior.drop_on_idle => return,
            "IDLE" => {
                idle_tag = Some(tag);
                "+ idling\r\n".to_string()
            }
            "LOGOUT" => {
                let reply = format!("* BYE logging out\r\n{tag} OK LOGOUT completed\r\n");
                let _ = writer.write_all(reply.as_bytes()).await;
                return;
            }
            _ => format!("{tag} BAD unknown command\r\n"),
        };
        if writer.write_all(reply.as_bytes()).await.is_err() {
            return;
        }
    }
}
