//! In-process FTP server for tests.

use crate::ftp::config::FtpGlobalConfig;
use crate::ftp::context::FtpContext;
use crate::ftp::ctrlcon::ControlConnection;
use crate::ftp::types::FtpConnectionConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

pub const LISTING: &str = "drwxr-xr-x   2 ftp      ftp          4096 Mar  3 09:15 pub\r\n\
-rw-r--r--   1 ftp      ftp        123456 Dec 24  2019 README.txt\r\n";

/// Body sent for every RETR.
pub const FILE_CONTENT: &[u8] = b"hello from the mock server\r\n";

#[derive(Clone, Default)]
pub struct Behavior {
    /// Reply to LIST instead of sending the listing.
    pub list_reply: Option<&'static str>,
    /// Verb that never gets a reply.
    pub silent: Option<&'static str>,
    /// Listing per working directory. Unknown directories list empty.
    /// Without a tree every directory lists [`LISTING`].
    pub tree: Option<HashMap<&'static str, &'static str>>,
    /// Exact command line answered with `550 Failed`.
    pub refuse: Option<&'static str>,
}

pub struct MockServer {
    pub port: u16,
    pub commands: Arc<StdMutex<Vec<String>>>,
    pub uploads: Arc<StdMutex<Vec<(String, Vec<u8>)>>>,
}

impl MockServer {
    pub fn count(&self, verb: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.split(' ').next() == Some(verb))
            .count()
    }

    pub fn saw(&self, line: &str) -> bool {
        self.commands.lock().unwrap().iter().any(|c| c == line)
    }

    /// Position of `line` in the command log.
    pub fn position(&self, line: &str) -> Option<usize> {
        self.commands.lock().unwrap().iter().position(|c| c == line)
    }
}

pub async fn mock_server(behavior: Behavior) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let commands = Arc::new(StdMutex::new(Vec::new()));
    let uploads = Arc::new(StdMutex::new(Vec::new()));
    let (seen, stored) = (Arc::clone(&commands), Arc::clone(&uploads));
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            tokio::spawn(serve_session(
                stream,
                behavior.clone(),
                Arc::clone(&seen),
                Arc::clone(&stored),
            ));
        }
    });
    MockServer {
        port,
        commands,
        uploads,
    }
}

async fn serve_session(
    stream: tokio::net::TcpStream,
    behavior: Behavior,
    seen: Arc<StdMutex<Vec<String>>>,
    stored: Arc<StdMutex<Vec<(String, Vec<u8>)>>>,
) {
    let (rd, mut wr) = stream.into_split();
    let mut lines = BufReader::new(rd).lines();
    let mut cwd = "/".to_string();
    let mut pasv: Option<TcpListener> = None;
    wr.write_all(b"220 mock ready\r\n").await.unwrap();
    while let Ok(Some(line)) = lines.next_line().await {
        seen.lock().unwrap().push(line.clone());
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v.to_string(), a.to_string()),
            None => (line.clone(), String::new()),
        };
        if behavior.silent == Some(verb.as_str()) {
            continue;
        }
        if behavior.refuse == Some(line.as_str()) {
            pasv = None;
            if wr.write_all(b"550 Failed\r\n").await.is_err() {
                break;
            }
            continue;
        }
        let reply = match verb.as_str() {
            "USER" => "331 password please".to_string(),
            "PASS" => "230 logged in".to_string(),
            "SYST" => "215 UNIX Type: L8".to_string(),
            "FEAT" => "211-Features:\r\n UTF8\r\n211 End".to_string(),
            "CWD" => {
                cwd = if arg.starts_with('/') {
                    arg.clone()
                } else {
                    format!("{}/{}", cwd.trim_end_matches('/'), arg)
                };
                "250 ok".to_string()
            }
            "PWD" => format!("257 \"{}\" is current", cwd),
            "PASV" => {
                let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let p = l.local_addr().unwrap().port();
                pasv = Some(l);
                format!("227 Entering Passive Mode (127,0,0,1,{},{})", p >> 8, p & 0xff)
            }
            "LIST" => {
                if let Some(r) = behavior.list_reply {
                    pasv = None;
                    r.to_string()
                } else {
                    let listing = match &behavior.tree {
                        Some(tree) => tree.get(cwd.as_str()).copied().unwrap_or(""),
                        None => LISTING,
                    };
                    wr.write_all(b"150 here it comes\r\n").await.unwrap();
                    if let Some(l) = pasv.take() {
                        let (mut data, _) = l.accept().await.unwrap();
                        data.write_all(listing.as_bytes()).await.unwrap();
                    }
                    "226 done".to_string()
                }
            }
            "RETR" => {
                wr.write_all(b"150 sending\r\n").await.unwrap();
                if let Some(l) = pasv.take() {
                    let (mut data, _) = l.accept().await.unwrap();
                    data.write_all(FILE_CONTENT).await.unwrap();
                }
                "226 done".to_string()
            }
            "STOR" => {
                wr.write_all(b"150 go ahead\r\n").await.unwrap();
                if let Some(l) = pasv.take() {
                    let (mut data, _) = l.accept().await.unwrap();
                    let mut body = Vec::new();
                    data.read_to_end(&mut body).await.unwrap();
                    let path = format!("{}/{}", cwd.trim_end_matches('/'), arg);
                    stored.lock().unwrap().push((path, body));
                }
                "226 stored".to_string()
            }
            "QUIT" => {
                wr.write_all(b"221 bye\r\n").await.unwrap();
                break;
            }
            "DELE" | "RMD" | "SITE" => "250 ok".to_string(),
            "TYPE" | "NOOP" | "OPTS" => "200 ok".to_string(),
            _ => "502 not implemented".to_string(),
        };
        if wr.write_all(format!("{}\r\n", reply).as_bytes()).await.is_err() {
            break;
        }
    }
}

pub fn context(use_cache: bool) -> Arc<FtpContext> {
    let cfg = FtpGlobalConfig {
        use_listings_cache: use_cache,
        ..Default::default()
    };
    FtpContext::new(cfg).unwrap()
}

pub fn connection_config(port: u16) -> FtpConnectionConfig {
    let mut cfg = FtpConnectionConfig::new("127.0.0.1");
    cfg.port = port;
    cfg.user = "bob".into();
    cfg.password = "secret".into();
    cfg.reply_timeout_sec = 2;
    cfg.max_retries = 0;
    cfg.keep_alive.enabled = false;
    cfg
}

pub fn connection(ctx: &Arc<FtpContext>, port: u16) -> ControlConnection {
    ControlConnection::new(Arc::clone(ctx), connection_config(port))
}
