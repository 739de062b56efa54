pub mod protocol;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::protocol::{ControlReply, ControlRequest, Envelope};
use crate::fs::ClunkerFs;

/// Socket allocation failures are retried after a minute, up to five
/// attempts; this survives transient resource exhaustion during testing.
const SOCKET_RETRY_LIMIT: u32 = 5;
const SOCKET_RETRY_DELAY: Duration = Duration::from_secs(60);

/// The out-of-band command channel: a loopback TCP listener serving
/// streams of self-describing typed values. Intended to run on a
/// current-thread runtime so every handler, including `clean`'s removal
/// syscalls, executes on the registered control thread.
pub struct ControlServer {
    filesystem: Arc<ClunkerFs>,
    mount_path: PathBuf,
    listener: TcpListener,
}

impl ControlServer {
    pub async fn bind(
        filesystem: Arc<ClunkerFs>,
        mount_path: PathBuf,
        port: u16,
    ) -> std::io::Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let mut attempt = 0;
        let listener = loop {
            match TcpListener::bind(addr).await {
                Ok(listener) => break listener,
                Err(err) => {
                    attempt += 1;
                    if attempt >= SOCKET_RETRY_LIMIT {
                        return Err(err);
                    }
                    warn!(
                        "control bind to {} failed (attempt {}/{}): {}",
                        addr, attempt, SOCKET_RETRY_LIMIT, err
                    );
                    tokio::time::sleep(SOCKET_RETRY_DELAY).await;
                }
            }
        };
        info!("control server listening on {}", listener.local_addr()?);
        Ok(Self {
            filesystem,
            mount_path,
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut failures = 0;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("control server shutting down");
                    break;
                }
                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => {
                        failures = 0;
                        info!("control client connected from {}", peer);
                        let filesystem = Arc::clone(&self.filesystem);
                        let mount_path = self.mount_path.clone();
                        tokio::spawn(async move {
                            if let Err(err) =
                                handle_connection(stream, filesystem, mount_path).await
                            {
                                error!("error handling control client {}: {:#}", peer, err);
                            }
                        });
                    }
                    Err(err) => {
                        failures += 1;
                        if failures >= SOCKET_RETRY_LIMIT {
                            return Err(err.into());
                        }
                        warn!(
                            "control accept failed (attempt {}/{}): {}",
                            failures, SOCKET_RETRY_LIMIT, err
                        );
                        tokio::time::sleep(SOCKET_RETRY_DELAY).await;
                    }
                }
            }
        }
        Ok(())
    }
}

/// One connection: append reads to a growing buffer, peel off complete
/// typed values, reply in receive order. Any parse failure abandons only
/// this connection.
async fn handle_connection(
    stream: TcpStream,
    filesystem: Arc<ClunkerFs>,
    mount_path: PathBuf,
) -> anyhow::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(256);
    loop {
        while let Some(envelope) = protocol::decode(&mut buf)? {
            let reply = dispatch(&envelope, &filesystem, &mount_path);
            writer.write_all(&protocol::encode(&reply)?).await?;
        }
        if reader.read_buf(&mut buf).await? == 0 {
            debug!("control client disconnected");
            return Ok(());
        }
    }
}

fn dispatch(envelope: &Envelope, filesystem: &ClunkerFs, mount_path: &Path) -> ControlReply {
    match protocol::parse_request(envelope) {
        Ok(ControlRequest::Clean) => ControlReply::CleanResult(filesystem.clean(mount_path)),
        Ok(ControlRequest::SetCount(count)) => {
            filesystem.set_count(count);
            ControlReply::SetResult(true)
        }
        Ok(ControlRequest::GetCount) => ControlReply::Count(filesystem.get_count()),
        Err(message) => {
            warn!("control: {}", message);
            ControlReply::Error(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::permissions::Credentials;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn creds() -> Credentials {
        Credentials { uid: 0, gid: 0 }
    }

    async fn start_server(filesystem: Arc<ClunkerFs>, mount_path: PathBuf) -> (SocketAddr, CancellationToken) {
        let server = ControlServer::bind(filesystem, mount_path, 0).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.serve(shutdown.clone()));
        (addr, shutdown)
    }

    async fn read_reply(stream: &mut TcpStream, buf: &mut BytesMut) -> Envelope {
        loop {
            if let Some(envelope) = protocol::decode(buf).unwrap() {
                return envelope;
            }
            let n = stream.read_buf(buf).await.unwrap();
            assert!(n > 0, "server closed connection while awaiting reply");
        }
    }

    #[tokio::test]
    async fn test_count_round_trip() {
        let filesystem = Arc::new(ClunkerFs::new());
        let (addr, shutdown) = start_server(filesystem, PathBuf::from("/nonexistent")).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = BytesMut::new();

        stream
            .write_all(br#"{"type":"set_count","value":17}{"type":"get_count","value":""}"#)
            .await
            .unwrap();

        let reply = read_reply(&mut stream, &mut buf).await;
        assert_eq!(reply.kind.as_deref(), Some("set_result"));
        assert_eq!(reply.value, serde_json::json!(true));

        let reply = read_reply(&mut stream, &mut buf).await;
        assert_eq!(reply.kind.as_deref(), Some("count"));
        assert_eq!(reply.value, serde_json::json!(17));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_clean_resets_filesystem() {
        let filesystem = Arc::new(ClunkerFs::new());
        filesystem.create(&creds(), "/victim", 0o644).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let (addr, shutdown) = start_server(Arc::clone(&filesystem), tmp.path().to_path_buf()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = BytesMut::new();
        stream
            .write_all(br#"{"type":"clean","value":""}"#)
            .await
            .unwrap();

        let reply = read_reply(&mut stream, &mut buf).await;
        assert_eq!(reply.kind.as_deref(), Some("clean_result"));
        assert_eq!(reply.value, serde_json::json!(true));

        assert_eq!(filesystem.getattr("/").unwrap().fileid, crate::fs::ROOT_ID);
        assert!(filesystem.getattr("/victim").is_err());

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_type_keeps_connection_open() {
        let filesystem = Arc::new(ClunkerFs::new());
        let (addr, shutdown) = start_server(filesystem, PathBuf::from("/nonexistent")).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = BytesMut::new();

        stream
            .write_all(br#"{"type":"explode","value":""}{"type":"get_count","value":""}"#)
            .await
            .unwrap();

        let reply = read_reply(&mut stream, &mut buf).await;
        assert_eq!(reply.kind.as_deref(), Some("error"));

        // The connection is still serviceable after the error reply.
        let reply = read_reply(&mut stream, &mut buf).await;
        assert_eq!(reply.kind.as_deref(), Some("count"));
        assert_eq!(reply.value, serde_json::json!(-1));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_control_ops_do_not_consume_budget() {
        let filesystem = Arc::new(ClunkerFs::new());
        filesystem.set_count(2);
        let (addr, shutdown) = start_server(Arc::clone(&filesystem), PathBuf::from("/nonexistent")).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = BytesMut::new();
        for _ in 0..10 {
            stream
                .write_all(br#"{"type":"get_count","value":""}"#)
                .await
                .unwrap();
            let reply = read_reply(&mut stream, &mut buf).await;
            assert_eq!(reply.value, serde_json::json!(2));
        }

        shutdown.cancel();
    }
}
