//! RCON command channel: one cached connection per instance with a single
//! transparent reconnect-and-retry on failure.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use mcfleet_common::{FleetError, InstanceRepository};

const RCON_HOST: &str = "127.0.0.1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const TYPE_COMMAND: i32 = 2;
const TYPE_LOGIN: i32 = 3;

/// id + type + body + two NUL terminators; the server caps bodies at 4096.
const MIN_FRAME_BYTES: usize = 10;
const MAX_FRAME_BYTES: usize = 4096 + MIN_FRAME_BYTES;

fn encode_packet(request_id: i32, kind: i32, body: &str) -> Vec<u8> {
    let length = 4 + 4 + body.len() + 2;
    let mut buf = Vec::with_capacity(4 + length);
    buf.extend_from_slice(&(length as i32).to_le_bytes());
    buf.extend_from_slice(&request_id.to_le_bytes());
    buf.extend_from_slice(&kind.to_le_bytes());
    buf.extend_from_slice(body.as_bytes());
    buf.extend_from_slice(&[0, 0]);
    buf
}

fn decode_packet(frame: &[u8]) -> Option<(i32, i32, String)> {
    if frame.len() < MIN_FRAME_BYTES {
        return None;
    }
    let request_id = i32::from_le_bytes(frame[0..4].try_into().ok()?);
    let kind = i32::from_le_bytes(frame[4..8].try_into().ok()?);
    let body = String::from_utf8_lossy(&frame[8..frame.len() - 2]).into_owned();
    Some((request_id, kind, body))
}

struct RconConnection {
    stream: TcpStream,
    next_request_id: i32,
}

impl RconConnection {
    async fn connect(host: &str, port: u16, password: &str) -> Result<Self, FleetError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .map_err(|_| FleetError::Command(format!("connect to {host}:{port} timed out")))?
            .map_err(|e| FleetError::Command(format!("connect to {host}:{port} failed: {e}")))?;
        let mut connection = Self {
            stream,
            next_request_id: 1,
        };
        let (request_id, _, _) = connection.round_trip(TYPE_LOGIN, password).await?;
        if request_id == -1 {
            return Err(FleetError::Command("authentication rejected".into()));
        }
        Ok(connection)
    }

    async fn command(&mut self, command: &str) -> Result<String, FleetError> {
        let (_, _, body) = self.round_trip(TYPE_COMMAND, command).await?;
        Ok(body)
    }

    async fn round_trip(&mut self, kind: i32, body: &str) -> Result<(i32, i32, String), FleetError> {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        self.stream
            .write_all(&encode_packet(request_id, kind, body))
            .await
            .map_err(|e| FleetError::Command(format!("write failed: {e}")))?;
        self.read_packet().await
    }

    async fn read_packet(&mut self) -> Result<(i32, i32, String), FleetError> {
        let mut length_buf = [0u8; 4];
        self.stream
            .read_exact(&mut length_buf)
            .await
            .map_err(|e| FleetError::Command(format!("read failed: {e}")))?;
        let length = i32::from_le_bytes(length_buf) as usize;
        if !(MIN_FRAME_BYTES..=MAX_FRAME_BYTES).contains(&length) {
            return Err(FleetError::Command(format!("invalid frame length {length}")));
        }
        let mut frame = vec![0u8; length];
        self.stream
            .read_exact(&mut frame)
            .await
            .map_err(|e| FleetError::Command(format!("read failed: {e}")))?;
        decode_packet(&frame).ok_or_else(|| FleetError::Command("malformed response frame".into()))
    }

    async fn close_socket(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// At most one live command connection per instance id.
pub struct CommandSessions {
    repository: Arc<dyn InstanceRepository>,
    connections: DashMap<String, Arc<Mutex<RconConnection>>>,
}

impl CommandSessions {
    pub fn new(repository: Arc<dyn InstanceRepository>) -> Self {
        Self {
            repository,
            connections: DashMap::new(),
        }
    }

    /// Send a command over the instance's channel, reconnecting transparently
    /// exactly once on failure.
    pub async fn execute(&self, instance_id: &str, command: &str) -> Result<String, FleetError> {
        match self.try_execute(instance_id, command).await {
            Ok(response) => Ok(response),
            Err(first) => {
                debug!(%instance_id, error = %first, "command failed, retrying on a fresh connection");
                self.close(instance_id);
                match self.try_execute(instance_id, command).await {
                    Ok(response) => Ok(response),
                    Err(retry) => {
                        self.close(instance_id);
                        Err(retry)
                    }
                }
            }
        }
    }

    async fn try_execute(&self, instance_id: &str, command: &str) -> Result<String, FleetError> {
        let connection = self.connection(instance_id).await?;
        let mut guard = connection.lock().await;
        guard.command(command).await
    }

    async fn connection(
        &self,
        instance_id: &str,
    ) -> Result<Arc<Mutex<RconConnection>>, FleetError> {
        if let Some(existing) = self.connections.get(instance_id) {
            return Ok(existing.clone());
        }
        let record = self
            .repository
            .get_by_id(instance_id)
            .await?
            .ok_or(FleetError::NotFound)?;
        let connection =
            RconConnection::connect(RCON_HOST, record.rcon_port, &record.rcon_password).await?;
        let connection = Arc::new(Mutex::new(connection));
        self.connections
            .insert(instance_id.to_string(), connection.clone());
        Ok(connection)
    }

    /// Evict and asynchronously tear down the instance's connection.
    /// Idempotent; shutdown errors are swallowed.
    pub fn close(&self, instance_id: &str) {
        if let Some((_, connection)) = self.connections.remove(instance_id) {
            let instance_id = instance_id.to_string();
            tokio::spawn(async move {
                connection.lock().await.close_socket().await;
                debug!(%instance_id, "command session closed");
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_encode_little_endian_with_nul_terminators() {
        let packet = encode_packet(7, TYPE_COMMAND, "list");
        // length excludes its own four bytes
        assert_eq!(i32::from_le_bytes(packet[0..4].try_into().unwrap()), 14);
        assert_eq!(i32::from_le_bytes(packet[4..8].try_into().unwrap()), 7);
        assert_eq!(i32::from_le_bytes(packet[8..12].try_into().unwrap()), 2);
        assert_eq!(&packet[12..16], b"list");
        assert_eq!(&packet[16..], &[0, 0]);
    }

    #[test]
    fn packets_round_trip() {
        let packet = encode_packet(42, TYPE_LOGIN, "hunter2");
        let (request_id, kind, body) = decode_packet(&packet[4..]).unwrap();
        assert_eq!(request_id, 42);
        assert_eq!(kind, TYPE_LOGIN);
        assert_eq!(body, "hunter2");
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(decode_packet(&[0, 0, 0]).is_none());
        let empty = encode_packet(1, TYPE_COMMAND, "");
        let (_, _, body) = decode_packet(&empty[4..]).unwrap();
        assert_eq!(body, "");
    }
}
