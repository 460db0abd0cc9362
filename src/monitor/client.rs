//! Unix socket client for the emulator monitor.
//!
//! A reader thread owns the receiving half of the socket. Command replies
//! are handed back to the caller waiting in [`SocketMonitor::execute`];
//! events go to the channel supplied at connect time. The event channel
//! is closed when the socket reaches EOF.

use super::Monitor;
use crate::error::{Error, Result};
use blockjobd_protocol::{
    decode_message, encode_command, Command, DecodeError, ErrorReply, RawEvent, ServerMessage,
    MAX_FRAME_SIZE,
};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Default time to wait for a command reply (30 seconds).
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Socket write timeout (10 seconds).
const WRITE_TIMEOUT_SECS: u64 = 10;

enum Reply {
    Return {
        id: Option<u64>,
        value: serde_json::Value,
    },
    Error {
        id: Option<u64>,
        error: ErrorReply,
    },
}

impl Reply {
    fn id(&self) -> Option<u64> {
        match self {
            Reply::Return { id, .. } | Reply::Error { id, .. } => *id,
        }
    }
}

struct Channel {
    stream: UnixStream,
    replies: Receiver<Reply>,
    next_id: u64,
}

/// Monitor connection over a Unix socket.
pub struct SocketMonitor {
    channel: Mutex<Channel>,
    timeout: Duration,
}

impl SocketMonitor {
    /// Connect, wait for the greeting and negotiate capabilities.
    ///
    /// Events received from then on are sent to `events`.
    pub fn connect(
        socket_path: impl AsRef<Path>,
        timeout: Duration,
        events: Sender<RawEvent>,
    ) -> Result<Self> {
        let path = socket_path.as_ref();
        let stream = UnixStream::connect(path)
            .map_err(|e| Error::monitor(format!("connect to {}: {}", path.display(), e)))?;
        stream
            .set_write_timeout(Some(Duration::from_secs(WRITE_TIMEOUT_SECS)))
            .map_err(|e| Error::monitor(format!("set write timeout: {}", e)))?;

        let mut reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|e| Error::monitor(format!("clone monitor socket: {}", e)))?,
        );

        // The greeting arrives before anything else
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| Error::monitor(format!("set read timeout: {}", e)))?;
        let banner = read_greeting(&mut reader)?;
        tracing::debug!(socket = %path.display(), %banner, "monitor greeting");
        stream
            .set_read_timeout(None)
            .map_err(|e| Error::monitor(format!("clear read timeout: {}", e)))?;

        let (reply_tx, reply_rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("monitor-reader".to_string())
            .spawn(move || read_loop(reader, reply_tx, events))?;

        let monitor = Self {
            channel: Mutex::new(Channel {
                stream,
                replies: reply_rx,
                next_id: 1,
            }),
            timeout,
        };
        monitor.execute(&Command::QmpCapabilities)?;
        tracing::info!(socket = %path.display(), "monitor connected");
        Ok(monitor)
    }
}

impl Drop for SocketMonitor {
    fn drop(&mut self) {
        // Unblocks the reader thread, which then closes the event channel
        let _ = self.channel.lock().stream.shutdown(Shutdown::Both);
    }
}

impl Monitor for SocketMonitor {
    fn execute(&self, cmd: &Command) -> Result<serde_json::Value> {
        let mut channel = self.channel.lock();
        let id = channel.next_id;
        channel.next_id += 1;

        let data = encode_command(cmd, id)
            .map_err(|e| Error::monitor(format!("encode {}: {}", cmd.name(), e)))?;
        channel
            .stream
            .write_all(&data)
            .map_err(|e| Error::monitor(format!("send {}: {}", cmd.name(), e)))?;

        loop {
            let reply = match channel.replies.recv_timeout(self.timeout) {
                Ok(reply) => reply,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(Error::monitor(format!(
                        "timed out waiting for {} reply",
                        cmd.name()
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::monitor("monitor connection closed"))
                }
            };

            // Replies to earlier commands that timed out
            if reply.id().is_some_and(|reply_id| reply_id != id) {
                tracing::debug!(expected = id, got = ?reply.id(), "discarding stale reply");
                continue;
            }

            return match reply {
                Reply::Return { value, .. } => Ok(value),
                Reply::Error { error, .. } => {
                    tracing::debug!(command = cmd.name(), class = %error.class, "command rejected");
                    Err(Error::rejected(cmd.name(), error.desc))
                }
            };
        }
    }
}

fn read_line(reader: &mut impl BufRead, line: &mut Vec<u8>) -> std::io::Result<usize> {
    line.clear();
    // Bound the line so a peer without newlines cannot exhaust memory
    let limit = MAX_FRAME_SIZE as u64 + 1;
    reader.by_ref().take(limit).read_until(b'\n', line)
}

fn read_greeting(reader: &mut impl BufRead) -> Result<serde_json::Value> {
    let mut line = Vec::new();
    loop {
        let n = read_line(reader, &mut line)
            .map_err(|e| Error::monitor(format!("read greeting: {}", e)))?;
        if n == 0 {
            return Err(Error::monitor("connection closed before greeting"));
        }
        match decode_message::<ServerMessage>(&line) {
            Ok(ServerMessage::Greeting { banner }) => return Ok(banner),
            Err(DecodeError::Empty) => continue,
            Ok(other) => {
                return Err(Error::monitor(format!(
                    "expected greeting, got {:?}",
                    other
                )))
            }
            Err(e) => return Err(Error::monitor(format!("decode greeting: {}", e))),
        }
    }
}

fn read_loop(mut reader: impl BufRead, replies: Sender<Reply>, events: Sender<RawEvent>) {
    let mut line = Vec::new();
    loop {
        match read_line(&mut reader, &mut line) {
            Ok(0) => {
                tracing::info!("monitor connection closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "monitor read failed");
                break;
            }
        }

        let msg = match decode_message::<ServerMessage>(&line) {
            Ok(msg) => msg,
            Err(DecodeError::Empty) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring undecodable monitor message");
                continue;
            }
        };

        match msg {
            ServerMessage::Event(event) => {
                if events.send(event).is_err() {
                    tracing::debug!("event receiver dropped");
                    break;
                }
            }
            ServerMessage::Return { value, id } => {
                let _ = replies.send(Reply::Return { id, value });
            }
            ServerMessage::Error { error, id } => {
                let _ = replies.send(Reply::Error { id, error });
            }
            ServerMessage::Greeting { .. } => {
                tracing::debug!("ignoring repeated greeting");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;
    use std::os::unix::net::UnixListener;

    /// Minimal emulator: greets, answers each command from `answer`, and
    /// emits `event` after the second command.
    fn spawn_emulator(
        path: &Path,
        answer: fn(&serde_json::Value) -> serde_json::Value,
        event: serde_json::Value,
    ) -> std::thread::JoinHandle<()> {
        let listener = UnixListener::bind(path).unwrap();
        std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            writer
                .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
                .unwrap();

            let mut count = 0;
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                let cmd: serde_json::Value = serde_json::from_str(&line).unwrap();
                line.clear();
                count += 1;
                if count == 2 {
                    let mut ev = serde_json::to_vec(&event).unwrap();
                    ev.push(b'\n');
                    writer.write_all(&ev).unwrap();
                }
                let mut reply = answer(&cmd);
                reply["id"] = cmd["id"].clone();
                let mut out = serde_json::to_vec(&reply).unwrap();
                out.push(b'\n');
                writer.write_all(&out).unwrap();
            }
        })
    }

    fn answer(cmd: &serde_json::Value) -> serde_json::Value {
        match cmd["execute"].as_str() {
            Some("block-stream") => serde_json::json!({
                "error": {"class": "GenericError", "desc": "Device 'drive-x' not found"}
            }),
            _ => serde_json::json!({"return": {}}),
        }
    }

    #[test]
    fn test_command_reply_and_event_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.sock");
        let event = serde_json::json!({
            "event": "JOB_STATUS_CHANGE",
            "data": {"id": "pull-vda-vda-fmt0", "status": "ready"},
            "timestamp": {"seconds": 1, "microseconds": 0}
        });
        let server = spawn_emulator(&path, answer, event);

        let (tx, rx) = mpsc::channel();
        let monitor = SocketMonitor::connect(&path, Duration::from_secs(5), tx).unwrap();

        let err = monitor
            .execute(&Command::BlockStream(Default::default()))
            .unwrap_err();
        assert!(matches!(err, Error::MonitorRejected { .. }));
        assert!(err.to_string().contains("block-stream"));

        let ev = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(ev.event, "JOB_STATUS_CHANGE");

        monitor.execute(&Command::QueryJobs).unwrap();

        drop(monitor);
        server.join().unwrap();
        // Reader thread closes the event channel at EOF
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_err());
    }

    #[test]
    fn test_connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel();
        let result = SocketMonitor::connect(
            dir.path().join("missing.sock"),
            DEFAULT_COMMAND_TIMEOUT,
            tx,
        );
        assert!(matches!(result, Err(Error::Monitor(_))));
    }
}
