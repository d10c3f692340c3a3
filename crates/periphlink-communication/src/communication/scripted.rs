//! In-memory transport driven by a script
//!
//! Stands in for a serial port wherever real hardware is unavailable: tests,
//! dry runs and fault injection. A [`Script`] is a shared handle; every
//! transport created from it consumes the same queue of reads and records
//! into the same write log, so a reconnecting session sees one continuous
//! device.

use super::{Transport, TransportFactory};
use async_trait::async_trait;
use parking_lot::Mutex;
use periphlink_core::{SerialSettings, TransportError};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// One scripted outcome of a `load_bytes` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedRead {
    /// Bytes become available; a load takes at most what it asked for and
    /// leaves the rest for the next call
    Data(Vec<u8>),
    /// The device stays silent for the whole deadline
    Timeout,
    /// The link reports a fault
    Fault(String),
}

#[derive(Debug, Default)]
struct ScriptState {
    reads: VecDeque<ScriptedRead>,
    writes: Vec<String>,
    replies: Vec<(String, Vec<u8>)>,
    open_failures: usize,
    opens: usize,
    closes: usize,
}

/// Shared script controlling every [`ScriptedTransport`] made from it
#[derive(Debug, Clone, Default)]
pub struct Script {
    state: Arc<Mutex<ScriptState>>,
}

impl Script {
    /// Create an empty script; reads time out until something is queued
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for the device to send
    pub fn push_bytes(&self, bytes: impl AsRef<[u8]>) -> &Self {
        self.push(ScriptedRead::Data(bytes.as_ref().to_vec()))
    }

    /// Queue a silent period lasting one read deadline
    pub fn push_timeout(&self) -> &Self {
        self.push(ScriptedRead::Timeout)
    }

    /// Queue a link fault
    pub fn push_fault(&self, reason: impl Into<String>) -> &Self {
        self.push(ScriptedRead::Fault(reason.into()))
    }

    /// Queue an arbitrary scripted read
    pub fn push(&self, read: ScriptedRead) -> &Self {
        self.state.lock().reads.push_back(read);
        self
    }

    /// Answer every write starting with `prefix` by queueing `reply`
    pub fn reply_to(&self, prefix: impl Into<String>, reply: impl AsRef<[u8]>) -> &Self {
        self.state
            .lock()
            .replies
            .push((prefix.into(), reply.as_ref().to_vec()));
        self
    }

    /// Make the next `count` open attempts fail
    pub fn fail_opens(&self, count: usize) -> &Self {
        self.state.lock().open_failures = count;
        self
    }

    /// Everything written so far, one entry per write call
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Number of successful opens
    pub fn open_count(&self) -> usize {
        self.state.lock().opens
    }

    /// Number of closes of an open transport
    pub fn close_count(&self) -> usize {
        self.state.lock().closes
    }

    /// Scripted reads not yet consumed
    pub fn remaining_reads(&self) -> usize {
        self.state.lock().reads.len()
    }

    /// Create a transport bound to this script
    pub fn transport(&self) -> ScriptedTransport {
        ScriptedTransport {
            state: self.state.clone(),
            open: false,
        }
    }

    /// Factory handing out transports bound to this script
    pub fn factory(&self) -> TransportFactory {
        let script = self.clone();
        Arc::new(move || Box::new(script.transport()) as Box<dyn Transport>)
    }
}

/// Transport replaying a [`Script`]
#[derive(Debug)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
    open: bool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(
        &mut self,
        device_id: &str,
        _settings: &SerialSettings,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(TransportError::OpenFailed {
                device: device_id.to_string(),
                reason: "scripted open failure".to_string(),
            });
        }
        state.opens += 1;
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.state.lock().closes += 1;
        }
    }

    async fn load_bytes(
        &mut self,
        max_count: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }

        let next = {
            let mut state = self.state.lock();
            match state.reads.pop_front() {
                Some(ScriptedRead::Data(mut bytes)) if bytes.len() > max_count => {
                    let rest = bytes.split_off(max_count);
                    state.reads.push_front(ScriptedRead::Data(rest));
                    Some(ScriptedRead::Data(bytes))
                }
                // A zero-length chunk is indistinguishable from silence
                Some(ScriptedRead::Data(bytes)) if bytes.is_empty() => Some(ScriptedRead::Timeout),
                other => other,
            }
        };

        match next {
            Some(ScriptedRead::Data(bytes)) => Ok(bytes),
            Some(ScriptedRead::Fault(reason)) => Err(TransportError::Io { reason }),
            Some(ScriptedRead::Timeout) | None => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::timeout(timeout))
            }
        }
    }

    async fn write_string(&mut self, text: &str, _timeout: Duration) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }

        let mut state = self.state.lock();
        state.writes.push(text.to_string());
        let replies: Vec<Vec<u8>> = state
            .replies
            .iter()
            .filter(|(prefix, _)| text.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone())
            .collect();
        for reply in replies {
            state.reads.push_back(ScriptedRead::Data(reply));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_loads_split_oversized_chunks() {
        let script = Script::new();
        script.push_bytes("abcdef");
        let mut transport = script.transport();
        transport.open("sim", &SerialSettings::default()).await.unwrap();

        assert_eq!(transport.load_bytes(4, WAIT).await.unwrap(), b"abcd");
        assert_eq!(transport.load_bytes(4, WAIT).await.unwrap(), b"ef");
        assert_eq!(
            transport.load_bytes(4, WAIT).await,
            Err(TransportError::Timeout { timeout_ms: 20 })
        );
    }

    #[tokio::test]
    async fn test_replies_follow_writes() {
        let script = Script::new();
        script.reply_to("?", "+01.234\r");
        let mut transport = script.transport();
        transport.open("sim", &SerialSettings::default()).await.unwrap();

        transport.write_string("?", WAIT).await.unwrap();
        assert_eq!(transport.load_bytes(10, WAIT).await.unwrap(), b"+01.234\r");
        assert_eq!(script.writes(), vec!["?".to_string()]);
    }

    #[tokio::test]
    async fn test_open_failures_and_counters() {
        let script = Script::new();
        script.fail_opens(1);
        let mut transport = script.transport();

        assert!(transport.open("sim", &SerialSettings::default()).await.is_err());
        assert!(!transport.is_open());
        transport.open("sim", &SerialSettings::default()).await.unwrap();
        transport.close().await;
        transport.close().await;

        assert_eq!(script.open_count(), 1);
        assert_eq!(script.close_count(), 1);
        assert_eq!(transport.load_bytes(1, WAIT).await, Err(TransportError::NotOpen));
    }

    #[tokio::test]
    async fn test_fault_is_io_error() {
        let script = Script::new();
        script.push_fault("cable unplugged");
        let mut transport = script.transport();
        transport.open("sim", &SerialSettings::default()).await.unwrap();

        assert_eq!(
            transport.load_bytes(8, WAIT).await,
            Err(TransportError::Io {
                reason: "cable unplugged".to_string()
            })
        );
    }
}
