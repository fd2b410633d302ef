// Copyright (C) 2025 Pyra contributors
// SPDX-License-Identifier: GPL-3.0-or-later
//! Request/reply channel to the OPUS program.
//!
//! OPUS exposes a DDE-style command pipe; on this platform it is reached
//! as a line protocol on a local TCP port. A request is one line; the
//! reply is a newline-separated block terminated by an empty line, whose
//! first token is `OK` on success.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use tracing::debug;

use crate::error::{PyraError, Result};

/// Local port of the OPUS command pipe.
pub const OPUS_PIPE_PORT: u16 = 5111;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

fn spectrometer_error(details: impl Into<String>) -> PyraError {
    PyraError::Spectrometer {
        details: details.into(),
    }
}

/// One conversation with OPUS. The production implementation talks TCP;
/// tests script replies.
pub trait OpusChannel: Send {
    /// Send `command`, return the reply lines (without the terminator).
    fn request(&mut self, command: &str) -> Result<Vec<String>>;
}

/// Factory for (re)opening conversations; `setup` destroys and re-creates
/// the channel once on a failed handshake.
pub type ChannelFactory = Box<dyn Fn() -> Result<Box<dyn OpusChannel>> + Send>;

pub struct TcpOpusChannel {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl TcpOpusChannel {
    pub fn open() -> Result<Box<dyn OpusChannel>> {
        let stream = TcpStream::connect(("127.0.0.1", OPUS_PIPE_PORT))
            .map_err(|e| spectrometer_error(format!("OPUS pipe unreachable: {}", e)))?;
        stream
            .set_read_timeout(Some(IO_TIMEOUT))
            .and_then(|_| stream.set_write_timeout(Some(IO_TIMEOUT)))
            .map_err(|e| spectrometer_error(e.to_string()))?;
        let reader = BufReader::new(
            stream
                .try_clone()
                .map_err(|e| spectrometer_error(e.to_string()))?,
        );
        Ok(Box::new(Self { stream, reader }))
    }
}

impl OpusChannel for TcpOpusChannel {
    fn request(&mut self, command: &str) -> Result<Vec<String>> {
        debug!(command, "OPUS request");
        self.stream
            .write_all(format!("{}\n", command).as_bytes())
            .map_err(|e| spectrometer_error(format!("OPUS pipe write failed: {}", e)))?;
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| spectrometer_error(format!("OPUS pipe read failed: {}", e)))?;
            if read == 0 {
                return Err(spectrometer_error("OPUS pipe closed mid-reply"));
            }
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            if line.is_empty() {
                break;
            }
            lines.push(line);
        }
        Ok(lines)
    }
}

/// Open a conversation and verify it with `COMMAND_SAY hello`; on a bad
/// handshake tear the channel down and try once more.
pub fn setup(factory: &ChannelFactory) -> Result<Box<dyn OpusChannel>> {
    let mut channel = factory()?;
    if handshake(channel.as_mut()).is_ok() {
        return Ok(channel);
    }
    drop(channel);
    let mut channel = factory()?;
    handshake(channel.as_mut())?;
    Ok(channel)
}

fn handshake(channel: &mut dyn OpusChannel) -> Result<()> {
    let reply = channel.request("COMMAND_SAY hello")?;
    if reply == ["OK", "hello"] {
        Ok(())
    } else {
        Err(spectrometer_error(format!(
            "unexpected handshake reply: {:?}",
            reply
        )))
    }
}

/// Send a command and assert the reply starts with `OK`.
pub fn request_ok(channel: &mut dyn OpusChannel, command: &str) -> Result<Vec<String>> {
    let reply = channel.request(command)?;
    match reply.first().map(String::as_str) {
        Some("OK") => Ok(reply),
        _ => Err(spectrometer_error(format!(
            "'{}' failed: {:?}",
            command, reply
        ))),
    }
}

/// Send a command and assert the exact reply.
pub fn request_expect(
    channel: &mut dyn OpusChannel,
    command: &str,
    expected: &[&str],
) -> Result<()> {
    let reply = channel.request(command)?;
    if reply == expected {
        Ok(())
    } else {
        Err(spectrometer_error(format!(
            "'{}' replied {:?}, expected {:?}",
            command, reply, expected
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Channel that pops scripted replies and records requests.
    pub(crate) struct ScriptedChannel {
        pub replies: Arc<Mutex<VecDeque<Result<Vec<String>>>>>,
        pub requests: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedChannel {
        pub fn new(replies: Vec<Vec<&str>>) -> Self {
            Self {
                replies: Arc::new(Mutex::new(
                    replies
                        .into_iter()
                        .map(|lines| Ok(lines.into_iter().map(String::from).collect()))
                        .collect(),
                )),
                requests: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl OpusChannel for ScriptedChannel {
        fn request(&mut self, command: &str) -> Result<Vec<String>> {
            self.requests.lock().unwrap().push(command.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(PyraError::Spectrometer {
                        details: "script exhausted".to_string(),
                    })
                })
        }
    }

    #[test]
    fn test_request_ok() {
        let mut channel = ScriptedChannel::new(vec![vec!["OK", "42"]]);
        let reply = request_ok(&mut channel, "RUN_MACRO x").unwrap();
        assert_eq!(reply, vec!["OK", "42"]);
    }

    #[test]
    fn test_request_ok_rejects_error_reply() {
        let mut channel = ScriptedChannel::new(vec![vec!["ERROR", "no such file"]]);
        let error = request_ok(&mut channel, "LOAD_EXPERIMENT x").unwrap_err();
        assert_eq!(error.subject(), "spectrometer-error");
    }

    #[test]
    fn test_request_expect() {
        let mut channel = ScriptedChannel::new(vec![vec!["OK", "hello"], vec!["OK", "bye"]]);
        request_expect(&mut channel, "COMMAND_SAY hello", &["OK", "hello"]).unwrap();
        assert!(request_expect(&mut channel, "COMMAND_SAY hello", &["OK", "hello"]).is_err());
    }

    #[test]
    fn test_setup_retries_once() {
        // First conversation answers garbage, second one greets properly.
        let attempts = Arc::new(Mutex::new(0usize));
        let attempts_clone = attempts.clone();
        let factory: ChannelFactory = Box::new(move || {
            let mut count = attempts_clone.lock().unwrap();
            *count += 1;
            let reply = if *count == 1 {
                vec![vec!["GARBAGE"]]
            } else {
                vec![vec!["OK", "hello"]]
            };
            Ok(Box::new(ScriptedChannel::new(reply)) as Box<dyn OpusChannel>)
        });
        setup(&factory).unwrap();
        assert_eq!(*attempts.lock().unwrap(), 2);
    }
}
