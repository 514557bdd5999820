//! Minimal blocking RESP client for driving a real server.

#![allow(dead_code)]

use anyhow::{bail, Result};
use bytes::Bytes;
use pocketkv::protocol::parse_message;
use pocketkv::{RespValue, Server, ServerConfig, StorageEngine};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

pub struct Client {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            pending: Vec::new(),
        })
    }

    pub fn send(&mut self, args: &[&[u8]]) -> Result<()> {
        let request = RespValue::array(
            args.iter()
                .map(|arg| RespValue::bulk_string(Bytes::copy_from_slice(arg)))
                .collect(),
        );
        self.stream.write_all(&request.serialize())?;
        Ok(())
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    pub fn read_reply(&mut self) -> Result<RespValue> {
        loop {
            if let Some((reply, consumed)) = parse_message(&self.pending)? {
                self.pending.drain(..consumed);
                return Ok(reply);
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                bail!("server closed the connection");
            }
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Sends one command and waits for its reply.
    pub fn cmd(&mut self, args: &[&str]) -> Result<RespValue> {
        let args: Vec<&[u8]> = args.iter().map(|arg| arg.as_bytes()).collect();
        self.send(&args)?;
        self.read_reply()
    }

    /// Whether the server has closed its side.
    pub fn is_closed(&mut self) -> Result<bool> {
        let mut byte = [0u8; 1];
        Ok(self.stream.read(&mut byte)? == 0)
    }
}

pub fn start_server() -> Result<(Server, SocketAddr)> {
    let config = ServerConfig::new(0).with_worker_threads(2);
    let mut server = Server::new(Arc::new(StorageEngine::new()), config);
    let addr = server.start()?;
    Ok((server, addr))
}
