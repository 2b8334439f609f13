// Copyright 2020 Joyent, Inc.

//! Client side of a persistent connection.
//!
//! Used by tools and tests to talk to the daemon, and by the daemon itself
//! to push accounting updates to registered controllers.

use std::io::{Error, ErrorKind};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

use crate::msg::{FiniMsg, MsgBody, MsgType, PersistInitMsg, ReturnCodeMsg};
use crate::protocol::{decode_message, encode_message, Frame, PersistCodec};
use crate::rc::{rc_str, SLURM_SUCCESS, SLURM_UNEXPECTED_MSG_ERROR};

/// Expect a `PersistRc` reply.
pub fn expect_rc(body: MsgBody) -> Result<ReturnCodeMsg, Error> {
    match body {
        MsgBody::PersistRc(rc) => Ok(rc),
        other => Err(Error::new(
            ErrorKind::InvalidData,
            format!(
                "expected {} got {}: {}",
                MsgType::PersistRc.as_str(),
                other.msg_type().as_str(),
                rc_str(SLURM_UNEXPECTED_MSG_ERROR)
            ),
        )),
    }
}

pub struct PersistClient {
    framed: Framed<TcpStream, PersistCodec>,
    version: u16,
}

impl PersistClient {
    /// Connect and send `init`. On a successful init the client speaks the
    /// version the server answered with.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        init: PersistInitMsg,
    ) -> Result<(PersistClient, ReturnCodeMsg), Error> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = PersistClient {
            framed: Framed::new(stream, PersistCodec::default()),
            version: init.version,
        };
        client.send(&MsgBody::PersistInit(init)).await?;
        let frame = client.next_frame().await?;
        let rc = expect_rc(decode_message(&frame, frame.version)?.body)?;
        if rc.rc == SLURM_SUCCESS {
            client.version = frame.version;
        }
        Ok((client, rc))
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub async fn send(&mut self, body: &MsgBody) -> Result<(), Error> {
        self.framed.send(encode_message(body, self.version)).await
    }

    async fn next_frame(&mut self) -> Result<Frame, Error> {
        match self.framed.next().await {
            Some(frame) => frame,
            None => Err(Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )),
        }
    }

    pub async fn receive(&mut self) -> Result<MsgBody, Error> {
        let frame = self.next_frame().await?;
        Ok(decode_message(&frame, self.version)?.body)
    }

    /// Send `body` and wait for its reply.
    pub async fn call(&mut self, body: &MsgBody) -> Result<MsgBody, Error> {
        self.send(body).await?;
        self.receive().await
    }

    pub async fn call_rc(&mut self, body: &MsgBody) -> Result<ReturnCodeMsg, Error> {
        let reply = self.call(body).await?;
        expect_rc(reply)
    }

    /// End the session, committing or discarding pending writes.
    pub async fn fini(mut self, commit: bool) -> Result<ReturnCodeMsg, Error> {
        self.call_rc(&MsgBody::Fini(FiniMsg {
            close_conn: true,
            commit,
        }))
        .await
    }
}
