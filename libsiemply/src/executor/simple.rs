use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_util::codec::{BytesCodec, FramedRead};

use super::{Credentials, ExitOutput, Session, Transport, TransportError};
use crate::inventory::HostTarget;
use crate::log::*;

/// Runs commands on the controller itself. Credentials are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

#[async_trait]
impl Transport for LocalTransport {
    async fn open(
        &self,
        target: &HostTarget,
        _username: &str,
        _credentials: &[Credentials],
    ) -> Result<Box<dyn Session>, TransportError> {
        debug!("opening local session for {}", target.address());
        Ok(Box::new(LocalSession { closed: false }))
    }
}

#[derive(Debug)]
pub struct LocalSession {
    closed: bool,
}

#[async_trait]
impl Session for LocalSession {
    #[tracing::instrument(skip(self))]
    async fn exec(&mut self, command: &str) -> Result<ExitOutput, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = FramedRead::new(
            child.stdout.take().ok_or(TransportError::NoExitStatus)?,
            BytesCodec::new(),
        );
        let mut stderr = FramedRead::new(
            child.stderr.take().ok_or(TransportError::NoExitStatus)?,
            BytesCodec::new(),
        );

        let (mut out, mut err) = (vec![], vec![]);
        let (mut out_done, mut err_done) = (false, false);
        while !(out_done && err_done) {
            tokio::select! {
                next = stdout.next(), if !out_done => match next {
                    Some(chunk) => out.extend_from_slice(&chunk?),
                    None => out_done = true,
                },
                next = stderr.next(), if !err_done => match next {
                    Some(chunk) => err.extend_from_slice(&chunk?),
                    None => err_done = true,
                },
            }
        }

        let status = child.wait().await?;
        Ok(ExitOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out).into_owned(),
            stderr: String::from_utf8_lossy(&err).into_owned(),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use color_eyre::eyre::Result;

    use super::*;

    #[tokio::test]
    async fn test_local_session_captures_both_streams() -> Result<()> {
        let mut session = LocalTransport
            .open(&HostTarget::new("localhost"), "", &[])
            .await?;
        let output = session.exec("echo 'hello'; echo oops >&2; exit 3").await?;
        assert_eq!(3, output.exit_code);
        assert_eq!("hello\n", output.stdout);
        assert_eq!("oops\n", output.stderr);

        session.close().await?;
        assert!(session.is_closed());
        assert!(matches!(
            session.exec("true").await,
            Err(TransportError::Closed)
        ));
        Ok(())
    }
}
