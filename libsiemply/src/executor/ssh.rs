use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Credentials, ExitOutput, Session, Transport, TransportError};
use crate::inventory::HostTarget;
use crate::log::*;

/// Opens sessions over SSH with thrussh.
#[derive(Clone)]
pub struct SshTransport {
    config: Arc<thrussh::client::Config>,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            config: Arc::new(thrussh::client::Config::default()),
        }
    }
}

impl fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for SshTransport {
    #[tracing::instrument(skip(self, target, credentials), fields(host = %target.endpoint()))]
    async fn open(
        &self,
        target: &HostTarget,
        username: &str,
        credentials: &[Credentials],
    ) -> Result<Box<dyn Session>, TransportError> {
        if credentials.is_empty() {
            return Err(TransportError::NoCredentials(target.endpoint()));
        }

        debug!("connecting to {}", target.endpoint());
        let mut handle =
            thrussh::client::connect(self.config.clone(), target.endpoint(), SshClient).await?;

        for credential in credentials {
            let authenticated = match credential {
                Credentials::Key(path) => {
                    let keypair = thrussh_keys::load_secret_key(path, None).map_err(|err| {
                        TransportError::Key {
                            path: path.display().to_string(),
                            cause: err.to_string(),
                        }
                    })?;
                    debug!("trying key {}", path.display());
                    handle
                        .authenticate_publickey(username, Arc::new(keypair))
                        .await?
                }
                Credentials::Password(password) => {
                    debug!("trying password authentication");
                    handle
                        .authenticate_password(username, password.as_str())
                        .await?
                }
            };
            if authenticated {
                debug!("successfully authenticated as {}", username);
                return Ok(Box::new(SshSession {
                    endpoint: target.endpoint(),
                    handle: Some(handle),
                }));
            }
        }

        let _ = handle
            .disconnect(thrussh::Disconnect::ByApplication, "", "English")
            .await;
        Err(TransportError::AuthRejected(username.to_string()))
    }
}

pub struct SshSession {
    endpoint: String,
    handle: Option<thrussh::client::Handle<SshClient>>,
}

impl fmt::Debug for SshSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSession")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.handle.is_none())
            .finish()
    }
}

#[async_trait]
impl Session for SshSession {
    async fn exec(&mut self, command: &str) -> Result<ExitOutput, TransportError> {
        let handle = self.handle.as_mut().ok_or(TransportError::Closed)?;
        let mut channel = handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = vec![];
        let mut stderr = vec![];
        let mut exit_code = None;
        while let Some(frame) = channel.wait().await {
            match frame {
                thrussh::ChannelMsg::Data { ref data } => stdout.extend_from_slice(&data[..]),
                thrussh::ChannelMsg::ExtendedData { ref data, ext } => {
                    if ext == 1 {
                        stderr.extend_from_slice(&data[..]);
                    }
                }
                thrussh::ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status as i32);
                }
                thrussh::ChannelMsg::ExitSignal { signal_name, .. } => {
                    warn!("{}: remote process killed by {:?}", self.endpoint, signal_name);
                    exit_code.get_or_insert(-1);
                }
                thrussh::ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(ExitOutput {
            exit_code: exit_code.ok_or(TransportError::NoExitStatus)?,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut handle) = self.handle.take() {
            debug!("disconnecting from {}", self.endpoint);
            handle
                .disconnect(thrussh::Disconnect::ByApplication, "", "English")
                .await?;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_none()
    }
}

pub struct SshClient;

impl thrussh::client::Handler for SshClient {
    type Error = TransportError;
    type FutureUnit =
        futures::future::Ready<Result<(Self, thrussh::client::Session), TransportError>>;
    type FutureBool = futures::future::Ready<Result<(Self, bool), TransportError>>;

    fn finished_bool(self, b: bool) -> Self::FutureBool {
        futures::future::ready(Ok((self, b)))
    }

    fn finished(self, session: thrussh::client::Session) -> Self::FutureUnit {
        futures::future::ready(Ok((self, session)))
    }

    // Host keys are not pinned; every server key is accepted.
    fn check_server_key(
        self,
        _server_public_key: &thrussh_keys::key::PublicKey,
    ) -> Self::FutureBool {
        self.finished_bool(true)
    }
}
