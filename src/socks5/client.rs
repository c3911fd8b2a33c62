//! Backend-facing SOCKS5 client: greets a backend proxy (optionally with
//! username/password) and asks it to CONNECT to a destination, or hands it a
//! fake-endpoint mapping.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::{command, method, reply, SocksAddr, SocksError, AUTH_VERSION, VERSION};
use crate::endpoint::{AuthenticEndpoint, UnresolvedEndpoint};
use crate::error::{Result, TunnelError};

/// Performs the client side of the handshake on an already-connected (and
/// possibly ciphered) stream. Returns the backend's bound address.
pub async fn connect_through<S>(
    stream: &mut S,
    backend: &AuthenticEndpoint,
    destination: &UnresolvedEndpoint,
) -> Result<SocksAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bound = request(stream, backend, command::CONNECT, destination).await?;
    trace!(backend = %backend, %destination, %bound, "backend accepted CONNECT");
    Ok(bound)
}

/// Asks the backend to remember `real` under its fake host. The backend
/// answers only once the mapping is stored.
pub async fn register_fake<S>(stream: &mut S, backend: &AuthenticEndpoint, real: &UnresolvedEndpoint) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    request(stream, backend, command::REGISTER_FAKE, real).await?;
    trace!(backend = %backend, %real, "backend stored fake endpoint");
    Ok(())
}

async fn request<S>(
    stream: &mut S,
    backend: &AuthenticEndpoint,
    cmd: u8,
    target: &UnresolvedEndpoint,
) -> Result<SocksAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting: &[u8] = if backend.credentials.is_some() {
        &[VERSION, 2, method::NO_AUTH, method::USER_PASS]
    } else {
        &[VERSION, 1, method::NO_AUTH]
    };
    stream.write_all(greeting).await?;
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION {
        return Err(SocksError::InvalidVersion {
            expected: VERSION,
            got: choice[0],
        }
        .into());
    }
    match choice[1] {
        method::NO_AUTH => {}
        method::USER_PASS => authenticate(stream, backend).await?,
        _ => return Err(TunnelError::AuthRejected(backend.to_string())),
    }

    let target = SocksAddr::from(target);
    let mut request = BytesMut::with_capacity(3 + target.serialized_len());
    request.put_slice(&[VERSION, cmd, 0x00]);
    target.write_to(&mut request)?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(SocksError::InvalidVersion {
            expected: VERSION,
            got: head[0],
        }
        .into());
    }
    if head[1] != reply::SUCCEEDED {
        return Err(TunnelError::UpstreamRejected {
            endpoint: backend.to_string(),
            code: head[1],
        });
    }
    SocksAddr::read_from(stream).await
}

async fn authenticate<S>(stream: &mut S, backend: &AuthenticEndpoint) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(creds) = backend.credentials.as_ref() else {
        return Err(TunnelError::protocol(format!(
            "{backend} selected password auth that was not offered"
        )));
    };
    let (user, pass) = (creds.username.as_bytes(), creds.password.as_bytes());
    if user.len() > u8::MAX as usize || pass.len() > u8::MAX as usize {
        return Err(TunnelError::config(format!("credentials for {backend} are too long")));
    }

    let mut msg = BytesMut::with_capacity(3 + user.len() + pass.len());
    msg.put_u8(AUTH_VERSION);
    msg.put_u8(user.len() as u8);
    msg.put_slice(user);
    msg.put_u8(pass.len() as u8);
    msg.put_slice(pass);
    stream.write_all(&msg).await?;
    stream.flush().await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(TunnelError::AuthRejected(backend.to_string()));
    }
    Ok(())
}
