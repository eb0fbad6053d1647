//! The listener loop and its collaboration with the SOCKS5 engine.
//!
//! The SOCKS5 protocol itself is entirely `fast-socks5`'s business; this
//! module only accepts connections, feeds them to the engine, and supplies
//! the one piece the engine cannot: the outbound dial, which is where every
//! connection gets wrapped in the process-wide throttle.

use std::io::{Error as IoError, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use fast_socks5::{
    server::Socks5ServerProtocol, util::target_addr::TargetAddr, ReplyError, Socks5Command,
};
use squeeze_ratelim::{Limiter, LimitedStream};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Listen on `listen` and serve SOCKS5 clients until the listener fails.
///
/// Per-connection errors are logged and discarded; only listener errors
/// propagate, and they are fatal to the process.
pub(crate) async fn run(listen: &str, limiter: Arc<Limiter>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding listener on {listen}"))?;
    info!("listening for SOCKS5 connections on {listen}");

    loop {
        let (socket, peer) = listener
            .accept()
            .await
            .context("accepting an incoming connection")?;
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move {
            match serve_client(socket, limiter).await {
                Ok(()) => debug!("connection from {peer}: done"),
                Err(e) => warn!("connection from {peer}: {e:#}"),
            }
        });
    }
}

/// Run the SOCKS5 handshake for one client and relay the resulting tunnel.
async fn serve_client(socket: TcpStream, limiter: Arc<Limiter>) -> anyhow::Result<()> {
    let (proto, cmd, target) = Socks5ServerProtocol::accept_no_auth(socket)
        .await?
        .read_command()
        .await?;

    match cmd {
        Socks5Command::TCPConnect => {
            let mut outbound = match dial(&limiter, &target).await {
                Ok(stream) => stream,
                Err(e) => {
                    proto.reply_error(&reply_for(&e)).await?;
                    return Err(anyhow::Error::new(e)
                        .context(format!("connecting to {target:?}")));
                }
            };
            let bound = outbound
                .get_ref()
                .local_addr()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
            let mut inner = proto.reply_success(bound).await?;

            debug!("relaying to {target:?}");
            let (up, down) = tokio::io::copy_bidirectional(&mut inner, &mut outbound)
                .await
                .with_context(|| format!("relaying to {target:?}"))?;
            debug!("finished with {target:?}: {up} bytes up, {down} bytes down");
        }
        Socks5Command::TCPBind | Socks5Command::UDPAssociate => {
            proto.reply_error(&ReplyError::CommandNotSupported).await?;
        }
    }
    Ok(())
}

/// Open the outbound connection for a CONNECT request and wrap it in the
/// shared throttle. This is the dialer the SOCKS5 engine delegates to.
async fn dial(
    limiter: &Arc<Limiter>,
    target: &TargetAddr,
) -> Result<LimitedStream<TcpStream>, IoError> {
    let stream = match target {
        TargetAddr::Ip(addr) => TcpStream::connect(addr).await?,
        TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await?,
    };
    Ok(LimitedStream::new(stream, Arc::clone(limiter)))
}

/// Map a dial failure onto the SOCKS reply the client should see.
fn reply_for(e: &IoError) -> ReplyError {
    match e.kind() {
        ErrorKind::ConnectionRefused => ReplyError::ConnectionRefused,
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
            ReplyError::ConnectionNotAllowed
        }
        ErrorKind::NotFound | ErrorKind::NotConnected => ReplyError::HostUnreachable,
        ErrorKind::AddrNotAvailable => ReplyError::AddressTypeNotSupported,
        ErrorKind::TimedOut => ReplyError::TtlExpired,
        _ => ReplyError::GeneralFailure,
    }
}
