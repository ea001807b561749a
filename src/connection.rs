//! The mount-wide FTP control connection.
//!
//! One logged-in control connection serves every metadata operation and every
//! read on the mount. It is guarded by a single mutex; whoever holds the
//! guard owns the connection for the duration of their round-trip. At most
//! one download may be attached to it at a time, and only the read window
//! attaches one; everyone else aborts any in-flight download before touching
//! the channel. Write pipelines never use this connection.

use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use log::debug;
use log::info;
use log::warn;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use suppaftp::Mode;
use suppaftp::NativeTlsConnector;
use suppaftp::NativeTlsFtpStream;
use suppaftp::Status;
use suppaftp::native_tls::Certificate;
use suppaftp::native_tls::Identity;
use suppaftp::native_tls::TlsConnector;
use suppaftp::sync_ftp::DataStream;
use suppaftp::types::FileType;

use crate::config::Config;
use crate::config::IpVersion;
use crate::config::TlsMode;
use crate::error::Error;
use crate::error::Result;

/// Concrete control-connection type (TLS-capable, plain until upgraded).
pub(crate) type FtpConn = NativeTlsFtpStream;
/// Concrete data-channel type produced by RETR/STOR/APPE streams.
pub(crate) type FtpData = DataStream<suppaftp::NativeTlsStream>;

/// A download currently attached to the shared connection.
pub(crate) struct Download {
    /// The open RETR data channel, read incrementally by the window.
    pub(crate) stream: FtpData,
    /// Handle that started this download.
    pub(crate) owner: u64,
}

/// Mutable state behind the connection mutex.
pub(crate) struct ConnState {
    /// The control connection. Replaced only by [`SharedConnection::reconnect`].
    pub(crate) ftp: FtpConn,
    /// At most one attached download, owned by the read window.
    pub(crate) download: Option<Download>,
    /// Handle whose read window is currently attached.
    pub(crate) current_fh: Option<u64>,
}

/// The shared connection singleton, created at mount and never replaced.
pub struct SharedConnection {
    state: Mutex<ConnState>,
    config: Arc<Config>,
}

impl SharedConnection {
    /// Connect and log in the control channel.
    pub fn connect(config: Arc<Config>) -> Result<Self> {
        warn_unsupported(&config);
        let ftp = establish(&config)?;
        info!(
            "connected to {}:{} as {}",
            config.host.host, config.host.port, config.user
        );
        Ok(SharedConnection {
            state: Mutex::new(ConnState {
                ftp,
                download: None,
                current_fh: None,
            }),
            config,
        })
    }

    /// Mount configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Acquire the connection for the duration of one operation.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock()
    }

    /// Detach and abort any in-flight download. No-op when none is attached.
    ///
    /// A failed ABOR leaves the control channel desynchronized, so it is
    /// re-established on the spot.
    pub(crate) fn abort_download(&self, state: &mut ConnState) {
        if let Some(download) = state.download.take() {
            debug!("pre-empting download owned by handle {}", download.owner);
            if let Err(err) = state.ftp.abort(download.stream) {
                warn!("ABOR failed ({err}), reconnecting control channel");
                self.reconnect(state);
            }
        }
    }

    /// Replace the control connection after a channel-level failure.
    ///
    /// Returns false when the server is unreachable; the current operation
    /// still fails either way, this only readies the channel for the next.
    pub(crate) fn reconnect(&self, state: &mut ConnState) -> bool {
        state.download = None;
        match establish(&self.config) {
            Ok(ftp) => {
                state.ftp = ftp;
                true
            }
            Err(err) => {
                warn!("control channel reconnect failed: {err}");
                false
            }
        }
    }
}

impl std::fmt::Debug for SharedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnection")
            .field("host", &self.config.host.host)
            .finish_non_exhaustive()
    }
}

/// Resolve the host, honoring the address-family restriction.
fn resolve(config: &Config) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = (config.host.host.as_str(), config.host.port)
        .to_socket_addrs()
        .map_err(Error::io)?
        .filter(|addr| match config.ip_version {
            IpVersion::Any => true,
            IpVersion::V4 => addr.is_ipv4(),
            IpVersion::V6 => addr.is_ipv6(),
        })
        .collect();
    if addrs.is_empty() {
        return Err(Error::io(format!(
            "{} resolves to no usable address",
            config.host.host
        )));
    }
    Ok(addrs)
}

fn connect_control(config: &Config) -> Result<FtpConn> {
    let mut last_err = None;
    for addr in resolve(config)? {
        let attempt = match config.connect_timeout {
            Some(timeout) => FtpConn::connect_timeout(addr, timeout),
            None => FtpConn::connect(addr),
        };
        match attempt {
            Ok(ftp) => return Ok(ftp),
            Err(err) => last_err = Some(err),
        }
    }
    Err(Error::io(last_err.expect("resolve yielded at least one addr")))
}

fn tls_connector(config: &Config) -> Result<NativeTlsConnector> {
    let mut builder = TlsConnector::builder();
    if config.no_verify_peer {
        builder.danger_accept_invalid_certs(true);
    }
    if config.no_verify_hostname {
        builder.danger_accept_invalid_hostnames(true);
    }
    if let Some(cacert) = &config.cacert {
        let pem = std::fs::read(cacert).map_err(Error::io)?;
        builder.add_root_certificate(Certificate::from_pem(&pem).map_err(Error::io)?);
    }
    match (&config.cert, &config.key) {
        (Some(cert), Some(key)) => {
            let cert_pem = std::fs::read(cert).map_err(Error::io)?;
            let key_pem = std::fs::read(key).map_err(Error::io)?;
            builder.identity(Identity::from_pkcs8(&cert_pem, &key_pem).map_err(Error::io)?);
        }
        (Some(cert), None) => {
            let der = std::fs::read(cert).map_err(Error::io)?;
            let pass = config.key_password.as_deref().unwrap_or("");
            builder.identity(Identity::from_pkcs12(&der, pass).map_err(Error::io)?);
        }
        _ => {}
    }
    Ok(builder.build().map_err(Error::io)?.into())
}

fn secure(ftp: FtpConn, config: &Config) -> Result<FtpConn> {
    let connector = tls_connector(config)?;
    ftp.into_secure(connector, &config.host.host)
        .map_err(Error::io)
}

/// Establish one logged-in, binary-mode connection per the mount config.
///
/// Used for the shared control channel and again by every upload thread for
/// its private connection.
pub(crate) fn establish(config: &Config) -> Result<FtpConn> {
    let ftp = connect_control(config)?;
    let mut ftp = match config.tls {
        TlsMode::None => ftp,
        mode => match secure(ftp, config) {
            Ok(secured) => secured,
            Err(err) if mode == TlsMode::Try => {
                warn!("TLS negotiation failed ({err}), continuing unencrypted");
                connect_control(config)?
            }
            Err(err) => return Err(err),
        },
    };
    ftp.login(&config.user, &config.password).map_err(Error::io)?;
    ftp.transfer_type(FileType::Binary).map_err(Error::io)?;
    ftp.set_mode(if config.active {
        Mode::Active
    } else if config.disable_epsv && config.ip_version != IpVersion::V6 {
        Mode::Passive
    } else {
        Mode::ExtendedPassive
    });
    if config.tcp_nodelay {
        let _ = ftp.get_ref().set_nodelay(true);
    }
    if config.utf8 {
        if let Err(err) = ftp.custom_command("OPTS UTF8 ON", &[Status::CommandOk]) {
            debug!("server declined OPTS UTF8 ON: {err}");
        }
    }
    Ok(ftp)
}

/// Report recognized options the client backend cannot express.
fn warn_unsupported(config: &Config) {
    let mut ignored: Vec<&str> = Vec::new();
    if config.proxy.is_some() {
        ignored.push("proxy");
    }
    if config.ftp_port.is_some() {
        ignored.push("ftp_port");
    }
    if config.skip_pasv_ip {
        ignored.push("skip_pasv_ip");
    }
    if config.interface.is_some() {
        ignored.push("interface");
    }
    if config.krb.is_some() {
        ignored.push("krb");
    }
    if config.engine.is_some() {
        ignored.push("engine");
    }
    if config.ssl_version.is_some() {
        ignored.push("ssl_version");
    }
    if config.ciphers.is_some() {
        ignored.push("ciphers");
    }
    if config.capath.is_some() {
        ignored.push("capath");
    }
    if config.list_verb != "LIST -a" {
        ignored.push("ftp_list");
    }
    if config.safe_nobody {
        // Command round-trips here never open a data channel, which is all
        // the flag ever suppressed.
        ignored.push("safe_nobody");
    }
    if !ignored.is_empty() {
        warn!("options accepted but not supported by this client: {ignored:?}");
    }
}
