use std::io;

use socket2::Socket;
use tracing::{error, warn};

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_device(socket: &Socket, interface: &str) -> io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_device(_socket: &Socket, interface: &str) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, format!("binding to interface {} is not supported on this platform", interface)))
}

#[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
fn reuse_port(socket: &Socket) -> io::Result<()> {
    socket.set_reuse_port(true)
}

#[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos")))))]
fn reuse_port(_socket: &Socket) -> io::Result<()> {
    Ok(())
}

/// Applies the options shared by all transports' sockets. None of them is essential, so
///  failures are logged rather than propagated.
pub(crate) fn apply_common_options(socket: &Socket, protocol_name: &str, interface: Option<&str>) {
    if let Some(interface) = interface {
        if let Err(e) = bind_device(socket, interface) {
            error!("{} failed to bind to interface {}: {}", protocol_name, interface, e);
        }
    }
    if let Err(e) = socket.set_reuse_address(true) {
        warn!("{} failed to set SO_REUSEADDR: {}", protocol_name, e);
    }
    if let Err(e) = reuse_port(socket) {
        warn!("{} failed to set SO_REUSEPORT: {}", protocol_name, e);
    }
}
