use std::net::{IpAddr, SocketAddr, TcpListener};

/// Ask the OS for `count` distinct free ports on `ip`. All listeners are held until every port has
/// been assigned, then released so the processes we launch can bind them.
pub(crate) fn allocate(ip: IpAddr, count: usize) -> std::io::Result<Vec<SocketAddr>> {
    let listeners = (0..count)
        .map(|_| TcpListener::bind(SocketAddr::new(ip, 0)))
        .collect::<std::io::Result<Vec<_>>>()?;
    listeners
        .iter()
        .map(TcpListener::local_addr)
        .collect::<std::io::Result<Vec<_>>>()
}
