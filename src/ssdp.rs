use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::{net::UdpSocket, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::state::AppState;
use crate::upnp::{DEVICE_MEDIA_SERVER, SERVICE_CONNECTION_MANAGER, SERVICE_CONTENT_DIRECTORY};

const SSDP_ADDR: &str = "239.255.255.250:1900";
const SSDP_PORT: u16 = 1900;
const SERVER_IDENT: &str = concat!("Linux UPnP/1.0 tonika/", env!("CARGO_PKG_VERSION"));

/// Determines the local IP address used in announced URLs: the source
/// address of an outbound UDP socket, loopback as fallback.
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// The notification targets of the server: root device, device UUID,
/// device type and both service types.
fn notification_targets(udn: &str) -> Vec<(String, String)> {
    let uuid = format!("uuid:{udn}");
    vec![
        ("upnp:rootdevice".to_string(), format!("{uuid}::upnp:rootdevice")),
        (uuid.clone(), uuid.clone()),
        (
            DEVICE_MEDIA_SERVER.to_string(),
            format!("{uuid}::{DEVICE_MEDIA_SERVER}"),
        ),
        (
            SERVICE_CONTENT_DIRECTORY.to_string(),
            format!("{uuid}::{SERVICE_CONTENT_DIRECTORY}"),
        ),
        (
            SERVICE_CONNECTION_MANAGER.to_string(),
            format!("{uuid}::{SERVICE_CONNECTION_MANAGER}"),
        ),
    ]
}

fn location(cfg: &Config, host: IpAddr) -> String {
    format!("http://{}:{}/description.xml", host, cfg.upnp.port)
}

/// Starts the SSDP service: a responder for M-SEARCH requests and a
/// periodic alive announcer.
pub fn run_ssdp_service(state: AppState, cancel: CancellationToken) -> Result<()> {
    let responder_state = state.clone();
    let responder_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            res = ssdp_search_responder(responder_state) => {
                if let Err(e) = res {
                    error!("SSDP search responder failed: {e}");
                }
            }
            _ = responder_cancel.cancelled() => {}
        }
    });

    tokio::spawn(async move {
        let period = Duration::from_secs(u64::from(state.config.upnp.max_age) / 2);
        let mut ticker = interval(period.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = send_alive(&state.config, state.host).await {
                        warn!("failed to send SSDP alive: {e}");
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    });

    info!("SSDP service started");
    Ok(())
}

async fn ssdp_search_responder(state: AppState) -> Result<()> {
    let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], SSDP_PORT))).await?;
    let multicast_addr = "239.255.255.250".parse()?;
    let local_addr = "0.0.0.0".parse()?;
    socket.join_multicast_v4(multicast_addr, local_addr)?;

    let mut buf = vec![0u8; 2048];
    loop {
        let (len, addr) = socket.recv_from(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..len]);

        if !request.contains("M-SEARCH") || !request.contains("ssdp:discover") {
            continue;
        }
        let all = request.contains("ssdp:all");
        for (target, usn) in notification_targets(&state.config.upnp.udn) {
            if all || request.contains(target.as_str()) {
                debug!("answering M-SEARCH for '{target}' from {addr}");
                let response = search_response(&state.config, state.host, &target, &usn);
                socket.send_to(response.as_bytes(), addr).await?;
            }
        }
    }
}

fn search_response(cfg: &Config, host: IpAddr, st: &str, usn: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\n\
        CACHE-CONTROL: max-age={}\r\n\
        EXT:\r\n\
        LOCATION: {}\r\n\
        SERVER: {SERVER_IDENT}\r\n\
        ST: {st}\r\n\
        USN: {usn}\r\n\r\n",
        cfg.upnp.max_age,
        location(cfg, host),
    )
}

/// Multicasts ssdp:alive notifications for all targets.
pub async fn send_alive(cfg: &Config, host: IpAddr) -> Result<()> {
    debug!("sending SSDP alive notifications");
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    for (nt, usn) in notification_targets(&cfg.upnp.udn) {
        let message = format!(
            "NOTIFY * HTTP/1.1\r\n\
            HOST: {SSDP_ADDR}\r\n\
            CACHE-CONTROL: max-age={}\r\n\
            LOCATION: {}\r\n\
            NT: {nt}\r\n\
            NTS: ssdp:alive\r\n\
            SERVER: {SERVER_IDENT}\r\n\
            USN: {usn}\r\n\r\n",
            cfg.upnp.max_age,
            location(cfg, host),
        );
        socket.send_to(message.as_bytes(), SSDP_ADDR).await?;
    }
    Ok(())
}

/// Multicasts ssdp:byebye notifications for all targets; sent on shutdown
/// and as the first step of the service-reset procedure.
pub async fn send_byebye(cfg: &Config) -> Result<()> {
    debug!("sending SSDP byebye notifications");
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    for (nt, usn) in notification_targets(&cfg.upnp.udn) {
        let message = format!(
            "NOTIFY * HTTP/1.1\r\n\
            HOST: {SSDP_ADDR}\r\n\
            NT: {nt}\r\n\
            NTS: ssdp:byebye\r\n\
            USN: {usn}\r\n\r\n"
        );
        socket.send_to(message.as_bytes(), SSDP_ADDR).await?;
    }
    Ok(())
}
