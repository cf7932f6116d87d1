use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{anyhow, Context};
use igd_next::aio::tokio::search_gateway;
use igd_next::{PortMappingProtocol, SearchOptions};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const GATEWAY_SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Lease slightly above twice the re-validation interval, so one missed refresh does not lose
///  the mapping.
const MAPPING_LEASE_SECS: u32 = 700;

const MAPPING_DESCRIPTION: &str = "peers-udp";

#[derive(Clone, Copy, Debug)]
pub struct UpnpMapping {
    pub external_ip: Ipv4Addr,
    pub external_port: u16,
}

/// A UPnP exchange in flight. Gateway discovery and SOAP calls take seconds; they run in their
///  own task and are polled for completion from the probe's tick, never awaited inline.
pub struct UpnpTask {
    handle: JoinHandle<anyhow::Result<UpnpMapping>>,
}

impl UpnpTask {
    pub fn add_mapping(local_ip: Ipv4Addr, port: u16) -> UpnpTask {
        UpnpTask {
            handle: tokio::spawn(add_mapping(local_ip, port)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Only to be called once [Self::is_finished] returns true.
    pub async fn result(self) -> anyhow::Result<UpnpMapping> {
        self.handle.await
            .context("UPnP task panicked")?
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

async fn add_mapping(local_ip: Ipv4Addr, port: u16) -> anyhow::Result<UpnpMapping> {
    let gateway = search_gateway(SearchOptions {
        timeout: Some(GATEWAY_SEARCH_TIMEOUT),
        ..Default::default()
    }).await
        .context("searching for a UPnP gateway")?;
    debug!("found UPnP gateway at {}", gateway.addr);

    let local = SocketAddr::V4(SocketAddrV4::new(local_ip, port));
    gateway.add_port(PortMappingProtocol::UDP, port, local, MAPPING_LEASE_SECS, MAPPING_DESCRIPTION).await
        .with_context(|| format!("mapping UDP port {} at the gateway", port))?;

    let external_ip = match gateway.get_external_ip().await
        .context("querying the gateway's external address")?
    {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => return Err(anyhow!("gateway reports IPv6 external address {}", ip)),
    };

    info!("UPnP mapping established: {}:{} -> {}", external_ip, port, local);
    Ok(UpnpMapping { external_ip, external_port: port })
}

/// Best effort, fire and forget: a mapping that cannot be removed expires with its lease.
pub fn remove_mapping(port: u16) {
    tokio::spawn(async move {
        let gateway = match search_gateway(SearchOptions {
            timeout: Some(GATEWAY_SEARCH_TIMEOUT),
            ..Default::default()
        }).await {
            Ok(g) => g,
            Err(e) => {
                debug!("gateway search for mapping removal failed: {}", e);
                return;
            }
        };
        match gateway.remove_port(PortMappingProtocol::UDP, port).await {
            Ok(_) => info!("removed UPnP mapping for port {}", port),
            Err(e) => debug!("removing UPnP mapping for port {} failed: {}", port, e),
        }
    });
}
