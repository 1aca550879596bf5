//! SSDP discovery of DIAL-capable devices on the local network.

use crate::model::DiscoveredDevice;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::Instant;

const UPNP_DEVICE_NS: &str = "urn:schemas-upnp-org:device-1-0";

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    pub multicast_addr: SocketAddr,
    pub search_target: String,
    /// Replies are collected for this long, however many arrive.
    pub window: Duration,
    /// Port appended to each responder's IP to form the device address.
    pub device_port: u16,
    pub fetch_timeout: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            multicast_addr: SocketAddr::from(([239, 255, 255, 250], 1900)),
            search_target: "urn:dial-multiscreen-org:service:dial:1".to_string(),
            window: Duration::from_secs(5),
            device_port: 5555,
            fetch_timeout: Duration::from_secs(3),
        }
    }
}

pub fn search_request(options: &DiscoveryOptions) -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: 3\r\n\
         ST: {}\r\n\r\n",
        options.multicast_addr, options.search_target
    )
}

/// Value of the `LOCATION` header of an SSDP reply.
pub fn parse_location(response: &str) -> Option<String> {
    response.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("location") {
            return None;
        }
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// `device/friendlyName` of a UPnP device description.
pub fn parse_friendly_name(xml: &str) -> Option<String> {
    let doc = roxmltree::Document::parse(xml).ok()?;
    let device = doc
        .root_element()
        .children()
        .find(|node| node.has_tag_name((UPNP_DEVICE_NS, "device")))?;
    device
        .children()
        .find(|node| node.has_tag_name((UPNP_DEVICE_NS, "friendlyName")))?
        .text()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Responder {
    ip: IpAddr,
    location: String,
}

async fn collect_responders(options: &DiscoveryOptions) -> Result<Vec<Responder>, DiscoveryError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket
        .send_to(search_request(options).as_bytes(), options.multicast_addr)
        .await?;

    let deadline = Instant::now() + options.window;
    let mut seen = HashSet::new();
    let mut responders = Vec::new();
    let mut buf = [0u8; 2048];
    loop {
        let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => break,
            Ok(Ok(received)) => received,
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "ssdp receive failed");
                continue;
            }
        };
        let reply = String::from_utf8_lossy(&buf[..len]);
        let Some(location) = parse_location(&reply) else {
            tracing::debug!(from = %from, "ssdp reply without location");
            continue;
        };
        let responder = Responder {
            ip: from.ip(),
            location,
        };
        if seen.insert(responder.clone()) {
            responders.push(responder);
        }
    }
    Ok(responders)
}

async fn fetch_friendly_name(client: reqwest::Client, location: String) -> Option<String> {
    let response = match client.get(&location).send().await {
        Ok(response) => response,
        Err(err) => {
            tracing::debug!(location = %location, error = %err, "device description fetch failed");
            return None;
        }
    };
    if !response.status().is_success() {
        tracing::debug!(location = %location, status = %response.status(), "device description unavailable");
        return None;
    }
    match response.text().await {
        Ok(body) => parse_friendly_name(&body),
        Err(err) => {
            tracing::debug!(location = %location, error = %err, "device description read failed");
            None
        }
    }
}

/// Runs one discovery round.
///
/// Responders whose description cannot be fetched or carries no friendly name
/// are left out. A device advertising several descriptions is listed once,
/// at its first named reply. The result keeps the order in which replies
/// arrived.
pub async fn probe(options: &DiscoveryOptions) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
    let responders = collect_responders(options).await?;
    tracing::info!(responders = responders.len(), "ssdp collection finished");
    if responders.is_empty() {
        return Ok(Vec::new());
    }

    let client = reqwest::Client::builder()
        .timeout(options.fetch_timeout)
        .no_proxy()
        .build()?;

    let mut fetches = JoinSet::new();
    for (index, responder) in responders.iter().enumerate() {
        let client = client.clone();
        let location = responder.location.clone();
        fetches.spawn(async move { (index, fetch_friendly_name(client, location).await) });
    }

    let mut names: Vec<Option<String>> = vec![None; responders.len()];
    while let Some(joined) = fetches.join_next().await {
        match joined {
            Ok((index, name)) => names[index] = name,
            Err(err) => tracing::warn!(error = %err, "description fetch task failed"),
        }
    }

    let mut addresses = HashSet::new();
    let devices = responders
        .into_iter()
        .zip(names)
        .filter_map(|(responder, name)| {
            let name = name?;
            let address = format!("{}:{}", responder.ip, options.device_port);
            addresses.insert(address.clone()).then(|| DiscoveredDevice {
                address,
                friendly_name: Some(name),
            })
        })
        .collect();
    Ok(devices)
}
