//! Interface lookup and idempotent address assignment via `ip`.

use std::net::Ipv4Addr;

use px_common::{Error, Result};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// A Linux network interface.
#[derive(Debug, Clone, Eq)]
pub struct Interface {
    /// Kernel interface index.
    pub index: u32,
    /// Interface name.
    pub name: String,
}

impl PartialEq for Interface {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// One entry of `ip -j link show`.
#[derive(Debug, Deserialize)]
struct LinkInfo {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    link_type: String,
}

impl From<LinkInfo> for Interface {
    fn from(link: LinkInfo) -> Self {
        Self {
            index: link.ifindex,
            name: link.ifname,
        }
    }
}

/// One entry of `ip -j route show default`.
#[derive(Debug, Deserialize)]
struct RouteInfo {
    dev: String,
}

async fn run_ip(args: &[&str]) -> Result<String> {
    debug!("ip {}", args.join(" "));
    let output = Command::new("ip").args(args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.contains("File exists") {
            return Err(Error::AlreadyExists(format!("ip {}", args.join(" "))));
        }
        return Err(Error::RuleApplication(format!(
            "ip {} failed: {stderr}",
            args.join(" ")
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Returns the interface with the given name.
pub async fn lookup(name: &str) -> Result<Interface> {
    let out = run_ip(&["-j", "link", "show", "dev", name])
        .await
        .map_err(|e| Error::Lookup(format!("no interface named {name}: {e}")))?;
    let links: Vec<LinkInfo> = serde_json::from_str(&out)
        .map_err(|e| Error::Lookup(format!("unparseable link info for {name}: {e}")))?;
    links
        .into_iter()
        .next()
        .map(Interface::from)
        .ok_or_else(|| Error::Lookup(format!("no interface named {name}")))
}

/// Returns the interface carrying the default IPv4 route.
pub async fn default_route_interface() -> Result<Interface> {
    let out = run_ip(&["-j", "-4", "route", "show", "default"]).await?;
    let dev = default_route_dev(&out)?;
    lookup(&dev).await
}

fn default_route_dev(json: &str) -> Result<String> {
    let routes: Vec<RouteInfo> = serde_json::from_str(json)
        .map_err(|e| Error::Lookup(format!("unparseable default route info: {e}")))?;
    match routes.as_slice() {
        [] => Err(Error::Lookup("no default IPv4 route".into())),
        [route] => Ok(route.dev.clone()),
        _ => Err(Error::Lookup("too many default IPv4 routes".into())),
    }
}

/// Returns the first Ethernet interface found.
pub async fn first_wired_interface() -> Result<Interface> {
    let out = run_ip(&["-j", "link", "show"]).await?;
    let links: Vec<LinkInfo> = serde_json::from_str(&out)
        .map_err(|e| Error::Lookup(format!("unparseable link info: {e}")))?;
    first_wired(links)
}

fn first_wired(links: Vec<LinkInfo>) -> Result<Interface> {
    let mut wired: Vec<LinkInfo> = links
        .into_iter()
        .filter(|l| l.link_type == "ether")
        .collect();
    if wired.is_empty() {
        return Err(Error::Lookup("no ethernet interface found".into()));
    }
    if wired.len() > 1 {
        warn!("{} ethernet interfaces found", wired.len());
        warn!("selecting the first one, that might not be what you want");
    }
    Ok(wired.remove(0).into())
}

/// `ip -j addr show` entries, only as deep as we need them.
#[derive(Debug, Deserialize)]
struct AddrEntry {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    local: Option<String>,
}

fn address_present(json: &str, address: Ipv4Addr) -> Result<bool> {
    let entries: Vec<AddrEntry> = serde_json::from_str(json)
        .map_err(|e| Error::Lookup(format!("unparseable address info: {e}")))?;
    let wanted = address.to_string();
    Ok(entries
        .iter()
        .flat_map(|e| &e.addr_info)
        .any(|info| info.local.as_deref() == Some(wanted.as_str())))
}

/// A scoped address assignment on an interface.
///
/// Assigning an address the interface already carries succeeds without side
/// effect, and the matching release leaves that pre-existing address intact;
/// only an address this scope added is removed again. The interface is
/// brought up on assignment and intentionally left up on release.
#[derive(Debug)]
pub struct AddressScope {
    address: Ipv4Addr,
    prefix_len: u8,
    iface: Interface,
    preexisting: bool,
}

impl AddressScope {
    /// Puts `address/prefix_len` on the interface and brings it up.
    pub async fn assign(address: Ipv4Addr, prefix_len: u8, iface: &Interface) -> Result<Self> {
        let shown = run_ip(&["-j", "addr", "show", "dev", &iface.name]).await?;
        let mut preexisting = address_present(&shown, address)?;
        if preexisting {
            info!("{iface} already has {address}, leaving it in place");
        } else {
            let cidr = format!("{address}/{prefix_len}");
            match run_ip(&["addr", "add", &cidr, "dev", &iface.name]).await {
                Ok(_) => {}
                // Lost the race against another configurator; same outcome.
                Err(Error::AlreadyExists(_)) => {
                    info!("{iface} already has {address}, leaving it in place");
                    preexisting = true;
                }
                Err(e) => return Err(e),
            }
            if !preexisting {
                info!("assigned {cidr} to {iface}");
                run_ip(&["link", "set", &iface.name, "up"]).await?;
            }
        }
        Ok(Self {
            address,
            prefix_len,
            iface: iface.clone(),
            preexisting,
        })
    }

    /// What this scope looks like in teardown reports.
    pub fn describe(&self) -> String {
        format!(
            "address {}/{} on {}",
            self.address, self.prefix_len, self.iface
        )
    }

    /// Removes the address again, unless it was already there before us.
    pub async fn release(self) -> Result<()> {
        if self.preexisting {
            debug!(
                "{} had {} before us, leaving it in place",
                self.iface, self.address
            );
            return Ok(());
        }
        let cidr = format!("{}/{}", self.address, self.prefix_len);
        run_ip(&["addr", "del", &cidr, "dev", &self.iface.name]).await?;
        info!("removed {cidr} from {}", self.iface);
        Ok(())
    }

    #[cfg(test)]
    fn preexisting_for_test(address: Ipv4Addr, prefix_len: u8, iface: &Interface) -> Self {
        Self {
            address,
            prefix_len,
            iface: iface.clone(),
            preexisting: true,
        }
    }
}
