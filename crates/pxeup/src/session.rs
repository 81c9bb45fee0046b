//! One PXE install session: ordered acquisition of host resources, the
//! dnsmasq monitoring loop, and guaranteed reverse-order teardown.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ipnet::Ipv4Net;
use px_common::{Error, ReleaseStack, Result};
use px_distro::Distribution;
use px_dnsmasq::supervisor::STOP_TIMEOUT;
use px_dnsmasq::{Dnsmasq, DnsmasqOptions, OptionValue};
use px_httpd::PreseedServer;
use px_net::iface::AddressScope;
use px_net::{Interface, RuleSet, masquerade_rules};
use tracing::{error, info};

/// How long the monitoring loop sleeps between liveness checks.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lease duration handed to clients.
const LEASE_DURATION: &str = "1h";

/// Everything a session needs, fixed before it starts.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The distribution to install.
    pub distribution: Distribution,
    /// The interface that we expect to have clients on.
    pub pxe_iface: Interface,
    /// The network range to serve clients on.
    pub network: Ipv4Net,
    /// Interface with internet, to masquerade on.
    pub masquerade_iface: Option<Interface>,
    /// How many clients can get an address.
    pub dhcp_range_size: u32,
    /// Optional preseed file for the debian installer.
    pub preseed_file: Option<PathBuf>,
    /// Port the preseed file is served on.
    pub preseed_port: u16,
    /// Where netboot archives are cached.
    pub cache_dir: PathBuf,
    /// Cooperative stop flag, set by an external controller or a signal.
    pub stop: Arc<AtomicBool>,
}

impl SessionConfig {
    /// The network must fit the server address plus the contiguous client
    /// pool.
    pub fn validate(&self) -> Result<()> {
        let host_bits = 32 - u32::from(self.network.prefix_len());
        let usable = if host_bits >= 2 {
            (1u64 << host_bits) - 2
        } else {
            0
        };
        let needed = u64::from(self.dhcp_range_size) + 2;
        if usable < needed {
            return Err(Error::Config(format!(
                "network {} has {usable} usable addresses, need {needed} \
                 for the server and {} clients",
                self.network, self.dhcp_range_size
            )));
        }
        Ok(())
    }

    /// The server (our) address, which is the first usable address on the
    /// network.
    pub fn server_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network.network()) + 1)
    }

    /// Lower and upper (inclusive) bounds for the DHCP client range.
    pub fn dhcp_range(&self) -> (Ipv4Addr, Ipv4Addr) {
        let first = u32::from(self.server_address()) + 1;
        (
            Ipv4Addr::from(first),
            Ipv4Addr::from(first + self.dhcp_range_size),
        )
    }
}

/// Runs a full install session and returns dnsmasq's exit code.
///
/// Acquisition order: file root → interface address → masquerade rules →
/// preseed server → dnsmasq. Teardown happens in exactly reverse order on
/// every exit path; teardown failures are reported but never replace a
/// primary failure.
pub async fn run(config: SessionConfig) -> Result<i32> {
    config.validate()?;

    // Becomes the TFTP root served to clients; removed when dropped at the
    // end of the session.
    let tftp_root = config.distribution.unpack(&config.cache_dir).await?;

    let mut stack = ReleaseStack::new();
    let outcome = drive(&config, tftp_root.path(), &mut stack).await;
    let teardown = stack.unwind().await;
    if let Err(td) = &teardown {
        error!("{td}");
    }
    match (outcome, teardown) {
        (Ok(code), Ok(())) => Ok(code),
        (Ok(_), Err(td)) => Err(Error::Teardown(td)),
        (Err(e), _) => Err(e),
    }
}

async fn drive(config: &SessionConfig, tftp_root: &Path, stack: &mut ReleaseStack) -> Result<i32> {
    let address = config.server_address();

    let scope =
        AddressScope::assign(address, config.network.prefix_len(), &config.pxe_iface).await?;
    let resource = scope.describe();
    stack.push(resource, scope.release());

    if let Some(uplink) = &config.masquerade_iface {
        info!("masquerading through {uplink}");
        let rules = RuleSet::apply(masquerade_rules(uplink)).await?;
        stack.push("masquerade rules", rules.release());
    }

    let preseed_url = match &config.preseed_file {
        Some(file) => {
            let server = PreseedServer::serve(file, address, config.preseed_port).await?;
            let url = server.url().to_string();
            stack.push("preseed server", server.shutdown());
            Some(url)
        }
        None => None,
    };

    let options = build_options(config, tftp_root, preseed_url.as_deref());
    let mut dnsmasq = Dnsmasq::new(options)?;

    let monitored: Result<()> = async {
        dnsmasq.start().await?;
        monitor(&mut dnsmasq, &config.stop).await
    }
    .await;
    // The child is reaped and its workdir removed no matter how the loop
    // ended.
    let shutdown = dnsmasq.shutdown().await;
    monitored?;
    shutdown?;

    if let Some(status) = dnsmasq.exit_status() {
        info!("dnsmasq exited with {status}");
    }
    Ok(exit_code(
        dnsmasq.exit_status().and_then(|s| s.code()),
        config.stop.load(Ordering::Relaxed),
    ))
}

/// The dnsmasq option set for this session.
///
/// Ordinary clients get the boot loader; when a preseed file is configured,
/// clients tagged as the running installer are pointed at its URL instead.
fn build_options(
    config: &SessionConfig,
    tftp_root: &Path,
    preseed_url: Option<&str>,
) -> DnsmasqOptions {
    let server = config.server_address();
    let server_str = server.to_string();
    let mut dhcp_boot = vec![OptionValue::tuple([
        "tag:!installer",
        "pxelinux.0",
        "pxeserver",
        server_str.as_str(),
    ])];
    if let Some(url) = preseed_url {
        dhcp_boot.push(OptionValue::tuple(["tag:installer", url]));
    }
    let (low, high) = config.dhcp_range();
    DnsmasqOptions::new(
        config.pxe_iface.name.clone(),
        tftp_root,
        dhcp_boot,
        (low, high, LEASE_DURATION.to_string()),
        server,
    )
}

/// Polls dnsmasq until it exits on its own or the stop flag is raised.
async fn monitor(dnsmasq: &mut Dnsmasq, stop: &AtomicBool) -> Result<()> {
    loop {
        dnsmasq.drain_log()?;
        tokio::time::sleep(POLL_INTERVAL).await;
        if !dnsmasq.running() {
            info!("dnsmasq exited on its own");
            break;
        }
        if stop.load(Ordering::Relaxed) {
            info!("stop requested, shutting dnsmasq down");
            dnsmasq.stop(STOP_TIMEOUT).await?;
            break;
        }
    }
    // Read the last logs.
    dnsmasq.drain_log()?;
    Ok(())
}

fn exit_code(code: Option<i32>, stop_requested: bool) -> i32 {
    match code {
        Some(code) => code,
        // Killed by a signal: our own stop request is a normal conclusion,
        // anything else is not.
        None if stop_requested => 0,
        None => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(network: &str, dhcp_range_size: u32) -> SessionConfig {
        SessionConfig {
            distribution: Distribution {
                name: "debian-12".into(),
                url: "https://example.com/netboot.tar.gz".into(),
            },
            pxe_iface: Interface {
                index: 2,
                name: "eth0".into(),
            },
            network: network.parse().unwrap(),
            masquerade_iface: None,
            dhcp_range_size,
            preseed_file: None,
            preseed_port: 8000,
            cache_dir: PathBuf::from("/tmp/pxeup-cache"),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn test_server_address_is_first_usable_host() {
        assert_eq!(
            config("10.94.0.0/24", 20).server_address(),
            "10.94.0.1".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(
            config("192.168.4.128/26", 10).server_address(),
            "192.168.4.129".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn test_dhcp_range_starts_after_the_server() {
        let (low, high) = config("10.94.0.0/24", 20).dhcp_range();
        assert_eq!(low, "10.94.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(high, "10.94.0.22".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_validate_requires_room_for_server_and_pool() {
        assert!(config("10.94.0.0/24", 20).validate().is_ok());
        assert!(config("10.94.0.0/24", 252).validate().is_ok());
        assert!(config("10.94.0.0/24", 253).validate().is_err());
        assert!(config("10.94.0.0/30", 20).validate().is_err());
        assert!(config("10.94.0.0/16", 20).validate().is_ok());
    }

    #[test]
    fn test_build_options_scenario() {
        let cfg = config("10.94.0.0/24", 20);
        let args = build_options(&cfg, Path::new("/tmp/netboot"), None).to_args();
        assert!(args.contains(&"--dhcp-range=10.94.0.2,10.94.0.22,1h".to_string()));
        assert!(args.contains(&"--listen-address=10.94.0.1".to_string()));
        assert!(args.contains(&"--interface=eth0".to_string()));
        assert!(
            args.contains(&"--dhcp-boot=tag:!installer,pxelinux.0,pxeserver,10.94.0.1".to_string())
        );
        // No preseed file, no installer-tagged directive.
        assert!(!args.iter().any(|a| a.starts_with("--dhcp-boot=tag:installer")));
    }

    #[test]
    fn test_build_options_adds_installer_directive_for_preseed() {
        let cfg = config("10.94.0.0/24", 20);
        let url = "http://10.94.0.1:8000/preseed.cfg";
        let args = build_options(&cfg, Path::new("/tmp/netboot"), Some(url)).to_args();
        let boots: Vec<&String> = args
            .iter()
            .filter(|a| a.starts_with("--dhcp-boot="))
            .collect();
        assert_eq!(boots.len(), 2);
        assert_eq!(
            boots[1],
            &format!("--dhcp-boot=tag:installer,{url}")
        );
    }

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_code(Some(0), false), 0);
        assert_eq!(exit_code(Some(5), true), 5);
        // Terminated by our own stop signal.
        assert_eq!(exit_code(None, true), 0);
        // Killed from outside without a stop request.
        assert_eq!(exit_code(None, false), 1);
    }
}
