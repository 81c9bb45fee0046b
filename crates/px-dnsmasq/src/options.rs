//! Declarative dnsmasq options and their command-line rendering.
//!
//! Option names closely match the actual dnsmasq options, except that the
//! dash is replaced by an underscore; the renderer puts the dashes back.

use std::net::Ipv4Addr;
use std::path::PathBuf;

/// A typed option value with one formatting rule per variant.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    /// On/off switch: `true` puts the bare flag on the command line,
    /// `false` removes it entirely.
    Flag(bool),
    /// A single value, rendered as `--switch=value`.
    Value(String),
    /// A tuple of values; dnsmasq expects them joined with commas.
    Tuple(Vec<String>),
    /// A repeatable option: the switch is emitted once per element, each
    /// element formatted by its own rule.
    List(Vec<OptionValue>),
}

impl OptionValue {
    pub fn value(v: impl ToString) -> Self {
        Self::Value(v.to_string())
    }

    pub fn tuple<I, T>(parts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        Self::Tuple(parts.into_iter().map(|p| p.to_string()).collect())
    }

    /// Renders this value under the given switch, ready to pass to dnsmasq.
    pub fn format(&self, switch: &str) -> Vec<String> {
        match self {
            Self::Flag(true) => vec![switch.to_string()],
            Self::Flag(false) => Vec::new(),
            Self::Value(v) => vec![format!("{switch}={v}")],
            Self::Tuple(parts) => vec![format!("{switch}={}", parts.join(","))],
            Self::List(items) => items.iter().flat_map(|i| i.format(switch)).collect(),
        }
    }
}

fn switch_for(name: &str) -> String {
    format!("--{}", name.replace('_', "-"))
}

/// The full option set for one dnsmasq run, serialized once at launch.
///
/// `log_facility` is overridden by the supervisor with its private log file
/// before the process starts; every other field is immutable for the
/// process's lifetime.
#[derive(Debug, Clone)]
pub struct DnsmasqOptions {
    pub interface: String,
    pub tftp_root: PathBuf,
    /// Boot directives; the option may legitimately repeat, once per client
    /// classification.
    pub dhcp_boot: Vec<OptionValue>,
    /// Client pool as (low, high, lease duration).
    pub dhcp_range: (Ipv4Addr, Ipv4Addr, String),
    pub listen_address: Ipv4Addr,
    pub pxe_service: (String, String, String),
    pub keep_in_foreground: bool,
    pub log_facility: PathBuf,
    pub enable_tftp: bool,
    pub no_hosts: bool,
    pub bind_interfaces: bool,
    pub tftp_no_blocksize: bool,
    pub log_dhcp: bool,
    pub dhcp_vendorclass: String,
}

impl DnsmasqOptions {
    pub fn new(
        interface: impl Into<String>,
        tftp_root: impl Into<PathBuf>,
        dhcp_boot: Vec<OptionValue>,
        dhcp_range: (Ipv4Addr, Ipv4Addr, String),
        listen_address: Ipv4Addr,
    ) -> Self {
        Self {
            interface: interface.into(),
            tftp_root: tftp_root.into(),
            dhcp_boot,
            dhcp_range,
            listen_address,
            pxe_service: (
                "x86PC".to_string(),
                "\"Install Linux\"".to_string(),
                "pxelinux".to_string(),
            ),
            keep_in_foreground: true,
            log_facility: PathBuf::from("-"),
            enable_tftp: true,
            no_hosts: true,
            bind_interfaces: true,
            tftp_no_blocksize: true,
            log_dhcp: true,
            dhcp_vendorclass: "set:installer,d-i".to_string(),
        }
    }

    fn entries(&self) -> Vec<(&'static str, OptionValue)> {
        let (low, high, lease) = &self.dhcp_range;
        let (client_arch, menu_text, basename) = &self.pxe_service;
        vec![
            ("interface", OptionValue::value(&self.interface)),
            (
                "tftp_root",
                OptionValue::value(self.tftp_root.display()),
            ),
            ("dhcp_boot", OptionValue::List(self.dhcp_boot.clone())),
            (
                "dhcp_range",
                OptionValue::tuple([low.to_string(), high.to_string(), lease.clone()]),
            ),
            ("listen_address", OptionValue::value(self.listen_address)),
            (
                "pxe_service",
                OptionValue::tuple([client_arch, menu_text, basename]),
            ),
            (
                "keep_in_foreground",
                OptionValue::Flag(self.keep_in_foreground),
            ),
            (
                "log_facility",
                OptionValue::value(self.log_facility.display()),
            ),
            ("enable_tftp", OptionValue::Flag(self.enable_tftp)),
            ("no_hosts", OptionValue::Flag(self.no_hosts)),
            ("bind_interfaces", OptionValue::Flag(self.bind_interfaces)),
            (
                "tftp_no_blocksize",
                OptionValue::Flag(self.tftp_no_blocksize),
            ),
            ("log_dhcp", OptionValue::Flag(self.log_dhcp)),
            (
                "dhcp_vendorclass",
                OptionValue::value(&self.dhcp_vendorclass),
            ),
        ]
    }

    /// The formatted options, ready to pass to dnsmasq.
    pub fn to_args(&self) -> Vec<String> {
        self.entries()
            .iter()
            .flat_map(|(name, value)| value.format(&switch_for(name)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> DnsmasqOptions {
        DnsmasqOptions::new(
            "eth0",
            "/tmp/netboot",
            vec![OptionValue::tuple([
                "tag:!installer",
                "pxelinux.0",
                "pxeserver",
                "10.94.0.1",
            ])],
            (
                "10.94.0.2".parse().unwrap(),
                "10.94.0.22".parse().unwrap(),
                "1h".to_string(),
            ),
            "10.94.0.1".parse().unwrap(),
        )
    }

    #[test]
    fn test_flag_true_yields_bare_switch() {
        assert_eq!(OptionValue::Flag(true).format("--no-hosts"), vec!["--no-hosts"]);
    }

    #[test]
    fn test_flag_false_yields_nothing() {
        assert!(OptionValue::Flag(false).format("--no-hosts").is_empty());
    }

    #[test]
    fn test_scalar_yields_switch_equals_value() {
        assert_eq!(
            OptionValue::value("eth0").format("--interface"),
            vec!["--interface=eth0"]
        );
    }

    #[test]
    fn test_tuple_joins_with_commas() {
        assert_eq!(
            OptionValue::tuple(["a", "b", "c"]).format("--x"),
            vec!["--x=a,b,c"]
        );
    }

    #[test]
    fn test_list_repeats_the_switch_in_input_order() {
        let list = OptionValue::List(vec![
            OptionValue::tuple(["tag:!installer", "pxelinux.0"]),
            OptionValue::tuple(["tag:installer", "http://10.94.0.1:8000/preseed.cfg"]),
        ]);
        assert_eq!(
            list.format("--dhcp-boot"),
            vec![
                "--dhcp-boot=tag:!installer,pxelinux.0",
                "--dhcp-boot=tag:installer,http://10.94.0.1:8000/preseed.cfg",
            ]
        );
    }

    #[test]
    fn test_underscores_render_as_dashes() {
        let args = options().to_args();
        assert!(args.contains(&"--tftp-root=/tmp/netboot".to_string()));
        assert!(args.contains(&"--keep-in-foreground".to_string()));
        assert!(!args.iter().any(|a| a.contains('_') && a.starts_with("--")));
    }

    #[test]
    fn test_scenario_arguments() {
        let args = options().to_args();
        assert!(args.contains(&"--dhcp-range=10.94.0.2,10.94.0.22,1h".to_string()));
        assert!(args.contains(&"--listen-address=10.94.0.1".to_string()));
        assert!(
            args.contains(&"--dhcp-boot=tag:!installer,pxelinux.0,pxeserver,10.94.0.1".to_string())
        );
    }

    #[test]
    fn test_defaults_match_the_wire_contract() {
        let args = options().to_args();
        assert!(args.contains(&"--enable-tftp".to_string()));
        assert!(args.contains(&"--no-hosts".to_string()));
        assert!(args.contains(&"--bind-interfaces".to_string()));
        assert!(args.contains(&"--tftp-no-blocksize".to_string()));
        assert!(args.contains(&"--log-dhcp".to_string()));
        assert!(args.contains(&"--log-facility=-".to_string()));
        assert!(args.contains(&"--dhcp-vendorclass=set:installer,d-i".to_string()));
        assert!(args.contains(&"--pxe-service=x86PC,\"Install Linux\",pxelinux".to_string()));
    }
}
