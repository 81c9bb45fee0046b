pub mod logtail;
pub mod options;
pub mod supervisor;

pub use logtail::LogTail;
pub use options::{DnsmasqOptions, OptionValue};
pub use supervisor::{Dnsmasq, ProcessState};
