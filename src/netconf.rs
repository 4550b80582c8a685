use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const MAX_BRIDGES: usize = 4;
pub const MAX_INTERFACES: usize = 4;
pub const MAX_DNS: usize = 4;

const MTU_MIN: i32 = 576;
const MTU_MAX: i32 = 9198;

// one --net=<dev> request: a host bridge (or macvlan parent) plus the
// address configuration accumulated by the flags that follow it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bridge {
    pub dev: String,
    // interface name inside the sandbox, eth0..eth3
    pub devsandbox: String,
    pub veth_name: Option<String>,
    pub ip: Option<Ipv4Addr>,
    pub ip_none: bool,
    pub ip6: Option<Ipv6Addr>,
    pub mac: Option<[u8; 6]>,
    pub mtu: Option<i32>,
    pub iprange: Option<(Ipv4Addr, Ipv4Addr)>,
}

impl Bridge {
    fn new(dev: &str, slot: usize) -> Self {
        Bridge {
            dev: dev.to_string(),
            devsandbox: format!("eth{}", slot),
            veth_name: None,
            ip: None,
            ip_none: false,
            ip6: None,
            mac: None,
            mtu: None,
            iprange: None,
        }
    }

    pub fn set_ip(&mut self, value: &str) -> Result<()> {
        if self.ip_none || self.ip.is_some() {
            return Err(Error::config(
                "cannot configure the IP address twice for the same interface",
            ));
        }
        if value == "none" {
            self.ip_none = true;
        } else {
            self.ip = Some(parse_ip4(value)?);
        }
        Ok(())
    }

    pub fn set_ip6(&mut self, value: &str) -> Result<()> {
        if self.ip6.is_some() {
            return Err(Error::config(
                "cannot configure the IP address twice for the same interface",
            ));
        }
        self.ip6 = Some(
            Ipv6Addr::from_str(value).map_err(|_| Error::config("invalid IPv6 address"))?,
        );
        Ok(())
    }

    pub fn set_mac(&mut self, value: &str) -> Result<()> {
        if self.mac.is_some() {
            return Err(Error::config(
                "cannot configure the MAC address twice for the same interface",
            ));
        }
        self.mac = Some(parse_mac(value)?);
        Ok(())
    }

    pub fn set_mtu(&mut self, value: &str) -> Result<()> {
        let mtu = value
            .parse::<i32>()
            .ok()
            .filter(|m| (MTU_MIN..=MTU_MAX).contains(m))
            .ok_or_else(|| Error::config("invalid mtu value"))?;
        self.mtu = Some(mtu);
        Ok(())
    }

    pub fn set_iprange(&mut self, value: &str) -> Result<()> {
        if self.iprange.is_some() {
            return Err(Error::config(
                "cannot configure the IP range twice for the same interface",
            ));
        }
        let (first, second) = value
            .split_once(',')
            .ok_or_else(|| Error::config("invalid IP range"))?;
        let start = parse_ip4(first).map_err(|_| Error::config("invalid IP range"))?;
        let end = parse_ip4(second).map_err(|_| Error::config("invalid IP range"))?;
        if start >= end {
            return Err(Error::config("invalid IP range"));
        }
        self.iprange = Some((start, end));
        Ok(())
    }

    pub fn set_veth_name(&mut self, value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(Error::config("no veth-name configured"));
        }
        self.veth_name = Some(value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInterface {
    pub dev: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    // --net=none
    pub none: bool,
    pub bridges: Vec<Bridge>,
    pub interfaces: Vec<NetInterface>,
    pub dns: Vec<IpAddr>,
    pub default_gw: Option<Ipv4Addr>,
    pub hosts_file: Option<PathBuf>,
    pub netfilter: bool,
    pub netfilter_file: Option<PathBuf>,
    pub netfilter6_file: Option<PathBuf>,
    pub netns: Option<String>,
    pub scan: bool,
}

impl NetworkConfig {
    pub fn set_none(&mut self) {
        self.none = true;
        self.bridges.clear();
        self.interfaces.clear();
    }

    pub fn add_bridge(&mut self, dev: &str) -> Result<&mut Bridge> {
        if dev == "lo" {
            return Err(Error::config("cannot attach to lo device"));
        }
        if self.bridges.len() >= MAX_BRIDGES {
            return Err(Error::config("maximum 4 network devices are allowed"));
        }
        self.none = false;
        let slot = self.bridges.len();
        self.bridges.push(Bridge::new(dev, slot));
        Ok(self.bridges.last_mut().unwrap())
    }

    pub fn add_interface(&mut self, dev: &str) -> Result<()> {
        if dev == "lo" {
            return Err(Error::config("cannot use lo device in --interface command"));
        }
        if self.interfaces.len() >= MAX_INTERFACES {
            return Err(Error::config("maximum 4 interfaces are allowed"));
        }
        self.interfaces.push(NetInterface {
            dev: dev.to_string(),
        });
        Ok(())
    }

    pub fn add_dns(&mut self, value: &str) -> Result<()> {
        let addr = IpAddr::from_str(value)
            .map_err(|_| Error::config("invalid DNS server IPv4 or IPv6 address"))?;
        if self.dns.len() >= MAX_DNS {
            return Err(Error::config("up to 4 DNS servers can be specified"));
        }
        self.dns.push(addr);
        Ok(())
    }

    pub fn set_default_gw(&mut self, value: &str) -> Result<()> {
        self.default_gw = Some(parse_ip4(value)?);
        Ok(())
    }

    // flags like --ip/--mac/--mtu modify the most recent --net device
    pub fn last_bridge_mut(&mut self) -> Result<&mut Bridge> {
        self.bridges
            .last_mut()
            .ok_or_else(|| Error::config("no network device configured"))
    }

    pub fn any_bridge(&self) -> bool {
        !self.bridges.is_empty()
    }

    pub fn any_interface(&self) -> bool {
        !self.interfaces.is_empty()
    }

    // does the child need a fresh network namespace
    pub fn wants_netns(&self) -> bool {
        self.none || self.any_bridge() || self.any_interface()
    }

    // host-side work for the network worker
    pub fn needs_worker(&self) -> bool {
        !self.none
            && (self.any_bridge()
                || self.any_interface()
                || self.netfilter
                || self.netns.is_some())
    }
}

pub fn parse_ip4(value: &str) -> Result<Ipv4Addr> {
    Ipv4Addr::from_str(value).map_err(|_| Error::config("invalid IP address"))
}

pub fn parse_mac(value: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::config("invalid MAC address"));
    }
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return Err(Error::config("invalid MAC address"));
        }
        mac[i] =
            u8::from_str_radix(part, 16).map_err(|_| Error::config("invalid MAC address"))?;
    }
    Ok(mac)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bridge_slots_and_cap() {
        let mut net = NetworkConfig::default();
        for i in 0..4 {
            let br = net.add_bridge(&format!("br{}", i)).unwrap();
            assert_eq!(br.devsandbox, format!("eth{}", i));
        }
        let err = net.add_bridge("br4").unwrap_err();
        assert_eq!(err.to_string(), "maximum 4 network devices are allowed");
    }

    #[test]
    fn none_clears_devices() {
        let mut net = NetworkConfig::default();
        net.add_bridge("br0").unwrap();
        net.add_interface("eth5").unwrap();
        net.set_none();
        assert!(net.none);
        assert!(!net.any_bridge());
        assert!(!net.any_interface());
        assert!(net.wants_netns());
    }

    #[test]
    fn ip_and_ip_none_conflict() {
        let mut net = NetworkConfig::default();
        net.add_bridge("br0").unwrap();
        let br = net.last_bridge_mut().unwrap();
        br.set_ip("10.10.20.5").unwrap();
        assert!(br.set_ip("none").is_err());

        let mut net = NetworkConfig::default();
        net.add_bridge("br0").unwrap();
        let br = net.last_bridge_mut().unwrap();
        br.set_ip("none").unwrap();
        assert!(br.set_ip("10.10.20.5").is_err());
    }

    #[test]
    fn second_mac_is_error() {
        let mut br = Bridge::new("br0", 0);
        br.set_mac("00:11:22:33:44:55").unwrap();
        let err = br.set_mac("00:11:22:33:44:66").unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot configure the MAC address twice for the same interface"
        );
    }

    #[test]
    fn mac_format() {
        assert!(parse_mac("00:11:22:33:44:55").is_ok());
        assert!(parse_mac("00:11:22:33:44").is_err());
        assert!(parse_mac("00:11:22:33:44:zz").is_err());
    }

    #[test]
    fn mtu_bounds() {
        let mut br = Bridge::new("br0", 0);
        assert!(br.set_mtu("1500").is_ok());
        assert!(br.set_mtu("100").is_err());
        assert!(br.set_mtu("10000").is_err());
        assert!(br.set_mtu("plenty").is_err());
    }

    #[test]
    fn iprange_parses_and_orders() {
        let mut br = Bridge::new("br0", 0);
        assert!(br.set_iprange("10.10.20.10").is_err());
        br.set_iprange("10.10.20.10,10.10.20.100").unwrap();
        assert!(br.set_iprange("10.10.20.10,10.10.20.100").is_err());

        let mut br = Bridge::new("br1", 1);
        assert!(br.set_iprange("10.10.20.100,10.10.20.10").is_err());
    }

    #[test]
    fn dns_cap_is_four() {
        let mut net = NetworkConfig::default();
        for addr in ["1.1.1.1", "1.0.0.1", "8.8.8.8", "8.8.4.4"] {
            net.add_dns(addr).unwrap();
        }
        let err = net.add_dns("9.9.9.9").unwrap_err();
        assert_eq!(err.to_string(), "up to 4 DNS servers can be specified");
        assert!(net.add_dns("not-an-ip").is_err());
    }

    #[test]
    fn lo_is_rejected() {
        let mut net = NetworkConfig::default();
        assert!(net.add_bridge("lo").is_err());
        assert!(net.add_interface("lo").is_err());
    }
}
