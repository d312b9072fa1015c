//! CIDR arithmetic for NetworkPolicy `ipBlock` peers

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Block {
    addr: u128,
    prefix: u8,
    bits: u8,
}

impl Block {
    fn from_network(net: &IpNetwork) -> Self {
        match net.network() {
            IpAddr::V4(a) => Block {
                addr: u32::from(a) as u128,
                prefix: net.prefix(),
                bits: 32,
            },
            IpAddr::V6(a) => Block {
                addr: u128::from(a),
                prefix: net.prefix(),
                bits: 128,
            },
        }
    }

    fn to_network(self) -> Result<IpNetwork> {
        let ip = if self.bits == 32 {
            IpAddr::V4(Ipv4Addr::from(self.addr as u32))
        } else {
            IpAddr::V6(Ipv6Addr::from(self.addr))
        };
        Ok(IpNetwork::new(ip, self.prefix)?)
    }

    fn mask(&self, prefix: u8) -> u128 {
        if prefix == 0 {
            return 0;
        }
        let all = if self.bits == 128 {
            u128::MAX
        } else {
            (1u128 << self.bits) - 1
        };
        all & !((1u128 << (self.bits - prefix)) - 1)
    }

    fn contains(&self, other: &Block) -> bool {
        self.bits == other.bits
            && self.prefix <= other.prefix
            && (other.addr & self.mask(self.prefix)) == self.addr
    }

    fn halves(&self) -> (Block, Block) {
        let prefix = self.prefix + 1;
        let high = self.addr | (1u128 << (self.bits - prefix));
        (
            Block { prefix, ..*self },
            Block {
                addr: high,
                prefix,
                bits: self.bits,
            },
        )
    }
}

fn subtract(block: Block, excluded: &Block, out: &mut Vec<Block>) {
    if excluded.contains(&block) {
        return;
    }
    if !block.contains(excluded) {
        out.push(block);
        return;
    }
    let (low, high) = block.halves();
    subtract(low, excluded, out);
    subtract(high, excluded, out);
}

/// `cidr` minus every network in `except`, as the smallest list of disjoint
/// CIDRs in address order. Exceptions of the other address family are
/// ignored.
pub fn exclude(cidr: &IpNetwork, except: &[IpNetwork]) -> Result<Vec<IpNetwork>> {
    let mut blocks = vec![Block::from_network(cidr)];
    for ex in except {
        let ex = Block::from_network(ex);
        let mut next = Vec::with_capacity(blocks.len() + ex.prefix as usize);
        for block in blocks {
            subtract(block, &ex, &mut next);
        }
        blocks = next;
    }
    blocks.into_iter().map(Block::to_network).collect()
}

/// Parse an ipBlock and apply its exceptions
pub fn resolve_ip_block(cidr: &str, except: &[String]) -> Result<Vec<IpNetwork>> {
    let base: IpNetwork = cidr.parse()?;
    let except = except
        .iter()
        .map(|e| e.parse::<IpNetwork>())
        .collect::<std::result::Result<Vec<_>, _>>()?;
    exclude(&base, &except)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(nets: Vec<IpNetwork>) -> Vec<String> {
        nets.into_iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_no_exceptions() {
        let nets = resolve_ip_block("10.0.0.0/24", &[]).unwrap();
        assert_eq!(strings(nets), vec!["10.0.0.0/24"]);
    }

    #[test]
    fn test_exclude_upper_half() {
        let nets = resolve_ip_block("10.0.0.0/24", &["10.0.0.128/25".to_string()]).unwrap();
        assert_eq!(strings(nets), vec!["10.0.0.0/25"]);
    }

    #[test]
    fn test_exclude_single_host() {
        let nets = resolve_ip_block("192.168.0.0/30", &["192.168.0.1/32".to_string()]).unwrap();
        assert_eq!(
            strings(nets),
            vec!["192.168.0.0/32", "192.168.0.2/31"]
        );
    }

    #[test]
    fn test_exclusion_covers_exact_remainder() {
        let nets = resolve_ip_block(
            "10.0.0.0/16",
            &["10.0.5.0/24".to_string(), "10.0.200.0/22".to_string()],
        )
        .unwrap();

        let total: u64 = nets.iter().map(|n| 1u64 << (32 - n.prefix())).sum();
        assert_eq!(total, 65536 - 256 - 1024);

        for (i, a) in nets.iter().enumerate() {
            for b in nets.iter().skip(i + 1) {
                assert!(!a.contains(b.network()) && !b.contains(a.network()));
            }
            assert!(!a.contains("10.0.5.10".parse().unwrap()));
            assert!(!a.contains("10.0.201.1".parse().unwrap()));
        }
    }

    #[test]
    fn test_exception_outside_block_is_ignored() {
        let nets = resolve_ip_block("10.0.0.0/24", &["10.1.0.0/16".to_string()]).unwrap();
        assert_eq!(strings(nets), vec!["10.0.0.0/24"]);
    }

    #[test]
    fn test_whole_block_excluded() {
        let nets = resolve_ip_block("10.0.0.0/24", &["10.0.0.0/8".to_string()]).unwrap();
        assert!(nets.is_empty());
    }

    #[test]
    fn test_ipv6() {
        let nets = resolve_ip_block("fd00::/126", &["fd00::3/128".to_string()]).unwrap();
        assert_eq!(strings(nets), vec!["fd00::/127", "fd00::2/128"]);
    }

    #[test]
    fn test_invalid_cidr() {
        assert!(resolve_ip_block("not-a-cidr", &[]).is_err());
    }
}
