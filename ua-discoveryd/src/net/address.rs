use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use super::RangeError;

/// Inclusive range of IP addresses of a single family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    start: IpAddr,
    end: IpAddr,
}

impl AddressRange {
    pub fn new(start: IpAddr, end: IpAddr) -> Result<Self, RangeError> {
        if start.is_ipv4() != end.is_ipv4() {
            return Err(RangeError::MixedFamilies(format!("{}-{}", start, end)));
        }
        if start > end {
            return Err(RangeError::Reversed(format!("{}-{}", start, end)));
        }
        Ok(Self { start, end })
    }

    pub fn single(address: IpAddr) -> Self {
        Self { start: address, end: address }
    }

    /// Range covering a CIDR block, network and broadcast addresses included
    pub fn from_prefix(address: IpAddr, prefix: u8) -> Result<Self, RangeError> {
        match address {
            IpAddr::V4(v4) => {
                if prefix > 32 {
                    return Err(RangeError::InvalidAddress(format!("{}/{}", address, prefix)));
                }
                let mask = v4_mask(prefix);
                let base = u32::from(v4) & mask;
                Ok(Self {
                    start: IpAddr::V4(Ipv4Addr::from(base)),
                    end: IpAddr::V4(Ipv4Addr::from(base | !mask)),
                })
            }
            IpAddr::V6(v6) => {
                if prefix > 128 {
                    return Err(RangeError::InvalidAddress(format!("{}/{}", address, prefix)));
                }
                let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix as u32) };
                let base = u128::from(v6) & mask;
                Ok(Self {
                    start: IpAddr::V6(Ipv6Addr::from(base)),
                    end: IpAddr::V6(Ipv6Addr::from(base | !mask)),
                })
            }
        }
    }

    /// Host addresses of the subnet an interface is attached to. Network and
    /// broadcast addresses are excluded for subnets larger than /31. When
    /// `max_prefix` is given, the subnet is narrowed to that prefix around
    /// the interface address.
    pub fn from_subnet(address: Ipv4Addr, netmask: Ipv4Addr, max_prefix: Option<u8>) -> Self {
        let mut prefix = u32::from(netmask).leading_ones() as u8;
        if let Some(max_prefix) = max_prefix {
            prefix = prefix.max(max_prefix.min(32));
        }
        let mask = v4_mask(prefix);
        let network = u32::from(address) & mask;
        let broadcast = network | !mask;
        let (start, end) = if prefix >= 31 {
            (network, broadcast)
        } else {
            (network + 1, broadcast - 1)
        };
        Self {
            start: IpAddr::V4(Ipv4Addr::from(start)),
            end: IpAddr::V4(Ipv4Addr::from(end)),
        }
    }

    pub fn start(&self) -> IpAddr {
        self.start
    }

    pub fn end(&self) -> IpAddr {
        self.end
    }

    /// Number of addresses in the range
    pub fn len(&self) -> u128 {
        (ordinal(self.end) - ordinal(self.start)).saturating_add(1)
    }

    /// Lazily enumerate the range in ascending order
    pub fn iter(&self) -> AddressIter {
        AddressIter {
            next: Some(ordinal(self.start)),
            end: ordinal(self.end),
            v4: self.start.is_ipv4(),
        }
    }

    /// Parse a `;` or `,` separated list of `a-b`, `a/nn` or single address
    /// entries. Ranges of the same family that overlap or touch are merged,
    /// the result is sorted with IPv4 ranges first.
    pub fn parse_list(text: &str) -> Result<Vec<AddressRange>, RangeError> {
        let ranges = text
            .split([';', ','])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse_one)
            .collect::<Result<Vec<_>, _>>()?;

        if ranges.is_empty() {
            return Err(RangeError::Empty);
        }
        Ok(merge(ranges))
    }

    fn parse_one(entry: &str) -> Result<AddressRange, RangeError> {
        let parse_addr = |s: &str| -> Result<IpAddr, RangeError> {
            s.trim()
                .parse::<IpAddr>()
                .map_err(|_| RangeError::InvalidAddress(entry.to_string()))
        };

        if let Some((address, prefix)) = entry.split_once('/') {
            let prefix = prefix
                .trim()
                .parse::<u8>()
                .map_err(|_| RangeError::InvalidAddress(entry.to_string()))?;
            return Self::from_prefix(parse_addr(address)?, prefix);
        }
        if let Some((start, end)) = entry.split_once('-') {
            return Self::new(parse_addr(start)?, parse_addr(end)?);
        }
        Ok(Self::single(parse_addr(entry)?))
    }

    /// Sort and merge ranges gathered from several sources
    pub fn normalize(ranges: Vec<AddressRange>) -> Vec<AddressRange> {
        merge(ranges)
    }

    pub fn format_list(ranges: &[AddressRange]) -> String {
        ranges
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Ascending iterator over the addresses of an `AddressRange`.
#[derive(Debug, Clone)]
pub struct AddressIter {
    next: Option<u128>,
    end: u128,
    v4: bool,
}

impl Iterator for AddressIter {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        let current = self.next?;
        self.next = if current < self.end { Some(current + 1) } else { None };
        Some(from_ordinal(current, self.v4))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.next {
            Some(next) => {
                let remaining = (self.end - next).saturating_add(1);
                let lower = usize::try_from(remaining).unwrap_or(usize::MAX);
                (lower, usize::try_from(remaining).ok())
            }
            None => (0, Some(0)),
        }
    }
}

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

fn ordinal(address: IpAddr) -> u128 {
    match address {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_ordinal(value: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}

fn merge(mut ranges: Vec<AddressRange>) -> Vec<AddressRange> {
    ranges.sort_by_key(|r| (r.start.is_ipv6(), ordinal(r.start), ordinal(r.end)));

    let mut merged: Vec<AddressRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(top)
                if top.start.is_ipv4() == range.start.is_ipv4()
                    && ordinal(range.start) <= ordinal(top.end).saturating_add(1) =>
            {
                if range.end > top.end {
                    top.end = range.end;
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}
