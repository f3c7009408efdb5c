use std::fmt;
use super::RangeError;

/// Port 0 cannot be connected to
const FIRST_PORT: u16 = 1;

/// Inclusive range of TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, RangeError> {
        if start > end {
            return Err(RangeError::Reversed(format!("{}-{}", start, end)));
        }
        Ok(Self { start, end })
    }

    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    /// Ports in ascending order
    pub fn iter(&self) -> impl Iterator<Item = u16> + Clone + Send + 'static {
        self.start..=self.end
    }

    /// Parse a `;` or `,` separated list of `n`, `n-m` or `*` entries. A `*`
    /// bound means the lowest or highest usable port. Overlapping and
    /// adjacent ranges are merged, the result is sorted.
    pub fn parse_list(text: &str) -> Result<Vec<PortRange>, RangeError> {
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

    fn parse_one(entry: &str) -> Result<PortRange, RangeError> {
        let parse_bound = |s: &str, wildcard: u16| -> Result<u16, RangeError> {
            let s = s.trim();
            if s == "*" {
                return Ok(wildcard);
            }
            s.parse::<u16>()
                .map_err(|_| RangeError::InvalidPort(entry.to_string()))
        };

        let mut parts = entry.split('-');
        let low = parts.next().unwrap_or_default();
        let high = parts.next();
        if parts.next().is_some() {
            return Err(RangeError::InvalidPort(entry.to_string()));
        }

        let start = parse_bound(low, FIRST_PORT)?;
        let end = match high {
            Some(high) => parse_bound(high, u16::MAX)?,
            None if low.trim() == "*" => u16::MAX,
            None => start,
        };
        PortRange::new(start, end)
    }

    /// Ports commonly used by OPC UA servers in the field
    pub fn well_known() -> Vec<PortRange> {
        vec![
            PortRange { start: 4840, end: 4841 },
            PortRange { start: 48000, end: 48100 },
            PortRange::single(49320),
            PortRange::single(50000),
            PortRange { start: 51200, end: 51300 },
            PortRange::single(62222),
        ]
    }

    /// Every connectable port
    pub fn all() -> Vec<PortRange> {
        vec![PortRange { start: FIRST_PORT, end: u16::MAX }]
    }

    /// Format a list back into the text form accepted by `parse_list`
    pub fn format_list(ranges: &[PortRange]) -> String {
        ranges
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

fn merge(mut ranges: Vec<PortRange>) -> Vec<PortRange> {
    ranges.sort_by_key(|r| (r.start, r.end));

    let mut merged: Vec<PortRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(top) if range.start as u32 <= top.end as u32 + 1 => {
                top.end = top.end.max(range.end);
            }
            _ => merged.push(range),
        }
    }
    merged
}
