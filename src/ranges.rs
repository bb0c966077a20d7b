use crate::catalog::{AccessCode, SetpointSpec};

/// The largest number of registers a single modbus read request may ask for.
pub const MAX_READ_COUNT: u16 = 125;

/// A contiguous span of registers read with one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterRange {
    start: u16,
    stop: u16,
    access: AccessCode,
    /// Setpoint names in ascending address order, one per register in `start..=stop`.
    names: Vec<String>,
}

impl RegisterRange {
    fn open(address: u16, access: AccessCode, name: &str) -> Self {
        Self { start: address, stop: address, access, names: vec![name.to_string()] }
    }

    /// Extend the range by exactly one register, if `address` immediately follows it.
    fn extend(&mut self, address: u16, access: AccessCode, name: &str) -> bool {
        if access != self.access || self.count() >= MAX_READ_COUNT {
            return false;
        }
        if self.stop.checked_add(1) != Some(address) {
            return false;
        }
        self.stop = address;
        self.names.push(name.to_string());
        true
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn stop(&self) -> u16 {
        self.stop
    }

    pub fn access(&self) -> AccessCode {
        self.access
    }

    pub fn count(&self) -> u16 {
        self.stop - self.start + 1
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl std::fmt::Display for RegisterRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}/{}", self.start, self.stop, self.access)
    }
}

/// Groups setpoints into the fewest contiguous read spans.
///
/// The order of `entries` does not matter: they are sorted by `(address, access)` first, so the
/// output is fully determined by the set of entries. Every entry ends up in exactly one range.
pub fn coalesce<'a>(
    entries: impl IntoIterator<Item = (&'a str, &'a SetpointSpec)>,
) -> Vec<RegisterRange> {
    let mut sorted = entries.into_iter().collect::<Vec<_>>();
    sorted.sort_by_key(|&(name, spec)| (spec.address, spec.access, name));
    let mut ranges = Vec::new();
    let mut current: Option<RegisterRange> = None;
    for (name, spec) in sorted {
        if let Some(range) = &mut current {
            if range.extend(spec.address, spec.access, name) {
                continue;
            }
        }
        if let Some(done) = current.replace(RegisterRange::open(spec.address, spec.access, name)) {
            ranges.push(done);
        }
    }
    ranges.extend(current);
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, Kind};

    fn spec(address: u16, access: AccessCode) -> SetpointSpec {
        SetpointSpec::new(address, access, Kind::int())
    }

    fn spans(ranges: &[RegisterRange]) -> Vec<(u16, u16, AccessCode, Vec<&str>)> {
        ranges
            .iter()
            .map(|r| {
                let names = r.names().iter().map(String::as_str).collect();
                (r.start(), r.stop(), r.access(), names)
            })
            .collect()
    }

    #[test]
    fn single_entry_is_unit_range() {
        let s = spec(7, AccessCode::Holding);
        let ranges = coalesce([("X", &s)]);
        assert_eq!(spans(&ranges), vec![(7, 7, AccessCode::Holding, vec!["X"])]);
        assert_eq!(ranges[0].count(), 1);
    }

    #[test]
    fn empty_catalog_has_no_ranges() {
        assert!(coalesce(std::iter::empty()).is_empty());
    }

    #[test]
    fn merges_consecutive_same_code_only() {
        let a = spec(3, AccessCode::Holding);
        let b = spec(4, AccessCode::Holding);
        let c = spec(6, AccessCode::Holding); // gap of one
        let d = spec(6, AccessCode::Input); // same address, other code
        let e = spec(7, AccessCode::Input);
        let f = spec(40, AccessCode::Input); // large gap
        let ranges = coalesce([("E", &e), ("C", &c), ("F", &f), ("A", &a), ("D", &d), ("B", &b)]);
        assert_eq!(
            spans(&ranges),
            vec![
                (3, 4, AccessCode::Holding, vec!["A", "B"]),
                (6, 6, AccessCode::Holding, vec!["C"]),
                (6, 7, AccessCode::Input, vec!["D", "E"]),
                (40, 40, AccessCode::Input, vec!["F"]),
            ]
        );
    }

    #[test]
    fn consecutive_addresses_with_different_codes_do_not_merge() {
        let a = spec(10, AccessCode::Holding);
        let b = spec(11, AccessCode::Input);
        let ranges = coalesce([("A", &a), ("B", &b)]);
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn order_of_entries_does_not_matter() {
        let specs = (0..20u16)
            .filter(|a| a % 7 != 3)
            .map(|a| (format!("S{a:02}"), spec(a, AccessCode::Holding)))
            .collect::<Vec<_>>();
        let forward = coalesce(specs.iter().map(|(n, s)| (n.as_str(), s)));
        let backward = coalesce(specs.iter().rev().map(|(n, s)| (n.as_str(), s)));
        assert_eq!(forward, backward);
    }

    #[test]
    fn ranges_partition_the_hpw300_catalog() {
        let profile = crate::profile::Profile::hpw300().unwrap();
        let catalog: &Catalog = &profile.catalog;
        let ranges = coalesce(catalog.iter());
        let mut seen = ranges.iter().flat_map(|r| r.names().iter().cloned()).collect::<Vec<_>>();
        assert_eq!(seen.len(), catalog.len());
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), catalog.len());
        for range in &ranges {
            assert_eq!(usize::from(range.count()), range.names().len());
            for (name, address) in range.names().iter().zip(range.start()..=range.stop()) {
                let spec = catalog.get(name).unwrap();
                assert_eq!(spec.address, address);
                assert_eq!(spec.access, range.access());
            }
        }
        // Adjacent ranges could not have been merged.
        for pair in ranges.windows(2) {
            let mergeable = pair[0].access() == pair[1].access()
                && pair[0].stop() + 1 == pair[1].start()
                && pair[0].count() < MAX_READ_COUNT;
            assert!(!mergeable, "{} and {} should have been merged", pair[0], pair[1]);
        }
    }

    #[test]
    fn splits_at_protocol_limit() {
        let specs = (0..200u16)
            .map(|a| (format!("R{a:03}"), spec(a, AccessCode::Input)))
            .collect::<Vec<_>>();
        let ranges = coalesce(specs.iter().map(|(n, s)| (n.as_str(), s)));
        assert_eq!(ranges.len(), 2);
        assert_eq!((ranges[0].start(), ranges[0].stop()), (0, 124));
        assert_eq!((ranges[1].start(), ranges[1].stop()), (125, 199));
    }

    #[test]
    fn last_address_does_not_overflow() {
        let a = spec(u16::MAX - 1, AccessCode::Holding);
        let b = spec(u16::MAX, AccessCode::Holding);
        let ranges = coalesce([("B", &b), ("A", &a)]);
        assert_eq!(spans(&ranges), vec![(u16::MAX - 1, u16::MAX, AccessCode::Holding, vec![
            "A", "B"
        ])]);
    }
}
