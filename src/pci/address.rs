// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/* ---------------------------------------------------------------------------------------------- */

/// A PCI address (BDF triplet, optionally domain-qualified).
///
/// Accepts and normalises both the canonical `DDDD:BB:DD.F` form and the
/// short `BB:DD.F` form (domain defaults to `0000`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (domain_part, rest) = match s.matches(':').count() {
            2 => {
                let (domain, rest) = s.split_once(':').unwrap();
                (Some(domain), rest)
            }
            1 => (None, s),
            _ => {
                return Err(Error::configuration(format!(
                    "invalid PCI address '{s}': expected DDDD:BB:DD.F or BB:DD.F"
                )))
            }
        };

        let (bus, rest) = rest.split_once(':').ok_or_else(|| {
            Error::configuration(format!("invalid PCI address '{s}': missing bus separator"))
        })?;

        let (device, function) = rest.split_once('.').ok_or_else(|| {
            Error::configuration(format!(
                "invalid PCI address '{s}': missing device.function separator"
            ))
        })?;

        let domain = match domain_part {
            Some(d) => u16::from_str_radix(d, 16)
                .map_err(|_| Error::configuration(format!("invalid PCI domain '{d}' in '{s}'")))?,
            None => 0,
        };
        let bus = u8::from_str_radix(bus, 16)
            .map_err(|_| Error::configuration(format!("invalid PCI bus '{bus}' in '{s}'")))?;
        let device = u8::from_str_radix(device, 16)
            .map_err(|_| Error::configuration(format!("invalid PCI device '{device}' in '{s}'")))?;
        let function = u8::from_str_radix(function, 16).map_err(|_| {
            Error::configuration(format!("invalid PCI function '{function}' in '{s}'"))
        })?;

        Ok(PciAddress {
            domain,
            bus,
            device,
            function,
        })
    }
}

/* ---------------------------------------------------------------------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_form() {
        let addr: PciAddress = "0000:01:00.1".parse().unwrap();
        assert_eq!(addr.domain, 0);
        assert_eq!(addr.bus, 1);
        assert_eq!(addr.device, 0);
        assert_eq!(addr.function, 1);
    }

    #[test]
    fn parses_and_normalises_short_form() {
        let addr: PciAddress = "01:00.1".parse().unwrap();
        assert_eq!(addr.domain, 0);
        assert_eq!(addr.to_string(), "0000:01:00.1");
    }

    #[test]
    fn rejects_garbage() {
        assert!("not-an-address".parse::<PciAddress>().is_err());
    }

    #[test]
    fn display_roundtrips_through_parse() {
        let addr: PciAddress = "0000:01:00.2".parse().unwrap();
        let again: PciAddress = addr.to_string().parse().unwrap();
        assert_eq!(addr, again);
    }
}

/* ---------------------------------------------------------------------------------------------- */
