// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed mirror of the YAML configuration schema. Reading the
//! file from disk, watching it, and wiring it into a process are left to the
//! binary that embeds this crate; this module only parses and validates.

/* ---------------------------------------------------------------------------------------------- */

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};

/* ---------------------------------------------------------------------------------------------- */

fn default_false() -> bool {
    false
}

/// A pre-discovered VF entry, so configuration can short-circuit sysfs
/// enumeration for VFs the operator already knows about.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualFunctionConfig {
    pub address: String,
    pub iommu_group: u32,
}

/// Configuration for a single physical function.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalFunctionConfig {
    pub pf_kernel_driver: String,
    pub vf_kernel_driver: String,
    pub capabilities: Vec<String>,
    pub service_domains: Vec<String>,
    #[serde(default)]
    pub virtual_functions: Option<Vec<VirtualFunctionConfig>>,
    /// Booleanish string in the YAML ("true"/"false"/"1"/"0"); normalised to
    /// `bool` here. Disables the `netif`-name post-bind check, and only
    /// that check — nothing broader (see `DESIGN.md`'s Open Question
    /// decision on its scope).
    #[serde(default = "default_false", deserialize_with = "deserialize_boolish")]
    pub skip_driver_check: bool,
}

fn deserialize_boolish<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolOrString {
        Bool(bool),
        String(String),
    }

    match BoolOrString::deserialize(deserializer)? {
        BoolOrString::Bool(b) => Ok(b),
        BoolOrString::String(s) => Ok(matches!(s.as_str(), "true" | "1" | "yes")),
    }
}

/// Top-level configuration: a map of PCI address -> PF configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub physical_functions: HashMap<String, PhysicalFunctionConfig>,
}

impl Config {
    /// Parses YAML text into a `Config` and validates it.
    pub fn parse(yaml: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| Error::configuration(format!("invalid YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Enforces the non-empty-list / required-field rules.
    pub fn validate(&self) -> Result<()> {
        if self.physical_functions.is_empty() {
            return Err(Error::configuration("physicalFunctions must not be empty"));
        }

        for (addr, pf) in &self.physical_functions {
            let _: crate::pci::address::PciAddress = addr.parse().map_err(|_| {
                Error::configuration(format!("physicalFunctions key '{addr}' is not a valid PCI address"))
            })?;

            if pf.pf_kernel_driver.is_empty() {
                return Err(Error::configuration(format!("{addr}: pfKernelDriver is required")));
            }
            if pf.vf_kernel_driver.is_empty() {
                return Err(Error::configuration(format!("{addr}: vfKernelDriver is required")));
            }
            if pf.capabilities.is_empty() {
                return Err(Error::configuration(format!("{addr}: capabilities must not be empty")));
            }
            if pf.service_domains.is_empty() {
                return Err(Error::configuration(format!("{addr}: serviceDomains must not be empty")));
            }
        }

        Ok(())
    }
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
