// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resource-management plane for an SR-IOV cross-connect forwarder.
//!
//! This crate does not negotiate connections, transport requests, or talk to
//! a device-plugin or registry; those are the embedding process's
//! responsibility. What it provides is everything needed to turn a
//! connection request into a working device lease and to undo that lease
//! cleanly on failure or teardown:
//!
//! - [`pci`] — a read-only(+bind) view over the host's SR-IOV PFs/VFs.
//! - [`token`] — the four-state token pool and its cross-name closure rules.
//! - [`vfpool`] — maps token IDs to concrete VFs under IOMMU-group
//!   exclusivity.
//! - [`connstate`] — the per-connection VFConfig store.
//! - [`chain`] — the request-chain core ([`chain::ChainElement`],
//!   [`chain::compose`]) and its composite patterns ([`chain::composite`]).
//! - [`stages`] — the concrete chain elements built over that core: token
//!   assignment, VF/driver selection, kernel-namespace injection, and VFIO
//!   device exposure.
//! - [`cgroup`] — the cgroups-v1 devices-controller broker.
//!
//! A process embedding this crate constructs [`pci::PciModel`],
//! [`token::TokenPool`], and [`vfpool::VfResourcePool`] once at startup from
//! a parsed [`config::Config`], shares them behind `Arc`, and wires the
//! stages from [`stages`] into a [`chain::Chain`] with [`chain::compose`].

pub mod cgroup;
pub mod chain;
pub mod config;
pub mod connstate;
pub mod error;
pub mod mechanism;
pub mod netctl;
pub mod pci;
pub mod stages;
pub mod token;
pub mod vfpool;

/* ---------------------------------------------------------------------------------------------- */
