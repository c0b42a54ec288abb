// SPDX-License-Identifier: MIT OR Apache-2.0

//! The concrete chain elements. The mechanism-reset
//! stage has no module of its own: it's mechanism-agnostic, so it's
//! just [`crate::chain::composite::ResetMechanism`] wired directly into the
//! chain wherever a mechanism-demuxed subtree needs it.

pub mod kernel_injection;
pub mod resource;
pub mod token;
pub mod vfio;
