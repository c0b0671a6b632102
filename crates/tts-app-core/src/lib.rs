// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared application plumbing for the TTS synthesis coordination engine:
//! a storage-agnostic config port and a logging bootstrap helper.

pub mod config;
pub mod logging;
