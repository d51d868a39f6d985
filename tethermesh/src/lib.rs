// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Multi-hop tunneling mesh.
//!
//! Each node runs a [`Router`](common::router::Router) which accepts SOCKS5
//! requests and relay connections, keeps bundles of multiplexed physical
//! connections ("tethers") to its peers, and decides per request whether to
//! execute it locally or forward it across a tether to the next hop.
#![warn(unused_imports)]

pub mod common;
pub mod util;
