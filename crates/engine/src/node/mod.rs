// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
// SPDX-License-Identifier: AGPL-3.0

//! Node access: JSON-RPC client and its transports

mod client;
mod transport;

pub use client::*;
pub use transport::*;
