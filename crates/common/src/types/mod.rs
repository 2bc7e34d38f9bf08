// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
// SPDX-License-Identifier: AGPL-3.0

//! Data model shared by the replay engine and its callers

mod call;
mod overrides;
mod replay;
mod snapshot;

pub use call::*;
pub use overrides::*;
pub use replay::*;
pub use snapshot::*;
