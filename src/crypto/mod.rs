// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod token;

pub use token::{TokenCodec, TokenError};
