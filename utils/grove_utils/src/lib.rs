// Copyright 2024-2026 Grove contributors
// SPDX-License-Identifier: Apache-2.0, MIT

mod io;
mod sys;

pub use io::*;
pub use sys::*;
