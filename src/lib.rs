/*
 * This file is part of MetalGuard.
 *
 * Copyright (C) 2025 MetalGuard contributors
 *
 * MetalGuard is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * MetalGuard is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with MetalGuard. If not, see <https://www.gnu.org/licenses/>.
 */

//! MetalGuard - hardware supervision for single-board security appliances
//!
//! Facade over the workspace crates: the core subsystems from `mg-core` and
//! the shared error type from `mg-error`. The daemon lives in `mg-daemon`.

pub use mg_core::*;
pub use mg_error::{MetalGuardError, Result};
