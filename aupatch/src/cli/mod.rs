// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod apply;
pub mod args;
pub mod generate;
pub mod info;
pub mod key;
pub mod state;
