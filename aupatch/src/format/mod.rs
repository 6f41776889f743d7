// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod extent;
pub mod extent_writer;
pub mod payload;
