// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Small shared helpers.

pub mod debounce;
pub mod pagination;

pub use debounce::Debouncer;
pub use pagination::PageCursor;
