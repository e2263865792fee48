// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable storage for records and pending writes.
//!
//! - [`traits::BlobStore`]: raw blob persistence (ciphertext only)
//! - [`memory::InMemoryBlobStore`]: volatile backend
//! - [`sqlite::SqliteBlobStore`]: on-disk backend
//! - [`encrypted::EncryptedStore`]: owner scoping and sealing on top of either

pub mod encrypted;
pub mod memory;
pub mod sqlite;
pub mod traits;
