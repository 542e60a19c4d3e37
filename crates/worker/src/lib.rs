// SPDX-License-Identifier: BUSL-1.1
// Copyright 2025 Alfred Jean LLC

//! Chat Worker + Presence/Read-Receipt Engine process: the durable
//! side of the messaging fabric.

pub mod cache;
pub mod chat_worker;
pub mod config;
pub mod receipts;
pub mod run;
pub mod store;

pub use run::run;
