/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/migration/mod.rs
*
* The encrypt-and-swap migration: the step record, its persistence, the
* per-volume sequence and the owner-group runner.
*
* SPDX-License-Identifier: Apache-2.0
*/

pub mod machine;
pub mod retry;
pub mod runner;
pub mod state;
pub mod store;
