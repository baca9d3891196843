// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod conversation;
pub mod fault_detector;
pub mod group_registry;
pub mod handler;
pub mod history;
pub mod http;
pub mod metrics;
pub mod offline_queue;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session_registry;
